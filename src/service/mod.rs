//! Transport process supervisor
//!
//! A [`Service`] is one launched transport process. Starting it spawns the
//! program with the request map exported as environment variables, then
//! reads handshake lines from its stdout until `DONE` or `ERROR`. After a
//! successful start, stdout and stderr are only logged and the service
//! waits for a stop request or for the process to exit on its own.
//!
//! Services are owned by a [`ServiceRegistry`]; everything handed out to
//! callers ([`ServiceInfo`], [`Method`]) is a snapshot.

mod env;
mod process;
mod registry;

pub use env::{
    build_environment, env_name, key_is_valid, AUTH_SECRET_KEY, CALLBACK_URL_KEY,
    DEFAULT_NAMESPACE,
};
pub use registry::ServiceRegistry;

use crate::protocol::{line_reader, negotiate, ExposedMethod};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use process::{build_command, shutdown_child, spawn_drain, spawn_stderr_drain};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long the log drains may take to flush after the process is gone
const DRAIN_GRACE: Duration = Duration::from_millis(200);

pub(crate) type ServiceMap = RwLock<HashMap<ServiceId, Service>>;

/// Generated runtime identifier of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceId(String);

impl ServiceId {
    fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        ServiceId(format!("svc-{}", &uuid[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        ServiceId(s.to_string())
    }
}

/// One endpoint a service exposed during its handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Method {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub bind_addr: String,
    /// Owning service, resolved through the registry
    pub service_id: ServiceId,
}

impl Method {
    fn from_exposed(service_id: &ServiceId, exposed: ExposedMethod) -> Self {
        Method {
            id: format!("{}/{}", service_id, exposed.name),
            name: exposed.name,
            protocol: exposed.protocol,
            bind_addr: exposed.bind_addr,
            service_id: service_id.clone(),
        }
    }
}

/// Process lifecycle as observed by [`Service::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Starting,
    Running,
    Exited,
}

/// Launch settings shared by every service of an installation
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Private environment prefix
    pub namespace: String,
    /// Bearer secret the transport uses for telemetry callbacks
    pub auth_secret: String,
    /// Where the transport posts traffic telemetry
    pub callback_url: String,
    /// How long to wait for a voluntary exit after the pipes are closed
    pub stop_grace: Duration,
    /// Extra command line arguments
    pub args: Vec<String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            namespace: DEFAULT_NAMESPACE.to_string(),
            auth_secret: String::new(),
            callback_url: "http://127.0.0.1:8899/api/transports/traffic/".to_string(),
            stop_grace: Duration::from_secs(5),
            args: Vec::new(),
        }
    }
}

/// Point-in-time copy of a service's state
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub name: String,
    pub command: PathBuf,
    pub running: bool,
    pub request: BTreeMap<String, String>,
    pub response: HashMap<String, String>,
    pub methods: Vec<Method>,
}

#[derive(Default)]
struct ServiceState {
    request: BTreeMap<String, String>,
    response: HashMap<String, String>,
    methods: Vec<Method>,
}

struct ServiceInner {
    id: ServiceId,
    name: String,
    command: PathBuf,
    options: ServiceOptions,
    state: Mutex<ServiceState>,
    lifecycle: watch::Sender<Lifecycle>,
    stop_tx: watch::Sender<bool>,
    remove_on_stop: AtomicBool,
    registry: Weak<ServiceMap>,
}

/// Handle to a supervised transport process
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Service {
    /// Create a service and add it to `registry`.
    pub fn new(
        name: impl Into<String>,
        command: impl Into<PathBuf>,
        options: ServiceOptions,
        registry: &ServiceRegistry,
    ) -> Service {
        let (lifecycle, _) = watch::channel(Lifecycle::Idle);
        let (stop_tx, _) = watch::channel(false);
        let service = Service {
            inner: Arc::new(ServiceInner {
                id: ServiceId::generate(),
                name: name.into(),
                command: command.into(),
                options,
                state: Mutex::new(ServiceState::default()),
                lifecycle,
                stop_tx,
                remove_on_stop: AtomicBool::new(false),
                registry: registry.downgrade(),
            }),
        };
        registry.register(&service);
        service
    }

    pub fn id(&self) -> &ServiceId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.borrow()
    }

    /// True between a successful handshake and process exit
    pub fn running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    fn is_active(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Starting | Lifecycle::Running)
    }

    /// Set a request variable. Only allowed before [`Service::start`].
    pub fn set_var(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if self.lifecycle() != Lifecycle::Idle {
            return Err(Error::already_running("set configuration variable"));
        }
        if !key_is_valid(key) {
            return Err(Error::config(format!("invalid variable name: {:?}", key)));
        }
        state.request.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn var(&self, key: &str) -> Option<String> {
        self.inner.state.lock().request.get(key).cloned()
    }

    pub fn response(&self) -> HashMap<String, String> {
        self.inner.state.lock().response.clone()
    }

    pub fn response_value(&self, key: &str) -> Option<String> {
        self.inner.state.lock().response.get(key).cloned()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.inner.state.lock().methods.clone()
    }

    pub fn info(&self) -> ServiceInfo {
        let state = self.inner.state.lock();
        ServiceInfo {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            command: self.inner.command.clone(),
            running: self.running(),
            request: state.request.clone(),
            response: state.response.clone(),
            methods: state.methods.clone(),
        }
    }

    /// Launch the process and run the handshake to completion.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let id = inner.id.clone();

        let request = {
            let state = inner.state.lock();
            match self.lifecycle() {
                Lifecycle::Idle => {}
                Lifecycle::Exited => {
                    return Err(Error::process(format!("service {} has already exited", id)))
                }
                _ => return Err(Error::already_running("start")),
            }
            inner.lifecycle.send_replace(Lifecycle::Starting);
            state.request.clone()
        };

        let env = build_environment(
            std::env::vars(),
            &inner.options.namespace,
            &request,
            &inner.options.auth_secret,
            &inner.options.callback_url,
        );
        debug!(
            "Starting service {}: {} (vars: {})",
            id,
            inner.command.display(),
            request.keys().cloned().collect::<Vec<_>>().join(",")
        );

        let mut child = match build_command(&inner.command, &inner.options.args, env).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.finish();
                return Err(Error::process(format!(
                    "failed to start {}: {}",
                    inner.command.display(),
                    e
                )));
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            if let Err(e) = child.kill().await {
                warn!("could not kill service {}: {}", id, e);
            }
            self.finish();
            return Err(Error::process("child pipes unavailable"));
        };

        let mut stderr_task = spawn_stderr_drain(id.clone(), stderr);
        let mut lines = line_reader(stdout);
        let mut stop_rx = inner.stop_tx.subscribe();

        let outcome = tokio::select! {
            result = negotiate(&mut lines) => result,
            _ = stop_rx.wait_for(|stop| *stop) => Err(Error::Stopped(id.to_string())),
        };

        let negotiation = match outcome {
            Ok(negotiation) => negotiation,
            Err(e) => {
                warn!("service {} failed to start: {}", id, e);
                drop(stdin);
                drop(lines);
                if matches!(e, Error::Negotiation(_)) {
                    shutdown_child(&id, &mut child, inner.options.stop_grace).await;
                } else if let Err(err) = child.kill().await {
                    warn!("could not kill service {}: {}", id, err);
                }
                if timeout(DRAIN_GRACE, &mut stderr_task).await.is_err() {
                    stderr_task.abort();
                }
                self.finish();
                return Err(e);
            }
        };

        let (response, exposed) = negotiation.into_parts();
        let methods: Vec<Method> = exposed
            .into_iter()
            .map(|m| Method::from_exposed(&id, m))
            .collect();
        info!(
            "service {} ({}) is up, {} method(s) exposed",
            id,
            inner.name,
            methods.len()
        );
        {
            let mut state = inner.state.lock();
            state.response = response;
            state.methods = methods;
        }
        inner.lifecycle.send_replace(Lifecycle::Running);

        let stdout_task = spawn_drain(id, "stdout", lines);
        let service = self.clone();
        tokio::spawn(async move {
            service
                .supervise(child, stdin, stdout_task, stderr_task, stop_rx)
                .await
        });
        Ok(())
    }

    async fn supervise(
        self,
        mut child: Child,
        mut stdin: ChildStdin,
        stdout_task: JoinHandle<()>,
        stderr_task: JoinHandle<()>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let id = self.inner.id.clone();
        let stop_requested = tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => true,
            status = child.wait() => {
                match status {
                    Ok(status) => info!("service {} exited: {}", id, status),
                    Err(e) => warn!("Error waiting for service {}: {}", id, e),
                }
                false
            }
        };

        if stop_requested {
            debug!("stopping service {}", id);
            if let Err(e) = stdin.shutdown().await {
                debug!("service {}: closing stdin: {}", id, e);
            }
            drop(stdin);
            stdout_task.abort();
            stderr_task.abort();
            shutdown_child(&id, &mut child, self.inner.options.stop_grace).await;
        } else {
            drop(stdin);
            for mut task in [stdout_task, stderr_task] {
                if timeout(DRAIN_GRACE, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }

        self.finish();
        debug!("service {} stopped", id);
    }

    fn finish(&self) {
        if self.inner.remove_on_stop.load(Ordering::SeqCst) {
            let _ = self.deregister();
        }
        self.inner.lifecycle.send_replace(Lifecycle::Exited);
    }

    /// Request shutdown. Safe to call any number of times.
    pub fn stop(&self) {
        if !self.is_active() {
            debug!("service {} is not running", self.inner.id);
            return;
        }
        if self.inner.stop_tx.send_replace(true) {
            debug!("service {} is already stopping", self.inner.id);
            return;
        }
        debug!("stop requested for service {}", self.inner.id);
    }

    /// Wait until the process has exited and the shutdown sequence has
    /// finished. Returns immediately for a service that never started.
    pub async fn wait(&self) {
        let mut rx = self.inner.lifecycle.subscribe();
        let _ = rx
            .wait_for(|l| matches!(l, Lifecycle::Idle | Lifecycle::Exited))
            .await;
    }

    /// Stop and wait
    pub async fn shutdown(&self) {
        self.stop();
        self.wait().await;
    }

    /// Drop the service from its registry, stopping it first if needed.
    pub fn remove(&self) -> Result<()> {
        if self.is_active() {
            self.inner.remove_on_stop.store(true, Ordering::SeqCst);
            self.stop();
            if self.is_active() {
                return Ok(());
            }
        }
        self.deregister()
    }

    fn deregister(&self) -> Result<()> {
        let Some(services) = self.inner.registry.upgrade() else {
            return Ok(());
        };
        let removed = services.write().remove(&self.inner.id);
        match removed {
            Some(_) => {
                debug!("service {} removed", self.inner.id);
                Ok(())
            }
            None => Err(Error::internal(format!(
                "service {} is not registered",
                self.inner.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_service(registry: &ServiceRegistry) -> Service {
        Service::new("test", "/nonexistent/transport", ServiceOptions::default(), registry)
    }

    #[test]
    fn test_service_id_format() {
        let id = ServiceId::generate();
        assert!(id.as_str().starts_with("svc-"));
        assert_eq!(id.as_str().len(), 16);
        assert_ne!(id, ServiceId::generate());
    }

    #[test]
    fn test_set_var_before_start() {
        let registry = ServiceRegistry::new();
        let service = idle_service(&registry);
        service.set_var("transport", "socks5").unwrap();
        service.set_var("bindaddr", "127.0.0.1:0").unwrap();
        assert_eq!(service.var("transport").as_deref(), Some("socks5"));
        assert_eq!(service.info().request.len(), 2);
        assert!(matches!(
            service.set_var("bad key", "x"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_start_missing_binary() {
        let registry = ServiceRegistry::new();
        let service = idle_service(&registry);
        let err = service.start().await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert_eq!(service.lifecycle(), Lifecycle::Exited);
        assert!(!service.running());

        // a failed instance is never restarted
        assert!(service.start().await.is_err());
        assert!(matches!(
            service.set_var("transport", "x"),
            Err(Error::AlreadyRunning(_))
        ));
        service.wait().await;
    }

    #[tokio::test]
    async fn test_stop_idle_is_noop() {
        let registry = ServiceRegistry::new();
        let service = idle_service(&registry);
        service.stop();
        service.stop();
        assert_eq!(service.lifecycle(), Lifecycle::Idle);
        service.wait().await;
    }

    #[test]
    fn test_remove_idle_deregisters() {
        let registry = ServiceRegistry::new();
        let service = idle_service(&registry);
        assert_eq!(registry.len(), 1);
        service.remove().unwrap();
        assert!(registry.is_empty());
        assert!(service.remove().is_err());
    }

    #[test]
    fn test_method_from_exposed() {
        let id = ServiceId::from("svc-1");
        let method = Method::from_exposed(
            &id,
            ExposedMethod {
                name: "socks5".to_string(),
                protocol: "socks5".to_string(),
                bind_addr: "127.0.0.1:1080".to_string(),
            },
        );
        assert_eq!(method.id, "svc-1/socks5");
        assert_eq!(method.service_id, id);
    }
}
