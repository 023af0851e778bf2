//! Transport side of the handshake
//!
//! Bundled transports run inside this same binary: the supervisor launches
//! the current executable with `<NS>_SERVICE=transport` in its environment,
//! and [`run_service`] picks the transport named by `<NS>_TRANSPORT`.
//!
//! A transport reports through a [`MethodHandler`]: `VERSION` first, then
//! `EXPOSE`/`PARENT`, then `DONE` or `ERROR`. After `DONE` the handler
//! posts traffic telemetry back to the supervisor until stdin is closed.

pub mod socks5;

pub use socks5::Socks5Transport;

use crate::protocol::{
    format_line, KEYWORD_DONE, KEYWORD_ERROR, KEYWORD_EXPOSE, KEYWORD_PARENT, KEYWORD_VERSION,
    PROTOCOL_VERSION,
};
use crate::service::{env_name, AUTH_SECRET_KEY, CALLBACK_URL_KEY};
use crate::telemetry::{ReportEndpoint, TrafficMonitor};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Address used when no `bindaddr` was requested
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:0";

/// One variable of the supervisor's request, read from the environment
#[derive(Debug, Clone)]
pub struct ServiceOption {
    namespace: String,
    name: String,
    default_value: Option<String>,
}

impl ServiceOption {
    pub fn new(namespace: &str, name: &str) -> Self {
        ServiceOption {
            namespace: namespace.to_string(),
            name: name.to_string(),
            default_value: None,
        }
    }

    /// Value used when the variable is unset or empty
    pub fn default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn env_name(&self) -> String {
        env_name(&self.namespace, &self.name)
    }

    fn raw(&self) -> Option<String> {
        std::env::var(self.env_name()).ok().filter(|v| !v.is_empty())
    }

    pub fn has(&self) -> bool {
        self.raw().is_some() || self.default_value.as_deref().is_some_and(|v| !v.is_empty())
    }

    pub fn get(&self) -> String {
        self.raw()
            .or_else(|| self.default_value.clone())
            .unwrap_or_default()
    }

    pub fn is(&self, value: &str) -> bool {
        self.has() && self.get() == value
    }

    /// Fails when the variable itself is not set; defaults do not count.
    pub fn required(&self) -> Result<String> {
        self.raw().ok_or_else(|| {
            Error::config(format!("required variable not set: {}", self.env_name()))
        })
    }

    /// Listen address, falling back to an ephemeral loopback port
    pub fn bind_addr(&self) -> String {
        if self.has() {
            self.get()
        } else {
            DEFAULT_BIND_ADDR.to_string()
        }
    }
}

/// True when this process was launched by a supervisor as a transport.
pub fn is_service_process(namespace: &str) -> bool {
    ServiceOption::new(namespace, "service").has()
}

/// Writes handshake lines for one transport method and owns its
/// traffic counters.
pub struct MethodHandler {
    method: String,
    namespace: String,
    monitor: TrafficMonitor,
    out: Mutex<Box<dyn Write + Send>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl MethodHandler {
    /// Handler printing to stdout
    pub fn new(method: &str, namespace: &str) -> Self {
        Self::with_writer(method, namespace, Box::new(std::io::stdout()))
    }

    pub fn with_writer(method: &str, namespace: &str, out: Box<dyn Write + Send>) -> Self {
        MethodHandler {
            method: method.to_string(),
            namespace: namespace.to_string(),
            monitor: TrafficMonitor::new(),
            out: Mutex::new(out),
            reporter: Mutex::new(None),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn monitor(&self) -> &TrafficMonitor {
        &self.monitor
    }

    /// Option in this handler's namespace
    pub fn option(&self, name: &str) -> ServiceOption {
        ServiceOption::new(&self.namespace, name)
    }

    /// Whether the supervisor asked for this transport
    pub fn handles(&self) -> bool {
        self.option("service").is("transport") && self.option("transport").is(&self.method)
    }

    fn line(&self, keyword: &str, args: &[&str]) -> Result<()> {
        let line = format_line(keyword, args);
        let mut out = self.out.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }

    pub fn print_version(&self) -> Result<()> {
        self.line(KEYWORD_VERSION, &[PROTOCOL_VERSION])?;
        if let Err(e) = self.option("service").required() {
            let message = match e {
                Error::Config(message) => message,
                other => other.to_string(),
            };
            return Err(self.print_error(&message));
        }
        Ok(())
    }

    pub fn print_expose(&self, protocol: &str, bind_addr: &str) -> Result<()> {
        self.line(KEYWORD_EXPOSE, &[self.method.as_str(), protocol, bind_addr])
    }

    pub fn print_parent(&self, protocol: &str, connect: &str) -> Result<()> {
        self.line(KEYWORD_PARENT, &[self.method.as_str(), protocol, connect])
    }

    /// Finish the handshake and start reporting traffic.
    pub fn print_done(&self) -> Result<()> {
        self.line(KEYWORD_DONE, &[])?;

        let auth = self.option(AUTH_SECRET_KEY);
        let addr = self.option(CALLBACK_URL_KEY);
        if !auth.has() || !addr.has() {
            info!("will not report traffic, sauth or saddr are not set");
            return Ok(());
        }
        let handle = self.monitor.spawn_reporter(ReportEndpoint {
            url: addr.get(),
            auth_secret: auth.get(),
        })?;
        if let Some(old) = self.reporter.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Report a failure to the supervisor. Returns the matching error so
    /// callers can `return Err(handler.print_error(..))`.
    pub fn print_error(&self, text: &str) -> Error {
        let text = sanitize(text);
        if let Err(e) = self.line(KEYWORD_ERROR, &[self.method.as_str(), text.as_str()]) {
            warn!("could not write ERROR line: {}", e);
        }
        Error::negotiation(text)
    }

    /// Resolves when the supervisor closes our stdin.
    pub async fn wait_for_shutdown(&self) {
        let mut stdin = tokio::io::stdin();
        let mut sink = tokio::io::sink();
        if let Err(e) = tokio::io::copy(&mut stdin, &mut sink).await {
            warn!("reading stdin: {}", e);
        }
        debug!("stdin closed");
    }
}

impl Drop for MethodHandler {
    fn drop(&mut self) {
        if let Some(handle) = self.reporter.lock().take() {
            handle.abort();
        }
    }
}

/// Replace bytes that may not appear in a handshake argument.
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() && c != '\n' && c != '\0' { c } else { '?' })
        .collect()
}

/// A transport implemented inside this binary
#[async_trait]
pub trait BundledTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Run the handshake and serve until shutdown.
    async fn run(&self, handler: MethodHandler) -> Result<()>;
}

/// Transports shipped with this binary
pub fn bundled_transports() -> Vec<Box<dyn BundledTransport>> {
    vec![Box::new(Socks5Transport)]
}

/// Entry point when running as a supervised transport process.
pub async fn run_service(namespace: &str, transports: &[Box<dyn BundledTransport>]) -> Result<()> {
    let service = ServiceOption::new(namespace, "service");
    if !service.has() {
        return Err(Error::config("no service specified"));
    }
    if !service.is("transport") {
        return Err(Error::config(format!("{} SERVICE NOT FOUND", service.get())));
    }

    let name = ServiceOption::new(namespace, "transport").get();
    let Some(transport) = transports.iter().find(|t| t.name() == name) else {
        let handler = MethodHandler::new(&name, namespace);
        return Err(handler.print_error("TRANSPORT NOT FOUND"));
    };

    info!("running bundled transport {}", name);
    transport.run(MethodHandler::new(&name, namespace)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Cloneable in-memory writer
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    #[test]
    fn test_service_option() {
        std::env::set_var("SRVTESTA_BINDADDR", "127.0.0.1:9999");
        let bind = ServiceOption::new("SRVTESTA", "bindaddr");
        assert_eq!(bind.env_name(), "SRVTESTA_BINDADDR");
        assert!(bind.has());
        assert!(bind.is("127.0.0.1:9999"));
        assert_eq!(bind.bind_addr(), "127.0.0.1:9999");
        assert_eq!(bind.required().unwrap(), "127.0.0.1:9999");

        let missing = ServiceOption::new("SRVTESTA", "missing");
        assert!(!missing.has());
        assert_eq!(missing.get(), "");
        assert_eq!(missing.bind_addr(), DEFAULT_BIND_ADDR);
        assert!(matches!(missing.required(), Err(Error::Config(_))));

        let defaulted = ServiceOption::new("SRVTESTA", "missing").default("x");
        assert!(defaulted.has());
        assert_eq!(defaulted.get(), "x");
        assert!(defaulted.required().is_err());
    }

    #[test]
    fn test_handler_lines() {
        std::env::set_var("SRVTESTB_SERVICE", "transport");
        std::env::set_var("SRVTESTB_TRANSPORT", "socks5");
        let buf = SharedBuf::default();
        let handler = MethodHandler::with_writer("socks5", "SRVTESTB", Box::new(buf.clone()));

        assert!(handler.handles());
        handler.print_version().unwrap();
        handler.print_parent("socks5", "127.0.0.1:2000").unwrap();
        handler.print_expose("socks5", "127.0.0.1:1080").unwrap();
        handler.print_done().unwrap();

        assert_eq!(
            buf.text(),
            "VERSION 1.0\nPARENT socks5 socks5 127.0.0.1:2000\nEXPOSE socks5 socks5 127.0.0.1:1080\nDONE\n"
        );
    }

    #[test]
    fn test_version_requires_service() {
        let buf = SharedBuf::default();
        let handler = MethodHandler::with_writer("socks5", "SRVTESTC", Box::new(buf.clone()));
        assert!(!handler.handles());
        let err = handler.print_version().unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
        let text = buf.text();
        assert!(text.starts_with("VERSION 1.0\nERROR socks5 required variable not set"));
        assert!(!text.contains("Configuration error"));
    }

    #[test]
    fn test_print_error_sanitizes() {
        let buf = SharedBuf::default();
        let handler = MethodHandler::with_writer("m", "SRVTESTD", Box::new(buf.clone()));
        let err = handler.print_error("bad\nthing é");
        assert_eq!(buf.text(), "ERROR m bad?thing ?\n");
        assert_eq!(err.to_string(), Error::negotiation("bad?thing ?").to_string());
    }

    #[tokio::test]
    async fn test_run_service_without_env() {
        let transports = bundled_transports();
        assert!(matches!(
            run_service("SRVTESTE", &transports).await,
            Err(Error::Config(_))
        ));
        assert!(!is_service_process("SRVTESTE"));
    }
}
