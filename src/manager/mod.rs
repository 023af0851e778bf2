//! Connection manager
//!
//! Keeps exactly one transport connected. A single task owns every piece
//! of manager state and reacts to messages on one queue:
//!
//! ```text
//! Init -> ServiceInit -> ServiceStart -> Test -> Up
//!                 \            \           \      \
//!                  +-> NotConfigured / Failed / WrongProtocol / TestFailed -> Ended
//! ```
//!
//! Starting processes and probing the network happen in helper tasks that
//! report events back through the queue. After `Ended` the next enabled
//! connection is tried once the reconnect delay has passed, forever.
//! The `Up` connection is re-tested periodically.

mod probe;
mod rotation;
mod state;

pub use probe::{ConnectivityProbe, HttpProbe, DEFAULT_PROBE_URL};
pub use rotation::Rotation;
pub use state::{ConnectionEvent, ConnectionHistory, ConnectionState};

use crate::connection::{Connection, Transport};
use crate::service::{ServiceOptions, ServiceRegistry};
use crate::transport::TransportService;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

/// Timeout of clients returned by [`ConnectionManager::new_transport_http_client`]
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime settings of the manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconnect_delay: Duration,
    pub reverify_interval: Duration,
    pub history_limit: usize,
    /// Requested listen address of transports
    pub proxy_bind_addr: String,
    /// Protocol a transport must expose to be usable
    pub expected_protocol: String,
    /// Ask transports for verbose logging
    pub verbose: bool,
    /// Launch options for transport processes
    pub service: ServiceOptions,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        ManagerSettings {
            reconnect_delay: Duration::from_secs(4),
            reverify_interval: Duration::from_secs(10),
            history_limit: 20,
            proxy_bind_addr: "127.0.0.1:0".to_string(),
            expected_protocol: "socks5".to_string(),
            verbose: false,
            service: ServiceOptions::default(),
        }
    }
}

enum Message {
    Event(ConnectionEvent),
    AddListener(mpsc::UnboundedSender<ConnectionHistory>),
    UpdateConnections(Vec<Connection>),
    UpdateTransports(HashMap<String, Transport>),
    VerifyDone,
    Stop(oneshot::Sender<()>),
}

/// State read outside the event loop
#[derive(Default)]
struct Shared {
    active: Mutex<Option<TransportService>>,
    transport_ok: AtomicBool,
}

/// Handle to a running connection manager
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Spawn the event loop. The first enabled connection is tried right
    /// away.
    pub fn start(
        settings: ManagerSettings,
        registry: ServiceRegistry,
        probe: Arc<dyn ConnectivityProbe>,
        transports: HashMap<String, Transport>,
        connections: Vec<Connection>,
    ) -> ConnectionManager {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let start = Instant::now() + settings.reverify_interval;
        let mut reverify = interval_at(start, settings.reverify_interval);
        reverify.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let event_loop = EventLoop {
            rotation: Rotation::new(&connections),
            settings,
            registry,
            probe,
            transports,
            histories: HashMap::new(),
            currents: HashMap::new(),
            current_id: None,
            listeners: Vec::new(),
            reconnect_timer: None,
            reverify,
            verify_running: false,
            first_up_no_problems: true,
            shared: Arc::clone(&shared),
            tx: tx.clone(),
            rx,
        };
        tokio::spawn(event_loop.run());

        ConnectionManager { tx, shared }
    }

    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("connection manager is not running");
        }
    }

    /// Receive a snapshot of a connection's history after every event.
    pub fn add_listener(&self, listener: mpsc::UnboundedSender<ConnectionHistory>) {
        self.send(Message::AddListener(listener));
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionHistory> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_listener(tx);
        rx
    }

    pub fn update_connections(&self, connections: Vec<Connection>) {
        self.send(Message::UpdateConnections(connections));
    }

    pub fn update_transports(&self, transports: HashMap<String, Transport>) {
        self.send(Message::UpdateTransports(transports));
    }

    /// The transport currently routing traffic, if any
    pub fn active_transport(&self) -> Option<TransportService> {
        self.shared.active.lock().clone()
    }

    /// HTTP client routed through the active transport
    pub fn new_transport_http_client(&self) -> Result<reqwest::Client> {
        match self.shared.active.lock().as_ref() {
            Some(transport) => transport.http_client(HTTP_CLIENT_TIMEOUT),
            None => Err(Error::connection("transport not connected")),
        }
    }

    /// Whether the last probe of the active transport succeeded
    pub fn transport_ok(&self) -> bool {
        self.shared.transport_ok.load(Ordering::SeqCst)
    }

    pub fn current_bind_addr(&self) -> Option<String> {
        self.shared
            .active
            .lock()
            .as_ref()
            .and_then(|t| t.bind_addr())
    }

    /// Stop the event loop and wait until it has exited.
    pub async fn stop(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Stop(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

/// What woke the event loop
enum Wake {
    Message(Message),
    Closed,
    Reconnect,
    Reverify,
}

struct EventLoop {
    settings: ManagerSettings,
    registry: ServiceRegistry,
    probe: Arc<dyn ConnectivityProbe>,
    transports: HashMap<String, Transport>,
    rotation: Rotation,
    /// connection id -> recent events, oldest first
    histories: HashMap<String, VecDeque<ConnectionEvent>>,
    /// connection id -> latest event of attempts that have not ended
    currents: HashMap<String, ConnectionEvent>,
    current_id: Option<String>,
    listeners: Vec<mpsc::UnboundedSender<ConnectionHistory>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    reverify: tokio::time::Interval,
    verify_running: bool,
    first_up_no_problems: bool,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl EventLoop {
    async fn run(mut self) {
        info!("connection manager started");
        match self.rotation.current().cloned() {
            Some(connection) => self.connect(connection),
            None => {
                warn!("No connections enabled");
                self.schedule_reconnect();
            }
        }

        loop {
            let wake = tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => Wake::Message(message),
                    None => Wake::Closed,
                },
                _ = reconnect_due(&mut self.reconnect_timer) => Wake::Reconnect,
                _ = self.reverify.tick() => Wake::Reverify,
            };

            match wake {
                Wake::Message(Message::Stop(done)) => {
                    info!("connection manager shut down");
                    let _ = done.send(());
                    break;
                }
                Wake::Message(message) => self.handle_message(message),
                Wake::Closed => break,
                Wake::Reconnect => {
                    self.reconnect_timer = None;
                    self.reconnect();
                }
                Wake::Reverify => self.reverify(),
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Event(event) => self.handle_event(event),
            Message::AddListener(listener) => self.listeners.push(listener),
            Message::UpdateConnections(connections) => {
                if self
                    .rotation
                    .update(&connections, self.current_id.as_deref())
                {
                    debug!("connection rotation reshuffled ({} enabled)", self.rotation.len());
                }
            }
            Message::UpdateTransports(transports) => {
                self.transports = transports
                    .into_iter()
                    .map(|(name, mut transport)| {
                        if transport.name.is_empty() {
                            transport.name = name.clone();
                        }
                        (name, transport)
                    })
                    .collect();
            }
            Message::VerifyDone => self.verify_running = false,
            Message::Stop(_) => {}
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        let id = event.connection.id.clone();
        let history = self.histories.entry(id.clone()).or_default();
        history.push_back(event.clone());
        while history.len() > self.settings.history_limit {
            history.pop_front();
        }
        let snapshot = ConnectionHistory {
            history: history.iter().cloned().collect(),
        };

        if event.state.is_problem() {
            warn!("event {}: {}", event.connection.display_name(), event.state);
        } else {
            info!("event {}: {}", event.connection.display_name(), event.state);
        }

        match event.state {
            ConnectionState::Up => {
                if self.first_up_no_problems {
                    self.first_up_no_problems = false;
                } else {
                    info!("transport connected");
                }
            }
            ConnectionState::Failed => {
                self.first_up_no_problems = false;
                warn!("transport error");
            }
            ConnectionState::TestFailed => {
                self.first_up_no_problems = false;
                warn!("transport test failed, retrying");
            }
            _ => {}
        }

        if event.state == ConnectionState::Ended {
            self.currents.remove(&id);
            debug!(
                "waiting {:?} before reconnecting",
                self.settings.reconnect_delay
            );
            self.schedule_reconnect();
        } else {
            self.currents.insert(id, event);
        }

        self.listeners
            .retain(|listener| listener.send(snapshot.clone()).is_ok());
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(
            self.settings.reconnect_delay,
        )));
    }

    fn reconnect(&mut self) {
        match self.rotation.advance().cloned() {
            Some(connection) => {
                debug!("reconnecting to transport {}", connection);
                self.connect(connection);
            }
            None => {
                warn!("No connections enabled");
                self.schedule_reconnect();
            }
        }
    }

    fn connect(&mut self, connection: Connection) {
        self.current_id = Some(connection.id.clone());
        let attempt = Attempt {
            transport: self.transports.get(&connection.transport).cloned(),
            connection,
            settings: self.settings.clone(),
            registry: self.registry.clone(),
            probe: Arc::clone(&self.probe),
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
        };
        tokio::spawn(attempt.run());
    }

    fn reverify(&mut self) {
        if self.verify_running {
            return;
        }
        let Some(event) = self
            .current_id
            .as_ref()
            .and_then(|id| self.currents.get(id))
            .filter(|event| event.state == ConnectionState::Up)
            .cloned()
        else {
            return;
        };

        self.verify_running = true;
        let probe = Arc::clone(&self.probe);
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let emit = |e: &ConnectionEvent| {
                let _ = tx.send(Message::Event(e.clone()));
            };
            if let Err(e) = verify(&event, probe.as_ref(), &shared, emit).await {
                warn!("re-verification of {} failed: {}", event.connection, e);
            }
            let _ = tx.send(Message::VerifyDone);
        });
    }
}

/// Test the active transport and emit the resulting events.
async fn verify<F>(
    event: &ConnectionEvent,
    probe: &dyn ConnectivityProbe,
    shared: &Shared,
    emit: F,
) -> Result<()>
where
    F: Fn(&ConnectionEvent),
{
    let chain = |states: &[ConnectionState]| {
        let mut last = event.clone();
        for state in states {
            last = last.next(*state);
            emit(&last);
        }
    };

    let bind_addr = {
        let active = shared.active.lock();
        match active.as_ref() {
            Some(transport) if transport.connection().id == event.connection.id => {
                transport.bind_addr()
            }
            Some(_) => {
                debug!("{} is no longer the active transport", event.connection);
                return Ok(());
            }
            None => None,
        }
    };

    let Some(bind_addr) = bind_addr else {
        shared.transport_ok.store(false, Ordering::SeqCst);
        chain(&[
            ConnectionState::TestFailed,
            ConnectionState::NotConfigured,
            ConnectionState::Ended,
        ]);
        return Err(Error::connection("No active transport"));
    };

    match probe.probe(&bind_addr).await {
        Ok(()) => {
            shared.transport_ok.store(true, Ordering::SeqCst);
            if event.state != ConnectionState::Up {
                chain(&[ConnectionState::Up]);
            }
            Ok(())
        }
        Err(e) => {
            shared.transport_ok.store(false, Ordering::SeqCst);
            chain(&[
                ConnectionState::TestFailed,
                ConnectionState::Failed,
                ConnectionState::Ended,
            ]);
            Err(e)
        }
    }
}

/// One attempt to bring a connection up, run in its own task
struct Attempt {
    connection: Connection,
    transport: Option<Transport>,
    settings: ManagerSettings,
    registry: ServiceRegistry,
    probe: Arc<dyn ConnectivityProbe>,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Attempt {
    fn emit(&self, event: &ConnectionEvent) {
        let _ = self.tx.send(Message::Event(event.clone()));
    }

    /// Emit each state in order, starting from `event`.
    fn advance(&self, event: &mut ConnectionEvent, states: &[ConnectionState]) {
        for state in states {
            *event = event.next(*state);
            self.emit(event);
        }
    }

    async fn detach_previous(&self) {
        let previous = self.shared.active.lock().take();
        self.shared.transport_ok.store(false, Ordering::SeqCst);
        if let Some(previous) = previous {
            debug!("detaching transport {}", previous.connection());
            if let Err(e) = previous.service().remove() {
                warn!("{}", e);
            }
            previous.wait().await;
        }
    }

    fn discard(transport: &TransportService) {
        if let Err(e) = transport.service().remove() {
            debug!("{}", e);
        }
    }

    async fn run(self) {
        self.detach_previous().await;

        let mut event = ConnectionEvent::init(self.connection.clone());
        self.emit(&event);
        self.advance(&mut event, &[ConnectionState::ServiceInit]);

        let Some(transport) = self.transport.as_ref() else {
            warn!("no transport registered as {}", self.connection.transport);
            self.advance(
                &mut event,
                &[ConnectionState::NotConfigured, ConnectionState::Ended],
            );
            return;
        };

        let service = match self.build(transport) {
            Ok(service) => service,
            Err(e) => {
                warn!("cannot set up {}: {}", self.connection, e);
                self.advance(&mut event, &[ConnectionState::Failed, ConnectionState::Ended]);
                return;
            }
        };

        event.service_id = Some(service.service().id().clone());
        self.advance(&mut event, &[ConnectionState::ServiceStart]);

        if let Err(e) = service.start().await {
            if e.is_recoverable() {
                warn!("transport {} failed to start: {}", self.connection, e);
            } else {
                error!("transport {} failed to start: {}", self.connection, e);
            }
            Self::discard(&service);
            self.advance(&mut event, &[ConnectionState::Failed, ConnectionState::Ended]);
            return;
        }

        let protocol = service.protocol().unwrap_or_default();
        if protocol != self.settings.expected_protocol {
            warn!(
                "transport {} exposes {:?}, expected {}",
                self.connection, protocol, self.settings.expected_protocol
            );
            Self::discard(&service);
            self.advance(
                &mut event,
                &[
                    ConnectionState::WrongProtocol,
                    ConnectionState::Failed,
                    ConnectionState::Ended,
                ],
            );
            return;
        }

        {
            let mut active = self.shared.active.lock();
            if let Some(stale) = active.replace(service) {
                Self::discard(&stale);
            }
        }

        self.advance(&mut event, &[ConnectionState::Test]);
        let tx = self.tx.clone();
        let emit = move |e: &ConnectionEvent| {
            let _ = tx.send(Message::Event(e.clone()));
        };
        if let Err(e) = verify(&event, self.probe.as_ref(), &self.shared, emit).await {
            warn!("connection test of {} failed: {}", self.connection, e);
        }
    }

    fn build(&self, transport: &Transport) -> Result<TransportService> {
        let service = TransportService::new(
            self.connection.clone(),
            transport,
            &self.registry,
            self.settings.service.clone(),
        )?;
        service.set_bind_addr(&self.settings.proxy_bind_addr)?;
        if self.settings.verbose {
            service.set_verbose()?;
        }
        Ok(service)
    }
}
