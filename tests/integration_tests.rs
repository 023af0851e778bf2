//! Integration tests driving real transport processes
//!
//! Transports are small `/bin/sh` scripts speaking the handshake on
//! stdout and waiting for stdin to close.

#![cfg(unix)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use transport_supervisor::connection::{Connection, Transport};
use transport_supervisor::manager::{
    ConnectionHistory, ConnectionManager, ConnectionState, ConnectivityProbe, ManagerSettings,
};
use transport_supervisor::service::{Lifecycle, Service, ServiceOptions, ServiceRegistry};
use transport_supervisor::telemetry::{
    ReportEndpoint, TrafficMonitor, TrafficReceiver, TRAFFIC_PATH,
};
use transport_supervisor::transport::TransportService;
use transport_supervisor::{Error, Result};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn options() -> ServiceOptions {
    ServiceOptions {
        stop_grace: Duration::from_millis(500),
        auth_secret: "s3cret".to_string(),
        ..Default::default()
    }
}

/// A service running `script` with `/bin/sh -c`
fn script_service(registry: &ServiceRegistry, script: &str) -> Service {
    let mut opts = options();
    opts.args = vec!["-c".to_string(), script.to_string()];
    Service::new("transport", "/bin/sh", opts, registry)
}

fn script_transport(name: &str, script: &str) -> Transport {
    Transport::external(name, "/bin/sh", vec!["-c".to_string(), script.to_string()])
}

fn exposing(protocol: &str, bind_addr: &str) -> String {
    format!(
        "echo 'VERSION 1.0'; echo 'EXPOSE m1 {} {}'; echo DONE; cat >/dev/null",
        protocol, bind_addr
    )
}

/// Wait until `listener` reports a history that satisfies `pred`.
async fn wait_for_history<F>(
    listener: &mut mpsc::UnboundedReceiver<ConnectionHistory>,
    mut pred: F,
) -> Option<ConnectionHistory>
where
    F: FnMut(&ConnectionHistory) -> bool,
{
    while let Some(history) = listener.recv().await {
        if pred(&history) {
            return Some(history);
        }
    }
    None
}

#[tokio::test]
async fn test_handshake_success() {
    let registry = ServiceRegistry::new();
    let service = script_service(
        &registry,
        "echo 'VERSION 1.0'; \
         echo 'PARENT tor socks5 127.0.0.1:9050'; \
         echo 'EXPOSE obfs4 socks5 127.0.0.1:41000'; \
         echo DONE; \
         cat >/dev/null",
    );

    timeout(TEST_TIMEOUT, service.start()).await.unwrap().unwrap();
    assert!(service.running());
    assert_eq!(service.response_value("version").as_deref(), Some("1.0"));
    assert_eq!(service.response_value("bindaddr").as_deref(), Some("127.0.0.1:41000"));
    assert_eq!(service.response_value("parentaddr").as_deref(), Some("127.0.0.1:9050"));

    let methods = registry.all_methods();
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].name, "obfs4");
    assert_eq!(methods[0].id, format!("{}/obfs4", service.id()));
    assert_eq!(registry.method(&methods[0].id).unwrap().service_id, *service.id());

    // configuration is frozen once started
    assert!(matches!(
        service.set_var("bindaddr", "127.0.0.1:1"),
        Err(Error::AlreadyRunning(_))
    ));

    timeout(TEST_TIMEOUT, service.shutdown()).await.unwrap();
    assert_eq!(service.lifecycle(), Lifecycle::Exited);
    // still registered until removed
    assert_eq!(registry.len(), 1);
    service.remove().unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_request_vars_reach_environment() {
    let registry = ServiceRegistry::new();
    let service = script_service(
        &registry,
        "echo 'VERSION 1.0'; \
         echo \"EXPOSE $TSUP_TRANSPORT socks5 $TSUP_BINDADDR\"; \
         echo \"EXPOSE auth $TSUP_SAUTH x\"; \
         echo DONE; \
         cat >/dev/null",
    );
    service.set_var("transport", "meek").unwrap();
    service.set_var("bindaddr", "127.0.0.1:42000").unwrap();

    timeout(TEST_TIMEOUT, service.start()).await.unwrap().unwrap();
    let methods = service.methods();
    assert_eq!(methods[0].name, "meek");
    assert_eq!(methods[0].bind_addr, "127.0.0.1:42000");
    assert_eq!(methods[1].protocol, "s3cret");

    timeout(TEST_TIMEOUT, service.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_error_line_fails_start() {
    let registry = ServiceRegistry::new();
    let service = script_service(
        &registry,
        "echo 'VERSION 1.0'; echo 'ERROR bridge unreachable: refused'; cat >/dev/null",
    );

    let err = timeout(TEST_TIMEOUT, service.start()).await.unwrap().unwrap_err();
    match err {
        Error::Negotiation(message) => assert!(message.contains("bridge unreachable")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(service.lifecycle(), Lifecycle::Exited);
    assert!(!service.running());
}

#[tokio::test]
async fn test_malformed_handshake() {
    let registry = ServiceRegistry::new();
    let service = script_service(&registry, "echo 'EXPOSE m1 socks5 127.0.0.1:1'; echo DONE");
    let err = timeout(TEST_TIMEOUT, service.start()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let service = script_service(&registry, "echo 'VERSION 1.0'");
    let err = timeout(TEST_TIMEOUT, service.start()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_stop_during_negotiation() {
    let registry = ServiceRegistry::new();
    let service = script_service(&registry, "echo 'VERSION 1.0'; exec sleep 30");

    let starting = service.clone();
    let start = tokio::spawn(async move { starting.start().await });

    timeout(TEST_TIMEOUT, async {
        while service.lifecycle() != Lifecycle::Starting {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    service.stop();
    let result = timeout(TEST_TIMEOUT, start).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Stopped(_))));
    timeout(TEST_TIMEOUT, service.wait()).await.unwrap();
    assert_eq!(service.lifecycle(), Lifecycle::Exited);
}

#[tokio::test]
async fn test_process_exit_is_observed() {
    let registry = ServiceRegistry::new();
    let service = script_service(
        &registry,
        "echo 'VERSION 1.0'; echo 'EXPOSE m1 socks5 127.0.0.1:1'; echo DONE; sleep 0.2",
    );
    timeout(TEST_TIMEOUT, service.start()).await.unwrap().unwrap();
    timeout(TEST_TIMEOUT, service.wait()).await.unwrap();
    assert!(!service.running());
}

#[tokio::test]
async fn test_stop_all() {
    let registry = ServiceRegistry::new();
    let a = script_service(&registry, &exposing("socks5", "127.0.0.1:1"));
    let b = script_service(&registry, &exposing("socks5", "127.0.0.1:2"));
    timeout(TEST_TIMEOUT, a.start()).await.unwrap().unwrap();
    timeout(TEST_TIMEOUT, b.start()).await.unwrap().unwrap();
    assert_eq!(registry.all_methods().len(), 2);

    timeout(TEST_TIMEOUT, registry.stop_all()).await.unwrap();
    assert!(!a.running());
    assert!(!b.running());
}

#[tokio::test]
async fn test_transport_service_parent() {
    let registry = ServiceRegistry::new();
    let parent = TransportService::new(
        Connection::new("tor", "", "127.0.0.1:9"),
        &script_transport("tor", &exposing("socks5", "127.0.0.1:9050")),
        &registry,
        options(),
    )
    .unwrap();
    timeout(TEST_TIMEOUT, parent.start()).await.unwrap().unwrap();
    assert_eq!(parent.bind_addr().as_deref(), Some("127.0.0.1:9050"));
    assert_eq!(parent.protocol().as_deref(), Some("socks5"));

    let child = TransportService::new(
        Connection::new("obfs4", "cert=x", "203.0.113.1:443"),
        &script_transport(
            "obfs4",
            "echo 'VERSION 1.0'; echo \"EXPOSE m1 socks5 $TSUP_PARENTADDR\"; echo DONE; cat >/dev/null",
        ),
        &registry,
        options(),
    )
    .unwrap();
    child.set_parent(&parent).unwrap();
    timeout(TEST_TIMEOUT, child.start()).await.unwrap().unwrap();
    assert_eq!(child.bind_addr().as_deref(), Some("127.0.0.1:9050"));
    assert!(child.set_verbose().is_err());

    timeout(TEST_TIMEOUT, registry.stop_all()).await.unwrap();
}

/// Succeeds only for one endpoint address
struct AddrProbe {
    good: String,
}

#[async_trait]
impl ConnectivityProbe for AddrProbe {
    async fn probe(&self, bind_addr: &str) -> Result<()> {
        if bind_addr == self.good {
            Ok(())
        } else {
            Err(Error::connection(format!("{} is unreachable", bind_addr)))
        }
    }
}

fn manager_settings() -> ManagerSettings {
    ManagerSettings {
        reconnect_delay: Duration::from_millis(50),
        reverify_interval: Duration::from_secs(60),
        history_limit: 6,
        service: options(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_manager_fails_over_to_working_connection() {
    let mut transports = HashMap::new();
    transports.insert("bad".to_string(), script_transport("bad", &exposing("socks5", "127.0.0.1:1")));
    transports.insert("good".to_string(), script_transport("good", &exposing("socks5", "127.0.0.1:2")));

    let bad = Connection::new("bad", "", "198.51.100.1:1");
    let good = Connection::new("good", "", "198.51.100.2:2");
    let registry = ServiceRegistry::new();
    let manager = ConnectionManager::start(
        manager_settings(),
        registry.clone(),
        Arc::new(AddrProbe {
            good: "127.0.0.1:2".to_string(),
        }),
        transports,
        vec![bad.clone(), good.clone()],
    );
    let mut listener = manager.subscribe();

    let up = timeout(
        TEST_TIMEOUT,
        wait_for_history(&mut listener, |h| {
            assert!(h.len() <= 6);
            let current = h.current().unwrap();
            // the bad endpoint never passes the probe
            assert!(current.connection.id != bad.id || current.state != ConnectionState::Up);
            current.state == ConnectionState::Up
        }),
    )
    .await
    .unwrap()
    .unwrap();

    let event = up.current().unwrap();
    assert_eq!(event.connection.id, good.id);
    assert!(event.service_id.is_some());
    let states: Vec<_> = up.history.iter().map(|e| e.state).collect();
    assert!(states.ends_with(&[
        ConnectionState::ServiceStart,
        ConnectionState::Test,
        ConnectionState::Up
    ]));
    assert!(manager.transport_ok());
    assert_eq!(manager.current_bind_addr().as_deref(), Some("127.0.0.1:2"));
    assert_eq!(manager.active_transport().unwrap().connection().id, good.id);
    assert!(manager.new_transport_http_client().is_ok());

    manager.stop().await;
    timeout(TEST_TIMEOUT, registry.stop_all()).await.unwrap();
}

#[tokio::test]
async fn test_manager_rejects_wrong_protocol() {
    let mut transports = HashMap::new();
    transports.insert("http".to_string(), script_transport("http", &exposing("http", "127.0.0.1:3")));
    let connection = Connection::new("http", "", "198.51.100.3:3");

    let registry = ServiceRegistry::new();
    let manager = ConnectionManager::start(
        manager_settings(),
        registry.clone(),
        Arc::new(AddrProbe {
            good: "127.0.0.1:3".to_string(),
        }),
        transports,
        vec![connection],
    );
    let mut listener = manager.subscribe();

    let ended = timeout(
        TEST_TIMEOUT,
        wait_for_history(&mut listener, |h| {
            h.current().map(|e| e.state) == Some(ConnectionState::Ended)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    let states: Vec<_> = ended.history.iter().map(|e| e.state).collect();
    assert!(states.ends_with(&[
        ConnectionState::WrongProtocol,
        ConnectionState::Failed,
        ConnectionState::Ended
    ]));
    assert!(!manager.transport_ok());

    manager.stop().await;
    timeout(TEST_TIMEOUT, registry.stop_all()).await.unwrap();
}

#[tokio::test]
async fn test_manager_start_failure_ends() {
    let mut transports = HashMap::new();
    transports.insert(
        "broken".to_string(),
        script_transport("broken", "echo 'VERSION 1.0'; echo 'ERROR no bridge'"),
    );
    let registry = ServiceRegistry::new();
    let manager = ConnectionManager::start(
        manager_settings(),
        registry.clone(),
        Arc::new(AddrProbe {
            good: String::new(),
        }),
        transports,
        vec![Connection::new("broken", "", "198.51.100.4:4")],
    );
    let mut listener = manager.subscribe();

    let ended = timeout(
        TEST_TIMEOUT,
        wait_for_history(&mut listener, |h| {
            h.current().map(|e| e.state) == Some(ConnectionState::Ended)
        }),
    )
    .await
    .unwrap()
    .unwrap();
    let states: Vec<_> = ended.history.iter().map(|e| e.state).collect();
    assert!(states.ends_with(&[ConnectionState::Failed, ConnectionState::Ended]));

    manager.stop().await;
    timeout(TEST_TIMEOUT, registry.stop_all()).await.unwrap();
}

/// Passes the first `healthy` checks, fails every later one
struct FlakyProbe {
    healthy: usize,
    calls: AtomicUsize,
}

impl FlakyProbe {
    fn new(healthy: usize) -> Self {
        FlakyProbe {
            healthy,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for FlakyProbe {
    async fn probe(&self, bind_addr: &str) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.healthy {
            Ok(())
        } else {
            Err(Error::timeout(format!("{} stopped answering", bind_addr)))
        }
    }
}

fn reverify_settings() -> ManagerSettings {
    ManagerSettings {
        reconnect_delay: Duration::from_secs(30),
        reverify_interval: Duration::from_millis(200),
        history_limit: 20,
        service: options(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_manager_reverify_tears_down_failed_transport() {
    let mut transports = HashMap::new();
    transports.insert("flaky".to_string(), script_transport("flaky", &exposing("socks5", "127.0.0.1:5")));
    let registry = ServiceRegistry::new();
    let probe = Arc::new(FlakyProbe::new(1));
    let manager = ConnectionManager::start(
        reverify_settings(),
        registry.clone(),
        probe.clone(),
        transports,
        vec![Connection::new("flaky", "", "198.51.100.5:5")],
    );
    let mut listener = manager.subscribe();

    timeout(TEST_TIMEOUT, wait_for_history(&mut listener, |h| h.is_up()))
        .await
        .unwrap()
        .unwrap();
    assert!(manager.transport_ok());

    let ended = timeout(
        TEST_TIMEOUT,
        wait_for_history(&mut listener, |h| {
            h.current().map(|e| e.state) == Some(ConnectionState::Ended)
        }),
    )
    .await
    .unwrap()
    .unwrap();
    let states: Vec<_> = ended.history.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Init,
            ConnectionState::ServiceInit,
            ConnectionState::ServiceStart,
            ConnectionState::Test,
            ConnectionState::Up,
            ConnectionState::TestFailed,
            ConnectionState::Failed,
            ConnectionState::Ended,
        ]
    );
    assert!(!manager.transport_ok());
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

    manager.stop().await;
    timeout(TEST_TIMEOUT, registry.stop_all()).await.unwrap();
}

#[tokio::test]
async fn test_manager_reverify_keeps_healthy_transport() {
    let mut transports = HashMap::new();
    transports.insert("steady".to_string(), script_transport("steady", &exposing("socks5", "127.0.0.1:6")));
    let registry = ServiceRegistry::new();
    let probe = Arc::new(FlakyProbe::new(usize::MAX));
    let manager = ConnectionManager::start(
        reverify_settings(),
        registry.clone(),
        probe.clone(),
        transports,
        vec![Connection::new("steady", "", "198.51.100.6:6")],
    );
    let mut listener = manager.subscribe();

    timeout(TEST_TIMEOUT, wait_for_history(&mut listener, |h| h.is_up()))
        .await
        .unwrap()
        .unwrap();
    let checks = probe.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(900)).await;

    // passing checks are silent
    assert!(listener.try_recv().is_err());
    assert!(probe.calls.load(Ordering::SeqCst) >= checks + 2);
    assert!(manager.transport_ok());
    assert_eq!(manager.current_bind_addr().as_deref(), Some("127.0.0.1:6"));

    manager.stop().await;
    timeout(TEST_TIMEOUT, registry.stop_all()).await.unwrap();
}

#[tokio::test]
async fn test_traffic_reporter_reaches_receiver() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let receiver = TrafficReceiver::new("s3cret");
    let mut updates = receiver.subscribe();
    tokio::spawn(receiver.clone().serve_listener(listener));

    let monitor = TrafficMonitor::new();
    monitor.add_read(1000);
    monitor.add_written(24);
    let _guard = monitor.track_open("203.0.113.9:443");
    let reporter = monitor
        .spawn_reporter(ReportEndpoint {
            url: format!("http://{}{}", addr, TRAFFIC_PATH),
            auth_secret: "s3cret".to_string(),
        })
        .unwrap();

    let traffic = timeout(TEST_TIMEOUT, async {
        loop {
            updates.changed().await.unwrap();
            if let Some(traffic) = updates.borrow().clone() {
                return traffic;
            }
        }
    })
    .await
    .unwrap();
    reporter.abort();

    assert_eq!(traffic.read_total, 1000);
    assert_eq!(traffic.write_total, 24);
    assert_eq!(traffic.opened, vec!["203.0.113.9:443".to_string()]);
    assert_eq!(receiver.latest(), Some(traffic));
}
