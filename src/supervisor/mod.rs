//! Application wiring

use crate::config::Config;
use crate::manager::{ConnectionHistory, ConnectionManager, ConnectionState};
use crate::service::ServiceRegistry;
use crate::telemetry::TrafficReceiver;
use crate::{Result, VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Supervisor instance owning every component
pub struct Supervisor {
    config: Config,
    registry: ServiceRegistry,
    receiver: TrafficReceiver,
    manager: ConnectionManager,
    controller_addr: SocketAddr,
}

impl Supervisor {
    /// Create the supervisor and start connecting.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing Transport Supervisor v{}", VERSION);

        let controller_addr = config.controller_addr()?;
        let registry = ServiceRegistry::new();
        let receiver = TrafficReceiver::new(config.auth_key());

        let enabled = config.connections.iter().filter(|c| c.is_enabled()).count();
        info!(
            "Loaded {} transports and {} connections ({} enabled)",
            config.transports.len(),
            config.connections.len(),
            enabled
        );

        let manager = ConnectionManager::start(
            config.manager_settings(),
            registry.clone(),
            Arc::new(config.probe()),
            config.transports.clone(),
            config.connections.clone(),
        );

        Ok(Supervisor {
            config,
            registry,
            receiver,
            manager,
            controller_addr,
        })
    }

    /// Serve telemetry and log connection events until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        info!("Starting supervisor...");

        let receiver = self.receiver.clone();
        let addr = self.controller_addr;
        let server = tokio::spawn(async move {
            if let Err(e) = receiver.serve(addr).await {
                warn!("Traffic receiver error: {}", e);
            }
        });
        let events = spawn_event_logger(self.manager.subscribe());

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        server.abort();
        self.shutdown().await;
        events.abort();

        info!("Supervisor stopped");
        Ok(())
    }

    /// Stop the manager, then every service still registered.
    pub async fn shutdown(&self) {
        self.manager.stop().await;
        self.registry.stop_all().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn receiver(&self) -> &TrafficReceiver {
        &self.receiver
    }
}

fn spawn_event_logger(mut events: mpsc::UnboundedReceiver<ConnectionHistory>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(history) = events.recv().await {
            let Some(event) = history.current() else {
                continue;
            };
            if event.state == ConnectionState::Up {
                info!(
                    "connection {} is up via service {}",
                    event.connection.display_name(),
                    event
                        .service_id
                        .as_ref()
                        .map(|id| id.to_string())
                        .unwrap_or_default()
                );
            } else {
                debug!(
                    "connection {}: {} ({} events kept)",
                    event.connection.display_name(),
                    event.state,
                    history.len()
                );
            }
        }
    })
}
