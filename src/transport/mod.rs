//! Transport services
//!
//! A [`TransportService`] is a [`Service`] launched for one [`Connection`].
//! Once started it exposes a local SOCKS5 endpoint that can be dialed
//! directly or used as the proxy of an HTTP client.

use crate::common::socks::{self, Address};
use crate::connection::{Connection, Transport};
use crate::service::{Lifecycle, Service, ServiceOptions, ServiceRegistry};
use crate::{Error, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Connection timeout towards the local endpoint
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Service name used for every transport process
pub const TRANSPORT_SERVICE_NAME: &str = "transport";

/// Command line flag telling a bundled transport its env namespace
pub const NAMESPACE_FLAG: &str = "--env-namespace";

#[derive(Debug, Clone)]
pub struct TransportService {
    service: Service,
    connection: Connection,
}

impl TransportService {
    /// Build the service for `connection` using its registry entry.
    pub fn new(
        connection: Connection,
        transport: &Transport,
        registry: &ServiceRegistry,
        mut options: ServiceOptions,
    ) -> Result<Self> {
        let command = transport.launch_command()?;
        if transport.bundled {
            // the bundled binary cannot see the namespace it is launched in
            options
                .args
                .extend([NAMESPACE_FLAG.to_string(), options.namespace.clone()]);
        }
        options.args.extend(transport.args.iter().cloned());

        let service = Service::new(TRANSPORT_SERVICE_NAME, command, options, registry);
        service.set_var("service", TRANSPORT_SERVICE_NAME)?;
        service.set_var("transport", connection.transport.as_str())?;
        service.set_var("remoteaddr", connection.addr.as_str())?;
        service.set_var("secret", connection.secret.as_str())?;
        debug!(
            "transport service {} created for {}",
            service.id(),
            connection.display_name()
        );

        Ok(TransportService {
            service,
            connection,
        })
    }

    fn ensure_idle(&self, action: &str) -> Result<()> {
        if self.service.lifecycle() != Lifecycle::Idle {
            return Err(Error::already_running(action));
        }
        Ok(())
    }

    /// Local address the transport should listen on
    pub fn set_bind_addr(&self, bind_addr: &str) -> Result<()> {
        self.ensure_idle("set bindaddr")?;
        self.service.set_var("bindaddr", bind_addr)
    }

    pub fn set_verbose(&self) -> Result<()> {
        self.ensure_idle("set verbose")?;
        self.service.set_var("verbose", "yes")
    }

    /// Chain this transport behind an already running one.
    pub fn set_parent(&self, parent: &TransportService) -> Result<()> {
        self.ensure_idle("set parent")?;
        if !parent.service.running() {
            return Err(Error::config(
                "Parent must be running before starting service",
            ));
        }
        let parent_addr = parent
            .bind_addr()
            .ok_or_else(|| Error::config("parent has no bindaddr"))?;
        self.service.set_var("parentaddr", parent_addr)
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn start(&self) -> Result<()> {
        self.service.start().await
    }

    pub fn stop(&self) {
        self.service.stop()
    }

    pub async fn wait(&self) {
        self.service.wait().await
    }

    /// Address of the exposed endpoint, known after the handshake
    pub fn bind_addr(&self) -> Option<String> {
        self.service.response_value("bindaddr")
    }

    /// Protocol label of the exposed endpoint
    pub fn protocol(&self) -> Option<String> {
        self.service.response_value("protocol")
    }

    fn require_bind_addr(&self) -> Result<String> {
        self.bind_addr().ok_or_else(|| {
            Error::connection(format!(
                "transport service {} exposes no endpoint",
                self.service.id()
            ))
        })
    }

    /// Open a TCP stream to `host:port` through the transport.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let bind_addr = self.require_bind_addr()?;
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(bind_addr.as_str()))
            .await
            .map_err(|_| Error::timeout("SOCKS5 connection timeout"))??;
        stream.set_nodelay(true).ok();

        socks::client_connect(&mut stream, &Address::from(host), port).await?;
        debug!("dialed {}:{} via {}", host, port, bind_addr);
        Ok(stream)
    }

    /// HTTP client that sends every request through the transport.
    pub fn http_client(&self, request_timeout: Duration) -> Result<reqwest::Client> {
        proxied_http_client(&self.require_bind_addr()?, request_timeout)
    }
}

/// Build an HTTP client that resolves and connects via a SOCKS5 endpoint.
pub fn proxied_http_client(bind_addr: &str, request_timeout: Duration) -> Result<reqwest::Client> {
    let proxy = reqwest::Proxy::all(format!("socks5h://{}", bind_addr))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(request_timeout)
        .build()?;
    Ok(client)
}
