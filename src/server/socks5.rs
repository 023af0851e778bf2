//! Bundled `socks5` transport: a plain SOCKS5 server that connects
//! directly to the requested destination.

use super::{BundledTransport, MethodHandler};
use crate::common::socks::{
    self, Address, ConnectRequest, REP_CONNECTION_REFUSED, REP_GENERAL_FAILURE,
    REP_HOST_UNREACHABLE, REP_NETWORK_UNREACHABLE, REP_SUCCEEDED, REP_TTL_EXPIRED,
};
use crate::telemetry::MonitoredListener;
use crate::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

pub const TRANSPORT_NAME: &str = "socks5";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Socks5Transport;

#[async_trait]
impl BundledTransport for Socks5Transport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    async fn run(&self, handler: MethodHandler) -> Result<()> {
        handler.print_version()?;

        let bind_addr = handler.option("bindaddr").bind_addr();
        let listener = match MonitoredListener::bind(bind_addr.as_str(), handler.monitor().clone()).await {
            Ok(listener) => listener,
            Err(e) => return Err(handler.print_error(&e.to_string())),
        };
        let local_addr = listener.local_addr()?;

        handler.print_expose(TRANSPORT_NAME, &local_addr.to_string())?;
        handler.print_done()?;
        info!("socks5 transport listening on {}", local_addr);

        tokio::select! {
            result = serve(listener) => result,
            _ = handler.wait_for_shutdown() => {
                info!("socks5 transport shutting down");
                Ok(())
            }
        }
    }
}

/// Accept loop. Only fails when the listener itself fails.
pub async fn serve(listener: MonitoredListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream).await {
                debug!("SOCKS5 connection error from {}: {}", peer, e);
            }
        });
    }
}

/// Serve one SOCKS5 client: no-auth greeting, CONNECT, then relay.
pub async fn handle_client<S>(mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    socks::accept_greeting(&mut stream).await?;
    let request = ConnectRequest::read_from(&mut stream).await?;
    let target = request.address.to_string_with_port(request.port);

    let mut remote = match timeout(CONNECT_TIMEOUT, TcpStream::connect(target.as_str())).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            socks::write_reply(&mut stream, reply_code(&e), None).await?;
            return Err(Error::connection(format!("connect to {} failed: {}", target, e)));
        }
        Err(_) => {
            socks::write_reply(&mut stream, REP_TTL_EXPIRED, None).await?;
            return Err(Error::timeout(format!("connect to {} timed out", target)));
        }
    };
    remote.set_nodelay(true).ok();

    let bound = remote
        .local_addr()
        .ok()
        .map(|addr| (Address::from(addr.ip()), addr.port()));
    socks::write_reply(&mut stream, REP_SUCCEEDED, bound).await?;
    debug!("relaying to {}", target);

    let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
    debug!("closed {} ({} up, {} down)", target, up, down);
    Ok(())
}

fn reply_code(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::AddrNotAvailable => REP_NETWORK_UNREACHABLE,
        io::ErrorKind::NotFound | io::ErrorKind::TimedOut => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::socks::{REP_COMMAND_NOT_SUPPORTED, SOCKS5_VERSION};
    use crate::telemetry::TrafficMonitor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_reply_code() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(reply_code(&refused), REP_CONNECTION_REFUSED);
        let other = io::Error::from(io::ErrorKind::Other);
        assert_eq!(reply_code(&other), REP_GENERAL_FAILURE);
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        // BIND to 10.0.0.1:80
        let mut stream = tokio_test::io::Builder::new()
            .read(&[SOCKS5_VERSION, 1, 0x00])
            .write(&[SOCKS5_VERSION, 0x00])
            .read(&[SOCKS5_VERSION, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .write(&[SOCKS5_VERSION, REP_COMMAND_NOT_SUPPORTED, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();
        assert!(handle_client(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_through_server() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let monitor = TrafficMonitor::new();
        let listener = MonitoredListener::bind("127.0.0.1:0", monitor.clone())
            .await
            .unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        socks::client_connect(&mut client, &Address::from(echo_addr.ip()), echo_addr.port())
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let (read, written) = monitor.totals();
        assert!(read >= 5);
        assert!(written >= 5);
    }
}
