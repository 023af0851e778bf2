//! Byte counting wrappers

use super::TrafficMonitor;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Keeps a remote address in the open set while alive
pub struct OpenGuard {
    monitor: TrafficMonitor,
    addr: String,
}

impl OpenGuard {
    pub(super) fn new(monitor: TrafficMonitor, addr: String) -> Self {
        OpenGuard { monitor, addr }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.monitor.release(&self.addr);
    }
}

/// Stream whose reads and writes feed a [`TrafficMonitor`]
pub struct MonitoredStream<S> {
    inner: S,
    monitor: TrafficMonitor,
    guard: OpenGuard,
}

impl<S> MonitoredStream<S> {
    pub(super) fn new(inner: S, monitor: TrafficMonitor, guard: OpenGuard) -> Self {
        MonitoredStream {
            inner,
            monitor,
            guard,
        }
    }

    pub fn remote(&self) -> &str {
        self.guard.addr()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MonitoredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let after = buf.filled().len();
            self.monitor.add_read((after - before) as u64);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MonitoredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.monitor.add_written(*n as u64);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// TCP listener handing out monitored streams
pub struct MonitoredListener {
    listener: TcpListener,
    monitor: TrafficMonitor,
}

impl MonitoredListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A, monitor: TrafficMonitor) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(MonitoredListener { listener, monitor })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn monitor(&self) -> &TrafficMonitor {
        &self.monitor
    }

    pub async fn accept(&self) -> io::Result<(MonitoredStream<TcpStream>, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((self.monitor.monitor_stream(stream, peer.to_string()), peer))
    }
}
