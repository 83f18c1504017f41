//! An in-process network of transport connections, with hooks for breaking them in controlled
//!  ways. All providers cloned from the same [MemoryTransportProvider] share one network.

use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{TransportConnection, TransportListener, TransportProvider};

const FIRST_EPHEMERAL_PORT: u16 = 40_000;

#[derive(Clone, Default)]
pub struct MemoryTransportProvider {
    network: Arc<MemoryNetwork>,
}

#[derive(Default)]
struct MemoryNetwork {
    listeners: Mutex<FxHashMap<SocketAddr, mpsc::UnboundedSender<TransportConnection>>>,
    links: Mutex<Vec<MemoryLink>>,
    refuse_connections: AtomicBool,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    fn listeners(&self) -> MutexGuard<'_, FxHashMap<SocketAddr, mpsc::UnboundedSender<TransportConnection>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, Vec<MemoryLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ephemeral_addr(&self) -> SocketAddr {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::from(([127, 0, 0, 1], FIRST_EPHEMERAL_PORT.wrapping_add(offset)))
    }
}

impl MemoryTransportProvider {
    pub fn new() -> MemoryTransportProvider {
        Default::default()
    }

    /// All links that were ever opened in this network, in the order they were opened
    pub fn links(&self) -> Vec<MemoryLink> {
        self.network.links().clone()
    }

    pub fn last_link(&self) -> Option<MemoryLink> {
        self.network.links().last().cloned()
    }

    /// Severs every link in the network, as if the network cable was pulled
    pub fn sever_all(&self) {
        for link in self.links() {
            link.sever();
        }
    }

    /// While set, `connect` fails as if the remote host was unreachable
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.network.refuse_connections.store(refuse, Ordering::Release);
    }
}

#[async_trait]
impl TransportProvider for MemoryTransportProvider {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<TransportConnection> {
        if self.network.refuse_connections.load(Ordering::Acquire) {
            bail!(io::Error::new(ErrorKind::ConnectionRefused, format!("connection to {:?} refused", addr)));
        }

        let dialer_addr = self.network.ephemeral_addr();
        let (to_listener, listener_reader) = pipe();
        let (to_dialer, dialer_reader) = pipe();

        let listener_side = TransportConnection::new(
            Box::new(listener_reader),
            Box::new(MemoryWriter { pipe: to_dialer.clone() }),
            dialer_addr,
        );

        {
            let listeners = self.network.listeners();
            let listener = listeners.get(&addr)
                .ok_or_else(|| anyhow!(io::Error::new(ErrorKind::ConnectionRefused, format!("nobody listens on {:?}", addr))))?;
            if listener.send(listener_side).is_err() {
                bail!(io::Error::new(ErrorKind::ConnectionRefused, format!("listener on {:?} is gone", addr)));
            }
        }

        debug!("opened memory link {:?} -> {:?}", dialer_addr, addr);
        self.network.links().push(MemoryLink {
            dialer_addr,
            listener_addr: addr,
            to_listener: to_listener.clone(),
            to_dialer,
        });

        Ok(TransportConnection::new(
            Box::new(dialer_reader),
            Box::new(MemoryWriter { pipe: to_listener }),
            addr,
        ))
    }

    async fn listen(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn TransportListener>> {
        let addr = if addr.port() == 0 {
            self.network.ephemeral_addr()
        }
        else {
            addr
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.network.listeners();
        if listeners.get(&addr).is_some_and(|l| !l.is_closed()) {
            bail!(io::Error::new(ErrorKind::AddrInUse, format!("{:?} is in use", addr)));
        }
        listeners.insert(addr, tx);

        Ok(Box::new(MemoryListener {
            addr,
            network: self.network.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct MemoryListener {
    addr: SocketAddr,
    network: Arc<MemoryNetwork>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportConnection>>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> anyhow::Result<TransportConnection> {
        self.incoming.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("listener on {:?} was closed", self.addr))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.listeners().remove(&self.addr);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkDirection {
    ToListener,
    ToDialer,
}

/// A handle to one transport connection in the memory network, for injecting faults
#[derive(Clone)]
pub struct MemoryLink {
    pub dialer_addr: SocketAddr,
    pub listener_addr: SocketAddr,
    to_listener: Arc<Pipe>,
    to_dialer: Arc<Pipe>,
}

impl MemoryLink {
    fn pipe(&self, direction: LinkDirection) -> &Pipe {
        match direction {
            LinkDirection::ToListener => &self.to_listener,
            LinkDirection::ToDialer => &self.to_dialer,
        }
    }

    /// Both ends see a 'connection reset' on their next read and 'broken pipe' on their next
    ///  write. Data that was written before but not read yet is still delivered.
    pub fn sever(&self) {
        debug!("severing memory link {:?} -> {:?}", self.dialer_addr, self.listener_addr);
        self.to_listener.sever();
        self.to_dialer.sever();
    }

    /// While set, everything written in the given direction is silently dropped
    pub fn set_blackhole(&self, direction: LinkDirection, blackhole: bool) {
        self.pipe(direction).blackhole.store(blackhole, Ordering::Release);
    }

    /// Delivers raw bytes to the reader in the given direction, bypassing the writer
    pub fn inject(&self, direction: LinkDirection, data: Bytes) {
        if let Some(tx) = self.pipe(direction).sender().as_ref() {
            let _ = tx.send(Chunk::Data(data));
        }
    }

    pub fn is_severed(&self) -> bool {
        self.to_listener.severed.load(Ordering::Acquire)
    }
}

enum Chunk {
    Data(Bytes),
    Severed,
}

struct Pipe {
    tx: Mutex<Option<mpsc::UnboundedSender<Chunk>>>,
    blackhole: AtomicBool,
    severed: AtomicBool,
}

impl Pipe {
    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Chunk>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sever(&self) {
        self.severed.store(true, Ordering::Release);
        if let Some(tx) = self.sender().take() {
            let _ = tx.send(Chunk::Severed);
        }
    }
}

fn pipe() -> (Arc<Pipe>, MemoryReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pipe = Arc::new(Pipe {
        tx: Mutex::new(Some(tx)),
        blackhole: AtomicBool::new(false),
        severed: AtomicBool::new(false),
    });
    (pipe, MemoryReader { rx, pending: Bytes::new() })
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Chunk>,
    pending: Bytes,
}

impl AsyncRead for MemoryReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(Chunk::Data(data)) => self.pending = data,
                Some(Chunk::Severed) => return Poll::Ready(Err(io::Error::new(ErrorKind::ConnectionReset, "memory link severed"))),
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

struct MemoryWriter {
    pipe: Arc<Pipe>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.pipe.severed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(ErrorKind::BrokenPipe, "memory link severed")));
        }
        if self.pipe.blackhole.load(Ordering::Acquire) {
            return Poll::Ready(Ok(buf.len()));
        }

        let sent = self.pipe.sender().as_ref()
            .map(|tx| tx.send(Chunk::Data(Bytes::copy_from_slice(buf))).is_ok())
            .unwrap_or(false);
        if sent {
            Poll::Ready(Ok(buf.len()))
        }
        else {
            Poll::Ready(Err(io::Error::new(ErrorKind::BrokenPipe, "memory link closed")))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.pipe.sender().take();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.pipe.sender().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn connected_pair(provider: &MemoryTransportProvider) -> (TransportConnection, TransportConnection, Box<dyn TransportListener>) {
        let listener = provider.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let dialer = provider.connect(listener.local_addr().unwrap()).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        (dialer, accepted, listener)
    }

    #[tokio::test]
    async fn test_exchange_data() {
        let provider = MemoryTransportProvider::new();
        let (mut dialer, mut accepted, listener) = connected_pair(&provider).await;
        assert_eq!(dialer.peer_addr, listener.local_addr().unwrap());

        dialer.writer.write_all(b"ping").await.unwrap();
        accepted.writer.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 4];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        dialer.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_shutdown_is_eof() {
        let provider = MemoryTransportProvider::new();
        let (mut dialer, mut accepted, _listener) = connected_pair(&provider).await;

        dialer.writer.write_all(b"abc").await.unwrap();
        dialer.writer.shutdown().await.unwrap();

        let mut buf = Vec::new();
        accepted.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"abc");
    }

    #[tokio::test]
    async fn test_sever() {
        let provider = MemoryTransportProvider::new();
        let (mut dialer, mut accepted, _listener) = connected_pair(&provider).await;

        dialer.writer.write_all(b"abc").await.unwrap();
        provider.last_link().unwrap().sever();

        let mut buf = [0u8; 3];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(accepted.reader.read(&mut buf).await.unwrap_err().kind(), ErrorKind::ConnectionReset);
        assert_eq!(dialer.reader.read(&mut buf).await.unwrap_err().kind(), ErrorKind::ConnectionReset);
        assert_eq!(dialer.writer.write_all(b"x").await.unwrap_err().kind(), ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_blackhole_and_inject() {
        let provider = MemoryTransportProvider::new();
        let (mut dialer, mut accepted, _listener) = connected_pair(&provider).await;
        let link = provider.last_link().unwrap();

        link.set_blackhole(LinkDirection::ToListener, true);
        dialer.writer.write_all(b"lost").await.unwrap();
        link.set_blackhole(LinkDirection::ToListener, false);
        link.inject(LinkDirection::ToListener, Bytes::from_static(b"xy"));
        dialer.writer.write_all(b"z").await.unwrap();

        let mut buf = [0u8; 3];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xyz");
    }

    #[tokio::test]
    async fn test_refuse_connections() {
        let provider = MemoryTransportProvider::new();
        let listener = provider.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        provider.set_refuse_connections(true);
        assert!(provider.connect(addr).await.is_err());
        provider.set_refuse_connections(false);
        assert!(provider.connect(addr).await.is_ok());

        drop(listener);
        assert!(provider.connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_listen_twice_on_same_addr() {
        let provider = MemoryTransportProvider::new();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let _listener = provider.listen(addr).await.unwrap();
        assert!(provider.listen(addr).await.is_err());
    }
}
