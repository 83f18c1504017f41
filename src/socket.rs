use std::fmt::{Debug, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::connection_id::ConnectionId;
use crate::connection_record::{ConnectionRecord, ConnectionState};
use crate::supervisor::Supervisor;

/// The application's view of a logical connection: a byte stream that keeps working across
///  failures of the transport connections carrying it.
///
/// Dropping the socket (or its [SocketWriter] half) closes the connection.
pub struct ResilientSocket {
    reader: SocketReader,
    writer: SocketWriter,
}

impl Debug for ResilientSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResilientSocket{{{:?} {:?}}}", self.connection_id(), self.state())
    }
}

impl ResilientSocket {
    pub(crate) fn new(supervisor: Arc<Supervisor>, record: Arc<ConnectionRecord>, incoming: mpsc::UnboundedReceiver<Bytes>) -> ResilientSocket {
        ResilientSocket {
            reader: SocketReader {
                id: record.id(),
                incoming,
                pending: Bytes::new(),
            },
            writer: SocketWriter {
                supervisor,
                record,
                closed: false,
            },
        }
    }

    /// see [Supervisor::connect]
    pub async fn connect(supervisor: &Supervisor, addr: SocketAddr) -> anyhow::Result<ResilientSocket> {
        supervisor.connect(addr).await
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.writer.connection_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.writer.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.writer.state_changes()
    }

    /// Waits for data and copies as much of it into `buf` as fits. Returns 0 once the connection
    ///  is closed and all data received before was read.
    pub async fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.reader.read(buf).await?)
    }

    /// Hands the data over for sending, splitting it into packets as necessary. This does not
    ///  wait for the data to be sent or received: it is buffered and re-sent after transport
    ///  failures until the peer acknowledges it.
    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.writer.write(data)
    }

    /// Starts the close handshake and returns without waiting for it to complete
    pub fn close(&mut self) {
        self.writer.close()
    }

    pub fn into_split(self) -> (SocketReader, SocketWriter) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for ResilientSocket {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ResilientSocket {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// The receiving half of a [ResilientSocket]
pub struct SocketReader {
    id: ConnectionId,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

impl Debug for SocketReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SocketReader{{{:?}}}", self.id)
    }
}

impl AsyncRead for SocketReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match ready!(self.incoming.poll_recv(cx)) {
                Some(data) => self.pending = data,
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// The sending half of a [ResilientSocket]. Dropping it closes the connection.
pub struct SocketWriter {
    supervisor: Arc<Supervisor>,
    record: Arc<ConnectionRecord>,
    closed: bool,
}

impl Debug for SocketWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SocketWriter{{{:?}}}", self.record.id())
    }
}

impl SocketWriter {
    pub fn connection_id(&self) -> ConnectionId {
        self.record.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.record.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.record.subscribe()
    }

    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.closed {
            bail!("connection {:?} is closed", self.record.id());
        }
        for chunk in data.chunks(self.supervisor.config().max_payload_len) {
            self.supervisor.send_data(&self.record, Bytes::copy_from_slice(chunk))?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.supervisor.close(&self.record);
        }
    }

    fn io_error(&self, e: anyhow::Error) -> io::Error {
        let kind = match self.record.state() {
            ConnectionState::Initiating | ConnectionState::Accepting => ErrorKind::NotConnected,
            _ => ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, e)
    }
}

impl AsyncWrite for SocketWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.closed {
            let e = anyhow!("connection {:?} is closed", self.record.id());
            return Poll::Ready(Err(self.io_error(e)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(self.supervisor.config().max_payload_len);
        let result = self.supervisor.send_data(&self.record, Bytes::copy_from_slice(&buf[..n]));
        Poll::Ready(match result {
            Ok(()) => Ok(n),
            Err(e) => Err(self.io_error(e)),
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for SocketWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("socket for {:?} was dropped, closing", self.record.id());

        // the writer may be dropped while the record is locked, so closing happens asynchronously
        let runtime = self.supervisor.runtime().clone();
        let supervisor = self.supervisor.clone();
        let record = self.record.clone();
        runtime.spawn(async move {
            supervisor.close(&record);
        });
    }
}

/// Yields logical connections initiated by remote peers
pub struct ResilientListener {
    local_addr: SocketAddr,
    incoming: mpsc::UnboundedReceiver<ResilientSocket>,
}

impl Debug for ResilientListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResilientListener{{{:?}}}", self.local_addr)
    }
}

impl ResilientListener {
    pub(crate) fn new(local_addr: SocketAddr, incoming: mpsc::UnboundedReceiver<ResilientSocket>) -> ResilientListener {
        ResilientListener { local_addr, incoming }
    }

    /// see [Supervisor::listen]
    pub async fn bind(supervisor: &Supervisor, addr: SocketAddr) -> anyhow::Result<ResilientListener> {
        supervisor.listen(addr).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next newly established logical connection. Re-joined connections are not
    ///  reported again.
    pub async fn accept(&mut self) -> anyhow::Result<ResilientSocket> {
        self.incoming.recv().await
            .ok_or_else(|| anyhow!("listener on {:?} stopped accepting", self.local_addr))
    }
}
