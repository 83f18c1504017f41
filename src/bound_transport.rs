use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn, Instrument};

use crate::command::{encode_frame_to_bytes, Frame};
use crate::frame_reader::read_frame;
use crate::socket::ResilientSocket;
use crate::transport::{TransportConnection, TransportReader, TransportWriter};

pub type TransportId = u64;

/// Receives everything that is read from a [BoundTransport]
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, transport: &Arc<BoundTransport>, frame: Frame);

    /// Called once a transport connection ended or failed without being closed locally. This
    ///  covers EOF, I/O errors in either direction, and malformed frames.
    fn on_transport_failure(&self, transport: &Arc<BoundTransport>);
}

/// A live transport connection with its reader and writer tasks.
///
/// Writing never blocks: encoded frames are queued and written by a separate task, so code
///  holding a connection record's lock can send without doing I/O.
pub struct BoundTransport {
    id: TransportId,
    peer_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Bytes>,
    closed: watch::Sender<bool>,
    /// present for transport connections that were accepted by a listener
    accept_queue: Option<mpsc::UnboundedSender<ResilientSocket>>,
}

impl Debug for BoundTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoundTransport{{id:{}, peer:{:?}, closed:{}}}", self.id, self.peer_addr, self.is_closed())
    }
}

impl BoundTransport {
    pub fn spawn(
        id: TransportId,
        connection: TransportConnection,
        max_frame_len: usize,
        handler: Weak<dyn FrameHandler>,
        accept_queue: Option<mpsc::UnboundedSender<ResilientSocket>>,
    ) -> Arc<BoundTransport> {
        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let transport = Arc::new(BoundTransport {
            id,
            peer_addr: connection.peer_addr,
            outgoing,
            closed,
            accept_queue,
        });

        let span = tracing::debug_span!("transport", id, peer = ?connection.peer_addr);
        tokio::spawn(
            transport.clone().write_loop(connection.writer, outgoing_receiver, handler.clone())
                .instrument(span.clone())
        );
        tokio::spawn(
            transport.clone().read_loop(connection.reader, max_frame_len, handler)
                .instrument(span)
        );

        transport
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn accept_queue(&self) -> Option<&mpsc::UnboundedSender<ResilientSocket>> {
        self.accept_queue.as_ref()
    }

    pub fn is_accepted(&self) -> bool {
        self.accept_queue.is_some()
    }

    /// Encodes and queues a frame for sending. Returns `false` if the frame could not be
    ///  queued, i.e. the transport is closed or the frame is not encodable.
    pub fn send(&self, frame: &Frame) -> bool {
        if self.is_closed() {
            trace!("transport {} is closed, not sending {:?}", self.id, frame.command.kind());
            return false;
        }
        match encode_frame_to_bytes(frame) {
            Ok(raw) => {
                trace!("sending {:?} on transport {}", frame, self.id);
                self.outgoing.send(raw).is_ok()
            }
            Err(e) => {
                warn!("failed to encode {:?}: {}", frame.command.kind(), e);
                false
            }
        }
    }

    /// Stops reading. Frames that were queued before are still written before the writer
    ///  is shut down. Returns `false` if the transport was closed already.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            let was_open = !*closed;
            *closed = true;
            was_open
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && !self.outgoing.is_closed()
    }

    async fn write_loop(self: Arc<Self>, mut writer: TransportWriter, mut outgoing: mpsc::UnboundedReceiver<Bytes>, handler: Weak<dyn FrameHandler>) {
        let mut closed = self.closed.subscribe();

        loop {
            tokio::select! {
                raw = outgoing.recv() => {
                    let Some(raw) = raw else { break; };
                    if let Err(e) = writer.write_all(&raw).await {
                        debug!("write failed: {}", e);
                        self.report_failure(&handler);
                        return;
                    }
                }
                _ = wait_closed(&mut closed) => {
                    while let Ok(raw) = outgoing.try_recv() {
                        if writer.write_all(&raw).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }

        if let Err(e) = writer.shutdown().await {
            trace!("error shutting down transport writer: {}", e);
        }
        debug!("writer terminated");
    }

    async fn read_loop(self: Arc<Self>, mut reader: TransportReader, max_frame_len: usize, handler: Weak<dyn FrameHandler>) {
        let mut closed = self.closed.subscribe();

        loop {
            tokio::select! {
                frame = read_frame(&mut reader, max_frame_len) => {
                    match frame {
                        Ok(Some(frame)) => {
                            let Some(handler) = handler.upgrade() else { return; };
                            trace!("received {:?}", frame);
                            handler.on_frame(&self, frame);
                        }
                        Ok(None) => {
                            debug!("EOF on transport");
                            break;
                        }
                        Err(e) => {
                            warn!("transport failed: {}", e);
                            break;
                        }
                    }
                }
                _ = wait_closed(&mut closed) => {
                    debug!("reader terminated");
                    return;
                }
            }
        }

        self.report_failure(&handler);
    }

    fn report_failure(self: &Arc<Self>, handler: &Weak<dyn FrameHandler>) {
        if !self.close() {
            return;
        }
        if let Some(handler) = handler.upgrade() {
            handler.on_transport_failure(self);
        }
    }
}

/// Resolves once the transport is closed. The borrowed value is released right away, so callers
///  can await other things in a `select!` arm.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

#[cfg(test)]
impl BoundTransport {
    /// a transport without I/O tasks: sent frames end up in the returned receiver
    pub fn for_test(id: TransportId, accept_queue: Option<mpsc::UnboundedSender<ResilientSocket>>) -> (Arc<BoundTransport>, mpsc::UnboundedReceiver<Bytes>) {
        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let transport = Arc::new(BoundTransport {
            id,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 9)),
            outgoing,
            closed,
            accept_queue,
        });
        (transport, outgoing_receiver)
    }
}
