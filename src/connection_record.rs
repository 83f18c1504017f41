use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace};

use crate::bound_transport::BoundTransport;
use crate::command::{Command, Frame};
use crate::connection_id::ConnectionId;
use crate::packet_id::PacketId;
use crate::socket::ResilientSocket;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// NEW_CONNECTION was sent, waiting for the first acknowledgement
    Initiating,
    /// NEW_CONNECTION was received and acknowledged, waiting for the second acknowledgement
    Accepting,
    RejoinInitiating,
    RejoinAccepting,
    Established,
    /// the transport connection was lost and no re-join has started yet
    Dead,
    Closed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// What happened to an incoming DATA packet
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DataOutcome {
    Delivered,
    /// there is a gap before this packet, it was dropped
    Gap,
    Duplicate,
}

/// Everything the supervisor knows about one logical connection.
///
/// The mutable part lives behind a mutex, and the state is additionally published through a
///  `watch` channel so that tasks can wait for state changes without holding the lock.
pub struct ConnectionRecord {
    id: ConnectionId,
    role: Role,
    remote_addr: SocketAddr,
    inner: Mutex<RecordInner>,
    state: watch::Sender<ConnectionState>,
    close_ack: Notify,
}

impl Debug for ConnectionRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionRecord{{{:?} {:?} {:?}}}", self.id, self.role, self.state())
    }
}

impl ConnectionRecord {
    pub(crate) fn new(
        id: ConnectionId,
        role: Role,
        remote_addr: SocketAddr,
        initial_state: ConnectionState,
        ack_every_n_packets: u32,
        accept_queue: Option<mpsc::UnboundedSender<ResilientSocket>>,
    ) -> ConnectionRecord {
        let (incoming, incoming_receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(initial_state);

        ConnectionRecord {
            id,
            role,
            remote_addr,
            inner: Mutex::new(RecordInner {
                id,
                state: initial_state,
                transport: None,
                ever_established: false,
                accept_queue,
                next_send_id: PacketId::ZERO,
                next_expected: PacketId::ZERO,
                send_buffer: BTreeMap::new(),
                requested_resend_from: None,
                received_since_ack: 0,
                ack_every_n_packets,
                resync_pending: false,
                recovery_active: false,
                locally_closing: false,
                close_acknowledged: false,
                remote_closed: false,
                force_close_started: false,
                incoming: Some(incoming),
                incoming_receiver: Some(incoming_receiver),
            }),
            state,
            close_ack: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// For an initiator, this is the address to reconnect to
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// must be called with the record's lock held, i.e. passing the guarded data
    pub(crate) fn set_state(&self, inner: &mut RecordInner, new_state: ConnectionState) {
        if inner.state == new_state {
            return;
        }
        debug!("{:?}: {:?} -> {:?}", self.id, inner.state, new_state);
        inner.state = new_state;
        self.state.send_replace(new_state);
    }

    pub(crate) fn close_ack(&self) -> &Notify {
        &self.close_ack
    }
}

pub(crate) struct RecordInner {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub transport: Option<Arc<BoundTransport>>,
    pub ever_established: bool,
    /// taken on first establishment, so a connection is handed to `accept()` at most once
    pub accept_queue: Option<mpsc::UnboundedSender<ResilientSocket>>,

    pub next_send_id: PacketId,
    pub next_expected: PacketId,
    /// sent but not yet acknowledged, by packet id
    pub send_buffer: BTreeMap<PacketId, Bytes>,
    pub requested_resend_from: Option<PacketId>,
    pub received_since_ack: u32,
    pub ack_every_n_packets: u32,
    /// acceptor side: a re-join is in progress and DATA_REQUEST_ON_RECONNECT is still due
    pub resync_pending: bool,
    pub recovery_active: bool,

    pub locally_closing: bool,
    pub close_acknowledged: bool,
    pub remote_closed: bool,
    pub force_close_started: bool,

    pub incoming: Option<mpsc::UnboundedSender<Bytes>>,
    pub incoming_receiver: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl RecordInner {
    pub fn is_bound_to(&self, transport: &BoundTransport) -> bool {
        self.transport.as_ref()
            .map(|t| t.id() == transport.id())
            .unwrap_or(false)
    }

    /// Sends on the currently bound transport, if any
    pub fn send(&self, command: Command) -> bool {
        match &self.transport {
            Some(transport) => transport.send(&Frame::new(self.id, command)),
            None => {
                trace!("{:?}: no transport bound, not sending {:?}", self.id, command.kind());
                false
            }
        }
    }

    /// Assigns the next packet id and retains the payload until the peer acknowledges it. The
    ///  packet is sent right away only if the connection is established; otherwise it goes out
    ///  with the re-synchronization after the next re-join.
    pub fn send_data(&mut self, payload: Bytes) -> anyhow::Result<PacketId> {
        let packet_id = self.next_send_id;
        let Some(next) = packet_id.checked_next() else {
            bail!("packet ids of connection {:?} are exhausted", self.id);
        };
        self.next_send_id = next;
        self.send_buffer.insert(packet_id, payload.clone());

        if self.state == ConnectionState::Established {
            self.send(Command::Data { packet_id, payload });
        }
        Ok(packet_id)
    }

    pub fn on_data(&mut self, packet_id: PacketId, payload: Bytes) -> DataOutcome {
        if packet_id == self.next_expected {
            trace!("{:?}: delivering packet {}", self.id, packet_id);
            if let Some(incoming) = &self.incoming {
                // the application may have dropped its reader, which is fine
                let _ = incoming.send(payload);
            }
            self.next_expected = packet_id.next();
            self.requested_resend_from = None;

            self.received_since_ack += 1;
            if self.received_since_ack >= self.ack_every_n_packets {
                self.send_ack();
            }
            DataOutcome::Delivered
        }
        else if packet_id > self.next_expected {
            if self.requested_resend_from != Some(self.next_expected) {
                debug!("{:?}: received packet {}, but {} is missing - requesting resend", self.id, packet_id, self.next_expected);
                self.requested_resend_from = Some(self.next_expected);
                self.send(Command::DataRequest { first_missing: self.next_expected });
            }
            DataOutcome::Gap
        }
        else {
            trace!("{:?}: discarding duplicate packet {}", self.id, packet_id);
            DataOutcome::Duplicate
        }
    }

    /// Sends a cumulative acknowledgement if anything was received since the last one
    pub fn ack_if_due(&mut self) -> bool {
        if self.received_since_ack == 0 || self.state != ConnectionState::Established {
            return false;
        }
        self.send_ack()
    }

    fn send_ack(&mut self) -> bool {
        let Some(last_packet_id) = self.next_expected.prev() else {
            return false;
        };
        if self.send(Command::DataReceived { last_packet_id }) {
            self.received_since_ack = 0;
            true
        }
        else {
            false
        }
    }

    pub fn on_data_received(&mut self, last_packet_id: PacketId) {
        let retained = self.send_buffer.split_off(&last_packet_id.next());
        let num_pruned = self.send_buffer.len();
        self.send_buffer = retained;
        trace!("{:?}: peer acknowledged up to {}, pruned {} packets", self.id, last_packet_id, num_pruned);
    }

    /// Re-sends all retained packets starting at `first`, in packet id order. Returns the number
    ///  of packets re-sent.
    pub fn resend_from(&self, first: PacketId) -> usize {
        let mut num_resent = 0;
        for (packet_id, payload) in self.send_buffer.range(first..) {
            if !self.send(Command::Data { packet_id: *packet_id, payload: payload.clone() }) {
                break;
            }
            num_resent += 1;
        }
        debug!("{:?}: re-sent {} packets starting at {}", self.id, num_resent, first);
        num_resent
    }
}
