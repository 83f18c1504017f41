use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio::{select, time};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bound_transport::{BoundTransport, FrameHandler, TransportId};
use crate::command::{Command, CommandKind, Frame};
use crate::config::ResilientConfig;
use crate::connection_id::ConnectionId;
use crate::connection_record::{ConnectionRecord, ConnectionState, RecordInner, Role};
use crate::packet_id::PacketId;
use crate::recovery::run_recovery;
use crate::retry_sender::{RetryEntry, RetrySender};
use crate::socket::{ResilientListener, ResilientSocket};
use crate::transport::{TransportConnection, TransportListener, TransportProvider};

#[derive(Default)]
struct Registry {
    records: FxHashMap<(Role, ConnectionId), Arc<ConnectionRecord>>,
    /// the record each transport connection is currently bound to
    by_transport: FxHashMap<TransportId, Arc<ConnectionRecord>>,
}

/// The context object owning all logical connections of a process (or of a part of it): it
///  dispatches incoming commands, drives the handshakes and detects transport failures.
///
/// Independent supervisors can coexist in a process, each with its own initiator id.
///
/// NB: Locks are always acquired in the order 'connection record, then registry', never the
///      other way around
pub struct Supervisor {
    myself: Weak<Supervisor>,
    initiator_id: Uuid,
    config: ResilientConfig,
    provider: Arc<dyn TransportProvider>,
    runtime: Handle,
    next_connection: AtomicU32,
    next_transport: AtomicU64,
    registry: Mutex<Registry>,
    retry_sender: Arc<RetrySender>,
    shutdown: watch::Sender<bool>,
}

impl Supervisor {
    /// Creates a supervisor and starts its background loops. This must be called from inside a
    ///  tokio runtime.
    pub fn new(provider: Arc<dyn TransportProvider>, config: ResilientConfig) -> anyhow::Result<Arc<Supervisor>> {
        config.validate()?;
        let runtime = Handle::try_current()?;

        let initiator_id = Uuid::new_v4();
        let (shutdown, _) = watch::channel(false);

        let supervisor = Arc::new_cyclic(|myself| Supervisor {
            myself: myself.clone(),
            initiator_id,
            config,
            provider,
            runtime,
            next_connection: AtomicU32::new(0),
            next_transport: AtomicU64::new(0),
            registry: Default::default(),
            retry_sender: Default::default(),
            shutdown,
        });

        let span = info_span!("supervisor", %initiator_id);
        supervisor.runtime.spawn(
            supervisor.retry_sender.clone().run(supervisor.config.retry_interval, supervisor.shutdown.subscribe())
                .instrument(span.clone())
        );
        supervisor.runtime.spawn(
            ack_loop(Arc::downgrade(&supervisor), supervisor.config.ack_interval, supervisor.shutdown.subscribe())
                .instrument(span)
        );

        info!("started supervisor {}", initiator_id);
        Ok(supervisor)
    }

    pub fn initiator_id(&self) -> Uuid {
        self.initiator_id
    }

    pub fn config(&self) -> &ResilientConfig {
        &self.config
    }

    pub(crate) fn provider(&self) -> &dyn TransportProvider {
        self.provider.as_ref()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn arc(&self) -> anyhow::Result<Arc<Supervisor>> {
        self.myself.upgrade()
            .ok_or_else(|| anyhow!("supervisor was dropped"))
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        let registry = self.registry();
        [Role::Initiator, Role::Acceptor].iter()
            .find_map(|role| registry.records.get(&(*role, id)))
            .map(|record| record.state())
    }

    /// the number of logical connections that are not closed yet
    pub fn connection_count(&self) -> usize {
        self.registry().records.len()
    }

    /// Opens a new logical connection and waits for its handshake to complete, for
    ///  [ResilientConfig::connect_timeout] at most. A transport failure during the handshake
    ///  is recovered like any other.
    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<ResilientSocket> {
        let connection = timeout(self.config.transport_connect_timeout, self.provider.connect(addr)).await
            .map_err(|_| anyhow!("timeout opening a transport connection to {:?}", addr))??;

        let id = ConnectionId {
            initiator: self.initiator_id,
            connection: self.next_connection.fetch_add(1, Ordering::Relaxed),
        };
        let record = Arc::new(ConnectionRecord::new(id, Role::Initiator, addr, ConnectionState::Initiating, self.config.ack_every_n_packets, None));
        self.registry().records.insert((Role::Initiator, id), record.clone());

        let transport = self.spawn_transport(connection, None);
        let incoming = {
            let mut inner = record.lock();
            self.bind(&record, &mut inner, &transport);
            self.send_with_retry(&record, &inner, Command::NewConnection, ConnectionState::Established);
            inner.incoming_receiver.take()
        };
        info!("connecting {:?} to {:?}", id, addr);

        let mut state = record.subscribe();
        let handshake = async {
            state.wait_for(|s| matches!(s, ConnectionState::Established | ConnectionState::Closed)).await
                .map(|s| *s)
                .unwrap_or(ConnectionState::Closed)
        };
        let reached = match self.config.connect_timeout {
            Some(connect_timeout) => timeout(connect_timeout, handshake).await.ok(),
            None => Some(handshake.await),
        };

        match (reached, incoming) {
            (Some(ConnectionState::Established), Some(incoming)) => Ok(ResilientSocket::new(self.arc()?, record, incoming)),
            (Some(_), _) => bail!("connection {:?} to {:?} was closed during the handshake", id, addr),
            (None, _) => {
                {
                    let mut inner = record.lock();
                    inner.send(Command::CloseConnection);
                    self.finish_close_locked(&record, &mut inner);
                }
                bail!("timeout establishing connection {:?} to {:?}", id, addr)
            }
        }
    }

    /// Starts accepting logical connections on the given address. The returned listener yields
    ///  each logical connection once, when it is first established.
    pub async fn listen(&self, addr: SocketAddr) -> anyhow::Result<ResilientListener> {
        let listener = self.provider.listen(addr).await?;
        let local_addr = listener.local_addr()?;
        let (accept_queue, incoming) = mpsc::unbounded_channel();

        self.runtime.spawn(
            accept_loop(self.myself.clone(), listener, accept_queue, self.shutdown.subscribe())
                .instrument(info_span!("listener", %local_addr))
        );
        info!("listening on {:?}", local_addr);
        Ok(ResilientListener::new(local_addr, incoming))
    }

    /// Stops all background loops and closes all logical connections without a close handshake
    pub fn shutdown(&self) {
        info!("shutting down supervisor {}", self.initiator_id);
        self.shutdown.send_replace(true);

        let records = self.registry().records.values().cloned().collect::<Vec<_>>();
        for record in records {
            self.finish_close(&record);
        }
    }

    pub(crate) fn spawn_transport(&self, connection: TransportConnection, accept_queue: Option<mpsc::UnboundedSender<ResilientSocket>>) -> Arc<BoundTransport> {
        let id = self.next_transport.fetch_add(1, Ordering::Relaxed);
        let handler: Weak<dyn FrameHandler> = self.myself.clone();
        BoundTransport::spawn(id, connection, self.config.max_frame_len, handler, accept_queue)
    }

    /// Makes `transport` the record's only transport, closing a previously bound one
    fn bind(&self, record: &Arc<ConnectionRecord>, inner: &mut RecordInner, transport: &Arc<BoundTransport>) {
        let previous = inner.transport.replace(transport.clone());
        inner.requested_resend_from = None;

        let mut registry = self.registry();
        if let Some(previous) = previous {
            if previous.id() != transport.id() {
                debug!("{:?}: replacing transport {} with {}", record.id(), previous.id(), transport.id());
                previous.close();
                registry.by_transport.remove(&previous.id());
            }
        }
        registry.by_transport.insert(transport.id(), record.clone());
    }

    fn unbind(&self, inner: &mut RecordInner) {
        if let Some(transport) = inner.transport.take() {
            transport.close();
            self.registry().by_transport.remove(&transport.id());
        }
    }

    fn send_with_retry(&self, record: &Arc<ConnectionRecord>, inner: &RecordInner, command: Command, exit_state: ConnectionState) {
        if let Some(transport) = &inner.transport {
            let frame = Frame::new(record.id(), command);
            transport.send(&frame);
            self.retry_sender.add(RetryEntry {
                record: record.clone(),
                frame,
                exit_state,
                transport: transport.clone(),
            });
        }
    }

    /// Binds a freshly opened transport connection to an initiator's record and starts the
    ///  re-join handshake. A connection that was never established starts over with
    ///  NEW_CONNECTION since the acceptor may not know it. Returns `false` if the record is
    ///  closed.
    pub(crate) fn begin_rejoin(&self, record: &Arc<ConnectionRecord>, transport: &Arc<BoundTransport>) -> bool {
        let mut inner = record.lock();
        if inner.state == ConnectionState::Closed {
            return false;
        }

        self.bind(record, &mut inner, transport);
        if inner.ever_established {
            record.set_state(&mut inner, ConnectionState::RejoinInitiating);
            self.send_with_retry(record, &inner, Command::JoinConnection, ConnectionState::Established);
        }
        else {
            record.set_state(&mut inner, ConnectionState::Initiating);
            self.send_with_retry(record, &inner, Command::NewConnection, ConnectionState::Established);
        }
        true
    }

    /// Gives up on a re-join attempt that did not complete in time
    pub(crate) fn abandon_rejoin(&self, record: &Arc<ConnectionRecord>, transport: &Arc<BoundTransport>) {
        let mut inner = record.lock();
        if !inner.is_bound_to(transport) || matches!(inner.state, ConnectionState::Established | ConnectionState::Closed) {
            return;
        }
        self.unbind(&mut inner);
        record.set_state(&mut inner, ConnectionState::Dead);
    }

    pub(crate) fn send_data(&self, record: &ConnectionRecord, payload: Bytes) -> anyhow::Result<()> {
        let mut inner = record.lock();
        if inner.state == ConnectionState::Closed || inner.locally_closing {
            bail!("connection {:?} is closed", record.id());
        }
        if inner.remote_closed {
            bail!("connection {:?} was closed by the peer", record.id());
        }
        if !inner.ever_established {
            bail!("connection {:?} is not connected yet", record.id());
        }
        inner.send_data(payload)?;
        Ok(())
    }

    /// Starts the close handshake without waiting for it to complete
    pub(crate) fn close(&self, record: &Arc<ConnectionRecord>) {
        let mut inner = record.lock();
        if inner.state == ConnectionState::Closed || inner.locally_closing {
            return;
        }
        inner.locally_closing = true;

        if inner.remote_closed {
            self.finish_close_locked(record, &mut inner);
            return;
        }
        if !inner.ever_established {
            inner.send(Command::CloseConnection);
            self.finish_close_locked(record, &mut inner);
            return;
        }

        info!("closing connection {:?}", record.id());
        if inner.state == ConnectionState::Established {
            inner.send(Command::CloseConnection);
        }
        drop(inner);

        match self.arc() {
            Ok(supervisor) => {
                self.runtime.spawn(
                    close_loop(supervisor, record.clone())
                        .instrument(info_span!("close", id = %record.id()))
                );
            }
            Err(_) => self.finish_close(record),
        }
    }

    pub(crate) fn finish_close(&self, record: &Arc<ConnectionRecord>) {
        let mut inner = record.lock();
        self.finish_close_locked(record, &mut inner);
    }

    fn finish_close_locked(&self, record: &Arc<ConnectionRecord>, inner: &mut RecordInner) {
        if inner.state == ConnectionState::Closed {
            return;
        }
        record.set_state(inner, ConnectionState::Closed);
        self.unbind(inner);
        inner.incoming = None;
        inner.incoming_receiver = None;
        inner.accept_queue = None;
        inner.send_buffer.clear();

        self.registry().records.remove(&(record.role(), record.id()));
        record.close_ack().notify_one();
        info!("connection {:?} closed", record.id());
    }

    fn established(&self, record: &Arc<ConnectionRecord>, inner: &mut RecordInner) {
        record.set_state(inner, ConnectionState::Established);
        inner.requested_resend_from = None;

        if inner.ever_established {
            info!("connection {:?} re-joined", record.id());
            return;
        }
        inner.ever_established = true;
        info!("connection {:?} established", record.id());

        if let (Some(accept_queue), Some(incoming)) = (inner.accept_queue.take(), inner.incoming_receiver.take()) {
            match self.arc() {
                Ok(supervisor) => {
                    if accept_queue.send(ResilientSocket::new(supervisor, record.clone(), incoming)).is_err() {
                        debug!("listener for {:?} is gone", record.id());
                    }
                }
                Err(e) => warn!("can not hand over {:?}: {}", record.id(), e),
            }
        }
    }

    fn on_new_connection(&self, transport: &Arc<BoundTransport>, id: ConnectionId) {
        let Some(accept_queue) = transport.accept_queue() else {
            warn!("received NEW_CONNECTION for {:?} on an outgoing transport connection - ignoring", id);
            return;
        };

        let record = self.registry().records.entry((Role::Acceptor, id))
            .or_insert_with(|| {
                info!("incoming connection {:?} from {:?}", id, transport.peer_addr());
                Arc::new(ConnectionRecord::new(id, Role::Acceptor, transport.peer_addr(), ConnectionState::Accepting, self.config.ack_every_n_packets, Some(accept_queue.clone())))
            })
            .clone();

        let mut inner = record.lock();
        match inner.state {
            ConnectionState::Accepting => {}
            ConnectionState::Dead | ConnectionState::RejoinAccepting if !inner.ever_established => {}
            ConnectionState::Established if inner.is_bound_to(transport) => {
                inner.send(Command::Acknowledge { acked: CommandKind::NewConnection, param: 1 });
                return;
            }
            state => {
                debug!("ignoring NEW_CONNECTION for {:?} in state {:?}", id, state);
                return;
            }
        }

        self.bind(&record, &mut inner, transport);
        record.set_state(&mut inner, ConnectionState::Accepting);
        inner.send(Command::Acknowledge { acked: CommandKind::NewConnection, param: 1 });
    }

    fn on_join_connection(&self, transport: &Arc<BoundTransport>, id: ConnectionId) {
        if !transport.is_accepted() {
            warn!("received JOIN_CONNECTION for {:?} on an outgoing transport connection - ignoring", id);
            return;
        }

        let record = self.registry().records.get(&(Role::Acceptor, id)).cloned();
        let Some(record) = record else {
            info!("rejecting JOIN_CONNECTION for unknown connection {:?}", id);
            transport.send(&Frame::new(id, Command::CloseConnection));
            return;
        };

        let mut inner = record.lock();
        match inner.state {
            ConnectionState::Closed => {
                transport.send(&Frame::new(id, Command::CloseConnection));
                return;
            }
            ConnectionState::Established | ConnectionState::RejoinAccepting if inner.is_bound_to(transport) => {
                inner.send(Command::Acknowledge { acked: CommandKind::JoinConnection, param: 1 });
                return;
            }
            _ => {}
        }

        info!("re-joining connection {:?} from {:?}", id, transport.peer_addr());
        self.bind(&record, &mut inner, transport);
        inner.resync_pending = true;
        record.set_state(&mut inner, ConnectionState::RejoinAccepting);
        inner.send(Command::Acknowledge { acked: CommandKind::JoinConnection, param: 1 });
    }

    fn on_acknowledge(&self, record: &Arc<ConnectionRecord>, inner: &mut RecordInner, acked: CommandKind, param: u32) {
        use ConnectionState::*;

        match (acked, param, record.role()) {
            (CommandKind::NewConnection, 1, Role::Initiator) => match inner.state {
                Initiating => {
                    inner.send(Command::Acknowledge { acked: CommandKind::NewConnection, param: 2 });
                    self.established(record, inner);
                }
                Established => {
                    inner.send(Command::Acknowledge { acked: CommandKind::NewConnection, param: 2 });
                }
                state => debug!("{:?}: ignoring first NEW_CONNECTION acknowledgement in state {:?}", record.id(), state),
            }
            (CommandKind::NewConnection, 2, Role::Acceptor) => match inner.state {
                Accepting => self.established(record, inner),
                state => debug!("{:?}: ignoring second NEW_CONNECTION acknowledgement in state {:?}", record.id(), state),
            }
            (CommandKind::JoinConnection, 1, Role::Initiator) => match inner.state {
                RejoinInitiating => {
                    inner.send(Command::Acknowledge { acked: CommandKind::JoinConnection, param: 2 });
                    self.established(record, inner);
                }
                Established => {
                    inner.send(Command::Acknowledge { acked: CommandKind::JoinConnection, param: 2 });
                }
                state => debug!("{:?}: ignoring first JOIN_CONNECTION acknowledgement in state {:?}", record.id(), state),
            }
            (CommandKind::JoinConnection, 2, Role::Acceptor) => match inner.state {
                RejoinAccepting => {
                    self.established(record, inner);
                    if inner.resync_pending {
                        inner.resync_pending = false;
                        let first_missing = inner.next_expected;
                        inner.send(Command::DataRequestOnReconnect { first_missing });
                    }
                }
                state => debug!("{:?}: ignoring second JOIN_CONNECTION acknowledgement in state {:?}", record.id(), state),
            }
            (CommandKind::CloseConnection, _, _) => {
                if !inner.locally_closing {
                    debug!("{:?}: ignoring unsolicited CLOSE_CONNECTION acknowledgement", record.id());
                }
                else if !inner.close_acknowledged {
                    inner.close_acknowledged = true;
                    record.close_ack().notify_one();
                }
            }
            (CommandKind::DataRequestOnReconnect, first_missing, _) => {
                inner.resend_from(PacketId::from_raw(first_missing));
            }
            (acked, param, role) => {
                warn!("{:?}: unexpected acknowledgement for {:?} with parameter {} as {:?} in state {:?} - ignoring", record.id(), acked, param, role, inner.state);
            }
        }
    }

    fn on_close_connection(&self, record: &Arc<ConnectionRecord>, inner: &mut RecordInner) {
        inner.send(Command::Acknowledge { acked: CommandKind::CloseConnection, param: 0 });

        if inner.state != ConnectionState::Established {
            // no handshake completed on this transport connection, the peer rejected it
            info!("connection {:?} was rejected by the peer", record.id());
            self.finish_close_locked(record, inner);
            return;
        }

        if !inner.remote_closed {
            info!("connection {:?} was closed by the peer", record.id());
            inner.remote_closed = true;
        }
        if !inner.force_close_started {
            inner.force_close_started = true;
            if let Ok(supervisor) = self.arc() {
                let span = info_span!("force_close", id = %record.id());
                let record = record.clone();
                let grace_period = self.config.close_grace_period;
                self.runtime.spawn(async move {
                    time::sleep(grace_period).await;
                    supervisor.finish_close(&record);
                }.instrument(span));
            }
        }
    }

    fn on_connection_command(&self, record: &Arc<ConnectionRecord>, transport: &Arc<BoundTransport>, command: Command) {
        let mut inner = record.lock();
        if !inner.is_bound_to(transport) {
            debug!("{:?}: ignoring {:?} from stale transport {}", record.id(), command.kind(), transport.id());
            return;
        }
        if inner.state == ConnectionState::Closed {
            return;
        }

        match command {
            Command::CloseConnection => self.on_close_connection(record, &mut inner),
            Command::Acknowledge { acked, param } => self.on_acknowledge(record, &mut inner, acked, param),
            Command::Data { packet_id, payload } => {
                inner.on_data(packet_id, payload);
            }
            Command::DataReceived { last_packet_id } => inner.on_data_received(last_packet_id),
            Command::DataRequest { first_missing } => {
                inner.resend_from(first_missing);
            }
            Command::DataRequestOnReconnect { first_missing } => {
                inner.resend_from(first_missing);
                let next_expected = inner.next_expected;
                inner.send(Command::Acknowledge { acked: CommandKind::DataRequestOnReconnect, param: next_expected.to_raw() });
            }
            Command::NewConnection | Command::JoinConnection => {
                warn!("{:?}: unexpected {:?}", record.id(), command.kind());
            }
        }
    }

    /// The record a transport is bound to, if the frame belongs to it
    fn bound_record(&self, transport: &BoundTransport, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        let record = self.registry().by_transport.get(&transport.id()).cloned();
        match record {
            None => {
                debug!("received a frame for {:?} on unbound transport {} - ignoring", id, transport.id());
                None
            }
            Some(record) if record.id() != id => {
                warn!("received a frame for {:?} on a transport bound to {:?} - ignoring", id, record.id());
                None
            }
            Some(record) => Some(record),
        }
    }

    fn send_due_acks(&self) {
        let records = self.registry().records.values().cloned().collect::<Vec<_>>();
        for record in records {
            record.lock().ack_if_due();
        }
    }
}

impl FrameHandler for Supervisor {
    fn on_frame(&self, transport: &Arc<BoundTransport>, frame: Frame) {
        match frame.command {
            Command::NewConnection => self.on_new_connection(transport, frame.connection_id),
            Command::JoinConnection => self.on_join_connection(transport, frame.connection_id),
            command => {
                if let Some(record) = self.bound_record(transport, frame.connection_id) {
                    self.on_connection_command(&record, transport, command);
                }
            }
        }
    }

    fn on_transport_failure(&self, transport: &Arc<BoundTransport>) {
        let record = self.registry().by_transport.remove(&transport.id());
        let Some(record) = record else {
            debug!("unbound transport {} terminated", transport.id());
            return;
        };

        let mut inner = record.lock();
        if !inner.is_bound_to(transport) {
            return;
        }
        if inner.remote_closed {
            self.finish_close_locked(&record, &mut inner);
            return;
        }
        if record.role() == Role::Acceptor && !inner.ever_established {
            // the initiator starts over with NEW_CONNECTION, nothing can re-join this record
            info!("transport connection of {:?} failed during the handshake, discarding it", record.id());
            self.finish_close_locked(&record, &mut inner);
            return;
        }

        warn!("transport connection of {:?} failed", record.id());
        inner.transport = None;
        record.set_state(&mut inner, ConnectionState::Dead);

        if record.role() == Role::Initiator && !inner.recovery_active {
            if let Ok(supervisor) = self.arc() {
                inner.recovery_active = true;
                self.runtime.spawn(
                    run_recovery(supervisor, record.clone())
                        .instrument(info_span!("recovery", id = %record.id()))
                );
            }
        }
    }
}

async fn close_loop(supervisor: Arc<Supervisor>, record: Arc<ConnectionRecord>) {
    let deadline = Instant::now() + supervisor.config.close_timeout;

    loop {
        select! {
            _ = record.close_ack().notified() => {}
            _ = time::sleep(supervisor.config.close_retry_interval) => {}
            _ = time::sleep_until(deadline) => {
                warn!("closing {:?} was not acknowledged in time - closing locally", record.id());
                break;
            }
        }

        let done = {
            let inner = record.lock();
            if inner.state == ConnectionState::Closed || inner.close_acknowledged {
                true
            }
            else {
                if inner.state == ConnectionState::Established {
                    debug!("re-sending CLOSE_CONNECTION");
                    inner.send(Command::CloseConnection);
                }
                false
            }
        };
        if done {
            break;
        }
    }

    supervisor.finish_close(&record);
}

async fn accept_loop(
    supervisor: Weak<Supervisor>,
    listener: Box<dyn TransportListener>,
    accept_queue: mpsc::UnboundedSender<ResilientSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        select! {
            connection = listener.accept() => {
                match connection {
                    Ok(connection) => {
                        let Some(supervisor) = supervisor.upgrade() else { break; };
                        debug!("accepted transport connection from {:?}", connection.peer_addr);
                        supervisor.spawn_transport(connection, Some(accept_queue.clone()));
                    }
                    Err(e) => {
                        warn!("accepting transport connections failed: {}", e);
                        break;
                    }
                }
            }
            _ = accept_queue.closed() => {
                debug!("listener was dropped");
                break;
            }
            _ = shutdown.wait_for(|s| *s) => break,
        }
    }
    debug!("accept loop terminated");
}

async fn ack_loop(supervisor: Weak<Supervisor>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = time::interval(interval);
    // the first tick completes immediately
    ticks.tick().await;

    loop {
        select! {
            _ = ticks.tick() => {
                let Some(supervisor) = supervisor.upgrade() else { break; };
                supervisor.send_due_acks();
            }
            _ = shutdown.wait_for(|s| *s) => break,
        }
    }
    debug!("ack loop terminated");
}
