use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;
use uuid::Uuid;

use crate::command::{encode_frame_to_bytes, Command, Frame};
use crate::config::ResilientConfig;
use crate::connection_id::ConnectionId;
use crate::connection_record::ConnectionState;
use crate::frame_reader::read_frame;
use crate::socket::{ResilientListener, ResilientSocket};
use crate::supervisor::Supervisor;
use crate::transport::memory::MemoryTransportProvider;
use crate::transport::TransportConnection;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// short intervals and timeouts, so that tests do not wait for long
pub fn test_config() -> ResilientConfig {
    ResilientConfig {
        retry_interval: Duration::from_millis(100),
        connect_timeout: Some(Duration::from_secs(5)),
        transport_connect_timeout: Duration::from_secs(1),
        rejoin_attempt_timeout: Duration::from_millis(500),
        recovery_backoff: Duration::from_millis(50),
        max_recovery_attempts: None,
        close_retry_interval: Duration::from_millis(200),
        close_grace_period: Duration::from_millis(500),
        close_timeout: Duration::from_secs(5),
        ack_interval: Duration::from_millis(20),
        ack_every_n_packets: 16,
        max_payload_len: 1024,
        max_frame_len: 64*1024,
    }
}

pub fn test_connection_id(connection: u32) -> ConnectionId {
    ConnectionId {
        initiator: Uuid::from_u128(0x1234_5678),
        connection,
    }
}

/// Two supervisors connected over an in-memory network, with one established logical
///  connection between them
pub struct ConnectedPair {
    pub provider: MemoryTransportProvider,
    pub client: Arc<Supervisor>,
    pub server: Arc<Supervisor>,
    pub listener: ResilientListener,
    pub initiator: ResilientSocket,
    pub acceptor: ResilientSocket,
}

pub async fn connected_pair(config: ResilientConfig) -> ConnectedPair {
    let provider = MemoryTransportProvider::new();
    let server = Supervisor::new(Arc::new(provider.clone()), config.clone()).unwrap();
    let client = Supervisor::new(Arc::new(provider.clone()), config).unwrap();

    let mut listener = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr();
    let (initiator, acceptor) = tokio::join!(
        client.connect(addr),
        listener.accept(),
    );

    ConnectedPair {
        provider,
        client,
        server,
        listener,
        initiator: initiator.unwrap(),
        acceptor: acceptor.unwrap(),
    }
}

pub async fn read_exactly(socket: &mut ResilientSocket, len: usize) -> Vec<u8> {
    let mut result = vec![0u8; len];
    let mut num_read = 0;
    while num_read < len {
        let n = timeout(TEST_TIMEOUT, socket.read(&mut result[num_read..])).await
            .expect("timeout reading from socket")
            .unwrap();
        assert!(n > 0, "unexpected EOF after {} bytes", num_read);
        num_read += n;
    }
    result
}

pub async fn wait_for_state(socket: &ResilientSocket, state: ConnectionState) {
    let mut states = socket.state_changes();
    timeout(TEST_TIMEOUT, states.wait_for(|s| *s == state)).await
        .unwrap_or_else(|_| panic!("timeout waiting for {:?}, state is {:?}", state, socket.state()))
        .unwrap();
}

/// Plays the remote side of a transport connection frame by frame
pub struct ScriptedPeer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
}

impl ScriptedPeer {
    /// returns the local end of the transport connection, to be handed to a supervisor
    pub fn connect(peer_addr: SocketAddr) -> (TransportConnection, ScriptedPeer) {
        let (local, remote) = tokio::io::duplex(64*1024);
        let (local_reader, local_writer) = tokio::io::split(local);
        let (reader, writer) = tokio::io::split(remote);

        let connection = TransportConnection::new(Box::new(local_reader), Box::new(local_writer), peer_addr);
        (connection, ScriptedPeer { reader, writer })
    }

    pub async fn send(&mut self, connection_id: ConnectionId, command: Command) {
        let raw = encode_frame_to_bytes(&Frame::new(connection_id, command)).unwrap();
        self.writer.write_all(&raw).await.unwrap();
    }

    pub async fn send_raw(&mut self, raw: &[u8]) {
        self.writer.write_all(raw).await.unwrap();
    }

    /// the next frame, or `None` if the supervisor closed the transport connection
    pub async fn try_receive(&mut self) -> Option<Frame> {
        timeout(TEST_TIMEOUT, read_frame(&mut self.reader, usize::MAX)).await
            .expect("timeout waiting for a frame")
            .unwrap()
    }

    pub async fn receive(&mut self) -> Frame {
        self.try_receive().await
            .expect("unexpected EOF")
    }

    pub async fn receive_command(&mut self) -> Command {
        self.receive().await.command
    }

    /// skips the periodic DATA_RECEIVED acknowledgements
    pub async fn receive_control(&mut self) -> Command {
        loop {
            match self.receive_command().await {
                Command::DataReceived { .. } => continue,
                command => return command,
            }
        }
    }

    pub async fn expect_eof(&mut self) {
        assert_eq!(self.try_receive().await, None);
    }

    pub async fn expect_silence(&mut self, duration: Duration) {
        if let Ok(frame) = timeout(duration, read_frame(&mut self.reader, usize::MAX)).await {
            panic!("expected no frame, received {:?}", frame);
        }
    }
}
