//! The boundary to the provider of raw byte-stream connections. The core makes no assumptions
//!  about a provider beyond reliable, ordered delivery while a connection is alive, and a clean
//!  failure signal (EOF or an I/O error) when it breaks.

pub mod tcp;
pub mod memory;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};

pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A freshly opened or accepted transport connection, split into its two directions
pub struct TransportConnection {
    pub reader: TransportReader,
    pub writer: TransportWriter,
    pub peer_addr: SocketAddr,
}
impl Debug for TransportConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportConnection{{peer_addr:{:?}}}", self.peer_addr)
    }
}

impl TransportConnection {
    pub fn new(reader: TransportReader, writer: TransportWriter, peer_addr: SocketAddr) -> TransportConnection {
        TransportConnection { reader, writer, peer_addr }
    }
}

/// Factory for transport connections. This is the seam for plugging in different kinds of
///  transport (and for mocking them away in tests).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<TransportConnection>;

    async fn listen(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn TransportListener>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<TransportConnection>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}
