use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::transport::{TransportConnection, TransportListener, TransportProvider};

/// Transport connections over plain TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransportProvider;

impl TcpTransportProvider {
    fn wrap(stream: TcpStream) -> anyhow::Result<TransportConnection> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(TransportConnection::new(Box::new(reader), Box::new(writer), peer_addr))
    }
}

#[async_trait]
impl TransportProvider for TcpTransportProvider {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<TransportConnection> {
        debug!("opening TCP connection to {:?}", addr);
        let stream = TcpStream::connect(addr).await?;
        Self::wrap(stream)
    }

    async fn listen(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(addr).await?;
        info!("bound TCP listener to {:?}", listener.local_addr()?);
        Ok(Box::new(TcpTransportListener { listener }))
    }
}

struct TcpTransportListener {
    listener: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<TransportConnection> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("accepted TCP connection from {:?}", addr);
        TcpTransportProvider::wrap(stream)
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
