use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use zeromq::{
    util::PeerIdentity, DealerSocket, ReqSocket, Socket, SocketOptions, SocketRecv, SocketSend,
    SubSocket, ZmqError, ZmqMessage,
};

#[derive(Error, Debug)]
pub enum SocketError {
    #[error(transparent)]
    Zmq(#[from] ZmqError),
    #[error("socket pattern is receive-only")]
    SendUnsupported,
}

/// The socket pattern behind one channel. Shell talks through a DEALER to the
/// kernel's ROUTER, iopub subscribes to the kernel's PUB, heartbeat is a
/// plain REQ/REP exchange.
#[async_trait]
pub trait ChannelSocket: Send + Sized + 'static {
    fn create(identity: &str) -> Result<Self, SocketError>;
    async fn connect(&mut self, endpoint: &str) -> Result<(), SocketError>;
    async fn send(&mut self, message: ZmqMessage) -> Result<(), SocketError>;
    async fn recv(&mut self) -> Result<ZmqMessage, SocketError>;
    async fn close(self) -> Vec<ZmqError>;
}

#[async_trait]
impl ChannelSocket for DealerSocket {
    fn create(identity: &str) -> Result<Self, SocketError> {
        let mut options = SocketOptions::default();
        options.peer_identity(PeerIdentity::from_str(identity)?);
        Ok(DealerSocket::with_options(options))
    }

    async fn connect(&mut self, endpoint: &str) -> Result<(), SocketError> {
        Ok(Socket::connect(self, endpoint).await?)
    }

    async fn send(&mut self, message: ZmqMessage) -> Result<(), SocketError> {
        Ok(SocketSend::send(self, message).await?)
    }

    async fn recv(&mut self) -> Result<ZmqMessage, SocketError> {
        Ok(SocketRecv::recv(self).await?)
    }

    async fn close(self) -> Vec<ZmqError> {
        Socket::close(self).await
    }
}

#[async_trait]
impl ChannelSocket for SubSocket {
    fn create(_identity: &str) -> Result<Self, SocketError> {
        Ok(SubSocket::new())
    }

    async fn connect(&mut self, endpoint: &str) -> Result<(), SocketError> {
        Socket::connect(self, endpoint).await?;
        // No topic filtering; every published message is delivered.
        self.subscribe("").await?;
        Ok(())
    }

    async fn send(&mut self, _message: ZmqMessage) -> Result<(), SocketError> {
        Err(SocketError::SendUnsupported)
    }

    async fn recv(&mut self) -> Result<ZmqMessage, SocketError> {
        Ok(SocketRecv::recv(self).await?)
    }

    async fn close(self) -> Vec<ZmqError> {
        Socket::close(self).await
    }
}

#[async_trait]
impl ChannelSocket for ReqSocket {
    fn create(_identity: &str) -> Result<Self, SocketError> {
        Ok(ReqSocket::new())
    }

    async fn connect(&mut self, endpoint: &str) -> Result<(), SocketError> {
        Ok(Socket::connect(self, endpoint).await?)
    }

    async fn send(&mut self, message: ZmqMessage) -> Result<(), SocketError> {
        Ok(SocketSend::send(self, message).await?)
    }

    async fn recv(&mut self) -> Result<ZmqMessage, SocketError> {
        Ok(SocketRecv::recv(self).await?)
    }

    async fn close(self) -> Vec<ZmqError> {
        Socket::close(self).await
    }
}
