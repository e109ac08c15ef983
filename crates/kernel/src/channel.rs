use std::fmt;

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task,
};
use tracing::{debug, error, trace, warn, Instrument};
use zeromq::ZmqMessage;

use crate::{
    error::{ChannelError, WireError},
    socket::{ChannelSocket, SocketError},
    wire::WireMessage,
};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelName {
    Shell,
    IoPub,
    Heartbeat,
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelName::Shell => write!(f, "shell"),
            ChannelName::IoPub => write!(f, "iopub"),
            ChannelName::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// One socket bound to one logical channel of one kernel.
pub struct ChannelClient<S> {
    name: ChannelName,
    endpoint: String,
    identity: String,
    socket: Option<S>,
}

impl<S: ChannelSocket> ChannelClient<S> {
    pub fn new(name: ChannelName, connection_url: &str, port: u16, identity: &str) -> Self {
        Self {
            name,
            endpoint: format!("{connection_url}:{port}"),
            identity: identity.to_string(),
            socket: None,
        }
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Creates the socket on first use and connects it. Connecting an already
    /// connected channel does nothing.
    pub async fn connect(&mut self) -> Result<(), ChannelError> {
        if self.socket.is_some() {
            return Ok(());
        }

        let mut socket = S::create(&self.identity).map_err(|e| self.socket_error(e))?;
        socket
            .connect(&self.endpoint)
            .await
            .map_err(|e| self.socket_error(e))?;

        debug!(channel = %self.name, endpoint = %self.endpoint, "channel connected");
        self.socket = Some(socket);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), ChannelError> {
        let socket = self
            .socket
            .take()
            .ok_or(ChannelError::NotConnected(self.name))?;

        for e in socket.close().await {
            debug!(channel = %self.name, "error while closing socket: {e}");
        }

        debug!(channel = %self.name, "channel disconnected");
        Ok(())
    }

    /// Sends all `parts` as a single multi-part message.
    pub async fn send(&mut self, parts: Vec<Bytes>) -> Result<(), ChannelError> {
        let name = self.name;
        let socket = self
            .socket
            .as_mut()
            .ok_or(ChannelError::NotConnected(name))?;
        let message = ZmqMessage::try_from(parts).map_err(|_| WireError::Empty)?;

        socket
            .send(message)
            .await
            .map_err(|e| socket_error(name, e))
    }

    pub async fn recv(&mut self) -> Result<ZmqMessage, ChannelError> {
        let name = self.name;
        let socket = self
            .socket
            .as_mut()
            .ok_or(ChannelError::NotConnected(name))?;

        socket.recv().await.map_err(|e| socket_error(name, e))
    }

    fn socket_error(&self, error: SocketError) -> ChannelError {
        socket_error(self.name, error)
    }
}

fn socket_error(name: ChannelName, error: SocketError) -> ChannelError {
    match error {
        SocketError::Zmq(e) => ChannelError::Transport(name, e),
        SocketError::SendUnsupported => ChannelError::SendUnsupported(name),
    }
}

/// Per-channel decoding of inbound messages.
pub trait Channel: Send + 'static {
    fn receive(&mut self, message: WireMessage);

    /// The transport failed underneath a connected channel; no further
    /// messages will arrive.
    fn disconnected(&mut self, _error: &ChannelError) {}
}

enum Command {
    Send {
        parts: Vec<Bytes>,
        responds_to: oneshot::Sender<Result<(), ChannelError>>,
    },
    Disconnect {
        responds_to: oneshot::Sender<Result<(), ChannelError>>,
    },
}

/// Sending side of a channel whose socket is owned by a background task.
#[derive(Clone)]
pub struct ChannelHandle {
    name: ChannelName,
    sender: mpsc::Sender<Command>,
}

impl ChannelHandle {
    pub async fn send(&self, message: WireMessage) -> Result<(), ChannelError> {
        let parts = message.into_frames()?;
        let (responds_to, response) = oneshot::channel();

        self.request(Command::Send { parts, responds_to }, response)
            .await
    }

    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        let (responds_to, response) = oneshot::channel();

        self.request(Command::Disconnect { responds_to }, response)
            .await
    }

    async fn request(
        &self,
        command: Command,
        response: oneshot::Receiver<Result<(), ChannelError>>,
    ) -> Result<(), ChannelError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| ChannelError::Closed(self.name))?;

        response.await.map_err(|_| ChannelError::Closed(self.name))?
    }
}

/// Connects `client` and hands its socket to a task that feeds every inbound
/// message to `channel`.
pub async fn open<S, C>(
    mut client: ChannelClient<S>,
    channel: C,
) -> Result<ChannelHandle, ChannelError>
where
    S: ChannelSocket,
    C: Channel,
{
    client.connect().await?;

    let name = client.name();
    let (sender, receiver) = mpsc::channel(COMMAND_CAPACITY);
    task::spawn(run_channel(client, channel, receiver).in_current_span());

    Ok(ChannelHandle { name, sender })
}

async fn run_channel<S, C>(
    mut client: ChannelClient<S>,
    mut channel: C,
    mut commands: mpsc::Receiver<Command>,
) where
    S: ChannelSocket,
    C: Channel,
{
    let name = client.name();

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::Send { parts, responds_to }) => {
                    let _ = responds_to.send(client.send(parts).await);
                }
                Some(Command::Disconnect { responds_to }) => {
                    let _ = responds_to.send(client.disconnect().await);
                    return;
                }
                None => {
                    let _ = client.disconnect().await;
                    return;
                }
            },
            received = client.recv() => match received {
                Ok(message) => dispatch(name, &mut channel, message),
                Err(e) => {
                    error!(channel = %name, "channel receive failed: {e}");
                    channel.disconnected(&e);
                    let _ = client.disconnect().await;
                    return;
                }
            },
        }
    }
}

fn dispatch<C: Channel>(name: ChannelName, channel: &mut C, message: ZmqMessage) {
    match WireMessage::try_from(message) {
        Ok(message) => {
            trace!(channel = %name, msg_type = %message.header.msg_type, "received message");
            channel.receive(message);
        }
        Err(e) => warn!(channel = %name, "dropping undecodable message: {e}"),
    }
}
