use std::{io, time::Duration};

use thiserror::Error;

use crate::{channel::ChannelName, RequestId};

#[derive(Error, Debug)]
pub enum WireError {
    #[error("message has no <IDS|MSG> delimiter frame")]
    MissingDelimiter,
    #[error("message is missing its {0} frame")]
    MissingFrame(&'static str),
    #[error("invalid JSON in {frame} frame: {source}")]
    Json {
        frame: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("message has no frames")]
    Empty,
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("{0} channel is not connected")]
    NotConnected(ChannelName),
    #[error("{0} channel cannot send messages")]
    SendUnsupported(ChannelName),
    #[error("{0} channel has been closed")]
    Closed(ChannelName),
    #[error("{0} channel transport failed: {1}")]
    Transport(ChannelName, #[source] zeromq::ZmqError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port left in {start}..{end}")]
    Exhausted { start: u16, end: u16 },
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("kernel {0} already exists")]
    Duplicate(String),
    #[error("no kernel exists with id {0}")]
    NotFound(String),
    #[error("kernel {0} has not been started")]
    NotStarted(String),
    #[error("kernel {0} has already been started")]
    AlreadyStarted(String),
    #[error("request {request_id} was already issued to kernel {kernel_id}")]
    DuplicateRequest {
        kernel_id: String,
        request_id: RequestId,
    },
    #[error("failed to spawn kernel {kernel_id}: {source}")]
    Spawn {
        kernel_id: String,
        #[source]
        source: io::Error,
    },
    #[error("kernel {kernel_id} did not accept channel connections within {timeout:?}")]
    ConnectTimeout { kernel_id: String, timeout: Duration },
    #[error("failed to shut down kernel {kernel_id}: {reason}")]
    Shutdown { kernel_id: String, reason: String },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Failures collected while shutting down every registered kernel.
#[derive(Error, Debug)]
#[error("{} kernel(s) failed to shut down", failures.len())]
pub struct ShutdownAllError {
    pub failures: Vec<(String, KernelError)>,
}
