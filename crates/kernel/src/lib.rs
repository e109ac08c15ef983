pub mod channel;
pub mod client;
pub mod error;
pub mod heartbeat;
pub mod iopub;
pub mod manager;
pub mod ports;
pub mod process;
pub mod shell;
pub mod socket;
pub mod wire;

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc;

pub use client::KernelClient;
pub use error::{ChannelError, KernelError, PortError, ShutdownAllError, WireError};
pub use manager::KernelManager;
pub use ports::PortPool;
pub use process::KernelLaunch;

pub type RequestId = String;

/// Loopback ports a kernel process binds its channels to.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KernelConfig {
    pub iopub_port: u16,
    pub shell_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hb_port: Option<u16>,
}

impl KernelConfig {
    pub fn new(iopub_port: u16, shell_port: u16) -> Self {
        Self {
            iopub_port,
            shell_port,
            hb_port: None,
        }
    }

    pub fn with_heartbeat(self, hb_port: u16) -> Self {
        Self {
            hb_port: Some(hb_port),
            ..self
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.iopub_port, self.shell_port];
        ports.extend(self.hb_port);
        ports
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub request_id: RequestId,
    pub code: String,
}

impl ExecuteRequest {
    pub fn new(request_id: impl Into<RequestId>, code: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            code: code.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteReply {
    pub success: bool,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_counter: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Result,
    Stdout,
    Stderr,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputData {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub mimetype_bundle: BTreeMap<String, String>,
    pub request_id: RequestId,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    Dead,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KernelStatus {
    pub status: ExecutionState,
    pub request_id: Option<RequestId>,
}

impl KernelStatus {
    /// The terminal status emitted once a kernel's process is gone.
    pub fn dead() -> Self {
        Self {
            status: ExecutionState::Dead,
            request_id: None,
        }
    }
}

/// Outbound queues a kernel delivers its decoded events to, one per event kind.
///
/// A kernel owns exactly one set of sinks for its whole lifetime; the matching
/// receivers belong to whoever created the kernel.
#[derive(Debug, Clone)]
pub struct EventSinks {
    pub execute_reply: mpsc::UnboundedSender<ExecuteReply>,
    pub kernel_status: mpsc::UnboundedSender<KernelStatus>,
    pub output_data: mpsc::UnboundedSender<OutputData>,
}

#[derive(Debug)]
pub struct EventStreams {
    pub execute_reply: mpsc::UnboundedReceiver<ExecuteReply>,
    pub kernel_status: mpsc::UnboundedReceiver<KernelStatus>,
    pub output_data: mpsc::UnboundedReceiver<OutputData>,
}

impl EventSinks {
    pub fn channel() -> (EventSinks, EventStreams) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let sinks = EventSinks {
            execute_reply: reply_tx,
            kernel_status: status_tx,
            output_data: output_tx,
        };
        let streams = EventStreams {
            execute_reply: reply_rx,
            kernel_status: status_rx,
            output_data: output_rx,
        };

        (sinks, streams)
    }
}
