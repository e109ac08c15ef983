use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use zeromq::SubSocket;

use crate::{
    channel::{self, Channel, ChannelClient, ChannelHandle},
    client::DeathSignal,
    error::{ChannelError, WireError},
    wire::{MessageKind, WireMessage},
    ExecutionState, KernelStatus, OutputData, OutputKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoPubEvent {
    Status(KernelStatus),
    Output(OutputData),
}

#[derive(Deserialize)]
struct MimeBundleContent {
    #[serde(default)]
    data: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum PublishedState {
    Busy,
    Idle,
    Starting,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: PublishedState,
}

#[derive(Deserialize)]
struct StreamContent {
    name: String,
    #[serde(alias = "data")]
    text: String,
}

/// Translates one published message into an event. Messages that carry no
/// event (swallowed duplicates, unknown types, orphans) yield `Ok(None)`.
pub fn decode(message: &WireMessage) -> Result<Option<IoPubEvent>, WireError> {
    let request_id = message.parent_msg_id().map(str::to_string);

    match message.kind() {
        MessageKind::DisplayData | MessageKind::ExecuteResult => {
            let Some(request_id) = request_id else {
                warn!(msg_type = %message.header.msg_type, "dropping output without parent header");
                return Ok(None);
            };
            let content: MimeBundleContent = message.content_as()?;

            Ok(Some(IoPubEvent::Output(OutputData {
                kind: OutputKind::Result,
                mimetype_bundle: mimetype_bundle(content.data),
                request_id,
            })))
        }
        MessageKind::Status => {
            let content: StatusContent = message.content_as()?;
            let status = match content.execution_state {
                PublishedState::Busy => ExecutionState::Busy,
                PublishedState::Idle => ExecutionState::Idle,
                PublishedState::Starting => ExecutionState::Starting,
                PublishedState::Other => {
                    debug!("ignoring unknown execution state");
                    return Ok(None);
                }
            };

            Ok(Some(IoPubEvent::Status(KernelStatus { status, request_id })))
        }
        MessageKind::Stream => {
            let Some(request_id) = request_id else {
                warn!("dropping stream output without parent header");
                return Ok(None);
            };
            let content: StreamContent = message.content_as()?;
            let kind = match content.name.as_str() {
                "stdout" => OutputKind::Stdout,
                "stderr" => OutputKind::Stderr,
                other => {
                    warn!(stream = other, "ignoring output on unknown stream");
                    return Ok(None);
                }
            };

            Ok(Some(IoPubEvent::Output(OutputData {
                kind,
                mimetype_bundle: BTreeMap::from([("text/plain".to_string(), content.text)]),
                request_id,
            })))
        }
        // Error details are reported once, through the shell execute_reply.
        MessageKind::ExecuteInput | MessageKind::Error => {
            trace!(msg_type = %message.header.msg_type, "swallowing iopub message");
            Ok(None)
        }
        MessageKind::ExecuteRequest | MessageKind::ExecuteReply | MessageKind::Other => {
            warn!(msg_type = %message.header.msg_type, "ignoring iopub message");
            Ok(None)
        }
    }
}

fn mimetype_bundle(data: Map<String, Value>) -> BTreeMap<String, String> {
    data.into_iter()
        .map(|(mimetype, value)| {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (mimetype, value)
        })
        .collect()
}

pub struct IoPubChannel {
    status: mpsc::UnboundedSender<KernelStatus>,
    output: mpsc::UnboundedSender<OutputData>,
    death: DeathSignal,
}

impl IoPubChannel {
    pub fn new(
        status: mpsc::UnboundedSender<KernelStatus>,
        output: mpsc::UnboundedSender<OutputData>,
        death: DeathSignal,
    ) -> Self {
        Self {
            status,
            output,
            death,
        }
    }
}

impl Channel for IoPubChannel {
    fn receive(&mut self, message: WireMessage) {
        match decode(&message) {
            Ok(Some(IoPubEvent::Status(status))) => {
                debug!(status = ?status.status, request_id = ?status.request_id, "kernel status");
                let _ = self.status.send(status);
            }
            Ok(Some(IoPubEvent::Output(output))) => {
                debug!(kind = ?output.kind, request_id = %output.request_id, "kernel output");
                let _ = self.output.send(output);
            }
            Ok(None) => {}
            Err(e) => warn!(msg_type = %message.header.msg_type, "dropping malformed iopub message: {e}"),
        }
    }

    fn disconnected(&mut self, _error: &ChannelError) {
        self.death.fire("iopub channel disconnected");
    }
}

/// Connects the subscriber socket and starts dispatching published messages.
pub async fn connect(
    client: ChannelClient<SubSocket>,
    channel: IoPubChannel,
) -> Result<ChannelHandle, ChannelError> {
    channel::open(client, channel).await
}
