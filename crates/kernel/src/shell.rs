use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeromq::DealerSocket;

use crate::{
    channel::{self, Channel, ChannelClient, ChannelHandle},
    client::DeathSignal,
    error::{ChannelError, KernelError, WireError},
    wire::{Header, MessageKind, WireMessage},
    ExecuteReply, ExecuteRequest, RequestId,
};

/// Tracks request ids issued on one kernel: every id ever sent, and the ones
/// still waiting for their reply.
#[derive(Debug, Default)]
pub struct RequestLedger {
    issued: HashSet<RequestId>,
    outstanding: HashSet<RequestId>,
}

impl RequestLedger {
    /// Returns false if the id was issued before.
    pub fn issue(&mut self, request_id: &str) -> bool {
        if !self.issued.insert(request_id.to_string()) {
            return false;
        }

        self.outstanding.insert(request_id.to_string());
        true
    }

    /// Returns false if no reply was expected for the id.
    pub fn settle(&mut self, request_id: &str) -> bool {
        self.outstanding.remove(request_id)
    }
}

type SharedLedger = Arc<Mutex<RequestLedger>>;

fn lock(ledger: &SharedLedger) -> MutexGuard<'_, RequestLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ReplyStatus {
    Ok,
    Error,
    Aborted,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
struct ExecuteReplyContent {
    status: ReplyStatus,
    #[serde(default)]
    execution_count: Option<i64>,
    #[serde(default)]
    ename: Option<String>,
    #[serde(default)]
    evalue: Option<String>,
    #[serde(default)]
    traceback: Option<Vec<String>>,
}

/// Maps an `execute_reply` onto an [`ExecuteReply`] correlated by the parent
/// message id. Returns `Ok(None)` when the reply names no parent.
pub fn decode_execute_reply(message: &WireMessage) -> Result<Option<ExecuteReply>, WireError> {
    let Some(request_id) = message.parent_msg_id() else {
        return Ok(None);
    };
    let content: ExecuteReplyContent = message.content_as()?;

    let mut reply = ExecuteReply {
        success: content.status == ReplyStatus::Ok,
        request_id: request_id.to_string(),
        execution_counter: None,
        error_name: None,
        error_message: None,
        traceback: None,
    };

    if content.status != ReplyStatus::Aborted {
        reply.execution_counter = content.execution_count;
    }

    if content.status == ReplyStatus::Error {
        reply.error_name = content.ename;
        reply.error_message = content.evalue;
        reply.traceback = content.traceback;
    }

    Ok(Some(reply))
}

pub fn execute_request(request: &ExecuteRequest, session: &str) -> WireMessage {
    WireMessage::new(
        Header::new(&request.request_id, "execute_request", session),
        json!({
            "code": request.code,
            "silent": false,
            "store_history": true,
            "allow_stdin": false,
        }),
    )
}

pub struct ShellChannel {
    ledger: SharedLedger,
    replies: mpsc::UnboundedSender<ExecuteReply>,
    death: DeathSignal,
}

impl ShellChannel {
    fn on_execute_reply(&mut self, message: WireMessage) {
        let reply = match decode_execute_reply(&message) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                warn!("dropping execute_reply without parent header");
                return;
            }
            Err(e) => {
                warn!("dropping malformed execute_reply: {e}");
                return;
            }
        };

        if !lock(&self.ledger).settle(&reply.request_id) {
            warn!(request_id = %reply.request_id, "dropping execute_reply for unknown request");
            return;
        }

        debug!(request_id = %reply.request_id, success = reply.success, "execute reply");
        let _ = self.replies.send(reply);
    }
}

impl Channel for ShellChannel {
    fn receive(&mut self, message: WireMessage) {
        match message.kind() {
            MessageKind::ExecuteReply => self.on_execute_reply(message),
            _ => warn!(msg_type = %message.header.msg_type, "ignoring shell message"),
        }
    }

    fn disconnected(&mut self, _error: &ChannelError) {
        self.death.fire("shell channel disconnected");
    }
}

/// Sends execute requests to one kernel. Replies arrive on the sink passed to
/// [`ShellHandle::connect`].
#[derive(Clone)]
pub struct ShellHandle {
    kernel_id: String,
    session: String,
    ledger: SharedLedger,
    channel: ChannelHandle,
}

impl ShellHandle {
    pub async fn connect(
        kernel_id: &str,
        client: ChannelClient<DealerSocket>,
        replies: mpsc::UnboundedSender<ExecuteReply>,
        death: DeathSignal,
    ) -> Result<Self, ChannelError> {
        let session = client.identity().to_string();
        let ledger = SharedLedger::default();
        let shell = ShellChannel {
            ledger: ledger.clone(),
            replies,
            death,
        };

        let channel = channel::open(client, shell).await?;

        Ok(Self {
            kernel_id: kernel_id.to_string(),
            session,
            ledger,
            channel,
        })
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<(), KernelError> {
        if !lock(&self.ledger).issue(&request.request_id) {
            return Err(KernelError::DuplicateRequest {
                kernel_id: self.kernel_id.clone(),
                request_id: request.request_id,
            });
        }

        debug!(request_id = %request.request_id, "sending execute_request");
        let message = execute_request(&request, &self.session);

        if let Err(e) = self.channel.send(message).await {
            lock(&self.ledger).settle(&request.request_id);
            return Err(e.into());
        }

        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        self.channel.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventSinks;
    use googletest::prelude::*;
    use serde_json::Value;

    fn reply(parent: &str, content: Value) -> WireMessage {
        let request = WireMessage::new(Header::new(parent, "execute_request", "s"), json!({}));
        WireMessage::reply_to(&request, Header::new("reply", "execute_reply", "k"), content)
    }

    fn shell_channel() -> (ShellChannel, crate::EventStreams) {
        let (sinks, streams) = EventSinks::channel();
        let channel = ShellChannel {
            ledger: SharedLedger::default(),
            replies: sinks.execute_reply.clone(),
            death: DeathSignal::new("k1", sinks.kernel_status),
        };
        (channel, streams)
    }

    #[googletest::test]
    fn ok_reply_is_successful_with_counter() {
        let decoded = decode_execute_reply(&reply("r1", json!({"status": "ok", "execution_count": 1})));

        expect_that!(
            decoded.unwrap(),
            some(eq(ExecuteReply {
                success: true,
                request_id: "r1".to_string(),
                execution_counter: Some(1),
                error_name: None,
                error_message: None,
                traceback: None,
            }))
        );
    }

    #[googletest::test]
    fn error_reply_carries_error_details() {
        let decoded = decode_execute_reply(&reply(
            "r2",
            json!({
                "status": "error",
                "execution_count": 2,
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["line 1", "line 2"],
            }),
        ))
        .unwrap()
        .unwrap();

        expect_that!(decoded.success, eq(false));
        expect_that!(decoded.execution_counter, some(eq(2)));
        expect_that!(decoded.error_name, some(eq("ZeroDivisionError")));
        expect_that!(decoded.error_message, some(eq("division by zero")));
        expect_that!(decoded.traceback, some(len(eq(2))));
    }

    #[googletest::test]
    fn aborted_reply_has_no_counter() {
        let decoded = decode_execute_reply(&reply(
            "r3",
            json!({"status": "aborted", "execution_count": 3}),
        ))
        .unwrap()
        .unwrap();

        expect_that!(decoded.success, eq(false));
        expect_that!(decoded.execution_counter, none());
        expect_that!(decoded.error_name, none());
    }

    #[googletest::test]
    fn error_fields_are_ignored_unless_status_is_error() {
        let decoded = decode_execute_reply(&reply(
            "r4",
            json!({"status": "ok", "execution_count": 4, "ename": "Stale"}),
        ))
        .unwrap()
        .unwrap();

        expect_that!(decoded.error_name, none());
    }

    #[googletest::test]
    fn execute_request_content_matches_protocol() {
        let message = execute_request(&ExecuteRequest::new("r1", "1+1"), "session-1");

        expect_that!(message.header.msg_id, eq("r1"));
        expect_that!(message.header.msg_type, eq("execute_request"));
        expect_that!(message.header.session, eq("session-1"));
        expect_that!(
            message.content,
            eq(json!({
                "code": "1+1",
                "silent": false,
                "store_history": true,
                "allow_stdin": false,
            }))
        );
    }

    #[googletest::test]
    fn ledger_never_reissues_an_id() {
        let mut ledger = RequestLedger::default();

        expect_that!(ledger.issue("r1"), eq(true));
        expect_that!(ledger.settle("r1"), eq(true));
        expect_that!(ledger.issue("r1"), eq(false));
        expect_that!(ledger.settle("r1"), eq(false));
    }

    #[googletest::test]
    fn replies_for_unissued_requests_are_dropped() {
        let (mut channel, mut streams) = shell_channel();
        lock(&channel.ledger).issue("sent");

        channel.receive(reply("never-sent", json!({"status": "ok", "execution_count": 1})));
        channel.receive(reply("sent", json!({"status": "ok", "execution_count": 1})));

        let delivered = streams.execute_reply.try_recv().unwrap();
        expect_that!(delivered.request_id, eq("sent"));
        expect_that!(streams.execute_reply.try_recv().is_err(), eq(true));
    }

    #[googletest::test]
    fn unrecognized_shell_messages_are_ignored() {
        let (mut channel, mut streams) = shell_channel();
        lock(&channel.ledger).issue("r1");

        let mut info = reply("r1", json!({"status": "ok"}));
        info.header.msg_type = "kernel_info_reply".to_string();

        channel.receive(info);
        channel.receive(reply("r1", json!({"status": "ok", "execution_count": 1})));

        expect_that!(streams.execute_reply.try_recv().map(|r| r.request_id), ok(eq("r1")));
    }
}
