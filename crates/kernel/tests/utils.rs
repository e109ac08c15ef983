#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use orrery_kernel::{
    wire::{Header, WireMessage},
    EventStreams, ExecuteReply, ExecutionState, KernelConfig, KernelLaunch, KernelStatus,
};
use serde_json::{json, Value};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeromq::{
    Endpoint, PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stands in for a kernel's channels. Shell requests are answered the way a
/// Python kernel would for a handful of known snippets:
///
/// - `1+1` publishes an `execute_result` of `2`
/// - `print('hi')` publishes a stdout stream
/// - `raise ValueError('boom')` replies with an error
/// - `stray` also sends a reply to a request that was never made
///
/// Until the first request arrives, iopub keeps publishing `starting` so a
/// test can tell when its subscription is live.
pub struct FakeKernel {
    pub config: KernelConfig,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeKernel {
    pub async fn start(heartbeat: bool) -> Self {
        let mut shell = RouterSocket::new();
        let shell_port = bind(&mut shell).await;
        let mut iopub = PubSocket::new();
        let iopub_port = bind(&mut iopub).await;

        let stop = CancellationToken::new();
        let mut config = KernelConfig::new(iopub_port, shell_port);
        let mut tasks = vec![tokio::spawn(serve_shell(shell, iopub, stop.clone()))];

        if heartbeat {
            let mut hb = RepSocket::new();
            config = config.with_heartbeat(bind(&mut hb).await);
            tasks.push(tokio::spawn(serve_heartbeat(hb, stop.clone())));
        }

        Self {
            config,
            stop,
            tasks,
        }
    }

    /// Closes every channel; the kernel stops answering.
    pub async fn stop(self) {
        self.stop.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn bind<S: Socket>(socket: &mut S) -> u16 {
    match socket.bind("tcp://127.0.0.1:0").await.unwrap() {
        Endpoint::Tcp(_, port) => port,
        endpoint => panic!("unexpected endpoint {endpoint}"),
    }
}

/// A heartbeat endpoint that takes requests but never echoes them.
pub async fn silent_heartbeat() -> (RepSocket, u16) {
    let mut hb = RepSocket::new();
    let port = bind(&mut hb).await;
    (hb, port)
}

async fn serve_shell(mut shell: RouterSocket, mut iopub: PubSocket, stop: CancellationToken) {
    let mut warmup = time::interval(Duration::from_millis(50));
    let mut warming_up = true;
    let mut execution_count = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = warmup.tick(), if warming_up => {
                publish(&mut iopub, None, "status", json!({"execution_state": "starting"})).await;
            }
            message = shell.recv() => {
                let Ok(message) = message else { break };
                let Ok(request) = WireMessage::try_from(message) else { continue };
                if request.header.msg_type != "execute_request" {
                    continue;
                }

                warming_up = false;
                execution_count += 1;
                execute(&mut shell, &mut iopub, &request, execution_count).await;
            }
        }
    }

    let _ = shell.close().await;
    let _ = iopub.close().await;
}

async fn execute(
    shell: &mut RouterSocket,
    iopub: &mut PubSocket,
    request: &WireMessage,
    execution_count: i64,
) {
    let code = request.content["code"].as_str().unwrap_or_default().to_string();

    publish(iopub, Some(request), "status", json!({"execution_state": "busy"})).await;
    publish(
        iopub,
        Some(request),
        "execute_input",
        json!({"code": code, "execution_count": execution_count}),
    )
    .await;

    let ok = json!({"status": "ok", "execution_count": execution_count});
    let content = match code.as_str() {
        "1+1" => {
            publish(
                iopub,
                Some(request),
                "execute_result",
                json!({
                    "data": {"text/plain": "2"},
                    "metadata": {},
                    "execution_count": execution_count,
                }),
            )
            .await;
            ok
        }
        "print('hi')" => {
            publish(iopub, Some(request), "stream", json!({"name": "stdout", "text": "hi\n"})).await;
            ok
        }
        "raise ValueError('boom')" => {
            let traceback = json!(["Traceback (most recent call last)", "ValueError: boom"]);
            publish(
                iopub,
                Some(request),
                "error",
                json!({"ename": "ValueError", "evalue": "boom", "traceback": traceback.clone()}),
            )
            .await;
            json!({
                "status": "error",
                "execution_count": execution_count,
                "ename": "ValueError",
                "evalue": "boom",
                "traceback": traceback,
            })
        }
        "stray" => {
            let mut stray = reply(request, ok.clone());
            stray
                .parent_header
                .insert("msg_id".to_string(), json!("never-requested"));
            send(shell, stray).await;
            ok
        }
        _ => ok,
    };

    send(shell, reply(request, content)).await;
    publish(iopub, Some(request), "status", json!({"execution_state": "idle"})).await;
}

fn reply(request: &WireMessage, content: Value) -> WireMessage {
    let header = Header::new(Uuid::new_v4().to_string(), "execute_reply", &request.header.session);
    WireMessage::reply_to(request, header, content)
}

async fn send(shell: &mut RouterSocket, message: WireMessage) {
    let _ = shell.send(ZmqMessage::try_from(message).unwrap()).await;
}

async fn publish(iopub: &mut PubSocket, parent: Option<&WireMessage>, msg_type: &str, content: Value) {
    let header = Header::new(Uuid::new_v4().to_string(), msg_type, "fake-kernel");
    let mut message = match parent {
        Some(parent) => WireMessage::reply_to(parent, header, content),
        None => WireMessage::new(header, content),
    };
    message.identities = vec![Bytes::from(format!("kernel.fake.{msg_type}"))];

    let _ = iopub.send(ZmqMessage::try_from(message).unwrap()).await;
}

async fn serve_heartbeat(mut hb: RepSocket, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            message = hb.recv() => {
                let Ok(message) = message else { break };
                if hb.send(message).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = hb.close().await;
}

/// A launch whose "kernel" is a shell that sleeps; the per-kernel flags land
/// in its positional parameters.
pub fn sleeping_launch(seconds: u32) -> KernelLaunch {
    KernelLaunch {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), format!("sleep {seconds}"), "kernel".to_string()],
        connect_timeout: Duration::from_secs(5),
        ..KernelLaunch::default()
    }
}

pub async fn next_reply(streams: &mut EventStreams) -> ExecuteReply {
    time::timeout(EVENT_TIMEOUT, streams.execute_reply.recv())
        .await
        .expect("timed out waiting for an execute reply")
        .expect("execute reply stream closed")
}

pub async fn wait_for_status(
    streams: &mut EventStreams,
    state: ExecutionState,
    request_id: Option<&str>,
) -> KernelStatus {
    let wanted = async {
        loop {
            let status = streams
                .kernel_status
                .recv()
                .await
                .expect("kernel status stream closed");
            if status.status == state && status.request_id.as_deref() == request_id {
                return status;
            }
        }
    };

    time::timeout(EVENT_TIMEOUT, wanted)
        .await
        .expect("timed out waiting for kernel status")
}

/// Blocks until iopub delivers, so nothing published afterwards is missed.
pub async fn wait_until_subscribed(streams: &mut EventStreams) {
    wait_for_status(streams, ExecutionState::Starting, None).await;
}
