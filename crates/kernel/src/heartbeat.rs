use std::time::Duration;

use bytes::Bytes;
use tokio::{
    task::{self, JoinHandle},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};
use zeromq::ReqSocket;

use crate::channel::ChannelClient;

pub const HEARTBEAT_PAYLOAD: &[u8] = b"orrery-heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTiming {
    pub period: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            timeout: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Active { last_success: Instant },
    /// Absorbing: no ping is sent and no health is reported once failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Send,
    Expired,
    Halted,
}

#[derive(Debug)]
pub struct Heartbeat {
    state: HeartbeatState,
    timeout: Duration,
}

impl Heartbeat {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            state: HeartbeatState::Active { last_success: now },
            timeout,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Decides whether the next ping may go out. The first call past the
    /// timeout moves the monitor to `Failed` and returns `Expired`.
    pub fn before_send(&mut self, now: Instant) -> Beat {
        match self.state {
            HeartbeatState::Failed => Beat::Halted,
            HeartbeatState::Active { last_success } => {
                if now.saturating_duration_since(last_success) > self.timeout {
                    self.state = HeartbeatState::Failed;
                    Beat::Expired
                } else {
                    Beat::Send
                }
            }
        }
    }

    /// Returns true when `payload` is a healthy echo.
    pub fn on_reply(&mut self, payload: &[u8], now: Instant) -> bool {
        match self.state {
            HeartbeatState::Failed => false,
            HeartbeatState::Active { .. } if payload == HEARTBEAT_PAYLOAD => {
                self.state = HeartbeatState::Active { last_success: now };
                true
            }
            HeartbeatState::Active { .. } => false,
        }
    }
}

/// Dropping the handle stops the monitor without waiting for it.
pub struct HeartbeatHandle {
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(mut self) {
        self.cancellation.cancel();
        if let Err(e) = (&mut self.task).await {
            error!("heartbeat monitor panicked: {e}");
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// Starts pinging the kernel right away. `on_health` is called with `true` on
/// every matching echo, and once with `false` when the monitor gives up.
pub fn start<F>(client: ChannelClient<ReqSocket>, timing: HeartbeatTiming, on_health: F) -> HeartbeatHandle
where
    F: Fn(bool) + Send + 'static,
{
    let heartbeat = Heartbeat::new(Instant::now(), timing.timeout);
    let cancellation = CancellationToken::new();

    let task = task::spawn(
        run_heartbeat(client, heartbeat, timing, on_health, cancellation.clone())
            .in_current_span(),
    );

    HeartbeatHandle { cancellation, task }
}

async fn run_heartbeat<F>(
    mut client: ChannelClient<ReqSocket>,
    mut heartbeat: Heartbeat,
    timing: HeartbeatTiming,
    on_health: F,
    cancellation: CancellationToken,
) where
    F: Fn(bool),
{
    let mut ticker = time::interval(timing.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match heartbeat.before_send(Instant::now()) {
            Beat::Send => {}
            Beat::Expired => {
                warn!(timeout = ?timing.timeout, "no heartbeat reply; kernel considered unhealthy");
                on_health(false);
                break;
            }
            Beat::Halted => break,
        }

        if !client.is_connected() {
            match time::timeout(timing.period, client.connect()).await {
                Ok(Ok(())) => info!(endpoint = %client.endpoint(), "heartbeat connected"),
                Ok(Err(e)) => {
                    warn!("heartbeat connect failed: {e}");
                    continue;
                }
                Err(_) => {
                    trace!("heartbeat endpoint not reachable yet");
                    continue;
                }
            }
        }

        trace!("sending heartbeat");
        if let Err(e) = client.send(vec![Bytes::from_static(HEARTBEAT_PAYLOAD)]).await {
            debug!("heartbeat send failed: {e}");
            reset(&mut client).await;
            continue;
        }

        let reply = tokio::select! {
            _ = cancellation.cancelled() => break,
            reply = time::timeout(timing.period, client.recv()) => reply,
        };

        match reply {
            Ok(Ok(message)) => {
                let payload = message.get(0).map(|frame| &frame[..]).unwrap_or_default();
                if heartbeat.on_reply(payload, Instant::now()) {
                    on_health(true);
                } else {
                    debug!("unexpected heartbeat payload");
                }
            }
            Ok(Err(e)) => {
                debug!("heartbeat receive failed: {e}");
                reset(&mut client).await;
            }
            Err(_) => {
                // An abandoned receive leaves the REQ socket without its
                // pending request; only a fresh socket can ping again.
                trace!("heartbeat reply not received within one period");
                reset(&mut client).await;
            }
        }
    }

    reset(&mut client).await;
}

async fn reset(client: &mut ChannelClient<ReqSocket>) {
    if client.is_connected() {
        let _ = client.disconnect().await;
    }
}
