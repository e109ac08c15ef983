use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{
    sync::{mpsc, Mutex},
    time,
};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::{
    channel::{ChannelClient, ChannelHandle, ChannelName},
    error::{ChannelError, KernelError},
    heartbeat::{self, HeartbeatHandle, HeartbeatTiming},
    iopub::{self, IoPubChannel},
    process::{KernelLaunch, KernelProcess},
    shell::ShellHandle,
    EventSinks, ExecuteRequest, KernelConfig, KernelStatus,
};

/// Emits the terminal `dead` status for one kernel, at most once, whichever
/// of process exit, channel loss or heartbeat failure gets there first.
#[derive(Debug, Clone)]
pub struct DeathSignal {
    kernel_id: Arc<str>,
    fired: Arc<AtomicBool>,
    status: mpsc::UnboundedSender<KernelStatus>,
}

impl DeathSignal {
    pub fn new(kernel_id: &str, status: mpsc::UnboundedSender<KernelStatus>) -> Self {
        Self {
            kernel_id: Arc::from(kernel_id),
            fired: Arc::new(AtomicBool::new(false)),
            status,
        }
    }

    /// Returns true only for the call that actually emitted the status.
    pub fn fire(&self, cause: &str) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(kernel = %self.kernel_id, cause, "kernel already reported dead");
            return false;
        }

        warn!(kernel = %self.kernel_id, cause, "kernel is dead");
        let _ = self.status.send(KernelStatus::dead());
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

struct Running {
    shell: ShellHandle,
    iopub: ChannelHandle,
    heartbeat: Option<HeartbeatHandle>,
    process: KernelProcess,
}

/// Owns one kernel process and the channels that talk to it.
pub struct KernelClient {
    id: String,
    session: String,
    config: KernelConfig,
    launch: KernelLaunch,
    sinks: EventSinks,
    death: DeathSignal,
    span: Span,
    running: Mutex<Option<Running>>,
}

impl KernelClient {
    pub fn new(
        id: impl Into<String>,
        config: KernelConfig,
        launch: KernelLaunch,
        sinks: EventSinks,
    ) -> Self {
        let id = id.into();
        let death = DeathSignal::new(&id, sinks.kernel_status.clone());
        let span = info_span!("kernel", id = %id);

        Self {
            session: Uuid::new_v4().to_string(),
            span,
            id,
            config,
            launch,
            sinks,
            death,
            running: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn is_dead(&self) -> bool {
        self.death.has_fired()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.running
            .lock()
            .await
            .as_ref()
            .and_then(|running| running.process.pid())
    }

    /// Spawns the kernel process and connects its channels.
    pub async fn start(&self) -> Result<(), KernelError> {
        self.start_running().instrument(self.span.clone()).await
    }

    async fn start_running(&self) -> Result<(), KernelError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(KernelError::AlreadyStarted(self.id.clone()));
        }

        let death = self.death.clone();
        let process = KernelProcess::spawn(&self.launch, &self.config, move || {
            death.fire("kernel process exited");
        })
        .map_err(|source| KernelError::Spawn {
            kernel_id: self.id.clone(),
            source,
        })?;
        info!(pid = ?process.pid(), config = ?self.config, "kernel process spawned");

        let connected = time::timeout(self.launch.connect_timeout, self.connect_channels()).await;
        let (shell, iopub) = match connected {
            Ok(Ok(channels)) => channels,
            Ok(Err(e)) => {
                self.abandon(process).await;
                return Err(e.into());
            }
            Err(_) => {
                self.abandon(process).await;
                return Err(KernelError::ConnectTimeout {
                    kernel_id: self.id.clone(),
                    timeout: self.launch.connect_timeout,
                });
            }
        };

        let heartbeat = self.config.hb_port.map(|port| {
            let client = ChannelClient::new(
                ChannelName::Heartbeat,
                &self.launch.connection_url,
                port,
                &self.session,
            );
            let death = self.death.clone();
            heartbeat::start(client, HeartbeatTiming::default(), move |healthy| {
                if !healthy {
                    death.fire("heartbeat lost");
                }
            })
        });

        *running = Some(Running {
            shell,
            iopub,
            heartbeat,
            process,
        });
        info!("kernel started");

        Ok(())
    }

    async fn connect_channels(&self) -> Result<(ShellHandle, ChannelHandle), ChannelError> {
        let url = &self.launch.connection_url;

        let shell = ShellHandle::connect(
            &self.id,
            ChannelClient::new(ChannelName::Shell, url, self.config.shell_port, &self.session),
            self.sinks.execute_reply.clone(),
            self.death.clone(),
        )
        .await?;

        let iopub = iopub::connect(
            ChannelClient::new(ChannelName::IoPub, url, self.config.iopub_port, &self.session),
            IoPubChannel::new(
                self.sinks.kernel_status.clone(),
                self.sinks.output_data.clone(),
                self.death.clone(),
            ),
        )
        .await?;

        Ok((shell, iopub))
    }

    async fn abandon(&self, process: KernelProcess) {
        if let Err(e) = process.kill().await {
            warn!("failed to kill kernel process after failed start: {e}");
        }
    }

    /// Sends `request` to the kernel; its reply and output arrive later on the
    /// kernel's event sinks.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<(), KernelError> {
        let shell = match self.running.lock().await.as_ref() {
            Some(running) => running.shell.clone(),
            None => return Err(KernelError::NotStarted(self.id.clone())),
        };

        shell.execute(request).instrument(self.span.clone()).await
    }

    /// Closes the channels, then kills the process. Shutting down a kernel
    /// that is not running does nothing.
    pub async fn shutdown(&self) -> Result<(), KernelError> {
        self.shutdown_running().instrument(self.span.clone()).await
    }

    async fn shutdown_running(&self) -> Result<(), KernelError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        for (name, result) in [
            (ChannelName::IoPub, running.iopub.disconnect().await),
            (ChannelName::Shell, running.shell.disconnect().await),
        ] {
            if let Err(e) = result {
                debug!(channel = %name, "channel already closed: {e}");
            }
        }

        if let Some(heartbeat) = running.heartbeat {
            heartbeat.stop().await;
        }

        running
            .process
            .kill()
            .await
            .map_err(|e| KernelError::Shutdown {
                kernel_id: self.id.clone(),
                reason: e.to_string(),
            })?;

        info!("kernel shut down");
        Ok(())
    }
}
