use std::{io, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::KernelConfig;

/// How kernel processes are launched and reached.
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    /// Executable, followed by `args`, before the per-kernel flags.
    pub program: String,
    pub args: Vec<String>,
    pub connection_url: String,
    pub log_level: String,
    pub matplotlib_inline: bool,
    /// Upper bound on how long `start` waits for the channels to connect.
    pub connect_timeout: Duration,
}

impl Default for KernelLaunch {
    fn default() -> Self {
        Self {
            program: "ipython".to_string(),
            args: vec!["kernel".to_string()],
            connection_url: "tcp://127.0.0.1".to_string(),
            log_level: "DEBUG".to_string(),
            matplotlib_inline: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl KernelLaunch {
    pub fn arguments(&self, config: &KernelConfig) -> Vec<String> {
        let mut arguments = self.args.clone();
        // Messages stay unsigned; the channels only listen on loopback.
        arguments.push(r#"--Session.key="""#.to_string());
        arguments.push(format!("--iopub={}", config.iopub_port));
        arguments.push(format!("--shell={}", config.shell_port));
        if let Some(hb_port) = config.hb_port {
            arguments.push(format!("--hb={hb_port}"));
        }
        arguments.push(format!("--log-level={}", self.log_level));
        if self.matplotlib_inline {
            arguments.push("--matplotlib=inline".to_string());
        }

        arguments
    }

    fn command(&self, config: &KernelConfig) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.arguments(config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// A running kernel process. `on_exit` runs once the process is gone, whether
/// it exited by itself or was killed. Dropping the handle kills the process.
pub struct KernelProcess {
    pid: Option<u32>,
    kill: CancellationToken,
    watcher: JoinHandle<io::Result<()>>,
}

impl KernelProcess {
    pub fn spawn<F>(launch: &KernelLaunch, config: &KernelConfig, on_exit: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut child = launch.command(config).spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        let kill = CancellationToken::new();
        let watcher = task::spawn(watch_process(child, kill.clone(), on_exit).in_current_span());

        Ok(Self { pid, kill, watcher })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kills the process if it is still running and waits until it is reaped.
    pub async fn kill(mut self) -> io::Result<()> {
        self.kill.cancel();
        match (&mut self.watcher).await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl Drop for KernelProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn watch_process<F>(mut child: Child, kill: CancellationToken, on_exit: F) -> io::Result<()>
where
    F: FnOnce(),
{
    let result = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                info!(%status, "kernel process exited");
                Ok(())
            }
            Err(e) => {
                error!("failed to wait on kernel process: {e}");
                Ok(())
            }
        },
        _ = kill.cancelled() => {
            info!("killing kernel process");
            child.kill().await
        }
    };

    on_exit();
    result
}

fn forward_output<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    task::spawn(
        async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => debug!(stream = name, "{line}"),
                    Ok(None) => break,
                    Err(e) => {
                        error!(stream = name, "failed to read kernel output: {e}");
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );
}
