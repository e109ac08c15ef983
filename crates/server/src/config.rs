use std::{net::SocketAddr, ops::Range, time::Duration};

use clap::Parser;
use orrery_kernel::KernelLaunch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Runs Jupyter kernels and serves them over HTTP")]
pub struct Config {
    /// Address the HTTP API listens on
    #[arg(long, env = "ORRERY_BIND", default_value = "127.0.0.1:8890")]
    pub bind: SocketAddr,

    /// Kernel executable
    #[arg(long, env = "ORRERY_KERNEL_PROGRAM", default_value = "ipython")]
    pub kernel_program: String,

    /// Arguments passed to the kernel executable before the per-kernel flags,
    /// separated by commas
    #[arg(
        long,
        env = "ORRERY_KERNEL_ARGS",
        value_delimiter = ',',
        default_value = "kernel"
    )]
    pub kernel_args: Vec<String>,

    /// Ports handed out to kernels, as `first-last` (last excluded)
    #[arg(
        long,
        env = "ORRERY_PORT_RANGE",
        default_value = "60000-61000",
        value_parser = parse_port_range
    )]
    pub port_range: Range<u16>,

    /// Start kernels with `--matplotlib=inline`
    #[arg(long, env = "ORRERY_MATPLOTLIB_INLINE")]
    pub matplotlib_inline: bool,

    /// Do not give kernels a heartbeat port
    #[arg(long, env = "ORRERY_NO_HEARTBEAT")]
    pub no_heartbeat: bool,

    /// Seconds a new kernel has to accept its channel connections
    #[arg(long, env = "ORRERY_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// Log filter such as "debug" or "orrery_kernel=trace". Falls back to
    /// `RUST_LOG`, then "info".
    #[arg(short, long, env = "ORRERY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    pub fn kernel_launch(&self) -> KernelLaunch {
        KernelLaunch {
            program: self.kernel_program.clone(),
            args: self.kernel_args.clone(),
            matplotlib_inline: self.matplotlib_inline,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..KernelLaunch::default()
        }
    }

    pub fn heartbeat(&self) -> bool {
        !self.no_heartbeat
    }

    pub fn env_filter(&self) -> EnvFilter {
        match &self.log_level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }
}

fn parse_port_range(value: &str) -> Result<Range<u16>, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected `first-last`, got `{value}`"))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid first port `{start}`: {e}"))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid last port `{end}`: {e}"))?;

    if start == 0 || start >= end {
        return Err(format!("port range {start}-{end} is empty"));
    }

    Ok(start..end)
}
