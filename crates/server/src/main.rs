use std::{convert::Infallible, future, process::ExitCode, sync::Arc};

use clap::Parser;
use hyper::{
    service::{make_service_fn, service_fn},
    Server,
};
use orrery_kernel::{KernelManager, PortPool};
use orrery_server::{
    api::{self, AppState},
    config::Config,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .init();

    let state = AppState {
        manager: Arc::new(KernelManager::new(config.kernel_launch())),
        ports: Arc::new(PortPool::new(config.port_range.clone())),
        heartbeat: config.heartbeat(),
    };

    let service = {
        let state = state.clone();
        make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| api::handle(state.clone(), request)))
            }
        })
    };

    let server = match Server::try_bind(&config.bind) {
        Ok(server) => server,
        Err(e) => {
            error!(bind = %config.bind, "failed to bind: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(bind = %config.bind, ports = ?config.port_range, "serving kernel API");

    let served = server
        .serve(service)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for ctrl-c: {e}");
                future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await;

    let mut code = ExitCode::SUCCESS;
    if let Err(e) = served {
        error!("server failed: {e}");
        code = ExitCode::FAILURE;
    }

    if let Err(e) = state.manager.shutdown_all().await {
        error!("{e}");
        code = ExitCode::FAILURE;
    }

    code
}
