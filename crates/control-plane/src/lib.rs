pub mod app_state;
pub mod backup;
pub mod config;
pub mod directory;
pub mod error;
pub mod file_tunnel;
pub mod http;
pub mod secrets;
pub mod tasks;
pub mod telemetry;
pub mod tunnel;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::{AgentAuth, AppState};
use crate::backup::{BackupOrchestrator, ObjectStoreClient, SftpClient};
use crate::directory::{Directory, MemoryDirectory};
use crate::file_tunnel::FileTunnel;
use crate::secrets::SecretCipher;
use crate::telemetry::init_metrics_recorder;
use crate::tunnel::TunnelRegistry;

/// Deployment seams the embedding binary can fill in. The default runs a
/// permissive in-memory directory and no remote storage clients.
#[derive(Clone, Default)]
pub struct ServiceHooks {
    pub directory: Option<Arc<dyn Directory>>,
    pub object_store: Option<Arc<dyn ObjectStoreClient>>,
    pub sftp: Option<Arc<dyn SftpClient>>,
}

pub async fn run() -> Result<()> {
    run_with_shutdown(ServiceHooks::default(), shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(hooks: ServiceHooks, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let cipher = if app_config.secrets.master_key.is_empty() {
        None
    } else {
        Some(SecretCipher::from_base64(&app_config.secrets.master_key)?)
    };

    let registry = TunnelRegistry::new();
    let file_tunnel = FileTunnel::new(app_config.file_tunnel.clone());
    let transfers = BackupOrchestrator::new(
        registry.clone(),
        file_tunnel.clone(),
        app_config.backups.clone(),
        &app_config.tunnel,
        cipher,
        hooks.object_store.clone(),
        hooks.sftp.clone(),
    );
    let directory = hooks
        .directory
        .clone()
        .unwrap_or_else(|| MemoryDirectory::permissive());

    let state = AppState {
        registry,
        file_tunnel: file_tunnel.clone(),
        transfers,
        directory,
        agent_auth: AgentAuth::new(app_config.tunnel.agent_tokens.clone()),
        tunnel: app_config.tunnel.clone(),
        backups: app_config.backups.clone(),
        metrics_handle,
    };

    tunnel::service::serve(state.clone()).await?;
    tokio::spawn(tasks::gc::file_tunnel_gc_loop(
        file_tunnel.clone(),
        app_config.file_tunnel.clone(),
    ));

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app = http::build_router(state.clone());
    let metrics_app = http::build_metrics_router(state.clone());

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "control-plane listening");
    info!(%metrics_addr, "control-plane metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown.await;
            let _ = shutdown_tx.send(true);
        }
    });

    let mut api_task = spawn_server(api_listener, app, shutdown_rx.clone());
    let mut metrics_task = spawn_server(metrics_listener, metrics_app, shutdown_rx);

    // Whichever server exits first takes the other down with it.
    let outcome = tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            flatten("api server", res)
                .and(flatten("metrics server", (&mut metrics_task).await))
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            flatten("metrics server", res)
                .and(flatten("api server", (&mut api_task).await))
        }
    };

    // Waiters on the long-poll path see a clean shutdown error rather than
    // a dropped channel.
    file_tunnel.shutdown().await;
    outcome
}

fn spawn_server(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    })
}

fn flatten(
    name: &str,
    res: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(anyhow::anyhow!("{name} failed: {err}")),
        Err(err) => Err(anyhow::anyhow!("{name} task failed: {err}")),
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
        let sigterm = async {
            match term.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
            _ = sigterm => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down");
    }

    // Give in-flight log lines a moment to flush.
    tokio::time::sleep(Duration::from_millis(100)).await;
}
