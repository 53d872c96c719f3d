use std::time::Duration;

use tracing::info;

use crate::config::FileTunnelConfig;
use crate::file_tunnel::FileTunnel;

/// Periodically sweeps the file tunnel for expired uploads and abandoned
/// pending requests.
pub async fn file_tunnel_gc_loop(file_tunnel: FileTunnel, cfg: FileTunnelConfig) {
    let sweep_interval = cfg.gc_interval_secs.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));

    loop {
        interval.tick().await;

        let (uploads, pending) = file_tunnel.run_gc_sweep(tokio::time::Instant::now()).await;
        if uploads > 0 || pending > 0 {
            info!(uploads, pending, "file tunnel gc sweep removed entries");
        }
    }
}
