#[tokio::main]
async fn main() -> control_plane::Result<()> {
    control_plane::init_tracing();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "control-plane starting"
    );
    control_plane::run().await
}
