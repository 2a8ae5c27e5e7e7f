use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the JSON-RPC session; every diagnostic goes to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().expect("static filter"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    patchbay::cli::run().await
}
