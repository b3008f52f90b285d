use std::sync::Arc;

use anvil_core::cache::{Cache, DirCache};
use anvil_core::rules::CacheSpec;
use anvil_server::rpc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Standalone cache daemon: a DirCache served over the cache protocol so
/// artifacts can be shared across machines.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let dir = arg(&args, "--dir").unwrap_or_else(|| ".anvil-cache".to_string());
    let listen = arg(&args, "--listen").unwrap_or_else(|| "127.0.0.1:8644".to_string());
    let spec = CacheSpec {
        dir: dir.clone(),
        max_sz: arg(&args, "--max-sz").and_then(|v| v.parse().ok()).unwrap_or(1 << 30),
        max_rate: arg(&args, "--max-rate").and_then(|v| v.parse().ok()).unwrap_or(1 << 30),
        max_runs_per_job: arg(&args, "--max-runs").and_then(|v| v.parse().ok()).unwrap_or(100),
        zlvl: arg(&args, "--zlvl").and_then(|v| v.parse().ok()).unwrap_or(1),
    };
    let cache: Arc<dyn Cache> = Arc::new(DirCache::new(&dir, spec)?);
    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(dir = %dir, addr = %listener.local_addr()?, "cache server listening");
    rpc::serve_cache(cache, listener).await;
    Ok(())
}

fn arg(args: &[String], name: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].clone())
}
