use anvil_core::{Engine, ReqOptions};
use anvil_server::rpc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let repo = arg_value(&args, "--repo").unwrap_or_else(|| ".".to_string());
    let listen = arg_value(&args, "--listen").unwrap_or_else(|| "127.0.0.1:0".to_string());
    let targets = positional(&args);

    let engine = Engine::open(&repo)?;
    engine.start_services().await;

    // job RPC endpoints for remote executors
    let start = TcpListener::bind(&listen).await?;
    let mngt = TcpListener::bind(&listen).await?;
    let end = TcpListener::bind(&listen).await?;
    tracing::info!(
        start = %start.local_addr()?,
        mngt = %mngt.local_addr()?,
        end = %end.local_addr()?,
        "anvild listening"
    );
    {
        let engine = engine.clone();
        tokio::spawn(rpc::serve_jobs(engine, start, mngt, end));
    }

    if targets.is_empty() {
        // daemon mode: serve until interrupted
        tokio::signal::ctrl_c().await?;
        engine.save().await?;
    } else {
        let req = engine.open_req(options_from(&args), &targets).await?;
        let summary = engine.wait_req(req).await;
        for line in &summary.audit {
            println!("{}", line.render());
        }
        engine.save().await?;
        engine.shutdown();
        if !summary.ok {
            std::process::exit(1);
        }
    }
    engine.shutdown();
    Ok(())
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].clone())
}

/// Everything that is neither a flag nor a flag value.
fn positional(args: &[String]) -> Vec<String> {
    let mut res = Vec::new();
    let mut skip = false;
    for a in args {
        if skip {
            skip = false;
            continue;
        }
        if a.starts_with("--") || a == "-j" {
            skip = matches!(a.as_str(), "--repo" | "--listen" | "--retries" | "-j");
            continue;
        }
        res.push(a.clone());
    }
    res
}

fn options_from(args: &[String]) -> ReqOptions {
    let has = |name: &str| args.iter().any(|a| a == name);
    ReqOptions {
        live_out: has("--live-out"),
        verbose: has("--verbose"),
        archive: has("--archive"),
        force: has("--force"),
        no_incremental: has("--no-incremental"),
        forget_old_errors: has("--forget-old-errors"),
        keep_tmp: has("--keep-tmp"),
        n_jobs: arg_value(args, "-j").and_then(|v| v.parse().ok()).unwrap_or(0),
        n_retries: arg_value(args, "--retries").and_then(|v| v.parse().ok()).unwrap_or(0),
        ..Default::default()
    }
}
