use chordal::config::RingConfig;
use chordal::node::RingNode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--config <file>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind_addr: Option<String> = None;
    let mut seed: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = args.get(i + 1).cloned();
                i += 2;
            }
            "--seed" => {
                seed = args.get(i + 1).cloned();
                i += 2;
            }
            "--config" => {
                config_path = args.get(i + 1).map(PathBuf::from);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;
    let config = Arc::new(match &config_path {
        Some(path) => RingConfig::load(path)?,
        None => RingConfig::default(),
    });

    tracing::info!("Starting node on {}", bind_addr);
    let node = RingNode::start(&bind_addr, config).await?;

    match &seed {
        Some(seed) => {
            tracing::info!("Joining the ring via {}", seed);
            node.connect(seed).await?;
        }
        None => tracing::info!("Starting as the founding node"),
    }

    // Periodic ring status report.
    let status = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            tracing::info!(
                "Ring status: pred={} succ={} finger={} stable={}",
                status.table().preds().len(),
                status.table().succs().len(),
                status.table().fingers().len(),
                status.is_stable()
            );
        }
    });

    tracing::info!("Press Ctrl+C to leave the ring and shut down");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Leaving the ring");
    node.disconnect().await;
    node.shutdown();
    Ok(())
}
