use crate::blocks::BlockPolicy;
use crate::config::{RemoteConfig, TribeConfig};
use crate::conflict::ConflictPolicy;
use crate::coordinator::TribeNode;
use crate::health::HealthReport;
use crate::router::{error_body, Operation};
use crate::sim::{SimCluster, SimConnector};
use crate::tcp::{serve_requests, TcpConnector};
use crate::view::MergedView;
use crate::TribeError;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tribe-node")]
#[command(about = "Joins several clusters and serves one merged view", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "TRIBE_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Join the configured clusters and serve requests.
    Serve {
        #[arg(short, long, default_value = "/etc/tribe-node/tribe.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file.
    Check {
        #[arg(short, long)]
        config: PathBuf,
        /// Evaluate an operation (JSON) against the configured blocks.
        #[arg(long)]
        op: Option<String>,
    },
    /// Merge two in-process clusters and print the result.
    Demo {
        #[arg(long, default_value = "drop")]
        on_conflict: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { ref config } => serve(config).await,
            Command::Check { ref config, ref op } => check(config, op.as_deref()),
            Command::Demo { ref on_conflict } => demo(on_conflict).await,
        }
    }
}

async fn serve(path: &Path) -> Result<()> {
    let config = TribeConfig::from_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    let listen_addr = config.listen_addr.clone();

    let node = Arc::new(TribeNode::start(config, Arc::new(TcpConnector::default())).await?);
    let cancel = CancellationToken::new();

    if let Some(addr) = listen_addr {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        let node = Arc::clone(&node);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_requests(node, listener, cancel).await {
                tracing::error!(error = %e, "request listener failed");
            }
        });
    }

    let mut versions = node.subscribe();
    let watcher = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            while versions.changed().await.is_ok() {
                let view = node.view();
                tracing::info!(
                    version = view.version(),
                    nodes = view.node_count(),
                    indices = view.index_names().len(),
                    status = ?node.health().status,
                    "merged view updated"
                );
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    node.shutdown().await;
    watcher.abort();
    Ok(())
}

fn check(path: &Path, op: Option<&str>) -> Result<()> {
    let config = TribeConfig::from_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;

    println!("Node:        {}", config.node_name);
    println!("On conflict: {}", config.on_conflict);
    println!(
        "Blocks:      write={} metadata={} write_indices={:?}",
        config.blocks.write, config.blocks.metadata, config.blocks.write_indices
    );
    println!("{:<20} SEEDS", "REMOTE");
    println!("{}", "-".repeat(60));
    for remote in &config.remotes {
        println!("{:<20} {}", remote.alias, remote.seeds.join(","));
    }

    if let Some(op) = op {
        let op: Operation = serde_json::from_str(op).context("parsing --op")?;
        let blocks = BlockPolicy::new(&config.blocks)?;
        let decision = if op.requires_coordinator() {
            Err(TribeError::NoCoordinator {
                operation: op.name().to_string(),
            })
        } else {
            blocks.check(op.kind(), op.index()).into_result()
        };
        match decision {
            Ok(()) => println!("{}: allowed by blocks", op.name()),
            Err(e) => println!("{}: {}", op.name(), error_body(&e)),
        }
    }
    Ok(())
}

async fn demo(on_conflict: &str) -> Result<()> {
    let on_conflict: ConflictPolicy = on_conflict.parse()?;

    let c1 = SimCluster::new("cluster_1").with_nodes(&["node_1", "node_2"]);
    let c2 = SimCluster::new("cluster_2").with_nodes(&["node_1"]);
    for index in ["test1", "shared"] {
        c1.create_index(index)?;
    }
    for index in ["test2", "shared"] {
        c2.create_index(index)?;
    }
    let connector = SimConnector::new();
    connector.add("t1", c1.clone());
    connector.add("t2", c2);

    let mut config = TribeConfig::default()
        .with_remote(RemoteConfig::new("t1", &["sim:1"]))
        .with_remote(RemoteConfig::new("t2", &["sim:2"]));
    config.on_conflict = on_conflict;
    config.blocks.write_indices = vec!["block_*".to_string()];

    let node = TribeNode::start(config, Arc::new(connector)).await?;
    print_view(&node.view())?;

    let op = Operation::Index {
        index: "test1".to_string(),
        doc_type: "type1".to_string(),
        id: Some("1".to_string()),
        source: json!({"field1": "value1"}),
    };
    println!("index test1/type1/1 -> {}", node.execute(op).await?);
    for op in [
        Operation::CreateIndex {
            index: "test3".to_string(),
        },
        Operation::Index {
            index: "block_test1".to_string(),
            doc_type: "type1".to_string(),
            id: None,
            source: json!({}),
        },
    ] {
        let name = op.name();
        match node.execute(op).await {
            Ok(body) => println!("{} -> {}", name, body),
            Err(e) => println!("{} -> {}", name, error_body(&e)),
        }
    }

    c1.close_index("test1")?;
    let view = node
        .wait_for(Duration::from_secs(5), |v| {
            v.index("test1").is_some_and(|i| !i.is_open())
        })
        .await;
    if let Some(view) = view {
        println!("after closing test1 on t1:");
        print_view(&view)?;
    }

    println!("{}", serde_json::to_string_pretty(&HealthReport::from_view(&node.view()))?);
    node.shutdown().await;
    Ok(())
}

fn print_view(view: &MergedView) -> Result<()> {
    println!("Merged view version {}", view.version());
    println!("Nodes: {}", view.node_names().join(", "));
    println!("{:<15} {:<10} {:<8} TRIBE.NAME", "INDEX", "CLUSTER", "STATE");
    println!("{}", "-".repeat(50));
    for index in view.indices() {
        println!(
            "{:<15} {:<10} {:<8} {}",
            index.name,
            index.cluster,
            serde_json::to_value(index.state)?.as_str().unwrap_or_default(),
            index.tribe_name().unwrap_or_default()
        );
    }
    Ok(())
}
