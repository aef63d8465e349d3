//! ordersync CLI — validate configuration and replay recorded chain events.
//!
//! Usage:
//! ```bash
//! ordersync check-config sync.yaml
//! ordersync replay --config sync.yaml --events sepolia.json [--chain sepolia] [--allow 0xabc,0xdef]
//! ordersync info
//! ```

use std::collections::BTreeSet;
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ordersync_core::config::{LogConfig, SyncConfig};
use ordersync_core::cursor::CursorStore;
use ordersync_engine::{ChainStatus, EngineBuilder, ReplaySource};
use ordersync_storage::{InMemoryStorage, MemoryRankCache};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "check-config" => cmd_check_config(&args[2..]),
        "replay" => cmd_replay(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("ordersync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("ordersync {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-chain NFT order book sync engine\n");
    println!("USAGE:");
    println!("    ordersync <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info                      Show engine defaults");
    println!("    check-config <path>       Parse and validate a YAML configuration");
    println!("    replay --config <path> --events <path> [--chain <name>] [--allow <c1,c2>]");
    println!("                              Index a recorded event script and print the order book");
    println!("    version                   Print version");
    println!("    help                      Print this help");
}

fn cmd_info() {
    let defaults = SyncConfig::new("default", vec![]);
    println!("OrderSync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default reorg safety window: 64 blocks");
    println!("  Default batch size: 100 blocks/fetch");
    println!("  Default sweep interval: every {}s", defaults.sweep.interval_secs);
    println!("  Default allow-list refresh: every {}s", defaults.filter_refresh_secs);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

fn cmd_check_config(args: &[String]) -> Result<()> {
    let path = args.first().ok_or_else(|| anyhow!("check-config needs a path"))?;
    let config = SyncConfig::load(path).with_context(|| format!("loading {path}"))?;
    println!("{path}: ok");
    println!("  project: {}", config.project);
    for chain in &config.chains {
        println!(
            "  chain {:<12} id={:<10} batch={:<5} reorg_window={}",
            chain.name, chain.id, chain.batch_size, chain.reorg_safety_window
        );
    }
    println!("  history window: {} blocks", config.history_window());
    Ok(())
}

async fn cmd_replay(args: &[String]) -> Result<()> {
    let config_path = flag(args, "--config").ok_or_else(|| anyhow!("replay needs --config"))?;
    let events_path = flag(args, "--events").ok_or_else(|| anyhow!("replay needs --events"))?;

    let mut config = SyncConfig::load(&config_path).with_context(|| format!("loading {config_path}"))?;
    init_tracing(&config.log);

    let chain_name = match flag(args, "--chain") {
        Some(name) => name,
        None => config
            .chains
            .first()
            .map(|c| c.name.clone())
            .ok_or_else(|| anyhow!("no chains configured"))?,
    };
    let script = std::fs::read_to_string(&events_path).with_context(|| format!("reading {events_path}"))?;
    let source = Arc::new(ReplaySource::from_json(chain_name.as_str(), &script)?);
    let head = source
        .head()
        .ok_or_else(|| anyhow!("{events_path} contains no blocks"))?;

    // Only the replayed chain runs, starting at the script's first block.
    config.chains.retain(|c| c.name == chain_name);
    let chain = config
        .chains
        .first_mut()
        .ok_or_else(|| anyhow!("chain '{chain_name}' is not configured"))?;
    if chain.genesis_height == 0 {
        chain.genesis_height = source.first().unwrap_or(0);
    }
    chain.poll_interval_ms = chain.poll_interval_ms.min(100);
    let chain_id = chain.id;

    let storage = Arc::new(InMemoryStorage::new());
    let allowed: BTreeSet<String> = match flag(args, "--allow") {
        Some(list) => list.split(',').map(|c| c.trim().to_string()).collect(),
        None => script_collections(&script)?,
    };
    for collection in &allowed {
        storage.allow(&chain_name, collection);
    }

    let coordinator = Arc::new(
        EngineBuilder::new(config)
            .in_memory(storage.clone())
            .rank_cache(Arc::new(MemoryRankCache::new()))
            .source(chain_id, source.clone())
            .build()?,
    );
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    loop {
        if runner.is_finished() {
            break;
        }
        let done = CursorStore::load(storage.as_ref(), &chain_name)
            .await?
            .is_some_and(|c| c.block_number >= head);
        if done {
            break;
        }
        if let Some(status) = coordinator.status().get(&chain_name) {
            if matches!(status, ChainStatus::Halted { .. }) {
                coordinator.shutdown();
                bail!("chain '{chain_name}' halted: {}", serde_json::to_string(&status)?);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    coordinator.shutdown();
    runner.await.context("coordinator task")??;

    let orders = storage.all_orders(&chain_name);
    tracing::info!(chain = %chain_name, orders = orders.len(), head, "Replay complete");
    println!("{}", serde_json::to_string_pretty(&orders)?);
    Ok(())
}

/// Value following `name` in `args`.
fn flag(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Every collection referenced by a replay script.
fn script_collections(script: &str) -> Result<BTreeSet<String>> {
    let value: Value = serde_json::from_str(script)?;
    let blocks = value
        .get("blocks")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("replay script has no blocks"))?;
    Ok(blocks
        .iter()
        .filter_map(|b| b.get("events").and_then(Value::as_array))
        .flatten()
        .filter_map(|e| e.get("collection").and_then(Value::as_str))
        .map(str::to_ascii_lowercase)
        .collect())
}

fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so stdout stays machine-readable.
    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
