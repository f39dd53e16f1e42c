//! sah-elect - command-line front end for file-lock leader election.
//!
//! Commands:
//! - `sah-elect run [--root <dir>] [--config <file>] <namespace>...`: join the election and
//!   print one JSON line per leadership change until Ctrl-C
//! - `sah-elect inspect --root <dir> <namespace>`: print the namespace's leader record
//!
//! Exit codes:
//! - 0: Success
//! - 1: Error

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use swissarmyhammer_leader_election::{
    codec, now_millis, validate_namespace, ClusterConfig, ClusterService, LeaderInfo,
    LeadershipEvent,
};

mod cli;

use cli::{Cli, Commands};

/// Leader record of a namespace as printed by `inspect`.
#[derive(Debug, Serialize)]
struct InspectReport {
    namespace: String,
    leader: Option<LeaderInfo>,
    age_millis: Option<i64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("swissarmyhammer_leader_election=debug,sah_elect=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Run {
            root,
            config,
            member_id,
            namespaces,
        } => result_to_exit(run(root, config.as_deref(), member_id, &namespaces).await),
        Commands::Inspect { root, namespace } => result_to_exit(inspect(&root, &namespace)),
    };
    std::process::exit(exit_code);
}

/// Convert a `Result<(), E: Display>` to an exit code.
fn result_to_exit<E: std::fmt::Display>(result: Result<(), E>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn run(
    root: Option<PathBuf>,
    config_file: Option<&Path>,
    member_id: Option<String>,
    namespaces: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ClusterConfig::load(config_file)?;
    if let Some(root) = root {
        config = config.with_root(root);
    }
    if let Some(member_id) = member_id {
        config = config.with_member_id(member_id);
    }

    let service = ClusterService::new(config)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    for namespace in namespaces {
        forward_events(service.subscribe(namespace)?, tx.clone());
    }
    drop(tx);

    service.start()?;
    tracing::info!(
        "Member {} joined {} namespace(s)",
        service.member_id(),
        namespaces.len()
    );

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                stdout.flush()?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    service.stop();
    Ok(())
}

/// Pump one namespace's notifications into the shared output channel
fn forward_events(
    mut events: broadcast::Receiver<LeadershipEvent>,
    tx: mpsc::UnboundedSender<LeadershipEvent>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} leadership events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn inspect(root: &Path, namespace: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = read_report(root, namespace)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_report(
    root: &Path,
    namespace: &str,
) -> swissarmyhammer_leader_election::Result<InspectReport> {
    validate_namespace(namespace)?;
    let leader = codec::read_leader_info_from_path(&root.join(namespace))?;
    let age_millis = leader
        .as_ref()
        .map(|info| now_millis().saturating_sub(info.heartbeat_millis()));
    Ok(InspectReport {
        namespace: namespace.to_string(),
        leader,
        age_millis,
    })
}
