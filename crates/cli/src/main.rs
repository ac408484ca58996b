use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use cumulus_api::{DeleteMode, KindConfig, MemoryBackend};
use cumulus_core::{KindId, ScopeLevel};
use cumulus_kinds::{Machine, CLUSTER, EXTERNAL_IP, IMAGE, MACHINE, QUOTA, SIZE, TENANCY, VOLUME};
use cumulus_store::MirrorSnapshot;
use cumulus_sync::{spawn_engine, EngineHandle, SyncConfig};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cumulusctl", version, about = "Cumulus sync engine CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the registered resource kinds and their cadences
    Kinds {
        /// Also print the cross-kind effect table
        #[arg(long = "effects", action = ArgAction::SetTrue)]
        effects: bool,
    },
    /// Run the engine against an in-memory cloud and print store changes
    Simulate {
        /// Project to select after login
        #[arg(long = "project", default_value = "research")]
        project: String,
        /// Stop after this many seconds
        #[arg(long = "secs", default_value_t = 30)]
        secs: u64,
        /// Override every kind's list refresh interval
        #[arg(long = "poll-secs", env = "CUMULUS_POLL_SECS")]
        poll_secs: Option<u64>,
        /// Override every kind's settle delay
        #[arg(long = "settle-ms", env = "CUMULUS_SETTLE_MS")]
        settle_ms: Option<u64>,
        /// Do not issue the scripted create / update / delete calls
        #[arg(long = "idle", action = ArgAction::SetTrue)]
        idle: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("CUMULUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CUMULUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CUMULUS_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(serde::Serialize)]
struct KindRow {
    kind: &'static str,
    level: ScopeLevel,
    poll_secs: u64,
    settle_ms: u128,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds { effects } => {
            let rows: Vec<KindRow> = cumulus_kinds::registry()
                .iter()
                .map(|k| KindRow {
                    kind: k.id().as_str(),
                    level: k.level(),
                    poll_secs: k.poll_interval().as_secs(),
                    settle_ms: k.settle_delay().as_millis(),
                })
                .collect();
            match cli.output {
                Output::Human => {
                    println!("{:<18} {:<8} {:>6} {:>8}", "KIND", "LEVEL", "POLL", "SETTLE");
                    for r in &rows {
                        let level = match r.level { ScopeLevel::Session => "session", ScopeLevel::Project => "project" };
                        println!("{:<18} {:<8} {:>5}s {:>6}ms", r.kind, level, r.poll_secs, r.settle_ms);
                    }
                    if effects {
                        println!();
                        for e in cumulus_kinds::effects().iter() {
                            println!("{} {:?} -> {:?}", e.source, e.trigger, e.reaction);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Simulate { project, secs, poll_secs, settle_ms, idle } => {
            let mut config = SyncConfig::from_env();
            config.prime_on_enter = true;
            if let Some(p) = poll_secs { config.poll_override = Some(Duration::from_secs(p)); }
            if let Some(s) = settle_ms { config.settle_override = Some(Duration::from_millis(s)); }
            info!(project = %project, secs, ?config, "simulate invoked");

            let backend = Arc::new(demo_cloud(&project).with_latency(Duration::from_millis(150)));
            let (handle, join) = spawn_engine(cumulus_kinds::registry(), cumulus_kinds::effects(), backend, config);
            let mut notices = handle.notices();
            let mut epochs = handle.subscribe();
            handle.begin_session().await?;
            handle.select_project(project.as_str()).await?;

            let script = if idle { None } else { Some(tokio::spawn(run_script(handle.clone()))) };
            let deadline = tokio::time::sleep(Duration::from_secs(secs));
            tokio::pin!(deadline);
            let mut seen = BTreeMap::new();
            loop {
                tokio::select! {
                    changed = epochs.changed() => {
                        if changed.is_err() { warn!("engine stopped; exiting"); break; }
                        if matches!(cli.output, Output::Human) {
                            print_changes(&mut seen, &handle.mirror());
                        }
                    }
                    notice = notices.recv() => {
                        if let Ok(n) = notice {
                            eprintln!("! #{} {}: {}", n.id, n.title, n.message);
                        }
                    }
                    _ = &mut deadline => {
                        info!("simulation time elapsed");
                        break;
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping simulation");
                        break;
                    }
                }
            }
            if let Some(task) = script { task.abort(); }

            if matches!(cli.output, Output::Json) {
                println!("{}", serde_json::to_string_pretty(&*handle.mirror())?);
            }
            handle.end_session().await?;
            handle.shutdown().await?;
            join.await?;
        }
    }

    Ok(())
}

/// An in-memory cloud with a little of everything, including resources that
/// are still building when first listed.
fn demo_cloud(project: &str) -> MemoryBackend {
    let be = MemoryBackend::new();
    be.seed(TENANCY, project, json!({"id": project, "name": "Research"}));
    be.seed(TENANCY, "staging", json!({"id": "staging", "name": "Staging"}));
    for (res, used, limit) in [("cores", 6, 32), ("ram", 12288, 65536), ("volumes", 1, 10)] {
        be.seed(QUOTA, res, json!({"resource": res, "used": used, "limit": limit}));
    }
    be.seed(IMAGE, "img-ubuntu", json!({"id": "img-ubuntu", "name": "ubuntu-24.04", "status": "active"}));
    be.seed(SIZE, "s-small", json!({"id": "s-small", "vcpus": 2, "ram": 4096}));

    be.configure(MACHINE, KindConfig {
        create_steps: vec![json!({"status": "BUILD"}), json!({"status": "BUILD"}), json!({"status": "ACTIVE"})],
        ..Default::default()
    });
    be.seed(MACHINE, "web-1", json!({"id": "web-1", "name": "web", "status": "ACTIVE"}));
    be.seed(MACHINE, "build-1", json!({"id": "build-1", "name": "builder", "status": "BUILD"}));
    be.script(MACHINE, "build-1", vec![json!({"status": "BUILD"}), json!({"status": "ACTIVE"})]);
    be.set_aux(MACHINE, "web-1", Machine::LOGS, json!("cloud-init: done"));

    be.seed(VOLUME, "data-1", json!({"id": "data-1", "size": 20, "status": "in-use", "machine_id": "web-1"}));
    be.seed(EXTERNAL_IP, "ip-1", json!({"id": "ip-1", "address": "203.0.113.7", "machine_id": null}));

    be.configure(CLUSTER, KindConfig {
        delete: DeleteMode::Soft { status: "DELETING", linger: 2 },
        create_steps: vec![json!({"status": "CONFIGURING"}), json!({"status": "CONFIGURING"}), json!({"status": "READY"})],
    });
    be.seed(CLUSTER, "k8s-1", json!({"id": "k8s-1", "name": "prod", "status": "READY"}));
    be
}

async fn run_script(handle: EngineHandle) {
    for step in ["create machine", "attach address", "delete cluster", "fetch logs"] {
        tokio::time::sleep(Duration::from_secs(1)).await;
        info!(step, "script");
        let res = match step {
            "create machine" => handle.create(MACHINE, json!({"name": "worker"})).await,
            "attach address" => handle.update(EXTERNAL_IP, "ip-1", json!({"machine_id": "web-1"})).await,
            "delete cluster" => handle.delete(CLUSTER, "k8s-1").await,
            _ => handle.auxiliary(MACHINE, "web-1", Machine::LOGS).await,
        };
        if let Err(e) = res {
            warn!(step, error = %e, "script step failed");
            return;
        }
    }
}

fn describe(kind: KindId, snap: &MirrorSnapshot) -> Vec<(String, String)> {
    let Some(store) = snap.kind(kind) else { return Vec::new() };
    store
        .ids()
        .into_iter()
        .filter_map(|id| {
            let rec = store.get(id)?;
            let status = rec.data.get("status").and_then(|v| v.as_str()).unwrap_or("-");
            let flags: Vec<String> = rec.flags.iter().map(|f| f.to_string()).collect();
            let line = if flags.is_empty() { status.to_string() } else { format!("{} [{}]", status, flags.join(",")) };
            Some((format!("{}/{}", kind, id), line))
        })
        .collect()
}

/// Print `+ kind/id state` for new or changed records and `- kind/id` for removed ones.
fn print_changes(seen: &mut BTreeMap<String, String>, snap: &MirrorSnapshot) {
    let mut now = BTreeMap::new();
    let mut kinds: Vec<KindId> = snap.kinds.keys().copied().collect();
    kinds.sort();
    for kind in kinds {
        now.extend(describe(kind, snap));
    }
    for (key, line) in &now {
        if seen.get(key) != Some(line) {
            println!("+ {} {}", key, line);
        }
    }
    for key in seen.keys() {
        if !now.contains_key(key) {
            println!("- {}", key);
        }
    }
    *seen = now;
}
