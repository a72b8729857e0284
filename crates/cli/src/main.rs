use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use converge_core::Gvk;
use converge_kubehub::{ClusterState, KubeCluster, MemoryCluster};
use converge_persist::{HistoryStore, SqliteStore};
use converge_reconcile::{
    DirManifestSource, LogSink, ManifestSource, PassReport, ReconcileConfig, ReconcileSpec, ReconcileState, Reconciler, StatusSink,
};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Converge a cluster to a directory of manifests")]
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
    /// Run one apply + prune pass for every component under DIR
    Reconcile {
        /// Manifest directory: each file or sub-directory is one component
        dir: String,
        /// Owner label value identifying this installation
        #[arg(long, env = "CONVERGE_OWNER", default_value = "converge")]
        owner: String,
        #[arg(long, env = "CONVERGE_REVISION", default_value = "default")]
        revision: String,
        /// Extra kinds to sweep, e.g. "v1/Secret" or "apps/v1/Deployment"
        #[arg(long = "prune-kind")]
        prune_kinds: Vec<String>,
        /// Report what would change without persisting anything
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Re-apply objects whose stored hash already matches
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
        /// Whole-pass deadline in seconds
        #[arg(long = "timeout")]
        timeout_secs: Option<u64>,
        /// Run against an empty in-memory cluster instead of the kubeconfig context
        #[arg(long, action = ArgAction::SetTrue)]
        memory: bool,
        /// Do not record the pass in the history database
        #[arg(long = "no-history", action = ArgAction::SetTrue)]
        no_history: bool,
    },
    /// Parse manifests and print components, keys and content hashes
    Validate {
        dir: String,
    },
    /// Show recorded passes, newest first
    History {
        #[arg(long, env = "CONVERGE_OWNER", default_value = "converge")]
        owner: String,
        #[arg(long = "limit", default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Fans one recorded state out to every configured sink.
struct Sinks(Vec<Arc<dyn StatusSink>>);

impl StatusSink for Sinks {
    fn record(&self, state: &ReconcileState) -> Result<()> {
        for s in &self.0 { s.record(state)?; }
        Ok(())
    }
}

fn print_report(report: &PassReport, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("COMPONENT            PHASE     CREATED UPDATED UNCHANGED PRUNED FAILED");
            for c in &report.components {
                let phase = serde_json::to_value(c.phase)?.as_str().unwrap_or("-").to_string();
                println!("{:<20} {:<9} {:>7} {:>7} {:>9} {:>6} {:>6}", c.name, phase, c.created, c.updated, c.unchanged, c.pruned, c.failed);
            }
            for f in report.failures() { eprintln!("{}", f); }
            println!("pass {} ({} ms)", report.pass_id, report.elapsed.as_millis());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reconcile { dir, owner, revision, prune_kinds, dry_run, force, timeout_secs, memory, no_history } => {
            let mut cfg = ReconcileConfig::from_env();
            cfg.apply.dry_run |= dry_run;
            cfg.force |= force;
            if let Some(secs) = timeout_secs { cfg.pass_timeout = Duration::from_secs(secs); }

            let kinds = prune_kinds
                .iter()
                .map(|k| Gvk::parse_key(k).ok_or_else(|| anyhow!("invalid --prune-kind {:?}; expected v1/Kind or group/v1/Kind", k)))
                .collect::<Result<Vec<_>>>()?;
            let components = DirManifestSource::new(&dir).load().with_context(|| format!("loading manifests from {}", dir))?;
            let mut spec = ReconcileSpec::new(&owner, &revision);
            spec.components = components;
            spec.prune_kinds = kinds;
            info!(dir = %dir, owner = %owner, revision = %revision, components = spec.components.len(), "reconcile invoked");

            let cluster: Arc<dyn ClusterState> = if memory {
                Arc::new(MemoryCluster::new())
            } else {
                Arc::new(KubeCluster::try_default().await.context("connecting to cluster")?)
            };
            let mut sinks: Vec<Arc<dyn StatusSink>> = vec![Arc::new(LogSink)];
            if !no_history && !cfg.dry_run() {
                match SqliteStore::open_default() {
                    Ok(store) => sinks.push(Arc::new(store)),
                    Err(e) => warn!(error = %e, "history store unavailable; pass will not be recorded"),
                }
            }
            let reconciler = Reconciler::new(cluster, cfg).with_sink(Arc::new(Sinks(sinks)));
            let shutdown = reconciler.shutdown_token();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("Ctrl-C received; cancelling pass");
                    shutdown.cancel();
                }
            });

            let mut state = ReconcileState::new(spec);
            let report = reconciler.reconcile_state(&mut state).await?;
            print_report(&report, cli.output)?;
            let failed = report.failed_components();
            if failed > 0 {
                error!(failed, "pass finished with failed components");
                bail!("{} component(s) failed", failed);
            }
        }
        Commands::Validate { dir } => {
            let components = DirManifestSource::new(&dir).load().with_context(|| format!("loading manifests from {}", dir))?;
            match cli.output {
                Output::Human => {
                    for c in &components {
                        println!("{} ({} objects)", c.name, c.objects.len());
                        for o in &c.objects { println!("  {}  {}", &o.hash()[..12], o.key()); }
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row { component: String, key: String, hash: String }
                    let rows: Vec<Row> = components
                        .iter()
                        .flat_map(|c| c.objects.iter().map(move |o| Row { component: c.name.clone(), key: o.key().to_string(), hash: o.hash() }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::History { owner, limit } => {
            let store = SqliteStore::open_default()?;
            let rows = store.history(&owner, Some(limit))?;
            match cli.output {
                Output::Human => {
                    println!("PASS                                  REVISION     FAILED  AGE");
                    for r in &rows {
                        println!("{:<37} {:<12} {:>6}  {}", r.pass_id, r.revision, r.failed, render_age(r.ts));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }

    Ok(())
}

fn render_age(ts: i64) -> String {
    if ts <= 0 { return "-".to_string(); }
    let mut secs = (converge_persist::now_ts() - ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
