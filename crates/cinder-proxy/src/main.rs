mod backend;
mod config;
mod connection;
mod server;
mod stats;

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use cinder_core::pool::{spawn_pool, GroupConfig, HelperTask, PoolHandle};
use cinder_core::{Continuum, StaticRules};
use clap::Parser;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{PoolConfig, ProxyConfig};
use crate::connection::PoolContext;

#[derive(Parser)]
#[command(name = "cinder-proxy", about = "cinder table-cache proxy")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// global maximum concurrent client connections
    #[arg(long, env = "CINDER_MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// listen address override for the first pool
    #[arg(long, env = "CINDER_LISTEN")]
    listen: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        print!("{}", config::template());
        return;
    }

    let mut cfg = match args.config {
        Some(ref path) => config::load(path).unwrap_or_else(|e| exit_err(e)),
        None => ProxyConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = config::validate(&cfg) {
        exit_err(e);
    }

    // each process is one single-threaded worker; horizontal scaling
    // comes from running more worker processes on the same address
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| exit_err(format!("failed to build runtime: {e}")));

    if let Err(e) = rt.block_on(run(cfg)) {
        exit_err(e);
    }
}

/// Applies CLI overrides. Only `Some` values take effect, preserving
/// the resolution order: defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut ProxyConfig, args: &Args) {
    if let Some(v) = args.max_clients {
        cfg.max_clients = v;
    }
    if let Some(ref listen) = args.listen {
        if let Some(pool) = cfg.pools.first_mut() {
            pool.listen = listen.clone();
        }
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

async fn run(cfg: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let global_clients = Arc::new(Semaphore::new(cfg.max_clients));
    let unit_ids = Arc::new(AtomicU64::new(1));

    let mut pool_handles = Vec::new();
    let mut accept_tasks = Vec::new();

    for pool_cfg in &cfg.pools {
        let (pool, ctx) = start_pool(pool_cfg, unit_ids.clone());

        let listener = server::bind(&pool_cfg.listen, pool_cfg.backlog)?;
        info!(
            pool = %pool_cfg.name,
            addr = %pool_cfg.listen,
            backends = pool_cfg.backends.len(),
            "listening"
        );

        let per_pool = Arc::new(Semaphore::new(pool_cfg.max_clients));
        accept_tasks.push(tokio::spawn(server::accept_loop(
            listener,
            ctx,
            global_clients.clone(),
            per_pool,
        )));

        spawn_stats_poller(pool.clone(), Duration::from_secs(cfg.stats_interval_secs.max(1)));
        pool_handles.push(pool);
    }

    // SIGHUP delivers a reload control job through the schedulers so it
    // serializes with in-flight traffic; SIGINT/SIGTERM drain and exit
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = hangup.recv() => {
                info!("reload signal received, notifying helper groups");
                let unit = backend::reload_unit();
                for pool in &pool_handles {
                    pool.reload(unit.clone()).await;
                }
            }
        }
    }

    info!("shutdown signal received, draining connections...");
    for task in &accept_tasks {
        task.abort();
    }
    let permits = cfg.max_clients.min(u32::MAX as usize) as u32;
    let _ = global_clients.acquire_many(permits).await;
    info!("all connections drained, shutting down");

    Ok(())
}

/// Builds the connector groups, helper tasks, and shared context for
/// one pool.
fn start_pool(pool_cfg: &PoolConfig, unit_ids: Arc<AtomicU64>) -> (PoolHandle, Arc<PoolContext>) {
    // validated before we get here
    let hash = config::parse_hash_kind(&pool_cfg.hash).expect("validated hash kind");
    let key_type = config::parse_key_type(&pool_cfg.key_type).expect("validated key type");

    let mut groups: Vec<GroupConfig> = Vec::new();
    // (group index, backend address, helper task receivers)
    let mut helper_plan: Vec<(usize, String, Vec<mpsc::Receiver<HelperTask>>)> = Vec::new();

    let mut cache_groups = Vec::new();
    for (i, b) in pool_cfg.backends.iter().enumerate() {
        let (group, rxs) = build_group(
            format!("{}-cache-{i}", pool_cfg.name),
            pool_cfg.helper_count,
            pool_cfg.queue_capacity,
            b.fallback,
        );
        cache_groups.push(groups.len());
        helper_plan.push((groups.len(), b.addr.clone(), rxs));
        groups.push(group);
    }

    let side_group = |tag: &str, side: &config::SideBackendConfig,
                          groups: &mut Vec<GroupConfig>,
                          helper_plan: &mut Vec<(usize, String, Vec<mpsc::Receiver<HelperTask>>)>| {
        let (group, rxs) = build_group(
            format!("{}-{tag}", pool_cfg.name),
            side.helper_count.unwrap_or(pool_cfg.helper_count),
            side.queue_capacity.unwrap_or(pool_cfg.queue_capacity),
            None,
        );
        helper_plan.push((groups.len(), side.addr.clone(), rxs));
        groups.push(group);
        groups.len() - 1
    };

    let hot_group = pool_cfg
        .hot_backend
        .as_ref()
        .map(|side| side_group("hot", side, &mut groups, &mut helper_plan));
    let full_group = pool_cfg
        .full_backend
        .as_ref()
        .map(|side| side_group("full", side, &mut groups, &mut helper_plan));

    let group_names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();

    // the tick bounds how long an expired queued job can linger
    let tick = Duration::from_millis((pool_cfg.timeout_ms / 2).clamp(100, 1_000));
    let pool = spawn_pool(groups, tick);

    for (gi, addr, rxs) in helper_plan {
        for (hi, rx) in rxs.into_iter().enumerate() {
            tokio::spawn(backend::run_helper(
                addr.clone(),
                gi,
                group_names[gi].clone(),
                hi,
                pool.clone(),
                rx,
            ));
        }
    }

    let weights: Vec<u32> = pool_cfg.backends.iter().map(|b| b.weight).collect();
    let ctx = Arc::new(PoolContext {
        name: pool_cfg.name.clone(),
        continuum: Continuum::weighted(&weights),
        hash,
        key_field: pool_cfg.key_field.clone().into_bytes(),
        key_type,
        timeout: Duration::from_millis(pool_cfg.timeout_ms),
        pool: pool.clone(),
        cache_groups,
        hot_group,
        full_group,
        classifier: Arc::new(StaticRules::new(
            pool_cfg.cacheable_tables.clone(),
            pool_cfg.hot_tables.clone(),
        )),
        synth_keys: AtomicU64::new(rand::random()),
        unit_ids,
    });

    (pool, ctx)
}

/// Creates one connector group's task channels: capacity 1, because a
/// helper executes one task at a time.
fn build_group(
    name: String,
    helper_count: usize,
    queue_capacity: usize,
    fallback: Option<usize>,
) -> (GroupConfig, Vec<mpsc::Receiver<HelperTask>>) {
    let mut txs = Vec::new();
    let mut rxs = Vec::new();
    for _ in 0..helper_count {
        let (tx, rx) = mpsc::channel(1);
        txs.push(tx);
        rxs.push(rx);
    }
    (
        GroupConfig {
            name,
            queue_capacity,
            fallback,
            helpers: txs,
        },
        rxs,
    )
}

/// Periodically snapshots a pool and refreshes its gauges.
fn spawn_stats_poller(pool: PoolHandle, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(snapshot) = pool.stats().await else {
                return;
            };
            stats::record_group_gauges(&snapshot);
            for g in &snapshot {
                debug!(
                    group = %g.name,
                    busy = g.busy,
                    ready = g.ready,
                    helpers = g.helpers,
                    queued = g.queued,
                    expired = g.expired,
                    shed = g.shed,
                    avg_delay_us = g.average_delay_us,
                    "group state"
                );
            }
        }
    });
}
