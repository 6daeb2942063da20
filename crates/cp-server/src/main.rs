//! Control-plane binary: loads configuration from the environment, wires
//! the Queue, State Machine, Scheduler, Sandbox Pool, Billing Ledger, and
//! Collaboration Gateway together, spawns their background loops, and
//! serves the HTTP + WebSocket surface built by [`cp_server::build_router`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cp_collab::{Gateway, GatewayConfig, RedisSync};
use cp_orchestrator::{DriverConfig, ReconcilerConfig, RunDriver, spawn_driver_loops};
use cp_queue::{JobQueue, RedisQueue};
use cp_sandbox::{PoolConfig, SandboxPool};
use cp_scheduler::{Scheduler, SchedulerConfig};
use cp_server::dev_adapters::LoopbackExecutorBackend;
use cp_server::state::AppState;
use cp_server::{auth::LocalDevVerifier, build_router};
use cp_store::{DurableStore, InMemoryStore};
use dashmap::DashSet;
use tokio_util::sync::CancellationToken;

/// Control-plane binary command line arguments. Everything else is
/// sourced from the environment via `cp_config::Config::from_env`.
#[derive(Parser, Debug)]
#[command(name = "cp-server")]
#[command(about = "Multi-tenant agent run control plane and collaboration gateway")]
struct Args {
    /// Address the HTTP + WebSocket listener binds to.
    #[arg(long, env = "CP_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    /// Identifier of this process in cross-node Redis sync channel names
    /// and dedup ring bookkeeping. Defaults to a random id per boot.
    #[arg(long, env = "CP_POD_ID")]
    pod_id: Option<String>,

    /// Capacity of the dedup ring each cross-node sync subscriber keeps,
    /// to drop envelopes this pod itself published.
    #[arg(long, env = "CP_SYNC_DEDUP_CAPACITY", default_value_t = 4096)]
    sync_dedup_capacity: usize,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn to_collab_breaker_config(config: &cp_config::CircuitBreakerConfig) -> cp_collab::CircuitBreakerConfig {
    cp_collab::CircuitBreakerConfig {
        activation_threshold: config.activation_threshold,
        deactivation_threshold: config.deactivation_threshold,
        open_duration: config.open_duration,
        half_open_max_requests: config.half_open_max_requests,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            tracing_subscriber::EnvFilter::new("cp_server=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("cp_server=info,warn")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cp_config::Config::from_env()?;
    let pod_id = args.pod_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(%pod_id, bind_addr = %args.bind_addr, "starting cp-server");

    // The Durable Store and Token Verifier are abstract ports with no
    // concrete adapter in this workspace; boot against the in-memory
    // reference store and a dev-only bearer-token stand-in so the rest of
    // the control plane can be driven end to end.
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::default());

    let queue: Arc<dyn JobQueue> = match RedisQueue::connect(&config.broker_url).await {
        Ok(queue) => Arc::new(queue),
        Err(err) => {
            tracing::warn!(%err, broker_url = %config.broker_url, "could not reach the broker, falling back to an in-process queue");
            Arc::new(cp_queue::InMemoryQueue::new())
        }
    };

    let scheduler = Scheduler::new(SchedulerConfig {
        base_retry_delay: config.queue.base_retry_delay,
        max_retry_delay: config.queue.max_retry_delay,
        ..SchedulerConfig::default()
    });

    let sandbox = Arc::new(SandboxPool::new(
        Arc::new(LoopbackExecutorBackend),
        PoolConfig {
            min_pool_size: config.sandbox_pool.min_pool_size,
            max_pool_size: config.sandbox_pool.max_pool_size,
            max_sandbox_age: config.sandbox_pool.max_sandbox_age,
            max_idle: config.sandbox_pool.max_idle_seconds,
            warmup_interval: config.sandbox_pool.warmup_interval,
            cleanup_interval: config.sandbox_pool.cleanup_interval,
            expiry_interval: config.sandbox_pool.expiry_interval,
            ..PoolConfig::default()
        },
    ));
    let sandbox_loops = sandbox.spawn_background_loops();

    let billing = Arc::new(cp_billing::BillingLedger::new(
        store.clone(),
        cp_billing::LedgerConfig {
            failure_threshold: config.billing.failure_threshold,
            rate_limit_requests_per_minute: config.rate_limits.billing_requests_per_minute,
        },
    ));

    let driver = Arc::new(RunDriver::new(
        store.clone(),
        queue.clone(),
        scheduler,
        sandbox.clone(),
        billing.clone(),
        DriverConfig::default(),
    ));
    let driver_loops = spawn_driver_loops(driver.clone(), ReconcilerConfig::default());
    let tick_shutdown = CancellationToken::new();
    let tick_loop = {
        let driver = driver.clone();
        let shutdown = tick_shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = driver.tick() => match result {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(Duration::from_millis(200)).await,
                        Err(err) => {
                            tracing::warn!(%err, "driver tick failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                }
            }
        })
    };

    let sync = match RedisSync::connect(&config.broker_url, pod_id.clone(), args.sync_dedup_capacity).await {
        Ok(sync) => Some(Arc::new(sync)),
        Err(err) => {
            tracing::warn!(%err, "cross-node sync unavailable, running as a single node");
            None
        }
    };

    let gateway = Arc::new(Gateway::new(
        GatewayConfig {
            checkpoint_interval: config.ot.checkpoint_interval,
            idle_timeout: Duration::from_secs(300),
            stale_timeout: Duration::from_secs(3600),
            breaker: to_collab_breaker_config(&config.breaker),
            operation_per_minute: config.rate_limits.operation_per_minute,
            cursor_per_minute: config.rate_limits.cursor_per_minute,
            general_per_minute: config.rate_limits.general_per_minute,
            degradation_delay: config.rate_limits.degradation_delay,
            ..GatewayConfig::default()
        },
        sync.clone(),
    ));

    let presence_sweep = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                gateway.sweep_idle();
                gateway.sweep_stale();
            }
        })
    };

    let synced_documents = Arc::new(DashSet::new());

    let backpressure_sampler = {
        let gateway = gateway.clone();
        let synced_documents = synced_documents.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                gateway.sample_backpressure(synced_documents.len() as u64);
            }
        })
    };

    let state = AppState {
        store,
        driver,
        billing,
        gateway,
        token_verifier: Arc::new(LocalDevVerifier),
        synced_documents,
        sync,
    };

    let listener = tokio::net::TcpListener::bind(args.bind_addr).await?;
    tracing::info!(addr = %args.bind_addr, "listening");
    axum::serve(listener, build_router(state)).await?;

    tick_shutdown.cancel();
    tick_loop.abort();
    drop(driver_loops);
    drop(sandbox_loops);
    presence_sweep.abort();
    backpressure_sampler.abort();

    Ok(())
}
