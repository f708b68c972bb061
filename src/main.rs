use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vordr::activation::ActivationHandle;
use vordr::api::{self, ApiContext};
use vordr::blocklist::BlockStore;
use vordr::config::Config;
use vordr::doh_server;
use vordr::metrics::Metrics;
use vordr::pipeline::{
    Pipeline, PipelineHandle, SharedBlockStore, SharedCustomRecords, shared_block_store,
    shared_custom_records,
};
use vordr::records::CustomRecordSet;
use vordr::server::DnsServer;
use vordr::updater;

#[derive(Parser, Debug)]
#[command(name = "vordr", version, about = "Forwarding DNS server with deny-list blocking")]
struct Args {
    /// Location of the config file.
    #[arg(long, default_value = "vordr.toml")]
    config: String,

    /// Force a refresh of the deny-list sources on startup.
    #[arg(long)]
    update: bool,
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("fatal: failed to start runtime: {}", err);
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(args, config));
    std::process::exit(exit_code);
}

async fn run(args: Args, config: Config) -> i32 {
    info!("vordr {} starting", env!("CARGO_PKG_VERSION"));

    let metrics = Arc::new(Metrics::new());
    let activation = ActivationHandle::spawn();

    // Listeners come up against an empty store so vordr can serve as the
    // system resolver while its own lists download.
    let block_store = shared_block_store(BlockStore::new());
    let custom = shared_custom_records(CustomRecordSet::from_lines(&config.custom_dns_records));

    let pipeline = PipelineHandle::spawn(Pipeline::new(
        config.clone(),
        block_store.clone(),
        custom.clone(),
        activation.clone(),
        metrics.clone(),
    ));

    let dns_server = DnsServer::new(&config.bind, pipeline.clone());
    if let Err(err) = dns_server.start().await {
        error!("failed to start dns listeners on {}: {}", config.bind, err);
        return 1;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);

    if config.dns_over_http_server.enabled {
        let doh_config = config.dns_over_http_server.clone();
        let ttl = config.ttl;
        let doh_pipeline = pipeline.clone();
        let doh_metrics = metrics.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = doh_server::run(doh_config, ttl, doh_pipeline, doh_metrics, shutdown).await
            {
                error!("doh server failed: {}", err);
                std::process::exit(1);
            }
        });
    }

    let api_ctx = ApiContext {
        block_store: block_store.clone(),
        activation: activation.clone(),
        reload: reload_tx.clone(),
        metrics: metrics.clone(),
        sources_store: config.blocking.sources_store.clone(),
    };
    {
        let api_config = config.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = api::run(&api_config, api_ctx, shutdown).await {
                error!("api server failed: {}", err);
                std::process::exit(1);
            }
        });
    }

    // Initial import replaces the empty store once the lists are in.
    match updater::perform_update(&config, args.update).await {
        Ok(fresh) => swap_block_store(&block_store, fresh, &metrics),
        Err(err) => {
            error!("initial deny-list import failed: {}", err);
            return 1;
        }
    }

    signal_loop(
        &args.config,
        config,
        block_store,
        custom,
        &mut reload_rx,
        &metrics,
    )
    .await;

    info!("shutting down");
    pipeline.stop();
    dns_server.shutdown();
    let _ = shutdown_tx.send(());
    activation.quit().await;
    0
}

/// Serve signals and reload triggers until SIGINT.
async fn signal_loop(
    config_path: &str,
    mut config: Config,
    block_store: SharedBlockStore,
    custom: SharedCustomRecords,
    reload_rx: &mut mpsc::Receiver<()>,
    metrics: &Arc<Metrics>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("failed to install SIGHUP handler: {}", err);
            std::process::exit(1);
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("failed to install SIGUSR1 handler: {}", err);
            std::process::exit(1);
        }
    };

    loop {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                if let Err(err) = interrupted {
                    error!("signal handler failed: {}", err);
                }
                info!("SIGINT received, stopping");
                break;
            }
            _ = sighup.recv() => {
                // Log sinks go to stderr; nothing to reopen, but the
                // rotation request is acknowledged for operators.
                info!("SIGHUP received: log rotation requested, stderr sink needs no reopen");
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1 received: reloading config");
                match Config::load(config_path) {
                    Ok(fresh) => {
                        swap_custom_records(&custom, &fresh);
                        config = fresh;
                    }
                    Err(err) => {
                        error!("failed to reload config, keeping previous: {}", err);
                    }
                }
            }
            trigger = reload_rx.recv() => {
                if trigger.is_none() {
                    break;
                }
                info!("reload trigger received: rebuilding deny lists");
                // Re-read the config so list sources and custom records
                // edits land together.
                if let Ok(fresh) = Config::load(config_path) {
                    swap_custom_records(&custom, &fresh);
                    config = fresh;
                }
                match updater::perform_update(&config, true).await {
                    Ok(store) => swap_block_store(&block_store, store, metrics),
                    Err(err) => {
                        error!("deny-list rebuild failed, keeping previous store: {}", err);
                    }
                }
            }
        }
    }
}

/// Swap in a freshly built store; queries in flight keep their snapshot.
fn swap_block_store(shared: &SharedBlockStore, fresh: BlockStore, metrics: &Arc<Metrics>) {
    metrics.blocked_names.set(fresh.len() as i64);
    let fresh = Arc::new(fresh);
    *shared.write() = fresh;
    info!("block store swapped");
}

fn swap_custom_records(shared: &SharedCustomRecords, config: &Config) {
    let fresh = Arc::new(CustomRecordSet::from_lines(&config.custom_dns_records));
    if fresh.is_empty() && config.custom_dns_records.is_empty() {
        // Reload with no records is still a legitimate (empty) swap.
        warn!("custom record set is empty after reload");
    }
    *shared.write() = fresh;
    info!("custom records swapped");
}
