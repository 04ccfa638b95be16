use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use elasti::{
    adapters::{
        ElastiServer, EndpointSliceReadiness, HttpClientAdapter, KubeCluster, OperatorClient,
        ResolverHandler, TriggerScalerFactory,
        internal_server::{metrics_router, probe_router, resolver_internal_router, serve_router},
    },
    config::{self, OperatorConfig, ResolverConfig},
    core::{
        HostManager, Reconciler, ScaleHandler, Throttler,
        operator::{CrdDirectory, InformerManager, LeaderElector},
        resolver::{BreakerParams, ThrottlerParams},
    },
    metrics,
    ports::cluster::ClusterApi,
    tracing_setup,
    utils::graceful_shutdown::{GracefulShutdown, ShutdownReason},
};
use http::HeaderName;
use tracing::Instrument;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Run the request-holding reverse proxy
    Resolver {
        /// Optional configuration file layered under the environment
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Run the ElastiService controller and scale handler
    Operator {
        /// Address the metrics endpoint binds to
        #[clap(long)]
        metrics_bind_address: Option<String>,
        /// Address the probe endpoints bind to
        #[clap(long)]
        health_probe_bind_address: Option<String>,
        /// Only run controllers while holding the leader lease
        #[clap(long)]
        leader_elect: bool,
        /// Optional configuration file layered under the environment
        #[clap(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}",
            e
        );
    }

    let component = match &args.command {
        Commands::Resolver { .. } => "resolver",
        Commands::Operator { .. } => "operator",
    };
    tracing_setup::init_from_env(component)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    let shutdown = Arc::new(GracefulShutdown::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move { signal_shutdown.run_signal_handler().await });

    match args.command {
        Commands::Resolver { config } => {
            let cfg = config::load_resolver_config(config.as_deref())?;
            run_resolver(cfg, shutdown)
                .instrument(tracing_setup::component_span("resolver"))
                .await
        }
        Commands::Operator {
            metrics_bind_address,
            health_probe_bind_address,
            leader_elect,
            config,
        } => {
            let mut cfg = config::load_operator_config(config.as_deref())?;
            if let Some(addr) = metrics_bind_address {
                cfg.metrics_bind_address = addr;
            }
            if let Some(addr) = health_probe_bind_address {
                cfg.health_probe_bind_address = addr;
            }
            cfg.leader_elect |= leader_elect;
            run_operator(cfg, shutdown)
                .instrument(tracing_setup::component_span("operator"))
                .await
        }
    }
}

async fn run_resolver(cfg: ResolverConfig, shutdown: Arc<GracefulShutdown>) -> Result<()> {
    tracing::info!("Starting resolver with {:?}", cfg);

    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeCluster::connect()
            .await
            .context("Failed to connect to the cluster")?,
    );
    let throttler = Arc::new(Throttler::new(
        ThrottlerParams {
            breaker: BreakerParams {
                queue_depth: cfg.queue_size,
                max_concurrency: cfg.max_queue_concurrency,
                initial_capacity: cfg.initial_capacity,
            },
            retry_duration: cfg.queue_retry_duration,
            ready_cache_ttl: cfg.traffic_re_enable_duration,
        },
        Arc::new(EndpointSliceReadiness::new(cluster)),
    ));
    let header_for_host = HeaderName::from_bytes(cfg.header_for_host.as_bytes())
        .context("Invalid host header name")?;
    let host_manager = Arc::new(HostManager::new(
        header_for_host,
        cfg.traffic_re_enable_duration,
    ));
    let notifier = Arc::new(
        OperatorClient::new(&cfg.operator_url, cfg.operator_retry_duration)
            .context("Failed to build operator client")?,
    );
    let handler = Arc::new(ResolverHandler::new(
        host_manager,
        throttler.clone(),
        Arc::new(HttpClientAdapter::new(cfg.max_idle_proxy_conns_per_host)),
        notifier,
        cfg.req_timeout,
    ));

    let token = shutdown.cancellation_token();
    tokio::try_join!(
        serve_router("resolver", &cfg.listen_addr, handler.router(), token.clone()),
        serve_router(
            "resolver internal",
            &cfg.internal_listen_addr,
            resolver_internal_router(throttler),
            token.clone(),
        ),
    )
    .map(|_| ())
    .inspect_err(|_| shutdown.trigger_shutdown(ShutdownReason::Requested("server failed".into())))?;

    tracing::info!("Resolver stopped");
    Ok(())
}

async fn run_operator(cfg: OperatorConfig, shutdown: Arc<GracefulShutdown>) -> Result<()> {
    tracing::info!("Starting operator with {:?}", cfg);

    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeCluster::connect()
            .await
            .context("Failed to connect to the cluster")?,
    );
    let token = shutdown.cancellation_token();
    let ready = Arc::new(AtomicBool::new(false));

    // probes and metrics answer while waiting for leadership
    let probes = {
        let (addr, ready, token) = (cfg.health_probe_bind_address.clone(), ready.clone(), token.clone());
        tokio::spawn(async move {
            serve_router("health probes", &addr, probe_router(ready), token).await
        })
    };
    let metrics_server = {
        let (addr, token) = (cfg.metrics_bind_address.clone(), token.clone());
        tokio::spawn(async move { serve_router("metrics", &addr, metrics_router(), token).await })
    };

    let elector = if cfg.leader_elect {
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("elasti-operator-{}", uuid::Uuid::new_v4().simple()));
        let elector = Arc::new(LeaderElector::new(
            cluster.clone(),
            &cfg.elasti_pod_namespace,
            &identity,
        ));
        if !elector.acquire(&token).await {
            tracing::info!("Shutdown before acquiring leadership");
            return join_side_servers(probes, metrics_server).await;
        }
        let renewer = elector.clone();
        let renew_token = token.clone();
        let lost = shutdown.clone();
        tokio::spawn(async move {
            if renewer.renew_until_lost(&renew_token).await {
                lost.trigger_shutdown(ShutdownReason::Requested("leader lease lost".into()));
            }
        });
        Some(elector)
    } else {
        None
    };

    let informer = Arc::new(InformerManager::new(
        cluster.clone(),
        cfg.informer_health_check_interval,
    ));
    tokio::spawn(informer.clone().run_health_check(token.clone()));

    let directory = Arc::new(CrdDirectory::new());
    let reconciler = Reconciler::new(
        cluster.clone(),
        informer.clone(),
        directory.clone(),
        cfg.elasti_pod_namespace.clone(),
    );
    if let Err(e) = reconciler.reconcile_existing().await {
        tracing::error!("Initial reconcile of existing ElastiServices failed: {:#}", e);
    }
    let controller = tokio::spawn(reconciler.clone().run(token.clone()));

    let scale_handler = Arc::new(ScaleHandler::new(
        cluster.clone(),
        Arc::new(TriggerScalerFactory::new().context("Failed to build scaler factory")?),
        cfg.polling_interval,
    ));
    tokio::spawn(scale_handler.clone().run(token.clone()));

    let server = Arc::new(ElastiServer::new(cluster, directory, scale_handler));
    ready.store(true, Ordering::Release);
    tracing::info!("Operator ready");

    let served = serve_router("elasti server", &cfg.elasti_server_addr, server.router(), token.clone()).await;
    if served.is_err() {
        shutdown.trigger_shutdown(ShutdownReason::Requested("elasti server failed".into()));
    }

    match controller.await {
        Ok(Err(e)) => tracing::error!("Controller stopped with error: {:#}", e),
        Err(e) => tracing::error!("Controller task failed: {}", e),
        Ok(Ok(())) => {}
    }
    informer.stop().await;
    if let Some(elector) = elector {
        elector.release().await;
    }
    join_side_servers(probes, metrics_server).await?;
    served?;

    tracing::info!("Operator stopped");
    Ok(())
}

async fn join_side_servers(
    probes: tokio::task::JoinHandle<eyre::Result<()>>,
    metrics_server: tokio::task::JoinHandle<eyre::Result<()>>,
) -> Result<()> {
    for (name, handle) in [("health probes", probes), ("metrics", metrics_server)] {
        handle
            .await
            .map_err(|e| eyre!("{} task failed: {}", name, e))?
            .with_context(|| format!("{name} server failed"))?;
    }
    Ok(())
}
