//! meshnode-agent main entry point
//!
//! CLI parsing, logging setup, and daemon initialization. Wires the
//! `NodeConfig`/`Reconciler`/`EventDispatcher` architecture end to end: one
//! mesh WireGuard interface, policy enforcement, and the optional bridge,
//! site-to-site, user-access, relay, and ingress subsystems, all converged by
//! a single reconciler loop and fed by a push-event stream.

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use meshnode_agent::{
    bridge::{BridgeRouteManager, LinuxRouteController},
    config::NodeConfig,
    control::{CommandHandler, ControlServer, NodeHandles},
    control_plane::{run_event_stream, HttpReporter, HttpStateFetcher, TelemetryKind},
    events::{handlers as event_handlers, EventDispatcher, EventType, TriggerOnlyHandler},
    ingress::IngressManager,
    policy::{Enforcer, LinuxFirewallController, PeerApplier, PolicyReconcileHandler},
    reconcile::Reconciler,
    relay::Relay,
    security::SecurityContext,
    service::{create_service, ServiceMode},
    sitetosite::{LinuxSiteToSiteController, SiteToSiteManager},
    telemetry::BufferedBatchReporter,
    useraccess::{LinuxUserAccessController, UserAccessManager},
    wireguard::{driver::LinuxWgController, KeyPair, WireGuardManager, WireGuardSettings},
    APP_NAME, VERSION,
};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cross-platform mesh-VPN node agent
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "/etc/meshnode-agent/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the agent daemon
    Start,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("starting {} v{}", APP_NAME, VERSION);

    if let Err(e) = run(cli).await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Version => {
            println!("{} v{}", APP_NAME, VERSION);
            Ok(())
        }
        Commands::Start => start(&cli.config).await,
    }
}

async fn start(config_path: &str) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(config_path)?;
    info!("loaded configuration for node {}", config.node_id);

    meshnode_agent::security::validate_secure_defaults()?;
    let mut security = SecurityContext::new();
    if security.is_elevated() {
        security.lock_memory()?;
    }

    let mode = ServiceMode::detect();
    info!("service mode: {:?}", mode);
    let mut service = create_service(mode);
    service.init()?;
    service.start()?;
    service.notify_ready()?;

    let keypair = KeyPair::from_file(&config.wireguard.private_key_path)?;

    let wg_controller = Arc::new(LinuxWgController::new());
    let wg_manager = Arc::new(WireGuardManager::new(
        WireGuardSettings {
            interface: config.wireguard.interface.clone(),
            private_key: keypair.private.to_base64(),
            listen_port: config.wireguard.listen_port,
            mesh_address: config.wireguard.mesh_address.clone(),
            mtu: config.wireguard.mtu,
            persistent_keepalive: config.wireguard.persistent_keepalive_secs,
        },
        wg_controller,
    ));
    wg_manager.setup().await?;
    info!("wireguard interface {} ready", config.wireguard.interface);

    let firewall_controller = Arc::new(LinuxFirewallController::new(APP_NAME));
    let enforcer = Arc::new(Enforcer::new(
        firewall_controller,
        APP_NAME,
        &config.wireguard.interface,
        &config.node_id,
        true,
    ));
    let policy_handler = Arc::new(PolicyReconcileHandler::new(
        enforcer.clone(),
        wg_manager.clone() as Arc<dyn PeerApplier>,
    ));

    let bridge_manager = if config.bridge.enabled {
        let controller = Arc::new(LinuxRouteController::new());
        Some(Arc::new(BridgeRouteManager::new(controller, &config.wireguard.interface)))
    } else {
        None
    };

    let sitetosite_manager = if config.site_to_site.enabled {
        let controller = Arc::new(LinuxSiteToSiteController::new());
        Some(Arc::new(SiteToSiteManager::new(controller)))
    } else {
        None
    };

    let useraccess_manager = if config.user_access.enabled {
        let controller = Arc::new(LinuxUserAccessController::new());
        Some(Arc::new(UserAccessManager::new(controller)))
    } else {
        None
    };

    let relay = if config.relay.enabled {
        let relay = Arc::new(Relay::new(config.relay.max_sessions, config.relay.default_ttl));
        let bound = relay.start(config.relay.bind_port).await?;
        info!("relay listening on {}", bound);
        Some(relay)
    } else {
        None
    };

    let ingress_manager = if config.ingress.enabled {
        Some(Arc::new(IngressManager::new(
            config.ingress.max_rules,
            config.ingress.dial_timeout,
        )))
    } else {
        None
    };

    let fetcher = Arc::new(HttpStateFetcher::new(config.control_plane_url.clone()));

    // bridge/sitetosite/useraccess each gate their reconcile() on an
    // internally-tracked peer/metadata drift signal, so a first cycle with no
    // peer changes would never call their setup()/reconcile_config(). Bootstrap
    // each enabled subsystem from one up-front fetch before starting the loop.
    let bootstrap_state = fetcher.fetch_state(&config.node_id).await?;
    if let Some(bridge_manager) = &bridge_manager {
        bridge_manager.setup(&bootstrap_state.bridge).await?;
    }
    if let Some(sitetosite_manager) = &sitetosite_manager {
        sitetosite_manager.reconcile_config(&bootstrap_state.site_to_site).await?;
    }
    if let Some(useraccess_manager) = &useraccess_manager {
        useraccess_manager.reconcile_config(&bootstrap_state.user_access).await?;
    }
    if let Some(relay) = &relay {
        relay.reconcile_config(&bootstrap_state.relay).await?;
    }
    if let Some(ingress_manager) = &ingress_manager {
        ingress_manager.reconcile_config(&bootstrap_state.ingress).await?;
    }

    let reconciler = Arc::new(Reconciler::new(fetcher.clone(), config.reconcile_interval));
    reconciler.register_handler(wg_manager.clone()).await;
    reconciler.register_handler(policy_handler).await;
    if let Some(bridge_manager) = &bridge_manager {
        reconciler.register_handler(bridge_manager.clone()).await;
    }
    if let Some(sitetosite_manager) = &sitetosite_manager {
        reconciler.register_handler(sitetosite_manager.clone()).await;
    }
    if let Some(useraccess_manager) = &useraccess_manager {
        reconciler.register_handler(useraccess_manager.clone()).await;
    }
    if let Some(relay) = &relay {
        reconciler.register_handler(relay.clone()).await;
    }
    if let Some(ingress_manager) = &ingress_manager {
        reconciler.register_handler(ingress_manager.clone()).await;
    }

    let dispatcher = Arc::new(EventDispatcher::new());
    let peer_applier = wg_manager.clone() as Arc<dyn PeerApplier>;
    let peer_upsert_handler = Arc::new(event_handlers::PeerUpsertHandler::new(peer_applier.clone()));
    dispatcher.register(EventType::PeerAdded, peer_upsert_handler.clone()).await;
    dispatcher.register(EventType::PeerKeyRotated, peer_upsert_handler.clone()).await;
    dispatcher.register(EventType::PeerEndpointChanged, peer_upsert_handler).await;
    dispatcher
        .register(
            EventType::PeerRemoved,
            Arc::new(event_handlers::PeerRemovedHandler::new(peer_applier)),
        )
        .await;

    {
        let reconciler = reconciler.clone();
        dispatcher
            .register(
                EventType::PolicyUpdated,
                Arc::new(TriggerOnlyHandler::new("policy-updated-trigger", move || {
                    reconciler.trigger_reconcile();
                })),
            )
            .await;
    }

    if bridge_manager.is_some() {
        let reconciler = reconciler.clone();
        dispatcher
            .register(
                EventType::BridgeConfigUpdated,
                Arc::new(TriggerOnlyHandler::new("bridge-config-updated-trigger", move || {
                    reconciler.trigger_reconcile();
                })),
            )
            .await;
    }

    if let Some(sitetosite_manager) = &sitetosite_manager {
        let reconciler = reconciler.clone();
        dispatcher
            .register(
                EventType::SiteToSiteConfigUpdated,
                Arc::new(TriggerOnlyHandler::new("site-to-site-config-updated-trigger", move || {
                    reconciler.trigger_reconcile();
                })),
            )
            .await;
        dispatcher
            .register(
                EventType::SiteToSiteTunnelAssigned,
                Arc::new(event_handlers::SiteToSiteTunnelAssignedHandler::new(sitetosite_manager.clone())),
            )
            .await;
        dispatcher
            .register(
                EventType::SiteToSiteTunnelRevoked,
                Arc::new(event_handlers::SiteToSiteTunnelRevokedHandler::new(sitetosite_manager.clone())),
            )
            .await;
    }

    if let Some(useraccess_manager) = &useraccess_manager {
        let reconciler = reconciler.clone();
        dispatcher
            .register(
                EventType::UserAccessConfigUpdated,
                Arc::new(TriggerOnlyHandler::new("user-access-config-updated-trigger", move || {
                    reconciler.trigger_reconcile();
                })),
            )
            .await;
        dispatcher
            .register(
                EventType::UserAccessPeerAssigned,
                Arc::new(event_handlers::UserAccessPeerAssignedHandler::new(useraccess_manager.clone())),
            )
            .await;
        dispatcher
            .register(
                EventType::UserAccessPeerRevoked,
                Arc::new(event_handlers::UserAccessPeerRevokedHandler::new(useraccess_manager.clone())),
            )
            .await;
    }

    if let Some(relay) = &relay {
        dispatcher
            .register(
                EventType::RelaySessionAssigned,
                Arc::new(event_handlers::RelaySessionAssignedHandler::new(relay.clone())),
            )
            .await;
        dispatcher
            .register(
                EventType::RelaySessionRevoked,
                Arc::new(event_handlers::RelaySessionRevokedHandler::new(relay.clone())),
            )
            .await;
    }

    if let Some(ingress_manager) = &ingress_manager {
        let reconciler = reconciler.clone();
        dispatcher
            .register(
                EventType::IngressConfigUpdated,
                Arc::new(TriggerOnlyHandler::new("ingress-config-updated-trigger", move || {
                    reconciler.trigger_reconcile();
                })),
            )
            .await;
        dispatcher
            .register(
                EventType::IngressRuleAssigned,
                Arc::new(event_handlers::IngressRuleAssignedHandler::new(
                    ingress_manager.clone(),
                    config.ingress.dial_timeout,
                )),
            )
            .await;
        dispatcher
            .register(
                EventType::IngressRuleRevoked,
                Arc::new(event_handlers::IngressRuleRevokedHandler::new(ingress_manager.clone())),
            )
            .await;
    }

    let telemetry_config: meshnode_agent::telemetry::TelemetryConfig = (&config.telemetry).into();
    let metrics_reporter = Arc::new(BufferedBatchReporter::<serde_json::Value>::new(
        telemetry_config.clone(),
        Arc::new(HttpReporter::new(config.control_plane_url.clone(), TelemetryKind::Metrics)),
        config.node_id.clone(),
    ));
    let logs_reporter = Arc::new(BufferedBatchReporter::<serde_json::Value>::new(
        telemetry_config.clone(),
        Arc::new(HttpReporter::new(config.control_plane_url.clone(), TelemetryKind::Logs)),
        config.node_id.clone(),
    ));
    let audit_reporter = Arc::new(BufferedBatchReporter::<serde_json::Value>::new(
        telemetry_config,
        Arc::new(HttpReporter::new(config.control_plane_url.clone(), TelemetryKind::Audit)),
        config.node_id.clone(),
    ));

    let handles = NodeHandles {
        interface: config.wireguard.interface.clone(),
        peer_index: wg_manager.peer_index(),
        enforcer: enforcer.clone(),
        relay: relay.clone(),
        ingress: ingress_manager.clone(),
    };
    let command_handler = Arc::new(CommandHandler::new(handles));
    let control_server = if config.control_api.enabled {
        Some(Arc::new(ControlServer::new(
            PathBuf::from(&config.control_api.socket_path),
            command_handler,
        )))
    } else {
        None
    };

    let shutdown_token = CancellationToken::new();

    let reconciler_task = {
        let reconciler = reconciler.clone();
        let token = shutdown_token.clone();
        let node_id = config.node_id.clone();
        tokio::spawn(async move {
            reconciler.run(token, &node_id).await;
        })
    };

    let event_stream_task = {
        let dispatcher = dispatcher.clone();
        let token = shutdown_token.clone();
        let base_url = config.control_plane_url.clone();
        let node_id = config.node_id.clone();
        tokio::spawn(async move {
            run_event_stream(&base_url, &node_id, dispatcher, token).await;
        })
    };

    let telemetry_task = {
        let metrics_reporter = metrics_reporter.clone();
        let logs_reporter = logs_reporter.clone();
        let audit_reporter = audit_reporter.clone();
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            tokio::join!(
                metrics_reporter.run(token.clone()),
                logs_reporter.run(token.clone()),
                audit_reporter.run(token),
            );
        })
    };

    let control_task = control_server.as_ref().map(|server| {
        let server = server.clone();
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = server.start() => {
                    if let Err(e) = result {
                        error!("control server error: {}", e);
                    }
                }
                _ = token.cancelled() => {}
            }
        })
    });

    let health_app = Router::new().route("/healthz", get(healthz));
    let health_addr = "127.0.0.1:9090";
    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    info!("health endpoint listening on {}", health_addr);
    let health_task = {
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            let _ = axum::serve(health_listener, health_app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received, tearing down");
    service.notify_stopping()?;
    shutdown_token.cancel();

    let _ = reconciler_task.await;
    let _ = event_stream_task.await;
    let _ = telemetry_task.await;
    if let Some(task) = control_task {
        let _ = task.await;
    }
    let _ = health_task.await;

    if let Some(server) = &control_server {
        if let Err(e) = server.shutdown().await {
            warn!("failed to shut down control server: {}", e);
        }
    }
    if let Some(ingress_manager) = &ingress_manager {
        if let Err(e) = ingress_manager.teardown().await {
            warn!("ingress teardown error: {}", e);
        }
    }
    if let Some(relay) = &relay {
        relay.stop().await;
    }
    if let Some(useraccess_manager) = &useraccess_manager {
        if let Err(e) = useraccess_manager.teardown().await {
            warn!("user-access teardown error: {}", e);
        }
    }
    if let Some(sitetosite_manager) = &sitetosite_manager {
        if let Err(e) = sitetosite_manager.teardown().await {
            warn!("site-to-site teardown error: {}", e);
        }
    }
    if let Some(bridge_manager) = &bridge_manager {
        if let Err(e) = bridge_manager.teardown(&config.bridge.access_interface).await {
            warn!("bridge teardown error: {}", e);
        }
    }
    enforcer.teardown()?;
    if let Err(e) = wg_manager.teardown().await {
        warn!("wireguard teardown error: {}", e);
    }

    service.stop()?;
    info!("{} stopped", APP_NAME);
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl+c"),
        _ = terminate => info!("received sigterm"),
    }
}
