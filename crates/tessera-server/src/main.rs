//! Tessera site binary.
//!
//! Starts an axum HTTP server with structured logging, database
//! initialization, replica refresh loops and graceful shutdown on
//! SIGTERM/SIGINT.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tessera_orchestration::{ExecutionBackend, FreshnessSettings, PolicyClient};
use tessera_policy::{Ed25519Verifier, RuleStore, SignatureVerifier, SignedRule};
use tessera_registry::{RegisteredObject, Registry, RegistryClient};
use tessera_replication::persist::load_archive;
use tessera_replication::ReplicaSource;
use tessera_server::background::{
    self, restore_replica, AuthorityFollower, REGISTRY_DOMAIN, RULES_DOMAIN,
};
use tessera_server::config::{self, Config};
use tessera_server::remote::{
    build_http_client, HttpExecutionBackend, HttpReplicaSource, HttpRuleConnector,
    HttpSiteConnector, NoBackend,
};
use tessera_server::{app, AppState, SiteComponents};
use tessera_types::{Identifier, NamespaceAuthority};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TESSERA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

/// The authority of `namespace`: from the registry if the owner is
/// registered, otherwise from the configured owner and key.
fn namespace_authority(
    config: &Config,
    registry: &RegistryClient,
    namespace: &str,
) -> Option<NamespaceAuthority> {
    match registry.authority_for_namespace(namespace) {
        Ok(Some(authority)) => return Some(authority),
        Ok(None) => tracing::info!(namespace, "namespace owner not registered yet"),
        Err(e) => tracing::warn!(namespace, "registry unavailable at start-up: {}", e),
    }
    let owner = Identifier::parse(config.site.owner.as_deref()?).ok()?;
    Some(NamespaceAuthority {
        namespace: namespace.to_string(),
        owner,
        owner_key: config.site.owner_key.clone()?,
        administrators: BTreeSet::new(),
    })
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the site cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = tessera_db::open_site_db(
        &config.database.path,
        tessera_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to open the site database; check database.path in config");

    let site_id = config.site.site_id().expect("site.id was validated on load");
    let lease = config.replication.served_lease();
    let refresh = config.replication.refresh_settings();
    let freshness = FreshnessSettings {
        timeout: config.replication.refresh_timeout(),
        min_backoff: refresh.min_backoff,
    };
    let http = build_http_client();
    let verifier: Arc<dyn SignatureVerifier> = Arc::new(Ed25519Verifier);

    // Registry: hosted here, or replicated from elsewhere
    let hosted_registry = if config.registry.serve {
        let conn = pool.get().expect("failed to get database connection");
        let registry = match load_archive::<RegisteredObject>(&conn, REGISTRY_DOMAIN)
            .expect("failed to load registry archive")
        {
            Some(archive) => Registry::from_archive(archive, lease),
            None => Registry::new(lease),
        };
        tracing::info!(version = registry.version(), "hosting the registry");
        Some(Arc::new(registry))
    } else {
        None
    };
    let registry_source: Arc<dyn ReplicaSource<RegisteredObject>> = match &hosted_registry {
        Some(registry) => Arc::clone(registry) as _,
        None => {
            let base = config
                .site
                .registry_url
                .as_deref()
                .expect("site.registry_url was validated on load")
                .trim_end_matches('/');
            Arc::new(HttpReplicaSource::new(
                http.clone(),
                format!("{base}/registry/updates"),
            ))
        }
    };
    let registry_client = RegistryClient::new(registry_source);
    if let Err(e) = restore_replica(&pool, registry_client.replica()) {
        tracing::warn!("could not restore registry replica: {}", e);
    }
    if let Err(e) = registry_client.refresh().await {
        tracing::warn!("initial registry refresh failed: {}", e);
    }

    // The rule store of the namespace this site serves
    let rules = match (&config.site.namespace, config.site.can_serve_policy) {
        (Some(namespace), true) => {
            let authority = namespace_authority(&config, &registry_client, namespace).expect(
                "cannot determine the namespace authority: register the owner or set site.owner and site.owner_key",
            );
            let conn = pool.get().expect("failed to get database connection");
            let archive = load_archive::<SignedRule>(&conn, RULES_DOMAIN)
                .expect("failed to load rule archive")
                .unwrap_or_default();
            let store = Arc::new(RuleStore::from_archive(
                authority,
                Arc::clone(&verifier),
                archive,
                lease,
            ));
            tracing::info!(namespace = %namespace, version = store.version(), "serving policy");
            AuthorityFollower::attach(&registry_client, Arc::clone(&store));
            Some(store)
        }
        _ => None,
    };

    let policy = PolicyClient::new(
        rules,
        registry_client.clone(),
        Arc::new(HttpRuleConnector::new(http.clone())),
        Arc::clone(&verifier),
        freshness,
    );

    let backend: Arc<dyn ExecutionBackend> = match &config.site.backend_url {
        Some(url) => Arc::new(HttpExecutionBackend::new(http.clone(), url.clone())),
        None => {
            if config.site.can_run_steps {
                tracing::warn!("site can run steps but no execution backend is configured");
            }
            Arc::new(NoBackend)
        }
    };

    let state = Arc::new(AppState::assemble(SiteComponents {
        pool,
        site_id: site_id.clone(),
        registry: hosted_registry,
        registry_client,
        policy,
        backend,
        sites: HttpSiteConnector::new(http),
        verifier,
        freshness,
        check_outputs: config.site.check_outputs,
    }));

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = [
        tokio::spawn(background::start_registry_refresh(
            Arc::clone(&state),
            refresh,
            shutdown_rx.clone(),
        )),
        tokio::spawn(background::supervise_rule_replicas(
            Arc::clone(&state),
            refresh,
            shutdown_rx.clone(),
        )),
        tokio::spawn(background::start_persistence_task(
            Arc::clone(&state),
            config.replication.persist_interval(),
            shutdown_rx,
        )),
    ];

    // Build application
    let app = app(Arc::clone(&state));
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, site = %site_id, "starting tessera site");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("background task join error: {}", e);
        }
    }

    tracing::info!("tessera site shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
