use color_eyre::eyre::{self, WrapErr};
use pgclone_common::Executor;
use pgclone_executor::{CommandExecutor, CommandExecutorConfig};
use pgclone_server::auth::{
    Authenticator, ChainedAuthenticator, OAuthAuthenticator, SharedSecretAuthenticator,
};
use pgclone_server::correlator::AuthCorrelator;
use pgclone_server::lifecycle::{ImageClaims, ImageLifecycle, InstanceLifecycle, PortAllocator};
use pgclone_server::oauth::{HttpOAuthClient, OAuthClient};
use pgclone_server::store::{
    connect_postgres, ImageStore, InMemoryImageStore, InMemoryInstanceStore, InstanceStore,
    PgImageStore, PgInstanceStore,
};
use pgclone_server::{create_app, AppState, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pgclone_server=debug".into()),
        )
        .init();

    info!(version = pgclone_server::VERSION, "Starting pgclone server");

    let config = ServerConfig::from_env().wrap_err("invalid configuration")?;
    let state = build_state(&config).await?;
    let app = create_app(state);

    let listener = TcpListener::bind(config.bind)
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.bind))?;
    info!("pgclone listening on http://{}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("pgclone server stopped");
    Ok(())
}

async fn build_state(config: &ServerConfig) -> eyre::Result<AppState> {
    let (images, instances): (Arc<dyn ImageStore>, Arc<dyn InstanceStore>) =
        match &config.database_url {
            Some(url) => {
                let pool = connect_postgres(url)
                    .await
                    .wrap_err("failed to connect to Postgres")?;
                info!("Using Postgres store");
                let images: Arc<dyn ImageStore> = Arc::new(PgImageStore::new(pool.clone()));
                let instances: Arc<dyn InstanceStore> = Arc::new(PgInstanceStore::new(pool));
                (images, instances)
            }
            None => {
                warn!("PGCLONE_DATABASE_URL not set, state will not survive a restart");
                let images: Arc<dyn ImageStore> = Arc::new(InMemoryImageStore::new());
                let instances: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::new());
                (images, instances)
            }
        };

    // Instances that outlived the last run keep their ports.
    let ports = PortAllocator::new(config.port_range.clone());
    let running = instances.list().await.wrap_err("failed to load instances")?;
    ports.reserve(running.iter().map(|instance| instance.port));
    info!(
        running = running.len(),
        min = *config.port_range.start(),
        max = *config.port_range.end(),
        "Port allocator ready"
    );

    let mut executor_config = CommandExecutorConfig {
        root: config.root.clone(),
        baker: config.baker.clone(),
        ..CommandExecutorConfig::default()
    };
    if let Some(pg_ctl) = &config.pg_ctl {
        executor_config.pg_ctl = pg_ctl.clone();
    }
    let executor: Arc<dyn Executor> = Arc::new(CommandExecutor::new(executor_config));

    let oauth: Arc<dyn OAuthClient> = Arc::new(
        HttpOAuthClient::new(config.oauth.clone()).wrap_err("failed to build OAuth client")?,
    );

    let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::new();
    if let Some(secret) = &config.shared_secret {
        info!("Shared secret authentication enabled");
        authenticators.push(Arc::new(SharedSecretAuthenticator::new(secret)));
    }
    authenticators.push(Arc::new(OAuthAuthenticator::new(
        oauth.clone(),
        config.allowed_domain.clone(),
    )));

    let claims = ImageClaims::new();
    Ok(AppState {
        images: ImageLifecycle::new(
            images.clone(),
            instances.clone(),
            executor.clone(),
            claims.clone(),
        ),
        instances: InstanceLifecycle::new(images, instances, executor, ports, claims)
            .with_provision_timeout(config.provision_timeout),
        correlator: AuthCorrelator::new(oauth),
        authenticator: Arc::new(ChainedAuthenticator::new(authenticators)),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
