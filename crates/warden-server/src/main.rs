use std::net::SocketAddr;

use axum::Router;
use envconfig::Envconfig;
use eyre::Context;
use log::{info, warn};
use redis::aio::ConnectionManager;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

mod api;
mod auth;
mod cache;
mod captcha;
mod catalog;
mod clock;
mod config;
mod docker;
mod error;
mod instances;
mod labels;
mod pruner;

use config::{Config, State};
use error::Result;

fn main() -> eyre::Result<()> {
    pretty_env_logger::init();
    dotenvy::dotenv().ok();

    let cfg = Config::init_from_env().context("initialize config from environment")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.web_workers)
        .enable_all()
        .build()
        .context("build async runtime")?;
    runtime.block_on(serve(cfg))
}

async fn serve(cfg: Config) -> eyre::Result<()> {
    let catalog = catalog::ChallengeCatalog::load(&cfg.challenges_yaml_path)?;
    if catalog.is_empty() {
        warn!("Catalog is empty, no challenges will be served");
    } else {
        let names: Vec<&str> = catalog.all().map(|c| c.name.as_str()).collect();
        info!("Serving {} challenges: {}", catalog.len(), names.join(", "));
    }

    let redis_client = redis::Client::open(cfg.redis_url()).context("open redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("connect to redis")?;

    let docker = docker::DockerClient::connect().context("connect to docker daemon")?;
    let authenticator = auth::Authenticator::from_config(&cfg)?;

    let tt = TaskTracker::new();
    let ct = CancellationToken::new();
    let ct_copy = ct.clone();

    ctrlc::set_handler(move || {
        ct_copy.cancel();
    })?;

    let locks = cache::LockService::new(
        redis_conn.clone(),
        &cfg.prefix,
        cfg.redis_lock_timeout_seconds,
        cfg.redis_lock_blocking_timeout_seconds,
    );
    let tokens = cache::TokenCache::new(redis_conn, &cfg.prefix, cfg.auth_cache_life_time);

    let bind = format!("{}:{}", cfg.bind_host, cfg.bind_port);
    let state = State::new(config::StateInner {
        catalog,
        docker,
        locks,
        tokens,
        auth: authenticator,
        http: reqwest::Client::new(),
        config: cfg,
    });

    tt.spawn(pruner::run(state.clone(), ct.clone()));

    let app = Router::<State>::new().merge(api::router()).with_state(state);

    info!("Starting warden at {bind}");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(ct.clone().cancelled_owned())
    .await?;

    tt.close();
    tt.wait().await;

    Ok(())
}
