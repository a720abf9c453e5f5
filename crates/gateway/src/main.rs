use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sp_gateway::api;
use sp_gateway::cli::{Cli, QueueBackendArg};
use sp_gateway::keys::SshKey;
use sp_gateway::platform::{Registry, Workspace};
use sp_gateway::queues::{BackendKind, Manager, PlatformDelivery};
use sp_gateway::scheduler::Scheduler;
use sp_gateway::state::AppState;
use sp_gateway::templates::TemplateStore;
use sp_gateway::{policy, stats, tls};

const PROJECT_FILE: &str = "project.json";
const POLICIES_FILE: &str = "policies.json";
const QUEUES_FILE: &str = "queues.json";
const SERVER_FILE: &str = "server.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    run(cli).await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sp_gateway=debug")),
        )
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("spawnpoint starting");
    std::fs::create_dir_all(&cli.dir)
        .with_context(|| format!("creating project dir {}", cli.dir.display()))?;

    // ── Root cancellation: SIGINT/SIGTERM stop everything ───────────
    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    // ── Stats recorder ───────────────────────────────────────────────
    let stats = Arc::new(
        stats::Recorder::open(cli.in_project_dir(&cli.stats_file), cli.stats_depth)
            .context("opening stats recorder")?,
    );
    tracing::info!(depth = cli.stats_depth, "stats recorder ready");

    // ── Registry (project.json, effective user) ──────────────────────
    let user = if cli.dev {
        if !cli.user.is_empty() {
            tracing::warn!("dev mode: credential dropping disabled");
        }
        String::new()
    } else {
        cli.user.clone()
    };
    let registry = Arc::new(
        Registry::open(cli.dir.join(PROJECT_FILE), &user).context("opening registry")?,
    );
    tracing::info!(user = %registry.config().user, "registry ready");

    // ── Policy engine ────────────────────────────────────────────────
    let policies = Arc::new(
        policy::Engine::open(cli.dir.join(POLICIES_FILE)).context("loading policies")?,
    );
    tracing::info!(count = policies.list().len(), "policies loaded");

    // ── SSH key (git cloning) ────────────────────────────────────────
    let ssh = if cli.ssh_key.is_empty() {
        tracing::info!("SSH support disabled");
        None
    } else {
        let path = cli.in_project_dir(cli.ssh_key.as_ref());
        Some(Arc::new(
            SshKey::ensure(path).await.context("preparing SSH key")?,
        ))
    };

    // ── Workspace scan ───────────────────────────────────────────────
    let templates = Arc::new(TemplateStore::new(cli.in_project_dir(&cli.templates)));
    let workspace = Arc::new(Workspace::new(
        cli.dir.clone(),
        registry.clone(),
        policies.clone(),
        templates,
        ssh,
    ));
    workspace.scan().context("scanning project directory")?;
    tracing::info!(lambdas = registry.list().len(), "workspace scanned");

    // ── Queues ───────────────────────────────────────────────────────
    let backend = match cli.queue_backend {
        QueueBackendArg::Directory => BackendKind::Directory(cli.in_project_dir(&cli.queues_dir)),
        QueueBackendArg::Memory => BackendKind::Memory(cli.queue_depth),
    };
    let queues = Arc::new(
        Manager::open(
            cli.dir.join(QUEUES_FILE),
            backend,
            Arc::new(PlatformDelivery {
                registry: registry.clone(),
                policies: policies.clone(),
                stats: stats.clone(),
            }),
            Some(policies.clone()),
            cancel.clone(),
        )
        .context("starting queues")?,
    );
    tracing::info!(count = queues.list().len(), "queue workers started");

    // ── Admin auth ───────────────────────────────────────────────────
    let auth = Arc::new(
        api::auth::AdminAuth::open(cli.dir.join(SERVER_FILE), &cli.initial_admin_password)
            .context("opening admin credentials")?,
    );

    // ── Scheduler ────────────────────────────────────────────────────
    {
        let scheduler = Scheduler::new(registry.clone(), cli.scheduler_interval.as_duration());
        let token = cancel.clone();
        tokio::spawn(async move { scheduler.run(token).await });
        tracing::info!(interval = %cli.scheduler_interval, "scheduler started");
    }

    // ── Periodic stats dump ──────────────────────────────────────────
    {
        let stats = stats.clone();
        let token = cancel.clone();
        let every = cli.stats_interval.as_duration();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = token.cancelled() => return,
                }
                if let Err(e) = stats.dump() {
                    tracing::error!(error = %e, "stats dump failed");
                }
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let state = AppState {
        registry,
        policies,
        queues: queues.clone(),
        stats: stats.clone(),
        auth,
        workspace,
        cancel: cancel.clone(),
        behind_proxy: cli.behind_proxy,
        dev: cli.dev,
    };
    if cli.dev {
        tracing::warn!("dev mode enabled");
    }
    let app = api::router(&state).with_state(state);

    // ── Bind & serve ─────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("binding to {}", cli.bind))?;
    tracing::info!(addr = %cli.bind, tls = cli.tls, "spawnpoint listening");

    let grace = cli.graceful_shutdown.as_duration();
    let served: anyhow::Result<()> = if cli.tls {
        let config = tls::load_server_config(
            &cli.in_project_dir(&cli.cert_file),
            &cli.in_project_dir(&cli.key_file),
        )?;
        tls::serve(listener, config, app, cancel.clone()).await
    } else {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown({
            let token = cancel.clone();
            async move { token.cancelled().await }
        })
        .into_future();
        tokio::select! {
            result = serve => result.context("http server"),
            () = drain_deadline(cancel.clone(), grace) => {
                tracing::warn!("graceful shutdown window elapsed, dropping connections");
                Ok(())
            }
        }
    };

    // ── Shutdown: drain workers, final stats dump ────────────────────
    cancel.cancel();
    queues.shutdown().await;
    if let Err(e) = stats.dump() {
        tracing::error!(error = %e, "final stats dump failed");
    }
    tracing::info!("spawnpoint stopped");
    served
}

fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

async fn drain_deadline(cancel: CancellationToken, grace: std::time::Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}
