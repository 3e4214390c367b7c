//! Agent process: constructs the shared kernel context, loads extensions
//! through every lifecycle phase, installs the orchestrator, and runs the
//! event bus and task engine until the supervisor asks it to stop.

mod adapters;
mod dispatcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};
use yodoca_config::{KeyringSecretStore, SandboxPaths, Settings};
use yodoca_eventbus::EventBus;
use yodoca_kernel::{ContextShared, Loader, MessageRouter, ModelRouter, Orchestrator};
use yodoca_taskengine::TaskEngine;
use yodoca_tools::registry::ToolRegistry;

use adapters::RealAdapterFactory;
use dispatcher::OrchestratorDispatcher;

#[derive(Parser, Debug)]
#[command(about = "Runs the yodoca agent process")]
struct Args {
    /// Sandbox root directory.
    #[arg(long, default_value = ".")]
    sandbox: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    yodoca_telemetry::init_tracing();
    let args = Args::parse();
    std::process::exit(run(args).await?);
}

async fn open_pool(path: &std::path::Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open sqlite database {}", path.display()))
}

async fn run(args: Args) -> Result<i32> {
    let paths = SandboxPaths::new(&args.sandbox);
    let secrets: Arc<dyn yodoca_config::SecretStore> = Arc::new(KeyringSecretStore);

    let settings = Settings::load(&paths.settings_file()).with_context(|| {
        format!("failed to load {} (agent process requires a configured sandbox)", paths.settings_file().display())
    })?;
    let state = settings.is_configured(secrets.as_ref());
    if !state.is_ok() {
        warn!(reason = state.reason().unwrap_or("unknown"), "configuration incomplete; agent process exiting");
        return Ok(1);
    }

    let event_pool = open_pool(&paths.core_db("event_bus.sqlite")?).await?;
    let events = Arc::new(EventBus::new(event_pool).await?);
    events.recover().await.context("event bus recovery failed")?;
    events.start().await;

    let router = Arc::new(MessageRouter::new(Arc::clone(&events), Duration::from_secs(settings.session.timeout_sec)));
    let model_router = Arc::new(
        ModelRouter::from_settings(&settings, secrets.as_ref(), &RealAdapterFactory)
            .context("failed to build model router from settings")?,
    );
    let tools = Arc::new(ToolRegistry::new());
    tools.register_inventory().context("failed to register inventory-collected tools")?;

    let shared = Arc::new(ContextShared {
        settings: Arc::new(settings.clone()),
        secrets: Arc::clone(&secrets),
        paths: SandboxPaths::new(&args.sandbox),
        events: Arc::clone(&events),
        router: Arc::clone(&router),
        model_router: Arc::clone(&model_router),
        tools: Arc::clone(&tools),
        extensions: Arc::new(RwLock::new(HashMap::new())),
        shutdown: Arc::new(Notify::new()),
    });

    let loader = Loader::discover_and_construct(Arc::clone(&shared), &paths).context("extension discovery failed")?;
    loader.initialize_all().await.context("extension initialize phase failed")?;
    loader.detect_and_wire().await;
    loader.run_onboarding().await.context("extension onboarding failed")?;
    loader.validate_schedules().map_err(anyhow::Error::msg)?;

    yodoca_kernel::register_core_tools(&router, &events, &tools);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&model_router),
        Arc::clone(&tools),
        "You are the orchestrator agent for a single-user autonomous runtime. Use tools when they help; otherwise answer directly.",
        loader.context_providers(),
    ));
    router.set_agent(orchestrator.clone() as Arc<dyn yodoca_kernel::AgentHandle>).await;

    let task_pool = open_pool(&paths.core_db("task_engine.sqlite")?).await?;
    let dispatcher = Arc::new(OrchestratorDispatcher::new(Arc::clone(&orchestrator)));
    let task_engine = Arc::new(
        TaskEngine::new(
            task_pool,
            Arc::clone(&events),
            dispatcher,
            settings.task_engine.max_concurrent_tasks,
            settings.task_engine.lease_ttl_sec,
        )
        .await
        .context("failed to open task engine")?,
    );
    let recovered = task_engine.recover().await.context("task engine recovery failed")?;
    if recovered > 0 {
        info!(recovered, "resumed interrupted tasks");
    }
    for binding in task_engine.tool_bindings() {
        if let Err(err) = tools.register_binding(binding) {
            warn!(%err, "failed to register task-engine tool binding");
        }
    }
    let worker_handle = Arc::clone(&task_engine).spawn_worker_loop();

    loader.start_all().await.context("extension start phase failed")?;
    let loader = Arc::new(loader);

    let schedule_handles = spawn_schedules(&loader, &task_engine);
    let health_handle = tokio::spawn({
        let loader = Arc::clone(&loader);
        async move { loader.health_monitor().await }
    });

    info!("agent process ready");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
        () = shared.shutdown.notified() => info!("shutdown requested by an extension"),
    }

    health_handle.abort();
    worker_handle.abort();
    for handle in schedule_handles {
        handle.abort();
    }
    loader.stop_all().await;
    events.stop().await;
    Ok(0)
}

fn spawn_schedules(loader: &Arc<Loader>, task_engine: &Arc<TaskEngine>) -> Vec<tokio::task::JoinHandle<()>> {
    loader
        .collect_schedules()
        .into_iter()
        .filter_map(|(extension_id, entry)| {
            let schedule = yodoca_primitives::parse_cron(&entry.cron).ok()?;
            let task_engine = Arc::clone(task_engine);
            Some(tokio::spawn(async move {
                loop {
                    let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                        break;
                    };
                    let wait = (next - chrono::Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
                    tokio::time::sleep(wait).await;
                    if let Err(err) = task_engine
                        .submit_task(&entry.task, extension_id.as_str(), 0, None, None)
                        .await
                    {
                        warn!(%extension_id, schedule = %entry.name, %err, "scheduled task submission failed");
                    }
                }
            }))
        })
        .collect()
}
