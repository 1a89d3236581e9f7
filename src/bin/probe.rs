//! probe CLI: run, pause, resume and schedule search-query probes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use probe_engine::checkpoint::CheckpointStore;
use probe_engine::config::Config;
use probe_engine::config::settings::{Settings, SettingsProvider, StoredSettings};
use probe_engine::db::Db;
use probe_engine::engine::{AutoPilot, ExecutionController};
use probe_engine::event::{Event, EventKind, Notifier};
use probe_engine::model::{RunSummary, Task};
use probe_engine::pool::QueryPool;
use probe_engine::store::DurableStore;
use probe_engine::telemetry::{TelemetryConfig, init_telemetry};
use probe_engine::worker::http::HttpProvider;
use probe_engine::worker::simulated::SimulatedProvider;
use probe_engine::worker::{ResourceProvider, WorkerConfig, WorkerManager};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "probe", about = "Resumable search-query probes")]
struct Cli {
    /// Use an in-process simulated worker instead of real HTTP requests
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run, replacing any paused one
    Run {
        /// Queries to execute, in order
        queries: Vec<String>,
        /// Read additional queries from a file, one per line
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Continue the paused run
    Resume,
    /// Show run state and totals
    Status,
    /// Selected-query pool for auto mode
    Queries {
        #[command(subcommand)]
        action: QueriesAction,
    },
    /// Scheduled sessions from the query pool
    Auto {
        #[command(subcommand)]
        action: AutoAction,
    },
    /// Run settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Delete all persisted data and restore default settings
    Reset,
}

#[derive(Subcommand)]
enum QueriesAction {
    /// Add queries to the pool
    Add { queries: Vec<String> },
    /// List the pool
    List,
    /// Empty the pool
    Clear,
}

#[derive(Subcommand)]
enum AutoAction {
    /// Turn auto mode on
    On,
    /// Turn auto mode off
    Off,
    /// Run the auto-mode schedule in the foreground until Ctrl-C
    Serve,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the effective settings
    Show,
    /// Change one setting, e.g. `set delay_between_queries_ms 5000`
    Set { key: String, value: String },
}

/// Everything the commands operate on.
struct App {
    db: Arc<Db>,
    controller: ExecutionController,
    autopilot: AutoPilot,
    stored_settings: StoredSettings,
    pinned_settings: bool,
}

impl App {
    async fn open(config: &Config, dry_run: bool) -> anyhow::Result<Self> {
        let db = Arc::new(Db::connect(&config.database_url).await?);
        db.migrate().await?;
        let store: Arc<dyn DurableStore> = db.clone();

        let provider: Arc<dyn ResourceProvider> = if dry_run {
            Arc::new(SimulatedProvider::new())
        } else {
            Arc::new(HttpProvider::new(Duration::from_secs(30))?)
        };
        let workers = Arc::new(WorkerManager::new(provider, WorkerConfig::default()));

        let stored_settings = StoredSettings::new(Arc::clone(&store));
        let settings: Arc<dyn SettingsProvider> = match &config.settings_path {
            Some(path) => Arc::new(Settings::from_toml_file(path)?),
            None => Arc::new(stored_settings.clone()),
        };

        let controller = ExecutionController::new(
            CheckpointStore::new(Arc::clone(&store)),
            workers,
            Arc::new(Notifier::new()),
            settings,
        );
        let autopilot = AutoPilot::new(controller.clone(), QueryPool::new(store));

        Ok(Self {
            db,
            controller,
            autopilot,
            stored_settings,
            pinned_settings: config.settings_path.is_some(),
        })
    }

    /// Pause the active run on Ctrl-C.
    fn stop_on_ctrl_c(&self) {
        let controller = self.controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("stopping after the current query...");
                controller.stop().await;
            }
        });
    }

    /// Print progress events until the channel closes.
    fn print_progress(&self) {
        let mut events = self.controller.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event {
                        kind: EventKind::Progress { current, total },
                        ..
                    }) => eprintln!("[{current}/{total}]"),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "probe".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let app = App::open(&config, cli.dry_run).await?;
    let result = match cli.command {
        Command::Run { queries, file } => cmd_run(&app, queries, file).await,
        Command::Resume => cmd_resume(&app).await,
        Command::Status => cmd_status(&app).await,
        Command::Queries { action } => cmd_queries(&app, action).await,
        Command::Auto { action } => cmd_auto(&app, action).await,
        Command::Settings { action } => cmd_settings(&app, action).await,
        Command::Reset => {
            app.controller.clear_all_data().await?;
            println!("All data cleared.");
            Ok(())
        }
    };
    app.db.close().await;
    result
}

async fn cmd_run(app: &App, queries: Vec<String>, file: Option<PathBuf>) -> anyhow::Result<()> {
    let mut tasks: Vec<Task> = queries.into_iter().map(Task::from).collect();
    if let Some(path) = file {
        let content = tokio::fs::read_to_string(&path).await?;
        tasks.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(Task::from),
        );
    }
    if tasks.is_empty() {
        anyhow::bail!("no queries given");
    }

    app.stop_on_ctrl_c();
    app.print_progress();
    let summary = app.controller.start(tasks).await?;
    print_summary(&summary);
    Ok(())
}

async fn cmd_resume(app: &App) -> anyhow::Result<()> {
    app.stop_on_ctrl_c();
    app.print_progress();
    let summary = app.controller.resume().await?;
    print_summary(&summary);
    Ok(())
}

async fn cmd_status(app: &App) -> anyhow::Result<()> {
    let status = app.autopilot.status().await?;
    println!("executing:      {}", status.run.executing);
    println!("auto mode:      {}", status.auto_mode);
    println!("total executed: {}", status.run.total_executed);
    println!("total selected: {}", status.total_selected);
    match &status.run.execution_state {
        Some(state) => {
            println!(
                "paused run:     {}/{} done, {} remaining",
                state.current_index,
                state.total,
                state.remaining().len()
            );
            for task in state.remaining().iter().take(5) {
                println!("  next: {task}");
            }
        }
        None => println!("paused run:     none"),
    }
    Ok(())
}

async fn cmd_queries(app: &App, action: QueriesAction) -> anyhow::Result<()> {
    let pool = app.autopilot.pool();
    match action {
        QueriesAction::Add { queries } => {
            let added = pool.add_many(queries.into_iter().map(Task::from)).await?;
            println!("Added {added} quer{}.", if added == 1 { "y" } else { "ies" });
        }
        QueriesAction::List => {
            let tasks = pool.list().await?;
            if tasks.is_empty() {
                println!("No queries selected.");
            }
            for task in &tasks {
                println!("{task}");
            }
        }
        QueriesAction::Clear => {
            pool.clear().await?;
            println!("Query pool cleared.");
        }
    }
    Ok(())
}

async fn cmd_auto(app: &App, action: AutoAction) -> anyhow::Result<()> {
    match action {
        AutoAction::On => {
            // Sessions run under `auto serve`.
            app.autopilot.set_enabled(true).await?;
            println!("Auto mode on. Run `probe auto serve` to execute sessions.");
        }
        AutoAction::Off => {
            app.autopilot.disable().await?;
            println!("Auto mode off.");
        }
        AutoAction::Serve => {
            if !app.autopilot.restore().await? {
                anyhow::bail!("auto mode is off; run `probe auto on` first");
            }
            println!("Auto mode running. Ctrl-C to exit.");
            tokio::signal::ctrl_c().await?;
            app.autopilot.shutdown();
            app.controller.stop().await;
            // Let an in-flight session persist its checkpoint.
            while app.controller.is_executing() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    Ok(())
}

async fn cmd_settings(app: &App, action: SettingsAction) -> anyhow::Result<()> {
    match action {
        SettingsAction::Show => {
            let settings = app.controller.settings().load().await?;
            print!("{}", toml::to_string_pretty(&settings)?);
            if app.pinned_settings {
                println!("# pinned by PROBE_SETTINGS");
            }
        }
        SettingsAction::Set { key, value } => {
            if app.pinned_settings {
                anyhow::bail!("settings are pinned by PROBE_SETTINGS; edit that file instead");
            }
            let current = app.stored_settings.load().await?;
            let mut fields = serde_json::to_value(&current)?;
            let Some(slot) = fields.get_mut(&key) else {
                anyhow::bail!("unknown setting '{key}'");
            };
            *slot = serde_json::from_str(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            let updated: Settings = serde_json::from_value(fields)
                .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))?;
            app.stored_settings.save(&updated).await?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    match summary.paused_at_index {
        Some(index) => println!(
            "Paused after {} quer{} at index {index}. `probe resume` to continue.",
            summary.records_this_run,
            if summary.records_this_run == 1 { "y" } else { "ies" }
        ),
        None => println!(
            "Finished: {} quer{} executed.",
            summary.records_this_run,
            if summary.records_this_run == 1 { "y" } else { "ies" }
        ),
    }
}
