use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ember_engine::Inspector;
use ember_world::{LocalWorld, RunStatus, SqliteWorld, World};

/// Ember - inspect durable workflow runs
#[derive(Parser)]
#[command(name = "ember")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.ember)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// JSON settings file (default: <data-dir>/ember.json if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Storage backend, overriding the settings file
  #[arg(long, global = true, value_enum)]
  backend: Option<Backend>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Inspect runs
  Runs {
    #[command(subcommand)]
    command: RunsCommand,
  },
}

#[derive(Subcommand)]
enum RunsCommand {
  /// List runs, newest first
  List {
    /// Only runs with this status
    #[arg(long)]
    status: Option<String>,
  },

  /// Show a run record and its steps
  Show { run_id: String },

  /// Print a run's event log as JSON lines
  Events { run_id: String },

  /// Print the recorded chunks of an output stream
  Stream {
    run_id: String,
    namespace: String,

    /// First chunk index to print
    #[arg(long, default_value_t = 0)]
    from: u64,
  },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum Backend {
  /// Plain files under the data directory
  #[default]
  Local,
  /// SQLite database under the data directory
  Sqlite,
}

/// Contents of the settings file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
  backend: Backend,
  /// Database file, relative to the data directory.
  database: Option<PathBuf>,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::registry()
    .with(EnvFilter::from_default_env())
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".ember"),
  };

  let Some(Commands::Runs { command }) = cli.command else {
    println!("ember - use --help to see available commands");
    return Ok(());
  };

  let mut settings = load_settings(cli.config.as_deref(), &data_dir)?;
  if let Some(backend) = cli.backend {
    settings.backend = backend;
  }

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let world = open_world(&settings, &data_dir).await?;
    run_command(Inspector::new(world), command).await
  })
}

fn load_settings(path: Option<&Path>, data_dir: &Path) -> Result<Settings> {
  let (path, required) = match path {
    Some(path) => (path.to_path_buf(), true),
    None => (data_dir.join("ember.json"), false),
  };
  if !required && !path.exists() {
    debug!(path = %path.display(), "settings_file_absent");
    return Ok(Settings::default());
  }

  let content = std::fs::read_to_string(&path)
    .with_context(|| format!("failed to read settings file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse settings file: {}", path.display()))
}

async fn open_world(settings: &Settings, data_dir: &Path) -> Result<Arc<dyn World>> {
  match settings.backend {
    Backend::Local => {
      let world = LocalWorld::open(data_dir)
        .await
        .with_context(|| format!("failed to open data directory: {}", data_dir.display()))?;
      info!(backend = "local", path = %data_dir.display(), "world_opened");
      Ok(Arc::new(world))
    }
    Backend::Sqlite => {
      let path = data_dir.join(
        settings
          .database
          .as_deref()
          .unwrap_or_else(|| Path::new("ember.db")),
      );
      let world = SqliteWorld::open(&path)
        .await
        .with_context(|| format!("failed to open database: {}", path.display()))?;
      info!(backend = "sqlite", path = %path.display(), "world_opened");
      Ok(Arc::new(world))
    }
  }
}

async fn run_command(inspector: Inspector, command: RunsCommand) -> Result<()> {
  match command {
    RunsCommand::List { status } => {
      let status = status
        .map(|s| RunStatus::parse(&s).with_context(|| format!("unknown run status '{s}'")))
        .transpose()?;
      for run in inspector.list_runs(status).await? {
        println!(
          "{}\t{}\t{}\t{}",
          run.run_id, run.workflow, run.status, run.created_at
        );
      }
    }
    RunsCommand::Show { run_id } => {
      let run = inspector
        .run(&run_id)
        .await
        .with_context(|| format!("failed to load run '{run_id}'"))?;
      let steps = inspector.steps(&run_id).await?;
      let view = serde_json::json!({ "run": run, "steps": steps });
      println!("{}", serde_json::to_string_pretty(&view)?);
    }
    RunsCommand::Events { run_id } => {
      let events = inspector
        .events(&run_id)
        .await
        .with_context(|| format!("failed to load events of run '{run_id}'"))?;
      for event in events {
        println!("{}", serde_json::to_string(&event)?);
      }
    }
    RunsCommand::Stream {
      run_id,
      namespace,
      from,
    } => {
      for chunk in inspector.stream_chunks(&run_id, &namespace, from).await? {
        println!("{}\t{}", chunk.index, chunk.chunk);
      }
    }
  }

  Ok(())
}
