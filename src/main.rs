use std::collections::HashSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cinder_cache::MemoryCache;
use cinder_config::{CoreConfig, GraphDef, StorageMode};
use cinder_events::{EventBus, TracingSink};
use cinder_graph::Resolver;
use cinder_invocation::InvocationRegistry;
use cinder_invoker::Invoker;
use cinder_processor::{ProcessorConfig, SessionProcessor};
use cinder_queue::{DEFAULT_QUEUE_ID, MemoryStore, SessionQueue, SessionState, SessionStore, SqliteStore};
use cinder_stats::StatsCollector;

/// Cinder - a cached, cancellable scheduler for invocation graphs
#[derive(Parser)]
#[command(name = "cinder")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.cinder)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to the configuration file (default: <data-dir>/config.json, if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Queue a graph, run it to completion and print its outputs
  Run {
    /// Path to the graph file (JSON), or `-` for stdin
    graph_file: PathBuf,

    /// Queue to submit to
    #[arg(long, default_value = DEFAULT_QUEUE_ID)]
    queue: String,

    /// Number of sessions to submit
    #[arg(long, default_value_t = 1)]
    runs: usize,

    /// Higher priorities run first
    #[arg(long, default_value_t = 0)]
    priority: i32,
  },

  /// Resolve a graph and print its execution plan
  Validate {
    /// Path to the graph file (JSON), or `-` for stdin
    graph_file: PathBuf,
  },

  /// Print session counts and sessions of a queue
  Status {
    #[arg(long, default_value = DEFAULT_QUEUE_ID)]
    queue: String,
  },

  /// Drop completed, errored and canceled sessions of a queue
  Prune {
    #[arg(long, default_value = DEFAULT_QUEUE_ID)]
    queue: String,
  },

  /// List the registered invocation kinds
  Kinds,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".cinder"),
  };
  let config = load_config(cli.config.as_deref(), &data_dir)?;

  let Some(command) = cli.command else {
    println!("cinder - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    match command {
      Commands::Run {
        graph_file,
        queue,
        runs,
        priority,
      } => run_graph(&graph_file, &queue, runs, priority, &config, &data_dir).await,
      Commands::Validate { graph_file } => validate_graph(&graph_file),
      Commands::Status { queue } => queue_status(&queue, &config, &data_dir).await,
      Commands::Prune { queue } => prune_queue(&queue, &config, &data_dir).await,
      Commands::Kinds => list_kinds(),
    }
  })
}

fn load_config(path: Option<&Path>, data_dir: &Path) -> Result<CoreConfig> {
  let (path, explicit) = match path {
    Some(path) => (path.to_path_buf(), true),
    None => (data_dir.join("config.json"), false),
  };

  if !explicit && !path.exists() {
    return Ok(CoreConfig::default());
  }
  CoreConfig::from_file(&path)
    .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Everything a run needs, wired together from the configuration.
struct Stack {
  bus: Arc<EventBus>,
  queue: Arc<SessionQueue>,
  processor: Arc<SessionProcessor>,
  stats: Arc<StatsCollector>,
}

async fn build_stack(config: &CoreConfig, data_dir: &Path) -> Result<Stack> {
  let bus = Arc::new(EventBus::new());
  bus.register(Arc::new(TracingSink));

  let store = open_store(config, data_dir).await?;
  let queue = Arc::new(SessionQueue::new(store, bus.clone()));

  let stats = Arc::new(StatsCollector::new());
  let invoker = Invoker::new(
    Arc::new(InvocationRegistry::with_builtins()),
    Arc::new(MemoryCache::new(config.node_cache_size)),
    bus.clone(),
    stats.clone(),
  )
  .with_default_timeout(config.invocation_timeout_ms.map(Duration::from_millis));

  let processor = SessionProcessor::new(queue.clone(), Arc::new(invoker), bus.clone())
    .with_config(ProcessorConfig::from(config));

  Ok(Stack {
    bus,
    queue,
    processor: Arc::new(processor),
    stats,
  })
}

async fn open_store(config: &CoreConfig, data_dir: &Path) -> Result<Arc<dyn SessionStore>> {
  match &config.storage {
    StorageMode::Memory => Ok(Arc::new(MemoryStore::new())),
    StorageMode::Sqlite { path } => {
      let path = if path.is_absolute() {
        path.clone()
      } else {
        data_dir.join(path)
      };
      if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
          .await
          .with_context(|| format!("failed to create directory: {}", parent.display()))?;
      }

      let store = SqliteStore::open(&path)
        .await
        .with_context(|| format!("failed to open session database: {}", path.display()))?;
      Ok(Arc::new(store))
    }
  }
}

async fn run_graph(
  graph_file: &Path,
  queue_id: &str,
  runs: usize,
  priority: i32,
  config: &CoreConfig,
  data_dir: &Path,
) -> Result<()> {
  let graph = read_graph(graph_file)?;
  eprintln!("Loaded graph with {} nodes", graph.nodes.len());

  let stack = build_stack(config, data_dir).await?;
  let mut events = stack.bus.subscribe();

  let recovered = stack
    .queue
    .recover()
    .await
    .context("failed to recover interrupted sessions")?;
  if !recovered.is_empty() {
    warn!(count = recovered.len(), "recovered_interrupted_sessions");
  }

  let ids = stack
    .queue
    .enqueue_batch(queue_id, graph, runs.max(1), priority)
    .await
    .context("failed to queue graph")?;

  let shutdown = CancellationToken::new();
  let workers = stack.processor.start(shutdown.clone());

  let mut pending: HashSet<String> = ids.iter().cloned().collect();
  let mut interrupted = false;
  while !pending.is_empty() {
    tokio::select! {
      event = events.recv() => match event {
        Some(event) if event.is_terminal() => {
          if let Some(session_id) = event.session_id() {
            pending.remove(session_id);
          }
        }
        Some(_) => {}
        None => break,
      },
      _ = tokio::signal::ctrl_c(), if !interrupted => {
        interrupted = true;
        eprintln!("Interrupted, canceling {} sessions", pending.len());
        for session_id in &pending {
          stack.queue.cancel(session_id).await.context("failed to cancel session")?;
        }
      }
    }
  }

  shutdown.cancel();
  for worker in workers {
    worker.await.context("worker task failed")?;
  }

  let mut output = serde_json::Map::new();
  let mut failed = 0;
  for session_id in &ids {
    let record = stack
      .queue
      .get(session_id)
      .await
      .with_context(|| format!("failed to load session {}", session_id))?;
    if record.state != SessionState::Completed {
      failed += 1;
    }
    if let Some(error) = &record.error {
      eprintln!(
        "Session {} errored: {} ({})",
        session_id, error.0.message, error.0.error_type
      );
    }

    output.insert(
      session_id.clone(),
      json!({
        "state": record.state,
        "results": record.results.0,
        "error": record.error.map(|e| e.0),
      }),
    );
  }

  eprint!("{}", stack.stats.summary());

  // A single run prints just its outputs.
  let printed = match (ids.len(), ids.first()) {
    (1, Some(session_id)) => output
      .get(session_id)
      .and_then(|entry| entry.get("results"))
      .cloned()
      .unwrap_or_default(),
    _ => serde_json::Value::Object(output),
  };
  println!("{}", serde_json::to_string_pretty(&printed)?);

  info!(sessions = ids.len(), failed, "run_finished");
  if failed > 0 {
    bail!("{} of {} sessions did not complete", failed, ids.len());
  }
  Ok(())
}

fn validate_graph(graph_file: &Path) -> Result<()> {
  let graph = read_graph(graph_file)?;
  let resolver = Resolver::new(Arc::new(InvocationRegistry::with_builtins()));
  let plan = resolver
    .resolve(&graph)
    .with_context(|| format!("graph is invalid: {}", graph_file.display()))?;

  eprintln!("Graph is valid: {} nodes", plan.len());
  println!("{}", serde_json::to_string_pretty(&plan)?);
  Ok(())
}

async fn queue_status(queue_id: &str, config: &CoreConfig, data_dir: &Path) -> Result<()> {
  let store = open_store(config, data_dir).await?;
  let queue = SessionQueue::new(store, Arc::new(EventBus::new()));

  let status = queue
    .queue_status(queue_id)
    .await
    .context("failed to read queue status")?;
  let sessions = queue.list(queue_id).await.context("failed to list sessions")?;

  println!(
    "{}",
    serde_json::to_string_pretty(&json!({ "status": status, "sessions": sessions }))?
  );
  Ok(())
}

async fn prune_queue(queue_id: &str, config: &CoreConfig, data_dir: &Path) -> Result<()> {
  let store = open_store(config, data_dir).await?;
  let queue = SessionQueue::new(store, Arc::new(EventBus::new()));

  let pruned = queue.prune(queue_id).await.context("failed to prune queue")?;
  eprintln!("Pruned {} sessions from queue '{}'", pruned, queue_id);
  Ok(())
}

fn list_kinds() -> Result<()> {
  let registry = InvocationRegistry::with_builtins();
  let schemas: Vec<_> = registry
    .kinds()
    .into_iter()
    .filter_map(|kind| registry.schema(kind))
    .collect();

  println!("{}", serde_json::to_string_pretty(&schemas)?);
  Ok(())
}

fn read_graph(graph_file: &Path) -> Result<GraphDef> {
  let content = if graph_file == Path::new("-") {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read graph from stdin")?;
    input
  } else {
    std::fs::read_to_string(graph_file)
      .with_context(|| format!("failed to read graph file: {}", graph_file.display()))?
  };

  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse graph file: {}", graph_file.display()))
}
