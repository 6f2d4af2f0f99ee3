use std::sync::Arc;
use std::time::Duration;

use cinder_config::CoreConfig;
use cinder_events::{Event, EventPayload, EventSink};
use cinder_graph::Resolver;
use cinder_invoker::{InvokeError, Invoker, SessionContext};
use cinder_queue::{
  Session, SessionError, SessionOutcome, SessionQueue, SessionResults, SessionState,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::ProcessorError;
use crate::run::PlanRun;

/// Pause after a failed dequeue before trying again.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Processor settings, usually taken from [`CoreConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
  /// Number of worker loops.
  pub workers: usize,
  /// Maximum number of independent steps run at once within a session.
  pub node_concurrency: usize,
  /// Only take sessions from this queue. `None` takes from every queue.
  pub queue_id: Option<String>,
}

impl Default for ProcessorConfig {
  fn default() -> Self {
    Self {
      workers: 1,
      node_concurrency: 1,
      queue_id: None,
    }
  }
}

impl From<&CoreConfig> for ProcessorConfig {
  fn from(config: &CoreConfig) -> Self {
    Self {
      workers: config.workers,
      node_concurrency: config.node_concurrency,
      queue_id: None,
    }
  }
}

/// Runs queued sessions to a terminal state.
///
/// # Usage
///
/// ```ignore
/// let processor = Arc::new(SessionProcessor::new(queue, invoker, events));
///
/// let shutdown = CancellationToken::new();
/// let workers = processor.start(shutdown.clone());
///
/// // ... later
/// shutdown.cancel();
/// futures::future::join_all(workers).await;
/// ```
pub struct SessionProcessor {
  queue: Arc<SessionQueue>,
  invoker: Arc<Invoker>,
  resolver: Resolver,
  events: Arc<dyn EventSink>,
  config: ProcessorConfig,
}

impl SessionProcessor {
  /// Create a processor. The resolver shares the invoker's registry.
  pub fn new(queue: Arc<SessionQueue>, invoker: Arc<Invoker>, events: Arc<dyn EventSink>) -> Self {
    let resolver = Resolver::new(invoker.registry().clone());
    Self {
      queue,
      invoker,
      resolver,
      events,
      config: ProcessorConfig::default(),
    }
  }

  pub fn with_config(mut self, config: ProcessorConfig) -> Self {
    self.config = config;
    self
  }

  pub fn config(&self) -> &ProcessorConfig {
    &self.config
  }

  pub fn queue(&self) -> &Arc<SessionQueue> {
    &self.queue
  }

  pub fn invoker(&self) -> &Arc<Invoker> {
    &self.invoker
  }

  /// Spawn the worker loops.
  ///
  /// Each loop waits on the queue until `shutdown` fires. A session running
  /// at that point is canceled and finished before the loop exits.
  pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    (0..self.config.workers.max(1))
      .map(|worker| tokio::spawn(self.clone().work(worker, shutdown.clone())))
      .collect()
  }

  async fn work(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
    info!(worker, "worker_started");

    loop {
      let session = match self
        .queue
        .next(self.config.queue_id.as_deref(), &shutdown)
        .await
      {
        Ok(Some(session)) => session,
        Ok(None) => break,
        Err(e) => {
          error!(worker, error = %e, "dequeue_failed");
          tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RETRY_DELAY) => continue,
          }
        }
      };

      let session_id = session.session_id.clone();
      let cancel = session.cancel.clone();
      let processing = self.process(session);
      tokio::pin!(processing);

      let result = tokio::select! {
        result = &mut processing => result,
        _ = shutdown.cancelled() => {
          cancel.cancel();
          processing.await
        }
      };
      if let Err(e) = result {
        error!(worker, session_id = %session_id, error = %e, "session_finish_failed");
      }
    }

    info!(worker, "worker_stopped");
  }

  /// Run one dequeued session and record its outcome with the queue.
  ///
  /// Returns the session's terminal state. Failures inside the session are
  /// part of that state, not errors; an error means the queue could not
  /// record the outcome.
  #[instrument(skip(self, session), fields(session_id = %session.session_id, queue_id = %session.queue_id))]
  pub async fn process(&self, session: Session) -> Result<SessionState, ProcessorError> {
    info!("session_started");
    self.emit(EventPayload::SessionStarted {
      queue_id: session.queue_id.clone(),
      session_id: session.session_id.clone(),
    });

    let stats = self.invoker.stats();
    stats.start_session(&session.session_id, &session.queue_id);

    let outcome = self.execute(&session).await;

    if let Err(e) = stats.finish_session(&session.session_id) {
      warn!(error = %e, "stats_unavailable");
    }

    let terminal = terminal_event(&session, &outcome);
    let state = self.queue.finish(&session.session_id, outcome).await?;

    info!(state = %state, "session_finished");
    self.emit(terminal);
    Ok(state)
  }

  async fn execute(&self, session: &Session) -> SessionOutcome {
    if session.cancel.is_cancelled() {
      return SessionOutcome::Canceled {
        results: SessionResults::new(),
      };
    }

    let plan = match self.resolver.resolve(&session.graph) {
      Ok(plan) => plan,
      Err(e) => {
        warn!(error = %e, "graph_rejected");
        return SessionOutcome::Errored {
          error: SessionError::new("ResolutionError", None, e.to_string()),
          results: SessionResults::new(),
        };
      }
    };

    let context = SessionContext::new(
      session.session_id.clone(),
      session.queue_id.clone(),
      session.cancel.clone(),
    );
    let run = PlanRun::new(
      &plan,
      &self.invoker,
      &context,
      self.config.node_concurrency,
    );
    let result = run.run().await;
    let results = run.into_results();

    match result {
      Ok(()) => SessionOutcome::Completed { results },
      Err(e) if e.is_canceled() => SessionOutcome::Canceled { results },
      Err(e) => SessionOutcome::Errored {
        error: session_error(&e),
        results,
      },
    }
  }

  fn emit(&self, payload: EventPayload) {
    self.events.notify(Event::new(payload));
  }
}

fn session_error(error: &InvokeError) -> SessionError {
  let error_type = match error {
    InvokeError::TimedOut { .. } => "TimedOut",
    _ => "InvocationError",
  };
  SessionError::new(
    error_type,
    Some(error.invocation_id().to_string()),
    error.to_string(),
  )
}

fn terminal_event(session: &Session, outcome: &SessionOutcome) -> EventPayload {
  let queue_id = session.queue_id.clone();
  let session_id = session.session_id.clone();

  match outcome {
    SessionOutcome::Completed { .. } => EventPayload::SessionCompleted {
      queue_id,
      session_id,
    },
    SessionOutcome::Errored { error, .. } => EventPayload::SessionErrored {
      queue_id,
      session_id,
      error_type: error.error_type.clone(),
      invocation_id: error.invocation_id.clone(),
      message: error.message.clone(),
    },
    SessionOutcome::Canceled { .. } => EventPayload::SessionCanceled {
      queue_id,
      session_id,
    },
  }
}
