//! Core stage abstraction and the worker that runs it.

use crate::pipeline::error::{ErrorReporter, LogReporter, StageError};
use crate::pipeline::queue::{QueueClosed, QueueReceiver, QueueSender, StageMessage, queue};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a stage. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StageState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Terminated = 3,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StageState::Idle,
            1 => StageState::Running,
            2 => StageState::Draining,
            _ => StageState::Terminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Idle => "idle",
            StageState::Running => "running",
            StageState::Draining => "draining",
            StageState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stage still has its collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StageHealth {
    #[default]
    Healthy,
    /// Alive, but running its fallback behaviour for the rest of the session.
    Degraded { reason: String },
}

impl StageHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, StageHealth::Healthy)
    }
}

/// Where a stage writes its results. Suspends while the downstream queue is full.
pub struct Outbox<T> {
    tx: QueueSender<T>,
}

impl<T> Outbox<T> {
    pub fn new(tx: QueueSender<T>) -> Self {
        Self { tx }
    }

    /// Pushes one result downstream.
    pub async fn emit(&self, item: T) -> Result<(), StageError> {
        self.tx.push(item).await.map_err(|_| StageError::OutputClosed)
    }

    /// Forwards the shutdown control message downstream.
    pub async fn shutdown(&self) -> Result<(), StageError> {
        self.tx.shutdown().await.map_err(|_| StageError::OutputClosed)
    }
}

/// A sequential processing unit in the pipeline.
///
/// A stage is driven by exactly one task. Items from the input queue go through
/// [`process`](Stage::process); results its collaborator pushes on its own arrive
/// through [`next_inbound`](Stage::next_inbound).
#[async_trait]
pub trait Stage: Send + 'static {
    /// The input type this stage receives.
    type Input: Send + 'static;
    /// The output type this stage produces.
    type Output: Send + 'static;

    /// The name of this stage for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Called once when the task starts, before the first item.
    async fn open(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Handles a single input item, emitting zero or more results.
    async fn process(
        &mut self,
        input: Self::Input,
        output: &Outbox<Self::Output>,
    ) -> Result<(), StageError>;

    /// Waits for output that arrives independently of the input queue.
    ///
    /// Raced against the input queue, so it must be cancel-safe. Stages without
    /// such output keep the default, which never completes.
    async fn next_inbound(&mut self) -> Result<Self::Output, StageError> {
        std::future::pending().await
    }

    /// Finishes outstanding work after the shutdown control message arrived.
    async fn drain(&mut self, _output: &Outbox<Self::Output>) -> Result<(), StageError> {
        Ok(())
    }

    /// Releases owned connections. Called once when the task exits.
    async fn close(&mut self) {}

    fn health(&self) -> StageHealth {
        StageHealth::Healthy
    }
}

/// Lifecycle state and health shared between a worker and its task.
#[derive(Debug, Default)]
struct StageStatus {
    state: AtomicU8,
    health: RwLock<StageHealth>,
}

impl StageStatus {
    fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves forward to `next`; earlier states are ignored.
    fn advance(&self, next: StageState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    fn health(&self) -> StageHealth {
        match self.health.read() {
            Ok(health) => health.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_health(&self, health: StageHealth) {
        let mut current = match self.health.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *current != health {
            *current = health;
        }
    }
}

/// Object-safe control surface over a running stage.
#[async_trait]
pub trait StageControl: Send {
    fn name(&self) -> &'static str;
    fn state(&self) -> StageState;
    fn health(&self) -> StageHealth;
    fn start(&mut self, runtime: &Handle);
    async fn terminate(&mut self);
}

/// Owns a stage, its input queue and the task that runs it.
pub struct StageWorker<S: Stage> {
    name: &'static str,
    stage: Option<S>,
    input_tx: QueueSender<S::Input>,
    input_rx: Option<QueueReceiver<S::Input>>,
    output: Option<Outbox<S::Output>>,
    reporter: Arc<dyn ErrorReporter>,
    drain_timeout: Duration,
    close_timeout: Duration,
    status: Arc<StageStatus>,
    stop: CancellationToken,
    abort: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: Stage> StageWorker<S> {
    /// Creates an idle worker with its own bounded input queue.
    pub fn new(stage: S, input_capacity: usize, output: QueueSender<S::Output>) -> Self {
        let (input_tx, input_rx) = queue(input_capacity);
        Self {
            name: stage.name(),
            stage: Some(stage),
            input_tx,
            input_rx: Some(input_rx),
            output: Some(Outbox::new(output)),
            reporter: Arc::new(LogReporter),
            drain_timeout: Duration::from_millis(crate::defaults::DRAIN_TIMEOUT_MS),
            close_timeout: Duration::from_millis(crate::defaults::CLOSE_TIMEOUT_MS),
            status: Arc::new(StageStatus::default()),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            task: None,
        }
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sets how long `terminate` waits for in-flight work, then for the close.
    pub fn with_timeouts(mut self, drain: Duration, close: Duration) -> Self {
        self.drain_timeout = drain;
        self.close_timeout = close;
        self
    }

    /// Producer side of this stage's input queue.
    pub fn input(&self) -> QueueSender<S::Input> {
        self.input_tx.clone()
    }

    /// Enqueues an item, suspending while the input queue is full.
    pub async fn submit(&self, item: S::Input) -> Result<(), QueueClosed> {
        self.input_tx.push(item).await
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> StageState {
        self.status.state()
    }

    pub fn health(&self) -> StageHealth {
        self.status.health()
    }

    /// Launches the stage task. Calling it again is a no-op.
    pub fn start(&mut self, runtime: &Handle) {
        if self.task.is_some() || self.state() != StageState::Idle {
            return;
        }
        let (Some(stage), Some(input), Some(output)) =
            (self.stage.take(), self.input_rx.take(), self.output.take())
        else {
            return;
        };

        self.status.advance(StageState::Running);
        let run = StageRun {
            name: self.name,
            reporter: Arc::clone(&self.reporter),
            status: Arc::clone(&self.status),
            stop: self.stop.clone(),
            abort: self.abort.clone(),
            close_timeout: self.close_timeout,
        };
        tracing::info!(stage = self.name, "stage started");
        self.task = Some(runtime.spawn(run.run(stage, input, output)));
    }

    /// Stops the stage and waits until its task has exited.
    ///
    /// In-flight work gets the drain timeout to finish and is then cancelled.
    /// A task that still has not exited after the close timeout is aborted.
    /// Idempotent.
    pub async fn terminate(&mut self) {
        let Some(mut task) = self.task.take() else {
            if self.state() != StageState::Terminated {
                self.stage = None;
                self.input_rx = None;
                self.output = None;
                self.status.advance(StageState::Terminated);
                tracing::info!(stage = self.name, "stage terminated before start");
            }
            return;
        };

        self.status.advance(StageState::Draining);
        self.stop.cancel();

        let joined = match tokio::time::timeout(self.drain_timeout, &mut task).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                tracing::warn!(stage = self.name, "in-flight work did not finish, cancelling");
                self.abort.cancel();
                let grace = self.close_timeout.saturating_mul(2);
                match tokio::time::timeout(grace, &mut task).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        tracing::warn!(stage = self.name, "stage task unresponsive, aborting");
                        task.abort();
                        task.await.ok();
                        None
                    }
                }
            }
        };
        if let Some(Err(e)) = joined
            && e.is_panic()
        {
            tracing::error!(stage = self.name, "stage task panicked");
        }

        self.status.advance(StageState::Terminated);
    }
}

impl<S: Stage> Drop for StageWorker<S> {
    fn drop(&mut self) {
        self.stop.cancel();
        self.abort.cancel();
    }
}

#[async_trait]
impl<S: Stage> StageControl for StageWorker<S> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> StageState {
        StageWorker::state(self)
    }

    fn health(&self) -> StageHealth {
        StageWorker::health(self)
    }

    fn start(&mut self, runtime: &Handle) {
        StageWorker::start(self, runtime)
    }

    async fn terminate(&mut self) {
        StageWorker::terminate(self).await
    }
}

enum Next<I, O> {
    Input(Option<StageMessage<I>>),
    Inbound(Result<O, StageError>),
    Stop,
}

/// Everything the stage task needs besides the stage and its queues.
struct StageRun {
    name: &'static str,
    reporter: Arc<dyn ErrorReporter>,
    status: Arc<StageStatus>,
    stop: CancellationToken,
    abort: CancellationToken,
    close_timeout: Duration,
}

impl StageRun {
    async fn run<S: Stage>(
        self,
        mut stage: S,
        mut input: QueueReceiver<S::Input>,
        output: Outbox<S::Output>,
    ) {
        let name = self.name;

        let opened = tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(StageError::Cancelled),
            r = stage.open() => r,
        };
        if let Err(e) = opened {
            self.reporter.report(name, &e);
        }
        self.status.set_health(stage.health());

        loop {
            // Pending collaborator output is relayed before new input is taken.
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Next::Stop,
                inbound = stage.next_inbound() => Next::Inbound(inbound),
                msg = input.recv() => Next::Input(msg),
            };

            let result = match next {
                Next::Stop => break,
                Next::Input(None) => break,
                Next::Input(Some(StageMessage::Shutdown)) => {
                    tracing::debug!(stage = name, "shutdown received, draining");
                    self.status.advance(StageState::Draining);
                    let drained = self.guarded(stage.drain(&output)).await;
                    if let Err(e) = drained {
                        self.reporter.report(name, &e);
                    }
                    if output.shutdown().await.is_err() {
                        tracing::debug!(stage = name, "downstream already gone");
                    }
                    break;
                }
                Next::Input(Some(StageMessage::Item(item))) => {
                    self.guarded(stage.process(item, &output)).await
                }
                Next::Inbound(Ok(item)) => self.guarded(output.emit(item)).await,
                Next::Inbound(Err(e)) => Err(e),
            };
            self.status.set_health(stage.health());

            match result {
                Ok(()) => {}
                Err(StageError::OutputClosed) => {
                    self.reporter.report(name, &StageError::OutputClosed);
                    break;
                }
                Err(StageError::Cancelled) if self.abort.is_cancelled() => {
                    self.reporter.report(name, &StageError::Cancelled);
                    break;
                }
                Err(e) => self.reporter.report(name, &e),
            }
        }

        self.status.advance(StageState::Draining);
        input.close();
        if tokio::time::timeout(self.close_timeout, stage.close())
            .await
            .is_err()
        {
            tracing::warn!(stage = name, "close timed out, dropping connection");
        }
        drop(stage);
        self.status.advance(StageState::Terminated);
        tracing::info!(stage = name, "stage terminated");
    }

    /// Runs one step of work, abandoning it when the abort token fires.
    async fn guarded<F>(&self, work: F) -> Result<(), StageError>
    where
        F: std::future::Future<Output = Result<(), StageError>>,
    {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(StageError::Cancelled),
            r = work => r,
        }
    }
}
