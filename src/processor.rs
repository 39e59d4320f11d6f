//! Command and event processors.
//!
//! Inbound messages resolve to registered handlers (a startup-time
//! registration table, never reflection), execute as one unit of work
//! inside the partitioned scheduler, and retry optimistic-concurrency
//! conflicts with exponential backoff until a wall-clock budget runs out.
//! Every retry reloads the aggregate and re-runs the handler: stale
//! decisions are never resubmitted.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{Aggregate, encode_event};
use crate::commit::{Commit, EventData, stream_uuid};
use crate::context::ExecutionContext;
use crate::error::ProcessError;
use crate::headers::Headers;
use crate::scheduler::PartitionedScheduler;
use crate::store::{AggregateAccess, SaveReceipt};

/// Backoff settings for conflict retries.
///
/// The budget clock starts at the first retryable failure of a unit of
/// work; each wait doubles (times `multiplier`) up to `max_interval` and
/// is clamped to the remaining budget, so a unit never sleeps past its
/// deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total wall-clock budget for retrying one unit of work.
    pub budget: Duration,
    /// First backoff interval.
    pub initial_interval: Duration,
    /// Ceiling for the growing interval.
    pub max_interval: Duration,
    /// Growth factor between attempts. Values below 1 behave as 1.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(60),
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

/// Per-unit retry bookkeeping.
struct RetryState {
    policy: RetryPolicy,
    started: Option<Instant>,
    deadline: Option<Instant>,
    interval: Duration,
}

impl RetryState {
    fn new(policy: RetryPolicy) -> Self {
        let interval = policy.initial_interval;
        Self {
            policy,
            started: None,
            deadline: None,
            interval,
        }
    }

    /// The next backoff delay, or `None` once the budget is exhausted.
    ///
    /// The first call starts the budget clock.
    fn next_delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.started.get_or_insert(now);
        let deadline = *self.deadline.get_or_insert(now + self.policy.budget);
        if now >= deadline {
            return None;
        }
        let remaining = deadline.saturating_duration_since(now);
        let delay = self.interval.min(remaining);
        self.interval = self
            .interval
            .saturating_mul(self.policy.multiplier.max(1))
            .min(self.policy.max_interval);
        Some(delay)
    }

    /// Wall-clock time since the first retryable failure.
    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Decides whether a non-conflict failure is worth retrying.
///
/// Conflicts are always retried; this classifier only widens the set.
pub trait TransienceClassifier: Send + Sync {
    /// True when the error is expected to clear on its own.
    fn is_transient(&self, error: &ProcessError) -> bool;
}

/// Default classifier: nothing beyond conflicts is retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTransient;

impl TransienceClassifier for NeverTransient {
    fn is_transient(&self, _error: &ProcessError) -> bool {
        false
    }
}

/// A type-erased inbound command.
///
/// `command` is a JSON payload because the transport does not know the
/// target aggregate's command type; the registered dispatcher deserializes
/// it at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Target aggregate type name (must match `Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// Target aggregate instance identifier.
    pub instance_id: String,
    /// JSON-serialized command payload.
    pub command: Value,
    /// Correlation id of the unit of work.
    pub correlation_id: Uuid,
    /// Metadata stamped onto the resulting commit.
    pub headers: Headers,
}

impl CommandEnvelope {
    /// Build an envelope with a fresh correlation id and empty headers.
    pub fn new(
        aggregate_type: impl Into<String>,
        instance_id: impl Into<String>,
        command: Value,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            instance_id: instance_id.into(),
            command,
            correlation_id: Uuid::new_v4(),
            headers: Headers::new(),
        }
    }

    /// Continue an existing correlation.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Attach headers to the envelope.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// The scheduler partition for this message: its target aggregate.
    pub fn partition_key(&self) -> Uuid {
        stream_uuid(&self.aggregate_type, &self.instance_id)
    }
}

/// A single persisted event on its way to downstream handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The event itself.
    pub event: EventData,
    /// Stream the event was committed on.
    pub stream_id: Uuid,
    /// Stream version of the commit that carried the event.
    pub version: u64,
    /// Correlation id inherited from the producing unit of work.
    pub correlation_id: Uuid,
    /// Headers of the carrying commit.
    pub headers: Headers,
}

impl EventEnvelope {
    /// One envelope per event of a commit, in commit order.
    ///
    /// This is the bridge between [`EventLog::undispatched`]
    /// (crate::EventLog::undispatched) and event processing.
    pub fn expand(commit: &Commit) -> Vec<EventEnvelope> {
        commit
            .events
            .iter()
            .map(|event| EventEnvelope {
                event: event.clone(),
                stream_id: commit.stream_id,
                version: commit.version,
                correlation_id: commit.correlation_id,
                headers: commit.headers.clone(),
            })
            .collect()
    }
}

/// Type-erased execution of a command envelope against one aggregate type.
#[async_trait]
trait CommandDispatcher<S>: Send + Sync
where
    S: AggregateAccess,
{
    async fn dispatch(
        &self,
        store: &S,
        envelope: &CommandEnvelope,
    ) -> Result<SaveReceipt, ProcessError>;
}

/// Concrete dispatcher for aggregate type `A`.
struct TypedCommandDispatcher<A> {
    _marker: PhantomData<fn() -> A>,
}

impl<A> TypedCommandDispatcher<A> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<S, A> CommandDispatcher<S> for TypedCommandDispatcher<A>
where
    S: AggregateAccess,
    A: Aggregate,
    A::Command: DeserializeOwned,
{
    async fn dispatch(
        &self,
        store: &S,
        envelope: &CommandEnvelope,
    ) -> Result<SaveReceipt, ProcessError> {
        let cmd: A::Command = serde_json::from_value(envelope.command.clone()).map_err(|source| {
            ProcessError::MalformedMessage {
                kind: envelope.aggregate_type.clone(),
                source,
            }
        })?;

        let mut root = store.get::<A>(&envelope.instance_id).await?;

        // Synchronous decision section: the context scope opens and closes
        // with no await in between, so the thread discipline always holds.
        // The collected events stay readable through the guard for the
        // save below.
        let ctx = ExecutionContext::open_with_correlation(
            envelope.correlation_id,
            envelope.headers.clone(),
        );
        let decision = match root.state().handle(cmd) {
            Ok(events) => {
                let mut failure = None;
                for event in &events {
                    match encode_event::<A>(event) {
                        Ok(data) => ctx.raise(data),
                        Err(e) => {
                            failure = Some(ProcessError::Codec(e));
                            break;
                        }
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Err(e) => Err(ProcessError::Handler(Box::new(e))),
        };
        ctx.close()?;
        decision?;

        store
            .save::<A>(&mut root, &ctx)
            .await
            .map_err(ProcessError::from)
    }
}

/// Executes inbound commands against registered aggregate types.
///
/// One unit of work per message, serialized per target aggregate by the
/// shared scheduler. `Clone` is cheap; clones share all state.
pub struct CommandProcessor<S> {
    store: Arc<S>,
    scheduler: PartitionedScheduler,
    dispatchers: Arc<HashMap<String, Box<dyn CommandDispatcher<S>>>>,
    retry: RetryPolicy,
    transience: Arc<dyn TransienceClassifier>,
}

impl<S> Clone for CommandProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            scheduler: self.scheduler.clone(),
            dispatchers: Arc::clone(&self.dispatchers),
            retry: self.retry.clone(),
            transience: Arc::clone(&self.transience),
        }
    }
}

impl<S> CommandProcessor<S>
where
    S: AggregateAccess + 'static,
{
    /// Start building a processor over a store and scheduler.
    pub fn builder(store: Arc<S>, scheduler: PartitionedScheduler) -> CommandProcessorBuilder<S> {
        CommandProcessorBuilder::new(store, scheduler)
    }

    /// Process one command to completion.
    ///
    /// # Errors
    ///
    /// * [`ProcessError::HandlerNotFound`] - no aggregate type registered
    ///   for the envelope; fatal for this message, never retried.
    /// * [`ProcessError::RetryTimeout`] - conflicts persisted past the
    ///   retry budget.
    /// * Handler, codec, store, and scheduler failures otherwise.
    pub async fn process(&self, envelope: CommandEnvelope) -> Result<SaveReceipt, ProcessError> {
        // Resolved before scheduling so an unroutable message never
        // consumes a unit-of-work slot.
        if !self.dispatchers.contains_key(&envelope.aggregate_type) {
            return Err(ProcessError::HandlerNotFound(envelope.aggregate_type));
        }

        let span = tracing::info_span!(
            "process_command",
            aggregate_type = %envelope.aggregate_type,
            instance_id = %envelope.instance_id,
            correlation_id = %envelope.correlation_id,
        );

        let key = envelope.partition_key();
        let this = self.clone();
        let handle = self
            .scheduler
            .submit(key, async move { this.run_unit(envelope).await }.instrument(span))
            .await?;
        handle.join().await?
    }

    /// The retry loop for one admitted unit of work.
    async fn run_unit(&self, envelope: CommandEnvelope) -> Result<SaveReceipt, ProcessError> {
        let dispatcher = self
            .dispatchers
            .get(&envelope.aggregate_type)
            .ok_or_else(|| ProcessError::HandlerNotFound(envelope.aggregate_type.clone()))?;

        let mut retry = RetryState::new(self.retry.clone());
        loop {
            match dispatcher.dispatch(self.store.as_ref(), &envelope).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_conflict() || self.transience.is_transient(&e) => {
                    match retry.next_delay() {
                        Some(delay) => {
                            tracing::debug!(
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "transient failure; backing off before retry"
                            );
                            tokio::time::sleep(delay).await;
                            // Loop re-dispatches: reload + re-run the handler.
                        }
                        None => {
                            return Err(ProcessError::RetryTimeout {
                                correlation_id: envelope.correlation_id,
                                elapsed: retry.elapsed(),
                                source: Box::new(e),
                            });
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Builder collecting aggregate registrations for a [`CommandProcessor`].
pub struct CommandProcessorBuilder<S> {
    store: Arc<S>,
    scheduler: PartitionedScheduler,
    dispatchers: HashMap<String, Box<dyn CommandDispatcher<S>>>,
    retry: RetryPolicy,
    transience: Arc<dyn TransienceClassifier>,
}

impl<S> CommandProcessorBuilder<S>
where
    S: AggregateAccess + 'static,
{
    /// Start an empty builder.
    pub fn new(store: Arc<S>, scheduler: PartitionedScheduler) -> Self {
        Self {
            store,
            scheduler,
            dispatchers: HashMap::new(),
            retry: RetryPolicy::default(),
            transience: Arc::new(NeverTransient),
        }
    }

    /// Register an aggregate type as a command target.
    ///
    /// The aggregate's `Command` type must be deserializable from the
    /// envelope's JSON payload.
    pub fn aggregate_type<A>(mut self) -> Self
    where
        A: Aggregate,
        A::Command: DeserializeOwned,
    {
        self.dispatchers.insert(
            A::AGGREGATE_TYPE.to_owned(),
            Box::new(TypedCommandDispatcher::<A>::new()),
        );
        self
    }

    /// Override the default retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Install a transience classifier for non-conflict failures.
    pub fn transience(mut self, classifier: Arc<dyn TransienceClassifier>) -> Self {
        self.transience = classifier;
        self
    }

    /// Finish the builder.
    pub fn build(self) -> CommandProcessor<S> {
        CommandProcessor {
            store: self.store,
            scheduler: self.scheduler,
            dispatchers: Arc::new(self.dispatchers),
            retry: self.retry,
            transience: self.transience,
        }
    }
}

/// A subscriber reacting to persisted events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable identity, used for deterministic dispatch ordering.
    fn name(&self) -> &str;

    /// Saga handlers run after all non-saga handlers for an event.
    fn is_saga(&self) -> bool {
        false
    }

    /// True when this handler subscribes to the event type.
    fn handles(&self, event_type: &str) -> bool;

    /// React to one event.
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ProcessError>;
}

/// Dispatches persisted events to every matching handler.
///
/// Mirrors command processing, but fans out: handlers run in a fixed
/// order (non-saga before saga, then lexicographic by name) and each
/// handler invocation is retried independently under the backoff policy.
#[derive(Clone)]
pub struct EventProcessor {
    scheduler: PartitionedScheduler,
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
    retry: RetryPolicy,
    transience: Arc<dyn TransienceClassifier>,
}

impl EventProcessor {
    /// Start building a processor over a scheduler.
    pub fn builder(scheduler: PartitionedScheduler) -> EventProcessorBuilder {
        EventProcessorBuilder::new(scheduler)
    }

    /// Process one event through every matching handler.
    ///
    /// An event nobody subscribes to completes successfully. A handler's
    /// fatal failure propagates immediately; handlers must be idempotent,
    /// since at-least-once delivery can replay the event.
    ///
    /// The unit occupies the source aggregate's partition for its whole
    /// duration. A handler that awaits a command against that same
    /// aggregate would queue behind its own unit and deadlock; follow-up
    /// commands must target other aggregates.
    pub async fn process(&self, envelope: EventEnvelope) -> Result<(), ProcessError> {
        let span = tracing::info_span!(
            "process_event",
            event_type = %envelope.event.event_type,
            stream_id = %envelope.stream_id,
            correlation_id = %envelope.correlation_id,
        );

        // Serialized per source aggregate, like the commands that
        // produced the events.
        let key = envelope.stream_id;
        let this = self.clone();
        let handle = self
            .scheduler
            .submit(key, async move { this.run_unit(envelope).await }.instrument(span))
            .await?;
        handle.join().await?
    }

    async fn run_unit(&self, envelope: EventEnvelope) -> Result<(), ProcessError> {
        let mut matching: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .iter()
            .filter(|h| h.handles(&envelope.event.event_type))
            .cloned()
            .collect();
        matching.sort_by_key(|h| (h.is_saga(), h.name().to_owned()));

        for handler in matching {
            self.run_handler(handler.as_ref(), &envelope).await?;
        }
        Ok(())
    }

    /// One handler invocation with its own independent retry budget.
    async fn run_handler(
        &self,
        handler: &dyn EventHandler,
        envelope: &EventEnvelope,
    ) -> Result<(), ProcessError> {
        let mut retry = RetryState::new(self.retry.clone());
        loop {
            match handler.handle(envelope).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() || self.transience.is_transient(&e) => {
                    match retry.next_delay() {
                        Some(delay) => {
                            tracing::debug!(
                                handler = handler.name(),
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "transient handler failure; backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(ProcessError::RetryTimeout {
                                correlation_id: envelope.correlation_id,
                                elapsed: retry.elapsed(),
                                source: Box::new(e),
                            });
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        handler = handler.name(),
                        error = %e,
                        "event handler failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Builder collecting handler registrations for an [`EventProcessor`].
pub struct EventProcessorBuilder {
    scheduler: PartitionedScheduler,
    handlers: Vec<Arc<dyn EventHandler>>,
    retry: RetryPolicy,
    transience: Arc<dyn TransienceClassifier>,
}

impl EventProcessorBuilder {
    /// Start an empty builder.
    pub fn new(scheduler: PartitionedScheduler) -> Self {
        Self {
            scheduler,
            handlers: Vec::new(),
            retry: RetryPolicy::default(),
            transience: Arc::new(NeverTransient),
        }
    }

    /// Register an event handler.
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Override the default retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Install a transience classifier for non-conflict failures.
    pub fn transience(mut self, classifier: Arc<dyn TransienceClassifier>) -> Self {
        self.transience = classifier;
        self
    }

    /// Finish the builder.
    pub fn build(self) -> EventProcessor {
        EventProcessor {
            scheduler: self.scheduler,
            handlers: Arc::new(self.handlers),
            retry: self.retry,
            transience: self.transience,
        }
    }
}
