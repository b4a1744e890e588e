//! Host surface: the runtime, pre-start applications and instance handles.
//!
//! Every started instance is driven by one tokio task that owns its
//! [`Scheduler`]. Handles reach that task only through commands, which it
//! accepts at dispatch boundaries. Idleness is evaluated only once the work
//! queue is empty and no command is waiting.

use std::any::Any;
use std::ops::ControlFlow;
use std::sync::Arc;

use canopy_types::activity::Environment;
use canopy_types::bookmark::{BookmarkInfo, BookmarkScope};
use canopy_types::config::RuntimeConfig;
use canopy_types::error::{BookmarkError, EngineError};
use canopy_types::event::WorkflowEvent;
use canopy_types::instance::{InstanceStatus, PersistableIdleAction, WorkflowOutcome};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

use crate::activity::Activity;
use crate::event::EventBus;
use crate::extension::metadata::MetadataCache;
use crate::extension::{ExtensionProvider, ExtensionRegistry};
use crate::repository::InstanceStore;
use crate::runtime::command::Command;
use crate::runtime::idle::IdleCoordinator;
use crate::runtime::scheduler::Scheduler;

/// Dispatches between cooperative yields of a driver task.
const YIELD_EVERY: u64 = 64;

// ---------------------------------------------------------------------------
// WorkflowRuntime
// ---------------------------------------------------------------------------

/// Shared configuration, metadata cache and instance store for a set of
/// workflow applications.
///
/// Generic over `S: InstanceStore` for storage flexibility.
pub struct WorkflowRuntime<S: InstanceStore> {
    config: RuntimeConfig,
    metadata: Arc<MetadataCache>,
    store: Arc<S>,
}

impl<S: InstanceStore> WorkflowRuntime<S> {
    pub fn new(config: RuntimeConfig, store: S) -> Self {
        Self {
            config,
            metadata: Arc::new(MetadataCache::new()),
            store: Arc::new(store),
        }
    }

    /// Use `cache` instead of a private metadata cache.
    pub fn with_metadata_cache(mut self, cache: Arc<MetadataCache>) -> Self {
        self.metadata = cache;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metadata_cache(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Prepare a new instance of `workflow`. Nothing runs until
    /// [`WorkflowApplication::start`].
    pub fn create_application(&self, workflow: Arc<Activity>) -> WorkflowApplication<S> {
        WorkflowApplication {
            instance_id: Uuid::now_v7(),
            workflow,
            arguments: Environment::new(),
            extensions: ExtensionRegistry::new(),
            persistable_idle_action: self.config.persistable_idle_action,
            events: EventBus::new(self.config.event_capacity),
            command_capacity: self.config.command_capacity.max(1),
            metadata: self.metadata.clone(),
            store: self.store.clone(),
            handle: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowApplication
// ---------------------------------------------------------------------------

/// One workflow instance, configurable until it starts.
pub struct WorkflowApplication<S: InstanceStore> {
    instance_id: Uuid,
    workflow: Arc<Activity>,
    arguments: Environment,
    extensions: ExtensionRegistry,
    persistable_idle_action: PersistableIdleAction,
    events: EventBus,
    command_capacity: usize,
    metadata: Arc<MetadataCache>,
    store: Arc<S>,
    handle: Option<InstanceHandle>,
}

impl<S: InstanceStore> WorkflowApplication<S> {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn workflow(&self) -> &Arc<Activity> {
        &self.workflow
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    fn ensure_not_started(&self, operation: &str) -> Result<(), EngineError> {
        if self.handle.is_some() {
            return Err(EngineError::InvalidState(format!(
                "cannot {operation} after workflow instance {} has started",
                self.instance_id
            )));
        }
        Ok(())
    }

    pub fn add_extension<T: Any + Send + Sync>(&mut self, extension: T) -> Result<(), EngineError> {
        self.ensure_not_started("add an extension")?;
        self.extensions.add_instance(extension);
        Ok(())
    }

    pub fn add_shared_extension<T: Any + Send + Sync>(
        &mut self,
        extension: Arc<T>,
    ) -> Result<(), EngineError> {
        self.ensure_not_started("add an extension")?;
        self.extensions.add_shared(extension);
        Ok(())
    }

    /// Register a factory used only if no instance of `T` was added. It runs
    /// at most once, on first lookup.
    pub fn add_default_extension_provider<T, F>(&mut self, factory: F) -> Result<(), EngineError>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.ensure_not_started("add a default extension provider")?;
        self.extensions
            .add_default_provider(ExtensionProvider::new(factory));
        Ok(())
    }

    /// Supply a value for one of the root activity's input arguments.
    pub fn set_argument(
        &mut self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), EngineError> {
        self.ensure_not_started("set an argument")?;
        self.arguments.insert(name.into(), value);
        Ok(())
    }

    pub fn set_persistable_idle_action(
        &mut self,
        action: PersistableIdleAction,
    ) -> Result<(), EngineError> {
        self.ensure_not_started("change the persistable idle action")?;
        self.persistable_idle_action = action;
        Ok(())
    }

    /// Subscribe before [`start`](Self::start) to observe every event.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> Option<InstanceHandle> {
        self.handle.clone()
    }

    /// Validate extension requirements and spawn the instance's driver task.
    ///
    /// Validation failures are returned before any activity runs. Must be
    /// called from within a tokio runtime.
    pub fn start(&mut self) -> Result<InstanceHandle, EngineError> {
        self.ensure_not_started("start")?;

        let metadata = self.metadata.get_or_collect(&self.workflow);
        if let Err(err) = self.extensions.validate(&metadata) {
            tracing::warn!(
                instance_id = %self.instance_id,
                workflow = self.workflow.display_name(),
                missing = err.errors.len(),
                error = %err,
                "workflow validation failed"
            );
            return Err(err.into());
        }
        self.workflow.bind_arguments(self.arguments.clone())?;

        let (commands_tx, commands_rx) = mpsc::channel(self.command_capacity);
        let (status_tx, status_rx) = watch::channel(InstanceStatus::Running);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let mut scheduler = Scheduler::new(
            self.instance_id,
            self.workflow.display_name(),
            std::mem::take(&mut self.extensions),
            self.events.clone(),
            commands_tx.downgrade(),
        );
        scheduler.start(self.workflow.clone(), std::mem::take(&mut self.arguments))?;

        let driver = InstanceDriver {
            scheduler,
            commands: commands_rx,
            idle: IdleCoordinator::default(),
            action: self.persistable_idle_action,
            store: self.store.clone(),
            events: self.events.clone(),
            status: status_tx,
            outcome: outcome_tx,
            deferred: Vec::new(),
        };
        let span = tracing::info_span!(
            "workflow.instance",
            instance_id = %self.instance_id,
            workflow = self.workflow.display_name(),
        );
        tokio::spawn(driver.run().instrument(span));

        let handle = InstanceHandle {
            instance_id: self.instance_id,
            commands: commands_tx,
            status: status_rx,
            outcome: outcome_rx,
            events: self.events.clone(),
        };
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// InstanceHandle
// ---------------------------------------------------------------------------

/// Cloneable, sendable control surface of a started instance.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    instance_id: Uuid,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<InstanceStatus>,
    outcome: watch::Receiver<Option<WorkflowOutcome>>,
    events: EventBus,
}

impl InstanceHandle {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    fn unavailable(&self) -> EngineError {
        EngineError::InstanceUnavailable(self.instance_id)
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.unavailable())
    }

    /// Resume a bookmark with `value`.
    ///
    /// Fails with `NotFound` if the bookmark is unknown, was already resumed,
    /// or the instance is no longer running.
    pub async fn resume_bookmark(
        &self,
        name: impl Into<String>,
        scope: Option<BookmarkScope>,
        value: Value,
    ) -> Result<(), BookmarkError> {
        let name = name.into();
        let (reply, response) = oneshot::channel();
        let command = Command::ResumeBookmark {
            name: name.clone(),
            scope: scope.clone(),
            value,
            reply,
        };
        if self.commands.send(command).await.is_err() {
            return Err(BookmarkError::NotFound { name, scope });
        }
        response
            .await
            .unwrap_or_else(|_| Err(BookmarkError::NotFound { name, scope }))
    }

    /// Request cancellation of the whole instance.
    pub async fn cancel(&self) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Cancel { reply }).await?;
        response.await.map_err(|_| self.unavailable())
    }

    /// Save a snapshot at the next persistable idle point (immediately if the
    /// instance is there already).
    pub async fn persist(&self) -> Result<(), EngineError> {
        self.request_persist(false).await
    }

    /// Save a snapshot at the next persistable idle point and stop the instance.
    pub async fn unload(&self) -> Result<(), EngineError> {
        self.request_persist(true).await
    }

    async fn request_persist(&self, unload: bool) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Persist { unload, reply }).await?;
        response.await.map_err(|_| self.unavailable())?
    }

    /// Outstanding bookmarks in creation order. Empty once the instance has stopped.
    pub async fn bookmarks(&self) -> Vec<BookmarkInfo> {
        let (reply, response) = oneshot::channel();
        if self.send(Command::QueryBookmarks { reply }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    pub async fn wait_for_outcome(&self) -> Result<WorkflowOutcome, EngineError> {
        let mut outcome = self.outcome.clone();
        match outcome.wait_for(Option::is_some).await {
            Ok(current) => current.clone().ok_or_else(|| self.unavailable()),
            Err(_) => Err(self.unavailable()),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

struct PendingPersist {
    unload: bool,
    reply: oneshot::Sender<Result<(), EngineError>>,
}

/// The single writer of one instance.
struct InstanceDriver<S: InstanceStore> {
    scheduler: Scheduler,
    commands: mpsc::Receiver<Command>,
    idle: IdleCoordinator,
    action: PersistableIdleAction,
    store: Arc<S>,
    events: EventBus,
    status: watch::Sender<InstanceStatus>,
    outcome: watch::Sender<Option<WorkflowOutcome>>,
    /// Persist requests waiting for the next persistable idle point.
    deferred: Vec<PendingPersist>,
}

impl<S: InstanceStore> InstanceDriver<S> {
    async fn run(mut self) {
        let mut dispatched: u64 = 0;
        loop {
            while let Ok(command) = self.commands.try_recv() {
                if self.handle_command(command).await.is_break() {
                    return;
                }
            }

            if self.scheduler.is_closed() {
                self.close();
                return;
            }

            if self.scheduler.has_work() {
                if self.idle.mark_running() {
                    self.publish_status();
                }
                self.scheduler.step();
                dispatched += 1;
                if dispatched % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
                continue;
            }

            if self.on_quiescent().await.is_break() {
                return;
            }

            match self.commands.recv().await {
                Some(command) => {
                    if self.handle_command(command).await.is_break() {
                        return;
                    }
                }
                None => {
                    tracing::debug!(
                        instance_id = %self.scheduler.instance_id(),
                        "all handles dropped, stopping idle instance"
                    );
                    self.scheduler.shutdown();
                    return;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        tracing::debug!(
            instance_id = %self.scheduler.instance_id(),
            command = command.kind(),
            "command received"
        );
        match command {
            Command::ResumeBookmark {
                name,
                scope,
                value,
                reply,
            } => {
                let result = self.scheduler.resume_bookmark(&name, scope.as_ref(), value);
                if let Err(err) = &result {
                    tracing::debug!(
                        instance_id = %self.scheduler.instance_id(),
                        error = %err,
                        "resume rejected"
                    );
                }
                let _ = reply.send(result);
            }
            Command::TimerFired { key } => {
                if !self.scheduler.timer_fired(&key) {
                    tracing::trace!(bookmark = %key, "stale timer ignored");
                }
            }
            Command::Cancel { reply } => {
                self.scheduler.cancel_workflow();
                let _ = reply.send(());
            }
            Command::Persist { unload, reply } => {
                let pending = PendingPersist { unload, reply };
                if self.scheduler.is_closed() {
                    let _ = pending.reply.send(Err(self.closed_error()));
                } else if !self.scheduler.has_work()
                    && self.idle.status() == InstanceStatus::PersistableIdle
                {
                    return self.persist(vec![pending], unload).await;
                } else {
                    self.deferred.push(pending);
                }
            }
            Command::QueryBookmarks { reply } => {
                let _ = reply.send(self.scheduler.bookmark_infos());
            }
        }
        ControlFlow::Continue(())
    }

    /// Evaluate idleness, emit transitions and apply persistence.
    async fn on_quiescent(&mut self) -> ControlFlow<()> {
        let instance_id = self.scheduler.instance_id();
        let transition = self.idle.evaluate(&self.scheduler.bookmarks);
        self.publish_status();

        if transition.entered_idle {
            let bookmarks = self.scheduler.bookmark_infos();
            tracing::info!(
                instance_id = %instance_id,
                bookmarks = bookmarks.len(),
                "workflow instance idle"
            );
            self.events
                .publish(WorkflowEvent::Idle { instance_id, bookmarks });
        }
        if transition.entered_persistable_idle {
            tracing::info!(
                instance_id = %instance_id,
                action = ?self.action,
                "workflow instance persistable idle"
            );
            self.events
                .publish(WorkflowEvent::PersistableIdle { instance_id });
        }

        if self.idle.status() != InstanceStatus::PersistableIdle {
            return ControlFlow::Continue(());
        }
        let configured = if transition.entered_persistable_idle {
            self.action
        } else {
            PersistableIdleAction::None
        };
        if configured == PersistableIdleAction::None && self.deferred.is_empty() {
            return ControlFlow::Continue(());
        }

        let unload = configured == PersistableIdleAction::PersistAndUnload
            || self.deferred.iter().any(|p| p.unload);
        let waiting = std::mem::take(&mut self.deferred);
        self.persist(waiting, unload).await
    }

    async fn persist(&mut self, waiting: Vec<PendingPersist>, unload: bool) -> ControlFlow<()> {
        let instance_id = self.scheduler.instance_id();
        let status = if unload {
            InstanceStatus::Unloaded
        } else {
            self.idle.status()
        };
        let snapshot = self.scheduler.snapshot(status);
        let result = self.store.save(&snapshot).await;

        match &result {
            Ok(()) => {
                tracing::info!(
                    instance_id = %instance_id,
                    bookmarks = snapshot.bookmarks.len(),
                    unload,
                    "workflow instance persisted"
                );
                self.events.publish(WorkflowEvent::Persisted { instance_id });
            }
            Err(err) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    error = %err,
                    "failed to persist workflow instance"
                );
            }
        }
        for pending in waiting {
            let _ = pending.reply.send(result.clone().map_err(EngineError::from));
        }

        if unload && result.is_ok() {
            self.unload();
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn unload(&mut self) {
        let instance_id = self.scheduler.instance_id();
        self.scheduler.shutdown();
        self.idle.mark_terminal(InstanceStatus::Unloaded);
        self.publish_status();
        for pending in self.deferred.drain(..) {
            let _ = pending.reply.send(Err(EngineError::InstanceUnavailable(instance_id)));
        }
        self.events.publish(WorkflowEvent::Unloaded { instance_id });
        self.outcome.send_replace(Some(WorkflowOutcome::Unloaded));
        tracing::info!(instance_id = %instance_id, "workflow instance unloaded");
    }

    fn close(&mut self) {
        let Some(outcome) = self.scheduler.outcome().cloned() else {
            return;
        };
        self.idle.mark_terminal(outcome.status());
        self.publish_status();
        for pending in std::mem::take(&mut self.deferred) {
            let _ = pending.reply.send(Err(self.closed_error()));
        }
        self.outcome.send_replace(Some(outcome));
    }

    fn closed_error(&self) -> EngineError {
        EngineError::InvalidState(format!(
            "workflow instance {} closed before reaching persistable idle",
            self.scheduler.instance_id()
        ))
    }

    fn publish_status(&self) {
        self.status.send_replace(self.idle.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use canopy_types::activity::ArgumentDecl;
    use serde_json::json;
    use tokio::time::Instant;

    use crate::activity::{InvokeFn, WaitForBookmark};
    use crate::extension::behavior::StatementsBehavior;
    use crate::repository::InMemoryInstanceStore;

    fn runtime() -> WorkflowRuntime<InMemoryInstanceStore> {
        WorkflowRuntime::new(RuntimeConfig::default(), InMemoryInstanceStore::new())
    }

    async fn next_event(
        events: &mut broadcast::Receiver<WorkflowEvent>,
        wanted: impl Fn(&WorkflowEvent) -> bool,
    ) -> WorkflowEvent {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    }

    /// Collect events up to and including the first terminal one.
    async fn events_until_terminal(
        events: &mut broadcast::Receiver<WorkflowEvent>,
    ) -> Vec<WorkflowEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(events, |_| true).await;
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    }

    fn delay_and_manual() -> Arc<Activity> {
        Activity::parallel(
            "cool-off",
            [
                Activity::delay("delay", Duration::from_millis(100)),
                Activity::wait_for_bookmark("manual", "B"),
            ],
        )
        .into_shared()
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_delay_withholds_persistable_idle_until_it_elapses() {
        let rt = runtime();
        let mut app = rt.create_application(delay_and_manual());
        app.add_extension(StatementsBehavior::blocking_delay()).unwrap();
        let mut events = app.subscribe();
        let started = Instant::now();
        let handle = app.start().unwrap();

        let first = next_event(&mut events, |e| {
            matches!(e, WorkflowEvent::Idle { .. } | WorkflowEvent::PersistableIdle { .. })
        })
        .await;
        match first {
            WorkflowEvent::Idle { bookmarks, .. } => assert_eq!(bookmarks.len(), 2),
            other => panic!("expected Idle first, got {other:?}"),
        }
        assert_eq!(handle.status(), InstanceStatus::Idle);

        next_event(&mut events, |e| matches!(e, WorkflowEvent::PersistableIdle { .. })).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(handle.status(), InstanceStatus::PersistableIdle);

        let outstanding = handle.bookmarks().await;
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].name, "B");

        handle.resume_bookmark("B", None, json!("done")).await.unwrap();
        let outcome = handle.wait_for_outcome().await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Completed { .. }));
        assert_eq!(handle.status(), InstanceStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_delay_masks_persistable_idle_even_after_manual_resume() {
        let rt = runtime();
        let mut app = rt.create_application(delay_and_manual());
        app.add_extension(StatementsBehavior::blocking_delay()).unwrap();
        let mut events = app.subscribe();
        let started = Instant::now();
        let handle = app.start().unwrap();

        next_event(&mut events, |e| matches!(e, WorkflowEvent::Idle { .. })).await;
        handle.resume_bookmark("B", None, Value::Null).await.unwrap();

        let rest = events_until_terminal(&mut events).await;
        assert!(
            !rest
                .iter()
                .any(|e| matches!(e, WorkflowEvent::PersistableIdle { .. }))
        );
        assert!(matches!(rest.last(), Some(WorkflowEvent::Completed { .. })));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn without_hook_persistable_idle_is_immediate() {
        let rt = runtime();
        let mut app = rt.create_application(delay_and_manual());
        let mut events = app.subscribe();
        let started = Instant::now();
        let handle = app.start().unwrap();

        next_event(&mut events, |e| matches!(e, WorkflowEvent::PersistableIdle { .. })).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(handle.status(), InstanceStatus::PersistableIdle);

        let suppressing = handle
            .bookmarks()
            .await
            .into_iter()
            .filter(|b| b.suppresses_persistable_idle)
            .count();
        assert_eq!(suppressing, 0);
    }

    #[derive(Debug)]
    struct Mailer {
        from: String,
    }

    fn onboarding() -> Arc<Activity> {
        Activity::sequence(
            "onboarding",
            [Activity::new(
                "notify",
                InvokeFn::new(|ctx| {
                    let mailer = ctx.require_extension::<Mailer>()?;
                    Ok(Some(json!(mailer.from.clone())))
                })
                .with_metadata(|metadata| metadata.require_extension::<Mailer>()),
            )],
        )
        .into_shared()
    }

    #[tokio::test]
    async fn missing_extension_fails_before_anything_runs() {
        let rt = runtime();
        let mut app = rt.create_application(onboarding());
        let mut events = app.subscribe();

        let err = app.start().unwrap_err();
        match err {
            EngineError::Validation(validation) => {
                assert_eq!(validation.errors.len(), 1);
                assert_eq!(validation.errors[0].type_name, std::any::type_name::<Mailer>());
                assert_eq!(validation.errors[0].activity, "notify");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert!(!app.is_started());
    }

    #[tokio::test]
    async fn extension_instance_or_provider_satisfies_requirement() {
        let rt = runtime();
        let graph = onboarding();

        let mut with_instance = rt.create_application(graph.clone());
        with_instance
            .add_extension(Mailer {
                from: "ops@example.com".to_string(),
            })
            .unwrap();
        let outcome = with_instance
            .start()
            .unwrap()
            .wait_for_outcome()
            .await
            .unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Completed { .. }));

        let mut with_provider = rt.create_application(graph);
        with_provider
            .add_default_extension_provider(|| Mailer {
                from: "noreply@example.com".to_string(),
            })
            .unwrap();
        let outcome = with_provider
            .start()
            .unwrap()
            .wait_for_outcome()
            .await
            .unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Completed { .. }));

        assert_eq!(rt.metadata_cache().len(), 1);
    }

    #[tokio::test]
    async fn bookmark_resumption_is_consuming() {
        let rt = runtime();
        let graph = Activity::sequence(
            "review",
            [Activity::new(
                "approve",
                WaitForBookmark::new("approve").assign_to("decision"),
            )],
        )
        .with_argument(ArgumentDecl::output("decision"))
        .into_shared();
        let mut app = rt.create_application(graph);
        let mut events = app.subscribe();
        let handle = app.start().unwrap();
        next_event(&mut events, |e| matches!(e, WorkflowEvent::Idle { .. })).await;

        handle.resume_bookmark("approve", None, json!(true)).await.unwrap();
        let again = handle.resume_bookmark("approve", None, json!(false)).await;
        assert!(matches!(again, Err(BookmarkError::NotFound { .. })));
        let unknown = handle.resume_bookmark("reject", None, json!(false)).await;
        assert!(matches!(unknown, Err(BookmarkError::NotFound { .. })));

        match handle.wait_for_outcome().await.unwrap() {
            WorkflowOutcome::Completed { outputs } => assert_eq!(outputs["decision"], json!(true)),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let after_close = handle.resume_bookmark("approve", None, json!(true)).await;
        assert!(matches!(after_close, Err(BookmarkError::NotFound { .. })));
    }

    const BRANCHES: usize = 16;

    async fn fan_in(order: Vec<usize>) -> Environment {
        let mut graph = Activity::parallel(
            "fan-in",
            (0..BRANCHES).map(|i| {
                Activity::new(
                    format!("wait-{i}"),
                    WaitForBookmark::new(format!("signal-{i}")).assign_to(format!("slot_{i}")),
                )
            }),
        );
        for i in 0..BRANCHES {
            graph = graph.with_argument(ArgumentDecl::output(format!("slot_{i}")));
        }

        let rt = runtime();
        let mut app = rt.create_application(graph.into_shared());
        let mut events = app.subscribe();
        let handle = app.start().unwrap();
        next_event(&mut events, |e| matches!(e, WorkflowEvent::Idle { .. })).await;

        let mut tasks = Vec::new();
        for i in order {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .resume_bookmark(format!("signal-{i}"), None, json!(i))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        match handle.wait_for_outcome().await.unwrap() {
            WorkflowOutcome::Completed { outputs } => outputs,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resumes_reach_the_same_final_state() {
        let forward = fan_in((0..BRANCHES).collect()).await;
        let backward = fan_in((0..BRANCHES).rev().collect()).await;

        assert_eq!(forward, backward);
        for i in 0..BRANCHES {
            assert_eq!(forward[&format!("slot_{i}")], json!(i));
        }
    }

    #[tokio::test]
    async fn persist_and_unload_action_saves_and_stops() {
        let config = RuntimeConfig {
            persistable_idle_action: PersistableIdleAction::PersistAndUnload,
            ..RuntimeConfig::default()
        };
        let rt = WorkflowRuntime::new(config, InMemoryInstanceStore::new());
        let mut app = rt.create_application(
            Activity::wait_for_bookmark("approval", "approve").into_shared(),
        );
        let mut events = app.subscribe();
        let handle = app.start().unwrap();

        assert_eq!(handle.wait_for_outcome().await.unwrap(), WorkflowOutcome::Unloaded);
        assert_eq!(handle.status(), InstanceStatus::Unloaded);

        let kinds: Vec<&str> = events_until_terminal(&mut events)
            .await
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::PersistableIdle { .. } => Some("persistable_idle"),
                WorkflowEvent::Persisted { .. } => Some("persisted"),
                WorkflowEvent::Unloaded { .. } => Some("unloaded"),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["persistable_idle", "persisted", "unloaded"]);

        let snapshot = rt
            .store()
            .load(&handle.instance_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, InstanceStatus::Unloaded);
        assert_eq!(snapshot.workflow_name, "approval");
        assert_eq!(snapshot.bookmarks[0].name, "approve");

        let resumed = handle.resume_bookmark("approve", None, Value::Null).await;
        assert!(matches!(resumed, Err(BookmarkError::NotFound { .. })));
    }

    #[tokio::test]
    async fn application_can_override_the_configured_action() {
        let rt = runtime();
        let mut app = rt.create_application(
            Activity::wait_for_bookmark("approval", "approve").into_shared(),
        );
        app.set_persistable_idle_action(PersistableIdleAction::Persist)
            .unwrap();
        let mut events = app.subscribe();
        let handle = app.start().unwrap();

        next_event(&mut events, |e| matches!(e, WorkflowEvent::Persisted { .. })).await;
        let snapshot = rt
            .store()
            .load(&handle.instance_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, InstanceStatus::PersistableIdle);

        handle.resume_bookmark("approve", None, Value::Null).await.unwrap();
        assert!(matches!(
            handle.wait_for_outcome().await.unwrap(),
            WorkflowOutcome::Completed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_persist_waits_for_persistable_idle() {
        let rt = runtime();
        let mut app = rt.create_application(delay_and_manual());
        app.add_extension(StatementsBehavior::blocking_delay()).unwrap();
        let mut events = app.subscribe();
        let handle = app.start().unwrap();
        next_event(&mut events, |e| matches!(e, WorkflowEvent::Idle { .. })).await;

        let requested = Instant::now();
        handle.persist().await.unwrap();
        assert!(requested.elapsed() >= Duration::from_millis(100));

        let snapshot = rt
            .store()
            .load(&handle.instance_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, InstanceStatus::PersistableIdle);
        assert_eq!(snapshot.bookmarks.len(), 1);

        handle.unload().await.unwrap();
        assert_eq!(handle.wait_for_outcome().await.unwrap(), WorkflowOutcome::Unloaded);
    }

    #[tokio::test]
    async fn cancel_closes_instance_and_rejects_later_persist() {
        let rt = runtime();
        let mut app = rt.create_application(
            Activity::wait_for_bookmark("approval", "approve").into_shared(),
        );
        let mut events = app.subscribe();
        let handle = app.start().unwrap();
        next_event(&mut events, |e| matches!(e, WorkflowEvent::Idle { .. })).await;

        handle.cancel().await.unwrap();
        assert_eq!(handle.wait_for_outcome().await.unwrap(), WorkflowOutcome::Canceled);
        assert_eq!(handle.status(), InstanceStatus::Canceled);
        assert!(handle.bookmarks().await.is_empty());
        assert!(handle.persist().await.is_err());
    }

    #[tokio::test]
    async fn configuration_is_rejected_after_start() {
        let rt = runtime();
        let mut app = rt.create_application(
            Activity::wait_for_bookmark("approval", "approve").into_shared(),
        );
        app.start().unwrap();

        assert!(matches!(
            app.add_extension(StatementsBehavior::default()),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            app.add_default_extension_provider(StatementsBehavior::default),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            app.set_argument("x", json!(1)),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            app.set_persistable_idle_action(PersistableIdleAction::Persist),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(app.start(), Err(EngineError::InvalidState(_))));
        assert!(app.handle().is_some());
    }

    #[tokio::test]
    async fn arguments_flow_in_and_faults_surface_as_outcome() {
        let rt = runtime();
        let graph = Activity::new(
            "divide",
            InvokeFn::new(|ctx| {
                let divisor = ctx.argument("divisor").and_then(Value::as_i64).unwrap_or(0);
                if divisor == 0 {
                    return Err(EngineError::fault("division by zero"));
                }
                Ok(Some(json!(100 / divisor)))
            }),
        )
        .with_argument(ArgumentDecl::input("divisor").required())
        .into_shared();

        let mut missing = rt.create_application(graph.clone());
        assert!(matches!(
            missing.start(),
            Err(EngineError::InvalidArgument { .. })
        ));

        let mut app = rt.create_application(graph);
        app.set_argument("divisor", json!(0)).unwrap();
        match app.start().unwrap().wait_for_outcome().await.unwrap() {
            WorkflowOutcome::Faulted { fault } => {
                assert_eq!(fault.activity, "divide");
                assert_eq!(fault.message, "division by zero");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
