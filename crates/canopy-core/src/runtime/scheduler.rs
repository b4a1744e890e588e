//! The single-writer scheduler of one workflow instance.
//!
//! All mutation of the activity instance tree, the bookmark table and the
//! extension registry happens here, one work item at a time. Behaviors ask
//! for transitions through their [`ActivityContext`]; those requests only
//! enqueue work, and [`Scheduler::step`] is the only place work runs.

use std::sync::Arc;
use std::time::Duration;

use canopy_types::activity::{
    ActivityInstanceId, ActivityInstanceState, CloseReason, Environment, FaultInfo,
};
use canopy_types::bookmark::{BookmarkInfo, BookmarkScope};
use canopy_types::error::{BookmarkError, EngineError};
use canopy_types::event::WorkflowEvent;
use canopy_types::instance::{InstanceSnapshot, InstanceStatus, WorkflowOutcome};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::bookmark::{BookmarkCallback, BookmarkEntry, BookmarkKey, BookmarkTable};
use super::command::Command;
use super::context::{ActivityContext, BookmarkOptions};
use super::queue::{WorkItem, WorkQueue};
use super::timer::TimerRegistry;
use super::tree::InstanceTree;
use crate::activity::{Activity, ActivityBehavior, CompletedChild};
use crate::event::EventBus;
use crate::extension::ExtensionRegistry;

pub(crate) struct Scheduler {
    instance_id: Uuid,
    workflow_name: String,
    pub(crate) tree: InstanceTree,
    pub(crate) queue: WorkQueue,
    pub(crate) bookmarks: BookmarkTable,
    pub(crate) extensions: ExtensionRegistry,
    pub(crate) timers: TimerRegistry,
    events: EventBus,
    /// Instance-fatal error raised during the current dispatch.
    fatal: Option<FaultInfo>,
    outcome: Option<WorkflowOutcome>,
    timer_sequence: u64,
}

impl Scheduler {
    pub fn new(
        instance_id: Uuid,
        workflow_name: impl Into<String>,
        extensions: ExtensionRegistry,
        events: EventBus,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            instance_id,
            workflow_name: workflow_name.into(),
            tree: InstanceTree::default(),
            queue: WorkQueue::default(),
            bookmarks: BookmarkTable::default(),
            extensions,
            timers: TimerRegistry::new(commands),
            events,
            fatal: None,
            outcome: None,
            timer_sequence: 0,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn outcome(&self) -> Option<&WorkflowOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn has_work(&self) -> bool {
        self.outcome.is_none() && !self.queue.is_empty()
    }

    pub fn bookmark_infos(&self) -> Vec<BookmarkInfo> {
        self.bookmarks.infos()
    }

    pub fn snapshot(&self, status: InstanceStatus) -> InstanceSnapshot {
        let variables = self
            .tree
            .root()
            .and_then(|root| self.tree.get(root))
            .map(|root| root.environment.clone())
            .unwrap_or_default();
        InstanceSnapshot {
            instance_id: self.instance_id,
            workflow_name: self.workflow_name.clone(),
            status,
            bookmarks: self.bookmarks.infos(),
            variables,
            saved_at: Utc::now(),
        }
    }

    fn publish(&self, event: WorkflowEvent) {
        self.events.publish(event);
    }

    // -----------------------------------------------------------------------
    // Requests (enqueue only)
    // -----------------------------------------------------------------------

    /// Create the root instance and enqueue its entry.
    pub fn start(
        &mut self,
        root: Arc<Activity>,
        arguments: Environment,
    ) -> Result<ActivityInstanceId, EngineError> {
        if self.tree.root().is_some() || self.is_closed() {
            return Err(EngineError::InvalidState(format!(
                "workflow instance {} has already started",
                self.instance_id
            )));
        }
        let environment = root.bind_arguments(arguments)?;
        let id = self.tree.insert(root.clone(), None, environment);
        self.queue.push(WorkItem::Enter { instance: id });
        self.publish(WorkflowEvent::InstanceStarted {
            instance_id: self.instance_id,
            workflow_name: self.workflow_name.clone(),
        });
        self.publish(WorkflowEvent::ActivityScheduled {
            instance_id: self.instance_id,
            activity_instance: id,
            activity: root.display_name().to_string(),
        });
        tracing::info!(
            instance_id = %self.instance_id,
            workflow = %self.workflow_name,
            "workflow instance started"
        );
        Ok(id)
    }

    pub fn schedule(
        &mut self,
        parent: ActivityInstanceId,
        child: Arc<Activity>,
        arguments: Environment,
    ) -> Result<ActivityInstanceId, EngineError> {
        let Some(parent_node) = self.tree.get(parent) else {
            return Err(EngineError::InvalidState(format!(
                "cannot schedule '{}': parent {parent} does not exist",
                child.display_name()
            )));
        };
        if parent_node.is_closed()
            || parent_node.cancel_requested
            || parent_node.pending_fault.is_some()
        {
            return Err(EngineError::InvalidState(format!(
                "cannot schedule '{}' under '{}' ({parent}), which is {}",
                child.display_name(),
                parent_node.display_name(),
                if parent_node.is_closed() { "closed" } else { "closing" }
            )));
        }

        let environment = child.bind_arguments(arguments)?;
        let id = self.tree.insert(child.clone(), Some(parent), environment);
        self.queue.push(WorkItem::Enter { instance: id });
        self.publish(WorkflowEvent::ActivityScheduled {
            instance_id: self.instance_id,
            activity_instance: id,
            activity: child.display_name().to_string(),
        });
        tracing::debug!(
            instance_id = %self.instance_id,
            parent = %parent,
            child = %id,
            activity = child.display_name(),
            "activity scheduled"
        );
        Ok(id)
    }

    /// Close `id` successfully. All of its children must already be closed.
    pub fn complete(
        &mut self,
        id: ActivityInstanceId,
        result: Option<Value>,
    ) -> Result<(), EngineError> {
        let Some(node) = self.tree.get(id) else {
            return Err(EngineError::InvalidState(format!("activity {id} does not exist")));
        };
        if node.is_closed() {
            return Err(EngineError::InvalidState(format!(
                "activity '{}' ({id}) is already closed",
                node.display_name()
            )));
        }

        let open = self.tree.open_children(id);
        if !open.is_empty() {
            let message = format!(
                "activity '{}' ({id}) completed while {} child instance(s) are still open",
                node.display_name(),
                open.len()
            );
            self.fatal.get_or_insert_with(|| FaultInfo {
                activity: node.display_name().to_string(),
                message: message.clone(),
            });
            return Err(EngineError::InvariantViolation(message));
        }

        let reason = if node.pending_fault.is_some() {
            CloseReason::Faulted
        } else if node.cancel_requested {
            CloseReason::Canceled
        } else {
            CloseReason::Completed
        };
        self.close(id, reason, result);
        Ok(())
    }

    /// Ask `id` and its open descendants to cancel at the next dispatch boundary.
    pub fn request_cancel(&mut self, id: ActivityInstanceId) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        if node.is_closed() || node.cancel_requested {
            return;
        }
        node.cancel_requested = true;
        self.queue.push(WorkItem::Cancel { instance: id });
    }

    pub fn cancel_workflow(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Some(root) = self.tree.root() {
            tracing::info!(instance_id = %self.instance_id, "workflow cancellation requested");
            self.request_cancel(root);
        }
    }

    pub fn create_bookmark(
        &mut self,
        owner: ActivityInstanceId,
        name: String,
        scope: Option<BookmarkScope>,
        suppress_persistable_idle: bool,
        callback: Option<BookmarkCallback>,
    ) -> Result<BookmarkInfo, EngineError> {
        let Some(node) = self.tree.get_mut(owner) else {
            return Err(EngineError::InvalidState(format!("activity {owner} does not exist")));
        };
        if node.is_closed() {
            return Err(EngineError::InvalidState(format!(
                "closed activity '{}' cannot create bookmark '{name}'",
                node.display_name()
            )));
        }

        let entry = BookmarkEntry::new(
            BookmarkKey::new(name, scope),
            owner,
            node.display_name(),
            suppress_persistable_idle,
            callback,
        );
        let info = entry.info();
        self.bookmarks.insert(entry)?;
        node.state = ActivityInstanceState::Suspended;

        tracing::debug!(
            instance_id = %self.instance_id,
            owner = %owner,
            bookmark = %info.name,
            suppresses_persistable_idle = info.suppresses_persistable_idle,
            "bookmark created"
        );
        self.publish(WorkflowEvent::BookmarkCreated {
            instance_id: self.instance_id,
            bookmark: info.clone(),
        });
        Ok(info)
    }

    pub fn create_timer(
        &mut self,
        owner: ActivityInstanceId,
        after: Duration,
        options: BookmarkOptions,
    ) -> Result<BookmarkInfo, EngineError> {
        self.timer_sequence += 1;
        let name = format!("timer:{}:{}", owner.0, self.timer_sequence);
        let BookmarkOptions {
            scope,
            suppress_persistable_idle,
            callback,
        } = options;
        let info = self.create_bookmark(owner, name, scope, suppress_persistable_idle, callback)?;
        self.timers
            .arm(BookmarkKey::new(info.name.clone(), info.scope.clone()), after);
        Ok(info)
    }

    /// Remove a bookmark `owner` created without resuming it.
    pub fn remove_bookmark(
        &mut self,
        owner: ActivityInstanceId,
        name: &str,
        scope: Option<&BookmarkScope>,
    ) -> bool {
        let key = BookmarkKey::new(name, scope.cloned());
        if self.bookmarks.owner_of(&key) != Some(owner) {
            return false;
        }
        self.bookmarks.take_key(&key);
        self.timers.cancel(&key);
        true
    }

    /// Consume a bookmark on behalf of an external caller and enqueue its
    /// resumption.
    pub fn resume_bookmark(
        &mut self,
        name: &str,
        scope: Option<&BookmarkScope>,
        value: Value,
    ) -> Result<(), BookmarkError> {
        if self.is_closed() {
            return Err(BookmarkError::NotFound {
                name: name.to_string(),
                scope: scope.cloned(),
            });
        }
        let entry = self.bookmarks.take(name, scope)?;
        self.timers.cancel(&entry.key);
        self.queue.push(WorkItem::BookmarkResumed { entry, value });
        Ok(())
    }

    /// Returns true if the timer's bookmark was still outstanding.
    pub fn timer_fired(&mut self, key: &BookmarkKey) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.bookmarks.take_key(key) {
            Some(entry) => {
                self.timers.forget(key);
                self.queue.push(WorkItem::TimerFired { entry });
                true
            }
            None => false,
        }
    }

    /// Stop every pending timer. Used when the instance unloads.
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch the head of the work queue. Returns false if there was
    /// nothing to do.
    pub fn step(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(item) = self.queue.pop() else {
            return false;
        };
        let span = tracing::debug_span!(
            "dispatch",
            instance_id = %self.instance_id,
            kind = item.kind(),
            activity_instance = %item.target(),
        );
        let _enter = span.enter();

        match item {
            WorkItem::Enter { instance } => self.enter(instance),
            WorkItem::Completed { parent, child } => self.child_completed(parent, child),
            WorkItem::BookmarkResumed { entry, value } => self.resume(entry, value),
            WorkItem::TimerFired { entry } => self.resume(entry, Value::Null),
            WorkItem::Cancel { instance } => self.cancel(instance),
        }

        if let Some(fault) = self.fatal.take() {
            self.abort(fault);
        }
        true
    }

    /// Dispatch until the queue is empty or the instance closes.
    pub fn drain(&mut self) -> usize {
        let mut dispatched = 0;
        while self.step() {
            dispatched += 1;
        }
        dispatched
    }

    /// Call into the behavior of `id`, turning an error into a fault.
    fn invoke<F>(&mut self, id: ActivityInstanceId, call: F)
    where
        F: FnOnce(&dyn ActivityBehavior, &mut ActivityContext<'_>) -> Result<(), EngineError>,
    {
        let Some(activity) = self.tree.get(id).map(|node| node.activity.clone()) else {
            return;
        };
        let behavior = activity.behavior().clone();
        let result = {
            let mut ctx = ActivityContext::new(self, id, activity.clone());
            call(behavior.as_ref(), &mut ctx)
        };

        match result {
            Ok(()) => {}
            Err(EngineError::InvariantViolation(message)) => {
                self.fatal.get_or_insert_with(|| FaultInfo {
                    activity: activity.display_name().to_string(),
                    message,
                });
            }
            Err(err) => {
                let fault = err.into_fault_info(activity.display_name());
                self.fault(id, fault);
            }
        }
    }

    fn enter(&mut self, id: ActivityInstanceId) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        if node.is_closed() {
            return;
        }
        if node.cancel_requested {
            self.close(id, CloseReason::Canceled, None);
            return;
        }
        node.state = ActivityInstanceState::Executing;
        self.invoke(id, |behavior, ctx| behavior.on_enter(ctx));
        self.refresh_suspension(id);
    }

    fn child_completed(&mut self, parent: ActivityInstanceId, child: ActivityInstanceId) {
        let Some(node) = self.tree.remove(child) else {
            return;
        };
        let completed = CompletedChild {
            id: node.id,
            outputs: node.activity.collect_outputs(&node.environment),
            activity: node.activity,
            reason: match node.state {
                ActivityInstanceState::Closed(reason) => reason,
                _ => CloseReason::Completed,
            },
            result: node.result,
            fault: node.pending_fault,
        };

        let Some(parent_node) = self.tree.get(parent) else {
            return;
        };
        if parent_node.is_closed() {
            return;
        }
        if parent_node.pending_fault.is_some() || parent_node.canceling {
            self.close_if_settled(parent);
            return;
        }
        if parent_node.cancel_requested {
            // The parent's queued cancel item settles it.
            return;
        }

        match (&completed.reason, &completed.fault) {
            (CloseReason::Faulted, Some(fault)) => {
                let fault = fault.clone();
                self.invoke(parent, |behavior, ctx| {
                    behavior.on_child_faulted(ctx, &completed, &fault)
                });
            }
            _ => {
                self.invoke(parent, |behavior, ctx| {
                    behavior.on_child_completed(ctx, &completed)
                });
            }
        }
        self.refresh_suspension(parent);
    }

    fn resume(&mut self, entry: BookmarkEntry, value: Value) {
        let owner = entry.owner;
        let Some(node) = self.tree.get_mut(owner) else {
            return;
        };
        if node.is_closed() {
            tracing::debug!(
                instance_id = %self.instance_id,
                bookmark = %entry.key,
                "ignoring resumption of bookmark owned by closed activity"
            );
            return;
        }
        node.state = ActivityInstanceState::Executing;

        let info = entry.info();
        self.publish(WorkflowEvent::BookmarkResumed {
            instance_id: self.instance_id,
            name: info.name.clone(),
            scope: info.scope.clone(),
        });
        tracing::debug!(
            instance_id = %self.instance_id,
            owner = %owner,
            bookmark = %entry.key,
            "bookmark resumed"
        );

        match entry.callback {
            Some(callback) => {
                self.invoke(owner, |_, ctx| callback(ctx, &info, value));
            }
            None => {
                self.invoke(owner, |behavior, ctx| behavior.on_resumed(ctx, &info, value));
            }
        }
        self.refresh_suspension(owner);
    }

    fn cancel(&mut self, id: ActivityInstanceId) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        if node.is_closed() {
            return;
        }
        if node.state == ActivityInstanceState::Created {
            self.close(id, CloseReason::Canceled, None);
            return;
        }

        if let Some(node) = self.tree.get_mut(id) {
            node.canceling = true;
        }
        self.drop_bookmarks_of(id);
        self.invoke(id, |behavior, ctx| behavior.on_cancel(ctx));
        self.settle_or_cancel_children(id);
    }

    fn fault(&mut self, id: ActivityInstanceId, fault: FaultInfo) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        if node.is_closed() {
            return;
        }
        tracing::warn!(
            instance_id = %self.instance_id,
            activity = node.display_name(),
            origin = %fault.activity,
            error = %fault.message,
            "activity faulted"
        );
        node.pending_fault.get_or_insert(fault);
        self.drop_bookmarks_of(id);
        self.settle_or_cancel_children(id);
    }

    fn settle_or_cancel_children(&mut self, id: ActivityInstanceId) {
        let open = self.tree.open_children(id);
        if open.is_empty() {
            self.close_if_settled(id);
        } else {
            for child in open {
                self.request_cancel(child);
            }
        }
    }

    /// Close a canceling or faulting instance once it has no open children.
    fn close_if_settled(&mut self, id: ActivityInstanceId) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        if node.is_closed() || self.tree.has_open_children(id) {
            return;
        }
        let reason = if node.pending_fault.is_some() {
            CloseReason::Faulted
        } else {
            CloseReason::Canceled
        };
        self.close(id, reason, None);
    }

    fn refresh_suspension(&mut self, id: ActivityInstanceId) {
        let outstanding = self.bookmarks.count_owned_by(id);
        if let Some(node) = self.tree.get_mut(id) {
            if !node.is_closed() {
                node.state = if outstanding > 0 {
                    ActivityInstanceState::Suspended
                } else {
                    ActivityInstanceState::Executing
                };
            }
        }
    }

    fn drop_bookmarks_of(&mut self, id: ActivityInstanceId) {
        for entry in self.bookmarks.remove_owned_by(id) {
            self.timers.cancel(&entry.key);
        }
    }

    /// Close `id`, dropping any bookmark it still owns.
    fn close(&mut self, id: ActivityInstanceId, reason: CloseReason, result: Option<Value>) {
        self.drop_bookmarks_of(id);
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        node.state = ActivityInstanceState::Closed(reason);
        node.result = result;
        let parent = node.parent;
        let activity = node.display_name().to_string();

        tracing::debug!(
            instance_id = %self.instance_id,
            activity_instance = %id,
            activity = %activity,
            reason = %reason,
            "activity closed"
        );
        self.publish(WorkflowEvent::ActivityClosed {
            instance_id: self.instance_id,
            activity_instance: id,
            activity,
            reason,
        });

        match parent {
            Some(parent) => self.queue.push(WorkItem::Completed { parent, child: id }),
            None => self.finish(id, reason),
        }
    }

    /// The root closed: settle the whole instance.
    fn finish(&mut self, root: ActivityInstanceId, reason: CloseReason) {
        let (outcome, event) = match (reason, self.tree.get(root)) {
            (CloseReason::Completed, Some(node)) => {
                let outputs = node.activity.collect_outputs(&node.environment);
                (
                    WorkflowOutcome::Completed {
                        outputs: outputs.clone(),
                    },
                    WorkflowEvent::Completed {
                        instance_id: self.instance_id,
                        outputs,
                    },
                )
            }
            (CloseReason::Faulted, node) => {
                let fault = node
                    .and_then(|n| n.pending_fault.clone())
                    .unwrap_or_else(|| FaultInfo {
                        activity: self.workflow_name.clone(),
                        message: "workflow faulted".to_string(),
                    });
                (
                    WorkflowOutcome::Faulted {
                        fault: fault.clone(),
                    },
                    WorkflowEvent::Faulted {
                        instance_id: self.instance_id,
                        fault,
                    },
                )
            }
            _ => (
                WorkflowOutcome::Canceled,
                WorkflowEvent::Canceled {
                    instance_id: self.instance_id,
                },
            ),
        };

        for entry in self.bookmarks.drain_all() {
            self.timers.cancel(&entry.key);
        }
        self.timers.cancel_all();
        self.queue.clear();

        tracing::info!(
            instance_id = %self.instance_id,
            workflow = %self.workflow_name,
            outcome = %outcome.status(),
            "workflow instance closed"
        );
        self.outcome = Some(outcome);
        self.publish(event);
    }

    /// Tear the instance down after an invariant violation.
    fn abort(&mut self, fault: FaultInfo) {
        if self.is_closed() {
            return;
        }
        tracing::error!(
            instance_id = %self.instance_id,
            activity = %fault.activity,
            error = %fault.message,
            "invariant violation, aborting workflow instance"
        );
        self.tree
            .close_all(ActivityInstanceState::Closed(CloseReason::Faulted));
        self.bookmarks.drain_all();
        self.timers.cancel_all();
        self.queue.clear();
        self.outcome = Some(WorkflowOutcome::Faulted {
            fault: fault.clone(),
        });
        self.publish(WorkflowEvent::Faulted {
            instance_id: self.instance_id,
            fault,
        });
    }
}
