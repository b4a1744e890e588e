//! The live activity instance tree of one workflow instance.
//!
//! Instances live in an arena keyed by [`ActivityInstanceId`]. Parents own
//! their children through the id list; children refer back to their parent
//! by id only, which is what completion propagation and variable lookup use.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use canopy_types::activity::{
    ActivityInstanceId, ActivityInstanceState, Environment, FaultInfo,
};
use canopy_types::error::EngineError;
use serde_json::Value;

use crate::activity::Activity;

pub(crate) struct ActivityInstance {
    pub id: ActivityInstanceId,
    pub activity: Arc<Activity>,
    pub parent: Option<ActivityInstanceId>,
    /// Children not yet recorded by this instance, in scheduling order.
    pub children: Vec<ActivityInstanceId>,
    pub environment: Environment,
    /// Behavior-private execution state.
    pub properties: BTreeMap<String, Value>,
    pub state: ActivityInstanceState,
    pub result: Option<Value>,
    pub cancel_requested: bool,
    /// Set once the queued cancel item has run `on_cancel`.
    pub canceling: bool,
    pub pending_fault: Option<FaultInfo>,
}

impl ActivityInstance {
    pub fn display_name(&self) -> &str {
        self.activity.display_name()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

#[derive(Default)]
pub(crate) struct InstanceTree {
    nodes: HashMap<ActivityInstanceId, ActivityInstance>,
    root: Option<ActivityInstanceId>,
    next_id: u64,
}

impl InstanceTree {
    pub fn insert(
        &mut self,
        activity: Arc<Activity>,
        parent: Option<ActivityInstanceId>,
        environment: Environment,
    ) -> ActivityInstanceId {
        let id = ActivityInstanceId(self.next_id);
        self.next_id += 1;

        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(parent_node) => parent_node.children.push(id),
            None => self.root = Some(id),
        }

        self.nodes.insert(
            id,
            ActivityInstance {
                id,
                activity,
                parent,
                children: Vec::new(),
                environment,
                properties: BTreeMap::new(),
                state: ActivityInstanceState::Created,
                result: None,
                cancel_requested: false,
                canceling: false,
                pending_fault: None,
            },
        );
        id
    }

    pub fn root(&self) -> Option<ActivityInstanceId> {
        self.root
    }

    pub fn get(&self, id: ActivityInstanceId) -> Option<&ActivityInstance> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: ActivityInstanceId) -> Option<&mut ActivityInstance> {
        self.nodes.get_mut(&id)
    }

    /// Unrecorded children of `id` that have not closed yet.
    pub fn open_children(&self, id: ActivityInstanceId) -> Vec<ActivityInstanceId> {
        self.get(id)
            .map(|node| {
                node.children
                    .iter()
                    .copied()
                    .filter(|c| self.get(*c).is_some_and(|child| !child.is_closed()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_open_children(&self, id: ActivityInstanceId) -> bool {
        !self.open_children(id).is_empty()
    }

    /// Detach `id` from its parent and drop it together with any
    /// descendants still in the arena.
    pub fn remove(&mut self, id: ActivityInstanceId) -> Option<ActivityInstance> {
        let node = self.nodes.remove(&id)?;
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        let mut orphans = node.children.clone();
        while let Some(orphan) = orphans.pop() {
            if let Some(removed) = self.nodes.remove(&orphan) {
                orphans.extend(removed.children);
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
        Some(node)
    }

    /// Close every instance that is still open, in any order. Used when the
    /// whole workflow instance aborts.
    pub fn close_all(&mut self, state: ActivityInstanceState) -> usize {
        let mut closed = 0;
        for node in self.nodes.values_mut().filter(|n| !n.is_closed()) {
            node.state = state;
            closed += 1;
        }
        closed
    }

    /// Resolve `name` in the environment of `id` or its nearest ancestor
    /// that declares it.
    pub fn lookup(&self, id: ActivityInstanceId, name: &str) -> Option<&Value> {
        let mut cursor = self.get(id);
        while let Some(node) = cursor {
            if let Some(value) = node.environment.get(name) {
                return Some(value);
            }
            cursor = node.parent.and_then(|p| self.get(p));
        }
        None
    }

    /// Write `name` into the nearest scope that declares it.
    pub fn assign(
        &mut self,
        id: ActivityInstanceId,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get_mut(&current) else {
                break;
            };
            if let Some(slot) = node.environment.get_mut(name) {
                *slot = value;
                return Ok(());
            }
            cursor = node.parent;
        }
        Err(EngineError::InvalidArgument {
            name: name.to_string(),
            reason: "no enclosing scope declares it".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that no closed instance still has an open child and that every
    /// parent link points at a node listing it as a child.
    pub fn check_invariants(&self) -> Result<(), String> {
        for node in self.nodes.values() {
            if node.is_closed() && self.has_open_children(node.id) {
                return Err(format!(
                    "{} '{}' is closed with open children {:?}",
                    node.id,
                    node.display_name(),
                    self.open_children(node.id)
                ));
            }
            if let Some(parent) = node.parent.and_then(|p| self.get(p)) {
                if !parent.children.contains(&node.id) {
                    return Err(format!(
                        "{} is not listed as a child of {}",
                        node.id, parent.id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::activity::CloseReason;
    use serde_json::json;

    use crate::activity::{Activity, Sequence};

    fn node(name: &str) -> Arc<Activity> {
        Activity::new(name, Sequence).into_shared()
    }

    #[test]
    fn insert_links_parent_and_child() {
        let mut tree = InstanceTree::default();
        let root = tree.insert(node("root"), None, Environment::new());
        let child = tree.insert(node("child"), Some(root), Environment::new());

        assert_eq!(tree.root(), Some(root));
        assert_eq!(tree.get(root).unwrap().children, vec![child]);
        assert_eq!(tree.get(child).unwrap().parent, Some(root));
        assert_eq!(tree.open_children(root), vec![child]);
    }

    #[test]
    fn closed_children_are_not_open() {
        let mut tree = InstanceTree::default();
        let root = tree.insert(node("root"), None, Environment::new());
        let child = tree.insert(node("child"), Some(root), Environment::new());
        tree.get_mut(child).unwrap().state = ActivityInstanceState::Closed(CloseReason::Completed);

        assert!(!tree.has_open_children(root));
        assert_eq!(tree.get(root).unwrap().children.len(), 1);
    }

    #[test]
    fn remove_detaches_and_drops_descendants() {
        let mut tree = InstanceTree::default();
        let root = tree.insert(node("root"), None, Environment::new());
        let child = tree.insert(node("child"), Some(root), Environment::new());
        tree.insert(node("grandchild"), Some(child), Environment::new());

        let removed = tree.remove(child).unwrap();
        assert_eq!(removed.display_name(), "child");
        assert!(tree.get(root).unwrap().children.is_empty());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn variables_resolve_through_ancestors() {
        let mut tree = InstanceTree::default();
        let root = tree.insert(
            node("root"),
            None,
            Environment::from([("total".to_string(), json!(1))]),
        );
        let child = tree.insert(
            node("child"),
            Some(root),
            Environment::from([("local".to_string(), json!("x"))]),
        );

        assert_eq!(tree.lookup(child, "total"), Some(&json!(1)));
        assert_eq!(tree.lookup(root, "local"), None);

        tree.assign(child, "total", json!(2)).unwrap();
        assert_eq!(tree.get(root).unwrap().environment["total"], json!(2));
        assert!(tree.assign(child, "missing", json!(0)).is_err());
    }

    #[test]
    fn invariant_check_flags_closed_parent_with_open_child() {
        let mut tree = InstanceTree::default();
        let root = tree.insert(node("root"), None, Environment::new());
        tree.insert(node("child"), Some(root), Environment::new());
        assert!(tree.check_invariants().is_ok());

        tree.get_mut(root).unwrap().state = ActivityInstanceState::Closed(CloseReason::Completed);
        let err = tree.check_invariants().unwrap_err();
        assert!(err.contains("closed with open children"));
    }
}
