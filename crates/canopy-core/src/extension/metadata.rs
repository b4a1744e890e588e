//! Metadata collection for activity graphs.
//!
//! Each behavior declares its extension requirements and default providers
//! through [`ActivityMetadata`]. The declarations of a whole graph are
//! gathered into a [`GraphMetadata`] once and cached in a [`MetadataCache`]
//! owned by the runtime, so validation never re-walks a graph it has seen.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::{ExtensionProvider, ExtensionType};
use crate::activity::Activity;

/// Declarations made by one activity during metadata collection.
#[derive(Debug, Default)]
pub struct ActivityMetadata {
    requirements: Vec<ExtensionType>,
    providers: Vec<ExtensionProvider>,
}

impl ActivityMetadata {
    /// This activity cannot run unless an extension of type `T` resolves.
    pub fn require_extension<T: Any + Send + Sync>(&mut self) {
        self.requirements.push(ExtensionType::of::<T>());
    }

    /// Fallback used when the host never provides a `T` itself.
    pub fn add_default_extension_provider<T, F>(&mut self, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.providers.push(ExtensionProvider::new(factory));
    }
}

/// A requirement together with the activity that declared it.
#[derive(Debug, Clone)]
pub struct RequiredExtension {
    pub extension: ExtensionType,
    pub activity: String,
}

/// Everything the metadata pass learned about one graph.
#[derive(Debug, Default)]
pub struct GraphMetadata {
    requirements: Vec<RequiredExtension>,
    providers: Vec<ExtensionProvider>,
    activity_count: usize,
}

impl GraphMetadata {
    /// Walk `root` in pre-order and ask every behavior for its declarations.
    pub fn collect(root: &Activity) -> Self {
        let mut graph = GraphMetadata::default();
        root.walk(&mut |activity| {
            let mut metadata = ActivityMetadata::default();
            activity.behavior().cache_metadata(&mut metadata);
            graph.activity_count += 1;
            graph
                .requirements
                .extend(metadata.requirements.into_iter().map(|extension| RequiredExtension {
                    extension,
                    activity: activity.display_name().to_string(),
                }));
            graph.providers.extend(metadata.providers);
        });
        graph
    }

    pub fn requirements(&self) -> &[RequiredExtension] {
        &self.requirements
    }

    pub fn providers(&self) -> &[ExtensionProvider] {
        &self.providers
    }

    pub fn activity_count(&self) -> usize {
        self.activity_count
    }
}

/// Per-runtime cache of collected graph metadata, keyed by root activity id.
///
/// Owned by a `WorkflowRuntime` rather than held in a static, so tests and
/// separate runtimes never observe each other's entries.
#[derive(Debug, Default)]
pub struct MetadataCache {
    graphs: DashMap<Uuid, Arc<GraphMetadata>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_collect(&self, root: &Activity) -> Arc<GraphMetadata> {
        if let Some(cached) = self.graphs.get(&root.id()) {
            return cached.clone();
        }
        let collected = Arc::new(GraphMetadata::collect(root));
        tracing::debug!(
            workflow = root.display_name(),
            activities = collected.activity_count(),
            requirements = collected.requirements().len(),
            "collected activity metadata"
        );
        self.graphs
            .entry(root.id())
            .or_insert(collected)
            .clone()
    }

    pub fn contains(&self, root: &Activity) -> bool {
        self.graphs.contains_key(&root.id())
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    pub fn clear(&self) {
        self.graphs.clear();
    }
}
