//! Per-instance extension registry.
//!
//! Activities depend on host capabilities ("extensions") by type. The host
//! registers concrete instances or zero-argument default providers before an
//! instance starts; activities may also declare fallback providers in their
//! metadata. Resolution is memoized, so a provider runs at most once per
//! workflow instance and every lookup of a type returns the same `Arc`.

pub mod behavior;
pub mod metadata;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use canopy_types::error::{ExtensionRequiredError, ValidationError};

use self::metadata::GraphMetadata;

/// A resolved extension instance.
pub type SharedExtension = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Extension type key
// ---------------------------------------------------------------------------

/// Capability key: a `TypeId` paired with its full type name for errors.
#[derive(Clone, Copy)]
pub struct ExtensionType {
    id: TypeId,
    name: &'static str,
}

impl ExtensionType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ExtensionType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ExtensionType {}

impl Hash for ExtensionType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ---------------------------------------------------------------------------
// Default providers
// ---------------------------------------------------------------------------

type ExtensionFactory = dyn Fn() -> SharedExtension + Send + Sync;

/// Zero-argument factory for one extension type.
#[derive(Clone)]
pub struct ExtensionProvider {
    ty: ExtensionType,
    factory: Arc<ExtensionFactory>,
}

impl ExtensionProvider {
    pub fn new<T, F>(factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            ty: ExtensionType::of::<T>(),
            factory: Arc::new(move || Arc::new(factory()) as SharedExtension),
        }
    }

    pub fn extension_type(&self) -> ExtensionType {
        self.ty
    }

    fn create(&self) -> SharedExtension {
        (self.factory)()
    }
}

impl fmt::Debug for ExtensionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionProvider")
            .field("type", &self.ty)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Extensions of one workflow instance.
///
/// Lookup order: resolved or host-added instances, then host default
/// providers, then providers declared by the graph (first declaration in
/// pre-order wins).
#[derive(Default)]
pub struct ExtensionRegistry {
    resolved: HashMap<ExtensionType, SharedExtension>,
    host_providers: HashMap<ExtensionType, ExtensionProvider>,
    graph_providers: HashMap<ExtensionType, ExtensionProvider>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete instance, replacing any earlier one of the same type.
    pub fn add_instance<T: Any + Send + Sync>(&mut self, extension: T) {
        self.add_shared(Arc::new(extension));
    }

    pub fn add_shared<T: Any + Send + Sync>(&mut self, extension: Arc<T>) {
        self.resolved
            .insert(ExtensionType::of::<T>(), extension as SharedExtension);
    }

    pub fn add_default_provider(&mut self, provider: ExtensionProvider) {
        self.host_providers.insert(provider.extension_type(), provider);
    }

    /// Whether `ty` can be resolved without invoking anything new.
    pub fn is_resolved(&self, ty: ExtensionType) -> bool {
        self.resolved.contains_key(&ty)
    }

    /// Resolve `ty`, running a provider on first use.
    pub fn resolve(&mut self, ty: ExtensionType) -> Option<SharedExtension> {
        if let Some(existing) = self.resolved.get(&ty) {
            return Some(existing.clone());
        }
        let provider = self
            .host_providers
            .get(&ty)
            .or_else(|| self.graph_providers.get(&ty))?;
        let created = provider.create();
        tracing::debug!(extension = ty.type_name(), "extension created by default provider");
        self.resolved.insert(ty, created.clone());
        Some(created)
    }

    pub fn get<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.resolve(ExtensionType::of::<T>())?.downcast::<T>().ok()
    }

    /// Adopt the graph's declared providers and check every requirement.
    ///
    /// Returns one error per missing type, naming the first activity that
    /// declared it.
    pub fn validate(&mut self, graph: &GraphMetadata) -> Result<(), ValidationError> {
        for provider in graph.providers() {
            self.graph_providers
                .entry(provider.extension_type())
                .or_insert_with(|| provider.clone());
        }

        let mut errors: Vec<ExtensionRequiredError> = Vec::new();
        for requirement in graph.requirements() {
            let type_name = requirement.extension.type_name();
            if self.resolve(requirement.extension).is_some()
                || errors.iter().any(|e| e.type_name == type_name)
            {
                continue;
            }
            errors.push(ExtensionRequiredError {
                type_name: type_name.to_string(),
                activity: requirement.activity.clone(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { errors })
        }
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("resolved", &self.resolved.keys().collect::<Vec<_>>())
            .field("host_providers", &self.host_providers.len())
            .field("graph_providers", &self.graph_providers.len())
            .finish()
    }
}
