//! Capability registry and requirement injection
//!
//! A service publishes each trait it implements as an `Arc<dyn Trait>`. A
//! stage lists [`Requirement`]s; [`inject`] looks them up and decides
//! whether the stage may run on this worker.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of a capability trait object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    type_id: TypeId,
    name: &'static str,
}

impl CapabilityId {
    /// Identity of `T`, typically `dyn SomeTrait`
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: short_name(std::any::type_name::<T>()),
        }
    }

    /// Readable name for logs
    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn short_name(full: &'static str) -> &'static str {
    let trimmed = full.strip_prefix("dyn ").unwrap_or(full);
    trimmed.rsplit("::").next().unwrap_or(trimmed)
}

/// What happens when a required capability is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// Missing is fine; the stage checks for it at run time
    Optional,
    /// Missing fails the stage on this worker
    Mandatory,
    /// Missing makes the stage a no-op on this worker
    Skip,
}

/// A capability a stage needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    /// Required capability
    pub capability: CapabilityId,
    /// Behaviour when it is missing
    pub dependency: Dependency,
}

impl Requirement {
    /// Requirement on `T` with the given dependency kind
    pub fn of<T: ?Sized + 'static>(dependency: Dependency) -> Self {
        Self {
            capability: CapabilityId::of::<T>(),
            dependency,
        }
    }

    /// Optional requirement on `T`
    pub fn optional<T: ?Sized + 'static>() -> Self {
        Self::of::<T>(Dependency::Optional)
    }

    /// Mandatory requirement on `T`
    pub fn mandatory<T: ?Sized + 'static>() -> Self {
        Self::of::<T>(Dependency::Mandatory)
    }

    /// Requirement on `T` that skips the stage when missing
    pub fn skip<T: ?Sized + 'static>() -> Self {
        Self::of::<T>(Dependency::Skip)
    }
}

#[derive(Clone)]
struct Entry {
    name: &'static str,
    instance: Arc<dyn Any + Send + Sync>,
}

/// Capabilities exposed by the service a worker runs
#[derive(Clone, Default)]
pub struct Capabilities {
    entries: HashMap<TypeId, Entry>,
}

impl Capabilities {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `instance` as capability `T`, builder style
    pub fn with<T: ?Sized + Send + Sync + 'static>(mut self, instance: Arc<T>) -> Self {
        self.register(instance);
        self
    }

    /// Publish `instance` as capability `T`
    pub fn register<T: ?Sized + Send + Sync + 'static>(&mut self, instance: Arc<T>) {
        let id = CapabilityId::of::<T>();
        self.entries.insert(
            id.type_id,
            Entry {
                name: id.name,
                instance: Arc::new(instance),
            },
        );
    }

    /// Look up capability `T`
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.instance.downcast_ref::<Arc<T>>())
            .cloned()
    }

    /// Whether capability `id` is published
    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.entries.contains_key(&id.type_id)
    }

    /// Number of published capabilities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is published
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn copy_entry(&self, id: &CapabilityId, into: &mut Capabilities) {
        if let Some(entry) = self.entries.get(&id.type_id) {
            into.entries.insert(id.type_id, entry.clone());
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        f.debug_struct("Capabilities")
            .field("published", &names)
            .finish()
    }
}

/// Verdict of [`inject`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectResult {
    /// Every mandatory and skip requirement is met
    Success,
    /// A skip requirement is missing; the stage does nothing here
    Skip(Vec<&'static str>),
    /// A mandatory requirement is missing; the stage fails here
    Failure(Vec<&'static str>),
}

/// Resolve `requirements` against `available`
///
/// Returns the verdict together with the subset of capabilities the stage
/// asked for. Failure takes precedence over skip.
pub fn inject(requirements: &[Requirement], available: &Capabilities) -> (InjectResult, Capabilities) {
    let mut injected = Capabilities::new();
    let mut missing_mandatory = Vec::new();
    let mut missing_skip = Vec::new();

    for requirement in requirements {
        let id = &requirement.capability;
        if available.contains(id) {
            available.copy_entry(id, &mut injected);
            continue;
        }
        match requirement.dependency {
            Dependency::Optional => {}
            Dependency::Mandatory => missing_mandatory.push(id.name()),
            Dependency::Skip => missing_skip.push(id.name()),
        }
    }

    let verdict = if !missing_mandatory.is_empty() {
        InjectResult::Failure(missing_mandatory)
    } else if !missing_skip.is_empty() {
        InjectResult::Skip(missing_skip)
    } else {
        InjectResult::Success
    };
    (verdict, injected)
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    trait Counter: Send + Sync {}

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    fn with_greeter() -> Capabilities {
        Capabilities::new().with::<dyn Greeter>(Arc::new(English))
    }

    #[test]
    fn test_register_and_get() {
        let caps = with_greeter();
        let greeter = caps.get::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet(), "hello");
        assert!(caps.get::<dyn Counter>().is_none());
        assert_eq!(caps.len(), 1);
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(CapabilityId::of::<dyn Greeter>().name(), "Greeter");
        let debug = format!("{:?}", with_greeter());
        assert!(debug.contains("Greeter"));
    }

    #[test]
    fn test_inject_success_copies_requested_only() {
        let caps = with_greeter();
        let (verdict, injected) = inject(
            &[
                Requirement::mandatory::<dyn Greeter>(),
                Requirement::optional::<dyn Counter>(),
            ],
            &caps,
        );
        assert_eq!(verdict, InjectResult::Success);
        assert!(injected.get::<dyn Greeter>().is_some());
        assert!(injected.get::<dyn Counter>().is_none());
    }

    #[test]
    fn test_inject_mandatory_missing_fails() {
        let (verdict, _) = inject(&[Requirement::mandatory::<dyn Counter>()], &with_greeter());
        assert_eq!(verdict, InjectResult::Failure(vec!["Counter"]));
    }

    #[test]
    fn test_inject_skip_missing_skips() {
        let (verdict, _) = inject(&[Requirement::skip::<dyn Counter>()], &with_greeter());
        assert_eq!(verdict, InjectResult::Skip(vec!["Counter"]));
    }

    #[test]
    fn test_inject_failure_beats_skip() {
        let (verdict, _) = inject(
            &[
                Requirement::skip::<dyn Greeter>(),
                Requirement::skip::<dyn Counter>(),
                Requirement::mandatory::<dyn Counter>(),
            ],
            &Capabilities::new(),
        );
        assert!(matches!(verdict, InjectResult::Failure(_)));
    }
}
