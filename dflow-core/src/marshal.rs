//! Surrogation of non-serializable references.
//!
//! Activations often hold live services (clients, clocks, handles) that can't
//! be written to storage. A [`Marshaler`] swaps such a reference for a
//! serializable token when a frame is captured, and swaps the token back for
//! a live reference when the frame is rebuilt.
//!
//! [`ScopedSurrogator`] is the stock implementation. A process-wide root scope
//! holds long-lived mappings and restorers; each flow gets a child scope for
//! its own mappings. A child falls back to the root on a miss, the root never
//! looks into children, and siblings never see each other.

use crate::error::FlowError;
use crate::types::{TypeId, TypeResolver};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId as RuntimeTypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A shared, type-erased live reference.
pub type Reference = Arc<dyn Any + Send + Sync>;

/// Receives the surrogate chosen for a reference.
pub trait SurrogationAction {
    fn surrogate_as(&mut self, type_id: &TypeId, token: Value);
}

/// Turns a surrogate token back into a live reference.
pub trait SurrogateConverter {
    fn convert(&self, token: Value) -> Result<Reference, FlowError>;
}

/// Receives a converter able to restore a surrogate.
pub trait RestorationAction {
    fn restore_as(&mut self, type_id: &TypeId, converter: &dyn SurrogateConverter);
}

/// Bidirectional mapping between live references and serializable tokens.
pub trait Marshaler: Send + Sync {
    /// Invoke `action` with the surrogate of `value`, if one is known.
    fn try_surrogate(&self, value: &Reference, action: &mut dyn SurrogationAction) -> bool;

    /// Invoke `action` with a converter for tokens of `type_id` that yields
    /// references of type `target`, if one is known.
    fn try_restore(
        &self,
        type_id: &TypeId,
        target: RuntimeTypeId,
        action: &mut dyn RestorationAction,
    ) -> bool;
}

/// Marshaler with no mappings at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMarshaler;

impl Marshaler for NullMarshaler {
    fn try_surrogate(&self, _: &Reference, _: &mut dyn SurrogationAction) -> bool {
        false
    }

    fn try_restore(&self, _: &TypeId, _: RuntimeTypeId, _: &mut dyn RestorationAction) -> bool {
        false
    }
}

fn address(value: &Reference) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

struct Mapping {
    type_id: TypeId,
    token: Value,
    target: RuntimeTypeId,
    reference: Reference,
}

type RestoreFn = Box<dyn Fn(Value) -> Result<Reference, FlowError> + Send + Sync>;

struct Restorer {
    target: RuntimeTypeId,
    restore: RestoreFn,
}

/// Two-level marshaler: a root scope and per-flow child scopes.
pub struct ScopedSurrogator {
    resolver: Arc<TypeResolver>,
    root: Option<Arc<ScopedSurrogator>>,
    mappings: RwLock<HashMap<usize, Mapping>>,
    restorers: HashMap<TypeId, Restorer>,
}

impl ScopedSurrogator {
    /// Start building a root scope.
    pub fn builder(resolver: Arc<TypeResolver>) -> SurrogatorBuilder {
        SurrogatorBuilder {
            resolver,
            restorers: HashMap::new(),
            error: None,
        }
    }

    /// A root scope with no restorers.
    pub fn root(resolver: Arc<TypeResolver>) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            root: None,
            mappings: RwLock::new(HashMap::new()),
            restorers: HashMap::new(),
        })
    }

    /// A child scope of `scope`. Children of a child attach to its root.
    pub fn child(scope: &Arc<ScopedSurrogator>) -> Self {
        let root = match &scope.root {
            Some(root) => Arc::clone(root),
            None => Arc::clone(scope),
        };
        Self {
            resolver: Arc::clone(&scope.resolver),
            root: Some(root),
            mappings: RwLock::new(HashMap::new()),
            restorers: HashMap::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.root.is_none()
    }

    /// Map `value` to `token` in this scope.
    ///
    /// The token's type must be registered in the resolver; its id tags the
    /// surrogate in storage.
    pub fn map<T, S>(&self, value: &Arc<T>, token: &S) -> Result<(), FlowError>
    where
        T: Any + Send + Sync,
        S: Serialize + 'static,
    {
        let type_id = self.resolver.type_id_of::<S>()?.clone();
        let token = serde_json::to_value(token)?;
        let reference: Reference = value.clone();
        let mut mappings = self
            .mappings
            .write()
            .map_err(|e| FlowError::Protocol(format!("Lock error: {}", e)))?;
        mappings.insert(
            address(&reference),
            Mapping {
                type_id,
                token,
                target: RuntimeTypeId::of::<T>(),
                reference,
            },
        );
        Ok(())
    }

    /// Remove the mapping of `value` from this scope only.
    pub fn unmap<T: Any + Send + Sync>(&self, value: &Arc<T>) -> bool {
        let reference: Reference = value.clone();
        self.mappings
            .write()
            .map(|mut mappings| mappings.remove(&address(&reference)).is_some())
            .unwrap_or(false)
    }

    fn lookup(&self, value: &Reference) -> Option<(TypeId, Value)> {
        let local = self.mappings.read().ok().and_then(|mappings| {
            mappings
                .get(&address(value))
                .map(|m| (m.type_id.clone(), m.token.clone()))
        });
        match (local, &self.root) {
            (Some(found), _) => Some(found),
            (None, Some(root)) => root.lookup(value),
            (None, None) => None,
        }
    }

    fn reverse_lookup(&self, type_id: &TypeId, target: RuntimeTypeId, token: &Value) -> Option<Reference> {
        let local = self.mappings.read().ok().and_then(|mappings| {
            mappings
                .values()
                .find(|m| m.type_id == *type_id && m.target == target && m.token == *token)
                .map(|m| Arc::clone(&m.reference))
        });
        match (local, &self.root) {
            (Some(found), _) => Some(found),
            (None, Some(root)) => root.reverse_lookup(type_id, target, token),
            (None, None) => None,
        }
    }

    fn has_mapping_for(&self, type_id: &TypeId, target: RuntimeTypeId) -> bool {
        let local = self
            .mappings
            .read()
            .map(|mappings| {
                mappings
                    .values()
                    .any(|m| m.type_id == *type_id && m.target == target)
            })
            .unwrap_or(false);
        local || self.root.as_ref().is_some_and(|root| root.has_mapping_for(type_id, target))
    }

    fn restorer(&self, type_id: &TypeId, target: RuntimeTypeId) -> Option<&Restorer> {
        let restorers = match &self.root {
            Some(root) => &root.restorers,
            None => &self.restorers,
        };
        restorers.get(type_id).filter(|r| r.target == target)
    }
}

impl Marshaler for ScopedSurrogator {
    fn try_surrogate(&self, value: &Reference, action: &mut dyn SurrogationAction) -> bool {
        match self.lookup(value) {
            Some((type_id, token)) => {
                action.surrogate_as(&type_id, token);
                true
            }
            None => false,
        }
    }

    fn try_restore(
        &self,
        type_id: &TypeId,
        target: RuntimeTypeId,
        action: &mut dyn RestorationAction,
    ) -> bool {
        let restorer = self.restorer(type_id, target);
        if restorer.is_none() && !self.has_mapping_for(type_id, target) {
            return false;
        }
        let converter = ScopeConverter {
            scope: self,
            type_id,
            target,
            restorer,
        };
        action.restore_as(type_id, &converter);
        true
    }
}

struct ScopeConverter<'a> {
    scope: &'a ScopedSurrogator,
    type_id: &'a TypeId,
    target: RuntimeTypeId,
    restorer: Option<&'a Restorer>,
}

impl SurrogateConverter for ScopeConverter<'_> {
    fn convert(&self, token: Value) -> Result<Reference, FlowError> {
        if let Some(reference) = self.scope.reverse_lookup(self.type_id, self.target, &token) {
            return Ok(reference);
        }
        match self.restorer {
            Some(restorer) => (restorer.restore)(token),
            None => Err(FlowError::UnknownType(format!(
                "no live reference for surrogate '{}' with token {}",
                self.type_id, token
            ))),
        }
    }
}

/// Builder for a root [`ScopedSurrogator`] with token restorers.
pub struct SurrogatorBuilder {
    resolver: Arc<TypeResolver>,
    restorers: HashMap<TypeId, Restorer>,
    error: Option<FlowError>,
}

impl SurrogatorBuilder {
    /// Rebuild references of type `T` from tokens of type `S`.
    ///
    /// Used when a flow resumes in a process where the original reference no
    /// longer exists.
    #[must_use]
    pub fn restorer<S, T, F>(mut self, restore: F) -> Self
    where
        S: DeserializeOwned + 'static,
        T: Any + Send + Sync,
        F: Fn(S) -> Result<Arc<T>, FlowError> + Send + Sync + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        let type_id = match self.resolver.type_id_of::<S>() {
            Ok(id) => id.clone(),
            Err(e) => {
                self.error = Some(e);
                return self;
            }
        };
        let restore: RestoreFn = Box::new(move |token| {
            let surrogate: S = serde_json::from_value(token)?;
            let reference: Reference = restore(surrogate)?;
            Ok(reference)
        });
        self.restorers.insert(
            type_id,
            Restorer {
                target: RuntimeTypeId::of::<T>(),
                restore,
            },
        );
        self
    }

    pub fn build(self) -> Result<Arc<ScopedSurrogator>, FlowError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok(Arc::new(ScopedSurrogator {
            resolver: self.resolver,
            root: None,
            mappings: RwLock::new(HashMap::new()),
            restorers: self.restorers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug)]
    struct Mailer {
        sender: String,
    }

    #[derive(Debug)]
    struct Clock;

    #[derive(Serialize, Deserialize)]
    struct MailerToken {
        sender: String,
    }

    #[derive(Serialize, Deserialize)]
    struct ClockToken;

    fn resolver() -> Arc<TypeResolver> {
        let mut resolver = TypeResolver::new();
        resolver.register::<MailerToken>("tests.MailerToken").unwrap();
        resolver.register::<ClockToken>("tests.ClockToken").unwrap();
        Arc::new(resolver)
    }

    #[derive(Default)]
    struct Captured(Option<(TypeId, Value)>);

    impl SurrogationAction for Captured {
        fn surrogate_as(&mut self, type_id: &TypeId, token: Value) {
            self.0 = Some((type_id.clone(), token));
        }
    }

    struct Restore {
        token: Value,
        result: Option<Result<Reference, FlowError>>,
    }

    impl RestorationAction for Restore {
        fn restore_as(&mut self, _: &TypeId, converter: &dyn SurrogateConverter) {
            self.result = Some(converter.convert(self.token.clone()));
        }
    }

    fn surrogate_of(marshaler: &dyn Marshaler, value: Reference) -> Option<(TypeId, Value)> {
        let mut captured = Captured::default();
        marshaler
            .try_surrogate(&value, &mut captured)
            .then(|| captured.0.take())
            .flatten()
    }

    #[test]
    fn test_root_does_not_find_unmapped_value() {
        let root = ScopedSurrogator::root(resolver());
        assert!(surrogate_of(root.as_ref(), Arc::new(Clock)).is_none());
    }

    #[test]
    fn test_child_finds_root_and_own_mappings() {
        let root = ScopedSurrogator::root(resolver());
        let clock = Arc::new(Clock);
        root.map(&clock, &ClockToken).unwrap();

        let child = ScopedSurrogator::child(&root);
        let mailer = Arc::new(Mailer {
            sender: "ops@example.com".into(),
        });
        child
            .map(
                &mailer,
                &MailerToken {
                    sender: mailer.sender.clone(),
                },
            )
            .unwrap();

        let (type_id, _) = surrogate_of(&child, clock.clone()).unwrap();
        assert_eq!(type_id.as_str(), "tests.ClockToken");
        let (type_id, token) = surrogate_of(&child, mailer.clone()).unwrap();
        assert_eq!(type_id.as_str(), "tests.MailerToken");
        assert_eq!(token["sender"], "ops@example.com");

        // The root never consults its children.
        assert!(surrogate_of(root.as_ref(), mailer).is_none());
    }

    #[test]
    fn test_siblings_are_isolated() {
        let root = ScopedSurrogator::root(resolver());
        let first = ScopedSurrogator::child(&root);
        let second = ScopedSurrogator::child(&root);
        let clock = Arc::new(Clock);
        first.map(&clock, &ClockToken).unwrap();

        assert!(surrogate_of(&first, clock.clone()).is_some());
        assert!(surrogate_of(&second, clock).is_none());
    }

    #[test]
    fn test_identity_not_equality() {
        let root = ScopedSurrogator::root(resolver());
        let clock = Arc::new(Clock);
        root.map(&clock, &ClockToken).unwrap();

        assert!(surrogate_of(root.as_ref(), clock.clone()).is_some());
        assert!(surrogate_of(root.as_ref(), Arc::new(Clock)).is_none());
    }

    #[test]
    fn test_map_requires_registered_token_type() {
        #[derive(Serialize)]
        struct Unregistered;
        let root = ScopedSurrogator::root(resolver());
        assert!(matches!(
            root.map(&Arc::new(Clock), &Unregistered),
            Err(FlowError::UnknownType(_))
        ));
    }

    #[test]
    fn test_restore_live_mapping_returns_same_reference() {
        let root = ScopedSurrogator::root(resolver());
        let child = ScopedSurrogator::child(&root);
        let clock = Arc::new(Clock);
        child.map(&clock, &ClockToken).unwrap();
        let (type_id, token) = surrogate_of(&child, clock.clone()).unwrap();

        let mut action = Restore {
            token,
            result: None,
        };
        assert!(child.try_restore(&type_id, RuntimeTypeId::of::<Clock>(), &mut action));
        let restored = action.result.unwrap().unwrap();
        let restored = restored.downcast::<Clock>().unwrap();
        assert!(Arc::ptr_eq(&restored, &clock));
    }

    #[test]
    fn test_restore_rejects_wrong_target_type() {
        let root = ScopedSurrogator::root(resolver());
        root.map(&Arc::new(Clock), &ClockToken).unwrap();
        let mut action = Restore {
            token: serde_json::json!(null),
            result: None,
        };
        assert!(!root.try_restore(
            &TypeId::new("tests.ClockToken"),
            RuntimeTypeId::of::<Mailer>(),
            &mut action
        ));
        assert!(action.result.is_none());
    }

    #[test]
    fn test_restorer_rebuilds_in_fresh_scope() {
        let root = ScopedSurrogator::builder(resolver())
            .restorer(|token: MailerToken| {
                Ok(Arc::new(Mailer {
                    sender: token.sender,
                }))
            })
            .build()
            .unwrap();
        let child = ScopedSurrogator::child(&root);

        let mut action = Restore {
            token: serde_json::json!({ "sender": "billing@example.com" }),
            result: None,
        };
        assert!(child.try_restore(
            &TypeId::new("tests.MailerToken"),
            RuntimeTypeId::of::<Mailer>(),
            &mut action
        ));
        let mailer = action.result.unwrap().unwrap().downcast::<Mailer>().unwrap();
        assert_eq!(mailer.sender, "billing@example.com");
    }

    #[test]
    fn test_builder_requires_registered_token_type() {
        #[derive(Deserialize)]
        struct Unregistered;
        let result = ScopedSurrogator::builder(resolver())
            .restorer(|_: Unregistered| Ok(Arc::new(Clock)))
            .build();
        assert!(matches!(result, Err(FlowError::UnknownType(_))));
    }

    #[test]
    fn test_grandchild_attaches_to_root() {
        let root = ScopedSurrogator::root(resolver());
        let child = Arc::new(ScopedSurrogator::child(&root));
        let grandchild = ScopedSurrogator::child(&child);
        let clock = Arc::new(Clock);
        child.map(&clock, &ClockToken).unwrap();

        assert!(!grandchild.is_root());
        assert!(surrogate_of(&grandchild, clock).is_none());
    }
}
