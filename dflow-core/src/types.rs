//! Stable type identity across process restarts.
//!
//! `std::any::TypeId` is only meaningful inside one build of one process, so
//! anything persisted names its type through a [`TypeId`] registered in a
//! [`TypeResolver`] instead. Both the writing and the reading process must
//! build the same resolver from code.

use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use std::any::TypeId as RuntimeTypeId;
use std::collections::HashMap;
use std::fmt;

pub use dflow_macros::TypeKey;

/// Persistable identifier of a registered type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(String);

impl TypeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TypeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A type that declares its own persistable key.
///
/// Usually derived: `#[derive(TypeKey)]` uses the type's name, and
/// `#[type_key = "orders.Approve"]` overrides it.
pub trait TypeKey: 'static {
    const TYPE_KEY: &'static str;
}

#[derive(Debug, Clone)]
struct Registration {
    runtime: RuntimeTypeId,
    name: &'static str,
}

/// Bijective map between runtime types and their persisted [`TypeId`]s.
#[derive(Debug, Clone, Default)]
pub struct TypeResolver {
    by_runtime: HashMap<RuntimeTypeId, TypeId>,
    by_id: HashMap<TypeId, Registration>,
}

impl TypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `id`.
    ///
    /// Registering the same pair twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::DuplicateType`] when either `T` or `id` is
    /// already bound to something else.
    pub fn register<T: 'static>(&mut self, id: impl Into<TypeId>) -> Result<(), FlowError> {
        let id = id.into();
        let runtime = RuntimeTypeId::of::<T>();
        let name = std::any::type_name::<T>();

        match (self.by_runtime.get(&runtime), self.by_id.get(&id)) {
            (Some(existing), Some(_)) if *existing == id => return Ok(()),
            (Some(existing), _) => {
                return Err(FlowError::DuplicateType(format!(
                    "{} is already registered as '{}'",
                    name, existing
                )));
            }
            (None, Some(other)) => {
                return Err(FlowError::DuplicateType(format!(
                    "'{}' is already bound to {}",
                    id, other.name
                )));
            }
            (None, None) => {}
        }

        self.by_runtime.insert(runtime, id.clone());
        self.by_id.insert(id, Registration { runtime, name });
        Ok(())
    }

    /// Register `T` under its declared [`TypeKey::TYPE_KEY`].
    pub fn register_keyed<T: TypeKey>(&mut self) -> Result<(), FlowError> {
        self.register::<T>(T::TYPE_KEY)
    }

    /// Look up the persisted id of a runtime type.
    pub fn get_type_id(&self, runtime: RuntimeTypeId) -> Result<&TypeId, FlowError> {
        self.by_runtime
            .get(&runtime)
            .ok_or_else(|| FlowError::UnknownType(format!("{:?}", runtime)))
    }

    /// Look up the persisted id of `T`, naming `T` in the error.
    pub fn type_id_of<T: 'static>(&self) -> Result<&TypeId, FlowError> {
        self.by_runtime
            .get(&RuntimeTypeId::of::<T>())
            .ok_or_else(|| FlowError::UnknownType(std::any::type_name::<T>().to_string()))
    }

    /// Look up the runtime type registered under `id`.
    pub fn get_type(&self, id: &TypeId) -> Result<RuntimeTypeId, FlowError> {
        self.by_id
            .get(id)
            .map(|registration| registration.runtime)
            .ok_or_else(|| FlowError::UnknownType(id.to_string()))
    }

    pub fn contains(&self, id: &TypeId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Invoice;
    struct Receipt;

    #[test]
    fn test_lookup_both_directions() {
        let mut resolver = TypeResolver::new();
        resolver.register::<Invoice>("billing.Invoice").unwrap();

        let id = resolver.type_id_of::<Invoice>().unwrap().clone();
        assert_eq!(id.as_str(), "billing.Invoice");
        assert_eq!(
            resolver.get_type(&id).unwrap(),
            RuntimeTypeId::of::<Invoice>()
        );
        assert_eq!(
            resolver.get_type_id(RuntimeTypeId::of::<Invoice>()).unwrap(),
            &id
        );
    }

    #[test]
    fn test_unknown_lookups_fail() {
        let resolver = TypeResolver::new();
        assert!(matches!(
            resolver.type_id_of::<Receipt>(),
            Err(FlowError::UnknownType(name)) if name.contains("Receipt")
        ));
        assert!(matches!(
            resolver.get_type(&TypeId::new("nope")),
            Err(FlowError::UnknownType(_))
        ));
    }

    #[test]
    fn test_registration_is_bijective() {
        let mut resolver = TypeResolver::new();
        resolver.register::<Invoice>("a").unwrap();
        resolver.register::<Invoice>("a").unwrap();
        assert!(matches!(
            resolver.register::<Invoice>("b"),
            Err(FlowError::DuplicateType(_))
        ));
        assert!(matches!(
            resolver.register::<Receipt>("a"),
            Err(FlowError::DuplicateType(_))
        ));
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_keyed_registration() {
        struct Keyed;
        impl TypeKey for Keyed {
            const TYPE_KEY: &'static str = "tests.Keyed";
        }

        let mut resolver = TypeResolver::new();
        resolver.register_keyed::<Keyed>().unwrap();
        assert!(resolver.contains(&TypeId::new("tests.Keyed")));
    }
}
