//! Descriptor registry for resumable activations.
//!
//! The registry maps each activation type to a factory that rebuilds it from
//! a captured frame. Together with the [`TypeResolver`] it is what lets a
//! process resume a flow it did not start.
//!
//! # Registry as Code, Not Data
//!
//! The registry contains closures and cannot be serialized itself. Every
//! process that may resume a flow must build the same registry from code:
//!
//! ```rust,ignore
//! fn catalog() -> Result<(TypeResolver, DescriptorRegistry), FlowError> {
//!     DescriptorRegistry::builder()
//!         .operation::<ApproveOrder>("orders.Approve")
//!         .operation::<ShipOrder>("orders.Ship")
//!         .surrogate::<WarehouseToken>("orders.WarehouseToken")
//!         .build()
//! }
//! ```

use crate::continuation::{Reconstruct, Reconstructor, Resumable};
use crate::error::FlowError;
use crate::types::{TypeId, TypeKey, TypeResolver};
use std::any::TypeId as RuntimeTypeId;
use std::collections::HashMap;

/// A factory that rebuilds a type-erased activation.
pub type ReconstructFn =
    Box<dyn Fn(&Reconstructor<'_>) -> Result<Box<dyn Resumable>, FlowError> + Send + Sync>;

/// Everything the engine needs to rebuild one activation type.
pub struct ContinuationDescriptor {
    type_name: &'static str,
    reconstruct: ReconstructFn,
}

impl ContinuationDescriptor {
    pub fn of<T: Reconstruct>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            reconstruct: Box::new(
                |r: &Reconstructor<'_>| -> Result<Box<dyn Resumable>, FlowError> {
                    Ok(Box::new(T::reconstruct(r)?))
                },
            ),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn reconstruct(&self, r: &Reconstructor<'_>) -> Result<Box<dyn Resumable>, FlowError> {
        (self.reconstruct)(r)
    }
}

/// Registry of [`ContinuationDescriptor`]s keyed by runtime type.
#[derive(Default)]
pub struct DescriptorRegistry {
    descriptors: HashMap<RuntimeTypeId, ContinuationDescriptor>,
}

impl DescriptorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `T`. Re-registering replaces it.
    pub fn register<T: Reconstruct>(&mut self) {
        self.descriptors
            .insert(RuntimeTypeId::of::<T>(), ContinuationDescriptor::of::<T>());
    }

    pub fn get(&self, runtime: RuntimeTypeId) -> Option<&ContinuationDescriptor> {
        self.descriptors.get(&runtime)
    }

    /// Rebuild an activation of the given runtime type.
    ///
    /// # Errors
    ///
    /// [`FlowError::UnknownType`] when no factory is registered.
    pub fn reconstruct(
        &self,
        runtime: RuntimeTypeId,
        r: &Reconstructor<'_>,
    ) -> Result<Box<dyn Resumable>, FlowError> {
        let descriptor = self
            .get(runtime)
            .ok_or_else(|| FlowError::UnknownType(format!("no descriptor for {:?}", runtime)))?;
        descriptor.reconstruct(r)
    }

    /// Check if `T` is registered.
    pub fn contains<T: 'static>(&self) -> bool {
        self.descriptors.contains_key(&RuntimeTypeId::of::<T>())
    }

    /// Get the number of registered types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Get an iterator over registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.values().map(|d| d.type_name)
    }

    /// Create a builder that fills a registry and a resolver together.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            resolver: TypeResolver::new(),
            registry: DescriptorRegistry::new(),
            error: None,
        }
    }
}

/// Builder for a matching [`TypeResolver`] and [`DescriptorRegistry`].
///
/// Created via [`DescriptorRegistry::builder`]. The first registration error
/// is kept and returned from [`build`](Self::build).
pub struct RegistryBuilder {
    resolver: TypeResolver,
    registry: DescriptorRegistry,
    error: Option<FlowError>,
}

impl RegistryBuilder {
    fn record(&mut self, result: Result<(), FlowError>) {
        if let Err(e) = result
            && self.error.is_none()
        {
            self.error = Some(e);
        }
    }

    /// Register an activation type under `id`.
    #[must_use]
    pub fn operation<T: Reconstruct>(mut self, id: impl Into<TypeId>) -> Self {
        let result = self.resolver.register::<T>(id);
        self.record(result);
        self.registry.register::<T>();
        self
    }

    /// Register an activation type under its declared key.
    #[must_use]
    pub fn keyed_operation<T: Reconstruct + TypeKey>(self) -> Self {
        self.operation::<T>(T::TYPE_KEY)
    }

    /// Register a surrogate token type under `id`.
    #[must_use]
    pub fn surrogate<S: 'static>(mut self, id: impl Into<TypeId>) -> Self {
        let result = self.resolver.register::<S>(id);
        self.record(result);
        self
    }

    /// Register a surrogate token type under its declared key.
    #[must_use]
    pub fn keyed_surrogate<S: TypeKey>(self) -> Self {
        self.surrogate::<S>(S::TYPE_KEY)
    }

    pub fn build(self) -> Result<(TypeResolver, DescriptorRegistry), FlowError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.resolver, self.registry)),
        }
    }
}
