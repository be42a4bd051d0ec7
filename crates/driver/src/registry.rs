use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::Driver;

/// A freshly constructed driver, viewed both as a `Driver` and as `Any` for
/// typed lookups. Both point at the same allocation.
#[derive(Clone)]
pub(crate) struct Constructed {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

fn construct<T: Driver + Default>() -> Constructed {
    let instance = Arc::new(T::default());
    Constructed {
        driver: instance.clone(),
        any: instance,
    }
}

/// Registration of one implementation type under one logical name.
#[derive(Clone)]
pub struct DriverDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    name: String,
    construct: fn() -> Constructed,
}

impl DriverDescriptor {
    /// Logical name, also the key of the driver's configuration block.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the implementation type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) const fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn construct(&self) -> Constructed {
        (self.construct)()
    }
}

impl std::fmt::Debug for DriverDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverDescriptor")
            .field("type_name", &self.type_name)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Chooses which registered drivers to initialize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverSelector {
    /// Every registration of an implementation type.
    Type(TypeId, &'static str),

    /// The registration with this logical name.
    Name(String),
}

impl DriverSelector {
    /// Selects every registration of `T`.
    #[must_use]
    pub fn of<T: Driver>() -> Self {
        Self::Type(TypeId::of::<T>(), type_name::<T>())
    }

    /// Selects the registration named `name`.
    pub fn named<N: Into<String>>(name: N) -> Self {
        Self::Name(name.into())
    }

    fn matches(&self, descriptor: &DriverDescriptor) -> bool {
        match self {
            Self::Type(type_id, _) => *type_id == descriptor.type_id,
            Self::Name(name) => *name == descriptor.name,
        }
    }
}

/// Static mapping of logical driver names to implementation types, filled
/// once during bootstrap.
#[derive(Clone, Debug, Default)]
pub struct DriverRegistry {
    descriptors: Vec<DriverDescriptor>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name`.
    ///
    /// Registering the same type under the same name again is a no-op;
    /// distinct names may share one type.
    pub fn register<T: Driver + Default>(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        let type_id = TypeId::of::<T>();

        if !self
            .descriptors
            .iter()
            .any(|descriptor| descriptor.type_id == type_id && descriptor.name == name)
        {
            self.descriptors.push(DriverDescriptor {
                type_id,
                type_name: type_name::<T>(),
                name,
                construct: construct::<T>,
            });
        }

        self
    }

    /// All registrations, in registration order.
    #[must_use]
    pub fn descriptors(&self) -> &[DriverDescriptor] {
        &self.descriptors
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Resolves selectors to registrations, in registration order and without
    /// duplicates.
    ///
    /// # Errors
    ///
    /// Fails if any selector matches nothing.
    pub fn resolve(&self, selectors: &[DriverSelector]) -> Result<Vec<&DriverDescriptor>> {
        for selector in selectors {
            if !self.descriptors.iter().any(|d| selector.matches(d)) {
                return Err(match selector {
                    DriverSelector::Type(_, type_name) => Error::UnregisteredType(type_name),
                    DriverSelector::Name(name) => Error::UnknownDriver(name.clone()),
                });
            }
        }

        Ok(self
            .descriptors
            .iter()
            .filter(|descriptor| selectors.iter().any(|s| s.matches(descriptor)))
            .collect())
    }
}
