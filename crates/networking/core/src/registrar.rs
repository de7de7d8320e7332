//! Creation and destruction of service handlers by service id.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use network_shared::ServiceId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::service::Service;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("service {0} is already registered")]
    Duplicate(ServiceId),
    #[error("service {0} is not registered")]
    Unknown(ServiceId),
    #[error("creator for service {0} declined to build a handler")]
    CreateFailed(ServiceId),
}

/// Source of service handlers for a controller.
///
/// The controller calls `create` at most once per service id before a matching
/// `destroy`, and always hands the instance it got back.
pub trait ServiceRegistrar: Send + Sync {
    fn is_registered(&self, id: ServiceId) -> bool;

    fn create(&self, id: ServiceId) -> Result<Box<dyn Service>, RegistryError>;

    fn destroy(&self, id: ServiceId, service: Box<dyn Service>);
}

type Creator = dyn Fn(ServiceId) -> Option<Box<dyn Service>> + Send + Sync;
type Deleter = dyn Fn(ServiceId, Box<dyn Service>) + Send + Sync;

struct Registration {
    name: String,
    creator: Box<Creator>,
    deleter: Option<Box<Deleter>>,
}

/// Registrar backed by creator/deleter closures, shareable between controllers.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<ServiceId, Arc<Registration>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a creator; handlers are dropped on destroy.
    pub fn register<C>(&self, id: ServiceId, name: impl Into<String>, creator: C) -> Result<(), RegistryError>
    where
        C: Fn(ServiceId) -> Option<Box<dyn Service>> + Send + Sync + 'static,
    {
        self.insert(id, name.into(), Box::new(creator), None)
    }

    pub fn register_with_deleter<C, D>(
        &self,
        id: ServiceId,
        name: impl Into<String>,
        creator: C,
        deleter: D,
    ) -> Result<(), RegistryError>
    where
        C: Fn(ServiceId) -> Option<Box<dyn Service>> + Send + Sync + 'static,
        D: Fn(ServiceId, Box<dyn Service>) + Send + Sync + 'static,
    {
        self.insert(id, name.into(), Box::new(creator), Some(Box::new(deleter)))
    }

    fn insert(
        &self,
        id: ServiceId,
        name: String,
        creator: Box<Creator>,
        deleter: Option<Box<Deleter>>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        debug!(target: "net::registry", "registered {id} as {name:?}");
        entries.insert(
            id,
            Arc::new(Registration {
                name,
                creator,
                deleter,
            }),
        );
        Ok(())
    }

    pub fn unregister(&self, id: ServiceId) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(target: "net::registry", "unregistered {id}");
        }
        removed
    }

    pub fn unregister_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        debug!(target: "net::registry", "unregistering {} services", entries.len());
        entries.clear();
    }

    pub fn name_of(&self, id: ServiceId) -> Option<String> {
        self.lookup(id).map(|r| r.name.clone())
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, id: ServiceId) -> Option<Arc<Registration>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl ServiceRegistrar for ServiceRegistry {
    fn is_registered(&self, id: ServiceId) -> bool {
        self.lookup(id).is_some()
    }

    fn create(&self, id: ServiceId) -> Result<Box<dyn Service>, RegistryError> {
        // Creators run without the lock held so they may query the registry.
        let registration = self.lookup(id).ok_or(RegistryError::Unknown(id))?;
        (registration.creator)(id).ok_or(RegistryError::CreateFailed(id))
    }

    fn destroy(&self, id: ServiceId, service: Box<dyn Service>) {
        match self.lookup(id) {
            Some(registration) => match &registration.deleter {
                Some(deleter) => deleter(id, service),
                None => drop(service),
            },
            None => {
                warn!(target: "net::registry", "destroying handler of unregistered {id}");
                drop(service);
            }
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.ids())
            .finish()
    }
}
