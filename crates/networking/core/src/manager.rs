//! `NetCore` keeps every running controller of a process together with the
//! service registry and transport factory they share.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use network_shared::{Config, IdGenerator, TrackId, TransportError, TransportFactory};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::{Controller, ControllerHandle, ControllerOptions};
use crate::error::{ControllerError, ControllerResult};
use crate::registrar::ServiceRegistry;

#[derive(Debug)]
struct Tracked {
    handle: ControllerHandle,
    task: JoinHandle<()>,
}

pub struct NetCore {
    registry: Arc<ServiceRegistry>,
    factory: Arc<dyn TransportFactory>,
    options: ControllerOptions,
    ids: IdGenerator,
    controllers: HashMap<TrackId, Tracked>,
    /// Run loops of destroyed controllers that may still be draining.
    retired: Vec<JoinHandle<()>>,
}

impl NetCore {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_options(factory, ControllerOptions::default())
    }

    pub fn with_options(factory: Arc<dyn TransportFactory>, options: ControllerOptions) -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::new()),
            factory,
            options,
            ids: IdGenerator::default(),
            controllers: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Applies `config` to a fresh controller, starts it and spawns its run
    /// loop on the current tokio runtime.
    pub fn create_controller(&mut self, config: Config) -> ControllerResult<TrackId> {
        let runtime = Handle::try_current()
            .map_err(|_| TransportError::NotReady("no tokio runtime"))?;

        let mut controller = Controller::with_options(
            self.registry.clone(),
            Arc::clone(&self.factory),
            self.options.clone(),
        );
        controller.apply_config(config)?;
        controller.start()?;

        let id = TrackId::new(self.ids.next());
        let handle = controller.handle();
        let task = runtime.spawn(controller.run());
        info!(target: "net::core", "created {id}");
        self.controllers.insert(id, Tracked { handle, task });
        Ok(id)
    }

    pub fn controller(&self, id: TrackId) -> Option<&ControllerHandle> {
        self.controllers.get(&id).map(|t| &t.handle)
    }

    pub fn controller_ids(&self) -> Vec<TrackId> {
        let mut ids: Vec<_> = self.controllers.keys().copied().collect();
        ids.sort_by_key(|id| id.get());
        ids
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Run loops of destroyed controllers that were still draining when last
    /// checked.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Stops a controller without waiting for it to drain.
    pub fn destroy_controller(&mut self, id: TrackId) -> ControllerResult<()> {
        let tracked = self
            .controllers
            .remove(&id)
            .ok_or(ControllerError::UnknownController(id))?;
        info!(target: "net::core", "destroying {id}");
        if !tracked.handle.is_stop_requested() {
            tracked.handle.stop(move || debug!(target: "net::core", "{id} stopped"))?;
        }
        self.retired.retain(|task| !task.is_finished());
        self.retired.push(tracked.task);
        Ok(())
    }

    pub fn destroy_all_controllers(&mut self) {
        for id in self.controller_ids() {
            if let Err(err) = self.destroy_controller(id) {
                warn!(target: "net::core", "destroying {id} failed: {err}");
            }
        }
    }

    /// Stops every controller and waits until each stop handler fired and
    /// every run loop exited.
    pub async fn destroy_all_controllers_blocked(&mut self) {
        let ids = self.controller_ids();
        info!(target: "net::core", "destroying {} controllers", ids.len());
        for id in ids {
            let Some(tracked) = self.controllers.remove(&id) else {
                continue;
            };
            if !tracked.handle.is_stop_requested() {
                if let Err(err) = tracked.handle.stop_and_wait().await {
                    warn!(target: "net::core", "stopping {id} failed: {err}");
                }
            }
            self.retired.push(tracked.task);
        }
        for task in self.retired.drain(..) {
            if let Err(err) = task.await {
                warn!(target: "net::core", "controller task failed: {err}");
            }
        }
    }

    pub fn restart_all_controllers(&self) {
        for (id, tracked) in &self.controllers {
            if let Err(err) = tracked.handle.restart() {
                warn!(target: "net::core", "restarting {id} failed: {err}");
            }
        }
    }

    /// Removes every registration. Running controllers keep the handlers they
    /// already created.
    pub fn unregister_all_services(&self) {
        self.registry.unregister_all();
    }
}

impl fmt::Debug for NetCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetCore")
            .field("registry", &self.registry)
            .field("controllers", &self.controller_ids())
            .field("retired", &self.retired.len())
            .finish_non_exhaustive()
    }
}
