use super::{Method, Service, ServiceId, ServiceInfo, ServiceMap};
use crate::{Error, Result};
use futures::future::join_all;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Owner of every live [`Service`]
///
/// Lookups return snapshots; the live handles stay inside the crate.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<ServiceMap>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> Weak<ServiceMap> {
        Arc::downgrade(&self.services)
    }

    /// Add a service. Re-registering the same id is a no-op.
    pub fn register(&self, service: &Service) {
        let mut services = self.services.write();
        if services.contains_key(service.id()) {
            return;
        }
        debug!("registered service {} ({})", service.id(), service.name());
        services.insert(service.id().clone(), service.clone());
    }

    /// Remove a service by id, stopping it first when it is still running.
    pub fn remove(&self, id: &ServiceId) -> Result<()> {
        let service = self
            .handle(id)
            .ok_or_else(|| Error::internal(format!("service {} is not registered", id)))?;
        service.remove()
    }

    pub(crate) fn handle(&self, id: &ServiceId) -> Option<Service> {
        self.services.read().get(id).cloned()
    }

    pub fn service(&self, id: &ServiceId) -> Option<ServiceInfo> {
        self.handle(id).map(|s| s.info())
    }

    pub fn all_services(&self) -> Vec<ServiceInfo> {
        let mut all: Vec<ServiceInfo> = self.handles().iter().map(|s| s.info()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn all_methods(&self) -> Vec<Method> {
        self.all_services()
            .into_iter()
            .flat_map(|info| info.methods)
            .collect()
    }

    pub fn method(&self, id: &str) -> Option<Method> {
        self.all_methods().into_iter().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    fn handles(&self) -> Vec<Service> {
        self.services.read().values().cloned().collect()
    }

    /// Stop every service and wait until all of them have exited.
    pub async fn stop_all(&self) {
        let services = self.handles();
        if services.is_empty() {
            return;
        }
        info!("stopping {} service(s)", services.len());
        for service in &services {
            service.stop();
        }
        join_all(services.iter().map(|s| s.wait())).await;
    }
}
