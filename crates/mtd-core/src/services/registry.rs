use std::collections::BTreeMap;

use crate::models::{Service, ServiceId};

/// Tracked services keyed by their stable id.
///
/// Iteration order is an implementation detail; callers that need a
/// particular service pick it through a `SelectionStrategy` or by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceId, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the persisted list. A repeated id keeps the last entry.
    pub fn from_services(services: Vec<Service>) -> Self {
        let mut registry = Self::new();
        for service in services {
            if let Some(previous) = registry.upsert(service) {
                tracing::warn!(service = %previous.id, "duplicate service id in document, keeping last entry");
            }
        }
        registry
    }

    pub fn list(&self) -> Vec<&Service> {
        self.services.values().collect()
    }

    pub fn to_services(&self) -> Vec<Service> {
        self.services.values().cloned().collect()
    }

    pub fn get(&self, id: &ServiceId) -> Option<&Service> {
        self.services.get(id)
    }

    /// Insert or replace by id, returning the replaced entry.
    pub fn upsert(&mut self, service: Service) -> Option<Service> {
        self.services.insert(service.id, service)
    }

    pub fn find_by_cloud_id(&self, cloud_id: &str) -> Vec<&Service> {
        self.services
            .values()
            .filter(|s| s.cloud_id == cloud_id)
            .collect()
    }

    pub fn eligible(&self) -> Vec<&Service> {
        self.services.values().filter(|s| s.is_eligible()).collect()
    }

    pub fn set_active(&mut self, id: &ServiceId, active: bool) -> bool {
        match self.services.get_mut(id) {
            Some(service) => {
                service.active = active;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_inactive(&mut self) {
        for service in self.services.values_mut() {
            service.active = false;
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
