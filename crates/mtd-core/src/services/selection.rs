use std::sync::Mutex;

use rand::seq::SliceRandom;

use crate::models::{SelectionKind, ServiceId};

use super::registry::ServiceRegistry;

/// Picks the one service to migrate this cycle.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, registry: &ServiceRegistry) -> Option<ServiceId>;
}

/// Lowest eligible id. Deterministic, so tests and dry runs are repeatable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstEligible;

impl SelectionStrategy for FirstEligible {
    fn select(&self, registry: &ServiceRegistry) -> Option<ServiceId> {
        registry.eligible().iter().map(|s| s.id).min()
    }
}

/// Eligible services in id order, resuming after the one picked last and
/// wrapping around. A service that keeps failing cannot starve the others.
#[derive(Debug, Default)]
pub struct RoundRobinEligible {
    last: Mutex<Option<ServiceId>>,
}

impl SelectionStrategy for RoundRobinEligible {
    fn select(&self, registry: &ServiceRegistry) -> Option<ServiceId> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<ServiceId> = registry.eligible().iter().map(|s| s.id).collect();
        let previous = *last;
        let after_last = previous.and_then(|prev| ids.iter().copied().filter(|id| *id > prev).min());
        let next = after_last.or_else(|| ids.iter().copied().min())?;
        *last = Some(next);
        Some(next)
    }
}

/// Uniformly random eligible service.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomEligible;

impl SelectionStrategy for RandomEligible {
    fn select(&self, registry: &ServiceRegistry) -> Option<ServiceId> {
        let ids: Vec<ServiceId> = registry.eligible().iter().map(|s| s.id).collect();
        ids.choose(&mut rand::thread_rng()).copied()
    }
}

pub fn strategy_for(kind: SelectionKind) -> Box<dyn SelectionStrategy> {
    match kind {
        SelectionKind::RoundRobin => Box::new(RoundRobinEligible::default()),
        SelectionKind::First => Box::new(FirstEligible),
        SelectionKind::Random => Box::new(RandomEligible),
    }
}
