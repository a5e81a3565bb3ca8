// Inter-zone route cache — reactive, expiring

use crate::identity::DeviceId;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct CachedRoute {
    route: Vec<DeviceId>,
    expires_at: u64,
}

/// Discovered multi-zone routes, keyed by final destination.
pub struct RouteCache {
    routes: HashMap<DeviceId, CachedRoute>,
    lifetime_ms: u64,
}

impl RouteCache {
    pub fn new(lifetime_ms: u64) -> Self {
        Self {
            routes: HashMap::new(),
            lifetime_ms,
        }
    }

    /// Store a route, overwriting any existing route to the same
    /// destination. Routes shorter than two waypoints are meaningless
    /// and ignored.
    pub fn store(&mut self, route: Vec<DeviceId>, now: u64) {
        if route.len() < 2 {
            return;
        }
        let destination = *route.last().expect("non-empty route");
        self.routes.insert(
            destination,
            CachedRoute {
                route,
                expires_at: now + self.lifetime_ms,
            },
        );
    }

    pub fn lookup(&self, destination: &DeviceId, now: u64) -> Option<&[DeviceId]> {
        self.routes
            .get(destination)
            .filter(|cached| cached.expires_at > now)
            .map(|cached| cached.route.as_slice())
    }

    pub fn invalidate(&mut self, destination: &DeviceId) {
        self.routes.remove(destination);
    }

    /// Drop every route that travels through `hop`
    pub fn invalidate_via(&mut self, hop: &DeviceId) {
        self.routes.retain(|_, cached| !cached.route.contains(hop));
    }

    pub fn sweep(&mut self, now: u64) {
        self.routes.retain(|_, cached| cached.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
