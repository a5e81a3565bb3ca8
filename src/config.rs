// Tunables — threaded through construction, never read from globals

/// Routing and dispatch parameters.
///
/// The zone radius is inclusive of both endpoints: a chain
/// `A -> x -> y -> B` spans a radius of 4. Route length is measured in
/// zone waypoints, so the worst-case physical hop count of a cached
/// route is `max_route_length * zone_radius`.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Maximum hop count for intra-zone routing entries
    pub zone_radius: u8,
    /// Maximum number of waypoints in a discovered route
    pub max_route_length: usize,
    /// Interval between neighbor advertisements (ms)
    pub advert_interval_ms: u64,
    /// Lifetime of a routing table entry after its last refresh (ms)
    pub advert_lifetime_ms: u64,
    /// Lifetime of a cached inter-zone route (ms)
    pub route_lifetime_ms: u64,
    /// How long a route discovery may stay unanswered (ms)
    pub discovery_timeout_ms: u64,
    /// Capacity of the request-id deduplication window
    pub dedup_window: usize,
    /// Maximum payloads parked per destination while a route is discovered
    pub max_parked_payloads: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            zone_radius: 4,
            max_route_length: 20,
            advert_interval_ms: 5_000,
            advert_lifetime_ms: 30_000,
            route_lifetime_ms: 60_000,
            discovery_timeout_ms: 10_000,
            dedup_window: 256,
            max_parked_payloads: 16,
        }
    }
}

/// Registry replication parameters.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between head announcements (ms)
    pub announce_interval_ms: u64,
    /// How long a sync session may sit without progress before it resets (ms)
    pub sync_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            announce_interval_ms: 5_000,
            sync_timeout_ms: 10_000,
        }
    }
}
