//! Two-tier zone routing
//!
//! - Intra-zone (proactive): every device floods periodic advertisements
//!   through its zone; receivers maintain a routing table of peers within
//!   `zone_radius` hops.
//! - Inter-zone (reactive): routes to devices outside the zone are
//!   discovered on demand by flooding a route request, harvested from
//!   the first acknowledgement, and cached with an expiry.

pub mod cache;
pub mod discovery;
pub mod table;

pub use cache::RouteCache;
pub use discovery::{route_is_valid, DedupWindow, DiscoveryEngine, PendingDiscovery};
pub use table::{RoutingTable, RoutingTableEntry};
