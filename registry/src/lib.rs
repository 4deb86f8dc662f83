//! Chain registry cache, route discovery, and the packet-forward planner.

pub mod cache;
pub mod client;
pub mod forward;
pub mod routes;

pub use cache::{RegistryCache, RegistrySnapshot};
pub use client::{RegistryClient, RegistrySource};
pub use forward::ForwardPlanner;
pub use routes::RouteDiscovery;
