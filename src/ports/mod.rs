//! Capabilities the dispatch core consumes. Implementations are injected at construction
//! time; nothing in the core reaches for a global store or cache.

pub mod cache;
pub mod notify;
pub mod routing;
pub mod store;

pub use cache::Cache;
pub use notify::Notifier;
pub use routing::{RouteEstimate, RouteProvider};
pub use store::{Conditional, DriverQuery, DurableStore, RideFilter};
