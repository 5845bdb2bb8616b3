//! In-process implementations of the consumed ports. The binary and the test suites run
//! on these; a deployment swaps in document-store, cache and push-provider adapters.

pub mod memory_cache;
pub mod memory_store;
pub mod notifier;
pub mod routing;

pub use memory_cache::MemoryCache;
pub use memory_store::MemoryStore;
pub use notifier::{BroadcastNotifier, QueuedNotifier};
pub use routing::StraightLineRouter;
