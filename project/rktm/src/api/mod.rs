pub mod memstore;
pub mod registry;
pub mod store;
pub mod xlinestore;

pub use memstore::MemoryStore;
pub use registry::{Registry, Versioned};
pub use store::{ClusterStore, KeyValue};
pub use xlinestore::XlineStore;
