//! Keyed resource cache consulted on invalidation
//!
//! The connection manager never creates resources; it looks them up by cache
//! key (single-record resources first, then list resources) and asks them to
//! reload.

mod registry;
mod status;

pub use registry::{Resource, ResourceCache, ResourceRegistry};
pub use status::{StatusDoctype, StatusList};
