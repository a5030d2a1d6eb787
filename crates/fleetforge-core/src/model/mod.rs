//! Data model
//!
//! Records persisted through [`crate::store::Store`] and the node snapshot
//! read from live clusters.

mod cluster;
mod machine;
mod meta;
mod node;
mod secret;

pub use cluster::*;
pub use machine::*;
pub use meta::*;
pub use node::*;
pub use secret::*;
