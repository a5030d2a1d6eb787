//! FleetForge core
//!
//! Cluster records, their lifecycle phases and the store they live in.
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │    model     │──►│     store     │──►│   backends   │
//! │ Cluster      │   │ Store (typed) │   │ MemoryStore  │
//! │ Machine      │   │ create/update │   │ FileStore    │
//! │ NodeGroup    │   │ update_status │   └──────────────┘
//! └──────────────┘   └───────────────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │   version    │  KubeVersion / is_patch
//! └──────────────┘
//! ```

pub mod error;
pub mod model;
pub mod store;
pub mod version;

pub use error::{CoreError, Result};
pub use model::*;
pub use store::{FileStore, MemoryStore, Resource, ResourceKind, StateLock, Store, StoreBackend};
pub use version::{KubeVersion, is_patch};
