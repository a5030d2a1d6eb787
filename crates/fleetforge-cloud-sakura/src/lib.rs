//! Sakura Cloud backend for FleetForge
//!
//! Implements [`CloudManager`](fleetforge_cloud::CloudManager) and
//! [`InstanceManager`](fleetforge_cloud::InstanceManager) on top of the
//! `usacloud` CLI. Masters and workers boot from kubeadm startup scripts
//! stored as Sakura Cloud notes.
//!
//! # Requirements
//!
//! - `usacloud` CLI must be installed
//! - Authentication comes from the cluster's credential
//!   (`access-token` / `access-token-secret`) or, without one, from the
//!   usacloud profile
//!
//! # Example
//!
//! ```ignore
//! use fleetforge_cloud::CloudRegistry;
//! use fleetforge_cloud_sakura::{PROVIDER_NAME, SakuraClusterManager};
//!
//! let registry = CloudRegistry::new().with(PROVIDER_NAME, SakuraClusterManager::factory());
//! ```

pub mod error;
pub mod provider;
pub mod startup_scripts;
pub mod usacloud;

pub use error::{Result, SakuraError};
pub use provider::{
    ACCESS_TOKEN_KEY, ACCESS_TOKEN_SECRET_KEY, PROVIDER_NAME, SakuraClusterManager,
    SakuraInstanceManager, SakuraMachineSpec,
};
pub use usacloud::{CreateServerConfig, NoteInfo, ServerApi, ServerInfo, SshKeyInfo, Usacloud};
