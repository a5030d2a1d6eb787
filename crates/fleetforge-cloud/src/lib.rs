//! FleetForge reconciliation engine
//!
//! Drives Kubernetes clusters from their stored desired state to running
//! infrastructure, independent of the cloud that runs the instances.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   forge CLI                      │
//! │         (apply / create / delete / edit)         │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               fleetforge-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │        ClusterApplier (phase FSM)         │   │
//! │  └──────┬──────────────┬────────────────────┘   │
//! │  ┌──────▼───────┐ ┌────▼──────────┐ ┌────────┐  │
//! │  │ NodeGroupMgr │ │ UpgradeManager│ │ certs  │  │
//! │  │   + drain    │ │   (ssh)       │ │ tokens │  │
//! │  └──────────────┘ └───────────────┘ └────────┘  │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait CloudManager / InstanceManager     │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼───────┐
//! │ sakura-cloud  │
//! │   provider    │
//! └───────────────┘
//! ```

pub mod action;
pub mod apply;
pub mod certs;
pub mod drain;
pub mod error;
pub mod kube;
pub mod kube_rs;
pub mod lifecycle;
pub mod node_group;
pub mod provider;
pub mod registry;
pub mod remote;
pub mod token;
pub mod upgrade;
pub mod wait;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use action::{Action, ActionType, PlanSummary};
pub use apply::{ApplyOptions, ClusterApplier, EngineSettings};
pub use certs::Certificates;
pub use drain::{DrainReport, NodeDrainer};
pub use error::{CloudError, Result, ResultExt};
pub use kube::{KubeClient, KubeConnector, KubeEndpoint};
pub use kube_rs::KubeRsConnector;
pub use lifecycle::{ClusterLifecycle, NewCluster, NewNodeGroup};
pub use node_group::NodeGroupManager;
pub use provider::{AdminClientCache, CloudManager, InstanceManager, NodeInfo, ProviderContext};
pub use registry::CloudRegistry;
pub use remote::{RemoteExecutor, SshConfig, SshExecutor};
pub use token::TokenConfig;
pub use upgrade::UpgradeManager;
pub use wait::PollConfig;
