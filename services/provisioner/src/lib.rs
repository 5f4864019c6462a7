//! Instance group provisioner.
//!
//! Reconciles a declared EKS node group against the cloud, one tick at a
//! time. Each tick discovers the group's live resources, picks a
//! transition, and executes it idempotently:
//!
//! ```text
//! reconcile(input)
//! ├── cloud_discovery()     scaling group, launch configuration, role
//! ├── next_transition()     create | update | upgrade | delete | noop
//! └── execute               AwsWorker + aws-auth trust list
//! ```
//!
//! ## Modules
//!
//! - `aws`: Cloud client trait and records
//! - `kubernetes`: aws-auth trust list client and read-merge-write helpers
//! - `eks`: Reconciliation context and transitions
//! - `state_machine`: Transition selection
//! - `mock`: In-memory clients for tests and local runs

pub mod aws;
pub mod config;
pub mod eks;
pub mod error;
pub mod kubernetes;
pub mod logging;
pub mod mock;
pub mod state_machine;

mod provisioner;

pub use config::ProvisionerConfig;
pub use eks::{DiscoveredRole, DiscoveredState, EksInstanceGroupContext};
pub use error::{ProvisionerError, ProvisionerResult};
pub use provisioner::{reconcile, ProvisionerInput};
pub use state_machine::Transition;
