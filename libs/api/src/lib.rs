//! # igm-api
//!
//! Resource types for the instance group manager.
//!
//! An `InstanceGroup` declares one managed node group. It is owned by the
//! controller driving reconciliation: provisioners read its spec and write
//! its status, most importantly the lifecycle [`ReconcileState`].

mod error;
mod state;
mod types;

pub use error::ApiError;
pub use state::ReconcileState;
pub use types::*;
