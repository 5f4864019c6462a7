//! Provisioner error types.
//!
//! Every failure is wrapped with a short description of the step that
//! failed; the underlying cause stays reachable through `source()`.

use thiserror::Error;

use crate::aws::AwsError;
use crate::kubernetes::KubeError;

/// Result type for provisioner operations.
pub type ProvisionerResult<T> = Result<T, ProvisionerError>;

/// Errors surfaced to the driver from a reconciliation tick.
#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// Cloud discovery failed for a reason other than not-found.
    #[error("{context}: {source}")]
    Discovery {
        context: &'static str,
        #[source]
        source: AwsError,
    },

    /// A cloud create/update/delete call failed.
    #[error("{context}: {source}")]
    Aws {
        context: &'static str,
        #[source]
        source: AwsError,
    },

    /// Reading or writing the aws-auth trust list failed.
    #[error("{context}: {source}")]
    AuthMap {
        context: &'static str,
        #[source]
        source: KubeError,
    },

    /// The instance group cannot be reconciled as configured.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No provisioner handles this instance group.
    #[error("unsupported provisioner: {0}")]
    UnsupportedProvisioner(String),
}

impl ProvisionerError {
    pub fn discovery(context: &'static str, source: AwsError) -> Self {
        Self::Discovery { context, source }
    }

    pub fn aws(context: &'static str, source: AwsError) -> Self {
        Self::Aws { context, source }
    }

    pub fn auth_map(context: &'static str, source: KubeError) -> Self {
        Self::AuthMap { context, source }
    }

    /// The static step description, when the error wraps a client failure.
    pub fn context(&self) -> Option<&'static str> {
        match self {
            Self::Discovery { context, .. }
            | Self::Aws { context, .. }
            | Self::AuthMap { context, .. } => Some(*context),
            Self::Config(_) | Self::UnsupportedProvisioner(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_wrapped_error_keeps_cause() {
        let err = ProvisionerError::aws(
            "failed to delete scaling group",
            AwsError::Api {
                code: "ScalingActivityInProgress".to_string(),
                message: "activity in progress".to_string(),
            },
        );

        assert_eq!(err.context(), Some("failed to delete scaling group"));
        assert!(err.to_string().starts_with("failed to delete scaling group: "));
        assert!(err.source().unwrap().to_string().contains("ScalingActivityInProgress"));
    }

    #[test]
    fn test_config_error_has_no_context() {
        let err = ProvisionerError::Config("existing role shared-role not found".to_string());
        assert_eq!(err.context(), None);
        assert_eq!(
            err.to_string(),
            "invalid configuration: existing role shared-role not found"
        );
    }
}
