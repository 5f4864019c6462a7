//! Cluster trust-list (aws-auth) access.
//!
//! The aws-auth document maps IAM role ARNs to cluster identities. It is a
//! single document shared by every instance group in the cluster, so all
//! mutation is read-merge-write against the current content and retried
//! when the write loses an optimistic-concurrency race.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn, Span};

/// Name of the trust-list config map.
pub const AUTH_MAP_NAME: &str = "aws-auth";

/// Namespace of the trust-list config map.
pub const AUTH_MAP_NAMESPACE: &str = "kube-system";

/// Username template for node roles.
pub const NODE_USERNAME: &str = "system:node:{{EC2PrivateDNSName}}";

/// Groups granted to node roles.
pub const NODE_GROUPS: [&str; 2] = ["system:bootstrappers", "system:nodes"];

/// Errors from the trust-list client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KubeError {
    /// The write was based on a stale resource version.
    #[error("conflict updating kube-system/aws-auth: {0}")]
    Conflict(String),

    /// The document content could not be parsed.
    #[error("malformed aws-auth document: {0}")]
    Malformed(String),

    /// Any other API failure.
    #[error("kubernetes api error: {0}")]
    Api(String),
}

/// One `mapRoles` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMapping {
    #[serde(rename = "rolearn")]
    pub role_arn: String,
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl RoleMapping {
    /// Mapping that lets instances of a node role join the cluster.
    pub fn node(role_arn: impl Into<String>) -> Self {
        Self {
            role_arn: role_arn.into(),
            username: NODE_USERNAME.to_string(),
            groups: NODE_GROUPS.iter().map(|g| g.to_string()).collect(),
        }
    }
}

/// Snapshot of the aws-auth document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfigMap {
    /// `None` when the document does not exist yet.
    pub resource_version: Option<String>,
    pub map_roles: Vec<RoleMapping>,
}

/// Low-level access to the aws-auth document.
#[async_trait]
pub trait AuthMapClient: Send + Sync {
    /// Read the current document; an absent document reads as empty.
    async fn get_auth_map(&self) -> Result<AuthConfigMap, KubeError>;

    /// Write the document, failing with [`KubeError::Conflict`] if
    /// `resource_version` is no longer current.
    async fn replace_auth_map(&self, auth_map: &AuthConfigMap) -> Result<(), KubeError>;
}

/// Conflict retry parameters for read-merge-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Add or replace role mappings, keyed by role ARN.
pub async fn upsert_auth_config_map(
    client: &dyn AuthMapClient,
    mappings: &[RoleMapping],
    policy: &RetryPolicy,
    span: &Span,
) -> Result<(), KubeError> {
    if mappings.is_empty() {
        return Ok(());
    }

    read_merge_write(client, policy, span, |current| {
        let merged = igm_common::merge_slice_by_key(
            current.to_vec(),
            mappings.to_vec(),
            |m| m.role_arn.as_str(),
            true,
        );
        (merged.as_slice() != current).then_some(merged)
    })
    .await
}

/// Remove the mappings of `role_arns`. Absent ARNs are ignored.
pub async fn remove_auth_config_map(
    client: &dyn AuthMapClient,
    role_arns: &[String],
    policy: &RetryPolicy,
    span: &Span,
) -> Result<(), KubeError> {
    let role_arns: Vec<&str> = role_arns
        .iter()
        .map(String::as_str)
        .filter(|arn| !arn.is_empty())
        .collect();
    if role_arns.is_empty() {
        return Ok(());
    }

    read_merge_write(client, policy, span, |current| {
        let kept: Vec<RoleMapping> = current
            .iter()
            .filter(|m| !igm_common::contains_equal_fold(&role_arns, &m.role_arn))
            .cloned()
            .collect();
        (kept.len() != current.len()).then_some(kept)
    })
    .await
}

/// Apply `mutate` to the current mappings and write the result.
///
/// `mutate` returns `None` when no change is needed, in which case nothing
/// is written. Events are emitted under `span`.
async fn read_merge_write<F>(
    client: &dyn AuthMapClient,
    policy: &RetryPolicy,
    span: &Span,
    mutate: F,
) -> Result<(), KubeError>
where
    F: Fn(&[RoleMapping]) -> Option<Vec<RoleMapping>> + Send + Sync,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let current = client.get_auth_map().await?;
        let Some(map_roles) = mutate(&current.map_roles) else {
            debug!(parent: span, attempt, "aws-auth already up to date");
            return Ok(());
        };

        let updated = AuthConfigMap {
            resource_version: current.resource_version,
            map_roles,
        };

        match client.replace_auth_map(&updated).await {
            Ok(()) => return Ok(()),
            Err(KubeError::Conflict(reason)) if attempt < max_attempts => {
                warn!(
                    parent: span,
                    attempt,
                    max_attempts,
                    reason = %reason,
                    "aws-auth write conflicted, retrying"
                );
                attempt += 1;
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
