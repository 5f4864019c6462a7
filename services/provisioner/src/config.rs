//! Provisioner configuration.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::kubernetes::RetryPolicy;

/// Managed policies every managed node role receives.
pub const DEFAULT_MANAGED_POLICIES: [&str; 3] = [
    "AmazonEKSWorkerNodePolicy",
    "AmazonEKS_CNI_Policy",
    "AmazonEC2ContainerRegistryReadOnly",
];

/// Controller-wide settings shared by every instance group.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// EKS cluster the node groups join.
    pub cluster_name: String,

    /// AWS partition used to build managed policy ARNs.
    pub aws_partition: String,

    /// Policies attached to every managed role, by name or ARN.
    pub default_managed_policies: Vec<String>,

    /// Conflict retry for aws-auth writes.
    pub auth_map_retry: RetryPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            aws_partition: "aws".to_string(),
            default_managed_policies: DEFAULT_MANAGED_POLICIES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            auth_map_retry: RetryPolicy::default(),
            log_level: "info".to_string(),
            log_json: true,
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let cluster_name = std::env::var("IGM_CLUSTER_NAME").unwrap_or_default();

        let aws_partition =
            std::env::var("IGM_AWS_PARTITION").unwrap_or(defaults.aws_partition);

        let default_managed_policies = std::env::var("IGM_DEFAULT_MANAGED_POLICIES")
            .ok()
            .map(|s| parse_policy_list(&s))
            .unwrap_or(defaults.default_managed_policies);

        let max_attempts = match std::env::var("IGM_AUTH_MAP_MAX_ATTEMPTS") {
            Ok(s) => s
                .parse()
                .with_context(|| format!("invalid IGM_AUTH_MAP_MAX_ATTEMPTS: {s}"))?,
            Err(_) => defaults.auth_map_retry.max_attempts,
        };

        let backoff = match std::env::var("IGM_AUTH_MAP_RETRY_BACKOFF_MS") {
            Ok(s) => Duration::from_millis(
                s.parse()
                    .with_context(|| format!("invalid IGM_AUTH_MAP_RETRY_BACKOFF_MS: {s}"))?,
            ),
            Err(_) => defaults.auth_map_retry.backoff,
        };

        let log_level = std::env::var("IGM_LOG_LEVEL").unwrap_or(defaults.log_level);

        let log_json = std::env::var("IGM_LOG_JSON")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(defaults.log_json);

        Ok(Self {
            cluster_name,
            aws_partition,
            default_managed_policies,
            auth_map_retry: RetryPolicy {
                max_attempts,
                backoff,
            },
            log_level,
            log_json,
        })
    }
}

/// Split a comma-separated policy list, dropping blanks.
fn parse_policy_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
