//! InstanceGroup resource definition.
//!
//! Field names follow the Kubernetes resource shape (camelCase).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApiError, ReconcileState};

// =============================================================================
// Constants
// =============================================================================

/// Provisioner name for EKS-backed node groups.
pub const PROVISIONER_EKS: &str = "eks";

// =============================================================================
// Metadata
// =============================================================================

/// Subset of Kubernetes object metadata the provisioners need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub generation: i64,
    /// Set once deletion of the object has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Spec
// =============================================================================

/// Upgrade strategy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpgradeStrategyType {
    #[default]
    RollingUpdate,
}

/// Integer or percentage, e.g. `2` or `"25%"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(u32),
    Percent(String),
}

impl IntOrPercent {
    /// Resolve against `total`, rounding percentages down but never below 1.
    pub fn resolve(&self, total: u32) -> Result<u32, ApiError> {
        let value = match self {
            Self::Int(n) => *n,
            Self::Percent(s) => {
                let trimmed = s.trim();
                let pct: u32 = trimmed
                    .strip_suffix('%')
                    .unwrap_or(trimmed)
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::InvalidMaxUnavailable(s.clone()))?;
                if pct > 100 {
                    return Err(ApiError::InvalidMaxUnavailable(s.clone()));
                }
                (u64::from(total) * u64::from(pct) / 100) as u32
            }
        };
        Ok(value.max(1))
    }
}

/// Rolling update parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

/// How running instances are replaced when the launch configuration changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStrategy {
    #[serde(rename = "type", default)]
    pub strategy_type: UpgradeStrategyType,
    #[serde(default)]
    pub rolling_update: RollingUpdateStrategy,
}

/// Block device attached to launched instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVolume {
    pub name: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub size: u32,
}

/// Provider configuration of an EKS node group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EksConfiguration {
    /// Overrides the controller's cluster name when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    pub image: String,
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair_name: Option<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<NodeVolume>,
    /// Script run before the node bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_arguments: Option<String>,
    /// Externally owned role, by name or ARN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_role_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_instance_profile_name: Option<String>,
    /// Managed policy names or ARNs attached in addition to the defaults.
    #[serde(default)]
    pub managed_policies: Vec<String>,
}

impl EksConfiguration {
    /// True when the node role is externally owned.
    pub fn has_existing_role(&self) -> bool {
        self.existing_role_name
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty())
    }

    /// Additional managed policies requested by the group.
    pub fn get_managed_policies(&self) -> &[String] {
        &self.managed_policies
    }
}

/// EKS node group sizing and configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EksSpec {
    pub min_size: u32,
    pub max_size: u32,
    pub configuration: EksConfiguration,
}

/// Desired state of an instance group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupSpec {
    #[serde(default = "default_provisioner")]
    pub provisioner: String,
    #[serde(default)]
    pub strategy: UpgradeStrategy,
    pub eks: EksSpec,
}

fn default_provisioner() -> String {
    PROVISIONER_EKS.to_string()
}

// =============================================================================
// Status
// =============================================================================

/// Observed state written back by the provisioner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupStatus {
    #[serde(default)]
    pub current_state: ReconcileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_scaling_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_launch_configuration_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_max: Option<u32>,
    /// Instances still running a superseded launch configuration.
    #[serde(default)]
    pub stale_instances: u32,
}

// =============================================================================
// InstanceGroup
// =============================================================================

/// A declared node group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub metadata: ObjectMeta,
    pub spec: InstanceGroupSpec,
    #[serde(default)]
    pub status: InstanceGroupStatus,
}

impl InstanceGroup {
    /// Create an instance group with empty status.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, eks: EksSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec: InstanceGroupSpec {
                provisioner: default_provisioner(),
                strategy: UpgradeStrategy::default(),
                eks,
            },
            status: InstanceGroupStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// `namespace/name`, for logging.
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Returns true once deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Mark the group for deletion.
    pub fn request_deletion(&mut self, at: DateTime<Utc>) {
        self.metadata.deletion_timestamp.get_or_insert(at);
    }

    pub fn state(&self) -> ReconcileState {
        self.status.current_state
    }

    pub fn set_state(&mut self, state: ReconcileState) {
        self.status.current_state = state;
    }

    pub fn eks_spec(&self) -> &EksSpec {
        &self.spec.eks
    }

    pub fn eks_configuration(&self) -> &EksConfiguration {
        &self.spec.eks.configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_instance_group() {
        let ig: InstanceGroup = serde_json::from_value(json!({
            "metadata": {"name": "ng-1", "namespace": "instance-manager"},
            "spec": {
                "strategy": {"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": "25%"}},
                "eks": {
                    "minSize": 1,
                    "maxSize": 3,
                    "configuration": {
                        "image": "ami-0123456789",
                        "instanceType": "m5.large",
                        "subnets": ["subnet-a", "subnet-b"],
                        "managedPolicies": ["AmazonSSMManagedInstanceCore"]
                    }
                }
            }
        }))
        .unwrap();

        assert_eq!(ig.name(), "ng-1");
        assert_eq!(ig.spec.provisioner, PROVISIONER_EKS);
        assert_eq!(ig.state(), ReconcileState::Init);
        assert!(!ig.is_deleting());
        assert!(!ig.eks_configuration().has_existing_role());
        assert_eq!(
            ig.spec.strategy.rolling_update.max_unavailable,
            Some(IntOrPercent::Percent("25%".to_string()))
        );
        assert_eq!(
            ig.eks_configuration().get_managed_policies(),
            ["AmazonSSMManagedInstanceCore".to_string()]
        );
    }

    #[test]
    fn test_has_existing_role() {
        let mut config = EksConfiguration::default();
        assert!(!config.has_existing_role());
        config.existing_role_name = Some("  ".to_string());
        assert!(!config.has_existing_role());
        config.existing_role_name = Some("shared-node-role".to_string());
        assert!(config.has_existing_role());
    }

    #[test]
    fn test_int_or_percent_resolve() {
        assert_eq!(IntOrPercent::Int(2).resolve(10).unwrap(), 2);
        assert_eq!(IntOrPercent::Int(0).resolve(10).unwrap(), 1);
        assert_eq!(IntOrPercent::Percent("25%".into()).resolve(10).unwrap(), 2);
        assert_eq!(IntOrPercent::Percent("10%".into()).resolve(3).unwrap(), 1);
        assert!(IntOrPercent::Percent("abc".into()).resolve(3).is_err());
        assert!(IntOrPercent::Percent("150%".into()).resolve(3).is_err());
    }

    #[test]
    fn test_request_deletion_keeps_first_timestamp() {
        let mut ig = InstanceGroup::new("default", "ng-1", EksSpec::default());
        let first = Utc::now();
        ig.request_deletion(first);
        ig.request_deletion(first + chrono::Duration::seconds(30));
        assert_eq!(ig.metadata.deletion_timestamp, Some(first));
        assert!(ig.is_deleting());
        assert_eq!(ig.namespaced_name(), "default/ng-1");
    }
}
