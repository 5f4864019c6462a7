//! Cloud resource client interface.
//!
//! The [`AwsWorker`] trait abstracts the autoscaling, EC2 and IAM calls a
//! provisioner makes. Implementations are expected to retry throttling
//! internally; the engine never retries within a tick.
//!
//! Reads return `Ok(None)` when the resource does not exist. Deletes of
//! absent resources succeed. Implementations that surface a not-found
//! condition as [`AwsError::NotFound`] anyway are tolerated: the engine
//! passes delete results through [`ignore_not_found`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Result type for cloud client calls.
pub type AwsResult<T> = Result<T, AwsError>;

/// Errors returned by the cloud client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AwsError {
    /// The resource does not exist.
    #[error("{resource} not found: {name}")]
    NotFound { resource: &'static str, name: String },

    /// The resource is still referenced by another resource.
    #[error("{resource} in use: {name}")]
    ResourceInUse { resource: &'static str, name: String },

    /// Request rate exceeded after the client's own retries.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Any other API failure.
    #[error("{code}: {message}")]
    Api { code: String, message: String },
}

impl AwsError {
    pub fn not_found(resource: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Treat a not-found failure of an idempotent delete as success.
pub fn ignore_not_found(result: AwsResult<()>) -> AwsResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

// =============================================================================
// Records
// =============================================================================

/// Lifecycle of an instance within its scaling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLifecycle {
    Pending,
    InService,
    Terminating,
    Detached,
}

/// An instance that belongs to a scaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingInstance {
    pub instance_id: String,
    /// `None` when the instance was not launched from a launch configuration.
    pub launch_configuration_name: Option<String>,
    pub lifecycle_state: InstanceLifecycle,
    pub healthy: bool,
}

impl ScalingInstance {
    /// In service and passing health checks.
    pub fn is_available(&self) -> bool {
        self.lifecycle_state == InstanceLifecycle::InService && self.healthy
    }
}

/// An autoscaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingGroup {
    pub name: String,
    pub arn: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub launch_configuration_name: Option<String>,
    pub subnets: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub instances: Vec<ScalingInstance>,
}

/// Root block device of a launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    pub device_name: String,
    pub volume_type: String,
    pub volume_size: u32,
}

/// Everything that determines how instances are launched.
///
/// Serialized form feeds the launch configuration name hash, so any
/// field change yields a new launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub iam_instance_profile: String,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
    /// Base64-encoded user data.
    pub user_data: String,
    pub block_devices: Vec<BlockDevice>,
}

/// A launch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfiguration {
    pub name: String,
    pub arn: String,
    pub spec: LaunchSpec,
}

/// An IAM role with its attached managed policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamRole {
    pub name: String,
    pub arn: String,
    /// Instance profile with the same name as the role, when present.
    pub instance_profile_arn: Option<String>,
    /// Attached managed policy ARNs.
    pub attached_policies: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

// =============================================================================
// Inputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLaunchConfigurationInput {
    pub name: String,
    pub spec: LaunchSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateScalingGroupInput {
    pub name: String,
    pub launch_configuration_name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub subnets: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateScalingGroupInput {
    pub name: String,
    pub launch_configuration_name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub subnets: Vec<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Idempotent verbs against the cloud provider.
#[async_trait]
pub trait AwsWorker: Send + Sync {
    async fn describe_scaling_group(&self, name: &str) -> AwsResult<Option<ScalingGroup>>;

    async fn describe_launch_configuration(
        &self,
        name: &str,
    ) -> AwsResult<Option<LaunchConfiguration>>;

    async fn get_role(&self, name: &str) -> AwsResult<Option<IamRole>>;

    async fn create_launch_configuration(
        &self,
        input: &CreateLaunchConfigurationInput,
    ) -> AwsResult<LaunchConfiguration>;

    async fn delete_launch_configuration(&self, name: &str) -> AwsResult<()>;

    async fn create_scaling_group(&self, input: &CreateScalingGroupInput)
        -> AwsResult<ScalingGroup>;

    async fn update_scaling_group(&self, input: &UpdateScalingGroupInput) -> AwsResult<()>;

    async fn delete_scaling_group(&self, name: &str) -> AwsResult<()>;

    /// Create a role assumable by EC2 together with its instance profile.
    async fn create_scaling_group_role(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> AwsResult<IamRole>;

    async fn attach_managed_policies(&self, role_name: &str, policy_arns: &[String])
        -> AwsResult<()>;

    async fn detach_managed_policies(&self, role_name: &str, policy_arns: &[String])
        -> AwsResult<()>;

    /// Detach `policy_arns`, remove the instance profile and delete the role.
    async fn delete_scaling_group_role(&self, name: &str, policy_arns: &[String])
        -> AwsResult<()>;

    /// Terminate instances without decrementing desired capacity.
    async fn terminate_instances(&self, instance_ids: &[String]) -> AwsResult<()>;
}
