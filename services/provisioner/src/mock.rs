//! In-memory cloud and cluster clients for testing and development.
//!
//! Both mocks record every call so tests can assert on ordering and
//! counts, and both support failure injection per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::aws::{
    AwsError, AwsResult, AwsWorker, CreateLaunchConfigurationInput, CreateScalingGroupInput,
    IamRole, InstanceLifecycle, LaunchConfiguration, ScalingGroup, ScalingInstance,
    UpdateScalingGroupInput,
};
use crate::kubernetes::{AuthConfigMap, AuthMapClient, KubeError, RoleMapping};

const MOCK_ACCOUNT: &str = "123456789012";
const MOCK_REGION: &str = "us-west-2";

/// Cloud operations, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AwsOperation {
    DescribeScalingGroup,
    DescribeLaunchConfiguration,
    GetRole,
    CreateLaunchConfiguration,
    DeleteLaunchConfiguration,
    CreateScalingGroup,
    UpdateScalingGroup,
    DeleteScalingGroup,
    CreateRole,
    AttachPolicies,
    DetachPolicies,
    DeleteRole,
    TerminateInstances,
}

/// A recorded cloud call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwsCall {
    DescribeScalingGroup(String),
    DescribeLaunchConfiguration(String),
    GetRole(String),
    CreateLaunchConfiguration(String),
    DeleteLaunchConfiguration(String),
    CreateScalingGroup(String),
    UpdateScalingGroup(String),
    DeleteScalingGroup(String),
    CreateRole(String),
    AttachPolicies(String, Vec<String>),
    DetachPolicies(String, Vec<String>),
    DeleteRole(String, Vec<String>),
    TerminateInstances(Vec<String>),
}

impl AwsCall {
    /// Returns true for calls that change cloud state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::DescribeScalingGroup(_) | Self::DescribeLaunchConfiguration(_) | Self::GetRole(_)
        )
    }
}

#[derive(Default)]
struct MockAwsState {
    scaling_groups: BTreeMap<String, ScalingGroup>,
    launch_configurations: BTreeMap<String, LaunchConfiguration>,
    roles: BTreeMap<String, IamRole>,
    calls: Vec<AwsCall>,
    failures: HashMap<AwsOperation, AwsError>,
    surface_not_found: bool,
    instance_counter: u64,
}

impl MockAwsState {
    fn next_instance(&mut self, launch_configuration_name: Option<String>) -> ScalingInstance {
        self.instance_counter += 1;
        ScalingInstance {
            instance_id: format!("i-{:017x}", self.instance_counter),
            launch_configuration_name,
            lifecycle_state: InstanceLifecycle::InService,
            healthy: true,
        }
    }

    /// Record the call and return the injected failure, if any.
    fn enter(&mut self, op: AwsOperation, call: AwsCall) -> AwsResult<()> {
        self.calls.push(call);
        match self.failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn absent(&self, resource: &'static str, name: &str) -> AwsResult<()> {
        if self.surface_not_found {
            Err(AwsError::not_found(resource, name))
        } else {
            Ok(())
        }
    }
}

/// In-memory [`AwsWorker`].
///
/// Scaling groups launch `min_size` healthy instances on creation, and
/// terminated instances are replaced immediately from the group's current
/// launch configuration.
#[derive(Default)]
pub struct MockAwsWorker {
    state: Mutex<MockAwsState>,
}

impl MockAwsWorker {
    /// Create an empty mock cloud.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockAwsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// ARN of a role with the given name in the mock account.
    pub fn role_arn(name: &str) -> String {
        format!("arn:aws:iam::{MOCK_ACCOUNT}:role/{name}")
    }

    pub fn insert_scaling_group(&self, scaling_group: ScalingGroup) {
        self.state()
            .scaling_groups
            .insert(scaling_group.name.clone(), scaling_group);
    }

    pub fn insert_launch_configuration(&self, launch_configuration: LaunchConfiguration) {
        self.state()
            .launch_configurations
            .insert(launch_configuration.name.clone(), launch_configuration);
    }

    pub fn insert_role(&self, role: IamRole) {
        self.state().roles.insert(role.name.clone(), role);
    }

    /// Fail every call of `op` with `err` until cleared.
    pub fn fail(&self, op: AwsOperation, err: AwsError) {
        self.state().failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: AwsOperation) {
        self.state().failures.remove(&op);
    }

    /// Make deletes of absent resources fail with [`AwsError::NotFound`].
    pub fn surface_not_found(&self, enabled: bool) {
        self.state().surface_not_found = enabled;
    }

    /// Replace the instances of a scaling group.
    pub fn set_instances(&self, scaling_group: &str, instances: Vec<ScalingInstance>) {
        if let Some(group) = self.state().scaling_groups.get_mut(scaling_group) {
            group.instances = instances;
        }
    }

    pub fn scaling_group(&self, name: &str) -> Option<ScalingGroup> {
        self.state().scaling_groups.get(name).cloned()
    }

    pub fn launch_configuration(&self, name: &str) -> Option<LaunchConfiguration> {
        self.state().launch_configurations.get(name).cloned()
    }

    pub fn launch_configuration_names(&self) -> Vec<String> {
        self.state().launch_configurations.keys().cloned().collect()
    }

    pub fn role(&self, name: &str) -> Option<IamRole> {
        self.state().roles.get(name).cloned()
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<AwsCall> {
        self.state().calls.clone()
    }

    /// Recorded calls that change cloud state.
    pub fn mutations(&self) -> Vec<AwsCall> {
        self.calls().into_iter().filter(AwsCall::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

#[async_trait]
impl AwsWorker for MockAwsWorker {
    async fn describe_scaling_group(&self, name: &str) -> AwsResult<Option<ScalingGroup>> {
        let mut state = self.state();
        state.enter(
            AwsOperation::DescribeScalingGroup,
            AwsCall::DescribeScalingGroup(name.to_string()),
        )?;
        Ok(state.scaling_groups.get(name).cloned())
    }

    async fn describe_launch_configuration(
        &self,
        name: &str,
    ) -> AwsResult<Option<LaunchConfiguration>> {
        let mut state = self.state();
        state.enter(
            AwsOperation::DescribeLaunchConfiguration,
            AwsCall::DescribeLaunchConfiguration(name.to_string()),
        )?;
        Ok(state.launch_configurations.get(name).cloned())
    }

    async fn get_role(&self, name: &str) -> AwsResult<Option<IamRole>> {
        let mut state = self.state();
        state.enter(AwsOperation::GetRole, AwsCall::GetRole(name.to_string()))?;
        Ok(state.roles.get(name).cloned())
    }

    async fn create_launch_configuration(
        &self,
        input: &CreateLaunchConfigurationInput,
    ) -> AwsResult<LaunchConfiguration> {
        let mut state = self.state();
        state.enter(
            AwsOperation::CreateLaunchConfiguration,
            AwsCall::CreateLaunchConfiguration(input.name.clone()),
        )?;
        if state.launch_configurations.contains_key(&input.name) {
            return Err(AwsError::Api {
                code: "AlreadyExists".to_string(),
                message: format!("launch configuration {} already exists", input.name),
            });
        }

        let launch_configuration = LaunchConfiguration {
            name: input.name.clone(),
            arn: format!(
                "arn:aws:autoscaling:{MOCK_REGION}:{MOCK_ACCOUNT}:launchConfiguration:{}",
                input.name
            ),
            spec: input.spec.clone(),
        };
        state
            .launch_configurations
            .insert(input.name.clone(), launch_configuration.clone());
        debug!(name = %input.name, "[MOCK] Created launch configuration");
        Ok(launch_configuration)
    }

    async fn delete_launch_configuration(&self, name: &str) -> AwsResult<()> {
        let mut state = self.state();
        state.enter(
            AwsOperation::DeleteLaunchConfiguration,
            AwsCall::DeleteLaunchConfiguration(name.to_string()),
        )?;
        let in_use = state
            .scaling_groups
            .values()
            .any(|g| g.launch_configuration_name.as_deref() == Some(name));
        if in_use {
            return Err(AwsError::ResourceInUse {
                resource: "launch configuration",
                name: name.to_string(),
            });
        }
        if state.launch_configurations.remove(name).is_none() {
            return state.absent("launch configuration", name);
        }
        Ok(())
    }

    async fn create_scaling_group(
        &self,
        input: &CreateScalingGroupInput,
    ) -> AwsResult<ScalingGroup> {
        let mut state = self.state();
        state.enter(
            AwsOperation::CreateScalingGroup,
            AwsCall::CreateScalingGroup(input.name.clone()),
        )?;
        if state.scaling_groups.contains_key(&input.name) {
            return Err(AwsError::Api {
                code: "AlreadyExists".to_string(),
                message: format!("scaling group {} already exists", input.name),
            });
        }

        let instances = (0..input.desired_capacity)
            .map(|_| state.next_instance(Some(input.launch_configuration_name.clone())))
            .collect();
        let scaling_group = ScalingGroup {
            name: input.name.clone(),
            arn: format!(
                "arn:aws:autoscaling:{MOCK_REGION}:{MOCK_ACCOUNT}:autoScalingGroup:{}",
                input.name
            ),
            min_size: input.min_size,
            max_size: input.max_size,
            desired_capacity: input.desired_capacity,
            launch_configuration_name: Some(input.launch_configuration_name.clone()),
            subnets: input.subnets.clone(),
            tags: input.tags.clone(),
            instances,
        };
        state
            .scaling_groups
            .insert(input.name.clone(), scaling_group.clone());
        debug!(name = %input.name, "[MOCK] Created scaling group");
        Ok(scaling_group)
    }

    async fn update_scaling_group(&self, input: &UpdateScalingGroupInput) -> AwsResult<()> {
        let mut state = self.state();
        state.enter(
            AwsOperation::UpdateScalingGroup,
            AwsCall::UpdateScalingGroup(input.name.clone()),
        )?;
        let group = state
            .scaling_groups
            .get_mut(&input.name)
            .ok_or_else(|| AwsError::not_found("scaling group", input.name.clone()))?;
        group.launch_configuration_name = Some(input.launch_configuration_name.clone());
        group.min_size = input.min_size;
        group.max_size = input.max_size;
        group.desired_capacity = group.desired_capacity.clamp(input.min_size, input.max_size);
        group.subnets = input.subnets.clone();
        Ok(())
    }

    async fn delete_scaling_group(&self, name: &str) -> AwsResult<()> {
        let mut state = self.state();
        state.enter(
            AwsOperation::DeleteScalingGroup,
            AwsCall::DeleteScalingGroup(name.to_string()),
        )?;
        if state.scaling_groups.remove(name).is_none() {
            return state.absent("scaling group", name);
        }
        Ok(())
    }

    async fn create_scaling_group_role(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> AwsResult<IamRole> {
        let mut state = self.state();
        state.enter(AwsOperation::CreateRole, AwsCall::CreateRole(name.to_string()))?;
        if let Some(existing) = state.roles.get(name) {
            return Ok(existing.clone());
        }

        let role = IamRole {
            name: name.to_string(),
            arn: Self::role_arn(name),
            instance_profile_arn: Some(format!(
                "arn:aws:iam::{MOCK_ACCOUNT}:instance-profile/{name}"
            )),
            attached_policies: Vec::new(),
            tags: tags.clone(),
        };
        state.roles.insert(name.to_string(), role.clone());
        Ok(role)
    }

    async fn attach_managed_policies(
        &self,
        role_name: &str,
        policy_arns: &[String],
    ) -> AwsResult<()> {
        let mut state = self.state();
        state.enter(
            AwsOperation::AttachPolicies,
            AwsCall::AttachPolicies(role_name.to_string(), policy_arns.to_vec()),
        )?;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| AwsError::not_found("role", role_name))?;
        role.attached_policies = igm_common::merge_slice_by_unique(
            std::mem::take(&mut role.attached_policies),
            policy_arns.to_vec(),
        );
        Ok(())
    }

    async fn detach_managed_policies(
        &self,
        role_name: &str,
        policy_arns: &[String],
    ) -> AwsResult<()> {
        let mut state = self.state();
        state.enter(
            AwsOperation::DetachPolicies,
            AwsCall::DetachPolicies(role_name.to_string(), policy_arns.to_vec()),
        )?;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| AwsError::not_found("role", role_name))?;
        role.attached_policies = igm_common::difference(&role.attached_policies, policy_arns);
        Ok(())
    }

    async fn delete_scaling_group_role(
        &self,
        name: &str,
        policy_arns: &[String],
    ) -> AwsResult<()> {
        let mut state = self.state();
        state.enter(
            AwsOperation::DeleteRole,
            AwsCall::DeleteRole(name.to_string(), policy_arns.to_vec()),
        )?;
        let Some(role) = state.roles.get(name) else {
            return state.absent("role", name);
        };
        let still_attached = igm_common::difference(&role.attached_policies, policy_arns);
        if !still_attached.is_empty() {
            return Err(AwsError::Api {
                code: "DeleteConflict".to_string(),
                message: format!("role {name} still has policies attached: {still_attached:?}"),
            });
        }
        state.roles.remove(name);
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> AwsResult<()> {
        let mut state = self.state();
        state.enter(
            AwsOperation::TerminateInstances,
            AwsCall::TerminateInstances(instance_ids.to_vec()),
        )?;

        let groups: Vec<String> = state.scaling_groups.keys().cloned().collect();
        for name in groups {
            let (terminated, launch_configuration_name) = {
                let group = &state.scaling_groups[&name];
                let terminated = group
                    .instances
                    .iter()
                    .filter(|i| igm_common::contains_string(instance_ids, &i.instance_id))
                    .count();
                (terminated, group.launch_configuration_name.clone())
            };
            if terminated == 0 {
                continue;
            }

            let replacements: Vec<ScalingInstance> = (0..terminated)
                .map(|_| state.next_instance(launch_configuration_name.clone()))
                .collect();
            if let Some(group) = state.scaling_groups.get_mut(&name) {
                group
                    .instances
                    .retain(|i| !igm_common::contains_string(instance_ids, &i.instance_id));
                group.instances.extend(replacements);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Trust list
// =============================================================================

#[derive(Default)]
struct MockAuthMapState {
    map_roles: Vec<RoleMapping>,
    version: u64,
    exists: bool,
    conflicts_remaining: u32,
    failure: Option<KubeError>,
    gets: u32,
    replaces: u32,
}

/// In-memory [`AuthMapClient`] with resource-version checking.
#[derive(Default)]
pub struct MockAuthMapClient {
    state: Mutex<MockAuthMapState>,
}

impl MockAuthMapClient {
    /// Create a client whose document does not exist yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client whose document holds `mappings`.
    pub fn with_mappings(mappings: Vec<RoleMapping>) -> Self {
        let client = Self::default();
        {
            let mut state = client.state();
            state.map_roles = mappings;
            state.exists = true;
            state.version = 1;
        }
        client
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockAuthMapState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject the next `n` writes as if a concurrent writer got there first.
    pub fn inject_conflicts(&self, n: u32) {
        self.state().conflicts_remaining = n;
    }

    /// Fail every read and write with `err` until cleared.
    pub fn fail(&self, err: Option<KubeError>) {
        self.state().failure = err;
    }

    pub fn mappings(&self) -> Vec<RoleMapping> {
        self.state().map_roles.clone()
    }

    pub fn contains(&self, role_arn: &str) -> bool {
        self.state()
            .map_roles
            .iter()
            .any(|m| igm_common::equal_fold(&m.role_arn, role_arn))
    }

    pub fn get_count(&self) -> u32 {
        self.state().gets
    }

    pub fn replace_count(&self) -> u32 {
        self.state().replaces
    }
}

#[async_trait]
impl AuthMapClient for MockAuthMapClient {
    async fn get_auth_map(&self) -> Result<AuthConfigMap, KubeError> {
        let mut state = self.state();
        state.gets += 1;
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        Ok(AuthConfigMap {
            resource_version: state.exists.then(|| state.version.to_string()),
            map_roles: state.map_roles.clone(),
        })
    }

    async fn replace_auth_map(&self, auth_map: &AuthConfigMap) -> Result<(), KubeError> {
        let mut state = self.state();
        state.replaces += 1;
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }

        if state.conflicts_remaining > 0 {
            state.conflicts_remaining -= 1;
            state.version += 1;
            return Err(KubeError::Conflict("injected conflict".to_string()));
        }

        let current = state.exists.then(|| state.version.to_string());
        if auth_map.resource_version != current {
            return Err(KubeError::Conflict(format!(
                "resource version {:?} is stale, current is {:?}",
                auth_map.resource_version, current
            )));
        }

        state.map_roles = auth_map.map_roles.clone();
        state.exists = true;
        state.version += 1;
        Ok(())
    }
}
