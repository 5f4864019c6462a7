//! Discovery of the live cloud resources behind an instance group.

use tracing::{debug, info, warn};

use super::{EksInstanceGroupContext, TAG_INSTANCE_GROUP_NAME, TAG_INSTANCE_GROUP_NAMESPACE};
use crate::aws::{IamRole, LaunchConfiguration, ScalingGroup};
use crate::error::{ProvisionerError, ProvisionerResult};

/// The node role found in the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRole {
    pub role: IamRole,
    /// Carries this instance group's ownership tags.
    pub managed: bool,
}

/// Point-in-time snapshot of an instance group's cloud resources.
///
/// Built once per tick by [`EksInstanceGroupContext::cloud_discovery`] and
/// never updated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredState {
    scaling_group: Option<ScalingGroup>,
    launch_configuration: Option<LaunchConfiguration>,
    leftover_launch_configuration: Option<LaunchConfiguration>,
    role: Option<DiscoveredRole>,
}

impl DiscoveredState {
    pub fn new(
        scaling_group: Option<ScalingGroup>,
        launch_configuration: Option<LaunchConfiguration>,
        role: Option<DiscoveredRole>,
    ) -> Self {
        Self {
            scaling_group,
            launch_configuration,
            leftover_launch_configuration: None,
            role,
        }
    }

    /// Attach a launch configuration recorded on status that the scaling
    /// group does not reference.
    pub fn with_leftover_launch_configuration(
        mut self,
        launch_configuration: Option<LaunchConfiguration>,
    ) -> Self {
        self.leftover_launch_configuration = launch_configuration;
        self
    }

    pub fn has_scaling_group(&self) -> bool {
        self.scaling_group.is_some()
    }

    pub fn has_launch_configuration(&self) -> bool {
        self.launch_configuration.is_some()
    }

    pub fn has_leftover_launch_configuration(&self) -> bool {
        self.leftover_launch_configuration.is_some()
    }

    pub fn has_role(&self) -> bool {
        self.role.is_some()
    }

    pub fn get_scaling_group(&self) -> Option<&ScalingGroup> {
        self.scaling_group.as_ref()
    }

    pub fn get_launch_configuration(&self) -> Option<&LaunchConfiguration> {
        self.launch_configuration.as_ref()
    }

    pub fn get_leftover_launch_configuration(&self) -> Option<&LaunchConfiguration> {
        self.leftover_launch_configuration.as_ref()
    }

    pub fn get_role(&self) -> Option<&DiscoveredRole> {
        self.role.as_ref()
    }

    pub fn get_active_launch_configuration_name(&self) -> Option<&str> {
        self.launch_configuration.as_ref().map(|lc| lc.name.as_str())
    }

    pub fn get_role_arn(&self) -> Option<&str> {
        self.role.as_ref().map(|r| r.role.arn.as_str())
    }
}

impl EksInstanceGroupContext<'_> {
    /// Discover the instance group's scaling group, launch configuration
    /// and node role.
    ///
    /// The launch configuration last recorded on status is looked up too
    /// when nothing else references it, so one created by an interrupted
    /// tick is found after the spec moved on.
    ///
    /// A missing resource leaves its slot empty. Any other failure aborts
    /// discovery; the tick must not act on a partial view.
    pub async fn cloud_discovery(&mut self) -> ProvisionerResult<()> {
        let scaling_group_name = self.scaling_group_name();
        let role_name = self.role_name();

        let scaling_group = self
            .aws_worker
            .describe_scaling_group(&scaling_group_name)
            .await
            .map_err(|e| ProvisionerError::discovery("failed to describe scaling group", e))?;

        // Without a scaling group, look for the launch configuration a
        // previous tick may have created before failing.
        let launch_configuration_name = match &scaling_group {
            Some(group) => group.launch_configuration_name.clone(),
            None => Some(self.launch_configuration_name()),
        };
        let launch_configuration = match &launch_configuration_name {
            Some(name) => self.describe_launch_configuration(name).await?,
            None => None,
        };

        let recorded_name = self
            .instance_group
            .status
            .active_launch_configuration_name
            .clone()
            .filter(|name| Some(name) != launch_configuration_name.as_ref());
        let leftover_launch_configuration = match &recorded_name {
            Some(name) => self.describe_launch_configuration(name).await?,
            None => None,
        };

        let role = self
            .aws_worker
            .get_role(&role_name)
            .await
            .map_err(|e| ProvisionerError::discovery("failed to get scaling group role", e))?
            .map(|role| {
                let managed = self.is_managed_role(&role);
                DiscoveredRole { role, managed }
            });

        let state = DiscoveredState::new(scaling_group, launch_configuration, role)
            .with_leftover_launch_configuration(leftover_launch_configuration);
        debug!(
            parent: &self.span,
            instance_group = %self.instance_group.name(),
            scaling_group = state.has_scaling_group(),
            launch_configuration = state.has_launch_configuration(),
            leftover_launch_configuration = state.has_leftover_launch_configuration(),
            role = state.has_role(),
            "discovered state"
        );
        match state.get_role() {
            Some(role) if !role.managed && !self.configuration().has_existing_role() => {
                info!(
                    parent: &self.span,
                    instance_group = %self.instance_group.name(),
                    iamrole = %role.role.name,
                    "role exists but is not managed by this instance group"
                );
            }
            None if self.configuration().has_existing_role() => {
                warn!(
                    parent: &self.span,
                    instance_group = %self.instance_group.name(),
                    iamrole = %role_name,
                    "existing role not found"
                );
            }
            _ => {}
        }

        self.discovered_state = state;
        Ok(())
    }

    async fn describe_launch_configuration(
        &self,
        name: &str,
    ) -> ProvisionerResult<Option<LaunchConfiguration>> {
        self.aws_worker
            .describe_launch_configuration(name)
            .await
            .map_err(|e| ProvisionerError::discovery("failed to describe launch configuration", e))
    }

    /// Externally owned roles are never managed, whatever their tags say.
    fn is_managed_role(&self, role: &IamRole) -> bool {
        if self.configuration().has_existing_role() {
            return false;
        }
        let tag_matches = |key: &str, value: &str| role.tags.get(key).is_some_and(|v| v == value);
        tag_matches(TAG_INSTANCE_GROUP_NAME, self.instance_group.name())
            && tag_matches(TAG_INSTANCE_GROUP_NAMESPACE, self.instance_group.namespace())
    }
}
