//! Create transition, plus the ensure-steps shared with update.

use igm_api::ReconcileState;
use tracing::{info, warn};

use super::EksInstanceGroupContext;
use crate::aws::{CreateLaunchConfigurationInput, CreateScalingGroupInput, IamRole};
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::kubernetes::{upsert_auth_config_map, RoleMapping};

impl EksInstanceGroupContext<'_> {
    /// Create the node group's cloud footprint and admit its role to the
    /// cluster.
    ///
    /// Steps whose target already exists are skipped, so a create that
    /// failed halfway is resumed by the next call. The launch configuration
    /// is recorded on status before the scaling group is created, so one
    /// left behind by a failed create is still found if the spec changes.
    pub async fn create(&mut self) -> ProvisionerResult<()> {
        self.set_state(ReconcileState::Creating);

        let role = self.ensure_role().await?;
        self.delete_unused_launch_configuration().await?;
        let launch_configuration_name = self.ensure_launch_configuration().await?;
        self.record_launch_configuration(&launch_configuration_name);
        self.ensure_scaling_group(&launch_configuration_name).await?;
        self.upsert_node_mapping(&role.arn).await?;

        self.record_status(&launch_configuration_name, &role.arn, 0);
        self.set_state(ReconcileState::Active);
        Ok(())
    }

    /// The node role: discovered, externally owned, or newly created.
    ///
    /// Managed policies are attached to roles this instance group owns.
    pub(crate) async fn ensure_role(&self) -> ProvisionerResult<IamRole> {
        if self.configuration().has_existing_role() {
            return match self.discovered_state.get_role() {
                Some(discovered) => Ok(discovered.role.clone()),
                None => Err(ProvisionerError::Config(format!(
                    "existing role {} not found",
                    self.role_name()
                ))),
            };
        }

        let role = match self.discovered_state.get_role() {
            Some(discovered) if !discovered.managed => {
                warn!(
                    parent: &self.span,
                    instancegroup = %self.instance_group.name(),
                    iamrole = %discovered.role.name,
                    "using untagged role, its policies are left unchanged"
                );
                return Ok(discovered.role.clone());
            }
            Some(discovered) => discovered.role.clone(),
            None => {
                let role_name = self.role_name();
                let role = self
                    .aws_worker
                    .create_scaling_group_role(&role_name, &self.ownership_tags())
                    .await
                    .map_err(|e| ProvisionerError::aws("failed to create scaling group role", e))?;
                info!(
                    parent: &self.span,
                    instancegroup = %self.instance_group.name(),
                    iamrole = %role.name,
                    "created scaling group role"
                );
                role
            }
        };

        self.reconcile_role_policies(&role).await?;
        Ok(role)
    }

    /// The desired launch configuration, created if it does not exist yet.
    pub(crate) async fn ensure_launch_configuration(&self) -> ProvisionerResult<String> {
        let name = self.launch_configuration_name();
        if self.discovered_state.get_active_launch_configuration_name() == Some(name.as_str()) {
            return Ok(name);
        }

        let existing = self
            .aws_worker
            .describe_launch_configuration(&name)
            .await
            .map_err(|e| ProvisionerError::aws("failed to create launch configuration", e))?;
        if existing.is_some() {
            return Ok(name);
        }

        let input = CreateLaunchConfigurationInput {
            name: name.clone(),
            spec: self.desired_launch_spec(),
        };
        self.aws_worker
            .create_launch_configuration(&input)
            .await
            .map_err(|e| ProvisionerError::aws("failed to create launch configuration", e))?;
        info!(
            parent: &self.span,
            instancegroup = %self.instance_group.name(),
            launchconfig = %name,
            "created launch configuration"
        );
        Ok(name)
    }

    async fn ensure_scaling_group(&self, launch_configuration_name: &str) -> ProvisionerResult<()> {
        if self.discovered_state.has_scaling_group() {
            return Ok(());
        }

        let eks = self.instance_group.eks_spec();
        let input = CreateScalingGroupInput {
            name: self.scaling_group_name(),
            launch_configuration_name: launch_configuration_name.to_string(),
            min_size: eks.min_size,
            max_size: eks.max_size,
            desired_capacity: eks.min_size,
            subnets: eks.configuration.subnets.clone(),
            tags: self.scaling_group_tags(),
        };
        self.aws_worker
            .create_scaling_group(&input)
            .await
            .map_err(|e| ProvisionerError::aws("failed to create scaling group", e))?;
        info!(
            parent: &self.span,
            instancegroup = %self.instance_group.name(),
            scalinggroup = %input.name,
            "created scaling group"
        );
        Ok(())
    }

    /// Admit nodes launched with `role_arn` to the cluster.
    pub(crate) async fn upsert_node_mapping(&self, role_arn: &str) -> ProvisionerResult<()> {
        upsert_auth_config_map(
            self.kubernetes.as_ref(),
            &[RoleMapping::node(role_arn)],
            &self.config.auth_map_retry,
            &self.span,
        )
        .await
        .map_err(|e| ProvisionerError::auth_map("failed to update aws-auth", e))
    }

    pub(crate) fn record_launch_configuration(&mut self, launch_configuration_name: &str) {
        self.instance_group.status.active_launch_configuration_name =
            Some(launch_configuration_name.to_string());
    }

    pub(crate) fn record_status(
        &mut self,
        launch_configuration_name: &str,
        role_arn: &str,
        stale_instances: u32,
    ) {
        let scaling_group_name = self.scaling_group_name();
        let (min_size, max_size) = {
            let eks = self.instance_group.eks_spec();
            (eks.min_size, eks.max_size)
        };

        let status = &mut self.instance_group.status;
        status.active_scaling_group_name = Some(scaling_group_name);
        status.active_launch_configuration_name = Some(launch_configuration_name.to_string());
        status.node_role_arn = Some(role_arn.to_string());
        status.current_min = Some(min_size);
        status.current_max = Some(max_size);
        status.stale_instances = stale_instances;
    }
}
