//! Update transition.

use igm_api::ReconcileState;
use tracing::{info, warn};

use super::EksInstanceGroupContext;
use crate::aws::{ignore_not_found, AwsError, UpdateScalingGroupInput};
use crate::error::{ProvisionerError, ProvisionerResult};

impl EksInstanceGroupContext<'_> {
    /// Bring an existing scaling group, its launch configuration and role
    /// in line with the spec.
    ///
    /// Running instances are not touched; ends in `Upgrading` when any of
    /// them still runs a superseded launch configuration.
    pub async fn update(&mut self) -> ProvisionerResult<()> {
        let Some(scaling_group) = self.discovered_state.get_scaling_group().cloned() else {
            return self.create().await;
        };
        self.set_state(ReconcileState::Updating);
        let drift = self.drift();

        let role = self.ensure_role().await?;
        self.delete_unused_launch_configuration().await?;
        let launch_configuration_name = self.ensure_launch_configuration().await?;
        self.record_launch_configuration(&launch_configuration_name);

        if drift.scaling_group || drift.launch_configuration {
            let eks = self.instance_group.eks_spec();
            let input = UpdateScalingGroupInput {
                name: scaling_group.name.clone(),
                launch_configuration_name: launch_configuration_name.clone(),
                min_size: eks.min_size,
                max_size: eks.max_size,
                subnets: eks.configuration.subnets.clone(),
            };
            self.aws_worker
                .update_scaling_group(&input)
                .await
                .map_err(|e| ProvisionerError::aws("failed to update scaling group", e))?;
            info!(
                parent: &self.span,
                instancegroup = %self.instance_group.name(),
                scalinggroup = %scaling_group.name,
                launchconfig = %launch_configuration_name,
                "updated scaling group"
            );
        }

        if let Some(superseded) = scaling_group
            .launch_configuration_name
            .as_deref()
            .filter(|name| *name != launch_configuration_name)
        {
            self.delete_superseded_launch_configuration(superseded).await?;
        }

        self.upsert_node_mapping(&role.arn).await?;

        let stale_instances = scaling_group
            .instances
            .iter()
            .filter(|i| {
                i.launch_configuration_name.as_deref() != Some(launch_configuration_name.as_str())
            })
            .count() as u32;
        self.record_status(&launch_configuration_name, &role.arn, stale_instances);

        let next = if stale_instances > 0 {
            ReconcileState::Upgrading
        } else {
            ReconcileState::Active
        };
        self.set_state(next);
        Ok(())
    }

    /// Delete the launch configuration an interrupted tick recorded but
    /// nothing uses.
    pub(crate) async fn delete_unused_launch_configuration(&self) -> ProvisionerResult<()> {
        match self.unused_launch_configuration_name() {
            Some(name) => self.delete_superseded_launch_configuration(&name).await,
            None => Ok(()),
        }
    }

    async fn delete_superseded_launch_configuration(&self, name: &str) -> ProvisionerResult<()> {
        match ignore_not_found(self.aws_worker.delete_launch_configuration(name).await) {
            Ok(()) => {
                info!(
                    parent: &self.span,
                    instancegroup = %self.instance_group.name(),
                    launchconfig = %name,
                    "deleted launch config"
                );
                Ok(())
            }
            // Still referenced elsewhere; a later delete cleans it up.
            Err(AwsError::ResourceInUse { .. }) => {
                warn!(
                    parent: &self.span,
                    instancegroup = %self.instance_group.name(),
                    launchconfig = %name,
                    "superseded launch config still in use"
                );
                Ok(())
            }
            Err(e) => Err(ProvisionerError::aws(
                "failed to delete launch configuration",
                e,
            )),
        }
    }
}
