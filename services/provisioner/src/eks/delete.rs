//! Delete transition.

use igm_api::ReconcileState;
use tracing::{info, warn};

use super::EksInstanceGroupContext;
use crate::aws::{ignore_not_found, AwsResult};
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::kubernetes::remove_auth_config_map;

impl EksInstanceGroupContext<'_> {
    /// Tear down the node group's cloud footprint and revoke its role's
    /// cluster trust.
    ///
    /// The scaling group goes first; if that fails nothing else is touched.
    /// Once it is gone the aws-auth entry is removed, and the launch
    /// configuration and role are deleted whether or not that removal
    /// succeeded. The first failure is returned. Safe to call repeatedly.
    pub async fn delete(&mut self) -> ProvisionerResult<()> {
        self.set_state(ReconcileState::Deleting);

        self.delete_scaling_group()
            .await
            .map_err(|e| ProvisionerError::aws("failed to delete scaling group", e))?;

        let revoked = self.remove_node_mapping().await;
        let dependents = self.delete_dependents().await;

        match (revoked, dependents) {
            (Err(revoke_err), Err(e)) => {
                warn!(
                    parent: &self.span,
                    instancegroup = %self.instance_group.name(),
                    error = %e,
                    "delete failed after aws-auth removal failed"
                );
                return Err(revoke_err);
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => return Err(e),
            (Ok(()), Ok(())) => {}
        }

        self.set_state(ReconcileState::Deleted);
        Ok(())
    }

    /// Remove the node role's aws-auth entry.
    ///
    /// Falls back to the ARN recorded on status, so a removal that failed
    /// is retried even after the role itself is gone. The entry of a role
    /// that is neither ours nor the configured existing role is left alone.
    async fn remove_node_mapping(&self) -> ProvisionerResult<()> {
        let role_arn = match self.discovered_state.get_role() {
            Some(discovered)
                if !discovered.managed && !self.configuration().has_existing_role() =>
            {
                warn!(
                    parent: &self.span,
                    instancegroup = %self.instance_group.name(),
                    iamrole = %discovered.role.name,
                    "role is not managed by this instance group, keeping its aws-auth entry"
                );
                return Ok(());
            }
            Some(discovered) => Some(discovered.role.arn.clone()),
            None => self.instance_group.status.node_role_arn.clone(),
        };
        let Some(role_arn) = role_arn else {
            return Ok(());
        };

        remove_auth_config_map(
            self.kubernetes.as_ref(),
            &[role_arn],
            &self.config.auth_map_retry,
            &self.span,
        )
        .await
        .map_err(|e| ProvisionerError::auth_map("failed to remove role from aws-auth", e))
    }

    /// Launch configuration, then role.
    async fn delete_dependents(&self) -> ProvisionerResult<()> {
        self.delete_launch_configuration()
            .await
            .map_err(|e| ProvisionerError::aws("failed to delete launch configuration", e))?;
        self.delete_managed_role()
            .await
            .map_err(|e| ProvisionerError::aws("failed to delete scaling group role", e))
    }

    pub async fn delete_scaling_group(&self) -> AwsResult<()> {
        let Some(scaling_group) = self.discovered_state.get_scaling_group() else {
            return Ok(());
        };

        ignore_not_found(self.aws_worker.delete_scaling_group(&scaling_group.name).await)?;
        info!(
            parent: &self.span,
            instancegroup = %self.instance_group.name(),
            scalinggroup = %scaling_group.name,
            "deleted scaling group"
        );
        Ok(())
    }

    /// Delete the active launch configuration and any recorded one left
    /// behind by an interrupted tick.
    pub async fn delete_launch_configuration(&self) -> AwsResult<()> {
        let state = &self.discovered_state;
        let names = state
            .get_active_launch_configuration_name()
            .into_iter()
            .chain(
                state
                    .get_leftover_launch_configuration()
                    .map(|lc| lc.name.as_str()),
            );

        for name in names {
            ignore_not_found(self.aws_worker.delete_launch_configuration(name).await)?;
            info!(
                parent: &self.span,
                instancegroup = %self.instance_group.name(),
                launchconfig = %name,
                "deleted launch config"
            );
        }
        Ok(())
    }

    /// Delete the node role after detaching its managed policies.
    ///
    /// Externally owned roles and roles without this group's ownership
    /// tags are never deleted.
    pub async fn delete_managed_role(&self) -> AwsResult<()> {
        let Some(discovered) = self.discovered_state.get_role() else {
            return Ok(());
        };
        if self.configuration().has_existing_role() {
            return Ok(());
        }
        if !discovered.managed {
            warn!(
                parent: &self.span,
                instancegroup = %self.instance_group.name(),
                iamrole = %discovered.role.name,
                "role is not managed by this instance group, not deleting"
            );
            return Ok(());
        }

        let managed_policies = self.get_managed_policies_list();
        ignore_not_found(
            self.aws_worker
                .delete_scaling_group_role(&discovered.role.name, &managed_policies)
                .await,
        )?;
        info!(
            parent: &self.span,
            instancegroup = %self.instance_group.name(),
            iamrole = %discovered.role.name,
            "deleted scaling group role"
        );
        Ok(())
    }
}
