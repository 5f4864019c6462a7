//! Rolling replacement of instances running a superseded launch
//! configuration.

use igm_api::{IntOrPercent, ReconcileState};
use igm_reconcile::{classify_instances, select_for_drain, DrainPriority, RollingStrategy};
use tracing::info;

use super::EksInstanceGroupContext;
use crate::aws::{InstanceLifecycle, ScalingInstance};
use crate::error::{ProvisionerError, ProvisionerResult};

fn drain_priority(instance: &&ScalingInstance) -> DrainPriority {
    if !instance.healthy {
        DrainPriority::Unhealthy
    } else if instance.lifecycle_state != InstanceLifecycle::InService {
        DrainPriority::NotInService
    } else {
        DrainPriority::Healthy
    }
}

impl EksInstanceGroupContext<'_> {
    /// Terminate one batch of stale instances.
    ///
    /// Stale instances that are already out of service go first and do not
    /// count against `maxUnavailable`; healthy ones are terminated only
    /// while the group has unavailability budget left. The scaling group
    /// launches replacements from the active launch configuration.
    pub async fn upgrade_scaling_group(&mut self) -> ProvisionerResult<()> {
        self.set_state(ReconcileState::Upgrading);
        let Some(scaling_group) = self.discovered_state.get_scaling_group() else {
            return Ok(());
        };
        let active = scaling_group
            .launch_configuration_name
            .clone()
            .unwrap_or_default();

        let (_, stale) = classify_instances(&scaling_group.instances, &active, |i| {
            i.launch_configuration_name.as_deref()
        });
        let stale_count = stale.len() as u32;
        if stale.is_empty() {
            self.instance_group.status.stale_instances = 0;
            self.set_state(ReconcileState::Active);
            return Ok(());
        }

        let total = scaling_group.instances.len() as u32;
        let max_unavailable = self
            .instance_group
            .spec
            .strategy
            .rolling_update
            .max_unavailable
            .clone()
            .unwrap_or(IntOrPercent::Int(1))
            .resolve(total)
            .map_err(|e| ProvisionerError::Config(e.to_string()))?;
        let unavailable = scaling_group
            .instances
            .iter()
            .filter(|i| !i.is_available())
            .count() as u32;

        let candidates: Vec<&ScalingInstance> = stale
            .into_iter()
            .filter(|i| {
                !matches!(
                    i.lifecycle_state,
                    InstanceLifecycle::Terminating | InstanceLifecycle::Detached
                )
            })
            .collect();
        let out_of_service = candidates.iter().filter(|i| !i.is_available()).count();
        let in_service = (candidates.len() - out_of_service) as u32;

        let strategy = RollingStrategy { max_unavailable };
        let batch = out_of_service + strategy.batch_size(unavailable, in_service) as usize;

        let instance_ids: Vec<String> = select_for_drain(candidates, drain_priority)
            .into_iter()
            .take(batch)
            .map(|i| i.instance_id.clone())
            .collect();

        if !instance_ids.is_empty() {
            self.aws_worker
                .terminate_instances(&instance_ids)
                .await
                .map_err(|e| ProvisionerError::aws("failed to terminate instances", e))?;
            info!(
                parent: &self.span,
                instancegroup = %self.instance_group.name(),
                instances = ?instance_ids,
                stale = stale_count,
                max_unavailable,
                "terminated stale instances"
            );
        }

        self.instance_group.status.stale_instances = stale_count;
        Ok(())
    }
}
