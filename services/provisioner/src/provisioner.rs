//! Tick entry point.

use std::sync::Arc;

use igm_api::{InstanceGroup, ReconcileState, PROVISIONER_EKS};
use tracing::{debug, error, info, Span};

use crate::aws::AwsWorker;
use crate::config::ProvisionerConfig;
use crate::eks::EksInstanceGroupContext;
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::kubernetes::AuthMapClient;
use crate::state_machine::Transition;

/// Everything one tick needs, handed over by the driver.
pub struct ProvisionerInput<'a> {
    pub aws_worker: Arc<dyn AwsWorker>,
    pub kubernetes: Arc<dyn AuthMapClient>,
    pub instance_group: &'a mut InstanceGroup,
    pub config: Arc<ProvisionerConfig>,
    /// Parent span for every event the tick emits.
    pub span: Span,
}

/// Run one reconciliation tick: discover, decide, act.
///
/// The resulting state is written to the instance group's status and
/// returned. On failure the state is `Error`, except for a failed delete,
/// which stays `Deleting` so the next tick resumes it.
pub async fn reconcile(input: ProvisionerInput<'_>) -> ProvisionerResult<ReconcileState> {
    let provisioner = input.instance_group.spec.provisioner.clone();
    if !igm_common::equal_fold(&provisioner, PROVISIONER_EKS) {
        return Err(ProvisionerError::UnsupportedProvisioner(provisioner));
    }

    let span = input.span.clone();
    let name = input.instance_group.namespaced_name();
    let mut ctx = EksInstanceGroupContext::new(input);

    if let Err(e) = ctx.cloud_discovery().await {
        error!(parent: &span, instancegroup = %name, error = %e, "discovery failed");
        ctx.set_state(ReconcileState::Error);
        return Err(e);
    }

    let transition = ctx.next_transition();
    debug!(
        parent: &span,
        instancegroup = %name,
        current = %ctx.get_instance_group().state(),
        transition = ?transition,
        "selected transition"
    );

    let result = match transition {
        Transition::Create => ctx.create().await,
        Transition::Update => ctx.update().await,
        Transition::Upgrade => ctx.upgrade_scaling_group().await,
        Transition::Delete => ctx.delete().await,
        Transition::Noop => {
            ctx.settle();
            Ok(())
        }
    };

    if let Err(e) = result {
        if ctx.get_instance_group().state() != ReconcileState::Deleting {
            ctx.set_state(ReconcileState::Error);
        }
        error!(
            parent: &span,
            instancegroup = %name,
            transition = ?transition,
            state = %ctx.get_instance_group().state(),
            error = %e,
            "reconcile failed"
        );
        return Err(e);
    }

    let state = ctx.get_instance_group().state();
    info!(parent: &span, instancegroup = %name, state = %state, "reconciled");
    Ok(state)
}
