//! Managed policy resolution and reconciliation for node roles.

use tracing::info;

use super::EksInstanceGroupContext;
use crate::aws::IamRole;
use crate::error::{ProvisionerError, ProvisionerResult};

const ARN_PREFIX: &str = "arn:";

/// Expand a policy name into an AWS-managed policy ARN. ARNs pass through.
fn policy_arn(partition: &str, policy: &str) -> String {
    if policy.starts_with(ARN_PREFIX) {
        policy.to_string()
    } else {
        format!("arn:{partition}:iam::aws:policy/{policy}")
    }
}

/// The full list of managed policy ARNs for a node role.
///
/// Defaults come first, followed by `additional` in order. Duplicates are
/// dropped case-insensitively and blank entries are ignored.
pub fn managed_policies_list(
    partition: &str,
    defaults: &[String],
    additional: &[String],
) -> Vec<String> {
    defaults
        .iter()
        .chain(additional)
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| policy_arn(partition, p))
        .fold(Vec::new(), |mut acc, arn| {
            if !igm_common::contains_equal_fold(&acc, &arn) {
                acc.push(arn);
            }
            acc
        })
}

/// Policies to attach and detach so that `attached` becomes `desired`.
pub(crate) fn policy_changes(
    attached: &[String],
    desired: &[String],
) -> (Vec<String>, Vec<String>) {
    let attach = igm_common::difference_equal_fold(desired, attached);
    let detach = igm_common::difference_equal_fold(attached, desired);
    (attach, detach)
}

impl EksInstanceGroupContext<'_> {
    /// Bring the policies attached to a managed role in line with the
    /// configured list. Externally owned roles are left alone.
    pub(crate) async fn reconcile_role_policies(&self, role: &IamRole) -> ProvisionerResult<()> {
        if self.configuration().has_existing_role() {
            return Ok(());
        }

        let desired = self.get_managed_policies_list();
        let (attach, detach) = policy_changes(&role.attached_policies, &desired);

        if !attach.is_empty() {
            self.aws_worker
                .attach_managed_policies(&role.name, &attach)
                .await
                .map_err(|e| ProvisionerError::aws("failed to attach role policies", e))?;
            info!(
                parent: &self.span,
                instancegroup = %self.instance_group.name(),
                iamrole = %role.name,
                policies = ?attach,
                "attached managed policies"
            );
        }

        if !detach.is_empty() {
            self.aws_worker
                .detach_managed_policies(&role.name, &detach)
                .await
                .map_err(|e| ProvisionerError::aws("failed to detach role policies", e))?;
            info!(
                parent: &self.span,
                instancegroup = %self.instance_group.name(),
                iamrole = %role.name,
                policies = ?detach,
                "detached managed policies"
            );
        }

        Ok(())
    }
}
