//! EKS node group provisioner.
//!
//! [`EksInstanceGroupContext`] binds one instance group to the cloud and
//! cluster clients for a single reconciliation tick:
//!
//! ```text
//! cloud_discovery()  ->  next_transition()  ->  create() | update()
//!                                               | upgrade_scaling_group()
//!                                               | delete()
//! ```
//!
//! Every step is idempotent and skips work whose target already exists
//! (or is already gone), so a tick that fails halfway is resumed by the
//! next one.

mod create;
mod delete;
mod discovery;
mod policies;
mod update;
mod upgrade;
mod userdata;

use std::collections::BTreeMap;
use std::sync::Arc;

use igm_api::{EksConfiguration, InstanceGroup, ReconcileState};
use igm_reconcile::SpecHash;
use tracing::Span;

use crate::aws::{AwsWorker, BlockDevice, LaunchSpec};
use crate::config::ProvisionerConfig;
use crate::kubernetes::AuthMapClient;
use crate::state_machine::{self, Drift, Observation, Transition};
use crate::ProvisionerInput;

pub use discovery::{DiscoveredRole, DiscoveredState};
pub use policies::managed_policies_list;

/// Tag carrying the cluster name.
pub const TAG_CLUSTER_NAME: &str = "instancegroups.keikoproj.io/ClusterName";
/// Tag carrying the owning instance group's name; marks managed resources.
pub const TAG_INSTANCE_GROUP_NAME: &str = "instancegroups.keikoproj.io/InstanceGroup";
/// Tag carrying the owning instance group's namespace.
pub const TAG_INSTANCE_GROUP_NAMESPACE: &str = "instancegroups.keikoproj.io/Namespace";
/// Legacy cluster tag read by the cluster autoscaler.
pub const TAG_KUBERNETES_CLUSTER: &str = "KubernetesCluster";

/// Length of the spec hash suffix in launch configuration names.
const LAUNCH_CONFIGURATION_HASH_LEN: usize = 12;

/// IAM role names are limited to 64 characters.
const MAX_ROLE_NAME_LEN: usize = 64;

/// Length of the hash suffix that keeps truncated role names unique.
const ROLE_NAME_HASH_LEN: usize = 8;

fn cluster_ownership_tag(cluster_name: &str) -> String {
    format!("kubernetes.io/cluster/{cluster_name}")
}

/// Shorten `name` to `max_len` bytes, replacing the tail with a hash of the
/// full name so distinct long names stay distinct.
fn bounded_name(name: String, max_len: usize) -> String {
    if name.len() <= max_len {
        return name;
    }
    let hash = igm_common::string_hash(&name);
    let budget = max_len - ROLE_NAME_HASH_LEN - 1;
    let head: String = name
        .char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= budget)
        .map(|(_, c)| c)
        .collect();
    format!("{head}-{}", &hash[..ROLE_NAME_HASH_LEN])
}

/// Reconciliation context for one EKS instance group.
pub struct EksInstanceGroupContext<'a> {
    instance_group: &'a mut InstanceGroup,
    discovered_state: DiscoveredState,
    aws_worker: Arc<dyn AwsWorker>,
    kubernetes: Arc<dyn AuthMapClient>,
    config: Arc<ProvisionerConfig>,
    span: Span,
}

impl<'a> EksInstanceGroupContext<'a> {
    /// Bind an instance group to its clients. Nothing is discovered yet.
    pub fn new(input: ProvisionerInput<'a>) -> Self {
        Self {
            instance_group: input.instance_group,
            discovered_state: DiscoveredState::default(),
            aws_worker: input.aws_worker,
            kubernetes: input.kubernetes,
            config: input.config,
            span: input.span,
        }
    }

    pub fn get_instance_group(&self) -> &InstanceGroup {
        self.instance_group
    }

    pub fn get_discovered_state(&self) -> &DiscoveredState {
        &self.discovered_state
    }

    /// Replace the discovered state, e.g. with a snapshot taken elsewhere.
    pub fn set_discovered_state(&mut self, state: DiscoveredState) {
        self.discovered_state = state;
    }

    pub fn set_state(&mut self, state: ReconcileState) {
        self.instance_group.set_state(state);
    }

    fn configuration(&self) -> &EksConfiguration {
        self.instance_group.eks_configuration()
    }

    // =========================================================================
    // Naming
    // =========================================================================

    /// Cluster the group joins; the group's own override wins.
    pub fn cluster_name(&self) -> &str {
        self.configuration()
            .cluster_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.config.cluster_name)
    }

    fn resource_prefix(&self) -> String {
        format!(
            "{}-{}-{}",
            self.cluster_name(),
            self.instance_group.namespace(),
            self.instance_group.name()
        )
    }

    /// Scaling group name: `{cluster}-{namespace}-{name}`.
    pub fn scaling_group_name(&self) -> String {
        self.resource_prefix()
    }

    /// Node role name: the managed convention, or the external role's name.
    pub fn role_name(&self) -> String {
        match &self.configuration().existing_role_name {
            Some(existing) if self.configuration().has_existing_role() => {
                igm_common::get_last_element_by(existing.trim(), "/").to_string()
            }
            _ => bounded_name(self.resource_prefix(), MAX_ROLE_NAME_LEN),
        }
    }

    /// Instance profile launched instances use.
    fn instance_profile_name(&self) -> String {
        let configuration = self.configuration();
        match &configuration.existing_instance_profile_name {
            Some(profile) if configuration.has_existing_role() && !profile.is_empty() => {
                igm_common::get_last_element_by(profile.trim(), "/").to_string()
            }
            _ => self.role_name(),
        }
    }

    /// The launch spec the group currently asks for.
    pub fn desired_launch_spec(&self) -> LaunchSpec {
        let configuration = self.configuration();

        let mut security_groups = configuration.security_groups.clone();
        security_groups.sort();
        security_groups.dedup();

        LaunchSpec {
            image_id: configuration.image.clone(),
            instance_type: configuration.instance_type.clone(),
            iam_instance_profile: self.instance_profile_name(),
            security_groups,
            key_name: configuration.key_pair_name.clone(),
            user_data: userdata::bootstrap_user_data(
                self.cluster_name(),
                configuration.user_data.as_deref(),
                configuration.bootstrap_arguments.as_deref(),
            ),
            block_devices: configuration
                .volumes
                .iter()
                .map(|v| BlockDevice {
                    device_name: v.name.clone(),
                    volume_type: v.volume_type.clone(),
                    volume_size: v.size,
                })
                .collect(),
        }
    }

    /// Launch configuration name: `{prefix}-{hash of the desired launch spec}`.
    ///
    /// Launch configurations are immutable, so a changed spec yields a new
    /// name while an unchanged spec always maps to the same one.
    pub fn launch_configuration_name(&self) -> String {
        let spec = self.desired_launch_spec();
        // LaunchSpec holds only strings and integers, so this cannot fail.
        let value = serde_json::to_value(&spec).unwrap_or_default();
        let hash = SpecHash::from_json(&value);
        format!(
            "{}-{}",
            self.resource_prefix(),
            hash.short(LAUNCH_CONFIGURATION_HASH_LEN)
        )
    }

    /// Tags that identify resources owned by this instance group.
    fn ownership_tags(&self) -> BTreeMap<String, String> {
        let cluster_name = self.cluster_name().to_string();
        BTreeMap::from([
            (TAG_CLUSTER_NAME.to_string(), cluster_name),
            (
                TAG_INSTANCE_GROUP_NAME.to_string(),
                self.instance_group.name().to_string(),
            ),
            (
                TAG_INSTANCE_GROUP_NAMESPACE.to_string(),
                self.instance_group.namespace().to_string(),
            ),
        ])
    }

    /// Tags applied to the scaling group and propagated to instances.
    fn scaling_group_tags(&self) -> BTreeMap<String, String> {
        let cluster_name = self.cluster_name().to_string();
        let mut tags = self.configuration().tags.clone();
        tags.extend(self.ownership_tags());
        tags.insert(cluster_ownership_tag(&cluster_name), "owned".to_string());
        tags.insert(TAG_KUBERNETES_CLUSTER.to_string(), cluster_name);
        tags.insert("Name".to_string(), self.resource_prefix());
        tags
    }

    /// Managed policy ARNs for the group's role, from live configuration.
    pub fn get_managed_policies_list(&self) -> Vec<String> {
        managed_policies_list(
            &self.config.aws_partition,
            &self.config.default_managed_policies,
            self.configuration().get_managed_policies(),
        )
    }

    /// The recorded launch configuration nothing references, unless it is
    /// the one the spec asks for.
    pub(crate) fn unused_launch_configuration_name(&self) -> Option<String> {
        let desired = self.launch_configuration_name();
        self.discovered_state
            .get_leftover_launch_configuration()
            .map(|lc| lc.name.clone())
            .filter(|name| *name != desired)
    }

    // =========================================================================
    // State machine
    // =========================================================================

    /// Compare the desired spec with the discovered state.
    pub fn drift(&self) -> Drift {
        let state = &self.discovered_state;
        let Some(scaling_group) = state.get_scaling_group() else {
            return Drift {
                unused_launch_configuration: self.unused_launch_configuration_name().is_some(),
                ..Default::default()
            };
        };
        let eks = self.instance_group.eks_spec();

        let desired_lc = self.launch_configuration_name();
        let active_lc = scaling_group.launch_configuration_name.as_deref();

        let scaling_group_drift = scaling_group.min_size != eks.min_size
            || scaling_group.max_size != eks.max_size
            || !igm_common::string_slice_equals(
                &scaling_group.subnets,
                &eks.configuration.subnets,
            );

        let role_drift = match state.get_role() {
            // A missing external role cannot be fixed by an update
            None => !self.configuration().has_existing_role(),
            // Policies of roles we do not own are not ours to reconcile
            Some(role) if !role.managed => false,
            Some(role) => {
                let desired = self.get_managed_policies_list();
                !igm_common::string_slice_equal_fold(&role.role.attached_policies, &desired)
            }
        };

        let stale_instances = scaling_group
            .instances
            .iter()
            .filter(|i| i.launch_configuration_name.as_deref() != active_lc)
            .count() as u32;

        Drift {
            scaling_group: scaling_group_drift,
            launch_configuration: active_lc != Some(desired_lc.as_str()),
            role: role_drift,
            unused_launch_configuration: self.unused_launch_configuration_name().is_some(),
            stale_instances,
        }
    }

    /// Summarize the tick's inputs for the state machine.
    pub fn observe(&self) -> Observation {
        Observation {
            current: self.instance_group.state(),
            deletion_requested: self.instance_group.is_deleting(),
            has_scaling_group: self.discovered_state.has_scaling_group(),
            has_launch_configuration: self.discovered_state.has_launch_configuration()
                || self.discovered_state.has_leftover_launch_configuration(),
            has_role: self.discovered_state.has_role(),
            drift: self.drift(),
        }
    }

    /// The transition this tick should execute.
    pub fn next_transition(&self) -> Transition {
        state_machine::next_transition(&self.observe())
    }

    /// Record the steady state when no transition is needed.
    pub fn settle(&mut self) {
        let state = if self.instance_group.is_deleting() {
            ReconcileState::Deleted
        } else {
            ReconcileState::Active
        };
        self.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{LaunchConfiguration, ScalingGroup};
    use crate::mock::{MockAuthMapClient, MockAwsWorker};
    use igm_api::{EksSpec, NodeVolume};

    fn context_for(ig: &mut InstanceGroup) -> EksInstanceGroupContext<'_> {
        EksInstanceGroupContext::new(ProvisionerInput {
            aws_worker: Arc::new(MockAwsWorker::new()),
            kubernetes: Arc::new(MockAuthMapClient::new()),
            instance_group: ig,
            config: Arc::new(ProvisionerConfig {
                cluster_name: "prod".to_string(),
                ..Default::default()
            }),
            span: Span::none(),
        })
    }

    fn instance_group() -> InstanceGroup {
        let mut eks = EksSpec {
            min_size: 1,
            max_size: 3,
            ..Default::default()
        };
        eks.configuration.image = "ami-0123".to_string();
        eks.configuration.instance_type = "m5.large".to_string();
        eks.configuration.security_groups = vec!["sg-b".to_string(), "sg-a".to_string()];
        InstanceGroup::new("infra", "ng-1", eks)
    }

    #[test]
    fn test_resource_names() {
        let mut ig = instance_group();
        let ctx = context_for(&mut ig);
        assert_eq!(ctx.scaling_group_name(), "prod-infra-ng-1");
        assert_eq!(ctx.role_name(), "prod-infra-ng-1");
        assert!(ctx.launch_configuration_name().starts_with("prod-infra-ng-1-"));
        assert_eq!(
            ctx.launch_configuration_name().len(),
            "prod-infra-ng-1-".len() + LAUNCH_CONFIGURATION_HASH_LEN
        );
    }

    #[test]
    fn test_cluster_name_override() {
        let mut ig = instance_group();
        ig.spec.eks.configuration.cluster_name = Some("staging".to_string());
        let ctx = context_for(&mut ig);
        assert_eq!(ctx.scaling_group_name(), "staging-infra-ng-1");
    }

    #[test]
    fn test_existing_role_name_from_arn() {
        let mut ig = instance_group();
        ig.spec.eks.configuration.existing_role_name =
            Some("arn:aws:iam::123456789012:role/shared-nodes".to_string());
        let ctx = context_for(&mut ig);
        assert_eq!(ctx.role_name(), "shared-nodes");
        assert_eq!(ctx.desired_launch_spec().iam_instance_profile, "shared-nodes");
    }

    #[test]
    fn test_role_name_truncated() {
        let mut ig = instance_group();
        ig.metadata.name = "x".repeat(80);
        let ctx = context_for(&mut ig);
        assert_eq!(ctx.role_name().len(), MAX_ROLE_NAME_LEN);
    }

    #[test]
    fn test_truncated_role_names_stay_unique() {
        let mut first = instance_group();
        first.metadata.name = format!("{}-a", "x".repeat(80));
        let mut second = instance_group();
        second.metadata.name = format!("{}-b", "x".repeat(80));

        let first_role = context_for(&mut first).role_name();
        let second_role = context_for(&mut second).role_name();

        assert_ne!(first_role, second_role);
        assert_eq!(first_role.len(), MAX_ROLE_NAME_LEN);
        assert_eq!(second_role.len(), MAX_ROLE_NAME_LEN);
        assert!(first_role.starts_with("prod-infra-xxx"));
        // Stable across ticks
        assert_eq!(context_for(&mut first).role_name(), first_role);
    }

    #[test]
    fn test_launch_configuration_name_tracks_spec() {
        let mut ig = instance_group();
        let before = context_for(&mut ig).launch_configuration_name();

        // Reordering security groups does not change the launch spec
        ig.spec.eks.configuration.security_groups = vec!["sg-a".to_string(), "sg-b".to_string()];
        assert_eq!(context_for(&mut ig).launch_configuration_name(), before);

        ig.spec.eks.configuration.volumes = vec![NodeVolume {
            name: "/dev/xvda".to_string(),
            volume_type: "gp3".to_string(),
            size: 50,
        }];
        assert_ne!(context_for(&mut ig).launch_configuration_name(), before);

        // Scaling bounds are not part of the launch spec
        let with_volume = context_for(&mut ig).launch_configuration_name();
        ig.spec.eks.max_size = 10;
        assert_eq!(context_for(&mut ig).launch_configuration_name(), with_volume);
    }

    #[test]
    fn test_scaling_group_tags() {
        let mut ig = instance_group();
        ig.spec
            .eks
            .configuration
            .tags
            .insert("team".to_string(), "platform".to_string());
        let ctx = context_for(&mut ig);
        let tags = ctx.scaling_group_tags();
        assert_eq!(tags["team"], "platform");
        assert_eq!(tags[TAG_INSTANCE_GROUP_NAME], "ng-1");
        assert_eq!(tags[TAG_INSTANCE_GROUP_NAMESPACE], "infra");
        assert_eq!(tags["kubernetes.io/cluster/prod"], "owned");
        assert_eq!(tags[TAG_KUBERNETES_CLUSTER], "prod");
    }

    #[test]
    fn test_no_drift_without_scaling_group() {
        let mut ig = instance_group();
        let ctx = context_for(&mut ig);
        assert_eq!(ctx.drift(), Drift::default());
        assert_eq!(ctx.next_transition(), Transition::Create);
    }

    fn matching_scaling_group(ctx: &EksInstanceGroupContext<'_>) -> ScalingGroup {
        let eks = ctx.instance_group.eks_spec();
        ScalingGroup {
            name: ctx.scaling_group_name(),
            arn: "arn:asg".to_string(),
            min_size: eks.min_size,
            max_size: eks.max_size,
            desired_capacity: eks.min_size,
            launch_configuration_name: Some(ctx.launch_configuration_name()),
            subnets: eks.configuration.subnets.clone(),
            tags: BTreeMap::new(),
            instances: vec![],
        }
    }

    #[test]
    fn test_missing_managed_role_is_drift() {
        let mut ig = instance_group();
        let mut ctx = context_for(&mut ig);
        let scaling_group = matching_scaling_group(&ctx);
        ctx.set_discovered_state(DiscoveredState::new(Some(scaling_group), None, None));

        assert!(ctx.drift().role);
        assert_eq!(ctx.next_transition(), Transition::Update);
    }

    #[test]
    fn test_missing_existing_role_is_not_drift() {
        let mut ig = instance_group();
        ig.spec.eks.configuration.existing_role_name = Some("shared-nodes".to_string());
        let mut ctx = context_for(&mut ig);
        let scaling_group = matching_scaling_group(&ctx);
        ctx.set_discovered_state(DiscoveredState::new(Some(scaling_group), None, None));

        assert_eq!(ctx.drift(), Drift::default());
        assert_eq!(ctx.next_transition(), Transition::Noop);
    }

    #[test]
    fn test_unused_recorded_launch_configuration_is_drift() {
        let mut ig = instance_group();
        let mut ctx = context_for(&mut ig);
        let scaling_group = matching_scaling_group(&ctx);
        let mut leftover = LaunchConfiguration {
            name: "prod-infra-ng-1-000000000000".to_string(),
            arn: "arn:lc".to_string(),
            spec: ctx.desired_launch_spec(),
        };
        ctx.set_discovered_state(
            DiscoveredState::new(Some(scaling_group.clone()), None, None)
                .with_leftover_launch_configuration(Some(leftover.clone())),
        );
        assert!(ctx.drift().unused_launch_configuration);

        // The desired configuration is about to be used, not cleaned up
        leftover.name = ctx.launch_configuration_name();
        ctx.set_discovered_state(
            DiscoveredState::new(Some(scaling_group), None, None)
                .with_leftover_launch_configuration(Some(leftover)),
        );
        assert_eq!(ctx.unused_launch_configuration_name(), None);
    }
}
