//! Delete transition tests against the in-memory clients.
//!
//! Covers ordering, cleanup of the aws-auth entry, role ownership and
//! idempotent resumption of a partially completed delete.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use igm_api::{EksSpec, InstanceGroup, ReconcileState};
use igm_provisioner::aws::{
    AwsError, IamRole, InstanceLifecycle, LaunchConfiguration, LaunchSpec, ScalingGroup,
    ScalingInstance,
};
use igm_provisioner::eks::{
    DiscoveredRole, DiscoveredState, EksInstanceGroupContext, TAG_INSTANCE_GROUP_NAME,
    TAG_INSTANCE_GROUP_NAMESPACE,
};
use igm_provisioner::kubernetes::{KubeError, RetryPolicy, RoleMapping};
use igm_provisioner::mock::{AwsCall, AwsOperation, MockAuthMapClient, MockAwsWorker};
use igm_provisioner::{ProvisionerConfig, ProvisionerInput};
use tracing::Span;

const P1: &str = "arn:aws:iam::aws:policy/P1";
const P2: &str = "arn:aws:iam::aws:policy/P2";

/// ng-1 with scaling group `ng-1-asg`, launch configuration `ng-1-lc` and
/// managed role `ng-1-role` carrying policies P1 and P2.
struct Fixture {
    aws: Arc<MockAwsWorker>,
    kube: Arc<MockAuthMapClient>,
    ig: InstanceGroup,
    state: DiscoveredState,
}

fn launch_spec() -> LaunchSpec {
    LaunchSpec {
        image_id: "ami-0123".to_string(),
        instance_type: "m5.large".to_string(),
        iam_instance_profile: "ng-1-role".to_string(),
        security_groups: vec!["sg-1".to_string()],
        key_name: None,
        user_data: String::new(),
        block_devices: vec![],
    }
}

fn role_arn() -> String {
    MockAwsWorker::role_arn("ng-1-role")
}

impl Fixture {
    fn new() -> Self {
        let scaling_group = ScalingGroup {
            name: "ng-1-asg".to_string(),
            arn: "arn:aws:autoscaling:us-west-2:123456789012:autoScalingGroup:ng-1-asg"
                .to_string(),
            min_size: 1,
            max_size: 3,
            desired_capacity: 1,
            launch_configuration_name: Some("ng-1-lc".to_string()),
            subnets: vec!["subnet-1".to_string()],
            tags: BTreeMap::new(),
            instances: vec![ScalingInstance {
                instance_id: "i-0000000000000001".to_string(),
                launch_configuration_name: Some("ng-1-lc".to_string()),
                lifecycle_state: InstanceLifecycle::InService,
                healthy: true,
            }],
        };
        let launch_configuration = LaunchConfiguration {
            name: "ng-1-lc".to_string(),
            arn: "arn:aws:autoscaling:us-west-2:123456789012:launchConfiguration:ng-1-lc"
                .to_string(),
            spec: launch_spec(),
        };
        let role = IamRole {
            name: "ng-1-role".to_string(),
            arn: role_arn(),
            instance_profile_arn: None,
            attached_policies: vec![P1.to_string(), P2.to_string()],
            tags: BTreeMap::from([
                (TAG_INSTANCE_GROUP_NAME.to_string(), "ng-1".to_string()),
                (TAG_INSTANCE_GROUP_NAMESPACE.to_string(), "default".to_string()),
            ]),
        };

        let aws = Arc::new(MockAwsWorker::new());
        aws.insert_scaling_group(scaling_group.clone());
        aws.insert_launch_configuration(launch_configuration.clone());
        aws.insert_role(role.clone());

        let kube = Arc::new(MockAuthMapClient::with_mappings(vec![
            RoleMapping::node(role_arn()),
            RoleMapping::node(MockAwsWorker::role_arn("other-group")),
        ]));

        let mut ig = InstanceGroup::new("default", "ng-1", EksSpec::default());
        ig.request_deletion(Utc::now());
        ig.set_state(ReconcileState::Active);

        Self {
            aws,
            kube,
            ig,
            state: DiscoveredState::new(
                Some(scaling_group),
                Some(launch_configuration),
                Some(DiscoveredRole {
                    role,
                    managed: true,
                }),
            ),
        }
    }

    fn context(&mut self) -> EksInstanceGroupContext<'_> {
        let mut ctx = EksInstanceGroupContext::new(ProvisionerInput {
            aws_worker: self.aws.clone(),
            kubernetes: self.kube.clone(),
            instance_group: &mut self.ig,
            config: Arc::new(ProvisionerConfig {
                cluster_name: "c".to_string(),
                default_managed_policies: vec!["P1".to_string(), "P2".to_string()],
                auth_map_retry: RetryPolicy {
                    max_attempts: 3,
                    backoff: std::time::Duration::from_millis(1),
                },
                ..Default::default()
            }),
            span: Span::none(),
        });
        ctx.set_discovered_state(self.state.clone());
        ctx
    }

    fn forget(&mut self) {
        self.state = DiscoveredState::default();
    }
}

#[tokio::test]
async fn test_delete_end_to_end() {
    let mut f = Fixture::new();

    f.context().delete().await.unwrap();

    assert_eq!(
        f.aws.mutations(),
        vec![
            AwsCall::DeleteScalingGroup("ng-1-asg".to_string()),
            AwsCall::DeleteLaunchConfiguration("ng-1-lc".to_string()),
            AwsCall::DeleteRole(
                "ng-1-role".to_string(),
                vec![P1.to_string(), P2.to_string()]
            ),
        ]
    );
    assert!(f.aws.scaling_group("ng-1-asg").is_none());
    assert!(f.aws.launch_configuration("ng-1-lc").is_none());
    assert!(f.aws.role("ng-1-role").is_none());
    assert!(!f.kube.contains(&role_arn()));
    assert!(f.kube.contains(&MockAwsWorker::role_arn("other-group")));
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}

#[tokio::test]
async fn test_delete_twice_is_idempotent() {
    let mut f = Fixture::new();
    f.context().delete().await.unwrap();

    // The second call sees a converged, empty footprint
    f.forget();
    f.aws.clear_calls();
    let replaces = f.kube.replace_count();
    f.context().delete().await.unwrap();

    assert!(f.aws.mutations().is_empty());
    assert_eq!(f.kube.replace_count(), replaces);
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}

#[tokio::test]
async fn test_scaling_group_failure_touches_nothing_downstream() {
    let mut f = Fixture::new();
    f.aws.fail(
        AwsOperation::DeleteScalingGroup,
        AwsError::ResourceInUse {
            resource: "scaling group",
            name: "ng-1-asg".to_string(),
        },
    );

    let err = f.context().delete().await.unwrap_err();

    assert_eq!(err.context(), Some("failed to delete scaling group"));
    assert_eq!(
        f.aws.mutations(),
        vec![AwsCall::DeleteScalingGroup("ng-1-asg".to_string())]
    );
    assert_eq!(f.kube.get_count(), 0);
    assert_eq!(f.kube.replace_count(), 0);
    assert!(f.kube.contains(&role_arn()));
    assert_eq!(f.ig.state(), ReconcileState::Deleting);
}

#[tokio::test]
async fn test_launch_configuration_failure_still_revokes_trust() {
    let mut f = Fixture::new();
    f.aws.fail(
        AwsOperation::DeleteLaunchConfiguration,
        AwsError::Throttled("DeleteLaunchConfiguration".to_string()),
    );

    let err = f.context().delete().await.unwrap_err();

    assert_eq!(err.context(), Some("failed to delete launch configuration"));
    assert_eq!(f.kube.replace_count(), 1);
    assert!(!f.kube.contains(&role_arn()));
    // The role outlives the failed step
    assert!(f.aws.role("ng-1-role").is_some());
    assert!(!f
        .aws
        .mutations()
        .iter()
        .any(|c| matches!(c, AwsCall::DeleteRole(..))));
    assert_eq!(f.ig.state(), ReconcileState::Deleting);
}

#[tokio::test]
async fn test_role_failure_is_reported_after_revoke() {
    let mut f = Fixture::new();
    f.aws.fail(
        AwsOperation::DeleteRole,
        AwsError::Api {
            code: "DeleteConflict".to_string(),
            message: "instance profile still attached".to_string(),
        },
    );

    let err = f.context().delete().await.unwrap_err();

    assert_eq!(err.context(), Some("failed to delete scaling group role"));
    assert!(!f.kube.contains(&role_arn()));
    assert!(f.aws.launch_configuration("ng-1-lc").is_none());
}

#[tokio::test]
async fn test_revoke_failure_does_not_stop_cleanup() {
    let mut f = Fixture::new();
    f.kube.fail(Some(KubeError::Api("forbidden".to_string())));

    let err = f.context().delete().await.unwrap_err();

    assert_eq!(err.context(), Some("failed to remove role from aws-auth"));
    assert!(f.aws.launch_configuration("ng-1-lc").is_none());
    assert!(f.aws.role("ng-1-role").is_none());
    assert_eq!(f.ig.state(), ReconcileState::Deleting);
}

#[tokio::test]
async fn test_revoke_retried_from_recorded_arn() {
    let mut f = Fixture::new();
    f.ig.status.node_role_arn = Some(role_arn());
    f.kube.fail(Some(KubeError::Api("forbidden".to_string())));
    f.context().delete().await.unwrap_err();

    // Everything in the cloud is gone; only the status remembers the role
    f.kube.fail(None);
    f.forget();
    f.context().delete().await.unwrap();

    assert!(!f.kube.contains(&role_arn()));
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}

#[tokio::test]
async fn test_existing_role_is_never_deleted() {
    let mut f = Fixture::new();
    f.ig.spec.eks.configuration.existing_role_name = Some("ng-1-role".to_string());

    f.context().delete_managed_role().await.unwrap();
    f.context().delete().await.unwrap();

    assert!(!f
        .aws
        .calls()
        .iter()
        .any(|c| matches!(c, AwsCall::DeleteRole(..))));
    assert!(f.aws.role("ng-1-role").is_some());
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}

#[tokio::test]
async fn test_untagged_role_is_never_deleted() {
    let mut f = Fixture::new();
    if let Some(role) = f.state.get_role().cloned() {
        f.state = DiscoveredState::new(
            f.state.get_scaling_group().cloned(),
            f.state.get_launch_configuration().cloned(),
            Some(DiscoveredRole {
                managed: false,
                ..role
            }),
        );
    }

    f.context().delete().await.unwrap();

    assert!(f.aws.role("ng-1-role").is_some());
    // Its trust entry may belong to whoever does own it
    assert!(f.kube.contains(&role_arn()));
    assert_eq!(f.kube.replace_count(), 0);
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}

#[tokio::test]
async fn test_leftover_launch_configuration_is_deleted() {
    let mut f = Fixture::new();
    let leftover = LaunchConfiguration {
        name: "ng-1-lc-old".to_string(),
        arn: "arn:aws:autoscaling:us-west-2:123456789012:launchConfiguration:ng-1-lc-old"
            .to_string(),
        spec: launch_spec(),
    };
    f.aws.insert_launch_configuration(leftover.clone());
    f.state = f
        .state
        .clone()
        .with_leftover_launch_configuration(Some(leftover));

    f.context().delete().await.unwrap();

    assert!(f.aws.launch_configuration_names().is_empty());
    assert!(f
        .aws
        .mutations()
        .contains(&AwsCall::DeleteLaunchConfiguration("ng-1-lc-old".to_string())));
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}

#[tokio::test]
async fn test_absent_resources_make_no_mutations() {
    let mut f = Fixture::new();
    f.forget();

    f.context().delete().await.unwrap();

    assert!(f.aws.calls().is_empty());
    // Nothing to revoke either
    assert_eq!(f.kube.replace_count(), 0);
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}

#[tokio::test]
async fn test_not_found_is_success() {
    let mut f = Fixture::new();
    // The cloud lost everything between discovery and delete
    let fresh = MockAwsWorker::new();
    fresh.surface_not_found(true);
    f.aws = Arc::new(fresh);

    f.context().delete().await.unwrap();

    assert_eq!(f.aws.mutations().len(), 3);
    assert!(!f.kube.contains(&role_arn()));
    assert_eq!(f.ig.state(), ReconcileState::Deleted);
}
