//! Resource Graph and Plans
//!
//! The integration topology is a small fixed graph: the role, its inline
//! policy, two AWS-managed attachments, the audit bucket and the bucket
//! policy. Every node depends on the role; the bucket policy also depends on
//! the bucket check. Plans are sorted by [`ResourceNode::rank`], which is a
//! linear extension of that partial order, so the call sequence follows from
//! the graph rather than from statement order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::types::{
    bucket_policy_arn, bucket_policy_name, is_bucket_policy_name, AttachedPolicy,
    AwsManagedPolicy, IntegrationConfig, INLINE_POLICY_NAME,
};

/// A resource in the integration topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceNode {
    Role,
    InlinePolicy,
    ManagedAttachment(AwsManagedPolicy),
    Bucket,
    BucketPolicy,
}

impl ResourceNode {
    /// Direct predecessors of this node
    pub fn depends_on(&self) -> &'static [ResourceNode] {
        match self {
            ResourceNode::Role => &[],
            ResourceNode::InlinePolicy
            | ResourceNode::ManagedAttachment(_)
            | ResourceNode::Bucket => &[ResourceNode::Role],
            ResourceNode::BucketPolicy => &[ResourceNode::Role, ResourceNode::Bucket],
        }
    }

    /// Position in the converge order. Strictly greater than every dependency.
    pub fn rank(&self) -> u8 {
        match self {
            ResourceNode::Role => 0,
            ResourceNode::InlinePolicy => 1,
            ResourceNode::ManagedAttachment(AwsManagedPolicy::ViewOnlyAccess) => 2,
            ResourceNode::ManagedAttachment(AwsManagedPolicy::SecurityAudit) => 3,
            ResourceNode::Bucket => 4,
            ResourceNode::BucketPolicy => 5,
        }
    }
}

/// Policies currently on a role, from the two list calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
    /// Attached managed policies, ARN -> name. Names are not unique.
    pub attached: BTreeMap<String, String>,
    /// Inline policy names
    pub inline: BTreeSet<String>,
}

impl LiveState {
    pub fn from_listings(attached: Vec<AttachedPolicy>, inline: Vec<String>) -> Self {
        Self {
            attached: attached.into_iter().map(|p| (p.arn, p.name)).collect(),
            inline: inline.into_iter().collect(),
        }
    }

    pub fn has_attached_arn(&self, arn: &str) -> bool {
        self.attached.contains_key(arn)
    }

    pub fn has_inline(&self, name: &str) -> bool {
        self.inline.contains(name)
    }
}

/// One step of a converge plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ConvergeStep {
    /// Write the inline read-only (or override) policy
    PutInlinePolicy,
    /// Attach an AWS-managed policy
    AttachManagedPolicy { policy: AwsManagedPolicy },
    /// Existence check against the bucket, from a client in its region
    CheckBucket { bucket: String, region: String },
    /// Get-or-create the bucket policy, then attach it
    EnsureBucketPolicy {
        policy_name: String,
        policy_arn: String,
        bucket: String,
    },
}

impl ConvergeStep {
    pub fn node(&self) -> ResourceNode {
        match self {
            ConvergeStep::PutInlinePolicy => ResourceNode::InlinePolicy,
            ConvergeStep::AttachManagedPolicy { policy } => ResourceNode::ManagedAttachment(*policy),
            ConvergeStep::CheckBucket { .. } => ResourceNode::Bucket,
            ConvergeStep::EnsureBucketPolicy { .. } => ResourceNode::BucketPolicy,
        }
    }

    /// Whether executing the step writes to the account
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ConvergeStep::CheckBucket { .. })
    }
}

impl fmt::Display for ConvergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergeStep::PutInlinePolicy => write!(f, "put inline policy {}", INLINE_POLICY_NAME),
            ConvergeStep::AttachManagedPolicy { policy } => write!(f, "attach {}", policy),
            ConvergeStep::CheckBucket { bucket, region } => {
                write!(f, "check bucket {} ({})", bucket, region)
            }
            ConvergeStep::EnsureBucketPolicy { policy_name, .. } => {
                write!(f, "ensure and attach {}", policy_name)
            }
        }
    }
}

/// Steps needed to bring an existing role to the desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergePlan {
    pub steps: Vec<ConvergeStep>,
}

impl ConvergePlan {
    /// Diff desired against live state. Only missing nodes produce steps.
    pub fn diff(config: &IntegrationConfig, live: &LiveState) -> Self {
        let partition = &config.target.partition;
        let mut steps = Vec::new();

        if !live.has_inline(INLINE_POLICY_NAME) {
            steps.push(ConvergeStep::PutInlinePolicy);
        }

        for policy in AwsManagedPolicy::ALL {
            if !live.has_attached_arn(&policy.arn(partition)) {
                steps.push(ConvergeStep::AttachManagedPolicy { policy });
            }
        }

        if let Some(bucket) = &config.bucket {
            steps.push(ConvergeStep::CheckBucket {
                bucket: bucket.name.clone(),
                region: bucket.region.clone(),
            });

            let policy_arn = bucket_policy_arn(
                partition,
                &config.target.account_id,
                &config.integration_name,
            );
            if !live.has_attached_arn(&policy_arn) {
                steps.push(ConvergeStep::EnsureBucketPolicy {
                    policy_name: bucket_policy_name(&config.integration_name),
                    policy_arn,
                    bucket: bucket.name.clone(),
                });
            }
        }

        steps.sort_by_key(|s| s.node().rank());
        debug_assert!(respects_dependencies(steps.iter().map(ConvergeStep::node)));

        Self { steps }
    }

    /// True when no step would write to the account
    pub fn is_converged(&self) -> bool {
        !self.steps.iter().any(ConvergeStep::is_mutating)
    }
}

/// Every node appears after the nodes it depends on, where those are present.
fn respects_dependencies(nodes: impl Iterator<Item = ResourceNode>) -> bool {
    let ordered: Vec<ResourceNode> = nodes.collect();
    ordered.iter().enumerate().all(|(i, node)| {
        node.depends_on().iter().all(|dep| {
            ordered
                .iter()
                .position(|n| n == dep)
                .map_or(true, |pos| pos < i)
        })
    })
}

/// One step of a teardown plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TeardownStep {
    /// Detach an AWS-owned policy, leaving it in place
    DetachPolicy { name: String, arn: String },
    /// Detach and delete the customer-managed bucket policy
    DetachAndDeletePolicy { name: String, arn: String },
    DeleteInlinePolicy { name: String },
    DeleteRole,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::DetachPolicy { name, .. } => write!(f, "detach {}", name),
            TeardownStep::DetachAndDeletePolicy { name, .. } => {
                write!(f, "detach and delete {}", name)
            }
            TeardownStep::DeleteInlinePolicy { name } => write!(f, "delete inline policy {}", name),
            TeardownStep::DeleteRole => write!(f, "delete role"),
        }
    }
}

/// Ordered teardown of a role and everything this engine attached to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownPlan {
    pub steps: Vec<TeardownStep>,
    /// Attached policies this engine does not own; left in place
    pub retained: Vec<AttachedPolicy>,
}

impl TeardownPlan {
    /// Classify live attachments. `DeleteRole` is always the final step.
    pub fn from_live(live: &LiveState) -> Self {
        let mut steps = Vec::new();
        let mut retained = Vec::new();

        for (arn, name) in &live.attached {
            if is_bucket_policy_name(name) {
                steps.push(TeardownStep::DetachAndDeletePolicy {
                    name: name.clone(),
                    arn: arn.clone(),
                });
            } else if AwsManagedPolicy::from_name(name).is_some() {
                steps.push(TeardownStep::DetachPolicy {
                    name: name.clone(),
                    arn: arn.clone(),
                });
            } else {
                retained.push(AttachedPolicy {
                    name: name.clone(),
                    arn: arn.clone(),
                });
            }
        }

        if live.has_inline(INLINE_POLICY_NAME) {
            steps.push(TeardownStep::DeleteInlinePolicy {
                name: INLINE_POLICY_NAME.to_string(),
            });
        }

        steps.push(TeardownStep::DeleteRole);

        Self { steps, retained }
    }
}
