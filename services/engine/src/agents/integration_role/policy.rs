//! IAM Policy Documents
//!
//! Typed builders for the three documents the reconciler writes: the role
//! trust policy, the default read-only inline policy, and the bucket read
//! policy. Documents are built as structs and serialized with `serde_json`,
//! so account IDs, external IDs and bucket names are always escaped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::ProviderError;

/// IAM policy language version
pub const POLICY_VERSION: &str = "2012-10-17";

/// Read-only actions granted by the default inline policy
pub const READ_ONLY_ACTIONS: &[&str] = &[
    "apigateway:GET",
    "codecommit:GetCommit",
    "codecommit:GetRepository",
    "codecommit:GetBranch",
    "codepipeline:ListTagsForResource",
    "codepipeline:GetPipeline",
    "ds:ListTagsForResource",
    "eks:ListNodegroups",
    "eks:DescribeFargateProfile",
    "eks:ListTagsForResource",
    "eks:ListAddons",
    "eks:DescribeAddon",
    "eks:ListFargateProfiles",
    "eks:DescribeNodegroup",
    "eks:DescribeIdentityProviderConfig",
    "eks:ListUpdates",
    "eks:DescribeUpdate",
    "eks:DescribeCluster",
    "eks:ListClusters",
    "eks:ListIdentityProviderConfigs",
    "elasticache:ListTagsForResource",
    "es:ListTags",
    "glacier:GetDataRetrievalPolicy",
    "glacier:ListJobs",
    "glacier:GetVaultAccessPolicy",
    "glacier:ListTagsForVault",
    "glacier:DescribeVault",
    "glacier:GetJobOutput",
    "glacier:GetVaultLock",
    "glacier:ListVaults",
    "glacier:GetVaultNotifications",
    "glacier:DescribeJob",
    "kinesis:DescribeStream",
    "logs:FilterLogEvents",
    "ram:ListResources",
    "ram:GetResourceShares",
    "secretsmanager:DescribeSecret",
    "servicecatalog:SearchProductsAsAdmin",
    "servicecatalog:DescribeProductAsAdmin",
    "servicecatalog:DescribePortfolio",
    "servicecatalog:DescribeServiceAction",
    "servicecatalog:DescribeProvisioningArtifact",
    "sns:ListTagsForResource",
    "sns:ListSubscriptionsByTopic",
    "sns:GetTopicAttributes",
    "sns:ListTopics",
    "sns:GetSubscriptionAttributes",
    "sqs:ListQueues",
    "sqs:GetQueueAttributes",
    "sqs:ListQueueTags",
    "ssm:ListCommandInvocations",
];

/// Statement effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// A single string or a list of strings, as IAM accepts for `Action`,
/// `Resource` and principal values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    /// Sorted, de-duplicated values, so `"a"` and `["a"]` compare equal.
    fn normalized(&self) -> Vec<String> {
        let mut values = match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        };
        values.sort();
        values.dedup();
        values
    }
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        OneOrMany::One(value.to_string())
    }
}

/// Statement principal. Only AWS account principals are used here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "AWS")]
    pub aws: OneOrMany,
}

/// Condition block: operator -> key -> value
pub type Condition = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    pub action: OneOrMany,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Statement {
    /// Structural equality that ignores singleton-vs-list and ordering.
    fn equivalent(&self, other: &Statement) -> bool {
        self.effect == other.effect
            && self.principal.as_ref().map(|p| p.aws.normalized())
                == other.principal.as_ref().map(|p| p.aws.normalized())
            && self.action.normalized() == other.action.normalized()
            && self.resource.as_ref().map(OneOrMany::normalized)
                == other.resource.as_ref().map(OneOrMany::normalized)
            && self.condition == other.condition
    }
}

/// An IAM policy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<Statement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    /// Serialize to the compact JSON sent to IAM
    pub fn to_json(&self) -> Result<String, ProviderError> {
        serde_json::to_string(self)
            .map_err(|e| ProviderError::Validation(format!("failed to serialize policy: {}", e)))
    }

    /// Parse a document returned by IAM
    pub fn from_json(json: &str) -> Result<Self, ProviderError> {
        serde_json::from_str(json)
            .map_err(|e| ProviderError::Validation(format!("failed to parse policy: {}", e)))
    }

    /// Whether a live document grants the same thing as this one.
    ///
    /// Unparseable documents never match.
    pub fn matches_json(&self, live: &str) -> bool {
        match Self::from_json(live) {
            Ok(other) => {
                self.version == other.version
                    && self.statement.len() == other.statement.len()
                    && self
                        .statement
                        .iter()
                        .zip(other.statement.iter())
                        .all(|(a, b)| a.equivalent(b))
            }
            Err(_) => false,
        }
    }
}

/// Trust policy letting the platform account assume the role when it
/// presents the external ID.
pub fn trust_policy(partition: &str, upt_account_id: &str, external_id: &str) -> PolicyDocument {
    let mut external_id_match = BTreeMap::new();
    external_id_match.insert("sts:ExternalId".to_string(), external_id.to_string());

    let mut condition = Condition::new();
    condition.insert("StringEquals".to_string(), external_id_match);

    PolicyDocument::new(vec![Statement {
        sid: None,
        effect: Effect::Allow,
        principal: Some(Principal {
            aws: OneOrMany::One(format!("arn:{}:iam::{}:root", partition, upt_account_id)),
        }),
        action: "sts:AssumeRole".into(),
        resource: None,
        condition: Some(condition),
    }])
}

/// Default inline policy: the fixed read-only action set on every resource.
pub fn default_read_only_policy() -> PolicyDocument {
    PolicyDocument::new(vec![Statement {
        sid: None,
        effect: Effect::Allow,
        principal: None,
        action: OneOrMany::Many(READ_ONLY_ACTIONS.iter().map(|a| a.to_string()).collect()),
        resource: Some("*".into()),
        condition: None,
    }])
}

/// Customer-managed policy allowing object reads from one bucket.
pub fn bucket_read_policy(partition: &str, bucket: &str) -> PolicyDocument {
    PolicyDocument::new(vec![Statement {
        sid: None,
        effect: Effect::Allow,
        principal: None,
        action: "s3:GetObject".into(),
        resource: Some(OneOrMany::One(format!("arn:{}:s3:::{}/*", partition, bucket))),
        condition: None,
    }])
}
