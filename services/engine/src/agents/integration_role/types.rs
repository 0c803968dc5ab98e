//! Types for the integration role reconciler
//!
//! Desired-state configuration, deterministic resource naming, and the
//! error taxonomy shared by the session provider and the reconciler.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Name of the inline read-only policy embedded in every integration role.
pub const INLINE_POLICY_NAME: &str = "UptycsReadOnlyPolicy";

/// Suffix appended to the integration name to form the bucket policy name.
pub const BUCKET_POLICY_SUFFIX: &str = "-BucketPolicy";

/// Role assumed in member accounts when no override is supplied.
pub const DEFAULT_ORG_ACCESS_ROLE: &str = "OrganizationAccountAccessRole";

/// Default AWS partition
pub const DEFAULT_PARTITION: &str = "aws";

/// Description attached to roles created by this engine
pub const ROLE_DESCRIPTION: &str = "CSPM integration role";

const MAX_ROLE_NAME_LEN: usize = 64;
const MIN_EXTERNAL_ID_LEN: usize = 2;
const MAX_EXTERNAL_ID_LEN: usize = 1224;

/// AWS-owned managed policies attached to every integration role.
///
/// These are attached and detached, never created or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AwsManagedPolicy {
    ViewOnlyAccess,
    SecurityAudit,
}

impl AwsManagedPolicy {
    /// Attachment order used by Converge.
    pub const ALL: [AwsManagedPolicy; 2] = [
        AwsManagedPolicy::ViewOnlyAccess,
        AwsManagedPolicy::SecurityAudit,
    ];

    /// Policy name as reported by `ListAttachedRolePolicies`
    pub fn name(&self) -> &'static str {
        match self {
            AwsManagedPolicy::ViewOnlyAccess => "ViewOnlyAccess",
            AwsManagedPolicy::SecurityAudit => "SecurityAudit",
        }
    }

    /// Policy ARN within the given partition
    pub fn arn(&self, partition: &str) -> String {
        match self {
            AwsManagedPolicy::ViewOnlyAccess => format!(
                "arn:{}:iam::aws:policy/job-function/ViewOnlyAccess",
                partition
            ),
            AwsManagedPolicy::SecurityAudit => {
                format!("arn:{}:iam::aws:policy/SecurityAudit", partition)
            }
        }
    }

    /// Look up a managed policy by its attached-policy name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl fmt::Display for AwsManagedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Deterministic name of the customer-managed bucket read policy.
pub fn bucket_policy_name(integration_name: &str) -> String {
    format!("{}{}", integration_name, BUCKET_POLICY_SUFFIX)
}

/// Deterministic ARN of the customer-managed bucket read policy.
pub fn bucket_policy_arn(partition: &str, account_id: &str, integration_name: &str) -> String {
    format!(
        "arn:{}:iam::{}:policy/{}",
        partition,
        account_id,
        bucket_policy_name(integration_name)
    )
}

/// Whether an attached policy name belongs to this engine's bucket policy.
pub fn is_bucket_policy_name(policy_name: &str) -> bool {
    policy_name.ends_with(BUCKET_POLICY_SUFFIX)
}

/// ARN of a role in the given account.
pub fn role_arn(partition: &str, account_id: &str, role_name: &str) -> String {
    format!("arn:{}:iam::{}:role/{}", partition, account_id, role_name)
}

/// Account to operate on and the role used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTarget {
    /// Target AWS account ID
    pub account_id: String,
    /// Assumable role override (default: `OrganizationAccountAccessRole`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    /// AWS partition (default: `aws`)
    #[serde(default = "default_partition")]
    pub partition: String,
}

fn default_partition() -> String {
    DEFAULT_PARTITION.to_string()
}

impl AccountTarget {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            role_name: None,
            partition: default_partition(),
        }
    }

    /// Override the role assumed in the target account. Blank names are ignored.
    pub fn with_role_name(mut self, role_name: Option<String>) -> Self {
        self.role_name = role_name.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Name of the role assumed in the target account
    pub fn assume_role_name(&self) -> &str {
        self.role_name.as_deref().unwrap_or(DEFAULT_ORG_ACCESS_ROLE)
    }

    /// ARN exchanged for temporary credentials
    pub fn assume_role_arn(&self) -> String {
        role_arn(&self.partition, &self.account_id, self.assume_role_name())
    }
}

/// A role as reported by `GetRole`/`CreateRole`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub name: String,
    pub arn: String,
    /// Decoded trust policy JSON, when the provider returned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_policy: Option<String>,
}

/// A managed policy attached to a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedPolicy {
    pub name: String,
    pub arn: String,
}

/// Bucket holding audit-log objects the integration role may read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTarget {
    pub name: String,
    pub region: String,
}

/// Desired state of one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Integration name, used as the role name
    pub integration_name: String,
    /// Account and access role to converge
    #[serde(flatten)]
    pub target: AccountTarget,
    /// Account ID of the platform principal allowed to assume the role
    pub upt_account_id: String,
    /// Shared secret required in the trust-policy condition
    pub external_id: String,
    /// Inline policy override; `None` or blank uses the default read-only document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_document: Option<String>,
    /// Optional audit-log bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<BucketTarget>,
    /// Set by callers that pre-deleted stale state; disables rollback
    #[serde(default)]
    pub is_update: bool,
}

impl IntegrationConfig {
    pub fn new(
        integration_name: impl Into<String>,
        target: AccountTarget,
        upt_account_id: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            integration_name: integration_name.into(),
            target,
            upt_account_id: upt_account_id.into(),
            external_id: external_id.into(),
            policy_document: None,
            bucket: None,
            is_update: false,
        }
    }

    pub fn with_policy_document(mut self, document: impl Into<String>) -> Self {
        self.policy_document = Some(document.into());
        self
    }

    pub fn with_bucket(mut self, name: impl Into<String>, region: impl Into<String>) -> Self {
        self.bucket = Some(BucketTarget {
            name: name.into(),
            region: region.into(),
        });
        self
    }

    pub fn for_update(mut self) -> Self {
        self.is_update = true;
        self
    }

    /// Inline policy override, if one was supplied.
    pub fn policy_override(&self) -> Option<&str> {
        self.policy_document
            .as_deref()
            .filter(|doc| !doc.trim().is_empty())
    }

    /// Check every field before any provider call is made.
    pub fn validate(&self) -> Result<(), ProviderError> {
        validate_role_name(&self.integration_name)?;
        validate_account_id("account_id", &self.target.account_id)?;
        validate_account_id("upt_account_id", &self.upt_account_id)?;
        validate_external_id(&self.external_id)?;

        if let Some(role) = &self.target.role_name {
            validate_role_name(role)?;
        }

        if let Some(bucket) = &self.bucket {
            if bucket.name.trim().is_empty() || bucket.region.trim().is_empty() {
                return Err(ProviderError::Validation(
                    "bucket name and bucket region must both be set".to_string(),
                ));
            }
        }

        if let Some(doc) = self.policy_override() {
            validate_policy_document(doc)?;
        }

        Ok(())
    }
}

fn is_iam_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '=' | ',' | '.' | '@' | '_' | '-')
}

/// IAM role names: 1-64 characters of `[A-Za-z0-9+=,.@_-]`.
pub fn validate_role_name(name: &str) -> Result<(), ProviderError> {
    if name.is_empty() || name.len() > MAX_ROLE_NAME_LEN || !name.chars().all(is_iam_name_char) {
        return Err(ProviderError::Validation(format!(
            "role name must be 1-{} characters of [A-Za-z0-9+=,.@_-]: {:?}",
            MAX_ROLE_NAME_LEN, name
        )));
    }
    Ok(())
}

/// AWS account IDs are exactly twelve digits.
pub fn validate_account_id(field: &str, account_id: &str) -> Result<(), ProviderError> {
    if account_id.len() != 12 || !account_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(ProviderError::Validation(format!(
            "{} must be a 12-digit AWS account ID: {:?}",
            field, account_id
        )));
    }
    Ok(())
}

pub fn validate_external_id(external_id: &str) -> Result<(), ProviderError> {
    let valid_chars = external_id
        .chars()
        .all(|c| is_iam_name_char(c) || c == ':' || c == '/');
    if external_id.len() < MIN_EXTERNAL_ID_LEN
        || external_id.len() > MAX_EXTERNAL_ID_LEN
        || !valid_chars
    {
        return Err(ProviderError::Validation(format!(
            "external_id must be {}-{} characters of [A-Za-z0-9+=,.@:/_-]",
            MIN_EXTERNAL_ID_LEN, MAX_EXTERNAL_ID_LEN
        )));
    }
    Ok(())
}

/// A policy override must be a JSON object with a `Statement` member.
pub fn validate_policy_document(document: &str) -> Result<(), ProviderError> {
    let value: serde_json::Value = serde_json::from_str(document)
        .map_err(|e| ProviderError::Validation(format!("policy document is not JSON: {}", e)))?;

    match value.as_object() {
        Some(obj) if obj.contains_key("Statement") => Ok(()),
        Some(_) => Err(ProviderError::Validation(
            "policy document has no Statement".to_string(),
        )),
        None => Err(ProviderError::Validation(
            "policy document must be a JSON object".to_string(),
        )),
    }
}

/// Errors raised by the session provider and account APIs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Credential resolution or role assumption failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Role, policy or bucket does not exist
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    ResourceExistsConflict(String),

    /// Resource cannot be deleted while something still references it
    #[error("Resource still in use: {0}")]
    DeleteConflict(String),

    /// Insufficient rights for the call
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed document or missing configuration
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Throttling, 5xx or transport failure
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Anything the provider did not classify
    #[error("Provider error: {0}")]
    Other(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Auth(_) => ErrorKind::Auth,
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::ResourceExistsConflict(_) => ErrorKind::Conflict,
            ProviderError::DeleteConflict(_) => ErrorKind::InUse,
            ProviderError::PermissionDenied(_) => ErrorKind::Permission,
            ProviderError::Validation(_) => ErrorKind::Validation,
            ProviderError::Transient(_) => ErrorKind::Transient,
            ProviderError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Coarse error classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    NotFound,
    Conflict,
    InUse,
    Permission,
    Validation,
    Transient,
    Other,
}

/// A reconciliation step, spelled as the IAM/S3 API it calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Authenticate,
    Validate,
    GetRole,
    CreateRole,
    ListAttachedRolePolicies,
    ListRolePolicies,
    PutRolePolicy,
    AttachRolePolicy,
    DetachRolePolicy,
    GetPolicy,
    CreatePolicy,
    DeletePolicy,
    DeleteRolePolicy,
    DeleteRole,
    HeadBucket,
    ListAccounts,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Authenticate => "Authenticate",
            Operation::Validate => "Validate",
            Operation::GetRole => "GetRole",
            Operation::CreateRole => "CreateRole",
            Operation::ListAttachedRolePolicies => "ListAttachedRolePolicies",
            Operation::ListRolePolicies => "ListRolePolicies",
            Operation::PutRolePolicy => "PutRolePolicy",
            Operation::AttachRolePolicy => "AttachRolePolicy",
            Operation::DetachRolePolicy => "DetachRolePolicy",
            Operation::GetPolicy => "GetPolicy",
            Operation::CreatePolicy => "CreatePolicy",
            Operation::DeletePolicy => "DeletePolicy",
            Operation::DeleteRolePolicy => "DeleteRolePolicy",
            Operation::DeleteRole => "DeleteRole",
            Operation::HeadBucket => "HeadBucket",
            Operation::ListAccounts => "ListAccounts",
        };
        write!(f, "{}", name)
    }
}

/// A failed reconciliation step, wrapped with its operation and integration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed for integration '{integration}': {source}")]
pub struct ReconcileError {
    pub operation: Operation,
    pub integration: String,
    #[source]
    pub source: ProviderError,
}

impl ReconcileError {
    pub fn new(operation: Operation, integration: impl Into<String>, source: ProviderError) -> Self {
        Self {
            operation,
            integration: integration.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn is_not_found(&self) -> bool {
        self.source.is_not_found()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IntegrationConfig {
        IntegrationConfig::new(
            "uptcloud",
            AccountTarget::new("123456789012"),
            "012345678912",
            "6a9375c1-47c0-470c-9217-d2f9d2d185f1",
        )
    }

    #[test]
    fn test_bucket_policy_naming_is_deterministic() {
        let first = bucket_policy_arn("aws", "123456789012", "uptcloud");
        let second = bucket_policy_arn("aws", "123456789012", "uptcloud");

        assert_eq!(first, second);
        assert_eq!(first, "arn:aws:iam::123456789012:policy/uptcloud-BucketPolicy");
        assert_eq!(bucket_policy_name("uptcloud"), "uptcloud-BucketPolicy");
        assert!(is_bucket_policy_name(&bucket_policy_name("uptcloud")));
        assert!(!is_bucket_policy_name("SecurityAudit"));
    }

    #[test]
    fn test_assume_role_arn_defaults_to_org_access_role() {
        let target = AccountTarget::new("123456789012");
        assert_eq!(
            target.assume_role_arn(),
            "arn:aws:iam::123456789012:role/OrganizationAccountAccessRole"
        );

        let target = target.with_role_name(Some("AuditAccess".to_string()));
        assert_eq!(
            target.assume_role_arn(),
            "arn:aws:iam::123456789012:role/AuditAccess"
        );

        let blank = AccountTarget::new("123456789012").with_role_name(Some("  ".to_string()));
        assert_eq!(blank.assume_role_name(), DEFAULT_ORG_ACCESS_ROLE);
    }

    #[test]
    fn test_managed_policy_arns() {
        assert_eq!(
            AwsManagedPolicy::ViewOnlyAccess.arn("aws"),
            "arn:aws:iam::aws:policy/job-function/ViewOnlyAccess"
        );
        assert_eq!(
            AwsManagedPolicy::SecurityAudit.arn("aws-us-gov"),
            "arn:aws-us-gov:iam::aws:policy/SecurityAudit"
        );
        assert_eq!(
            AwsManagedPolicy::from_name("SecurityAudit"),
            Some(AwsManagedPolicy::SecurityAudit)
        );
        assert_eq!(AwsManagedPolicy::from_name("AdministratorAccess"), None);
    }

    #[test]
    fn test_validate_accepts_well_formed_config() {
        assert!(config().validate().is_ok());
        assert!(config().with_bucket("audit-logs", "us-east-1").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut bad_account = config();
        bad_account.target.account_id = "12345".to_string();
        assert_eq!(bad_account.validate().unwrap_err().kind(), ErrorKind::Validation);

        let mut bad_name = config();
        bad_name.integration_name = "has spaces".to_string();
        assert!(bad_name.validate().is_err());

        let mut long_name = config();
        long_name.integration_name = "a".repeat(65);
        assert!(long_name.validate().is_err());

        let mut bad_external = config();
        bad_external.external_id = "x".to_string();
        assert!(bad_external.validate().is_err());

        let half_bucket = config().with_bucket("audit-logs", "");
        assert!(half_bucket.validate().is_err());
    }

    #[test]
    fn test_validate_policy_override() {
        assert!(config().with_policy_document("not json").validate().is_err());
        assert!(config().with_policy_document("[]").validate().is_err());
        assert!(config()
            .with_policy_document(r#"{"Version":"2012-10-17"}"#)
            .validate()
            .is_err());
        assert!(config()
            .with_policy_document(r#"{"Version":"2012-10-17","Statement":[]}"#)
            .validate()
            .is_ok());

        // blank override falls back to the default document
        let blank = config().with_policy_document("   ");
        assert!(blank.policy_override().is_none());
        assert!(blank.validate().is_ok());
    }

    #[test]
    fn test_reconcile_error_message_names_operation_and_integration() {
        let err = ReconcileError::new(
            Operation::AttachRolePolicy,
            "uptcloud",
            ProviderError::PermissionDenied("not authorized".to_string()),
        );

        let message = err.to_string();
        assert!(message.contains("AttachRolePolicy"));
        assert!(message.contains("uptcloud"));
        assert!(message.contains("not authorized"));
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_deserializes_with_flattened_target() {
        let json = r#"{
            "integration_name": "uptcloud",
            "account_id": "123456789012",
            "role_name": "AuditAccess",
            "upt_account_id": "012345678912",
            "external_id": "6a9375c1-47c0-470c-9217-d2f9d2d185f1",
            "bucket": {"name": "audit-logs", "region": "us-west-2"}
        }"#;

        let config: IntegrationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.target.partition, "aws");
        assert_eq!(config.target.assume_role_name(), "AuditAccess");
        assert!(!config.is_update);
        assert_eq!(config.bucket.unwrap().region, "us-west-2");
    }
}
