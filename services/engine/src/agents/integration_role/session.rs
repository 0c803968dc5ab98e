//! Cross-Account Sessions
//!
//! Exchanges default credentials for a bounded-lifetime session in the
//! target account via STS AssumeRole, and exposes the resulting IAM/S3
//! capability to the reconciler through the [`AccountApi`] trait.

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::{future, ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sdk_iam::error::DisplayErrorContext;
use std::env;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use uuid::Uuid;

use super::aws::{organization_has_account, AwsAccountClient};
use super::types::{AccountTarget, AttachedPolicy, ProviderError, RoleInfo, DEFAULT_PARTITION};

/// Lifetime of assumed-role sessions
pub const SESSION_DURATION: Duration = Duration::from_secs(60 * 60);

/// Region used for IAM, which is a global service
pub const GLOBAL_REGION: &str = "aws-global";

/// STS limits role session names to 64 characters
const MAX_SESSION_NAME_LEN: usize = 64;

/// Primed credentials are handed out until this close to expiry
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// IAM and S3 calls the reconciler makes against one account.
///
/// Implementations return [`ProviderError::NotFound`] for absent roles,
/// policies and buckets so callers can branch on it.
#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn get_role(&self, role_name: &str) -> Result<RoleInfo, ProviderError>;

    async fn create_role(
        &self,
        role_name: &str,
        trust_policy: &str,
        description: &str,
    ) -> Result<RoleInfo, ProviderError>;

    async fn delete_role(&self, role_name: &str) -> Result<(), ProviderError>;

    async fn list_attached_role_policies(
        &self,
        role_name: &str,
    ) -> Result<Vec<AttachedPolicy>, ProviderError>;

    async fn list_role_policies(&self, role_name: &str) -> Result<Vec<String>, ProviderError>;

    /// Create or replace an inline policy
    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ProviderError>;

    async fn delete_role_policy(&self, role_name: &str, policy_name: &str)
        -> Result<(), ProviderError>;

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str)
        -> Result<(), ProviderError>;

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str)
        -> Result<(), ProviderError>;

    /// Check that a managed policy exists
    async fn get_policy(&self, policy_arn: &str) -> Result<(), ProviderError>;

    /// Create a customer-managed policy, returning its ARN
    async fn create_policy(
        &self,
        policy_name: &str,
        document: &str,
        description: &str,
    ) -> Result<String, ProviderError>;

    async fn delete_policy(&self, policy_arn: &str) -> Result<(), ProviderError>;

    /// Check that a bucket exists and is reachable
    async fn head_bucket(&self, bucket: &str) -> Result<(), ProviderError>;
}

/// Produces authenticated account clients
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Authenticate against `target` with clients scoped to `region`.
    async fn authenticate(
        &self,
        target: &AccountTarget,
        region: &str,
    ) -> Result<Arc<dyn AccountApi>, ProviderError>;

    /// Whether `account_id` is still a member of the source organization.
    async fn account_in_organization(&self, account_id: &str) -> Result<bool, ProviderError>;
}

/// Session settings for the source principal
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shared-config profile for the source credentials
    pub profile: Option<String>,
    /// Region for IAM clients
    pub iam_region: String,
    /// AWS partition for generated ARNs
    pub partition: String,
    /// Prefix for assume-role session names
    pub session_name_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: None,
            iam_region: GLOBAL_REGION.to_string(),
            partition: DEFAULT_PARTITION.to_string(),
            session_name_prefix: "cspm-integration".to_string(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables
    ///
    /// - AWS_PROFILE (optional)
    /// - CSPM_IAM_REGION (default: aws-global)
    /// - CSPM_PARTITION (default: aws)
    /// - CSPM_SESSION_NAME_PREFIX (default: cspm-integration)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            profile: env::var("AWS_PROFILE").ok().filter(|p| !p.is_empty()),
            iam_region: env::var("CSPM_IAM_REGION").unwrap_or(defaults.iam_region),
            partition: env::var("CSPM_PARTITION").unwrap_or(defaults.partition),
            session_name_prefix: env::var("CSPM_SESSION_NAME_PREFIX")
                .unwrap_or(defaults.session_name_prefix),
        }
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        if profile.is_some() {
            self.profile = profile;
        }
        self
    }

    /// Unique, length-bounded assume-role session name
    pub fn session_name(&self) -> String {
        let mut name = format!("{}-{}", self.session_name_prefix, Uuid::new_v4().simple());
        name.truncate(MAX_SESSION_NAME_LEN);
        name
    }
}

/// Session provider backed by STS AssumeRole
pub struct AwsSessionProvider {
    config: SessionConfig,
}

impl AwsSessionProvider {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolve default credentials for the source principal
    async fn source_config(&self, region: &str) -> SdkConfig {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));

        if let Some(profile) = &self.config.profile {
            loader = loader.profile_name(profile);
        }

        loader.load().await
    }
}

fn require_credentials(source: &SdkConfig) -> Result<(), ProviderError> {
    match source.credentials_provider() {
        Some(_) => Ok(()),
        None => Err(ProviderError::Auth(
            "no default credentials available for the source principal".to_string(),
        )),
    }
}

/// Credentials resolved during authentication, reused until near expiry
/// before falling back to the assume-role provider.
#[derive(Debug)]
struct PrimedCredentials {
    primed: Credentials,
    inner: SharedCredentialsProvider,
}

impl PrimedCredentials {
    fn is_fresh(&self, now: SystemTime) -> bool {
        match self.primed.expiry() {
            Some(expiry) => expiry > now + REFRESH_MARGIN,
            None => true,
        }
    }
}

impl ProvideCredentials for PrimedCredentials {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        if self.is_fresh(SystemTime::now()) {
            future::ProvideCredentials::ready(Ok(self.primed.clone()))
        } else {
            self.inner.provide_credentials()
        }
    }
}

#[async_trait]
impl SessionProvider for AwsSessionProvider {
    async fn authenticate(
        &self,
        target: &AccountTarget,
        region: &str,
    ) -> Result<Arc<dyn AccountApi>, ProviderError> {
        let source = self.source_config(region).await;
        require_credentials(&source)?;

        let role_arn = target.assume_role_arn();
        debug!(role_arn = %role_arn, region = %region, "Assuming role");

        let assume_role = AssumeRoleProvider::builder(role_arn.clone())
            .session_name(self.config.session_name())
            .session_length(SESSION_DURATION)
            .configure(&source)
            .build()
            .await;

        let assumed = SharedCredentialsProvider::new(assume_role);

        // Resolve once so trust and permission failures surface here
        let resolved = assumed.provide_credentials().await.map_err(|e| {
            ProviderError::Auth(format!(
                "failed to assume {}: {}",
                role_arn,
                DisplayErrorContext(&e)
            ))
        })?;

        info!(
            account_id = %target.account_id,
            role = %target.assume_role_name(),
            region = %region,
            "Authenticated cross-account session"
        );

        let credentials = SharedCredentialsProvider::new(PrimedCredentials {
            primed: resolved,
            inner: assumed,
        });

        Ok(Arc::new(AwsAccountClient::new(&source, credentials)))
    }

    async fn account_in_organization(&self, account_id: &str) -> Result<bool, ProviderError> {
        let source = self.source_config(&self.config.iam_region).await;
        require_credentials(&source)?;

        let client = aws_sdk_organizations::Client::new(&source);
        let member = organization_has_account(&client, account_id).await?;
        debug!(account_id = %account_id, member, "Checked organization membership");
        Ok(member)
    }
}
