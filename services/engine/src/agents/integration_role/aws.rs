//! AWS IAM, S3 and Organizations Adapter
//!
//! [`AccountApi`] over the official SDK clients. SDK errors are mapped onto
//! the [`ProviderError`] taxonomy by service error code, falling back to the
//! HTTP status when the service sent no code (S3 `HeadBucket`).

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_iam::config::http::HttpResponse;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use tracing::debug;

use super::session::AccountApi;
use super::types::{AttachedPolicy, ProviderError, RoleInfo};

/// Account client holding IAM and S3 clients that share one credential cache
pub struct AwsAccountClient {
    iam: aws_sdk_iam::Client,
    s3: aws_sdk_s3::Client,
}

impl AwsAccountClient {
    /// Build clients from the source config, replacing its credentials with
    /// the assumed-role provider.
    pub fn new(source: &SdkConfig, credentials: SharedCredentialsProvider) -> Self {
        let iam_config = aws_sdk_iam::config::Builder::from(source)
            .credentials_provider(credentials.clone())
            .build();
        let s3_config = aws_sdk_s3::config::Builder::from(source)
            .credentials_provider(credentials)
            .build();

        Self {
            iam: aws_sdk_iam::Client::from_conf(iam_config),
            s3: aws_sdk_s3::Client::from_conf(s3_config),
        }
    }
}

/// Map an SDK error onto the provider taxonomy
fn classify<E>(err: SdkError<E, HttpResponse>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return ProviderError::Transient(message)
        }
        SdkError::ConstructionFailure(_) => return ProviderError::Validation(message),
        _ => {}
    }

    let status = err.raw_response().map(|r| r.status().as_u16());
    classify_code(err.code(), status, message)
}

/// Classification by service error code, then HTTP status.
fn classify_code(code: Option<&str>, status: Option<u16>, message: String) -> ProviderError {
    match code {
        Some("NoSuchEntity" | "NotFound" | "NoSuchBucket") => ProviderError::NotFound(message),
        Some("EntityAlreadyExists") => ProviderError::ResourceExistsConflict(message),
        Some("DeleteConflict") => ProviderError::DeleteConflict(message),
        Some(
            "ExpiredToken" | "ExpiredTokenException" | "InvalidClientTokenId"
            | "UnrecognizedClientException",
        ) => ProviderError::Auth(message),
        Some("AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" | "Forbidden") => {
            ProviderError::PermissionDenied(message)
        }
        Some("MalformedPolicyDocument" | "InvalidInput" | "ValidationError" | "LimitExceeded") => {
            ProviderError::Validation(message)
        }
        Some(
            "Throttling" | "ThrottlingException" | "RequestLimitExceeded" | "SlowDown"
            | "ServiceFailure" | "ServiceUnavailable" | "InternalError"
            | "ConcurrentModification",
        ) => ProviderError::Transient(message),
        _ => match status {
            Some(404) => ProviderError::NotFound(message),
            Some(401) | Some(403) => ProviderError::PermissionDenied(message),
            Some(409) => ProviderError::ResourceExistsConflict(message),
            Some(429) | Some(500..=599) => ProviderError::Transient(message),
            _ => ProviderError::Other(message),
        },
    }
}

/// Whether `account_id` is listed in the caller's organization
pub(crate) async fn organization_has_account(
    client: &aws_sdk_organizations::Client,
    account_id: &str,
) -> Result<bool, ProviderError> {
    let mut next_token: Option<String> = None;

    loop {
        let out = client
            .list_accounts()
            .set_next_token(next_token.take())
            .send()
            .await
            .map_err(classify)?;

        if out.accounts().iter().any(|a| a.id() == Some(account_id)) {
            return Ok(true);
        }

        match out.next_token() {
            Some(next) => next_token = Some(next.to_string()),
            None => return Ok(false),
        }
    }
}

fn decode_policy(encoded: &str) -> String {
    urlencoding::decode(encoded)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| encoded.to_string())
}

fn role_info(role: &aws_sdk_iam::types::Role) -> RoleInfo {
    RoleInfo {
        name: role.role_name().to_string(),
        arn: role.arn().to_string(),
        trust_policy: role.assume_role_policy_document().map(decode_policy),
    }
}

#[async_trait]
impl AccountApi for AwsAccountClient {
    async fn get_role(&self, role_name: &str) -> Result<RoleInfo, ProviderError> {
        let out = self
            .iam
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(classify)?;

        out.role()
            .map(role_info)
            .ok_or_else(|| ProviderError::Other(format!("GetRole returned no role for {}", role_name)))
    }

    async fn create_role(
        &self,
        role_name: &str,
        trust_policy: &str,
        description: &str,
    ) -> Result<RoleInfo, ProviderError> {
        let out = self
            .iam
            .create_role()
            .role_name(role_name)
            .assume_role_policy_document(trust_policy)
            .description(description)
            .send()
            .await
            .map_err(classify)?;

        out.role().map(role_info).ok_or_else(|| {
            ProviderError::Other(format!("CreateRole returned no role for {}", role_name))
        })
    }

    async fn delete_role(&self, role_name: &str) -> Result<(), ProviderError> {
        self.iam
            .delete_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list_attached_role_policies(
        &self,
        role_name: &str,
    ) -> Result<Vec<AttachedPolicy>, ProviderError> {
        let mut policies = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let out = self
                .iam
                .list_attached_role_policies()
                .role_name(role_name)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(classify)?;

            for policy in out.attached_policies() {
                if let (Some(name), Some(arn)) = (policy.policy_name(), policy.policy_arn()) {
                    policies.push(AttachedPolicy {
                        name: name.to_string(),
                        arn: arn.to_string(),
                    });
                }
            }

            if !out.is_truncated() {
                break;
            }
            match out.marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        debug!(role = %role_name, count = policies.len(), "Listed attached policies");
        Ok(policies)
    }

    async fn list_role_policies(&self, role_name: &str) -> Result<Vec<String>, ProviderError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let out = self
                .iam
                .list_role_policies()
                .role_name(role_name)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(classify)?;

            names.extend(out.policy_names().iter().cloned());

            if !out.is_truncated() {
                break;
            }
            match out.marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        debug!(role = %role_name, count = names.len(), "Listed inline policies");
        Ok(names)
    }

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ProviderError> {
        self.iam
            .put_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<(), ProviderError> {
        self.iam
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn attach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError> {
        self.iam
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn detach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError> {
        self.iam
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_policy(&self, policy_arn: &str) -> Result<(), ProviderError> {
        self.iam
            .get_policy()
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_policy(
        &self,
        policy_name: &str,
        document: &str,
        description: &str,
    ) -> Result<String, ProviderError> {
        let out = self
            .iam
            .create_policy()
            .policy_name(policy_name)
            .policy_document(document)
            .description(description)
            .send()
            .await
            .map_err(classify)?;

        out.policy()
            .and_then(|p| p.arn())
            .map(|arn| arn.to_string())
            .ok_or_else(|| {
                ProviderError::Other(format!("CreatePolicy returned no ARN for {}", policy_name))
            })
    }

    async fn delete_policy(&self, policy_arn: &str) -> Result<(), ProviderError> {
        self.iam
            .delete_policy()
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn head_bucket(&self, bucket: &str) -> Result<(), ProviderError> {
        self.s3
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}
