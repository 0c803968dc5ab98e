//! Integration Role Reconciler
//!
//! Converges an account's IAM state onto an [`IntegrationConfig`] and tears
//! it down again. Live state is read fresh on every call; nothing is cached
//! between calls.
//!
//! Converge and Teardown use different failure policies. Converge compensates
//! a failed create by tearing the integration down (unless the caller set
//! `is_update`), swallowing cleanup errors. Teardown stops at the first
//! failing step and leaves the rest in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::plan::{ConvergePlan, ConvergeStep, LiveState, TeardownPlan, TeardownStep};
use super::policy::{bucket_read_policy, default_read_only_policy, trust_policy};
use super::session::{AccountApi, SessionProvider, GLOBAL_REGION};
use super::types::{
    validate_role_name, AccountTarget, IntegrationConfig, Operation, ProviderError,
    ReconcileError, RoleInfo, INLINE_POLICY_NAME, ROLE_DESCRIPTION,
};

const BUCKET_POLICY_DESCRIPTION: &str = "Read access to CSPM audit-log bucket objects";

/// Result of a successful Converge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergeOutcome {
    pub integration_name: String,
    pub role_arn: String,
    /// Whether the role was created by this call
    pub created_role: bool,
    /// Mutating steps applied after the role step
    pub actions: Vec<ConvergeStep>,
    /// Live trust policy differs from the requested one
    pub trust_policy_drift: bool,
    pub completed_at: DateTime<Utc>,
}

impl ConvergeOutcome {
    /// Format the outcome for display
    pub fn display(&self) -> String {
        let mut out = format!(
            "Integration Converged:\n  Integration: {}\n  Role ARN: {}\n  Role Created: {}\n  Trust Policy Drift: {}\n  Completed: {}",
            self.integration_name,
            self.role_arn,
            self.created_role,
            self.trust_policy_drift,
            self.completed_at.to_rfc3339()
        );
        if self.actions.is_empty() {
            out.push_str("\n  Actions: none (already converged)");
        } else {
            out.push_str("\n  Actions:");
            for action in &self.actions {
                out.push_str(&format!("\n    - {}", action));
            }
        }
        out
    }
}

/// Result of a successful Teardown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownOutcome {
    pub integration_name: String,
    pub actions: Vec<TeardownStep>,
    pub completed_at: DateTime<Utc>,
}

impl TeardownOutcome {
    /// Format the outcome for display
    pub fn display(&self) -> String {
        let mut out = format!(
            "Integration Removed:\n  Integration: {}\n  Completed: {}\n  Actions:",
            self.integration_name,
            self.completed_at.to_rfc3339()
        );
        for action in &self.actions {
            out.push_str(&format!("\n    - {}", action));
        }
        out
    }
}

fn failed(integration: &str, operation: Operation, source: ProviderError) -> ReconcileError {
    error!(
        integration = %integration,
        operation = %operation,
        error = %source,
        "Reconcile step failed"
    );
    ReconcileError::new(operation, integration, source)
}

/// Integration role reconciler
pub struct Reconciler {
    sessions: Arc<dyn SessionProvider>,
    iam_region: String,
}

impl Reconciler {
    pub fn new(sessions: Arc<dyn SessionProvider>) -> Self {
        Self {
            sessions,
            iam_region: GLOBAL_REGION.to_string(),
        }
    }

    /// Region for the IAM client (default: `aws-global`)
    pub fn with_iam_region(mut self, region: impl Into<String>) -> Self {
        self.iam_region = region.into();
        self
    }

    /// Converge the account onto `config` and return the role ARN.
    pub async fn converge(
        &self,
        config: &IntegrationConfig,
    ) -> Result<ConvergeOutcome, ReconcileError> {
        let name = config.integration_name.as_str();
        config
            .validate()
            .map_err(|e| failed(name, Operation::Validate, e))?;

        info!(
            integration = %name,
            account_id = %config.target.account_id,
            is_update = config.is_update,
            "Converging integration role"
        );

        let client = self.authenticate(&config.target, &self.iam_region, name).await?;

        let (role, created_role, trust_policy_drift) =
            self.ensure_role(client.as_ref(), config).await?;

        match self.apply(client.as_ref(), config).await {
            Ok(actions) => {
                info!(
                    integration = %name,
                    role_arn = %role.arn,
                    created_role,
                    actions = actions.len(),
                    "Integration role converged"
                );
                Ok(ConvergeOutcome {
                    integration_name: name.to_string(),
                    role_arn: role.arn,
                    created_role,
                    actions,
                    trust_policy_drift,
                    completed_at: Utc::now(),
                })
            }
            Err(err) => {
                if config.is_update {
                    warn!(integration = %name, "Converge failed during update; leaving partial state");
                } else {
                    self.rollback(client.as_ref(), name).await;
                }
                Err(err)
            }
        }
    }

    /// Remove everything Converge attached, then the role.
    ///
    /// Stops at the first failure. A missing role is reported as NotFound.
    pub async fn teardown(
        &self,
        target: &AccountTarget,
        integration_name: &str,
    ) -> Result<TeardownOutcome, ReconcileError> {
        validate_role_name(integration_name)
            .map_err(|e| failed(integration_name, Operation::Validate, e))?;

        info!(
            integration = %integration_name,
            account_id = %target.account_id,
            "Tearing down integration role"
        );

        let client = self
            .authenticate(target, &self.iam_region, integration_name)
            .await?;
        let actions = self.teardown_with(client.as_ref(), integration_name).await?;

        info!(integration = %integration_name, actions = actions.len(), "Integration role removed");

        Ok(TeardownOutcome {
            integration_name: integration_name.to_string(),
            actions,
            completed_at: Utc::now(),
        })
    }

    /// ARN of the integration role, or `None` when it does not exist.
    pub async fn read_role_arn(
        &self,
        target: &AccountTarget,
        integration_name: &str,
    ) -> Result<Option<String>, ReconcileError> {
        validate_role_name(integration_name)
            .map_err(|e| failed(integration_name, Operation::Validate, e))?;

        let member = self
            .sessions
            .account_in_organization(&target.account_id)
            .await
            .map_err(|e| failed(integration_name, Operation::ListAccounts, e))?;
        if !member {
            info!(
                integration = %integration_name,
                account_id = %target.account_id,
                "Account has left the organization, treating role as gone"
            );
            return Ok(None);
        }

        let client = self
            .authenticate(target, &self.iam_region, integration_name)
            .await?;

        match client.get_role(integration_name).await {
            Ok(role) => Ok(Some(role.arn)),
            Err(e) if e.is_not_found() => {
                debug!(integration = %integration_name, "Integration role not found");
                Ok(None)
            }
            Err(e) => Err(failed(integration_name, Operation::GetRole, e)),
        }
    }

    /// Tear the integration down, then converge it again as an update.
    pub async fn replace(
        &self,
        config: &IntegrationConfig,
    ) -> Result<ConvergeOutcome, ReconcileError> {
        let name = config.integration_name.as_str();
        config
            .validate()
            .map_err(|e| failed(name, Operation::Validate, e))?;

        info!(integration = %name, "Replacing integration role");
        self.teardown(&config.target, &config.integration_name)
            .await?;
        self.converge(&config.clone().for_update()).await
    }

    async fn authenticate(
        &self,
        target: &AccountTarget,
        region: &str,
        integration: &str,
    ) -> Result<Arc<dyn AccountApi>, ReconcileError> {
        self.sessions
            .authenticate(target, region)
            .await
            .map_err(|e| failed(integration, Operation::Authenticate, e))
    }

    /// Look up the role and create it when absent.
    ///
    /// Returns the role, whether it was created, and whether an existing
    /// role's trust policy differs from the requested one.
    async fn ensure_role(
        &self,
        client: &dyn AccountApi,
        config: &IntegrationConfig,
    ) -> Result<(RoleInfo, bool, bool), ReconcileError> {
        let name = config.integration_name.as_str();
        let desired_trust = trust_policy(
            &config.target.partition,
            &config.upt_account_id,
            &config.external_id,
        );

        match client.get_role(name).await {
            Ok(role) => {
                let drift = role
                    .trust_policy
                    .as_deref()
                    .map_or(false, |live| !desired_trust.matches_json(live));
                if drift {
                    // Trust is fixed at creation; rotating it means replacing the role
                    warn!(
                        integration = %name,
                        role_arn = %role.arn,
                        "Existing role trust policy differs from requested; not updating"
                    );
                }
                debug!(integration = %name, role_arn = %role.arn, "Reusing existing role");
                Ok((role, false, drift))
            }
            Err(e) if e.is_not_found() => {
                let document = desired_trust
                    .to_json()
                    .map_err(|e| failed(name, Operation::Validate, e))?;
                let role = client
                    .create_role(name, &document, ROLE_DESCRIPTION)
                    .await
                    .map_err(|e| failed(name, Operation::CreateRole, e))?;
                info!(integration = %name, role_arn = %role.arn, "Created integration role");
                Ok((role, true, false))
            }
            Err(e) => Err(failed(name, Operation::GetRole, e)),
        }
    }

    async fn observe(
        &self,
        client: &dyn AccountApi,
        role_name: &str,
    ) -> Result<LiveState, ReconcileError> {
        let attached = client
            .list_attached_role_policies(role_name)
            .await
            .map_err(|e| failed(role_name, Operation::ListAttachedRolePolicies, e))?;
        let inline = client
            .list_role_policies(role_name)
            .await
            .map_err(|e| failed(role_name, Operation::ListRolePolicies, e))?;

        Ok(LiveState::from_listings(attached, inline))
    }

    /// Diff and apply everything after the role step.
    async fn apply(
        &self,
        client: &dyn AccountApi,
        config: &IntegrationConfig,
    ) -> Result<Vec<ConvergeStep>, ReconcileError> {
        let name = config.integration_name.as_str();
        let live = self.observe(client, name).await?;
        let plan = ConvergePlan::diff(config, &live);

        if plan.is_converged() {
            debug!(integration = %name, "No mutating steps planned");
        }

        let mut applied = Vec::new();
        for step in plan.steps {
            self.apply_step(client, config, &step).await?;
            if step.is_mutating() {
                applied.push(step);
            }
        }
        Ok(applied)
    }

    async fn apply_step(
        &self,
        client: &dyn AccountApi,
        config: &IntegrationConfig,
        step: &ConvergeStep,
    ) -> Result<(), ReconcileError> {
        let name = config.integration_name.as_str();
        let partition = config.target.partition.as_str();

        match step {
            ConvergeStep::PutInlinePolicy => {
                let document = match config.policy_override() {
                    Some(doc) => doc.to_string(),
                    None => default_read_only_policy()
                        .to_json()
                        .map_err(|e| failed(name, Operation::Validate, e))?,
                };
                client
                    .put_role_policy(name, INLINE_POLICY_NAME, &document)
                    .await
                    .map_err(|e| failed(name, Operation::PutRolePolicy, e))?;
                info!(integration = %name, policy = INLINE_POLICY_NAME, "Put inline policy");
            }
            ConvergeStep::AttachManagedPolicy { policy } => {
                client
                    .attach_role_policy(name, &policy.arn(partition))
                    .await
                    .map_err(|e| failed(name, Operation::AttachRolePolicy, e))?;
                info!(integration = %name, policy = %policy, "Attached managed policy");
            }
            ConvergeStep::CheckBucket { bucket, region } => {
                let bucket_client = self.authenticate(&config.target, region, name).await?;
                bucket_client
                    .head_bucket(bucket)
                    .await
                    .map_err(|e| failed(name, Operation::HeadBucket, e))?;
                debug!(integration = %name, bucket = %bucket, region = %region, "Bucket reachable");
            }
            ConvergeStep::EnsureBucketPolicy {
                policy_name,
                policy_arn,
                bucket,
            } => {
                let arn = match client.get_policy(policy_arn).await {
                    Ok(()) => policy_arn.clone(),
                    Err(e) if e.is_not_found() => {
                        let document = bucket_read_policy(partition, bucket)
                            .to_json()
                            .map_err(|e| failed(name, Operation::Validate, e))?;
                        let created = client
                            .create_policy(policy_name, &document, BUCKET_POLICY_DESCRIPTION)
                            .await
                            .map_err(|e| failed(name, Operation::CreatePolicy, e))?;
                        info!(integration = %name, policy_arn = %created, "Created bucket policy");
                        created
                    }
                    Err(e) => return Err(failed(name, Operation::GetPolicy, e)),
                };

                client
                    .attach_role_policy(name, &arn)
                    .await
                    .map_err(|e| failed(name, Operation::AttachRolePolicy, e))?;
                info!(integration = %name, policy_arn = %arn, "Attached bucket policy");
            }
        }
        Ok(())
    }

    async fn teardown_with(
        &self,
        client: &dyn AccountApi,
        integration_name: &str,
    ) -> Result<Vec<TeardownStep>, ReconcileError> {
        let live = self.observe(client, integration_name).await?;
        let plan = TeardownPlan::from_live(&live);

        for policy in &plan.retained {
            warn!(
                integration = %integration_name,
                policy = %policy.name,
                "Leaving unmanaged policy attached"
            );
        }

        let mut applied = Vec::with_capacity(plan.steps.len());
        for step in plan.steps {
            match &step {
                TeardownStep::DetachPolicy { arn, .. } => {
                    client
                        .detach_role_policy(integration_name, arn)
                        .await
                        .map_err(|e| failed(integration_name, Operation::DetachRolePolicy, e))?;
                }
                TeardownStep::DetachAndDeletePolicy { arn, .. } => {
                    client
                        .detach_role_policy(integration_name, arn)
                        .await
                        .map_err(|e| failed(integration_name, Operation::DetachRolePolicy, e))?;
                    client
                        .delete_policy(arn)
                        .await
                        .map_err(|e| failed(integration_name, Operation::DeletePolicy, e))?;
                }
                TeardownStep::DeleteInlinePolicy { name } => {
                    client
                        .delete_role_policy(integration_name, name)
                        .await
                        .map_err(|e| failed(integration_name, Operation::DeleteRolePolicy, e))?;
                }
                TeardownStep::DeleteRole => {
                    client
                        .delete_role(integration_name)
                        .await
                        .map_err(|e| failed(integration_name, Operation::DeleteRole, e))?;
                }
            }
            debug!(integration = %integration_name, step = %step, "Teardown step applied");
            applied.push(step);
        }

        Ok(applied)
    }

    /// Compensate a failed Converge. Cleanup errors are logged, not returned.
    async fn rollback(&self, client: &dyn AccountApi, integration_name: &str) {
        warn!(integration = %integration_name, "Rolling back failed converge");
        match self.teardown_with(client, integration_name).await {
            Ok(steps) => info!(
                integration = %integration_name,
                steps = steps.len(),
                "Rollback complete"
            ),
            Err(e) => warn!(
                integration = %integration_name,
                error = %e,
                "Rollback incomplete; resources may remain"
            ),
        }
    }
}
