//! In-memory account with IAM semantics, call recording and fault injection.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use super::session::{AccountApi, SessionProvider};
use super::types::{
    role_arn, AccountTarget, AttachedPolicy, Operation, ProviderError, RoleInfo,
};

#[derive(Debug, Clone)]
pub struct FakeRole {
    pub arn: String,
    pub trust_policy: String,
    pub attached: Vec<AttachedPolicy>,
    pub inline: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub target: String,
}

#[derive(Default)]
struct AccountState {
    roles: BTreeMap<String, FakeRole>,
    /// Customer-managed policies, ARN -> document
    policies: BTreeMap<String, String>,
    buckets: BTreeSet<String>,
    calls: Vec<Call>,
    faults: HashMap<Operation, ProviderError>,
}

/// Shared handle onto one fake account
#[derive(Clone)]
pub struct FakeAccount {
    account_id: String,
    state: Arc<Mutex<AccountState>>,
}

fn is_aws_managed(arn: &str) -> bool {
    arn.contains(":iam::aws:policy/")
}

fn policy_name_from_arn(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_string()
}

fn is_mutating(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::CreateRole
            | Operation::PutRolePolicy
            | Operation::AttachRolePolicy
            | Operation::DetachRolePolicy
            | Operation::CreatePolicy
            | Operation::DeletePolicy
            | Operation::DeleteRolePolicy
            | Operation::DeleteRole
    )
}

impl FakeAccount {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            state: Arc::new(Mutex::new(AccountState::default())),
        }
    }

    /// Seed a role as if created earlier
    pub fn with_role(self, name: &str, trust_policy: &str) -> Self {
        self.state.lock().unwrap().roles.insert(
            name.to_string(),
            FakeRole {
                arn: role_arn("aws", &self.account_id, name),
                trust_policy: trust_policy.to_string(),
                attached: Vec::new(),
                inline: BTreeMap::new(),
            },
        );
        self
    }

    /// Seed an attachment on an existing role
    pub fn with_attachment(self, role: &str, name: &str, arn: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            if !is_aws_managed(arn) {
                state.policies.insert(arn.to_string(), "{}".to_string());
            }
            let role = state.roles.get_mut(role).expect("seeded role");
            role.attached.push(AttachedPolicy {
                name: name.to_string(),
                arn: arn.to_string(),
            });
        }
        self
    }

    pub fn with_inline(self, role: &str, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .roles
            .get_mut(role)
            .expect("seeded role")
            .inline
            .insert(name.to_string(), "{}".to_string());
        self
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        self.state.lock().unwrap().buckets.insert(bucket.to_string());
        self
    }

    /// Fail the next call of `operation` with `error`
    pub fn fail_on(&self, operation: Operation, error: ProviderError) {
        self.state.lock().unwrap().faults.insert(operation, error);
    }

    pub fn role(&self, name: &str) -> Option<FakeRole> {
        self.state.lock().unwrap().roles.get(name).cloned()
    }

    pub fn has_policy(&self, arn: &str) -> bool {
        self.state.lock().unwrap().policies.contains_key(arn)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| is_mutating(c.operation))
            .collect()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.calls().into_iter().map(|c| c.operation).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Record the call, then apply any injected fault for it.
    fn enter(&self, operation: Operation, target: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            operation,
            target: target.to_string(),
        });
        match state.faults.remove(&operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn missing_role(name: &str) -> ProviderError {
        ProviderError::NotFound(format!("The role with name {} cannot be found.", name))
    }
}

#[async_trait]
impl AccountApi for FakeAccount {
    async fn get_role(&self, role_name: &str) -> Result<RoleInfo, ProviderError> {
        self.enter(Operation::GetRole, role_name)?;
        let state = self.state.lock().unwrap();
        let role = state
            .roles
            .get(role_name)
            .ok_or_else(|| Self::missing_role(role_name))?;
        Ok(RoleInfo {
            name: role_name.to_string(),
            arn: role.arn.clone(),
            trust_policy: Some(role.trust_policy.clone()),
        })
    }

    async fn create_role(
        &self,
        role_name: &str,
        trust_policy: &str,
        _description: &str,
    ) -> Result<RoleInfo, ProviderError> {
        self.enter(Operation::CreateRole, role_name)?;
        let mut state = self.state.lock().unwrap();
        if state.roles.contains_key(role_name) {
            return Err(ProviderError::ResourceExistsConflict(format!(
                "Role with name {} already exists.",
                role_name
            )));
        }
        let arn = role_arn("aws", &self.account_id, role_name);
        state.roles.insert(
            role_name.to_string(),
            FakeRole {
                arn: arn.clone(),
                trust_policy: trust_policy.to_string(),
                attached: Vec::new(),
                inline: BTreeMap::new(),
            },
        );
        Ok(RoleInfo {
            name: role_name.to_string(),
            arn,
            trust_policy: Some(trust_policy.to_string()),
        })
    }

    async fn delete_role(&self, role_name: &str) -> Result<(), ProviderError> {
        self.enter(Operation::DeleteRole, role_name)?;
        let mut state = self.state.lock().unwrap();
        let role = state
            .roles
            .get(role_name)
            .ok_or_else(|| Self::missing_role(role_name))?;
        if !role.attached.is_empty() || !role.inline.is_empty() {
            return Err(ProviderError::DeleteConflict(
                "Cannot delete entity, must detach all policies first.".to_string(),
            ));
        }
        state.roles.remove(role_name);
        Ok(())
    }

    async fn list_attached_role_policies(
        &self,
        role_name: &str,
    ) -> Result<Vec<AttachedPolicy>, ProviderError> {
        self.enter(Operation::ListAttachedRolePolicies, role_name)?;
        let state = self.state.lock().unwrap();
        state
            .roles
            .get(role_name)
            .map(|r| r.attached.clone())
            .ok_or_else(|| Self::missing_role(role_name))
    }

    async fn list_role_policies(&self, role_name: &str) -> Result<Vec<String>, ProviderError> {
        self.enter(Operation::ListRolePolicies, role_name)?;
        let state = self.state.lock().unwrap();
        state
            .roles
            .get(role_name)
            .map(|r| r.inline.keys().cloned().collect())
            .ok_or_else(|| Self::missing_role(role_name))
    }

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ProviderError> {
        self.enter(Operation::PutRolePolicy, policy_name)?;
        let mut state = self.state.lock().unwrap();
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Self::missing_role(role_name))?;
        role.inline
            .insert(policy_name.to_string(), document.to_string());
        Ok(())
    }

    async fn delete_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<(), ProviderError> {
        self.enter(Operation::DeleteRolePolicy, policy_name)?;
        let mut state = self.state.lock().unwrap();
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Self::missing_role(role_name))?;
        role.inline.remove(policy_name).map(|_| ()).ok_or_else(|| {
            ProviderError::NotFound(format!("The role policy {} cannot be found.", policy_name))
        })
    }

    async fn attach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError> {
        self.enter(Operation::AttachRolePolicy, policy_arn)?;
        let mut state = self.state.lock().unwrap();
        if !is_aws_managed(policy_arn) && !state.policies.contains_key(policy_arn) {
            return Err(ProviderError::NotFound(format!(
                "Policy {} does not exist.",
                policy_arn
            )));
        }
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Self::missing_role(role_name))?;
        if !role.attached.iter().any(|p| p.arn == policy_arn) {
            role.attached.push(AttachedPolicy {
                name: policy_name_from_arn(policy_arn),
                arn: policy_arn.to_string(),
            });
        }
        Ok(())
    }

    async fn detach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError> {
        self.enter(Operation::DetachRolePolicy, policy_arn)?;
        let mut state = self.state.lock().unwrap();
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Self::missing_role(role_name))?;
        let before = role.attached.len();
        role.attached.retain(|p| p.arn != policy_arn);
        if role.attached.len() == before {
            return Err(ProviderError::NotFound(format!(
                "Policy {} was not found.",
                policy_arn
            )));
        }
        Ok(())
    }

    async fn get_policy(&self, policy_arn: &str) -> Result<(), ProviderError> {
        self.enter(Operation::GetPolicy, policy_arn)?;
        let state = self.state.lock().unwrap();
        if is_aws_managed(policy_arn) || state.policies.contains_key(policy_arn) {
            Ok(())
        } else {
            Err(ProviderError::NotFound(format!(
                "Policy {} was not found.",
                policy_arn
            )))
        }
    }

    async fn create_policy(
        &self,
        policy_name: &str,
        document: &str,
        _description: &str,
    ) -> Result<String, ProviderError> {
        self.enter(Operation::CreatePolicy, policy_name)?;
        let mut state = self.state.lock().unwrap();
        let arn = format!("arn:aws:iam::{}:policy/{}", self.account_id, policy_name);
        if state.policies.contains_key(&arn) {
            return Err(ProviderError::ResourceExistsConflict(format!(
                "A policy called {} already exists.",
                policy_name
            )));
        }
        state.policies.insert(arn.clone(), document.to_string());
        Ok(arn)
    }

    async fn delete_policy(&self, policy_arn: &str) -> Result<(), ProviderError> {
        self.enter(Operation::DeletePolicy, policy_arn)?;
        let mut state = self.state.lock().unwrap();
        let in_use = state
            .roles
            .values()
            .any(|r| r.attached.iter().any(|p| p.arn == policy_arn));
        if in_use {
            return Err(ProviderError::DeleteConflict(
                "Cannot delete a policy attached to entities.".to_string(),
            ));
        }
        state.policies.remove(policy_arn).map(|_| ()).ok_or_else(|| {
            ProviderError::NotFound(format!("Policy {} was not found.", policy_arn))
        })
    }

    async fn head_bucket(&self, bucket: &str) -> Result<(), ProviderError> {
        self.enter(Operation::HeadBucket, bucket)?;
        if self.state.lock().unwrap().buckets.contains(bucket) {
            Ok(())
        } else {
            Err(ProviderError::NotFound(format!("bucket {}", bucket)))
        }
    }
}

/// Session provider handing out clients onto one fake account
pub struct FakeSessions {
    account: FakeAccount,
    regions: Mutex<Vec<String>>,
    auth_error: Option<ProviderError>,
    /// Accounts no longer in the organization
    departed: BTreeSet<String>,
}

impl FakeSessions {
    pub fn new(account: FakeAccount) -> Self {
        Self {
            account,
            regions: Mutex::new(Vec::new()),
            auth_error: None,
            departed: BTreeSet::new(),
        }
    }

    pub fn failing(account: FakeAccount, error: ProviderError) -> Self {
        Self {
            auth_error: Some(error),
            ..Self::new(account)
        }
    }

    pub fn with_departed_account(mut self, account_id: &str) -> Self {
        self.departed.insert(account_id.to_string());
        self
    }

    /// Regions passed to every `authenticate` call, in order
    pub fn regions(&self) -> Vec<String> {
        self.regions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionProvider for FakeSessions {
    async fn authenticate(
        &self,
        _target: &AccountTarget,
        region: &str,
    ) -> Result<Arc<dyn AccountApi>, ProviderError> {
        self.regions.lock().unwrap().push(region.to_string());
        if let Some(err) = &self.auth_error {
            return Err(err.clone());
        }
        Ok(Arc::new(self.account.clone()))
    }

    async fn account_in_organization(&self, account_id: &str) -> Result<bool, ProviderError> {
        Ok(!self.departed.contains(account_id))
    }
}
