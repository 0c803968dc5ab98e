//! Integration Role Agent
//!
//! Provisions and removes the cross-account IAM role a CSPM platform uses to
//! read inventory and audit data from a customer AWS account.
//!
//! ## Features
//!
//! - Idempotent Converge: reads live state first, writes only what is missing
//! - Compensating rollback for failed creates (skipped for updates)
//! - Ordered Teardown that detaches before deleting the role
//! - Typed trust, read-only and bucket policy documents
//! - STS AssumeRole sessions with a fixed 60-minute lifetime
//!
//! ## Example Usage
//!
//! ```ignore
//! use cspm_engine::agents::integration_role::{
//!     AccountTarget, AwsSessionProvider, IntegrationConfig, Reconciler, SessionConfig,
//! };
//!
//! let sessions = AwsSessionProvider::new(SessionConfig::from_env());
//! let reconciler = Reconciler::new(Arc::new(sessions));
//!
//! let config = IntegrationConfig::new(
//!     "uptcloud",
//!     AccountTarget::new("123456789012"),
//!     "012345678912",
//!     "6a9375c1-47c0-470c-9217-d2f9d2d185f1",
//! )
//! .with_bucket("audit-logs", "us-west-2");
//!
//! let outcome = reconciler.converge(&config).await?;
//! println!("Role: {}", outcome.role_arn);
//! ```

pub mod aws;
pub mod plan;
pub mod policy;
pub mod reconciler;
pub mod session;
pub mod types;

#[cfg(test)]
mod fake;

pub use aws::AwsAccountClient;
pub use plan::{ConvergePlan, ConvergeStep, LiveState, ResourceNode, TeardownPlan, TeardownStep};
pub use policy::PolicyDocument;
pub use reconciler::{ConvergeOutcome, Reconciler, TeardownOutcome};
pub use session::{AccountApi, AwsSessionProvider, SessionConfig, SessionProvider};
pub use types::{
    AccountTarget, AwsManagedPolicy, BucketTarget, ErrorKind, IntegrationConfig, Operation,
    ProviderError, ReconcileError,
};
