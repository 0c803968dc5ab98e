//! CSPM Engine Library
//!
//! Account onboarding agents for the CSPM platform.

pub mod agents;

pub use agents::integration_role;
pub use agents::Reconciler;
