//! Agent modules for the CSPM Engine
//!
//! - `integration_role`: cross-account IAM integration role provisioning

pub mod integration_role;

pub use integration_role::Reconciler;
