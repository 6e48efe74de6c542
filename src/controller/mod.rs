//! Controller implementation for MyApplication resources
//!
//! The reconcile driver follows the Kubernetes controller pattern: build the
//! desired children, observe what exists, and create or correct the difference.

mod application;

pub use application::{
    apply_desired_state, error_policy, reconcile, ApplicationKubeClient,
    ApplicationKubeClientImpl, Context, ReconcileOutcome,
};
