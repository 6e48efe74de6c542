//! MyApplication operator - desired-state reconciliation for a sample microservice
//!
//! A `MyApplication` custom resource declares a replica count and a greeting
//! message. The operator drives the cluster toward that declaration by owning
//! three child resources per application: a Secret holding the greeting, a
//! Deployment running the microservice, and a NodePort Service exposing it.
//!
//! # Modules
//!
//! - [`crd`] - The `MyApplication` Custom Resource Definition
//! - [`config`] - Immutable operator configuration (image, ports, labels)
//! - [`workload`] - Desired-state builder for the managed child resources
//! - [`hash`] - Spec hashing and drift detection via the `spec-hash` label
//! - [`controller`] - Reconcile driver wired into `kube::runtime::Controller`
//! - [`probe`] - One-shot cluster capability detection
//! - [`telemetry`] - Structured logging and optional OTLP trace export
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod hash;
pub mod probe;
pub mod telemetry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator name: field manager for the CRD server-side apply and telemetry service name
pub const FIELD_MANAGER: &str = "myapp-operator";

/// Label key carrying the structural spec hash of a managed resource
pub const SPEC_HASH_LABEL: &str = "spec-hash";
