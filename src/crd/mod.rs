//! Custom Resource Definitions for the MyApplication operator

mod application;

pub use application::{MyApplication, MyApplicationSpec};

use kube::CustomResourceExt;

/// Render the MyApplication CRD as a YAML manifest
pub fn crd_yaml() -> crate::Result<String> {
    serde_yaml::to_string(&MyApplication::crd())
        .map_err(|e| crate::Error::serialization(format!("MyApplication CRD: {}", e)))
}
