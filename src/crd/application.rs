//! MyApplication Custom Resource Definition
//!
//! A MyApplication declares how many replicas of the sample microservice should
//! run and which greeting it serves. The operator owns everything derived
//! from it; the object itself is only ever read.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a MyApplication
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sample.myapp.dev",
    version = "v1alpha1",
    kind = "MyApplication",
    plural = "myapplications",
    shortname = "myapp",
    namespaced,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".spec.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MyApplicationSpec {
    /// Desired number of microservice replicas
    #[schemars(range(min = 0))]
    pub size: i32,

    /// Greeting served by the microservice (operator default when empty)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl MyApplicationSpec {
    /// Validate the application specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.size < 0 {
            return Err(crate::Error::validation(format!(
                "size must not be negative, got {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Greeting to store in the Secret, falling back to `default` when unset
    pub fn message_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.message.is_empty() {
            default
        } else {
            &self.message
        }
    }
}
