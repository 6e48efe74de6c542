//! Operator configuration
//!
//! Everything the desired-state builder needs besides the MyApplication itself
//! lives in [`OperatorConfig`]. It is built once at startup and shared
//! read-only through the controller context, so concurrent reconciles never
//! observe each other's values.

use std::collections::BTreeMap;

/// Default container image for the managed microservice
pub const DEFAULT_IMAGE: &str = "docker.io/nheidloff/simple-microservice:latest";

/// Default container and Service port
pub const DEFAULT_PORT: i32 = 8081;

/// Default NodePort the Service is exposed on
pub const DEFAULT_NODE_PORT: i32 = 30548;

/// Default greeting when a MyApplication leaves `message` empty
pub const DEFAULT_GREETING_MESSAGE: &str = "World";

/// Secret key (and environment variable name) holding the greeting
pub const GREETING_MESSAGE_KEY: &str = "GREETING_MESSAGE";

/// Immutable configuration threaded into the builder and reconcile driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Container image of the microservice
    pub image: String,
    /// Name of the single container in the Deployment
    pub container_name: String,
    /// Container port, also used as Service port and target port
    pub port: i32,
    /// NodePort exposing the Service outside the cluster
    pub node_port: i32,
    /// Selector label key shared by Deployment, pods and Service
    pub label_key: String,
    /// Selector label value shared by Deployment, pods and Service
    pub label_value: String,
    /// Secret key injected into the container environment
    pub secret_key: String,
    /// Greeting used when the MyApplication message is empty
    pub default_message: String,
    /// HTTP path of the readiness probe
    pub readiness_path: String,
    /// Initial delay of the readiness probe in seconds
    pub readiness_initial_delay_secs: i32,
    /// HTTP path of the liveness probe
    pub liveness_path: String,
    /// Initial delay of the liveness probe in seconds
    pub liveness_initial_delay_secs: i32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            container_name: "microservice".to_string(),
            port: DEFAULT_PORT,
            node_port: DEFAULT_NODE_PORT,
            label_key: "app".to_string(),
            label_value: "myapplication".to_string(),
            secret_key: GREETING_MESSAGE_KEY.to_string(),
            default_message: DEFAULT_GREETING_MESSAGE.to_string(),
            // The live endpoint gates readiness and the ready endpoint gates
            // liveness. Downstream health checks depend on this wiring.
            readiness_path: "/q/health/live".to_string(),
            readiness_initial_delay_secs: 20,
            liveness_path: "/q/health/ready".to_string(),
            liveness_initial_delay_secs: 40,
        }
    }
}

impl OperatorConfig {
    /// Override the container image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Override the container/Service port
    pub fn with_port(mut self, port: i32) -> Self {
        self.port = port;
        self
    }

    /// Override the Service NodePort
    pub fn with_node_port(mut self, node_port: i32) -> Self {
        self.node_port = node_port;
        self
    }

    /// Selector labels applied to pods and matched by Deployment and Service
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.label_key.clone(), self.label_value.clone())])
    }

    /// Check that ports and probe delays are usable
    pub fn validate(&self) -> crate::Result<()> {
        if !(1..=65535).contains(&self.port) {
            return Err(crate::Error::validation(format!(
                "port {} is outside 1-65535",
                self.port
            )));
        }
        // Kubernetes' default NodePort range
        if !(30000..=32767).contains(&self.node_port) {
            return Err(crate::Error::validation(format!(
                "node port {} is outside 30000-32767",
                self.node_port
            )));
        }
        if self.readiness_initial_delay_secs >= self.liveness_initial_delay_secs {
            return Err(crate::Error::validation(
                "readiness initial delay must be shorter than liveness initial delay",
            ));
        }
        Ok(())
    }
}
