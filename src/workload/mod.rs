//! Desired-state builder for MyApplication child resources
//!
//! Each MyApplication owns exactly three objects in its namespace:
//! - Secret: the greeting message, written once
//! - Deployment: the microservice pods, reading the greeting from the Secret
//! - Service: NodePort exposure of the container port
//!
//! Manifests are pure functions of the MyApplication and the operator
//! configuration. Names are derived from the owner name only, so repeated
//! builds for the same input produce identical objects.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::config::OperatorConfig;
use crate::crd::MyApplication;
use crate::hash::{set_hash_label, spec_hash};
use crate::{Error, Result};

// =============================================================================
// Resource identity
// =============================================================================

/// Deterministic names of the objects owned by one MyApplication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    /// Secret holding the greeting
    pub secret: String,
    /// Deployment running the microservice
    pub deployment: String,
    /// NodePort Service in front of the Deployment
    pub service: String,
}

impl ResourceNames {
    /// Derive child names from the owning MyApplication's name
    pub fn for_application(name: &str) -> Self {
        Self {
            secret: format!("{}-secret-greeting", name),
            deployment: format!("{}-deployment-microservice", name),
            service: format!("{}-service-microservice", name),
        }
    }
}

/// Kind of managed child resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    /// Greeting Secret
    Secret,
    /// Microservice Deployment
    Workload,
    /// NodePort Service
    Service,
}

impl ManagedKind {
    /// All kinds, in the order a reconcile pass handles them
    pub const ALL: [ManagedKind; 3] = [Self::Secret, Self::Workload, Self::Service];
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret => write!(f, "Secret"),
            Self::Workload => write!(f, "Deployment"),
            Self::Service => write!(f, "Service"),
        }
    }
}

/// A fully built child manifest, labeled with its spec hash
#[derive(Clone, Debug, PartialEq)]
pub enum DesiredManifest {
    /// Greeting Secret
    Secret(Secret),
    /// Microservice Deployment
    Workload(Deployment),
    /// NodePort Service
    Service(Service),
}

impl DesiredManifest {
    /// Kind of this manifest
    pub fn kind(&self) -> ManagedKind {
        match self {
            Self::Secret(_) => ManagedKind::Secret,
            Self::Workload(_) => ManagedKind::Workload,
            Self::Service(_) => ManagedKind::Service,
        }
    }

    /// Metadata of the wrapped object
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Secret(s) => &s.metadata,
            Self::Workload(d) => &d.metadata,
            Self::Service(s) => &s.metadata,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Identity of the owner, resolved once per build
struct Owner {
    name: String,
    namespace: String,
    reference: OwnerReference,
}

/// Builds desired child manifests for a MyApplication
#[derive(Clone, Debug)]
pub struct DesiredStateBuilder {
    config: Arc<OperatorConfig>,
}

impl DesiredStateBuilder {
    /// Create a builder over shared operator configuration
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }

    /// Build the manifest of the given kind
    pub fn build(&self, app: &MyApplication, kind: ManagedKind) -> Result<DesiredManifest> {
        Ok(match kind {
            ManagedKind::Secret => DesiredManifest::Secret(self.secret(app)?),
            ManagedKind::Workload => DesiredManifest::Workload(self.deployment(app)?),
            ManagedKind::Service => DesiredManifest::Service(self.service(app)?),
        })
    }

    /// Build the greeting Secret
    pub fn secret(&self, app: &MyApplication) -> Result<Secret> {
        let owner = owner_of(app)?;
        let names = ResourceNames::for_application(&owner.name);

        let string_data = BTreeMap::from([(
            self.config.secret_key.clone(),
            app.spec
                .message_or(&self.config.default_message)
                .to_string(),
        )]);
        let type_ = "Opaque".to_string();
        let hash = spec_hash(&serde_json::json!({
            "type": type_,
            "stringData": string_data,
            "immutable": true,
        }));

        Ok(Secret {
            metadata: self.metadata(&owner, names.secret, &hash),
            type_: Some(type_),
            string_data: Some(string_data),
            immutable: Some(true),
            ..Default::default()
        })
    }

    /// Build the microservice Deployment
    pub fn deployment(&self, app: &MyApplication) -> Result<Deployment> {
        let owner = owner_of(app)?;
        let names = ResourceNames::for_application(&owner.name);
        let config = &self.config;
        let selector = config.selector_labels();

        let container = Container {
            name: config.container_name.clone(),
            image: Some(config.image.clone()),
            ports: Some(vec![ContainerPort {
                container_port: config.port,
                ..Default::default()
            }]),
            env: Some(vec![EnvVar {
                name: config.secret_key.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: names.secret.clone(),
                        key: config.secret_key.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            readiness_probe: Some(http_probe(
                &config.readiness_path,
                config.port,
                config.readiness_initial_delay_secs,
            )),
            liveness_probe: Some(http_probe(
                &config.liveness_path,
                config.port,
                config.liveness_initial_delay_secs,
            )),
            ..Default::default()
        };

        let spec = DeploymentSpec {
            replicas: Some(app.spec.size),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        };
        let hash = spec_hash(&spec);

        Ok(Deployment {
            metadata: self.metadata(&owner, names.deployment, &hash),
            spec: Some(spec),
            ..Default::default()
        })
    }

    /// Build the NodePort Service
    pub fn service(&self, app: &MyApplication) -> Result<Service> {
        let owner = owner_of(app)?;
        let names = ResourceNames::for_application(&owner.name);
        let config = &self.config;

        let spec = ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(config.selector_labels()),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port: config.port,
                target_port: Some(IntOrString::Int(config.port)),
                node_port: Some(config.node_port),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let hash = spec_hash(&spec);

        Ok(Service {
            metadata: self.metadata(&owner, names.service, &hash),
            spec: Some(spec),
            ..Default::default()
        })
    }

    fn metadata(&self, owner: &Owner, name: String, hash: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(owner.namespace.clone()),
            labels: Some(set_hash_label(Some(self.config.selector_labels()), hash)),
            owner_references: Some(vec![owner.reference.clone()]),
            ..Default::default()
        }
    }
}

fn owner_of(app: &MyApplication) -> Result<Owner> {
    let name = app.name_any();
    let namespace = app
        .namespace()
        .ok_or_else(|| Error::validation(format!("MyApplication {} has no namespace", name)))?;
    // controller_owner_ref is None without a uid and only sets `controller`
    let mut reference = app
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation(format!("MyApplication {} has no uid", name)))?;
    reference.block_owner_deletion = Some(true);
    Ok(Owner {
        name,
        namespace,
        reference,
    })
}

fn http_probe(path: &str, port: i32, initial_delay_secs: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_secs),
        ..Default::default()
    }
}
