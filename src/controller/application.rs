//! MyApplication controller implementation
//!
//! Each pass builds the desired Secret, Deployment and Service for one
//! MyApplication, fetches what the cluster holds under the same names, and
//! creates whatever is missing. Only the Deployment is corrected when it
//! drifts; the pass is safe to run any number of times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::OperatorConfig;
use crate::crd::MyApplication;
use crate::hash::{hash_from_labels, is_in_sync, set_hash_label};
use crate::probe::ClusterCapabilities;
use crate::workload::{DesiredStateBuilder, ManagedKind, ResourceNames};
use crate::{Error, Result};

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Store operations needed to reconcile a MyApplication's children
///
/// Lookups map "not found" to `Ok(None)`; every other API failure is an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationKubeClient: Send + Sync {
    /// Get a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// Get a Deployment by namespace and name
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Create a Deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Replace a Deployment, guarded by its `resourceVersion`
    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Get a Service by namespace and name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct ApplicationKubeClientImpl {
    client: Client,
}

impl ApplicationKubeClientImpl {
    /// Create a new ApplicationKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ApplicationKubeClient for ApplicationKubeClientImpl {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("cannot replace a Deployment without a name"))?;
        api.replace(name, &PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Controller context shared across all reconciliation calls
pub struct Context {
    /// Store access for child resources
    pub kube: Arc<dyn ApplicationKubeClient>,
    /// Builds the desired child manifests
    pub builder: DesiredStateBuilder,
    /// Cluster capabilities detected at startup
    pub capabilities: ClusterCapabilities,
}

impl Context {
    /// Create a new Context with the given dependencies
    pub fn new(
        kube: Arc<dyn ApplicationKubeClient>,
        config: Arc<OperatorConfig>,
        capabilities: ClusterCapabilities,
    ) -> Self {
        Self {
            kube,
            builder: DesiredStateBuilder::new(config),
            capabilities,
        }
    }

    /// Create a new Context backed by a Kubernetes client
    pub fn from_client(
        client: Client,
        config: Arc<OperatorConfig>,
        capabilities: ClusterCapabilities,
    ) -> Self {
        Self::new(
            Arc::new(ApplicationKubeClientImpl::new(client)),
            config,
            capabilities,
        )
    }

    /// Create a context for testing with a mock client and default config
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ApplicationKubeClient>) -> Self {
        Self::new(
            kube,
            Arc::new(OperatorConfig::default()),
            ClusterCapabilities::default(),
        )
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// What a reconcile step did to one child resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource was absent and has been created
    Created,
    /// The resource drifted and has been updated in place
    Updated,
    /// No write was needed
    Unchanged,
}

/// Reconcile a MyApplication
///
/// Child resources are watched through owner references, so a successful pass
/// waits for the next change instead of requeueing.
#[instrument(skip(app, ctx), fields(app = %app.name_any(), namespace = ?app.namespace()))]
pub async fn reconcile(app: Arc<MyApplication>, ctx: Arc<Context>) -> Result<Action> {
    info!("reconciling application");

    if let Err(e) = app.spec.validate() {
        // Needs a spec change, not a retry
        warn!(error = %e, "application validation failed");
        return Ok(Action::await_change());
    }

    let outcomes = apply_desired_state(&app, &ctx).await?;
    debug!(?outcomes, "reconcile pass complete");

    Ok(Action::await_change())
}

/// Error policy for the controller
pub fn error_policy(app: Arc<MyApplication>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        app = %app.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

/// Run one pass over the Secret, Deployment and Service, in that order
///
/// The first failing step aborts the pass; earlier steps are not rolled back.
pub async fn apply_desired_state(
    app: &MyApplication,
    ctx: &Context,
) -> Result<Vec<(ManagedKind, ReconcileOutcome)>> {
    let mut outcomes = Vec::with_capacity(ManagedKind::ALL.len());
    for kind in ManagedKind::ALL {
        let outcome = match kind {
            ManagedKind::Secret => reconcile_secret(app, ctx).await?,
            ManagedKind::Workload => reconcile_deployment(app, ctx).await?,
            ManagedKind::Service => reconcile_service(app, ctx).await?,
        };
        outcomes.push((kind, outcome));
    }
    Ok(outcomes)
}

fn namespace_of(app: &MyApplication) -> Result<String> {
    app.namespace().ok_or_else(|| {
        Error::validation(format!("MyApplication {} has no namespace", app.name_any()))
    })
}

async fn reconcile_secret(app: &MyApplication, ctx: &Context) -> Result<ReconcileOutcome> {
    let desired = ctx.builder.secret(app)?;
    let namespace = namespace_of(app)?;
    let name = ResourceNames::for_application(&app.name_any()).secret;

    if ctx.kube.get_secret(&namespace, &name).await?.is_some() {
        // Written once; later message edits are not propagated
        return Ok(ReconcileOutcome::Unchanged);
    }

    ctx.kube.create_secret(&namespace, &desired).await?;
    info!(secret = %name, "created greeting secret");
    Ok(ReconcileOutcome::Created)
}

async fn reconcile_deployment(app: &MyApplication, ctx: &Context) -> Result<ReconcileOutcome> {
    let desired = ctx.builder.deployment(app)?;
    let namespace = namespace_of(app)?;
    let name = ResourceNames::for_application(&app.name_any()).deployment;

    let Some(mut stored) = ctx.kube.get_deployment(&namespace, &name).await? else {
        ctx.kube.create_deployment(&namespace, &desired).await?;
        info!(deployment = %name, "created deployment");
        return Ok(ReconcileOutcome::Created);
    };

    let desired_hash = hash_from_labels(desired.metadata.labels.as_ref()).unwrap_or_default();
    let stored_hash = hash_from_labels(stored.metadata.labels.as_ref());
    if is_in_sync(stored_hash, desired_hash) {
        return Ok(ReconcileOutcome::Unchanged);
    }

    let desired_replicas = desired.spec.as_ref().and_then(|s| s.replicas);
    let stored_replicas = stored.spec.as_ref().and_then(|s| s.replicas);
    if desired_replicas != stored_replicas {
        if let Some(spec) = stored.spec.as_mut() {
            spec.replicas = desired_replicas;
        }
    }
    // Refresh the hash even when only foreign fields differ, so the next pass
    // is a no-op. Everything else on the stored object is kept as-is.
    let labels = set_hash_label(stored.metadata.labels.take(), desired_hash);
    stored.metadata.labels = Some(labels);

    ctx.kube.replace_deployment(&namespace, &stored).await?;
    info!(
        deployment = %name,
        ?stored_replicas,
        ?desired_replicas,
        "updated drifted deployment"
    );
    Ok(ReconcileOutcome::Updated)
}

async fn reconcile_service(app: &MyApplication, ctx: &Context) -> Result<ReconcileOutcome> {
    let desired = ctx.builder.service(app)?;
    let namespace = namespace_of(app)?;
    let name = ResourceNames::for_application(&app.name_any()).service;

    let Some(stored) = ctx.kube.get_service(&namespace, &name).await? else {
        ctx.kube.create_service(&namespace, &desired).await?;
        info!(service = %name, "created service");
        return Ok(ReconcileOutcome::Created);
    };

    let desired_hash = hash_from_labels(desired.metadata.labels.as_ref()).unwrap_or_default();
    let stored_hash = hash_from_labels(stored.metadata.labels.as_ref());
    if !is_in_sync(stored_hash, desired_hash) {
        // Service drift is reported, not corrected
        debug!(service = %name, ?stored_hash, desired_hash, "service differs from desired state");
    }
    Ok(ReconcileOutcome::Unchanged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MyApplicationSpec;
    use mockall::predicate::eq;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_app(size: i32, message: &str) -> MyApplication {
        let mut app = MyApplication::new(
            "demo",
            MyApplicationSpec {
                size,
                message: message.to_string(),
            },
        );
        app.metadata.namespace = Some("ns1".to_string());
        app.metadata.uid = Some("uid-demo".to_string());
        app
    }

    fn builder() -> DesiredStateBuilder {
        DesiredStateBuilder::new(Arc::new(OperatorConfig::default()))
    }

    fn conflict() -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    fn server_error() -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd unavailable".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }

    /// Deployment as the server would return it for `size` replicas
    fn stored_deployment(size: i32) -> Deployment {
        let mut d = builder().deployment(&sample_app(size, "Hi")).unwrap();
        d.metadata.resource_version = Some("42".to_string());
        d
    }

    // =========================================================================
    // Mock Setup
    // =========================================================================

    /// Store holding every child in its desired state
    fn mock_in_sync(size: i32) -> MockApplicationKubeClient {
        let app = sample_app(size, "Hi");
        let secret = builder().secret(&app).unwrap();
        let deployment = stored_deployment(size);
        let service = builder().service(&app).unwrap();

        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(secret.clone())));
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(deployment.clone())));
        mock.expect_get_service()
            .returning(move |_, _| Ok(Some(service.clone())));
        mock
    }

    /// Empty store accepting every create
    fn mock_empty() -> MockApplicationKubeClient {
        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_secret().returning(|_, _| Ok(None));
        mock.expect_get_deployment().returning(|_, _| Ok(None));
        mock.expect_get_service().returning(|_, _| Ok(None));
        mock
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: A new application gets all three children, Secret first
    #[tokio::test]
    async fn story_creates_all_children_when_absent() {
        let mut seq = mockall::Sequence::new();
        let mut mock = MockApplicationKubeClient::new();

        mock.expect_get_secret()
            .with(eq("ns1"), eq("demo-secret-greeting"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_create_secret()
            .withf(|ns, s| {
                ns == "ns1"
                    && s.string_data
                        .as_ref()
                        .and_then(|d| d.get("GREETING_MESSAGE"))
                        .map(String::as_str)
                        == Some("Hi")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_get_deployment()
            .with(eq("ns1"), eq("demo-deployment-microservice"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_create_deployment()
            .withf(|_, d| d.spec.as_ref().and_then(|s| s.replicas) == Some(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_get_service()
            .with(eq("ns1"), eq("demo-service-microservice"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_create_service()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(sample_app(2, "Hi")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: A converged application causes no writes
    #[tokio::test]
    async fn story_in_sync_application_is_noop() {
        // No create/replace expectations: any write panics the mock
        let ctx = Context::for_testing(Arc::new(mock_in_sync(3)));
        let outcomes = apply_desired_state(&sample_app(3, "Hi"), &ctx)
            .await
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                (ManagedKind::Secret, ReconcileOutcome::Unchanged),
                (ManagedKind::Workload, ReconcileOutcome::Unchanged),
                (ManagedKind::Service, ReconcileOutcome::Unchanged),
            ]
        );
    }

    /// Story: Replica drift is corrected with one guarded replace
    #[tokio::test]
    async fn story_replica_drift_is_corrected() {
        let app = sample_app(7, "Hi");
        let desired_hash = hash_from_labels(
            builder().deployment(&app).unwrap().metadata.labels.as_ref(),
        )
        .unwrap()
        .to_string();

        let stored = stored_deployment(5);
        let secret = builder().secret(&app).unwrap();
        let service = builder().service(&app).unwrap();

        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(secret.clone())));
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_get_service()
            .returning(move |_, _| Ok(Some(service.clone())));
        mock.expect_replace_deployment()
            .withf(move |ns, d| {
                ns == "ns1"
                    && d.spec.as_ref().and_then(|s| s.replicas) == Some(7)
                    && d.metadata.resource_version.as_deref() == Some("42")
                    && hash_from_labels(d.metadata.labels.as_ref()) == Some(desired_hash.as_str())
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Context::for_testing(Arc::new(mock));
        let outcomes = apply_desired_state(&app, &ctx).await.unwrap();
        assert_eq!(outcomes[1], (ManagedKind::Workload, ReconcileOutcome::Updated));
    }

    /// Story: A foreign image edit survives the hash refresh
    #[tokio::test]
    async fn story_foreign_fields_are_preserved() {
        let app = sample_app(2, "Hi");
        let mut stored = stored_deployment(2);
        // Simulate an unlabeled object with a hand-edited image
        stored.metadata.labels = Some(OperatorConfig::default().selector_labels());
        if let Some(pod) = stored
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        {
            pod.containers[0].image = Some("registry.local/greeter:patched".to_string());
        }

        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_replace_deployment()
            .withf(|_, d| {
                let spec = d.spec.as_ref().unwrap();
                let image = spec.template.spec.as_ref().unwrap().containers[0]
                    .image
                    .as_deref();
                image == Some("registry.local/greeter:patched")
                    && spec.replicas == Some(2)
                    && d.metadata.labels.as_ref().unwrap().get("app")
                        == Some(&"myapplication".to_string())
                    && hash_from_labels(d.metadata.labels.as_ref()).is_some()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Context::for_testing(Arc::new(mock));
        let outcome = reconcile_deployment(&app, &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
    }

    /// Story: The Secret is never rewritten, even when the message changes
    #[tokio::test]
    async fn story_existing_secret_is_left_alone() {
        let stale = builder().secret(&sample_app(2, "Old")).unwrap();
        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(stale.clone())));

        let ctx = Context::for_testing(Arc::new(mock));
        let outcome = reconcile_secret(&sample_app(2, "New"), &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
    }

    /// Story: A drifted Service is reported but not written
    #[tokio::test]
    async fn story_service_drift_is_not_corrected() {
        let mut stored = builder().service(&sample_app(2, "Hi")).unwrap();
        stored.metadata.labels = None;
        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_service()
            .returning(move |_, _| Ok(Some(stored.clone())));

        let ctx = Context::for_testing(Arc::new(mock));
        let outcome = reconcile_service(&sample_app(2, "Hi"), &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
    }

    /// Story: Deployment with a missing spec still gets a hash refresh
    #[tokio::test]
    async fn story_stored_deployment_without_spec_is_relabeled() {
        let mut stored = Deployment {
            metadata: stored_deployment(2).metadata,
            spec: None,
            ..Default::default()
        };
        stored.metadata.labels = None;

        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_replace_deployment()
            .withf(|_, d| d.spec.is_none() && hash_from_labels(d.metadata.labels.as_ref()).is_some())
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Context::for_testing(Arc::new(mock));
        let outcome = reconcile_deployment(&sample_app(2, "Hi"), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
    }

    // =========================================================================
    // Error Propagation Stories
    // =========================================================================

    /// Story: A store failure on fetch aborts the pass before later kinds
    #[tokio::test]
    async fn story_fetch_failure_aborts_pass() {
        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_secret().returning(|_, _| Ok(None));
        mock.expect_create_secret().returning(|_, _| Ok(()));
        mock.expect_get_deployment()
            .returning(|_, _| Err(server_error()));
        mock.expect_get_service().never();

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let err = reconcile(Arc::new(sample_app(2, "Hi")), ctx)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("etcd unavailable"));
    }

    /// Story: An optimistic-concurrency conflict is surfaced, not retried
    #[tokio::test]
    async fn story_conflict_on_replace_propagates() {
        let stored = stored_deployment(5);
        let mut mock = MockApplicationKubeClient::new();
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_replace_deployment()
            .times(1)
            .returning(|_, _| Err(conflict()));

        let ctx = Context::for_testing(Arc::new(mock));
        let err = reconcile_deployment(&sample_app(7, "Hi"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube(kube::Error::Api(ref ae)) if ae.code == 409));
    }

    /// Story: A create failure is returned unmodified
    #[tokio::test]
    async fn story_create_failure_propagates() {
        let mut mock = mock_empty();
        mock.expect_create_secret()
            .times(1)
            .returning(|_, _| Err(server_error()));

        let ctx = Context::for_testing(Arc::new(mock));
        let err = apply_desired_state(&sample_app(1, ""), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube(_)));
    }

    /// Story: Invalid spec waits for a change without touching the store
    #[tokio::test]
    async fn story_invalid_application_awaits_change() {
        let mock = MockApplicationKubeClient::new();
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(sample_app(-1, "Hi")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: An application without a uid cannot own children
    #[tokio::test]
    async fn story_missing_uid_is_not_retried() {
        let mut app = sample_app(1, "");
        app.metadata.uid = None;
        let ctx = Arc::new(Context::for_testing(Arc::new(mock_empty())));

        let err = reconcile(Arc::new(app.clone()), ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(error_policy(Arc::new(app), &err, ctx), Action::await_change());
    }

    // =========================================================================
    // Error Policy Tests
    // =========================================================================

    #[test]
    fn transient_errors_requeue() {
        let ctx = Arc::new(Context::for_testing(Arc::new(
            MockApplicationKubeClient::new(),
        )));
        let action = error_policy(Arc::new(sample_app(1, "")), &server_error(), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }
}
