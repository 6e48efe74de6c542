//! MyApplication operator - reconciles MyApplication resources into a running microservice

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use myapp_operator::config::{OperatorConfig, DEFAULT_IMAGE, DEFAULT_NODE_PORT, DEFAULT_PORT};
use myapp_operator::controller::{error_policy, reconcile, Context};
use myapp_operator::crd::{crd_yaml, MyApplication};
use myapp_operator::probe::{probe, KubeDiscovery};
use myapp_operator::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use myapp_operator::FIELD_MANAGER;

/// MyApplication operator - runs a greeting microservice per MyApplication resource
#[derive(Parser, Debug)]
#[command(
    name = "myapp-operator",
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Print the MyApplication CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    // Controller settings when no subcommand is given
    #[command(flatten)]
    run: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    /// Controller settings, from the subcommand or the top-level flags
    fn controller_args(self) -> ControllerArgs {
        match self.command {
            Some(Commands::Controller(args)) => args,
            None => self.run,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Controller(ControllerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Container image of the managed microservice
    #[arg(long, env = "MYAPP_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    /// Container and Service port
    #[arg(long, env = "MYAPP_PORT", default_value_t = DEFAULT_PORT)]
    port: i32,

    /// NodePort the Service is exposed on
    #[arg(long, env = "MYAPP_NODE_PORT", default_value_t = DEFAULT_NODE_PORT)]
    node_port: i32,

    /// Install or update the MyApplication CRD before starting
    #[arg(long, env = "MYAPP_INSTALL_CRD")]
    install_crd: bool,
}

impl ControllerArgs {
    fn operator_config(&self) -> anyhow::Result<OperatorConfig> {
        let config = OperatorConfig::default()
            .with_image(self.image.clone())
            .with_port(self.port)
            .with_node_port(self.node_port);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client's TLS stack needs a process-wide provider before any connection
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    let result = run_controller(cli.controller_args()).await;

    shutdown_telemetry();
    result
}

/// Install or update the MyApplication CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing MyApplication CRD...");
    crds.patch(
        "myapplications.sample.myapp.dev",
        &params,
        &Patch::Apply(&MyApplication::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MyApplication CRD: {}", e))?;

    Ok(())
}

/// Run the MyApplication controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = Arc::new(args.operator_config()?);
    tracing::info!(
        image = %config.image,
        port = config.port,
        node_port = config.node_port,
        "Starting MyApplication controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let capabilities = probe(&KubeDiscovery::new(client.clone())).await;
    let ctx = Arc::new(Context::from_client(client.clone(), config, capabilities));

    let applications: Api<MyApplication> = Api::all(client.clone());
    let watcher_config = WatcherConfig::default().timeout(25);

    Controller::new(applications, watcher_config.clone())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config.clone())
        .owns(Api::<Service>::all(client.clone()), watcher_config.clone())
        .owns(Api::<Secret>::all(client), watcher_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(
                        app = %obj.name,
                        ?action,
                        "MyApplication reconciliation completed"
                    );
                }
                Err(e) => {
                    tracing::error!(error = ?e, "MyApplication reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("MyApplication controller shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Parsing reads MYAPP_* from the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: [&str; 4] = [
        "MYAPP_IMAGE",
        "MYAPP_PORT",
        "MYAPP_NODE_PORT",
        "MYAPP_INSTALL_CRD",
    ];

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("myapp-operator").chain(args.iter().copied()))
    }

    #[test]
    fn default_mode_uses_published_ports() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let args = parse(&[]).controller_args();
        assert_eq!(args.image, DEFAULT_IMAGE);
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.node_port, DEFAULT_NODE_PORT);
        assert!(!args.install_crd);
        assert!(args.operator_config().is_ok());
    }

    #[test]
    fn controller_subcommand_matches_default_mode() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let args = parse(&["controller"]).controller_args();
        assert_eq!(args.port, 8081);
        assert_eq!(args.node_port, 30548);
        assert!(!args.install_crd);
    }

    #[test]
    fn flags_override_image_and_ports() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for prefix in [&[][..], &["controller"][..]] {
            let mut argv: Vec<&str> = prefix.to_vec();
            argv.extend([
                "--image",
                "registry.local/greeter:2",
                "--port",
                "9090",
                "--node-port",
                "31000",
                "--install-crd",
            ]);
            let args = parse(&argv).controller_args();
            let config = args.operator_config().unwrap();
            assert_eq!(config.image, "registry.local/greeter:2");
            assert_eq!(config.port, 9090);
            assert_eq!(config.node_port, 31000);
            assert!(args.install_crd);
        }
    }

    #[test]
    fn env_vars_apply_in_default_mode() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("MYAPP_IMAGE", "registry.local/greeter:env");
        std::env::set_var("MYAPP_NODE_PORT", "31000");
        std::env::set_var("MYAPP_INSTALL_CRD", "true");

        let default_mode = parse(&[]).controller_args();
        let subcommand = parse(&["controller"]).controller_args();

        for var in ENV_VARS {
            std::env::remove_var(var);
        }

        for args in [default_mode, subcommand] {
            assert_eq!(args.image, "registry.local/greeter:env");
            assert_eq!(args.node_port, 31000);
            assert_eq!(args.port, DEFAULT_PORT);
            assert!(args.install_crd);
        }
    }

    #[test]
    fn out_of_range_node_port_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let args = parse(&["--node-port", "80"]).controller_args();
        assert!(args.operator_config().is_err());
    }

    #[test]
    fn crd_flag_parses_without_subcommand() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let cli = parse(&["--crd"]);
        assert!(cli.crd);
        assert!(cli.command.is_none());
    }

    #[test]
    fn top_level_flags_conflict_with_subcommand() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let result = Cli::try_parse_from(["myapp-operator", "--port", "9090", "controller"]);
        assert!(result.is_err());
    }
}
