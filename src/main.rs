// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! dummy-operator - runs the Dummy controller against a cluster.

#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dummy_operator::config::OperatorConfig;
use dummy_operator::controller_context::{Backoff, ControllerContext};
use dummy_operator::controller_manager::ControllerManager;
use dummy_operator::{Dummy, DummyController, KubeStore, PodTemplate, Reconciler, OPERATOR_NAME};

/// Dummy operator
///
/// Watches Dummy resources, echoes their message into the status and keeps
/// one nginx pod running per Dummy.
#[derive(Parser, Debug)]
#[command(name = "dummy-operator")]
#[command(version)]
#[command(about = "Kubernetes operator for Dummy resources", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Namespace to watch (all namespaces when omitted)
    #[arg(long)]
    namespace: Option<String>,

    /// The address to serve health checks on
    #[arg(long)]
    healthz_bind_address: Option<String>,

    /// The port to serve health checks on
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Number of Dummies reconciled in parallel
    #[arg(long)]
    concurrent_dummy_syncs: Option<u16>,

    /// Print the Dummy CustomResourceDefinition as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&Dummy::crd())?);
        return Ok(());
    }

    init_logging(&args.log_level, args.log_json)?;

    info!(version = dummy_operator::VERSION, "starting {}", OPERATOR_NAME);

    let config = load_config(args).await?;
    config.validate().context("invalid configuration")?;

    info!(
        namespace = config.generic.namespace.as_deref().unwrap_or("*"),
        concurrency = config.generic.concurrent_dummy_syncs,
        image = %config.pod.image,
        "configuration loaded"
    );

    let client = create_client(&config).await?;

    let store = Arc::new(KubeStore::new(client.clone()));
    let reconciler = Reconciler::with_template(store, PodTemplate::from(&config.pod));
    let ctx = ControllerContext::new(reconciler, Backoff::from_config(&config.backoff));
    let controller = DummyController::new(client, ctx)
        .with_namespace(config.generic.namespace.clone())
        .with_concurrency(config.generic.concurrent_dummy_syncs);

    let mut manager = ControllerManager::new(config);
    manager.register_controller(Arc::new(controller));

    let shutdown_token = manager.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        shutdown_token.cancel();
    });

    if let Err(e) = manager.run().await {
        error!("controller manager failed: {:#}", e);
        return Err(e.into());
    }

    info!("{} exited successfully", OPERATOR_NAME);
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {level}"))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file and applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<OperatorConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<OperatorConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        OperatorConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(namespace) = args.namespace {
        config.generic.namespace = Some(namespace);
    }
    if let Some(address) = args.healthz_bind_address {
        config.generic.healthz_bind_address = address;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }
    if let Some(concurrency) = args.concurrent_dummy_syncs {
        config.generic.concurrent_dummy_syncs = concurrency;
    }

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &OperatorConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.generic.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    kube::Client::try_from(kube_config).context("failed to create kubernetes client")
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down");
    }
}
