//! Dragonflow local controller entry point.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use df_controller::{
    Controller, ControllerConfig, MplsApp, MutationRetry, StaticPortResolver,
};
use df_model::ModelRegistry;
use df_nb::{EtcdBackend, KvNbDriver, NbApi};
use df_pipeline::FlowPipeline;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

/// Dragonflow local controller
#[derive(Parser, Debug)]
#[command(name = "df-local-controller")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Northbound store URL, overrides the config file
    #[arg(long)]
    backend_url: Option<String>,

    /// Name of this node; registered as a chassis on startup
    #[arg(long)]
    chassis: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    info!("====================================================================");
    info!("Starting Dragonflow local controller");
    info!("====================================================================");

    match run(args).await {
        Ok(()) => {
            info!("Controller stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Controller failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)?,
        None => {
            info!("No config file given, using defaults");
            ControllerConfig::default()
        }
    };
    if let Some(url) = args.backend_url {
        config.nb.backend_url = url;
    }
    config.validate()?;
    let mpls = config.mpls_settings()?;

    info!("Northbound store: {}", config.nb.backend_url);
    info!("Update policy: {:?}", config.nb.update_policy);
    info!("Bridge: {}", mpls.bridge);
    info!("Uplink: {} ({}, {})", mpls.uplink_port, mpls.interface_ip, mpls.mac);
    if mpls.nexthop_macs.is_empty() {
        warn!("No next-hop MACs configured, remote labeled routes will not resolve");
    }

    let registry = Arc::new(ModelRegistry::with_builtin_models()?);
    let backend = Arc::new(EtcdBackend::new(config.etcd_config()).context("creating etcd client")?);
    let driver = Arc::new(KvNbDriver::with_config(
        backend,
        registry,
        config.driver_config(),
    ));

    if let Some(name) = &args.chassis {
        driver
            .add_chassis(name, IpAddr::V4(mpls.interface_ip), "mpls")
            .await
            .with_context(|| format!("registering chassis {name}"))?;
        info!("Registered chassis {}", name);
    }

    let pipeline = Arc::new(FlowPipeline::new());
    let ports = Arc::new(
        StaticPortResolver::new(config.port_map()).requiring([mpls.uplink_port.clone()]),
    );

    let mut controller = Controller::new(ports.clone());
    controller.add_app(Arc::new(MplsApp::new(
        driver.clone(),
        pipeline,
        ports,
        mpls,
        MutationRetry::new(config.pipeline.retry_policy()),
    )));

    info!("Attaching datapath...");
    controller.attach_datapath().await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    let shutdown_handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received SIGINT, shutting down gracefully...");
                signal_token.cancel();
            }
            Err(err) => {
                error!("Failed to listen for ctrl-c: {}", err);
            }
        }
    });

    info!("Watching northbound store...");
    let result = driver.watch(&controller, shutdown).await;
    shutdown_handle.abort();
    result.context("northbound watch failed")
}
