//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{io, path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::{
    cmd::crd::CustomResourceDefinitionError,
    svc::{
        cfg::Configuration,
        crd::{disposable_request, request},
        http::server,
        k8s::{client, Context, Watcher},
    },
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// CommandError enum

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<CommandError>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(CustomResourceDefinitionError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definitions
    #[command(name = "custom-resource-definition", visible_alias = "crd")]
    CustomResourceDefinition,
}

#[async_trait]
impl Executor for Command {
    type Error = CommandError;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition => crd::view(config)
                .await
                .map_err(CommandError::CustomResourceDefinition)
                .map_err(|err| {
                    CommandError::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(kubeconfig: Option<PathBuf>, config: Arc<Configuration>) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig).await.map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create the context shared across every reconciler
    let context = Arc::new(Context::new(kube_client, config.to_owned()));
    let request_context = context.to_owned();
    let disposable_request_context = context.to_owned();

    // -------------------------------------------------------------------------
    // Create reconcilers
    let handles = vec![
        tokio::spawn(async move {
            let reconciler = request::Reconciler::default();

            info!("Start to listen for events of the Request custom resource");
            if let Err(err) = reconciler.watch(request_context).await {
                error!(error = %err, "Could not reconcile Request custom resource");
                abort();
            }
        }),
        tokio::spawn(async move {
            let reconciler = disposable_request::Reconciler::default();

            info!("Start to listen for events of the DisposableRequest custom resource");
            if let Err(err) = reconciler.watch(disposable_request_context).await {
                error!(error = %err, "Could not reconcile DisposableRequest custom resource");
                abort();
            }
        }),
    ];

    // -------------------------------------------------------------------------
    // Create http server
    let server = tokio::spawn(async move {
        if let Err(err) = server::serve(config).await {
            error!(error = %err, "Could not serve http server");
            abort();
        }
    });

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c().await.map_err(DaemonError::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel reconcilers
    handles.iter().for_each(|handle| handle.abort());
    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(error = %err, "Could not wait for the task to complete");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancel http server
    server.abort();
    if let Err(err) = server.await {
        if !err.is_cancelled() {
            error!(error = %err, "Could not wait for the http server to gracefully close");
        }
    }

    Ok(())
}
