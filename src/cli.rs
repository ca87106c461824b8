use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mdp-controller")]
#[command(about = "Managed data plane rollout controller")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check cluster connectivity and permissions
    Check,

    /// Manage the DataPlaneControl CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Run the controller's reconcile loop
    Run,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}
