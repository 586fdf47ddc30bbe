//! Deploying received certificates to their final locations.

pub mod command;
pub mod deployer;

pub use command::{CommandError, CommandRunner, ProcessRunner};
pub use deployer::{deploy_with_retry, find_site, DeployError, DeployOutcome, Deployer, SiteDeploy};
