//! Command-line interface.
//!
//! ```ignore
//! use certdeliver::cli::{parse_args, run_cli_command};
//!
//! let command = parse_args(std::env::args())?;
//! run_cli_command(command).await?;
//! ```

pub mod args;
pub mod output;
pub mod run;
pub mod version;

pub use args::{parse_args, ArgsError, CliCommand, USAGE};
pub use version::{handle_version_command, VERSION};

use color_eyre::Result;

/// Run a parsed command to completion.
pub async fn run_cli_command(command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Server { config } => run::run_server(config).await,
        CliCommand::Daemon { config } => run::run_daemon(config).await,
        CliCommand::Cert {
            domains,
            options,
            config,
        } => run::run_cert(domains, options, config).await,
        CliCommand::Status { config } => run::run_status(config).await,
        CliCommand::Version => {
            handle_version_command();
            Ok(())
        }
        CliCommand::Help => {
            println!("{}", USAGE);
            Ok(())
        }
    }
}
