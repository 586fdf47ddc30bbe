//! Command-line argument parsing.

use std::path::PathBuf;

use thiserror::Error;

use crate::client::BatchOptions;

/// Parsed CLI command to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Run the certificate push server
    Server { config: Option<PathBuf> },
    /// Run the long-lived client daemon
    Daemon { config: Option<PathBuf> },
    /// Download bundles into the work directory, optionally deploying them.
    /// No domains means the configured sites' domains.
    Cert {
        domains: Vec<String>,
        options: BatchOptions,
        config: Option<PathBuf>,
    },
    /// Print the server's connection and certificate status
    Status { config: Option<PathBuf> },
    Version,
    Help,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArgsError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("{0} requires a value")]
    MissingValue(&'static str),
}

pub const USAGE: &str = "\
usage: certdeliver <command> [options]

commands:
  server  [-c FILE]                 run the certificate push server
  daemon  [-c FILE]                 run the client daemon
  cert    [domain...] [options]     download certificate bundles
  status  [-c FILE]                 show server status

options:
  -c, --config FILE  JSON configuration file
  -V, --version      print version
  -h, --help         print this help

cert options:
  -d, --domains LIST  comma-separated domains (default: configured sites)
  -f, --force         request the bundle even if unchanged
  --deploy            copy bundles to their site targets, then reload
  --dry-run           show what would be deployed and reloaded
  --reload-cmd CMD    reload command overriding the configured ones";

/// Parse command-line arguments. The first item is the program name.
///
/// ```
/// use certdeliver::cli::args::{parse_args, CliCommand};
///
/// let args = vec!["certdeliver".to_string(), "--version".to_string()];
/// assert_eq!(parse_args(args.into_iter()), Ok(CliCommand::Version));
/// ```
pub fn parse_args<I>(args: I) -> Result<CliCommand, ArgsError>
where
    I: Iterator<Item = String>,
{
    let mut args = args.skip(1);

    let Some(command) = args.next() else {
        return Ok(CliCommand::Help);
    };

    match command.as_str() {
        "--version" | "-V" | "version" => return Ok(CliCommand::Version),
        "--help" | "-h" | "help" => return Ok(CliCommand::Help),
        "server" | "daemon" | "cert" | "status" => {}
        other => return Err(ArgsError::UnknownCommand(other.to_string())),
    }

    let cert = command == "cert";
    let mut config = None;
    let mut options = BatchOptions::default();
    let mut domains = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let value = args.next().ok_or(ArgsError::MissingValue("--config"))?;
                config = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            "--force" | "-f" if cert => options.force = true,
            "--deploy" if cert => options.deploy = true,
            "--dry-run" if cert => options.dry_run = true,
            "--reload-cmd" if cert => {
                let value = args.next().ok_or(ArgsError::MissingValue("--reload-cmd"))?;
                options.reload_cmd = Some(value);
            }
            "-d" | "--domains" if cert => {
                let value = args.next().ok_or(ArgsError::MissingValue("--domains"))?;
                push_domains(&mut domains, &value);
            }
            value if cert && !value.starts_with('-') => push_domains(&mut domains, value),
            other => return Err(ArgsError::UnexpectedArgument(other.to_string())),
        }
    }

    Ok(match command.as_str() {
        "server" => CliCommand::Server { config },
        "daemon" => CliCommand::Daemon { config },
        "status" => CliCommand::Status { config },
        _ => CliCommand::Cert {
            domains,
            options,
            config,
        },
    })
}

/// Append comma-separated domains, skipping blanks and repeats.
fn push_domains(domains: &mut Vec<String>, list: &str) {
    for domain in list.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        if !domains.iter().any(|d| d == domain) {
            domains.push(domain.to_string());
        }
    }
}
