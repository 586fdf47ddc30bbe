//! Reload commands: validation, tokenising and timed execution.
//!
//! Commands never go through a shell. Anything that would need one
//! (separators, pipes, substitutions, redirections) is rejected up front.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Default limit for a single reload command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

const FORBIDDEN: &[&str] = &[";", "&", "|", "`", "$(", "${", ">", "<"];

/// Command errors
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command contains unsafe sequence {0:?}")]
    Unsafe(&'static str),

    #[error("sudo is not allowed in reload commands")]
    Sudo,

    #[error("empty command")]
    Empty,

    #[error("unterminated quote in command")]
    UnterminatedQuote,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with {status}: {output}")]
    Failed { status: String, output: String },
}

/// Reject commands that rely on shell features.
pub fn validate(cmd: &str) -> Result<(), CommandError> {
    if let Some(pattern) = FORBIDDEN.iter().find(|p| cmd.contains(**p)) {
        return Err(CommandError::Unsafe(*pattern));
    }
    if cmd.trim_start().starts_with("sudo ") {
        return Err(CommandError::Sudo);
    }
    Ok(())
}

/// Split on whitespace honouring single quotes, double quotes and
/// backslash escapes.
pub fn split(cmd: &str) -> Result<Vec<String>, CommandError> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => return Err(CommandError::UnterminatedQuote),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(CommandError::UnterminatedQuote);
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Validate and split into program and arguments.
pub fn parse(cmd: &str) -> Result<(String, Vec<String>), CommandError> {
    validate(cmd)?;
    let mut args = split(cmd)?;
    if args.is_empty() {
        return Err(CommandError::Empty);
    }
    let program = args.remove(0);
    Ok((program, args))
}

/// Run `cmd` without a shell, returning its combined stdout and stderr.
pub async fn execute(cmd: &str, timeout: Duration) -> Result<String, CommandError> {
    let (program, args) = parse(cmd)?;

    let mut command = Command::new(&program);
    command.args(&args).kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| CommandError::Timeout(timeout))?
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim().to_string();

    if output.status.success() {
        Ok(combined)
    } else {
        Err(CommandError::Failed {
            status: output.status.to_string(),
            output: combined,
        })
    }
}

/// Executes reload commands; swapped out in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &str) -> Result<String, CommandError>;
}

/// Runs commands as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &str) -> Result<String, CommandError> {
        info!(command = %cmd, "Running reload command");
        match execute(cmd, self.timeout).await {
            Ok(output) => {
                info!(command = %cmd, output = %output, "Reload command succeeded");
                Ok(output)
            }
            Err(e) => {
                warn!(command = %cmd, error = %e, "Reload command failed");
                Err(e)
            }
        }
    }
}
