use clap::{Args, Subcommand};
use std::path::PathBuf;

use ipclink_connection::ConnectionObserver;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod echo;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the echo protocol on a socket.
    Echo(EchoArgs),
    /// Send echo requests and print the replies.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Exit after serving N clients.
    #[arg(long)]
    pub clients: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Text to echo.
    #[arg(long)]
    pub text: String,
    /// Number of requests to send, one after another.
    #[arg(long, default_value = "1")]
    pub count: u64,
    /// Maximum time for the whole exchange (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Reports connection events through the log.
#[derive(Debug)]
pub struct LoggingObserver {
    pub role: &'static str,
}

impl ConnectionObserver for LoggingObserver {
    fn may_have_become_unresponsive(&self) {
        tracing::debug!(role = self.role, "peer may have become unresponsive");
    }

    fn did_become_responsive(&self) {
        tracing::trace!(role = self.role, "peer responsive");
    }

    fn die(&self) {
        tracing::debug!(role = self.role, "connection closed");
    }
}
