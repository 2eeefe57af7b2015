use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "wikid",
    about = "wikid: a TiddlyWeb-compatible server for single-file TiddlyWiki",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the wiki until interrupted
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    Config,
    /// Open the configured store and report what it holds
    Stats,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// TiddlyWiki HTML file served at `/`
    #[arg(long)]
    pub index: Option<PathBuf>,
    /// Attachment directory
    #[arg(long)]
    pub files: Option<PathBuf>,
}
