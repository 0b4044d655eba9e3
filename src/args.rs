use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Path to config file.
    #[clap(
        short,
        long,
        env = "NOTMUCH_GMAIL_CONFIG",
        default_value = "~/.notmuch-gmail.toml"
    )]
    pub config: PathBuf,

    #[clap(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authenticate against Gmail servers.
    Auth {
        /// Do not try to open a web browser for authentication.
        #[clap(short, long)]
        no_browser: bool,

        /// Ignore existing credentials.
        #[clap(short, long)]
        force: bool,
    },
    /// Pull changes from Gmail and push local tag changes back.
    Pull,
    /// Print the default configuration to standard output.
    Defconfig,
}
