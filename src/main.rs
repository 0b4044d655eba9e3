#![doc = include_str!("../README.md")]

/// Command line arguments.
mod args;
/// OAuth2 flow and credential storage.
mod auth;
/// Adaptive batched request driver.
mod batch;
/// Configuration file options.
mod config;
/// Miniature typed Gmail REST API.
mod gmail;
/// Label/tag translation and filtering.
mod labels;
/// Local notmuch database and maildir interface.
mod local;
/// Remote Gmail interface.
mod remote;
/// Persistent synchronization watermarks.
mod state;
/// Sync command.
mod sync;

use args::{Args, Command};
use atty::Stream;
use clap::Parser;
use config::Config;
use log::debug;
use snafu::prelude::*;
use std::io::Write;
use sync::sync;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not open config file: {}", source))]
    OpenConfigFile { source: config::Error },

    #[snafu(display("Could not authenticate: {}", source))]
    Auth { source: auth::Error },

    #[snafu(display("Could not sync mail: {}", source))]
    Sync { source: sync::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn try_main(stdout: &mut StandardStream) -> Result<(), Error> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let info_color_spec = ColorSpec::new()
        .set_fg(Some(Color::Green))
        .set_bold(true)
        .to_owned();

    let config_path = config::expand_tilde(&args.config);
    let config = Config::from_path(&config_path).context(OpenConfigFileSnafu {})?;
    debug!("Using config: {:?}", config);

    match args.command {
        Command::Auth { no_browser, force } => {
            let store = auth::CredentialStore::open(config.status_dir());
            let authenticator = auth::Authenticator::new(store, config.http_timeout());
            let authenticated = !force
                && matches!(
                    authenticator.store().load(),
                    Ok(Some(credentials)) if !credentials.refresh_token.is_empty()
                );
            if authenticated {
                println!("You are already authenticated.");
            } else {
                authenticator
                    .authenticate(no_browser)
                    .context(AuthSnafu {})?;
                println!("Authentication successful.");
            }
            Ok(())
        }
        Command::Pull => sync(stdout, info_color_spec, config).context(SyncSnafu {}),
        Command::Defconfig => {
            print!("{}", Config::DEFAULT);
            Ok(())
        }
    }
}

fn main() {
    let mut stdout = StandardStream::stdout(if atty::is(Stream::Stdout) {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    });
    let mut stderr = StandardStream::stderr(if atty::is(Stream::Stderr) {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    });

    std::process::exit(match try_main(&mut stdout) {
        Ok(_) => 0,
        Err(Error::Sync {
            source: sync::Error::AlreadyRunning,
        }) => {
            println!("Another instance is already running, nothing to do.");
            0
        }
        Err(Error::Sync { source }) if source.is_interrupted() => {
            writeln!(&mut stderr, "Interrupted.").ok();
            2
        }
        Err(err) => {
            stderr
                .set_color(ColorSpec::new().set_fg(Some(Color::Red)))
                .ok();
            writeln!(&mut stderr, "error: {err}").ok();
            1
        }
    });
}
