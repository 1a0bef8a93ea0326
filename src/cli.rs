//! Command line definitions for the `pullcord` and `genhash` binaries

use crate::password::MINIMUM_ITERATIONS;
use clap::{builder::styling::{AnsiColor, Effects, Styles}, Arg, ArgAction, ArgMatches, ColorChoice, Command};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pullcord.json";

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
}

pub fn daemon_command() -> Command {
    Command::new("pullcord")
        .about("Authenticating reverse proxy that wakes sleeping backends")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles())
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to the JSON configuration file")
                .default_value(DEFAULT_CONFIG_PATH)
                .env("PULLCORD_CONFIG")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config-fallback")
                .long("config-fallback")
                .help("Serve a landing page on port 80 if the configuration file cannot be opened")
                .value_name("BOOL")
                .num_args(0..=1)
                .require_equals(true)
                .default_value("false")
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
}

pub fn genhash_command() -> Command {
    Command::new("genhash")
        .about("Generate a PBKDF2 password record for an inmempwdstore")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles())
        .arg(
            Arg::new("iterations")
                .long("iterations")
                .help("PBKDF2 iteration count (4096 to 65535)")
                .default_value("4096")
                .value_parser(clap::value_parser!(u16).range(i64::from(MINIMUM_ITERATIONS)..)),
        )
        .arg(
            Arg::new("password")
                .long("password")
                .help("Password to hash; read from the first line of stdin when empty"),
        )
}

/// Long options that may also be spelled with a single dash
const DAEMON_LONG_FLAGS: &[&str] = &["config", "config-fallback", "verbose"];
const GENHASH_LONG_FLAGS: &[&str] = &["iterations", "password"];

/// Rewrite `-name` and `-name=value` to their `--` form when `name` is one
/// of `long_flags`. Everything else is left for clap.
fn normalize_long_flags<I, T>(args: I, long_flags: &[&str]) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let rewritten = arg.to_str().and_then(|s| {
                let rest = s.strip_prefix('-').filter(|r| !r.starts_with('-'))?;
                let name = rest.split_once('=').map_or(rest, |(name, _)| name);
                long_flags.contains(&name).then(|| OsString::from(format!("-{}", s)))
            });
            rewritten.unwrap_or(arg)
        })
        .collect()
}

pub fn parse_daemon_args<I, T>(args: I) -> Result<ArgMatches, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    daemon_command().try_get_matches_from(normalize_long_flags(args, DAEMON_LONG_FLAGS))
}

pub fn parse_genhash_args<I, T>(args: I) -> Result<ArgMatches, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    genhash_command().try_get_matches_from(normalize_long_flags(args, GENHASH_LONG_FLAGS))
}

/// Install the global subscriber. `RUST_LOG` wins over the default level.
pub fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pullcord=info"));
    if verbose {
        filter = filter.add_directive("pullcord=debug".parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
