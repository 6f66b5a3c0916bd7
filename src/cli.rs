//! Command-line flags
//!
//! Flags override the file field by field through `CliOverrides::apply`.
//! Every override is re-applied after a reload so a SIGHUP never silently
//! drops what the operator passed on the command line.

use crate::config::{LogLevel, RelayConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Values passed on the command line that win over the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    /// `-t`: header read deadline in seconds.
    pub client_read: Option<u64>,
    /// `-m`: cipher method, may carry the `-auth` suffix.
    pub method: Option<String>,
    /// `-d`: force debug logging.
    pub debug: bool,
    pub log_level: Option<String>,
}

impl CliOverrides {
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(secs) = self.client_read {
            config.timeouts.client_read = secs;
        }
        if let Some(ref method) = self.method {
            config.general.method = method.clone();
            config.normalize();
        }
        if let Some(level) = self.log_level() {
            config.general.log_level = level;
        }
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        if self.debug {
            Some(LogLevel::Debug)
        } else {
            self.log_level.as_deref().map(LogLevel::from_str_loose)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run { config_path: String, overrides: CliOverrides },
    Help,
    Version,
}

pub fn usage() -> String {
    let mut out = String::new();
    out.push_str("Usage: ssrelay [OPTIONS]\n\n");
    out.push_str("Options:\n");
    out.push_str("  -c <FILE>               Config file (default: config.toml)\n");
    out.push_str("  -t <SECS>               Header read timeout in seconds\n");
    out.push_str("  -m <METHOD>             Cipher method, append -auth to force one-time-auth\n");
    out.push_str("  -d                      Debug logging\n");
    out.push_str("  --log-level <LEVEL>     debug|verbose|normal|silent\n");
    out.push_str("  --version, -V           Show version\n");
    out.push_str("  --help, -h              Show this help\n");
    out
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} needs a value"))
}

/// Parse arguments, program name excluded.
pub fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut config_path = DEFAULT_CONFIG_PATH.to_string();
    let mut overrides = CliOverrides::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                config_path = value(args, &mut i, "-c")?.to_string();
            }
            "-t" | "--timeout" => {
                let raw = value(args, &mut i, "-t")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| format!("-t expects seconds, got '{raw}'"))?;
                overrides.client_read = Some(secs);
            }
            "-m" | "--method" => {
                overrides.method = Some(value(args, &mut i, "-m")?.to_string());
            }
            "-d" | "--debug" => {
                overrides.debug = true;
            }
            "--log-level" => {
                overrides.log_level = Some(value(args, &mut i, "--log-level")?.to_string());
            }
            s if s.starts_with("--log-level=") => {
                overrides.log_level = Some(s.trim_start_matches("--log-level=").to_string());
            }
            "--help" | "-h" => return Ok(Command::Help),
            "--version" | "-V" | "-v" => return Ok(Command::Version),
            s if !s.starts_with('-') => {
                config_path = s.to_string();
            }
            other => return Err(format!("Unknown option: {other}")),
        }
        i += 1;
    }

    Ok(Command::Run { config_path, overrides })
}
