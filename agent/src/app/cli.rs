//! Command line parsing

use std::path::PathBuf;

use crate::errors::SyncError;
use crate::storage::settings::Settings;

pub const USAGE: &str = "\
Usage: pisync [OPTIONS]

Modes (default: --serve):
  --serve               Run the scheduler until stopped
  --check-now           Check for updates once and exit
  --file <NAME>         Check a single manifest entry once and exit
  --list                Print the files assigned to this device
  --setup               Store the credential and settings
  --diagnostic          Print diagnostic information
  --version             Print version information

Options:
  --server <URL>        Update server base URL
  --key <KEY>           Credential to store (with --setup)
  --interval <SECS>     Seconds between scheduled checks
  --dir <PATH>          Directory synced files are written to
  --config-dir <PATH>   Base directory for settings, credential and state
";

/// What the process was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Serve,
    CheckNow,
    List,
    Setup,
    Diagnostic,
    Version,
    Help,
}

/// Parsed command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub mode: Mode,
    pub server: Option<String>,
    pub key: Option<String>,
    pub file: Option<String>,
    pub interval: Option<u64>,
    pub dir: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
}

const VALUE_FLAGS: &[&str] = &["server", "key", "file", "interval", "dir", "config-dir"];

impl CliArgs {
    /// Parse arguments without the program name.
    ///
    /// Both `--flag=value` and `--flag value` are accepted.
    pub fn parse<I>(args: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = CliArgs::default();
        let mut modes = Vec::new();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let Some(flag) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
                return Err(usage_error(format!("unexpected argument {:?}", arg)));
            };

            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (flag, None),
            };

            if VALUE_FLAGS.contains(&name) {
                let value = match inline {
                    Some(value) => value,
                    None => args
                        .next()
                        .ok_or_else(|| usage_error(format!("--{} needs a value", name)))?,
                };
                parsed.set_value(name, value)?;
                continue;
            }

            if inline.is_some() {
                return Err(usage_error(format!("--{} does not take a value", name)));
            }
            let mode = match name {
                "serve" => Mode::Serve,
                "check-now" => Mode::CheckNow,
                "list" => Mode::List,
                "setup" => Mode::Setup,
                "diagnostic" | "diag" => Mode::Diagnostic,
                "version" | "V" => Mode::Version,
                "help" | "h" => Mode::Help,
                _ => return Err(usage_error(format!("unknown option --{}", name))),
            };
            modes.push(mode);
        }

        if parsed.file.is_some() && !modes.contains(&Mode::Setup) {
            modes.push(Mode::CheckNow);
        }

        // informational modes win over everything else
        parsed.mode = [
            Mode::Help,
            Mode::Version,
            Mode::Diagnostic,
            Mode::Setup,
            Mode::List,
            Mode::CheckNow,
        ]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(Mode::Serve);

        Ok(parsed)
    }

    fn set_value(&mut self, name: &str, value: String) -> Result<(), SyncError> {
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(usage_error(format!("--{} needs a value", name)));
        }
        match name {
            "server" => self.server = Some(value),
            "key" => self.key = Some(value),
            "file" => self.file = Some(value),
            "interval" => {
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| usage_error(format!("--interval expects seconds, got {:?}", value)))?;
                self.interval = Some(secs);
            }
            "dir" => self.dir = Some(PathBuf::from(value)),
            "config-dir" => self.config_dir = Some(PathBuf::from(value)),
            _ => return Err(usage_error(format!("unknown option --{}", name))),
        }
        Ok(())
    }

    /// Apply `--server`, `--interval` and `--dir` on top of the settings file
    pub fn apply_overrides(&self, settings: &mut Settings) -> Result<(), SyncError> {
        if let Some(server) = &self.server {
            settings.server_url = server.clone();
        }
        if let Some(interval) = self.interval {
            settings.check_interval_secs = interval;
        }
        if let Some(dir) = &self.dir {
            settings.download_dir = Some(dir.clone());
        }
        settings.validate()
    }
}

fn usage_error(message: String) -> SyncError {
    SyncError::ConfigError(format!("{}\n\n{}", message, USAGE))
}
