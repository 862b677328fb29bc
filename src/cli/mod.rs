//! Command-line surface.
//!
//! ```bash
//! bunnyrs -s -e "ls -la" -p 9000     # server, execute profile
//! bunnyrs -s -sh -p 9000             # server, shell profile
//! bunnyrs -t 127.0.0.1 -p 9000       # client
//! ```
//!
//! `-sh` predates this parser and is not a valid clap short flag (shorts are a
//! single character), so [`normalize_args`] rewrites it to `--shell` first.

use std::ffi::OsString;
use std::net::Ipv4Addr;

use clap::Parser;

use crate::config::{ClientConfig, ConfigError, Mode, Profile, ServerConfig};
use crate::framing::Framing;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "bunnyrs",
    author,
    version,
    about = "bunnyrs - reverse shell tool",
    after_help = "Made with <3 by Arianne"
)]
pub struct Args {
    /// Server mode
    #[arg(short = 's', long = "server")]
    pub server: bool,

    /// Server profile: Reverse Shell - reverse shell available to connected clients (-sh)
    #[arg(long = "shell")]
    pub shell: bool,

    /// Server profile: Execute - on client connection: executes the specified command and sends the output
    #[arg(short = 'e', long = "execute", value_name = "COMMAND", allow_hyphen_values = true)]
    pub execute: Option<String>,

    /// Target IPv4 address
    #[arg(short = 't', long = "target")]
    pub target: Option<String>,

    /// Port number
    #[arg(short = 'p', long = "port", required = true, allow_hyphen_values = true)]
    pub port: String,

    /// Wire format; client and server must agree
    #[arg(long = "framing", value_enum, default_value_t = Framing::LengthPrefixed)]
    pub framing: Framing,
}

/// Rewrites the legacy `-sh` flag to `--shell`. Everything else passes through.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(|arg| {
            let arg: OsString = arg.into();
            if arg == "-sh" {
                OsString::from("--shell")
            } else {
                arg
            }
        })
        .collect()
}

impl Args {
    /// Validates flag combinations and builds the run configuration.
    pub fn into_mode(self) -> Result<Mode, ConfigError> {
        let port = parse_port(&self.port)?;
        let target = self.target.as_deref().map(parse_target).transpose()?;

        if self.shell && self.execute.is_some() {
            return Err(ConfigError::ConflictingProfiles);
        }

        if self.server {
            if target.is_some() {
                return Err(ConfigError::TargetInServerMode);
            }
            let profile = match self.execute {
                Some(command) => Profile::Execute { command },
                None if self.shell => Profile::Shell,
                None => return Err(ConfigError::MissingProfile),
            };
            return ServerConfig::new(port, profile, self.framing).map(Mode::Server);
        }

        let Some(target) = target else {
            return Err(ConfigError::MissingTarget);
        };
        if port == 0 {
            return Err(ConfigError::MissingTarget);
        }
        if self.shell || self.execute.is_some() {
            return Err(ConfigError::ProfileInClientMode);
        }
        Ok(Mode::Client(ClientConfig::new(target, port, self.framing)))
    }
}

pub fn parse_port(value: &str) -> Result<u16, ConfigError> {
    let port: i64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::PortNotANumber)?;
    u16::try_from(port).map_err(|_| ConfigError::PortOutOfRange)
}

/// Accepts exactly four dot-separated decimal octets.
pub fn parse_target(value: &str) -> Result<Ipv4Addr, ConfigError> {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() != 4 {
        return Err(ConfigError::InvalidTarget);
    }
    let mut octets = [0u8; 4];
    for (octet, part) in octets.iter_mut().zip(parts) {
        *octet = part.parse().map_err(|_| ConfigError::InvalidTarget)?;
    }
    Ok(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Mode, ConfigError> {
        let argv = normalize_args(std::iter::once("bunnyrs").chain(args.iter().copied()));
        Args::try_parse_from(argv).unwrap().into_mode()
    }

    #[test]
    fn test_legacy_sh_flag_selects_shell_profile() {
        let mode = parse(&["-s", "-sh", "-p", "9000"]).unwrap();
        let Mode::Server(config) = mode else {
            panic!("expected server mode");
        };
        assert_eq!(config.profile(), &Profile::Shell);
        assert_eq!(config.port(), 9000);
        assert_eq!(config.framing(), Framing::LengthPrefixed);
    }

    #[test]
    fn test_execute_profile_keeps_command() {
        let mode = parse(&["-s", "-e", "ls -la", "-p", "9000", "--framing", "unframed"]).unwrap();
        let Mode::Server(config) = mode else {
            panic!("expected server mode");
        };
        assert_eq!(
            config.profile(),
            &Profile::Execute {
                command: "ls -la".to_string()
            }
        );
        assert_eq!(config.framing(), Framing::Unframed);
    }

    #[test]
    fn test_client_mode_requires_target() {
        assert_eq!(parse(&["-p", "9000"]), Err(ConfigError::MissingTarget));
    }

    #[test]
    fn test_client_mode_rejects_port_zero() {
        assert_eq!(
            parse(&["-t", "127.0.0.1", "-p", "0"]),
            Err(ConfigError::MissingTarget)
        );
    }

    #[test]
    fn test_client_mode_builds_client_config() {
        let mode = parse(&["-t", "10.0.0.7", "-p", "4444"]).unwrap();
        assert_eq!(
            mode,
            Mode::Client(ClientConfig::new(
                Ipv4Addr::new(10, 0, 0, 7),
                4444,
                Framing::LengthPrefixed
            ))
        );
    }

    #[test]
    fn test_server_mode_rejects_target() {
        let err = parse(&["-s", "-sh", "-t", "127.0.0.1", "-p", "9000"]).unwrap_err();
        assert_eq!(err, ConfigError::TargetInServerMode);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_server_mode_requires_a_profile() {
        assert_eq!(parse(&["-s", "-p", "9000"]), Err(ConfigError::MissingProfile));
    }

    #[test]
    fn test_both_profiles_conflict() {
        assert_eq!(
            parse(&["-s", "-sh", "-e", "id", "-p", "9000"]),
            Err(ConfigError::ConflictingProfiles)
        );
    }

    #[test]
    fn test_client_mode_rejects_profiles() {
        assert_eq!(
            parse(&["-t", "127.0.0.1", "-sh", "-p", "9000"]),
            Err(ConfigError::ProfileInClientMode)
        );
    }

    #[test]
    fn test_blank_execute_command_is_rejected() {
        assert_eq!(
            parse(&["-s", "-e", "   ", "-p", "9000"]),
            Err(ConfigError::EmptyCommand)
        );
    }

    #[test]
    fn test_port_validation() {
        assert_eq!(parse_port("65535"), Ok(65535));
        assert_eq!(parse_port("0"), Ok(0));
        assert_eq!(parse_port("65536"), Err(ConfigError::PortOutOfRange));
        assert_eq!(parse_port("-1"), Err(ConfigError::PortOutOfRange));
        assert_eq!(parse_port("http"), Err(ConfigError::PortNotANumber));
    }

    #[test]
    fn test_target_validation() {
        assert_eq!(parse_target("192.168.1.20"), Ok(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(parse_target("256.0.0.1"), Err(ConfigError::InvalidTarget));
        assert_eq!(parse_target("10.0.0"), Err(ConfigError::InvalidTarget));
        assert_eq!(parse_target("localhost"), Err(ConfigError::InvalidTarget));
        assert_eq!(parse_target("1.2.3.-4"), Err(ConfigError::InvalidTarget));
    }

    #[test]
    fn test_missing_port_is_a_usage_error() {
        let argv = normalize_args(["bunnyrs", "-t", "127.0.0.1"]);
        let err = Args::try_parse_from(argv).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
