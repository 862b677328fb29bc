//! Immutable run configuration.
//!
//! The CLI layer validates flags once and produces a [`Mode`]; from then on the
//! server and client only ever see these values, never raw flags.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;

use crate::framing::Framing;

/// Exit status for validation and runtime failures.
pub const EXIT_FAILURE: i32 = 1;
/// Exit status for mutually exclusive flags used together.
pub const EXIT_CONFLICT: i32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Can't set a target in Server mode")]
    TargetInServerMode,
    #[error("Server mode needs a profile: either --shell (-sh) or --execute (-e)")]
    MissingProfile,
    #[error("Can't use --shell (-sh) and --execute (-e) together")]
    ConflictingProfiles,
    #[error("Client mode needs a target (--target (-t) and --port (-p))")]
    MissingTarget,
    #[error("Can't set --shell (-sh) or --execute (-e) in Client mode")]
    ProfileInClientMode,
    #[error("command is empty")]
    EmptyCommand,
    #[error("port is not a number")]
    PortNotANumber,
    #[error("port should be between 0 and 65535")]
    PortOutOfRange,
    #[error("target is not an IPv4 address")]
    InvalidTarget,
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::TargetInServerMode
            | ConfigError::ConflictingProfiles
            | ConfigError::ProfileInClientMode => EXIT_CONFLICT,
            _ => EXIT_FAILURE,
        }
    }
}

/// What the server does with each connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    /// Run one fixed command, send its output, close.
    Execute { command: String },
    /// Interactive loop: every received line is run through the shell.
    Shell,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Execute { command } => write!(f, "execute `{command}`"),
            Profile::Shell => write!(f, "shell"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    bind_address: IpAddr,
    port: u16,
    profile: Profile,
    framing: Framing,
}

impl ServerConfig {
    /// Binds on all IPv4 interfaces, as the server always has.
    pub const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    pub fn new(port: u16, profile: Profile, framing: Framing) -> Result<Self, ConfigError> {
        Self::with_bind_address(Self::DEFAULT_BIND, port, profile, framing)
    }

    pub fn with_bind_address(
        bind_address: IpAddr,
        port: u16,
        profile: Profile,
        framing: Framing,
    ) -> Result<Self, ConfigError> {
        if let Profile::Execute { command } = &profile {
            if command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand);
            }
        }
        Ok(Self {
            bind_address,
            port,
            profile,
            framing,
        })
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    target: Ipv4Addr,
    port: u16,
    framing: Framing,
}

impl ClientConfig {
    pub fn new(target: Ipv4Addr, port: u16, framing: Framing) -> Self {
        Self {
            target,
            port,
            framing,
        }
    }

    pub fn target(&self) -> Ipv4Addr {
        self.target
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.target), self.port)
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

/// The validated outcome of command-line parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
}
