//! # bunnyrs - minimal remote command execution
//!
//! bunnyrs is a small client/server tool. The server listens on a TCP port and,
//! depending on its profile, either runs one fixed command for every client or
//! hands every client an interactive shell. The client connects, prints what the
//! server sends and relays the operator's input.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run a command for whoever connects
//! bunnyrs -s -e "uname -a" -p 9000
//!
//! # Interactive shell server
//! bunnyrs -s -sh -p 9000
//!
//! # Connect
//! bunnyrs -t 127.0.0.1 -p 9000
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bunnyrs::config::{Profile, ServerConfig};
//! use bunnyrs::exec::SystemShell;
//! use bunnyrs::framing::Framing;
//! use bunnyrs::server::Server;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServerConfig::new(9000, Profile::Shell, Framing::LengthPrefixed)?;
//! let shutdown = CancellationToken::new();
//! let server = Server::bind(config, Arc::new(SystemShell::new()), shutdown.clone()).await?;
//!
//! let accept_loop = tokio::spawn({
//!     let server = server.clone();
//!     async move { server.run().await }
//! });
//!
//! // Later: stop accepting, close every session, wait for their tasks.
//! shutdown.cancel();
//! accept_loop.await?;
//! server.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[Framing](framing)**: length-prefixed and legacy unframed wire formats
//! - **[Exec](exec)**: `sh -c` command execution behind the `CommandExecutor` trait
//! - **[Server](server)**: accept loop, session registry, graceful shutdown
//! - **[Client](client)**: interactive prompt loop
//! - **[Config](config)** and **[CLI](cli)**: validated, immutable run settings
//!
//! ## Security
//!
//! There is none, on purpose: no authentication, no encryption, no sandboxing.
//! Anyone who can reach the port can run commands as the server's user. The
//! `sudo` refusal in the shell profile is a courtesy, not a control.

pub mod cli;
pub mod client;
pub mod config;
pub mod exec;
pub mod framing;
pub mod server;
pub mod style;
