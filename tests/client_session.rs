//! Drives the interactive client against a live server with scripted input.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bunnyrs::client::{Client, ClientError, ClientExit};
use bunnyrs::config::{ClientConfig, Profile, ServerConfig};
use bunnyrs::exec::SystemShell;
use bunnyrs::framing::Framing;
use bunnyrs::server::Server;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn start(profile: Profile, framing: Framing) -> Server {
    let config =
        ServerConfig::with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, profile, framing)
            .unwrap();
    let server = Server::bind(config, Arc::new(SystemShell::new()), CancellationToken::new())
        .await
        .unwrap();
    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    server
}

fn client_config(server: &Server, framing: Framing) -> ClientConfig {
    ClientConfig::new(Ipv4Addr::LOCALHOST, server.local_addr().port(), framing)
}

async fn drive(
    config: &ClientConfig,
    script: &'static [u8],
    shutdown: CancellationToken,
) -> (ClientExit, String) {
    let client = Client::connect(config).await.unwrap();
    let mut output = Vec::new();
    let exit = timeout(WAIT, client.run(script, &mut output, shutdown))
        .await
        .expect("client loop did not finish")
        .unwrap();
    (exit, String::from_utf8_lossy(&output).into_owned())
}

#[tokio::test]
async fn test_execute_result_is_printed_then_disconnects() {
    let server = start(
        Profile::Execute {
            command: "echo ready".to_string(),
        },
        Framing::LengthPrefixed,
    )
    .await;
    let config = client_config(&server, Framing::LengthPrefixed);

    let (exit, output) = drive(&config, b"ls\n", CancellationToken::new()).await;

    assert_eq!(exit, ClientExit::Disconnected);
    assert!(output.contains("<# Execute #>"));
    assert!(output.contains("ready"));
    server.shutdown().await;
}

#[tokio::test]
async fn test_shell_round_trip_until_input_ends() {
    let server = start(Profile::Shell, Framing::LengthPrefixed).await;
    let config = client_config(&server, Framing::LengthPrefixed);

    let (exit, output) = drive(&config, b"echo hi\n", CancellationToken::new()).await;

    assert_eq!(exit, ClientExit::Terminated);
    assert!(output.contains("<# Reverse shell as "));
    assert!(output.contains("hi\n"));
    assert!(output.contains("Client terminated."));
    server.shutdown().await;
}

#[tokio::test]
async fn test_unframed_client_skips_empty_lines() {
    let server = start(Profile::Shell, Framing::Unframed).await;
    let config = client_config(&server, Framing::Unframed);

    // Without skipping, the blank line would block on a reply that never comes.
    let (exit, output) = drive(&config, b"\necho bunny\n", CancellationToken::new()).await;

    assert_eq!(exit, ClientExit::Terminated);
    assert!(output.contains("bunny\n"));
    server.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_client_terminates() {
    let server = start(Profile::Shell, Framing::LengthPrefixed).await;
    let config = client_config(&server, Framing::LengthPrefixed);

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let (exit, output) = drive(&config, b"echo never\n", shutdown).await;

    assert_eq!(exit, ClientExit::Terminated);
    assert!(!output.contains("never"));
    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_refused_is_reported() {
    let port = {
        let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap().port()
    };
    let config = ClientConfig::new(Ipv4Addr::LOCALHOST, port, Framing::LengthPrefixed);

    match Client::connect(&config).await {
        Err(ClientError::Refused { addr }) => {
            assert_eq!(addr.port(), port);
        }
        Err(other) => panic!("expected Refused, got {other}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}
