use osmium_stomp::{
    AckMode, Client, ClientConfig, ConnectionEvent, StompError, parse_heartbeat_header,
};
use std::io::{self, BufRead, Write};
use tokio::sync::{broadcast, mpsc};

use super::args::Cli;
use super::commands::{CommandResult, execute_command, print_help, subscribe_destination};
use super::exit_codes;

/// Run the CLI in plain line mode
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    let ack: AckMode = cli
        .ack
        .parse()
        .map_err(|e: String| (e, exit_codes::USAGE_ERROR))?;
    let (hb_out, hb_in) = parse_heartbeat_header(&cli.heartbeat);

    let mut config = ClientConfig::new(cli.address.clone())
        .with_credentials(cli.login.clone(), cli.passcode.clone())
        .with_heartbeat(hb_out, hb_in);
    if cli.no_reconnect {
        config = config.without_reconnect();
    }

    println!("Connecting to {}...", cli.address);
    let client = Client::new(config);
    client
        .connect()
        .await
        .map_err(|e| format_connection_error(&e, &cli.address))?;
    println!("Connected.");

    for dest in &cli.subscribe {
        let id = subscribe_destination(&client, dest, ack)
            .await
            .map_err(|e| {
                (
                    format!("Failed to subscribe to '{}': {}", dest, e),
                    exit_codes::PROTOCOL_ERROR,
                )
            })?;
        println!("Subscribed to: {} ({})", dest, id);
    }

    // Report connection events as they happen
    let mut events = client.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Error(err)) => eprintln!("\n[ERROR] {}", err),
                Ok(ConnectionEvent::Reconnecting { attempt, delay }) => {
                    eprintln!("\n[RECONNECTING] attempt {} in {:?}", attempt, delay)
                }
                Ok(ConnectionEvent::Connected(info)) => eprintln!(
                    "\n[CONNECTED] session {}",
                    info.session_id.as_deref().unwrap_or("-")
                ),
                Ok(ConnectionEvent::Disconnected) => {
                    eprintln!("\n[DISCONNECTED]");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
            print!("> ");
            let _ = io::stdout().flush();
        }
    });

    // Channel to receive user commands from stdin reader
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(16);

    // Spawn blocking stdin reader
    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(l) => {
                    if cmd_tx.blocking_send(l).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    println!();
    print_help();
    println!();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let line = match cmd_rx.recv().await {
            Some(l) => l,
            None => break,
        };

        match execute_command(&line, &client, ack).await {
            CommandResult::Ok => {}
            CommandResult::Quit => break,
            CommandResult::Info(msg) => println!("{}", msg),
            CommandResult::Error(msg) => eprintln!("{}", msg),
        }
    }

    println!("Disconnecting...");
    client
        .disconnect()
        .await
        .map_err(|e| (format!("Disconnect failed: {}", e), exit_codes::NETWORK_ERROR))
}

/// Map a connect failure to a message and exit code
fn format_connection_error(err: &StompError, address: &str) -> (String, u8) {
    match err {
        StompError::TransportUnavailable(io_err) => {
            let message = match io_err.kind() {
                io::ErrorKind::ConnectionRefused => format!("Connection refused: {}", address),
                io::ErrorKind::TimedOut => format!("Connection timed out: {}", address),
                _ => format!("Connection failed: {}", io_err),
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        StompError::HandshakeRejected { message, body } => {
            let mut message = format!("Authentication failed: {}", message);
            if let Some(body) = body {
                message.push_str(&format!(" ({})", body));
            }
            (message, exit_codes::AUTH_ERROR)
        }
        StompError::InvalidUrl(msg) => (format!("Invalid address: {}", msg), exit_codes::USAGE_ERROR),
        StompError::InvalidHeader(msg) => (format!("Invalid credentials: {}", msg), exit_codes::USAGE_ERROR),
        other => (format!("Protocol error: {}", other), exit_codes::PROTOCOL_ERROR),
    }
}
