use osmium_stomp::{AckMode, Client, ContentLengthPolicy, HandlerError, Message, StompError};
use std::io::{self, Write};

/// Result of executing a command
pub enum CommandResult {
    /// Command executed successfully
    Ok,
    /// Command requests exit
    Quit,
    /// Informational output for the user
    Info(String),
    /// Error executing command
    Error(String),
}

/// Parse and execute a command
pub async fn execute_command(line: &str, client: &Client, default_ack: AckMode) -> CommandResult {
    let parts: Vec<&str> = line.trim().splitn(3, ' ').collect();
    if parts.is_empty() || parts[0].is_empty() {
        return CommandResult::Ok;
    }

    match parts[0] {
        "quit" | "exit" | "q" => CommandResult::Quit,

        "send" => {
            if parts.len() < 3 {
                return CommandResult::Error("Usage: send <destination> <message>".to_string());
            }
            let headers = vec![("content-type".to_string(), "text/plain".to_string())];
            match client
                .publish(parts[1], parts[2], Some(headers), ContentLengthPolicy::Attach)
                .await
            {
                Ok(()) => CommandResult::Ok,
                Err(e) => CommandResult::Error(format!("Send error: {}", e)),
            }
        }

        "json" => {
            if parts.len() < 3 {
                return CommandResult::Error("Usage: json <destination> <json>".to_string());
            }
            let value: serde_json::Value = match serde_json::from_str(parts[2]) {
                Ok(v) => v,
                Err(e) => return CommandResult::Error(format!("Invalid JSON: {}", e)),
            };
            match client.publish_json(parts[1], &value).await {
                Ok(()) => CommandResult::Ok,
                Err(e) => CommandResult::Error(format!("Send error: {}", e)),
            }
        }

        "sub" | "subscribe" => {
            if parts.len() < 2 {
                return CommandResult::Error("Usage: sub <destination> [ack-mode]".to_string());
            }
            let ack = match parts.get(2) {
                Some(mode) => match mode.trim().parse::<AckMode>() {
                    Ok(m) => m,
                    Err(e) => return CommandResult::Error(e),
                },
                None => default_ack,
            };
            match subscribe_destination(client, parts[1], ack).await {
                Ok(id) => CommandResult::Info(format!("Subscribed to {} as {} ({})", parts[1], id, ack)),
                Err(e) => CommandResult::Error(format!("Failed to subscribe to '{}': {}", parts[1], e)),
            }
        }

        "unsub" | "unsubscribe" => {
            if parts.len() < 2 {
                return CommandResult::Error("Usage: unsub <subscription-id>".to_string());
            }
            match client.unsubscribe(parts[1], None).await {
                Ok(()) => CommandResult::Info(format!("Unsubscribed {}", parts[1])),
                Err(e) => CommandResult::Error(format!("Unsubscribe error: {}", e)),
            }
        }

        "subs" => {
            let subs = client.subscriptions();
            if subs.is_empty() {
                return CommandResult::Info("No subscriptions".to_string());
            }
            let lines: Vec<String> = subs
                .iter()
                .map(|s| format!("  {}  {}  ({})", s.id, s.destination, s.ack))
                .collect();
            CommandResult::Info(lines.join("\n"))
        }

        "status" => CommandResult::Info(format!("{:?}", client.state())),

        "help" | "?" => {
            print_help();
            CommandResult::Ok
        }

        _ => CommandResult::Error(format!("Unknown command: {}. Type 'help' for commands.", parts[0])),
    }
}

/// Subscribe with a handler that prints every message to the console.
pub async fn subscribe_destination(
    client: &Client,
    dest: &str,
    ack: AckMode,
) -> Result<String, StompError> {
    client
        .subscribe(dest, ack, |msg: Message| async move {
            print_message(&msg);
            Ok::<(), HandlerError>(())
        })
        .await
}

fn print_message(msg: &Message) {
    println!(
        "\n[{}] MESSAGE received:",
        msg.destination().unwrap_or(msg.subscription_id())
    );
    for (k, v) in msg.frame().header_pairs() {
        println!("  {}: {}", k, v);
    }
    if !msg.body().is_empty() {
        match msg.body_str() {
            Some(s) => println!("  Body: {}", s),
            None => println!("  Body: ({} bytes, binary)", msg.body().len()),
        }
    }
    print!("> ");
    let _ = io::stdout().flush();
}

/// Print help text
pub fn print_help() {
    println!("Commands:");
    println!("  send <destination> <message>  - Send a text message");
    println!("  json <destination> <json>     - Send a JSON message");
    println!("  sub <destination> [ack-mode]  - Subscribe to a destination");
    println!("  unsub <id>                    - Remove a subscription");
    println!("  subs                          - List subscriptions");
    println!("  status                        - Show connection state");
    println!("  quit                          - Disconnect and exit");
}
