//! Command execution.

use crate::Commands;
use colored::Colorize;
use dbcfs_client::handshake::Handshake;
use dbcfs_client::{select_bootstrap, Connection, ConnectionConfig, Reply};
use std::time::Duration;

/// Executes a command and returns the formatted output.
pub async fn execute(
    config: &ConnectionConfig,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Hello => {
            let greeting = Handshake::new(config)?.probe().await?;
            Ok(format!(
                "{}\n  Version: {}\n  Major version: {}\n  Bootstrap: {:?}",
                greeting.text.green(),
                greeting.version,
                greeting.major_version,
                select_bootstrap(greeting.major_version)
            ))
        }

        Commands::Connect => {
            let conn = connect(config).await?;
            let output = describe(&conn);
            conn.close().await?;
            Ok(output)
        }

        Commands::Call {
            function,
            target,
            payload,
            json,
        } => {
            let conn = connect(config).await?;
            let payload = payload.unwrap_or_default();
            let result = conn.call(&target, &function, payload.as_bytes()).await;
            conn.close().await?;
            let reply = result?;

            if json {
                Ok(format_json(&reply)?)
            } else {
                Ok(format!(
                    "{} {}\n{}",
                    "Status".bold(),
                    reply.status.as_str().green(),
                    reply.payload_str()
                ))
            }
        }

        Commands::Hold { seconds } => {
            let conn = connect(config).await?;
            eprintln!("{}", describe(&conn));
            eprintln!("{}", "Press Ctrl+C to disconnect...".dimmed());

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {
                    eprintln!();
                }
            }

            let alive = conn.is_connected();
            conn.close().await?;
            if alive {
                Ok(format!("{} session {}", "Closed".green(), conn.connection_id().cyan()))
            } else {
                Err("session was lost while holding".into())
            }
        }
    }
}

async fn connect(config: &ConnectionConfig) -> Result<Connection, Box<dyn std::error::Error>> {
    Connection::connect(config.clone()).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e.into()
    })
}

fn describe(conn: &Connection) -> String {
    let heartbeat = match conn.keepalive_interval() {
        Some(interval) => format!("every {}s", interval.as_secs()),
        None => "off".to_string(),
    };
    format!(
        "{} {}\n  Connection id: {}\n  Profile: {}\n  Heartbeat: {}",
        "Connected to".green(),
        conn.greeting().text,
        conn.connection_id().cyan(),
        conn.profile(),
        heartbeat
    )
}

fn format_json(reply: &Reply) -> Result<String, serde_json::Error> {
    let value = serde_json::json!({
        "status": reply.status.as_str(),
        "ok": reply.status.is_ok(),
        "payload": reply.payload_str(),
    });
    serde_json::to_string_pretty(&value)
}
