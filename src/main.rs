//! dbcfs - Command-line client for DB/C FS servers
//!
//! Probes servers, establishes sessions and runs one-off requests.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use dbcfs_client::{ClientSettings, Profile};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbcfs")]
#[command(about = "Command-line client for DB/C FS servers")]
#[command(version)]
struct Cli {
    /// Connection URL, e.g. jdbc:fs6://host:9584/DATABASE;localport=0
    #[arg(long, env = "DBCFS_URL")]
    url: Option<String>,

    /// Server host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Service port (defaults to 9584, or 9585 with --encrypt)
    #[arg(short, long)]
    port: Option<u16>,

    /// Client profile: file or jdbc
    #[arg(long)]
    profile: Option<Profile>,

    /// User name
    #[arg(short, long)]
    user: Option<String>,

    /// Password
    #[arg(long)]
    password: Option<String>,

    /// File set or database to attach to
    #[arg(short, long)]
    database: Option<String>,

    // ===== Session Options =====
    /// Encrypt all sockets with TLS
    #[arg(long)]
    encrypt: bool,

    /// Validate the server certificate against this PEM CA file
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Live socket port: -1 ephemeral listener, 0 server-assigned, N listen on N
    #[arg(long, allow_hyphen_values = true)]
    local_port: Option<i64>,

    /// Do not ask the server for heartbeats
    #[arg(long)]
    no_keepalive: bool,

    /// Seconds to wait for TCP connects
    #[arg(long)]
    connect_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Probe the server version
    Hello,

    /// Establish a session, print its details and disconnect
    Connect,

    /// Send one request and print the reply
    Call {
        /// Function mnemonic
        #[arg(short, long)]
        function: String,

        /// Target field
        #[arg(short, long, default_value = "")]
        target: String,

        /// Request payload
        payload: Option<String>,

        /// Print the reply as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stay connected with heartbeats running
    Hold {
        /// How long to hold the session
        #[arg(short, long, default_value = "60")]
        seconds: u64,
    },
}

impl Cli {
    /// Layers URL and flags over the loaded settings.
    fn settings(&self) -> Result<ClientSettings, Box<dyn std::error::Error>> {
        let mut settings = ClientSettings::load()?;

        if let Some(ref url) = self.url {
            settings.apply_url(url)?;
        }
        if let Some(ref host) = self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = Some(port);
        }
        if let Some(profile) = self.profile {
            settings.profile = profile;
        }
        if let Some(ref user) = self.user {
            settings.user = Some(user.clone());
        }
        if let Some(ref password) = self.password {
            settings.password = Some(password.clone());
        }
        if let Some(ref database) = self.database {
            settings.database = Some(database.clone());
        }
        if self.encrypt {
            settings.encryption = true;
        }
        if let Some(ref path) = self.ca_cert {
            settings.ca_cert_path = Some(path.clone());
        }
        if let Some(local_port) = self.local_port {
            settings.local_port = local_port;
        }
        if self.no_keepalive {
            settings.keepalive = false;
        }
        if let Some(secs) = self.connect_timeout {
            settings.connect_timeout_secs = Some(secs);
        }

        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.settings().and_then(|s| Ok(s.to_connection_config()?)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    };

    tracing::debug!(
        "target {}:{} as {} ({})",
        config.host,
        config.service_port(),
        config.user,
        config.profile
    );

    match commands::execute(&config, cli.command).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
