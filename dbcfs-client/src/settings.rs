//! Client settings.
//!
//! Settings are resolved in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML settings file (if specified via DBCFS_CONFIG)
//! 3. Environment variables
//!
//! A JDBC-style connection URL can be applied on top with
//! [`ClientSettings::apply_url`].

use crate::connection::{ConnectionConfig, DataPort};
use crate::error::ClientError;
use crate::tls::TlsMode;
use dbcfs_protocol::Profile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const JDBC_DEFAULT_USER: &str = "DEFAULTUSER";
const JDBC_DEFAULT_PASSWORD: &str = "PASSWORD";
const DEFAULT_DATABASE: &str = "DEFAULT";

/// Connection settings as they appear in a settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Server host name or address.
    pub host: String,
    /// Service port. Unset means 9584, or 9585 with encryption.
    pub port: Option<u16>,
    #[serde(with = "profile_serde")]
    pub profile: Profile,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Wrap every socket in TLS.
    pub encryption: bool,
    /// Set to false to refuse TLS even when encryption is requested.
    pub tls_enabled: bool,
    /// Validate the server certificate instead of accepting any.
    pub verify_server: bool,
    /// PEM file with the CA certificates to validate against.
    pub ca_cert_path: Option<PathBuf>,
    /// -1 listens on an ephemeral port, 0 lets the server pick, N listens on N.
    pub local_port: i64,
    pub keepalive: bool,
    pub connect_timeout_secs: Option<u64>,
    pub accept_timeout_secs: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            profile: Profile::File,
            user: None,
            password: None,
            database: None,
            encryption: false,
            tls_enabled: true,
            verify_server: false,
            ca_cert_path: None,
            local_port: -1,
            keepalive: true,
            connect_timeout_secs: None,
            accept_timeout_secs: None,
        }
    }
}

impl ClientSettings {
    /// Loads settings from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(path) = std::env::var("DBCFS_CONFIG") {
            settings = Self::from_file(&path)?;
        }

        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Loads settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let settings: ClientSettings = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(settings)
    }

    /// Loads settings from environment variables only.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    /// Builds settings from a connection URL alone.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_url(url)?;
        Ok(settings)
    }

    /// Saves settings to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `DBCFS_*` overrides from `lookup`. Unparseable values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("DBCFS_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("DBCFS_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = Some(parsed);
            }
        }
        if let Some(profile) = lookup("DBCFS_PROFILE") {
            if let Ok(parsed) = profile.parse() {
                self.profile = parsed;
            }
        }
        if let Some(user) = lookup("DBCFS_USER") {
            self.user = Some(user);
        }
        if let Some(password) = lookup("DBCFS_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(database) = lookup("DBCFS_DATABASE") {
            self.database = Some(database);
        }
        if let Some(encryption) = lookup("DBCFS_ENCRYPTION") {
            if let Some(on) = parse_switch(&encryption) {
                self.encryption = on;
            }
        }
        if let Some(keepalive) = lookup("DBCFS_KEEPALIVE") {
            if let Some(on) = parse_switch(&keepalive) {
                self.keepalive = on;
            }
        }
        if let Some(local_port) = lookup("DBCFS_LOCAL_PORT") {
            if let Ok(parsed) = local_port.parse() {
                self.local_port = parsed;
            }
        }
    }

    /// Applies a `jdbc:fsN://host[:port]/database[;key=value]...` URL.
    ///
    /// Recognized keys are `localport`, `encryption` and `keepalive`;
    /// `authfile` and unknown keys are ignored. The URL selects the JDBC
    /// profile.
    pub fn apply_url(&mut self, url: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl(format!("{}: {}", reason, url));

        let rest = strip_prefix_ignore_case(url, "jdbc:").ok_or_else(|| invalid("not a jdbc URL"))?;
        let (subprotocol, rest) = rest
            .split_once("://")
            .ok_or_else(|| invalid("missing '://'"))?;
        if !matches!(subprotocol.to_ascii_lowercase().as_str(), "fs4" | "fs5" | "fs6") {
            return Err(invalid("unsupported subprotocol"));
        }

        let (location, tail) = match rest.split_once('/') {
            Some((location, tail)) => (location, Some(tail)),
            None => (rest, None),
        };

        let (host, port) = match location.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, Some(port))
            }
            None => (location, None),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let mut database = DEFAULT_DATABASE;
        let mut local_port = self.local_port;
        let mut encryption = self.encryption;
        let mut keepalive = self.keepalive;

        if let Some(tail) = tail {
            let mut parts = tail.split(';');
            if let Some(name) = parts.next().filter(|name| !name.is_empty()) {
                database = name;
            }
            for param in parts.filter(|p| !p.is_empty()) {
                let (key, value) = param.split_once('=').unwrap_or((param, ""));
                match key.to_ascii_lowercase().as_str() {
                    "localport" => {
                        local_port = value.parse().map_err(|_| invalid("bad localport"))?;
                    }
                    "encryption" => {
                        encryption = parse_switch(value).ok_or_else(|| invalid("bad encryption"))?;
                    }
                    "keepalive" => {
                        keepalive = parse_switch(value).ok_or_else(|| invalid("bad keepalive"))?;
                    }
                    "authfile" => {}
                    other => tracing::debug!("ignoring URL parameter '{}'", other),
                }
            }
        }

        self.profile = Profile::Jdbc;
        self.host = host.to_string();
        if port.is_some() {
            self.port = port;
        }
        self.database = Some(database.to_string());
        self.local_port = local_port;
        self.encryption = encryption;
        self.keepalive = keepalive;
        Ok(())
    }

    fn tls_mode(&self) -> TlsMode {
        if self.verify_server || self.ca_cert_path.is_some() {
            TlsMode::Verified {
                ca_cert_path: self.ca_cert_path.clone(),
            }
        } else {
            TlsMode::Anonymous
        }
    }

    /// Resolves defaults and produces a validated [`ConnectionConfig`].
    ///
    /// Missing JDBC credentials fall back to `DEFAULTUSER`/`PASSWORD`; a
    /// missing database falls back to `DEFAULT`.
    pub fn to_connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let (default_user, default_password) = match self.profile {
            Profile::Jdbc => (JDBC_DEFAULT_USER, JDBC_DEFAULT_PASSWORD),
            Profile::File => ("", ""),
        };
        let user = self.user.as_deref().unwrap_or(default_user);
        let password = self.password.as_deref().unwrap_or(default_password);
        let database = self.database.as_deref().unwrap_or(DEFAULT_DATABASE);
        let data_port = DataPort::from_local_port(self.local_port).map_err(validation)?;

        let mut config = ConnectionConfig::new(self.host.clone())
            .with_profile(self.profile)
            .with_credentials(user, password)
            .with_database(database)
            .with_encryption(self.encryption)
            .with_tls_enabled(self.tls_enabled)
            .with_tls_mode(self.tls_mode())
            .with_data_port(data_port)
            .with_keepalive(self.keepalive);

        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.accept_timeout_secs {
            config = config.with_accept_timeout(Duration::from_secs(secs));
        }

        config.validate().map_err(validation)?;
        Ok(config)
    }
}

impl TryFrom<&ClientSettings> for ConnectionConfig {
    type Error = ConfigError;

    fn try_from(settings: &ClientSettings) -> Result<Self, Self::Error> {
        settings.to_connection_config()
    }
}

fn validation(err: ClientError) -> ConfigError {
    match err {
        ClientError::Config(msg) => ConfigError::ValidationError(msg),
        other => ConfigError::ValidationError(other.to_string()),
    }
}

/// Parses on/off style switches.
fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &s[prefix.len()..])
}

/// Settings error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    InvalidUrl(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read settings file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse settings file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidUrl(msg) => {
                write!(f, "invalid connection URL ({})", msg)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "settings validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

/// Profiles are written as their lowercase names in YAML.
mod profile_serde {
    use dbcfs_protocol::Profile;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(profile: &Profile, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&profile.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Profile, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = ClientSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.profile, Profile::File);
        assert_eq!(settings.local_port, -1);
        assert!(settings.keepalive);
        assert!(settings.tls_enabled);
        assert!(!settings.encryption);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.yaml");
        std::fs::write(
            &path,
            "host: fs.example.com\n\
             port: 9600\n\
             profile: jdbc\n\
             user: alice\n\
             password: secret\n\
             database: SALES\n\
             local_port: 0\n\
             keepalive: false\n\
             connect_timeout_secs: 5\n",
        )
        .unwrap();

        let settings = ClientSettings::from_file(&path).unwrap();
        assert_eq!(settings.host, "fs.example.com");
        assert_eq!(settings.port, Some(9600));
        assert_eq!(settings.profile, Profile::Jdbc);
        assert_eq!(settings.user.as_deref(), Some("alice"));
        assert_eq!(settings.database.as_deref(), Some("SALES"));
        assert_eq!(settings.local_port, 0);
        assert!(!settings.keepalive);
        // Unset keys keep their defaults.
        assert!(settings.tls_enabled);

        let config = settings.to_connection_config().unwrap();
        assert_eq!(config.service_port(), 9600);
        assert_eq!(config.data_port, DataPort::ServerAssigned);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.accept_timeout, None);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.yaml");
        let err = ClientSettings::from_file(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "profile: cobol\n").unwrap();
        let err = ClientSettings::from_file(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.yaml");

        let mut settings = ClientSettings::default();
        settings.host = "10.1.2.3".to_string();
        settings.profile = Profile::Jdbc;
        settings.ca_cert_path = Some(PathBuf::from("/etc/dbcfs/ca.pem"));
        settings.save(&path).unwrap();

        assert_eq!(ClientSettings::from_file(&path).unwrap(), settings);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DBCFS_HOST", "override.example.com"),
            ("DBCFS_PORT", "9700"),
            ("DBCFS_PROFILE", "sql"),
            ("DBCFS_USER", "bob"),
            ("DBCFS_ENCRYPTION", "on"),
            ("DBCFS_KEEPALIVE", "off"),
            ("DBCFS_LOCAL_PORT", "4000"),
        ]
        .into_iter()
        .collect();

        let mut settings = ClientSettings::default();
        settings.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.host, "override.example.com");
        assert_eq!(settings.port, Some(9700));
        assert_eq!(settings.profile, Profile::Jdbc);
        assert_eq!(settings.user.as_deref(), Some("bob"));
        assert!(settings.encryption);
        assert!(!settings.keepalive);
        assert_eq!(settings.local_port, 4000);
        assert_eq!(settings.password, None);
    }

    #[test]
    fn test_unparseable_overrides_ignored() {
        let mut settings = ClientSettings::default();
        settings.apply_overrides(|key| match key {
            "DBCFS_PORT" => Some("not-a-port".to_string()),
            "DBCFS_ENCRYPTION" => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(settings.port, None);
        assert!(!settings.encryption);
    }

    #[test]
    fn test_url_full() {
        let settings = ClientSettings::from_url(
            "jdbc:fs6://db.example.com:9600/SALES;localport=0;encryption=on;keepalive=off;authfile=/tmp/auth",
        )
        .unwrap();

        assert_eq!(settings.profile, Profile::Jdbc);
        assert_eq!(settings.host, "db.example.com");
        assert_eq!(settings.port, Some(9600));
        assert_eq!(settings.database.as_deref(), Some("SALES"));
        assert_eq!(settings.local_port, 0);
        assert!(settings.encryption);
        assert!(!settings.keepalive);
    }

    #[test]
    fn test_url_defaults() {
        let settings = ClientSettings::from_url("jdbc:fs5://db.example.com").unwrap();
        assert_eq!(settings.port, None);
        assert_eq!(settings.database.as_deref(), Some("DEFAULT"));
        assert_eq!(settings.local_port, -1);

        let config = settings.to_connection_config().unwrap();
        assert_eq!(config.profile, Profile::Jdbc);
        assert_eq!(config.user, "DEFAULTUSER");
        assert_eq!(config.password, "PASSWORD");
        assert_eq!(config.database, "DEFAULT");
        assert_eq!(config.data_port, DataPort::Ephemeral);
        assert_eq!(config.service_port(), 9584);
    }

    #[test]
    fn test_url_keeps_other_settings() {
        let mut settings = ClientSettings {
            user: Some("carol".to_string()),
            port: Some(9700),
            ..ClientSettings::default()
        };
        settings.apply_url("JDBC:FS4://host/INVENTORY").unwrap();
        assert_eq!(settings.user.as_deref(), Some("carol"));
        assert_eq!(settings.port, Some(9700));
        assert_eq!(settings.database.as_deref(), Some("INVENTORY"));
    }

    #[test]
    fn test_url_rejected() {
        for url in [
            "http://db.example.com/SALES",
            "jdbc:fs6:db.example.com",
            "jdbc:mysql://db.example.com/SALES",
            "jdbc:fs6://:9584/SALES",
            "jdbc:fs6://db.example.com:port/SALES",
            "jdbc:fs6://db.example.com/SALES;localport=abc",
            "jdbc:fs6://db.example.com/SALES;encryption=sometimes",
        ] {
            let err = ClientSettings::from_url(url).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidUrl(_)), "{}", url);
        }
    }

    #[test]
    fn test_tls_mode_selection() {
        let mut settings = ClientSettings::default();
        assert_eq!(settings.tls_mode(), TlsMode::Anonymous);

        settings.verify_server = true;
        assert_eq!(settings.tls_mode(), TlsMode::Verified { ca_cert_path: None });

        settings.verify_server = false;
        settings.ca_cert_path = Some(PathBuf::from("ca.pem"));
        assert_eq!(
            settings.tls_mode(),
            TlsMode::Verified {
                ca_cert_path: Some(PathBuf::from("ca.pem"))
            }
        );
    }

    #[test]
    fn test_validation_errors() {
        let settings = ClientSettings {
            local_port: 70000,
            ..ClientSettings::default()
        };
        let err = settings.to_connection_config().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let settings = ClientSettings {
            encryption: true,
            tls_enabled: false,
            ..ClientSettings::default()
        };
        let err = settings.to_connection_config().unwrap_err();
        assert!(err.to_string().contains("TLS"));

        let client_err: ClientError = err.into();
        assert_eq!(client_err.kind(), crate::ErrorKind::Usage);
    }
}
