//! Connection parameters and authentication for SQL Server connections.
//!
//! This module turns the connection details sent by the editor into a
//! tiberius `Config`, supporting:
//! - SQL Server authentication (username/password)
//! - Windows authentication (SSPI/Kerberos, Windows builds only)

use crate::config::ConnectionConfig;
use crate::constants::DEFAULT_PORT;
use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

/// Type alias for a raw tiberius connection.
pub type RawConnection = Client<Compat<TcpStream>>;

/// How the connection authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthenticationType {
    /// SQL Server authentication (username/password)
    #[default]
    SqlLogin,

    /// Windows authentication (Integrated Security)
    Integrated,
}

/// Connection details supplied with a `connection/connect` request.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Server host, optionally `host,port`
    pub server_name: String,

    /// Explicit port, overrides any port in `server_name`
    #[serde(default)]
    pub port: Option<u16>,

    /// Initial database
    #[serde(default)]
    pub database_name: Option<String>,

    #[serde(default)]
    pub authentication_type: AuthenticationType,

    #[serde(default)]
    pub user_name: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Enable TLS encryption, service default when unset
    #[serde(default)]
    pub encrypt: Option<bool>,

    /// Trust server certificate, service default when unset
    #[serde(default)]
    pub trust_server_certificate: Option<bool>,

    /// Connect timeout in seconds, service default when unset
    #[serde(default)]
    pub connect_timeout: Option<u64>,

    #[serde(default)]
    pub application_name: Option<String>,
}

// Hand-written so passwords never reach the logs.
impl std::fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("server_name", &self.server_name)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .field("authentication_type", &self.authentication_type)
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .finish()
    }
}

impl ConnectionDetails {
    /// Split `server_name` into host and port.
    ///
    /// Accepts `host`, `host,port` and `host:port`.
    pub fn host_and_port(&self) -> Result<(String, u16), ServerError> {
        let server = self.server_name.trim();
        if server.is_empty() {
            return Err(ServerError::invalid_input("serverName is required"));
        }

        let (host, embedded_port) = match server.rsplit_once([',', ':']) {
            Some((host, port)) if !host.is_empty() => {
                let port = port.trim().parse::<u16>().map_err(|_| {
                    ServerError::invalid_input(format!("Invalid port in server name '{}'", server))
                })?;
                (host.trim().to_string(), Some(port))
            }
            _ => (server.to_string(), None),
        };

        Ok((host, self.port.or(embedded_port).unwrap_or(DEFAULT_PORT)))
    }
}

/// Configure tiberius authentication method based on the connection details.
pub fn configure_auth(config: &mut Config, details: &ConnectionDetails) -> Result<(), ServerError> {
    match details.authentication_type {
        AuthenticationType::SqlLogin => {
            let username = details
                .user_name
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| ServerError::auth("userName is required for SQL login"))?;
            let password = details.password.as_deref().unwrap_or_default();
            config.authentication(AuthMethod::sql_server(username, password));
            Ok(())
        }
        #[cfg(windows)]
        AuthenticationType::Integrated => {
            config.authentication(AuthMethod::Integrated);
            Ok(())
        }
        #[cfg(not(windows))]
        AuthenticationType::Integrated => Err(ServerError::auth(
            "Integrated authentication is only supported on Windows",
        )),
    }
}

/// Create a tiberius Config from connection details and service defaults.
///
/// This sets up host, port, database and encryption and then applies
/// authentication via `configure_auth`.
pub fn create_config(
    details: &ConnectionDetails,
    defaults: &ConnectionConfig,
) -> Result<Config, ServerError> {
    let (host, port) = details.host_and_port()?;
    let mut config = Config::new();

    config.host(&host);
    config.port(port);

    if let Some(database) = details.database_name.as_deref().filter(|d| !d.is_empty()) {
        config.database(database);
    }

    // Configure encryption
    if details.encrypt.unwrap_or(defaults.encrypt) {
        config.encryption(EncryptionLevel::Required);
    } else {
        config.encryption(EncryptionLevel::Off);
    }

    // Trust server certificate if requested
    if details
        .trust_server_certificate
        .unwrap_or(defaults.trust_server_certificate)
    {
        config.trust_cert();
    }

    config.application_name(
        details
            .application_name
            .as_deref()
            .unwrap_or(&defaults.application_name),
    );

    configure_auth(&mut config, details)?;
    Ok(config)
}

/// Create a raw connection to SQL Server.
///
/// Resolves the configuration, opens the TCP socket and performs the TDS
/// handshake, all bounded by the connect timeout.
pub async fn create_connection(
    details: &ConnectionDetails,
    defaults: &ConnectionConfig,
) -> Result<RawConnection, ServerError> {
    let config = create_config(details, defaults)?;
    let timeout = details
        .connect_timeout
        .map(std::time::Duration::from_secs)
        .unwrap_or(defaults.connect_timeout);

    let connect = async {
        let address = config.get_addr();
        debug!("Creating connection to {}", address);

        let tcp = TcpStream::connect(&address).await.map_err(|e| {
            ServerError::connection_with_source(format!("Failed to connect to {}", address), e)
        })?;

        tcp.set_nodelay(true)
            .map_err(|e| ServerError::connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        // Perform TDS handshake
        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(ServerError::from)?;

        debug!("Connection established successfully");
        Ok::<_, ServerError>(client)
    };

    tokio::time::timeout(timeout, connect).await.map_err(|_| {
        ServerError::connection(format!(
            "Timed out after {}s connecting to {}",
            timeout.as_secs(),
            details.server_name
        ))
    })?
}

/// Truncate a string for logging purposes.
///
/// This is a shared utility for safe logging of potentially long strings.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_login(server: &str) -> ConnectionDetails {
        ConnectionDetails {
            server_name: server.to_string(),
            database_name: Some("master".to_string()),
            user_name: Some("sa".to_string()),
            password: Some("test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_host_and_port() {
        assert_eq!(
            sql_login("localhost").host_and_port().unwrap(),
            ("localhost".to_string(), 1433)
        );
        assert_eq!(
            sql_login("db.local,14330").host_and_port().unwrap(),
            ("db.local".to_string(), 14330)
        );
        assert_eq!(
            sql_login("db.local:1500").host_and_port().unwrap(),
            ("db.local".to_string(), 1500)
        );

        let mut details = sql_login("db.local,14330");
        details.port = Some(2000);
        assert_eq!(details.host_and_port().unwrap().1, 2000);

        assert!(sql_login("").host_and_port().is_err());
        assert!(sql_login("db,notaport").host_and_port().is_err());
    }

    #[test]
    fn test_create_config() {
        let config = create_config(&sql_login("localhost,1444"), &ConnectionConfig::default())
            .unwrap();
        assert_eq!(config.get_addr(), "localhost:1444");
    }

    #[test]
    fn test_sql_login_requires_user() {
        let mut details = sql_login("localhost");
        details.user_name = None;
        let err = create_config(&details, &ConnectionConfig::default()).unwrap_err();
        assert!(matches!(err, ServerError::Authentication(_)));
    }

    #[test]
    fn test_debug_hides_password() {
        let rendered = format!("{:?}", sql_login("localhost"));
        assert!(!rendered.contains("test\""));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_details_deserialize() {
        let details: ConnectionDetails = serde_json::from_value(serde_json::json!({
            "serverName": "localhost",
            "authenticationType": "SqlLogin",
            "userName": "sa",
            "password": "pw",
            "trustServerCertificate": true
        }))
        .unwrap();
        assert_eq!(details.user_name.as_deref(), Some("sa"));
        assert_eq!(details.trust_server_certificate, Some(true));
        assert_eq!(details.encrypt, None);
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(
            truncate_for_log("this is a long string", 10),
            "this is a ..."
        );
        assert_eq!(truncate_for_log("exactly10!", 10), "exactly10!");
        assert_eq!(truncate_for_log("ééé", 3), "é...");
    }
}
