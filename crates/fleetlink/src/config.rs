//! Connection parameters and builder

use std::time::Duration;

/// Transport security mode for the connection to the server.
///
/// TLS material is carried declaratively; a connector implementation decides
/// how to apply it. The in-tree [`TcpConnector`](crate::TcpConnector) only
/// accepts the development modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
    /// No encryption. Development/testing only.
    Plaintext,
    /// TLS without certificate verification. Development/testing only.
    InsecureSkipVerify,
    /// TLS verified against the system trust store
    SystemRoots,
    /// TLS verified against a custom CA bundle
    CustomRoots {
        /// PEM-encoded CA certificate(s)
        ca_pem: Vec<u8>,
    },
    /// Mutual TLS with a client certificate
    Mutual {
        /// PEM-encoded client certificate
        cert_pem: Vec<u8>,
        /// PEM-encoded client private key
        key_pem: Vec<u8>,
        /// PEM-encoded CA certificate(s) for server verification
        ca_pem: Vec<u8>,
    },
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address (host:port)
    pub server_addr: String,
    /// Device identifier assigned at enrollment
    pub device_id: String,
    /// Auth token obtained at enrollment
    pub auth_token: String,
    /// Hostname reported in the hello message
    pub hostname: String,
    /// Agent version reported in the hello message
    pub agent_version: String,
    /// Interval between heartbeat messages
    pub heartbeat_interval: Duration,
    /// Interval between periodic inventory snapshots
    pub inventory_interval: Duration,
    /// Transport security mode
    pub security: TransportSecurity,
}

/// Builder for [`ClientConfig`]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder for the given server address
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                server_addr: server_addr.into(),
                device_id: String::new(),
                auth_token: String::new(),
                hostname: String::new(),
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
                heartbeat_interval: Duration::from_secs(30),
                inventory_interval: Duration::from_secs(24 * 60 * 60),
                security: TransportSecurity::Plaintext,
            },
        }
    }

    /// Set the device identity obtained from enrollment
    pub fn with_auth(mut self, device_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        self.config.device_id = device_id.into();
        self.config.auth_token = auth_token.into();
        self
    }

    /// Set the hostname reported to the server
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Set the agent version reported to the server
    pub fn with_agent_version(mut self, version: impl Into<String>) -> Self {
        self.config.agent_version = version.into();
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the periodic inventory interval
    pub fn with_inventory_interval(mut self, interval: Duration) -> Self {
        self.config.inventory_interval = interval;
        self
    }

    /// Set the transport security mode
    pub fn with_security(mut self, security: TransportSecurity) -> Self {
        self.config.security = security;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ClientBuilder::new("gateway.example:9443").build();

        assert_eq!(config.server_addr, "gateway.example:9443");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.inventory_interval, Duration::from_secs(86400));
        assert_eq!(config.security, TransportSecurity::Plaintext);
    }

    #[test]
    fn test_builder_chaining() {
        let config = ClientBuilder::new("gateway.example:9443")
            .with_auth("dev-42", "secret")
            .with_hostname("workstation-7")
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_security(TransportSecurity::InsecureSkipVerify)
            .build();

        assert_eq!(config.device_id, "dev-42");
        assert_eq!(config.auth_token, "secret");
        assert_eq!(config.hostname, "workstation-7");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.security, TransportSecurity::InsecureSkipVerify);
    }
}
