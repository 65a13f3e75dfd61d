use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use crate::auth::credential::{TokenCredential, TokenType};

pub const AMQPS_PORT: u16 = 5671;
pub const AMQPS_WS_PORT: u16 = 443;
pub const WEBSOCKET_PATH: &str = "/$iothub/websocket";
pub const WEBSOCKET_SUB_PROTOCOL: &str = "AMQPWSB10";

pub const MAX_REACTOR_POLL_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_SEND_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServiceProtocol {
    Amqps,
    /// AMQP tunneled through a WebSocket on port 443
    AmqpsWs,
}

impl ServiceProtocol {
    pub fn port(&self) -> u16 {
        match self {
            ServiceProtocol::Amqps => AMQPS_PORT,
            ServiceProtocol::AmqpsWs => AMQPS_WS_PORT,
        }
    }

    pub fn uses_websocket(&self) -> bool {
        *self == ServiceProtocol::AmqpsWs
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsConfig {
    /// verify the service's certificate chain - only ever switched off in tests
    pub verify_peer: bool,
    /// PEM encoded certificates to trust instead of the platform's trust store
    pub trusted_certificates_pem: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            verify_peer: true,
            trusted_certificates_pem: None,
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub user_name: Option<String>,
    pub password: Option<String>,
}

impl Debug for ProxyConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user_name", &self.user_name)
            .finish()
    }
}

#[derive(Clone)]
pub enum Authentication {
    /// SASL PLAIN with a shared access signature as the password. No CBS session is used,
    ///  and the token is never renewed.
    SaslPlain { user_name: String, sas_token: String },
    /// SASL ANONYMOUS plus tokens that are put to the service's CBS node and renewed
    ///  proactively before they expire
    Cbs { credential: Arc<dyn TokenCredential>, token_type: TokenType },
}

impl Debug for Authentication {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Authentication::SaslPlain { user_name, .. } => write!(f, "SaslPlain({})", user_name),
            Authentication::Cbs { token_type, .. } => write!(f, "Cbs({:?})", token_type),
        }
    }
}

/// The links a connection opens for the application once it is authenticated
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ApplicationLinkKind {
    CloudToDeviceSender,
    FeedbackReceiver,
    FileUploadNotificationReceiver,
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// the hub's host name, e.g. `myhub.azure-devices.net`. It is also the audience of CBS tokens.
    pub host_name: String,
    pub protocol: ServiceProtocol,
    pub authentication: Authentication,
    pub tls: TlsConfig,

    /// Only supported for [ServiceProtocol::AmqpsWs]
    pub proxy: Option<ProxyConfig>,

    pub application_links: Vec<ApplicationLinkKind>,

    /// Upper bound for a single wait for protocol activity inside the reactor loop. This is no
    ///  operation timeout, it only bounds how long timers and commands can be delayed.
    pub reactor_poll_timeout: Duration,

    /// interval at which queued cloud-to-device messages are handed to the engine
    pub send_interval: Duration,

    /// Tokens are renewed after this fraction of their remaining lifetime has passed
    pub token_renewal_factor: f64,

    /// advertised to the service as `com.microsoft:client-version` on every link
    pub client_version: String,
}

impl ConnectionConfig {
    pub fn new(host_name: &str, protocol: ServiceProtocol, authentication: Authentication) -> ConnectionConfig {
        ConnectionConfig {
            host_name: host_name.to_string(),
            protocol,
            authentication,
            tls: TlsConfig::default(),
            proxy: None,
            application_links: Vec::new(),
            reactor_poll_timeout: Duration::from_millis(10),
            send_interval: Duration::from_millis(10),
            token_renewal_factor: 0.85,
            client_version: format!("iothub-amqp/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn uses_cbs(&self) -> bool {
        matches!(self.authentication, Authentication::Cbs { .. })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host_name.is_empty() {
            bail!("host name must not be empty");
        }
        if self.proxy.is_some() && !self.protocol.uses_websocket() {
            bail!("a proxy can only be used with AMQPS over WebSocket");
        }
        if !(self.token_renewal_factor > 0.0 && self.token_renewal_factor <= 1.0) {
            bail!("token renewal factor must be in (0, 1]");
        }
        if self.reactor_poll_timeout.is_zero() || self.reactor_poll_timeout > MAX_REACTOR_POLL_TIMEOUT {
            bail!("reactor poll timeout must be in (0, {:?}]", MAX_REACTOR_POLL_TIMEOUT);
        }
        if self.send_interval.is_zero() || self.send_interval > MAX_SEND_INTERVAL {
            bail!("send interval must be in (0, {:?}]", MAX_SEND_INTERVAL);
        }
        if let Authentication::SaslPlain { user_name, .. } = &self.authentication {
            if user_name.is_empty() {
                bail!("SASL user name must not be empty");
            }
        }
        for (i, kind) in self.application_links.iter().enumerate() {
            if self.application_links[..i].contains(kind) {
                bail!("application link {:?} is configured more than once", kind);
            }
        }
        Ok(())
    }
}
