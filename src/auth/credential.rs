use std::fmt::{Debug, Formatter};
use std::time::SystemTime;
#[cfg(test)] use mockall::automock;

/// A token and the point in time it stops being valid
#[derive(Clone, Eq, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: SystemTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> AccessToken {
        AccessToken {
            token: token.into(),
            expires_on,
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_on <= now
    }

    /// seconds since the Unix epoch, as sent in the CBS `expiration` property
    pub fn expiry_epoch_seconds(&self) -> i64 {
        match self.expires_on.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(_) => 0,
        }
    }
}

impl Debug for AccessToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of the tokens that the CBS session puts to the service.
///
/// `get_token` is called on the reactor thread and is allowed to block - the token is needed
///  to build the authentication message, and its expiry determines when the next renewal is
///  scheduled.
#[cfg_attr(test, automock)]
pub trait TokenCredential: Send + Sync + 'static {
    fn get_token(&self) -> anyhow::Result<AccessToken>;
}

/// How the service has to interpret a token
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TokenType {
    /// bearer tokens, e.g. from an identity provider
    JsonWebToken,
    SharedAccessSignature,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::JsonWebToken => "jwt",
            TokenType::SharedAccessSignature => "servicebus.windows.net:sastoken",
        }
    }
}
