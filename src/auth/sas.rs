use std::sync::Arc;
use std::time::{Duration, SystemTime};
use anyhow::{anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use crate::auth::credential::{AccessToken, TokenCredential};
use crate::reactor::clock::{Clock, SystemClock};

type HmacSha256 = Hmac<Sha256>;

const SAS_PREFIX: &str = "SharedAccessSignature ";

/// Signs shared access signatures from a shared access key, one fresh signature per call
pub struct SasTokenCredential {
    resource_uri: String,
    key_name: Option<String>,
    key: Vec<u8>,
    time_to_live: Duration,
    clock: Arc<dyn Clock>,
}

impl SasTokenCredential {
    /// `key` is the base64 encoded shared access key as shown in the portal
    pub fn new(resource_uri: &str, key_name: Option<&str>, key: &str, time_to_live: Duration) -> anyhow::Result<SasTokenCredential> {
        Self::with_clock(resource_uri, key_name, key, time_to_live, Arc::new(SystemClock))
    }

    pub fn with_clock(resource_uri: &str, key_name: Option<&str>, key: &str, time_to_live: Duration, clock: Arc<dyn Clock>) -> anyhow::Result<SasTokenCredential> {
        if resource_uri.is_empty() {
            bail!("resource URI must not be empty");
        }
        if time_to_live.is_zero() {
            bail!("token time to live must be positive");
        }
        let key = STANDARD.decode(key)
            .map_err(|e| anyhow!("shared access key is not valid base64: {}", e))?;

        Ok(SasTokenCredential {
            resource_uri: resource_uri.to_string(),
            key_name: key_name.map(|s| s.to_string()),
            key,
            time_to_live,
            clock,
        })
    }

    /// Builds the signature string for a given expiry in seconds since the Unix epoch
    pub fn build_signature(&self, expiry_epoch_seconds: u64) -> anyhow::Result<String> {
        let encoded_uri = url_encode(&self.resource_uri);
        let string_to_sign = format!("{}\n{}", encoded_uri, expiry_epoch_seconds);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow!("invalid shared access key: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let mut result = format!("{}sr={}&sig={}&se={}", SAS_PREFIX, encoded_uri, url_encode(&signature), expiry_epoch_seconds);
        if let Some(key_name) = &self.key_name {
            result.push_str("&skn=");
            result.push_str(&url_encode(key_name));
        }
        Ok(result)
    }
}

impl TokenCredential for SasTokenCredential {
    fn get_token(&self) -> anyhow::Result<AccessToken> {
        let expires_on = self.clock.wall_clock() + self.time_to_live;
        let expiry = expires_on.duration_since(SystemTime::UNIX_EPOCH)?.as_secs();
        debug!("signing shared access signature for {} valid until {}", self.resource_uri, expiry);

        let token = self.build_signature(expiry)?;
        Ok(AccessToken::new(token, SystemTime::UNIX_EPOCH + Duration::from_secs(expiry)))
    }
}

/// Serves a shared access signature that was created elsewhere. Its expiry is taken from the
///  signature's `se` field.
pub struct FixedSasCredential {
    token: AccessToken,
}

impl FixedSasCredential {
    pub fn new(signature: &str) -> anyhow::Result<FixedSasCredential> {
        let expiry = parse_expiry(signature)?;
        Ok(FixedSasCredential {
            token: AccessToken::new(signature, SystemTime::UNIX_EPOCH + Duration::from_secs(expiry)),
        })
    }
}

impl TokenCredential for FixedSasCredential {
    fn get_token(&self) -> anyhow::Result<AccessToken> {
        Ok(self.token.clone())
    }
}

fn parse_expiry(signature: &str) -> anyhow::Result<u64> {
    let fields = signature.strip_prefix(SAS_PREFIX)
        .unwrap_or(signature);

    for field in fields.split('&') {
        if let Some(value) = field.trim().strip_prefix("se=") {
            return value.parse::<u64>()
                .map_err(|e| anyhow!("invalid 'se' field in shared access signature: {}", e));
        }
    }
    bail!("shared access signature has no 'se' field")
}

/// Percent-encodes everything except the unreserved characters of RFC 3986
pub fn url_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => result.push(b as char),
            _ => result.push_str(&format!("%{:02X}", b)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::reactor::clock::ManualClock;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM="; // "secret-key-for-tests"

    #[rstest]
    #[case::plain("myhub.azure-devices.net", "myhub.azure-devices.net")]
    #[case::path("myhub.azure-devices.net/devices/d1", "myhub.azure-devices.net%2Fdevices%2Fd1")]
    #[case::base64("a+b/c=", "a%2Bb%2Fc%3D")]
    #[case::unreserved("A-z_0.9~", "A-z_0.9~")]
    fn test_url_encode(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(url_encode(raw), expected);
    }

    #[test]
    fn test_sas_token() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let credential = SasTokenCredential::with_clock(
            "myhub.azure-devices.net",
            Some("iothubowner"),
            KEY,
            Duration::from_secs(3600),
            Arc::new(ManualClock::starting_at(start)),
        ).unwrap();

        let token = credential.get_token().unwrap();
        assert_eq!(token.expires_on, start + Duration::from_secs(3600));

        let mut mac = HmacSha256::new_from_slice(b"secret-key-for-tests").unwrap();
        mac.update(b"myhub.azure-devices.net\n1700003600");
        let expected_signature = url_encode(&STANDARD.encode(mac.finalize().into_bytes()));

        assert_eq!(token.token, format!(
            "SharedAccessSignature sr=myhub.azure-devices.net&sig={}&se=1700003600&skn=iothubowner",
            expected_signature,
        ));
    }

    #[test]
    fn test_sas_token_without_key_name() {
        let credential = SasTokenCredential::new("myhub.azure-devices.net", None, KEY, Duration::from_secs(60)).unwrap();
        let signature = credential.build_signature(1234).unwrap();
        assert!(signature.ends_with("&se=1234"));
        assert!(!signature.contains("skn="));
    }

    #[rstest]
    #[case::empty_uri("", KEY, 60)]
    #[case::invalid_key("myhub", "not base64!", 60)]
    #[case::zero_ttl("myhub", KEY, 0)]
    fn test_invalid_sas_credential(#[case] uri: &str, #[case] key: &str, #[case] ttl_secs: u64) {
        assert!(SasTokenCredential::new(uri, None, key, Duration::from_secs(ttl_secs)).is_err());
    }

    #[rstest]
    #[case::full("SharedAccessSignature sr=myhub&sig=abc%3D&se=1700000000&skn=owner", Some(1_700_000_000))]
    #[case::reordered("SharedAccessSignature se=42&sr=myhub&sig=abc", Some(42))]
    #[case::missing("SharedAccessSignature sr=myhub&sig=abc", None)]
    #[case::not_a_number("SharedAccessSignature sr=myhub&sig=abc&se=soon", None)]
    fn test_fixed_sas_expiry(#[case] signature: &str, #[case] expected: Option<u64>) {
        let actual = FixedSasCredential::new(signature).ok()
            .map(|c| c.get_token().unwrap());

        match expected {
            Some(secs) => {
                let token = actual.unwrap();
                assert_eq!(token.expires_on, SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
                assert_eq!(token.token, signature);
            }
            None => assert!(actual.is_none()),
        }
    }
}
