//! Credentials section of the configuration.

use std::path::PathBuf;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use taxpoynt_common::SecurityContext;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum SecurityConfigError {
    #[error("{field} is not valid base64: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Failed to read certificate {path}: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} must not be empty")]
    Missing(&'static str),
}

/// Key material as it appears in the RON file.
///
/// Keys are base64 encoded; certificates are PEM files read at start-up.
#[derive(Default, Deserialize)]
pub struct SecurityConfig {
    pub encryption_key: String,
    pub signing_key: String,
    #[serde(default)]
    pub recipient_public_key: Option<String>,
    #[serde(default)]
    pub certificate_paths: Vec<PathBuf>,
    pub client_id: String,
    pub api_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("certificate_paths", &self.certificate_paths)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl SecurityConfig {
    /// Decode the keys and read the certificate chain.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is missing or badly encoded, or a
    /// certificate file cannot be read.
    pub fn load(&self) -> Result<SecurityContext, SecurityConfigError> {
        if self.api_key.is_empty() {
            return Err(SecurityConfigError::Missing("api_key"));
        }

        let certificate_chain = self
            .certificate_paths
            .iter()
            .map(|path| {
                std::fs::read_to_string(path).map_err(|source| SecurityConfigError::Certificate {
                    path: path.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SecurityContext {
            encryption_key: decode("encryption_key", &self.encryption_key)?,
            signing_key: decode("signing_key", &self.signing_key)?,
            recipient_public_key: self
                .recipient_public_key
                .as_deref()
                .map(|key| decode("recipient_public_key", key).map(|key| key.to_vec()))
                .transpose()?,
            certificate_chain,
            client_id: self.client_id.clone(),
            api_key: self.api_key.clone(),
            session_token: self.session_token.clone(),
        })
    }
}

fn decode(field: &'static str, value: &str) -> Result<Zeroizing<Vec<u8>>, SecurityConfigError> {
    if value.is_empty() {
        return Err(SecurityConfigError::Missing(field));
    }

    STANDARD
        .decode(value)
        .map(Zeroizing::new)
        .map_err(|source| SecurityConfigError::Encoding { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SecurityConfig {
        SecurityConfig {
            encryption_key: STANDARD.encode([7u8; 32]),
            signing_key: STANDARD.encode([0x2a; 32]),
            client_id: "taxpoynt".to_string(),
            api_key: "key".to_string(),
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn test_decodes_keys() {
        let context = config().load().unwrap();
        assert_eq!(context.encryption_key.as_slice(), &[7u8; 32]);
        assert!(context.recipient_public_key.is_none());
        assert!(context.certificate_chain.is_empty());
    }

    #[test]
    fn test_rejects_bad_key_encoding() {
        let config = SecurityConfig {
            signing_key: "not base64!".to_string(),
            ..config()
        };
        assert!(matches!(
            config.load(),
            Err(SecurityConfigError::Encoding {
                field: "signing_key",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_certificate_is_reported() {
        let config = SecurityConfig {
            certificate_paths: vec![PathBuf::from("/nonexistent/regulator.pem")],
            ..config()
        };
        assert!(matches!(
            config.load(),
            Err(SecurityConfigError::Certificate { .. })
        ));
    }
}
