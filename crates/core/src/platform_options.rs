//! `VCAP_PLATFORM_OPTIONS` decoding
//!
//! Platform options are an out-of-band payload set by the orchestrator.
//! The only recognised option is the CredHub endpoint used for secret
//! interpolation. An absent or empty payload is the common case.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Decoded platform options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOptions {
    /// Secret manager endpoint
    #[serde(rename = "credhub-uri", default, skip_serializing_if = "String::is_empty")]
    pub credhub_uri: String,
}

impl PlatformOptions {
    /// Secret manager endpoint, if one was provided.
    ///
    /// Fails when the value is present but is not an absolute URL.
    pub fn secret_manager_endpoint(&self) -> Result<Option<Url>> {
        if self.credhub_uri.is_empty() {
            return Ok(None);
        }
        Url::parse(&self.credhub_uri)
            .map(Some)
            .map_err(|e| Error::PlatformOptions(format!("credhub-uri {:?}: {}", self.credhub_uri, e)))
    }
}

/// Decode a raw platform options payload.
///
/// `None` and blank input decode to `Ok(None)`. Anything else must be a JSON
/// object; unknown keys are ignored.
pub fn decode(raw: Option<&str>) -> Result<Option<PlatformOptions>> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(raw) => raw,
    };

    let options: PlatformOptions =
        serde_json::from_str(raw).map_err(|e| Error::PlatformOptions(e.to_string()))?;
    tracing::debug!(has_credhub_uri = !options.credhub_uri.is_empty(), "decoded platform options");
    Ok(Some(options))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_payload() {
        assert_eq!(decode(None).unwrap(), None);
        assert_eq!(decode(Some("")).unwrap(), None);
        assert_eq!(decode(Some("  \n")).unwrap(), None);
    }

    #[test]
    fn test_decode_credhub_uri() {
        let options = decode(Some(r#"{"credhub-uri":"https://credhub.example.com:8844"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(options.credhub_uri, "https://credhub.example.com:8844");

        let endpoint = options.secret_manager_endpoint().unwrap().unwrap();
        assert_eq!(endpoint.host_str(), Some("credhub.example.com"));
        assert_eq!(endpoint.port(), Some(8844));
    }

    #[test]
    fn test_empty_object_has_no_endpoint() {
        let options = decode(Some("{}")).unwrap().unwrap();
        assert_eq!(options.secret_manager_endpoint().unwrap(), None);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let options = decode(Some(r#"{"credhub-uri":"https://c","other":1}"#))
            .unwrap()
            .unwrap();
        assert_eq!(options.credhub_uri, "https://c");
    }

    #[test]
    fn test_malformed_payload() {
        let err = decode(Some("{credhub-uri")).unwrap_err();
        assert!(matches!(err, Error::PlatformOptions(_)));
    }

    #[test]
    fn test_relative_endpoint_rejected() {
        let options = PlatformOptions {
            credhub_uri: "credhub.internal".to_string(),
        };
        assert!(matches!(
            options.secret_manager_endpoint(),
            Err(Error::PlatformOptions(_))
        ));
    }
}
