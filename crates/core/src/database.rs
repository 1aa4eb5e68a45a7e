//! `DATABASE_URL` derivation from bound services
//!
//! Scans service bindings for the first credential `uri` with a recognised
//! database scheme and normalises that scheme for the application.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::{Error, Result};

/// A single service binding record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    /// `null` and a missing key both decode as no credentials
    #[serde(default, deserialize_with = "null_as_empty")]
    pub credentials: Map<String, Value>,

    /// Every other field of the binding (name, label, tags, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ServiceBinding {
    /// Non-empty string `credentials.uri`, if present
    pub fn credentials_uri(&self) -> Option<&str> {
        self.credentials
            .get("uri")
            .and_then(Value::as_str)
            .filter(|uri| !uri.is_empty())
    }
}

/// Service label to bindings.
///
/// Labels are kept sorted so that scanning order does not depend on how the
/// document happened to be serialised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceBindings(pub BTreeMap<String, Vec<ServiceBinding>>);

impl ServiceBindings {
    /// Parse a `VCAP_SERVICES` document
    pub fn parse(document: &str) -> Result<Self> {
        serde_json::from_str(document).map_err(|e| Error::parse("VCAP_SERVICES", e))
    }

    /// All bindings, ordered by service label then document order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceBinding)> {
        self.0
            .iter()
            .flat_map(|(label, bindings)| bindings.iter().map(move |b| (label.as_str(), b)))
    }
}

/// Rewrite a database scheme to the one applications expect.
///
/// Returns `None` for schemes that are not databases we know about.
pub fn normalize_scheme(scheme: &str) -> Option<&'static str> {
    match scheme {
        "mysql" | "mysql2" => Some("mysql2"),
        "postgres" | "postgresql" => Some("postgres"),
        _ => None,
    }
}

/// Normalise a single credential URI, or `None` if it is unusable
pub fn normalize_uri(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    let scheme = normalize_scheme(url.scheme())?;
    if url.scheme() != scheme {
        // both sides are non-special schemes, so this cannot fail
        url.set_scheme(scheme).ok()?;
    }
    Some(url.to_string())
}

/// Pick the database URI out of parsed bindings; empty when none qualifies
pub fn resolve(bindings: &ServiceBindings) -> String {
    for (label, binding) in bindings.iter() {
        let Some(raw) = binding.credentials_uri() else {
            continue;
        };
        match normalize_uri(raw) {
            Some(uri) => {
                tracing::debug!(service = label, "resolved DATABASE_URL from service binding");
                return uri;
            }
            None => tracing::trace!(service = label, "skipping binding with non-database uri"),
        }
    }
    String::new()
}

/// Parse a `VCAP_SERVICES` document and resolve its database URI
pub fn resolve_database_uri(document: &str) -> Result<String> {
    Ok(resolve(&ServiceBindings::parse(document)?))
}
