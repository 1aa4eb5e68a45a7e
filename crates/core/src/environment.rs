//! Launch environment composition
//!
//! The inherited environment is captured once into an [`EnvironmentSet`],
//! rewritten by [`EnvironmentComposer`] and handed to the launcher as a
//! value. Nothing in the pipeline reads or writes the OS environment.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};
use url::Url;

use crate::credhub::{Interpolation, SecretInterpolator, SecretManager};
use crate::{database, platform_options, Result};

pub const VCAP_APPLICATION: &str = "VCAP_APPLICATION";
pub const VCAP_SERVICES: &str = "VCAP_SERVICES";
pub const VCAP_PLATFORM_OPTIONS: &str = "VCAP_PLATFORM_OPTIONS";
pub const DATABASE_URL: &str = "DATABASE_URL";

/// Address the application is told to bind to
pub const BIND_ALL_HOST: &str = "0.0.0.0";

/// Process environment as an ordered name to value mapping.
///
/// Later writes to a name replace earlier ones. Inherited variables whose
/// name or value is not UTF-8 are not readable through the `&str` accessors
/// but are still handed to the launched process unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSet {
    vars: BTreeMap<String, String>,
    opaque: BTreeMap<OsString, OsString>,
}

impl EnvironmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment
    pub fn inherited() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    /// Build from raw OS pairs, keeping non-UTF-8 entries as pass-through
    pub fn from_os_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut set = Self::new();
        for (name, value) in vars {
            if let (Some(n), Some(v)) = (name.to_str(), value.to_str()) {
                set.vars.insert(n.to_string(), v.to_string());
                continue;
            }
            tracing::warn!(
                name = %name.to_string_lossy(),
                "environment variable is not valid UTF-8, passing it through untouched"
            );
            set.opaque.insert(name, value);
        }
        set
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            opaque: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Value of `name` unless it is unset or empty
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name) || self.opaque.contains_key(OsStr::new(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.opaque.remove(OsStr::new(&name));
        self.vars.insert(name, value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.opaque.remove(OsStr::new(name));
        self.vars.remove(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len() + self.opaque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.opaque.is_empty()
    }

    /// UTF-8 variables only
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Every variable, including the non-UTF-8 pass-through ones
    pub fn iter_os(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars
            .iter()
            .map(|(k, v)| (OsStr::new(k), OsStr::new(v)))
            .chain(self.opaque.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())))
    }
}

/// Instance identity handed to the application descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub guid: Option<String>,
    pub index: Option<String>,
    pub port: Option<String>,
}

impl InstanceIdentity {
    /// Read `INSTANCE_GUID`, `INSTANCE_INDEX` and `PORT`
    pub fn from_env(env: &EnvironmentSet) -> Self {
        Self {
            guid: env.get("INSTANCE_GUID").map(str::to_string),
            index: env.get("INSTANCE_INDEX").map(str::to_string),
            port: env.get("PORT").map(str::to_string),
        }
    }
}

/// Fields merged into `VCAP_APPLICATION`.
///
/// Decoding the descriptor is best effort: [`ApplicationPatch::for_descriptor`]
/// yields `None` for a missing or malformed descriptor and the caller leaves
/// the variable alone.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationPatch {
    descriptor: Map<String, Value>,
}

impl ApplicationPatch {
    pub fn for_descriptor(raw: Option<&str>, identity: &InstanceIdentity) -> Option<Self> {
        let raw = raw?;
        let mut descriptor = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                tracing::warn!(kind = json_kind(&other), "VCAP_APPLICATION is not an object, leaving it unchanged");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "VCAP_APPLICATION is not valid JSON, leaving it unchanged");
                return None;
            }
        };

        descriptor.insert("host".into(), Value::from(BIND_ALL_HOST));
        let instance_id = identity.guid.as_deref().unwrap_or_default();
        descriptor.insert("instance_id".into(), Value::from(instance_id));
        if let Some(port) = identity.port.as_deref().and_then(|p| p.parse::<i64>().ok()) {
            descriptor.insert("port".into(), Value::from(port));
        }
        if let Some(index) = identity.index.as_deref().and_then(|i| i.parse::<i64>().ok()) {
            descriptor.insert("instance_index".into(), Value::from(index));
        }

        Some(Self { descriptor })
    }

    pub fn descriptor(&self) -> &Map<String, Value> {
        &self.descriptor
    }

    pub fn into_json(self) -> String {
        Value::Object(self.descriptor).to_string()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Sibling directory of `base`, as an absolute lexically cleaned path
pub fn sibling_dir(base: &Path, name: &str) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(base)?;
    let cleaned = clean_path(&absolute);
    let parent = cleaned.parent().unwrap_or(&cleaned);
    Ok(parent.join(name))
}

/// Resolve `.` and `..` components without touching the filesystem
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Builds the launch environment from the inherited one
pub struct EnvironmentComposer<'a> {
    interpolator: SecretInterpolator<'a>,
}

impl<'a> EnvironmentComposer<'a> {
    pub fn new(secret_manager: &'a dyn SecretManager) -> Self {
        Self {
            interpolator: SecretInterpolator::new(secret_manager),
        }
    }

    /// Compose the environment for an application rooted at `base_dir`.
    ///
    /// Fails without returning a partial environment when platform options
    /// are malformed, secret interpolation fails or the services document
    /// cannot be parsed. A malformed `VCAP_APPLICATION` is left as is.
    pub async fn compose(&self, base_dir: &Path, inherited: EnvironmentSet) -> Result<EnvironmentSet> {
        let mut env = inherited;
        let identity = InstanceIdentity::from_env(&env);

        let options = platform_options::decode(env.get(VCAP_PLATFORM_OPTIONS))?;
        let endpoint: Option<Url> = match &options {
            Some(options) => options.secret_manager_endpoint()?,
            None => None,
        };

        env.set("HOME", base_dir.to_string_lossy());
        env.set("TMPDIR", sibling_dir(base_dir, "tmp")?.to_string_lossy());
        env.set("DEPS_DIR", sibling_dir(base_dir, "deps")?.to_string_lossy());

        if let Some(patch) = ApplicationPatch::for_descriptor(env.get(VCAP_APPLICATION), &identity) {
            env.set(VCAP_APPLICATION, patch.into_json());
        }

        if let Interpolation::Applied = self.interpolator.run(&mut env, endpoint.as_ref()).await? {
            tracing::info!("VCAP_SERVICES interpolated");
        }

        if let Some(services) = env.get_non_empty(VCAP_SERVICES) {
            let uri = database::resolve_database_uri(services)?;
            if !uri.is_empty() {
                env.set(DATABASE_URL, uri);
            }
        }

        env.remove(VCAP_PLATFORM_OPTIONS);

        tracing::debug!(vars = env.len(), "composed launch environment");
        Ok(env)
    }
}
