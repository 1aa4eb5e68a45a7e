//! Invocation argument validation
//!
//! [`StagingConfig`] and [`LaunchConfig`] are only constructed through
//! their validating builders, so holding one means every downstream stage
//! can trust its fields.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Default file name of the staging info document written next to the app
pub const STAGING_INFO_FILE: &str = "staging_info.yml";

/// Raw `finalize` arguments, as received from the command line
#[derive(Debug, Clone, Default)]
pub struct StagingArgs {
    pub build_dir: PathBuf,
    pub deps_dir: Option<PathBuf>,
    pub release_output: PathBuf,
    pub output_metadata: PathBuf,
    pub output_staging_info: Option<PathBuf>,
    /// Comma separated buildpack keys
    pub buildpack_order: String,
    pub detected_buildpack: Option<String>,
    pub skip_detect: bool,
    pub skip_cert_verify: bool,
}

/// Validated staging parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingConfig {
    build_dir: PathBuf,
    deps_dir: PathBuf,
    release_output: PathBuf,
    output_metadata: PathBuf,
    output_staging_info: PathBuf,
    buildpack_order: Vec<String>,
    detected_buildpack: String,
    skip_detect: bool,
    skip_cert_verify: bool,
}

impl StagingConfig {
    /// Validate raw arguments.
    ///
    /// Performs no writes; the only filesystem access is checking that the
    /// build directory exists.
    pub fn validate(args: StagingArgs) -> Result<Self> {
        require_path("build-dir", &args.build_dir)?;
        require_path("release-output", &args.release_output)?;
        require_path("output-metadata", &args.output_metadata)?;

        if !args.build_dir.is_dir() {
            return Err(Error::Config(format!(
                "build-dir {} is not a directory",
                args.build_dir.display()
            )));
        }

        let buildpack_order = parse_buildpack_order(&args.buildpack_order)?;

        let detected_buildpack = match args.detected_buildpack.filter(|b| !b.is_empty()) {
            Some(key) if !buildpack_order.contains(&key) => {
                return Err(Error::Config(format!(
                    "detected buildpack {:?} is not in buildpack-order",
                    key
                )));
            }
            Some(key) => key,
            // non-empty, checked above
            None => buildpack_order[buildpack_order.len() - 1].clone(),
        };

        let parent = args
            .build_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let deps_dir = args
            .deps_dir
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| parent.join("deps"));
        let output_staging_info = args
            .output_staging_info
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| parent.join(STAGING_INFO_FILE));

        Ok(Self {
            build_dir: args.build_dir,
            deps_dir,
            release_output: args.release_output,
            output_metadata: args.output_metadata,
            output_staging_info,
            buildpack_order,
            detected_buildpack,
            skip_detect: args.skip_detect,
            skip_cert_verify: args.skip_cert_verify,
        })
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn deps_dir(&self) -> &Path {
        &self.deps_dir
    }

    pub fn release_output(&self) -> &Path {
        &self.release_output
    }

    pub fn output_metadata(&self) -> &Path {
        &self.output_metadata
    }

    pub fn output_staging_info(&self) -> &Path {
        &self.output_staging_info
    }

    pub fn buildpack_order(&self) -> &[String] {
        &self.buildpack_order
    }

    pub fn detected_buildpack(&self) -> &str {
        &self.detected_buildpack
    }

    pub fn skip_detect(&self) -> bool {
        self.skip_detect
    }

    pub fn skip_cert_verify(&self) -> bool {
        self.skip_cert_verify
    }
}

fn require_path(flag: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::Config(format!("missing required argument --{}", flag)));
    }
    Ok(())
}

fn parse_buildpack_order(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Err(Error::Config("buildpack-order must name at least one buildpack".into()));
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for key in raw.split(',').map(str::trim) {
        if key.is_empty() {
            return Err(Error::Config(format!("empty entry in buildpack-order {:?}", raw)));
        }
        if !seen.insert(key) {
            return Err(Error::Config(format!("duplicate buildpack {:?} in buildpack-order", key)));
        }
        order.push(key.to_string());
    }
    Ok(order)
}

/// Validated `launch` parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    app_dir: PathBuf,
    start_command: String,
}

impl LaunchConfig {
    /// Validate launch arguments.
    ///
    /// An empty start command falls back to `start_command` from the staging
    /// info document; `staging_info` defaults to `<app-dir>/../staging_info.yml`.
    /// A missing or unreadable staging info file is only an error when it
    /// was needed.
    pub fn validate(
        app_dir: impl Into<PathBuf>,
        start_command: impl Into<String>,
        staging_info: Option<&Path>,
    ) -> Result<Self> {
        let app_dir = app_dir.into();
        let start_command = start_command.into();

        if app_dir.as_os_str().is_empty() {
            return Err(Error::Config("missing required argument <app-dir>".into()));
        }

        if !start_command.trim().is_empty() {
            return Ok(Self {
                app_dir,
                start_command,
            });
        }

        let info_path = match staging_info {
            Some(path) => path.to_path_buf(),
            None => app_dir
                .parent()
                .map(|p| p.join(STAGING_INFO_FILE))
                .unwrap_or_else(|| PathBuf::from(STAGING_INFO_FILE)),
        };

        let fallback = read_start_command(&info_path)?;
        if fallback.trim().is_empty() {
            return Err(Error::Config(format!(
                "no start command given and {} has none",
                info_path.display()
            )));
        }

        tracing::info!(staging_info = %info_path.display(), "using start command from staging info");
        Ok(Self {
            app_dir,
            start_command: fallback,
        })
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn start_command(&self) -> &str {
        &self.start_command
    }
}

fn read_start_command(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "no start command given and {} is unreadable: {}",
            path.display(),
            e
        ))
    })?;
    let info: crate::manifest::StagingInfo = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(info.start_command)
}
