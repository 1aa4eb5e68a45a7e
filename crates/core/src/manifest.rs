//! Launch manifest assembly
//!
//! Buildpacks and the application declare process types from several
//! sources. They are folded together with a replace-by-type merge and the
//! result is split into primary processes and sidecars.
//!
//! Inputs read during finalization:
//!
//! - the final buildpack's release output (`default_process_types`)
//! - `<deps>/<index>/launch.yml` written by each buildpack
//! - the application's `Procfile`
//!
//! Outputs are the staging result (`result.json`) and `staging_info.yml`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::StagingSettings;
use crate::staging::StagingConfig;
use crate::{Error, Result};

/// A process definition; `type` is the merge key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(rename = "type")]
    pub process_type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecar_for: Vec<String>,
    /// Memory limit in MB, 0 when unspecified
    #[serde(default, skip_serializing_if = "is_zero")]
    pub memory_limit: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Process {
    pub fn new(process_type: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            process_type: process_type.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn sidecar(
        name: impl Into<String>,
        command: impl Into<String>,
        sidecar_for: Vec<String>,
        memory_limit: u64,
    ) -> Self {
        Self {
            process_type: name.into(),
            command: command.into(),
            sidecar_for,
            memory_limit,
        }
    }

    pub fn is_sidecar(&self) -> bool {
        !self.sidecar_for.is_empty()
    }
}

/// Processes declared by the build phase, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchManifest {
    pub processes: Vec<Process>,
}

impl LaunchManifest {
    pub fn new(processes: Vec<Process>) -> Self {
        Self { processes }
    }

    /// Processes from a type to command mapping, sorted by type
    pub fn from_process_types(types: &BTreeMap<String, String>) -> Self {
        Self::new(
            types
                .iter()
                .map(|(t, command)| Process::new(t.as_str(), command.as_str()))
                .collect(),
        )
    }

    /// Fold `incoming` into this manifest.
    ///
    /// An incoming process replaces the existing entry of the same type in
    /// place; new types are appended. Types stay unique.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Process>) {
        for process in incoming {
            match self
                .processes
                .iter_mut()
                .find(|p| p.process_type == process.process_type)
            {
                Some(existing) => {
                    tracing::debug!(process_type = %process.process_type, "replacing process");
                    *existing = process;
                }
                None => self.processes.push(process),
            }
        }
    }

    pub fn merged(mut self, incoming: impl IntoIterator<Item = Process>) -> Self {
        self.merge(incoming);
        self
    }

    /// Split into primary processes and sidecars
    pub fn partition(self) -> PartitionedManifest {
        let mut partitioned = PartitionedManifest::default();
        for process in self.processes {
            if process.is_sidecar() {
                partitioned.sidecars.push(Sidecar {
                    name: process.process_type,
                    process_types: process.sidecar_for,
                    command: process.command,
                    memory: process.memory_limit,
                });
            } else {
                partitioned
                    .process_types
                    .insert(process.process_type.clone(), process.command.clone());
                partitioned.process_list.push(ProcessEntry {
                    process_type: process.process_type,
                    command: process.command,
                });
            }
        }
        partitioned
    }
}

/// Primary process entry of a partitioned manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    #[serde(rename = "type")]
    pub process_type: String,
    pub command: String,
}

/// Auxiliary process running next to one or more primary process types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    pub name: String,
    pub process_types: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub memory: u64,
}

/// Primary processes, their flat index and sidecars
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedManifest {
    pub process_types: BTreeMap<String, String>,
    pub process_list: Vec<ProcessEntry>,
    #[serde(default)]
    pub sidecars: Vec<Sidecar>,
}

impl PartitionedManifest {
    pub fn start_command(&self) -> Option<&str> {
        self.process_types.get("web").map(String::as_str)
    }
}

/// `bin/release` output of the final buildpack
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseOutput {
    #[serde(default)]
    pub default_process_types: Option<BTreeMap<String, String>>,
}

/// `launch.yml` written by a buildpack into its deps directory
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchFile {
    #[serde(default)]
    pub processes: Vec<LaunchFileProcess>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchFileProcess {
    #[serde(rename = "type")]
    pub process_type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub platforms: LaunchPlatforms,
    #[serde(default)]
    pub limits: LaunchLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchPlatforms {
    #[serde(default)]
    pub cloudfoundry: CloudFoundryPlatform,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudFoundryPlatform {
    #[serde(default)]
    pub sidecar_for: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchLimits {
    #[serde(default)]
    pub memory: u64,
}

impl From<LaunchFileProcess> for Process {
    fn from(p: LaunchFileProcess) -> Self {
        Process {
            process_type: p.process_type,
            command: p.command,
            sidecar_for: p.platforms.cloudfoundry.sidecar_for,
            memory_limit: p.limits.memory,
        }
    }
}

/// `staging_info.yml`, read back by the launcher when no start command is given
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingInfo {
    #[serde(default)]
    pub detected_buildpack: String,
    #[serde(default)]
    pub start_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackMetadata {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleMetadata {
    pub detected_buildpack: String,
    pub buildpacks: Vec<BuildpackMetadata>,
}

/// `result.json` handed back to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingResult {
    pub lifecycle_type: String,
    pub lifecycle_metadata: LifecycleMetadata,
    #[serde(flatten)]
    pub manifest: PartitionedManifest,
    #[serde(default)]
    pub execution_metadata: String,
}

fn read_yaml_file<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(Some(T::default()));
    }
    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|e| Error::Manifest(format!("{}: {}", path.display(), e)))
}

/// `Procfile` processes, sorted by type
pub fn read_procfile(build_dir: &Path) -> Result<Vec<Process>> {
    let procfile: Option<BTreeMap<String, String>> = read_yaml_file(&build_dir.join("Procfile"))?;
    Ok(procfile
        .map(|types| LaunchManifest::from_process_types(&types).processes)
        .unwrap_or_default())
}

/// Processes from every `<deps>/<index>/launch.yml`, in numeric index order
pub fn read_launch_files(deps_dir: &Path) -> Result<Vec<Process>> {
    let entries = match std::fs::read_dir(deps_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut indexed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(index) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        indexed.push((index, entry.path().join("launch.yml")));
    }
    indexed.sort();

    let mut processes = Vec::new();
    for (index, path) in indexed {
        if let Some(launch) = read_yaml_file::<LaunchFile>(&path)? {
            tracing::debug!(index, count = launch.processes.len(), "read launch.yml");
            processes.extend(launch.processes.into_iter().map(Process::from));
        }
    }
    Ok(processes)
}

/// Release defaults, then buildpack launch files, then the Procfile
pub fn build_launch_manifest(config: &StagingConfig) -> Result<LaunchManifest> {
    let release: ReleaseOutput = read_yaml_file(config.release_output())?.ok_or_else(|| {
        Error::Manifest(format!(
            "release output {} not found",
            config.release_output().display()
        ))
    })?;
    let defaults = release.default_process_types.unwrap_or_default();

    Ok(LaunchManifest::from_process_types(&defaults)
        .merged(read_launch_files(config.deps_dir())?)
        .merged(read_procfile(config.build_dir())?))
}

/// Build the staging result and write `result.json` and `staging_info.yml`
pub fn finalize(config: &StagingConfig, settings: &StagingSettings) -> Result<StagingResult> {
    let manifest = build_launch_manifest(config)?.partition();

    let result = StagingResult {
        lifecycle_type: settings.lifecycle_type.clone(),
        lifecycle_metadata: LifecycleMetadata {
            detected_buildpack: config.detected_buildpack().to_string(),
            buildpacks: config
                .buildpack_order()
                .iter()
                .map(|key| BuildpackMetadata {
                    key: key.clone(),
                    name: key.clone(),
                })
                .collect(),
        },
        manifest,
        execution_metadata: String::new(),
    };

    let info = StagingInfo {
        detected_buildpack: config.detected_buildpack().to_string(),
        start_command: result.manifest.start_command().unwrap_or_default().to_string(),
    };

    let json = serde_json::to_string(&result)
        .map_err(|e| Error::Manifest(format!("failed to encode staging result: {}", e)))?;
    std::fs::write(config.output_metadata(), json)?;
    std::fs::write(config.output_staging_info(), serde_yaml::to_string(&info)?)?;

    tracing::info!(
        processes = result.manifest.process_list.len(),
        sidecars = result.manifest.sidecars.len(),
        output = %config.output_metadata().display(),
        "wrote staging result"
    );
    Ok(result)
}
