//! Droplet Lifecycle Core
//!
//! The staging and launch pipeline for buildpack-based applications.
//!
//! # Stages
//!
//! ```text
//!  finalize                                 launch
//!  ────────                                 ──────
//!  StagingConfig::validate                  LaunchConfig::validate
//!        │                                        │
//!        ▼                                        ▼
//!  manifest::build_launch_manifest          platform_options::decode
//!   (release ← launch.yml ← Procfile)             │
//!        │                                        ▼
//!        ▼                                  EnvironmentComposer::compose
//!  LaunchManifest::partition                 ├─ HOME / TMPDIR / DEPS_DIR
//!        │                                   ├─ VCAP_APPLICATION patch
//!        ▼                                   ├─ SecretInterpolator (CredHub)
//!  result.json + staging_info.yml            └─ DATABASE_URL
//!                                                 │
//!                                                 ▼
//!                                           LaunchPlan::exec
//! ```
//!
//! Every stage works on explicit values. The inherited environment is
//! captured once with [`EnvironmentSet::inherited`] and the composed set is
//! only applied when the process image is replaced.

pub mod config;
pub mod credhub;
pub mod database;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod manifest;
pub mod pipeline;
pub mod platform_options;
pub mod staging;

pub use config::LifecycleConfig;
pub use credhub::{CredHubClient, SecretManager};
pub use environment::{EnvironmentComposer, EnvironmentSet};
pub use error::{Error, Result};
pub use launcher::LaunchPlan;
pub use manifest::{LaunchManifest, PartitionedManifest, Process, Sidecar};
pub use staging::{LaunchConfig, StagingArgs, StagingConfig};
