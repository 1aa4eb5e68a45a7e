//! Staging and launch entry points
//!
//! Stages run strictly in sequence. The only await point is the secret
//! manager call inside environment composition.

use std::convert::Infallible;

use crate::config::LifecycleConfig;
use crate::credhub::SecretManager;
use crate::environment::{EnvironmentComposer, EnvironmentSet};
use crate::launcher::LaunchPlan;
use crate::manifest::{self, StagingResult};
use crate::staging::{LaunchConfig, StagingConfig};
use crate::Result;

/// Write the staging result for a validated staging configuration
pub fn finalize_staging(config: &StagingConfig, settings: &LifecycleConfig) -> Result<StagingResult> {
    tracing::info!(
        build_dir = %config.build_dir().display(),
        detected_buildpack = config.detected_buildpack(),
        skip_detect = config.skip_detect(),
        skip_cert_verify = config.skip_cert_verify(),
        "finalizing staging"
    );
    if config.skip_cert_verify() {
        tracing::warn!("TLS certificate verification was disabled for this staging run");
    }
    manifest::finalize(config, &settings.staging)
}

/// Compose the launch environment and plan the process replacement
pub async fn prepare_launch(
    config: &LaunchConfig,
    settings: &LifecycleConfig,
    secret_manager: &dyn SecretManager,
    inherited: EnvironmentSet,
) -> Result<LaunchPlan> {
    let env = EnvironmentComposer::new(secret_manager)
        .compose(config.app_dir(), inherited)
        .await?;
    Ok(LaunchPlan::new(config, &settings.launch, env))
}

/// Compose, plan and replace the current process image.
///
/// Only returns on failure.
pub async fn launch(
    config: &LaunchConfig,
    settings: &LifecycleConfig,
    secret_manager: &dyn SecretManager,
    inherited: EnvironmentSet,
) -> Result<Infallible> {
    prepare_launch(config, settings, secret_manager, inherited)
        .await?
        .exec()
}
