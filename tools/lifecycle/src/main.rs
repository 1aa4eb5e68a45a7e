//! Droplet Lifecycle - staging finalizer and launcher
//!
//! # Usage
//!
//! ```bash
//! # Write result.json and staging_info.yml after the buildpacks have run
//! lifecycle finalize --build-dir /tmp/app --release-output /tmp/release.yml \
//!     --output-metadata /tmp/result.json --buildpack-order ruby_buildpack
//!
//! # Compose the environment and exec the start command
//! lifecycle launch /home/vcap/app "bundle exec rackup -p $PORT"
//!
//! # Fall back to start_command from ../staging_info.yml
//! lifecycle launch /home/vcap/app ""
//! ```
//!
//! Pipeline failures exit with a code in the 220-225 range; once the
//! application has been launched its own exit status is reported.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use droplet_lifecycle_core::error::EXIT_CONFIG;
use droplet_lifecycle_core::pipeline;
use droplet_lifecycle_core::{
    CredHubClient, EnvironmentSet, Error, LaunchConfig, LifecycleConfig, StagingArgs, StagingConfig,
};

/// Droplet Lifecycle - finalize staging and launch applications
#[derive(Debug, Parser)]
#[command(name = "lifecycle")]
#[command(author, version)]
#[command(about = "Finalize buildpack staging output and launch staged applications")]
struct Args {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Lifecycle configuration file (TOML)
    #[arg(long, global = true, env = "LIFECYCLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Merge declared process types and write the staging result
    Finalize {
        /// Directory containing the staged application
        #[arg(long)]
        build_dir: Option<PathBuf>,

        /// Buildpack dependency directory (default: <build-dir>/../deps)
        #[arg(long)]
        deps_dir: Option<PathBuf>,

        /// YAML output of the final buildpack's release step
        #[arg(long)]
        release_output: Option<PathBuf>,

        /// Where to write result.json
        #[arg(long)]
        output_metadata: Option<PathBuf>,

        /// Where to write staging_info.yml (default: <build-dir>/../staging_info.yml)
        #[arg(long)]
        output_staging_info: Option<PathBuf>,

        /// Comma separated buildpack keys, in order
        #[arg(long)]
        buildpack_order: Option<String>,

        /// Buildpack that detected the app (default: last in buildpack-order)
        #[arg(long)]
        detected_buildpack: Option<String>,

        /// Buildpacks were run without detection
        #[arg(long)]
        skip_detect: bool,

        /// Certificate verification was disabled while staging
        #[arg(long)]
        skip_cert_verify: bool,
    },

    /// Compose the launch environment and exec the start command
    Launch {
        /// Application directory
        app_dir: PathBuf,

        /// Start command; omit or pass "" to use staging_info.yml
        start_command: Option<String>,

        /// Staging info file (default: <app-dir>/../staging_info.yml)
        staging_info: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        // --help and --version
        Err(e) if !e.use_stderr() => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(exit_code = e.exit_code(), "{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let settings = LifecycleConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Finalize {
            build_dir,
            deps_dir,
            release_output,
            output_metadata,
            output_staging_info,
            buildpack_order,
            detected_buildpack,
            skip_detect,
            skip_cert_verify,
        } => {
            let config = StagingConfig::validate(StagingArgs {
                build_dir: build_dir.unwrap_or_default(),
                deps_dir,
                release_output: release_output.unwrap_or_default(),
                output_metadata: output_metadata.unwrap_or_default(),
                output_staging_info,
                buildpack_order: buildpack_order.unwrap_or_default(),
                detected_buildpack,
                skip_detect,
                skip_cert_verify,
            })?;
            pipeline::finalize_staging(&config, &settings)?;
            Ok(())
        }
        Command::Launch {
            app_dir,
            start_command,
            staging_info,
        } => {
            let config = LaunchConfig::validate(
                app_dir,
                start_command.unwrap_or_default(),
                staging_info.as_deref(),
            )?;
            let credhub = CredHubClient::new(settings.credhub.clone());
            let inherited = EnvironmentSet::inherited();

            match pipeline::launch(&config, &settings, &credhub, inherited).await {
                Ok(never) => match never {},
                Err(e) => Err(e),
            }
        }
    }
}
