//! Process image replacement
//!
//! The start command runs through a shell bootstrap that enters the app
//! directory and sources profile scripts first, so buildpack-provided
//! environment (`profile.d`) is visible to the command.

use std::convert::Infallible;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::LaunchSettings;
use crate::environment::EnvironmentSet;
use crate::staging::LaunchConfig;
use crate::{Error, Result};

/// `$0` is the shell, `$1` the app directory, `$2` the start command
const BOOTSTRAP_WITH_PROFILES: &str = r#"cd "$1" || exit
for env_file in ../profile.d/*.sh .profile.d/*.sh; do
  if [ -f "$env_file" ]; then
    . "$env_file"
  fi
done
if [ -f .profile ]; then
  . ./.profile
fi
shift
exec "$0" -c "$1"
"#;

const BOOTSTRAP: &str = r#"cd "$1" || exit
shift
exec "$0" -c "$1"
"#;

/// Everything needed to replace the current process image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub env: EnvironmentSet,
    command: String,
}

impl LaunchPlan {
    /// Plan the launch of `config`'s start command with a composed environment
    pub fn new(config: &LaunchConfig, settings: &LaunchSettings, env: EnvironmentSet) -> Self {
        let script = if settings.source_profiles {
            BOOTSTRAP_WITH_PROFILES
        } else {
            BOOTSTRAP
        };

        Self {
            program: settings.shell.clone(),
            args: vec![
                OsString::from("-c"),
                OsString::from(script),
                settings.shell.as_os_str().to_os_string(),
                config.app_dir().as_os_str().to_os_string(),
                OsString::from(config.start_command()),
            ],
            working_dir: config.app_dir().to_path_buf(),
            env,
            command: config.start_command().to_string(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .envs(self.env.iter_os())
            .current_dir(working_dir_or_root(&self.working_dir));
        command
    }

    /// Replace the current process image.
    ///
    /// Only returns if the replacement failed.
    #[cfg(unix)]
    pub fn exec(self) -> Result<Infallible> {
        use std::os::unix::process::CommandExt;

        tracing::info!(
            program = %self.program.display(),
            working_dir = %self.working_dir.display(),
            vars = self.env.len(),
            "launching application"
        );
        let source = self.to_command().exec();
        Err(Error::Launch {
            command: self.command,
            source,
        })
    }

    #[cfg(not(unix))]
    pub fn exec(self) -> Result<Infallible> {
        Err(Error::Launch {
            command: self.command,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "process image replacement requires a unix platform",
            ),
        })
    }
}

// The bootstrap script cds into the app dir itself; a missing app dir should
// surface as the script's error, not as a failure to spawn the shell.
fn working_dir_or_root(dir: &Path) -> &Path {
    if dir.is_dir() {
        dir
    } else {
        Path::new("/")
    }
}
