//! # Archive Tooling
//!
//! The pipeline never reads the tape archive directly. It drives three
//! external collaborators through their file contracts:
//!
//! - **stage**: bulk recall of archived containers from tape (`dmget`)
//! - **unpack**: extraction of one member file out of a container (`tar`)
//! - **copy**: tier-to-tier copy of a member file (`gcp`)
//!
//! These are exposed through the [`ArchiveTools`] trait so the cache and the
//! batch scheduler can be exercised with an in-process implementation.
//! [`ShellTools`] is the production implementation and runs the configured
//! commands with `tokio::process`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ncforecast::storage::{ArchiveTools, ShellTools};
//! use std::path::{Path, PathBuf};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tools = ShellTools::default();
//!     let container = PathBuf::from("/archive/run/20200101.nc.tar");
//!     tools.stage(&[container.clone()]).await?;
//!     let member = tools
//!         .unpack(&container, "20200101.ocean_month.nc", Path::new("/ptmp/run"))
//!         .await?;
//!     tools.copy(&member, Path::new("/vftmp/run")).await?;
//!     Ok(())
//! }
//! ```

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Output;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;

/// Text the staging tool prints when a file sits on an unreadable tape.
pub const BAD_MEDIUM_SIGNATURE: &str = "unable to recall the requested file";

/// Errors that can occur during unpack and copy operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Empty command configured for {0}")]
    EmptyCommand(&'static str),
}

/// Errors from a staging (tape recall) request
#[derive(Error, Debug)]
pub enum StagingError {
    /// At least one file lives on a bad medium; other files may still be
    /// recallable one at a time.
    #[error("Staging hit an unreadable medium: {stderr}")]
    BadMedium { stderr: String },

    #[error("Staging command failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Could not launch staging command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Empty staging command configured")]
    EmptyCommand,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait defining the interface to the archive and its cache tiers
///
/// Implementations must be safe to share across the batch worker pool.
#[async_trait::async_trait]
pub trait ArchiveTools: Send + Sync {
    /// Recalls all `paths` from tape in a single request.
    ///
    /// # Errors
    /// Returns `StagingError::BadMedium` when the tool reports an unreadable
    /// medium and `StagingError::Failed` for any other failure.
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), StagingError>;

    /// Extracts `member` from `container` into `dest_dir`, returning the
    /// path of the extracted file.
    async fn unpack(&self, container: &Path, member: &str, dest_dir: &Path) -> StorageResult<PathBuf>;

    /// Copies `src` into `dest_dir`, returning the path of the copy.
    async fn copy(&self, src: &Path, dest_dir: &Path) -> StorageResult<PathBuf>;
}

/// Returns whether `path` exists and is a regular file. A path running
/// through a non-directory does not exist.
pub async fn is_file(path: &Path) -> StorageResult<bool> {
    use std::io::ErrorKind;
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => Ok(false),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Archive tools backed by external commands
///
/// Each command string may carry its own arguments (e.g. `"gcp --verbose"`);
/// it is split on whitespace and the operation's arguments are appended.
#[derive(Debug, Clone)]
pub struct ShellTools {
    pub stage_command: String,
    pub copy_command: String,
    pub tar_command: String,
    /// Log the commands without running them.
    pub dry_run: bool,
}

impl Default for ShellTools {
    fn default() -> Self {
        ShellTools {
            stage_command: "dmget".to_string(),
            copy_command: "gcp".to_string(),
            tar_command: "tar".to_string(),
            dry_run: false,
        }
    }
}

impl ShellTools {
    pub fn new(stage_command: &str, copy_command: &str, tar_command: &str) -> Self {
        ShellTools {
            stage_command: stage_command.to_string(),
            copy_command: copy_command.to_string(),
            tar_command: tar_command.to_string(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Builds the argument vector for `command` followed by `args`.
    fn command_line(command: &str, args: &[String]) -> Option<Vec<String>> {
        let mut parts: Vec<String> = command.split_whitespace().map(|s| s.to_string()).collect();
        if parts.is_empty() {
            return None;
        }
        parts.extend(args.iter().cloned());
        Some(parts)
    }

    async fn execute(parts: &[String]) -> std::io::Result<Output> {
        debug!("Running: {}", parts.join(" "));
        Command::new(&parts[0]).args(&parts[1..]).output().await
    }

    async fn run_checked(&self, label: &'static str, command: &str, args: &[String]) -> StorageResult<()> {
        let parts = Self::command_line(command, args).ok_or(StorageError::EmptyCommand(label))?;
        info!("{}", parts.join(" "));
        if self.dry_run {
            return Ok(());
        }
        let output = Self::execute(&parts).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(StorageError::CommandFailed {
                command: parts.join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait::async_trait]
impl ArchiveTools for ShellTools {
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), StagingError> {
        if paths.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = paths.iter().map(|p| display(p)).collect();
        let parts = Self::command_line(&self.stage_command, &args).ok_or(StagingError::EmptyCommand)?;
        info!("Staging {} file(s): {}", paths.len(), parts.join(" "));
        if self.dry_run {
            return Ok(());
        }
        let output = Self::execute(&parts).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains(BAD_MEDIUM_SIGNATURE) {
            Err(StagingError::BadMedium { stderr })
        } else {
            Err(StagingError::Failed {
                status: output.status.to_string(),
                stderr,
            })
        }
    }

    async fn unpack(&self, container: &Path, member: &str, dest_dir: &Path) -> StorageResult<PathBuf> {
        if !self.dry_run {
            if !is_file(container).await? {
                return Err(StorageError::PathNotFound(display(container)));
            }
            fs::create_dir_all(dest_dir).await?;
        }
        let args = vec![
            "xf".to_string(),
            display(container),
            "-C".to_string(),
            display(dest_dir),
            format!("./{}", member),
        ];
        self.run_checked("unpack", &self.tar_command, &args).await?;
        Ok(dest_dir.join(member))
    }

    async fn copy(&self, src: &Path, dest_dir: &Path) -> StorageResult<PathBuf> {
        let file_name = src
            .file_name()
            .ok_or_else(|| StorageError::PathNotFound(display(src)))?;
        if !self.dry_run {
            fs::create_dir_all(dest_dir).await?;
        }
        let args = vec![display(src), display(dest_dir)];
        self.run_checked("copy", &self.copy_command, &args).await?;
        Ok(dest_dir.join(file_name))
    }
}
