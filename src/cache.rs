//! # Tiered File Cache
//!
//! History files live in three tiers, slowest first:
//!
//! 1. **Archive**: tape-backed, authoritative; files must be staged before
//!    they can be read and sit inside a per-run container.
//! 2. **Intermediate**: shared disk cache mirroring the archive layout.
//! 3. **Local**: per-node scratch space, private to one experiment.
//!
//! A file found in a faster tier is used as-is. Misses are filled by
//! promoting the file upward (Archive → Intermediate → Local); nothing is
//! ever written back. The cache never deletes files; see
//! [`crate::cleanup`] for that.

use crate::run::{RunIdentity, TemplateError};
use crate::storage::{ArchiveTools, StagingError, StorageError, is_file};
use log::{debug, info, warn};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while resolving a run through the cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No copy of {0} exists in any tier")]
    MissingSource(String),

    #[error("Archive file {0} could not be recalled")]
    Unrecallable(String),

    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid archive template: {0}")]
    Template(#[from] TemplateError),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Storage tiers, ordered from slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheTier {
    Archive,
    Intermediate,
    Local,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CacheTier::Archive => "archive",
            CacheTier::Intermediate => "intermediate",
            CacheTier::Local => "local",
        };
        f.write_str(name)
    }
}

/// Roots of the two writable tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub local_root: PathBuf,
    pub intermediate_root: PathBuf,
}

/// Outcome of resolving several runs at once.
#[derive(Debug, Default)]
pub struct Resolved {
    pub available: Vec<(RunIdentity, PathBuf)>,
    pub missing: Vec<RunIdentity>,
    pub unrecallable: Vec<RunIdentity>,
    /// Runs that were staged but could not be promoted to the Local tier.
    pub failed: Vec<(RunIdentity, CacheError)>,
}

/// Cache over the archive tiers for forecast history files
pub struct TieredCache<T: ArchiveTools> {
    config: CacheConfig,
    tools: T,
}

impl<T: ArchiveTools> TieredCache<T> {
    pub fn new(config: CacheConfig, tools: T) -> Self {
        TieredCache { config, tools }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }

    /// Where the run's member file lives in the Local tier.
    pub fn local_path(&self, run: &RunIdentity) -> PathBuf {
        run.local_dir(&self.config.local_root).join(run.member_file_name())
    }

    /// Where the run's member file lives in the Intermediate tier.
    pub fn intermediate_path(&self, run: &RunIdentity) -> CacheResult<PathBuf> {
        Ok(run
            .intermediate_dir(&self.config.intermediate_root)?
            .join(run.member_file_name()))
    }

    /// Fastest tier holding the run's member file, if any.
    pub async fn locate(&self, run: &RunIdentity) -> CacheResult<Option<CacheTier>> {
        if is_file(&self.local_path(run)).await? {
            return Ok(Some(CacheTier::Local));
        }
        if is_file(&self.intermediate_path(run)?).await? {
            return Ok(Some(CacheTier::Intermediate));
        }
        if is_file(&run.container_path()?).await? {
            return Ok(Some(CacheTier::Archive));
        }
        Ok(None)
    }

    /// Promotes the run's member file into the Local tier without staging.
    ///
    /// Archive containers are assumed to be online already; use
    /// [`TieredCache::resolve`] or [`TieredCache::stage`] first otherwise.
    pub async fn fetch(&self, run: &RunIdentity, tier: CacheTier) -> CacheResult<PathBuf> {
        let local = self.local_path(run);
        match tier {
            CacheTier::Local => {
                debug!("{}: local hit", run);
                Ok(local)
            }
            CacheTier::Intermediate => {
                debug!("{}: intermediate hit", run);
                let source = self.intermediate_path(run)?;
                Ok(self.tools.copy(&source, &run.local_dir(&self.config.local_root)).await?)
            }
            CacheTier::Archive => {
                debug!("{}: unpacking from archive", run);
                let extracted = self
                    .tools
                    .unpack(
                        &run.container_path()?,
                        &run.member_file_name(),
                        &run.intermediate_dir(&self.config.intermediate_root)?,
                    )
                    .await?;
                Ok(self.tools.copy(&extracted, &run.local_dir(&self.config.local_root)).await?)
            }
        }
    }

    /// Guarantees the run's member file exists in the Local tier and returns
    /// its path, staging it from the archive when needed.
    pub async fn resolve(&self, run: &RunIdentity) -> CacheResult<PathBuf> {
        let tier = self
            .locate(run)
            .await?
            .ok_or_else(|| CacheError::MissingSource(run.to_string()))?;
        if tier == CacheTier::Archive {
            let container = run.container_path()?;
            match self.tools.stage(&[container.clone()]).await {
                Ok(()) => {}
                Err(StagingError::BadMedium { .. }) => {
                    return Err(CacheError::Unrecallable(container.display().to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.fetch(run, tier).await
    }

    /// Stages the containers of `runs` with a single request.
    ///
    /// If the request reports a bad medium, each container is staged on its
    /// own instead; the runs whose containers still fail are returned.
    /// Any other staging failure is fatal.
    pub async fn stage(&self, runs: &[RunIdentity]) -> CacheResult<Vec<RunIdentity>> {
        if runs.is_empty() {
            info!("No files to stage");
            return Ok(Vec::new());
        }
        let containers: Vec<PathBuf> = runs
            .iter()
            .map(|r| r.container_path())
            .collect::<Result<_, _>>()?;
        info!("Staging {} file(s)", containers.len());
        match self.tools.stage(&containers).await {
            Ok(()) => Ok(Vec::new()),
            Err(StagingError::BadMedium { stderr }) => {
                warn!("Bulk staging failed ({}). Staging files one at a time.", stderr);
                let mut failed = Vec::new();
                for (run, container) in runs.iter().zip(&containers) {
                    if let Err(e) = self.tools.stage(std::slice::from_ref(container)).await {
                        warn!(
                            "Could not stage {}: {}. Removing it from this batch.",
                            container.display(),
                            e
                        );
                        failed.push(run.clone());
                    }
                }
                Ok(failed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves many runs, issuing at most one combined staging request for
    /// every run that needs recall from the archive.
    ///
    /// Only a fatal staging failure aborts the set; a run that fails to
    /// promote is recorded in [`Resolved::failed`] and the rest continue.
    pub async fn resolve_many(&self, runs: &[RunIdentity]) -> CacheResult<Resolved> {
        let mut resolved = Resolved::default();
        let mut located = Vec::with_capacity(runs.len());
        for run in runs {
            match self.locate(run).await? {
                Some(tier) => located.push((run, tier)),
                None => {
                    warn!("{}: not found in any tier", run);
                    resolved.missing.push(run.clone());
                }
            }
        }
        let to_stage: Vec<RunIdentity> = located
            .iter()
            .filter(|(_, tier)| *tier == CacheTier::Archive)
            .map(|(run, _)| (*run).clone())
            .collect();
        resolved.unrecallable = self.stage(&to_stage).await?;

        for (run, tier) in located {
            if resolved.unrecallable.contains(run) {
                continue;
            }
            match self.fetch(run, tier).await {
                Ok(path) => resolved.available.push((run.clone(), path)),
                Err(e) => {
                    warn!("{}: could not be promoted from the {} tier: {}", run, tier, e);
                    resolved.failed.push((run.clone(), e));
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeTools, archive_container};
    use std::error::Error;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (CacheConfig, String) {
        let config = CacheConfig {
            local_root: dir.path().join("local"),
            intermediate_root: dir.path().join("intermediate"),
        };
        let template = format!("{}/archive/{{year}}-e{{ensemble:02d}}", dir.path().display());
        (config, template)
    }

    #[tokio::test]
    async fn test_locate_prefers_fastest_tier() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let (config, template) = setup(&dir);
        let cache = TieredCache::new(config, FakeTools::default());
        let run = RunIdentity::new(2020, 1, 1, "ocean_month", "exp", &template);

        assert_eq!(cache.locate(&run).await?, None);
        archive_container(&run)?;
        assert_eq!(cache.locate(&run).await?, Some(CacheTier::Archive));

        let inter = cache.intermediate_path(&run)?;
        std::fs::create_dir_all(inter.parent().unwrap())?;
        std::fs::write(&inter, b"x")?;
        assert_eq!(cache.locate(&run).await?, Some(CacheTier::Intermediate));

        let local = cache.local_path(&run);
        std::fs::create_dir_all(local.parent().unwrap())?;
        std::fs::write(&local, b"x")?;
        assert_eq!(cache.locate(&run).await?, Some(CacheTier::Local));
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_promotes_through_tiers() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let (config, template) = setup(&dir);
        let cache = TieredCache::new(config, FakeTools::default());
        let run = RunIdentity::new(2020, 2, 3, "ocean_month", "exp", &template);
        archive_container(&run)?;

        let path = cache.resolve(&run).await?;
        assert_eq!(path, cache.local_path(&run));
        assert!(path.is_file());
        assert!(cache.intermediate_path(&run)?.is_file());
        assert_eq!(cache.tools().stage_calls(), 1);
        assert_eq!(cache.tools().unpack_calls(), 1);

        // Warm cache: nothing else is staged or copied.
        let again = cache.resolve(&run).await?;
        assert_eq!(again, path);
        assert_eq!(cache.tools().stage_calls(), 1);
        assert_eq!(cache.tools().copy_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_missing_everywhere() {
        let dir = TempDir::new().unwrap();
        let (config, template) = setup(&dir);
        let cache = TieredCache::new(config, FakeTools::default());
        let run = RunIdentity::new(1990, 1, 1, "ocean_month", "exp", &template);
        assert!(matches!(cache.resolve(&run).await, Err(CacheError::MissingSource(_))));
    }

    #[tokio::test]
    async fn test_resolve_many_bad_tape_fallback() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let (config, template) = setup(&dir);
        let runs = RunIdentity::grid(2015..=2019, &[1], 1, "ocean_month", "exp", &template);
        for run in &runs {
            archive_container(run)?;
        }
        let bad = runs[2].container_path()?;
        let cache = TieredCache::new(config, FakeTools::with_bad(&[bad]));

        let resolved = cache.resolve_many(&runs).await?;
        assert_eq!(resolved.available.len(), 4);
        assert_eq!(resolved.unrecallable, vec![runs[2].clone()]);
        assert!(resolved.missing.is_empty());
        assert!(resolved.failed.is_empty());
        // One bulk request, then one per file.
        assert_eq!(cache.tools().stage_calls(), 6);
        assert_eq!(cache.tools().unpack_calls(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_staging_error_propagates() {
        let dir = TempDir::new().unwrap();
        let (config, template) = setup(&dir);
        let run = RunIdentity::new(2020, 1, 1, "ocean_month", "exp", &template);
        archive_container(&run).unwrap();
        let cache = TieredCache::new(config, FakeTools::failing());
        let result = cache.resolve_many(std::slice::from_ref(&run)).await;
        assert!(matches!(result, Err(CacheError::Staging(StagingError::Failed { .. }))));
    }

    #[tokio::test]
    async fn test_resolve_many_records_promotion_failures() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let (config, template) = setup(&dir);
        let runs = RunIdentity::grid(2020..=2020, &[1], 2, "ocean_month", "exp", &template);
        for run in &runs {
            archive_container(run)?;
        }
        let cache = TieredCache::new(config, FakeTools::default());
        // A plain file where member 2's local directory belongs.
        let blocked = runs[1].local_dir(&cache.config().local_root);
        std::fs::create_dir_all(blocked.parent().unwrap())?;
        std::fs::write(&blocked, b"x")?;

        let resolved = cache.resolve_many(&runs).await?;
        assert_eq!(resolved.available.len(), 1);
        assert_eq!(resolved.available[0].0, runs[0]);
        assert!(resolved.available[0].1.is_file());
        assert_eq!(resolved.failed.len(), 1);
        assert_eq!(resolved.failed[0].0, runs[1]);
        assert!(matches!(resolved.failed[0].1, CacheError::Storage(_)));
        assert_eq!(cache.tools().stage_calls(), 1);
        Ok(())
    }
}
