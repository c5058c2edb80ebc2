//! Shared fixtures for unit and scenario tests.

use crate::dataset::{Dataset, DatasetResult, Encoding, Variable};
use crate::run::RunIdentity;
use crate::storage::{ArchiveTools, StagingError, StorageError, StorageResult, BAD_MEDIUM_SIGNATURE};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-process archive tools. Containers are plain files whose bytes are
/// the member file itself, so "unpacking" is a copy.
#[derive(Default)]
pub struct FakeTools {
    stage_calls: AtomicUsize,
    unpack_calls: AtomicUsize,
    copy_calls: AtomicUsize,
    bad: HashSet<PathBuf>,
    failing: bool,
    pub staged: Mutex<Vec<Vec<PathBuf>>>,
}

impl FakeTools {
    pub fn with_bad(bad: &[PathBuf]) -> Self {
        FakeTools {
            bad: bad.iter().cloned().collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        FakeTools {
            failing: true,
            ..Default::default()
        }
    }

    pub fn stage_calls(&self) -> usize {
        self.stage_calls.load(Ordering::SeqCst)
    }

    pub fn unpack_calls(&self) -> usize {
        self.unpack_calls.load(Ordering::SeqCst)
    }

    pub fn copy_calls(&self) -> usize {
        self.copy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ArchiveTools for FakeTools {
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), StagingError> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        self.staged.lock().unwrap().push(paths.to_vec());
        if self.failing {
            return Err(StagingError::Failed {
                status: "exit status: 2".to_string(),
                stderr: "dmget: server unavailable".to_string(),
            });
        }
        if paths.iter().any(|p| self.bad.contains(p)) {
            return Err(StagingError::BadMedium {
                stderr: format!("dmget: {}", BAD_MEDIUM_SIGNATURE),
            });
        }
        Ok(())
    }

    async fn unpack(&self, container: &Path, member: &str, dest_dir: &Path) -> StorageResult<PathBuf> {
        self.unpack_calls.fetch_add(1, Ordering::SeqCst);
        if !container.is_file() {
            return Err(StorageError::PathNotFound(container.display().to_string()));
        }
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(member);
        std::fs::copy(container, &dest)?;
        Ok(dest)
    }

    async fn copy(&self, src: &Path, dest_dir: &Path) -> StorageResult<PathBuf> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(src.file_name().unwrap());
        std::fs::copy(src, &dest)?;
        Ok(dest)
    }
}

/// Writes a raw model history file: `tos[time, yh, xh] = base + t` and a
/// constant `sos`, on a 2x2 grid.
pub fn write_raw_history(path: &Path, ntime: usize, base: f64) -> DatasetResult<()> {
    let mut ds = Dataset::new();
    let tos: Vec<f64> = (0..ntime)
        .flat_map(|t| std::iter::repeat(base + t as f64).take(4))
        .collect();
    ds.add_data_var(
        "tos",
        Variable::new(&["time", "yh", "xh"], ArrayD::from_shape_vec(IxDyn(&[ntime, 2, 2]), tos)?)
            .with_attr("units", "degC"),
    )?;
    ds.add_data_var(
        "sos",
        Variable::new(&["time", "yh", "xh"], ArrayD::from_elem(IxDyn(&[ntime, 2, 2]), 35.0)),
    )?;
    ds.add_coord(
        "time",
        Variable::from_vec("time", (0..ntime).map(|t| 15.0 + 30.0 * t as f64).collect())
            .with_attr("units", "days since 2020-01-01"),
    )?;
    ds.add_coord("yh", Variable::from_vec("yh", vec![10.0, 11.0]))?;
    ds.add_coord("xh", Variable::from_vec("xh", vec![-70.0, -69.0]))?;
    ds.write(path, &Encoding::new().unlimited("time"))
}

/// Places a container for `run` in its archive directory, holding a
/// three-step raw history file whose values start at the member number.
pub fn archive_container(run: &RunIdentity) -> DatasetResult<PathBuf> {
    let dir = run.archive_dir().unwrap();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(run.container_name());
    write_raw_history(&path, 3, run.ensemble_member as f64)?;
    Ok(path)
}

/// Places a real tar container for `run` in its archive directory. The
/// member's `tos` starts at `base`. `scratch` holds the file before packing.
pub fn tar_container(run: &RunIdentity, base: f64, scratch: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let member = run.member_file_name();
    let src = scratch.join(format!("e{:02}-{}", run.ensemble_member, run.container_name()));
    std::fs::create_dir_all(&src)?;
    write_raw_history(&src.join(&member), 3, base)?;

    let dir = run.archive_dir()?;
    std::fs::create_dir_all(&dir)?;
    let container = dir.join(run.container_name());
    let status = std::process::Command::new("tar")
        .arg("cf")
        .arg(&container)
        .arg("-C")
        .arg(&src)
        .arg(format!("./{}", member))
        .status()?;
    if !status.success() {
        return Err(format!("tar failed for {}", container.display()).into());
    }
    Ok(container)
}
