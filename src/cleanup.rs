//! # Cleanup
//!
//! Removes extracted products and the Local-tier member files they were
//! made from. The cache itself never deletes anything; this is the only
//! place files are removed in bulk.

use log::info;
use std::path::{Path, PathBuf};

/// Matches `name` against a pattern where `?` stands for exactly one
/// character and `*` for any run of characters.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ni = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Where to look for files to remove.
#[derive(Debug, Clone)]
pub struct CleanupTargets {
    pub domain: String,
    /// Directory of extracted products (`<output>/extracted/<domain>`).
    pub extracted_dir: PathBuf,
    /// Local-tier directory of every ensemble member.
    pub local_dirs: Vec<PathBuf>,
}

/// Files in `dir` whose names match `pattern`, sorted. A missing directory
/// yields no files.
fn matching_files(dir: &Path, pattern: &str) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| wildcard_match(pattern, n));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Deletes (or with `dry_run`, only lists) extracted products and Local-tier
/// member files for the target domain. Returns the affected paths.
pub fn cleanup(targets: &CleanupTargets, dry_run: bool) -> std::io::Result<Vec<PathBuf>> {
    let mut affected = matching_files(
        &targets.extracted_dir,
        &format!("????-??-e??.{}.nc", targets.domain),
    )?;
    let member_pattern = format!("????????.{}.nc", targets.domain);
    for dir in &targets.local_dirs {
        affected.extend(matching_files(dir, &member_pattern)?);
    }
    for path in &affected {
        info!("rm {}", path.display());
        if !dry_run {
            std::fs::remove_file(path)?;
        }
    }
    Ok(affected)
}
