// src/state.rs
// Shared atomic-rename JSON writer for the state files in spec.md §6
// (watch-state.json, watcher.pid, watcher-health.json, retirements.json,
// review-queue.json): all of them are "write to a sibling temp file, then
// rename" so a crash mid-write never leaves a half-written file behind.

use std::fs;
use std::io;
use std::path::Path;

/// Write `value` as pretty JSON to `path` via a same-directory temp file and
/// rename, with 0600 perms and a 0700 parent directory.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
    }

    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp_path, json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Tolerant reader: a missing or corrupt file returns `T::default()`
/// (spec.md §9 "readers tolerate missing or corrupt files").
pub fn read_json_tolerant<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "corrupt state file, treating as absent");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        atomic_write_json(&path, &Sample { n: 7 }).unwrap();
        let read: Sample = read_json_tolerant(&path);
        assert_eq!(read, Sample { n: 7 });
    }

    #[test]
    fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Sample = read_json_tolerant(&path);
        assert_eq!(read, Sample::default());
    }

    #[test]
    fn corrupt_file_reads_as_default_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        fs::write(&path, "{not json").unwrap();
        let read: Sample = read_json_tolerant(&path);
        assert_eq!(read, Sample::default());
    }
}
