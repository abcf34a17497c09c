// src/watch/resolver.rs
// Active-session-file resolution per platform (spec.md §4.I). Grounded on
// the teacher's `find_session_jsonl` (walks `~/.claude/projects/*/` for a
// session file), generalized into one function per platform so a new
// platform is a new function, not a branch threaded through one, the same
// tagged-dispatch shape as the adapter registry.

use std::fs;
use std::path::{Path, PathBuf};

use crate::types::Platform;

/// Resolve the file the watcher should currently be tailing for `platform`,
/// or `None` if no session directory/file can be found yet.
pub fn resolve_active_file(platform: Platform) -> Option<PathBuf> {
    match platform {
        Platform::Openclaw => resolve_openclaw(),
        Platform::Codex => resolve_by_directory_walk(&codex_root(), is_subagent_path),
        Platform::ClaudeCode => resolve_by_directory_walk(&claude_code_root(), is_subagent_path),
    }
}

fn openclaw_root() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".openclaw")
}

fn codex_root() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".codex").join("sessions")
}

fn claude_code_root() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".claude").join("projects")
}

#[derive(serde::Deserialize)]
struct OpenclawManifest {
    #[serde(rename = "activeSession")]
    active_session: Option<String>,
}

/// OpenClaw keeps a `sessions/manifest.json` naming the active session; fall
/// back to newest-mtime `.jsonl` in the sessions directory when the
/// manifest is missing, corrupt, or names a file that no longer exists
/// (spec.md §4.I "OpenClaw reads a manifest, then mtime").
fn resolve_openclaw() -> Option<PathBuf> {
    let sessions_dir = openclaw_root().join("sessions");
    let manifest_path = sessions_dir.join("manifest.json");

    if let Ok(contents) = fs::read_to_string(&manifest_path) {
        if let Ok(manifest) = serde_json::from_str::<OpenclawManifest>(&contents) {
            if let Some(active) = manifest.active_session {
                let candidate = sessions_dir.join(format!("{active}.jsonl"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }

    newest_by_mtime(&sessions_dir, |p| {
        p.extension().and_then(|e| e.to_str()) == Some("jsonl")
    })
}

/// Codex and Claude Code both lay sessions out as a directory tree of
/// `*.jsonl` files, with subagent runs interleaved alongside the primary
/// session; the active file is the newest-mtime `.jsonl` whose path doesn't
/// look like a subagent run (spec.md §4.I "walk directory trees ignoring
/// subagent paths").
fn resolve_by_directory_walk(root: &Path, exclude: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("jsonl"))
        .filter(|e| !exclude(e.path()))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path().to_path_buf(), modified))
        })
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path)
}

fn is_subagent_path(path: &Path) -> bool {
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        s.contains("subagent") || s.contains("sub-agent")
    })
}

fn newest_by_mtime(dir: &Path, filter: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| filter(p))
        .filter_map(|p| {
            let modified = fs::metadata(&p).ok()?.modified().ok()?;
            Some((p, modified))
        })
        .max_by_key(|(_, m)| *m)
        .map(|(p, _)| p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subagent_paths_are_excluded() {
        assert!(is_subagent_path(Path::new("/x/subagent-1/run.jsonl")));
        assert!(is_subagent_path(Path::new("/x/sub-agent/run.jsonl")));
        assert!(!is_subagent_path(Path::new("/x/main/run.jsonl")));
    }

    #[test]
    fn newest_by_mtime_picks_the_most_recently_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        std::fs::write(&a, "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&b, "b").unwrap();
        let newest = newest_by_mtime(dir.path(), |p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"));
        assert_eq!(newest, Some(b));
    }

    #[test]
    fn directory_walk_skips_subagent_and_picks_newest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proj1")).unwrap();
        std::fs::create_dir_all(dir.path().join("proj1/subagent-run")).unwrap();
        let main = dir.path().join("proj1/main.jsonl");
        let sub = dir.path().join("proj1/subagent-run/child.jsonl");
        std::fs::write(&sub, "s").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&main, "m").unwrap();
        let resolved = resolve_by_directory_walk(dir.path(), is_subagent_path);
        assert_eq!(resolved, Some(main));
    }

    #[test]
    fn missing_root_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert_eq!(resolve_by_directory_walk(&missing, is_subagent_path), None);
    }
}
