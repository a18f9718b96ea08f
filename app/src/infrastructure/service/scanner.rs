//! Local tree enumeration with ignore filters and incremental hash reuse.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use typed_builder::TypedBuilder;

use domain::model::entity::LocalEntry;
use domain::SyncError;

use super::hasher;

/// Pattern-based exclusion set. Supports `*`, `?`, `[…]` and `**/` deep
/// matches; lines starting with `#` are comments.
#[derive(Debug)]
pub struct IgnoreFilter {
    set: Option<GlobSet>,
}

impl IgnoreFilter {
    pub fn new(patterns: &[String]) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut any = false;
        for line in patterns {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let glob = Glob::new(line)
                .map_err(|e| SyncError::ConfigInvalid(format!("bad ignore pattern {line}: {e}")))?;
            builder.add(glob);
            any = true;
        }
        let set = if any {
            Some(builder.build().map_err(|e| {
                SyncError::ConfigInvalid(format!("ignore patterns do not combine: {e}"))
            })?)
        } else {
            None
        };
        Ok(Self { set })
    }

    pub fn is_ignored(&self, relative_key: &str) -> bool {
        self.set.as_ref().map(|set| set.is_match(relative_key)).unwrap_or(false)
    }
}

/// Walks source roots into [`LocalEntry`] lists. The parallel enumerator is
/// tried first; any failure there falls back to a sequential walk that
/// tolerates unreadable entries.
#[derive(TypedBuilder)]
pub struct Scanner {
    filter: IgnoreFilter,
    #[builder(default)]
    follow_symlinks: bool,
    /// Worker threads for the parallel strategy; `None` takes the rayon
    /// default.
    #[builder(default)]
    degree: Option<usize>,
    #[builder(default = 1)]
    fast_hash_level: u32,
    #[builder(default)]
    encrypted: bool,
    #[builder(default)]
    encrypt_names: bool,
}

impl Scanner {
    /// `previous` is the persisted snapshot; a full SHA-1 is carried over
    /// when the `(length, last-write, creation)` triple still matches.
    pub fn scan(
        &self,
        root: &Path,
        previous: &HashMap<String, LocalEntry>,
    ) -> anyhow::Result<Vec<LocalEntry>> {
        match self.scan_parallel(root, previous) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(
                    root = %root.display(),
                    "Parallel scan failed, falling back to sequential walk: {e}"
                );
                self.scan_sequential(root, previous)
            }
        }
    }

    fn scan_parallel(
        &self,
        root: &Path,
        previous: &HashMap<String, LocalEntry>,
    ) -> anyhow::Result<Vec<LocalEntry>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.degree.unwrap_or(0))
            .build()?;

        let (tx, rx) = mpsc::channel();
        pool.scope(|scope| self.walk(scope, root, root.to_path_buf(), tx, previous));

        let mut entries = Vec::new();
        for received in rx {
            entries.push(received?);
        }
        Ok(entries)
    }

    fn walk<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        root: &'s Path,
        dir: PathBuf,
        tx: mpsc::Sender<io::Result<LocalEntry>>,
        previous: &'s HashMap<String, LocalEntry>,
    ) {
        scope.spawn(move |scope| {
            let read = match std::fs::read_dir(&dir) {
                Ok(read) => read,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            for dirent in read {
                let result = dirent.and_then(|d| self.consider(d.path(), root, previous));
                match result {
                    Ok(Some(entry)) if !entry.is_file => {
                        let path = entry.path.clone();
                        let _ = tx.send(Ok(entry));
                        self.walk(scope, root, path, tx.clone(), previous);
                    }
                    Ok(Some(entry)) => {
                        let _ = tx.send(Ok(entry));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            }
        });
    }

    fn scan_sequential(
        &self,
        root: &Path,
        previous: &HashMap<String, LocalEntry>,
    ) -> anyhow::Result<Vec<LocalEntry>> {
        let mut entries = Vec::new();
        let walker = walkdir::WalkDir::new(root)
            .follow_links(self.follow_symlinks)
            .min_depth(1)
            .into_iter()
            .filter_entry(|d| !self.filter.is_ignored(&relative_key(root, d.path())));
        for dirent in walker {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {e}");
                    continue;
                }
            };
            match self.consider(dirent.into_path(), root, previous) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable entry: {e}"),
            }
        }
        Ok(entries)
    }

    /// Filter, stat and fingerprint one path. `None` means excluded.
    fn consider(
        &self,
        path: PathBuf,
        root: &Path,
        previous: &HashMap<String, LocalEntry>,
    ) -> io::Result<Option<LocalEntry>> {
        let meta = if self.follow_symlinks {
            std::fs::metadata(&path)?
        } else {
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                return Ok(None);
            }
            meta
        };

        let key = relative_key(root, &path);
        if self.filter.is_ignored(&key) {
            return Ok(None);
        }

        let is_file = meta.is_file();
        let size = if is_file { meta.len() } else { 0 };
        let modified = system_time(meta.modified()?);
        let created = meta.created().map(system_time).unwrap_or(modified);

        let (fast_hash, sha1) = if is_file {
            let fast = hasher::fast_hash(&path, self.fast_hash_level)?;
            let reused = previous
                .get(&key)
                .filter(|old| {
                    old.size == size && old.modified == modified && old.created == created
                })
                .and_then(|old| old.sha1.clone());
            (Some(fast), reused)
        } else {
            (None, None)
        };

        let name = key.rsplit('/').next().unwrap_or(&key);
        let encrypted_name = (is_file && self.encrypted && self.encrypt_names)
            .then(|| format!("{:x}.e", md5::compute(name.as_bytes())));

        Ok(Some(LocalEntry {
            parent_key: key.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default(),
            key,
            path,
            is_file,
            size,
            created,
            modified,
            fast_hash,
            sha1,
            encrypted: is_file && self.encrypted,
            encrypted_name,
        }))
    }
}

fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    parts.join("/")
}

fn system_time(t: SystemTime) -> DateTime<Utc> {
    t.into()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn scanner(patterns: &[&str]) -> Scanner {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        Scanner::builder().filter(IgnoreFilter::new(&patterns).unwrap()).build()
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("A/deep")).unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("A/a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("A/deep/b.bin"), vec![1u8; 2048]).unwrap();
        fs::write(dir.path().join("logs/x.log"), b"log").unwrap();
        dir
    }

    #[test]
    fn scans_files_and_dirs_with_keys() {
        let dir = tree();
        let mut entries = scanner(&[]).scan(dir.path(), &HashMap::new()).unwrap();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "A/a.txt", "A/deep", "A/deep/b.bin", "logs", "logs/x.log"]);

        let file = entries.iter().find(|e| e.key == "A/a.txt").unwrap();
        assert!(file.is_file);
        assert_eq!(file.size, 5);
        assert!(file.fast_hash.is_some());
        assert!(file.sha1.is_none());

        let folder = entries.iter().find(|e| e.key == "A").unwrap();
        assert!(!folder.is_file);
    }

    #[test]
    fn ignore_patterns_and_comments() {
        let dir = tree();
        let entries = scanner(&["# comment", "**/*.log", "logs"])
            .scan(dir.path(), &HashMap::new())
            .unwrap();
        assert!(entries.iter().all(|e| !e.key.ends_with(".log")));
        assert!(entries.iter().all(|e| e.key != "logs"));
        assert!(entries.iter().any(|e| e.key == "A/a.txt"));
    }

    #[test]
    fn sha1_is_reused_while_triple_matches() {
        let dir = tree();
        let scanner = scanner(&[]);
        let first = scanner.scan(dir.path(), &HashMap::new()).unwrap();
        let mut previous: HashMap<String, LocalEntry> =
            first.into_iter().map(|e| (e.key.clone(), e)).collect();
        previous
            .get_mut("A/a.txt")
            .unwrap()
            .sha1
            .replace("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into());

        let second = scanner.scan(dir.path(), &previous).unwrap();
        let reused = second.iter().find(|e| e.key == "A/a.txt").unwrap();
        assert_eq!(reused.sha1.as_deref(), Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = IgnoreFilter::new(&["[".to_string()]).unwrap_err();
        assert!(matches!(SyncError::of(&err), Some(SyncError::ConfigInvalid(_))));
    }

    #[test]
    fn name_encryption_caches_hashed_names() {
        let dir = tree();
        let patterns: Vec<String> = vec![];
        let scanner = Scanner::builder()
            .filter(IgnoreFilter::new(&patterns).unwrap())
            .encrypted(true)
            .encrypt_names(true)
            .build();
        let entries = scanner.scan(dir.path(), &HashMap::new()).unwrap();
        let file = entries.iter().find(|e| e.key == "A/a.txt").unwrap();
        assert!(file.encrypted);
        let hashed = file.encrypted_name.as_ref().unwrap();
        assert!(hashed.ends_with(".e"));
        assert_eq!(hashed.len(), 32 + 2);
    }
}
