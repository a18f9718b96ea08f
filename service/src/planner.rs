use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use domain::model::entity::{
    ActionKind, Direction, LocalEntry, PlanAction, PlanSummary, RemoteEntry,
};
use domain::model::vo::config::{CompareMethod, ConflictResolution, JobConfig, SyncMode};
use domain::SyncError;

/// Diffs the two sides of a job and produces the ordered action list.
pub struct Planner {
    mode: SyncMode,
    compare: CompareMethod,
    conflict: ConflictResolution,
    time_drift_secs: i64,
    encrypted: bool,
}

pub struct PlanInput<'a> {
    /// Absolute local source roots; keys start with each root's dir name.
    pub source_roots: &'a [PathBuf],
    /// Present when the counterpart side is a local tree; checked against
    /// the source roots for the prefix rule.
    pub target_local_root: Option<&'a Path>,
    pub save_root: &'a str,
    pub local: &'a [LocalEntry],
    pub remote_files: &'a HashMap<String, RemoteEntry>,
    pub remote_folders: &'a HashMap<String, RemoteEntry>,
    /// Last persisted local state; difference detection for encrypted jobs,
    /// where the remote hash covers the envelope rather than the content.
    pub snapshot: &'a HashMap<String, LocalEntry>,
    pub now: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Plan {
    pub actions: Vec<PlanAction>,
    pub summary: PlanSummary,
}

impl Planner {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            mode: config.mode,
            compare: config.compare,
            conflict: config.conflict,
            time_drift_secs: config.time_drift_secs as i64,
            encrypted: config.encryption.is_some(),
        }
    }

    pub fn plan(&self, input: PlanInput<'_>) -> anyhow::Result<Plan> {
        validate_roots(input.source_roots, input.target_local_root)?;

        let mut actions = Vec::new();
        let mut skipped = 0u64;

        let mut local_dirs: Vec<&LocalEntry> =
            input.local.iter().filter(|e| !e.is_file).collect();
        local_dirs.sort_by(|a, b| a.key.cmp(&b.key));
        let mut local_files: Vec<&LocalEntry> =
            input.local.iter().filter(|e| e.is_file).collect();
        local_files.sort_by(|a, b| a.key.cmp(&b.key));

        // Remote keys a faithful copy of the local side would occupy.
        let expected_dirs: HashSet<String> =
            local_dirs.iter().map(|d| join_key(input.save_root, &d.key)).collect();
        let expected_files: HashSet<String> = local_files
            .iter()
            .map(|f| join_key(input.save_root, &f.remote_relative_key()))
            .collect();

        for dir in &local_dirs {
            let rkey = join_key(input.save_root, &dir.key);
            if !input.remote_folders.contains_key(&rkey) {
                actions.push(PlanAction::new(
                    ActionKind::CreateDirectory,
                    &dir.path,
                    rkey,
                    &dir.key,
                ));
            }
        }

        for file in &local_files {
            let rkey = join_key(input.save_root, &file.remote_relative_key());
            match input.remote_files.get(&rkey) {
                None => {
                    actions.push(
                        PlanAction::new(ActionKind::CopyFile, &file.path, rkey, &file.key)
                            .sized(file.size),
                    );
                }
                Some(remote) if self.mode == SyncMode::TwoWay => {
                    match self.resolve_conflict(file, remote, input.now, &mut actions) {
                        Emitted::Action => {}
                        Emitted::Skip => skipped += 1,
                    }
                }
                Some(remote) => {
                    if self.differs(file, remote, input.snapshot.get(&file.key)) {
                        actions.push(
                            PlanAction::new(ActionKind::UpdateFile, &file.path, rkey, &file.key)
                                .sized(file.size),
                        );
                    } else {
                        skipped += 1;
                    }
                }
            }
        }

        match self.mode {
            SyncMode::OneWay => {}
            SyncMode::Mirror => {
                for (rkey, remote) in input.remote_files {
                    if !expected_files.contains(rkey) {
                        actions.push(
                            PlanAction::new(
                                ActionKind::DeleteFile,
                                local_path_for(input.source_roots, &remote.key, input.save_root),
                                rkey.clone(),
                                strip_key(input.save_root, rkey),
                            )
                            .sized(remote.size),
                        );
                    }
                }
                // Children before parents.
                let mut stale_dirs: Vec<&RemoteEntry> = input
                    .remote_folders
                    .values()
                    .filter(|d| !expected_dirs.contains(&d.key))
                    .collect();
                stale_dirs.sort_by(|a, b| b.depth().cmp(&a.depth()).then(b.key.cmp(&a.key)));
                for dir in stale_dirs {
                    actions.push(PlanAction::new(
                        ActionKind::DeleteDirectory,
                        local_path_for(input.source_roots, &dir.key, input.save_root),
                        dir.key.clone(),
                        strip_key(input.save_root, &dir.key),
                    ));
                }
            }
            SyncMode::TwoWay => {
                for rkey in input.remote_folders.keys() {
                    if !expected_dirs.contains(rkey) {
                        actions.push(
                            PlanAction::new(
                                ActionKind::CreateDirectory,
                                local_path_for(input.source_roots, rkey, input.save_root),
                                rkey.clone(),
                                strip_key(input.save_root, rkey),
                            )
                            .towards(Direction::TargetToSource),
                        );
                    }
                }
                for (rkey, remote) in input.remote_files {
                    if !expected_files.contains(rkey) {
                        actions.push(
                            PlanAction::new(
                                ActionKind::CopyFile,
                                local_path_for(input.source_roots, rkey, input.save_root),
                                rkey.clone(),
                                strip_key(input.save_root, rkey),
                            )
                            .towards(Direction::TargetToSource)
                            .sized(remote.size),
                        );
                    }
                }
            }
        }

        // Strict priority order; emission order is kept inside a group.
        actions.sort_by_key(|a| a.kind.priority());

        let summary = PlanSummary::tally(&actions, skipped);
        Ok(Plan { actions, summary })
    }

    /// Whether the configured comparator reports a real difference.
    fn differs(
        &self,
        local: &LocalEntry,
        remote: &RemoteEntry,
        snapshot: Option<&LocalEntry>,
    ) -> bool {
        // The remote hash and size describe the envelope when encryption is
        // on; fall back to the last-uploaded local state instead.
        if self.encrypted {
            return match snapshot {
                Some(snap) => !local.unchanged_since(snap) || local.sha1 != snap.sha1,
                None => true,
            };
        }

        let drift = (local.modified - remote.updated).num_seconds().abs();
        match self.compare {
            CompareMethod::Size => local.size != remote.size,
            CompareMethod::DateTime => drift > self.time_drift_secs,
            CompareMethod::DateTimeAndSize => {
                local.size != remote.size || drift > self.time_drift_secs
            }
            CompareMethod::Content | CompareMethod::Hash => {
                match (&local.sha1, &remote.sha1) {
                    (Some(a), Some(b)) => !a.eq_ignore_ascii_case(b),
                    // Without both hashes assume difference; the uploader
                    // re-checks before moving bytes.
                    _ => true,
                }
            }
        }
    }

    fn resolve_conflict(
        &self,
        local: &LocalEntry,
        remote: &RemoteEntry,
        now: DateTime<Utc>,
        actions: &mut Vec<PlanAction>,
    ) -> Emitted {
        if !self.differs(local, remote, None) {
            return Emitted::Skip;
        }

        let rkey = remote.key.clone();
        let update = |direction| {
            PlanAction::new(ActionKind::UpdateFile, &local.path, rkey.clone(), &local.key)
                .towards(direction)
                .sized(match direction {
                    Direction::SourceToTarget => local.size,
                    Direction::TargetToSource => remote.size,
                })
                .resolved_by(self.conflict)
        };

        match self.conflict {
            ConflictResolution::Skip => Emitted::Skip,
            ConflictResolution::SourceWins => {
                actions.push(update(Direction::SourceToTarget));
                Emitted::Action
            }
            ConflictResolution::TargetWins => {
                actions.push(update(Direction::TargetToSource));
                Emitted::Action
            }
            ConflictResolution::Newer => {
                let direction = if local.modified >= remote.updated {
                    Direction::SourceToTarget
                } else {
                    Direction::TargetToSource
                };
                actions.push(update(direction));
                Emitted::Action
            }
            ConflictResolution::Older => {
                let direction = if local.modified <= remote.updated {
                    Direction::SourceToTarget
                } else {
                    Direction::TargetToSource
                };
                actions.push(update(direction));
                Emitted::Action
            }
            ConflictResolution::Larger => {
                let direction = if local.size >= remote.size {
                    Direction::SourceToTarget
                } else {
                    Direction::TargetToSource
                };
                actions.push(update(direction));
                Emitted::Action
            }
            ConflictResolution::KeepBoth => {
                let renamed = keep_both_name(&remote.name, now);
                let new_key = match remote.key.rsplit_once('/') {
                    Some((parent, _)) => format!("{parent}/{renamed}"),
                    None => renamed.clone(),
                };
                actions.push(
                    PlanAction::new(
                        ActionKind::RenameFile,
                        PathBuf::from(&remote.key),
                        new_key,
                        &local.key,
                    )
                    .resolved_by(self.conflict),
                );
                actions.push(
                    PlanAction::new(ActionKind::CopyFile, &local.path, remote.key.clone(), &local.key)
                        .sized(local.size)
                        .resolved_by(self.conflict),
                );
                Emitted::Action
            }
        }
    }
}

enum Emitted {
    Action,
    Skip,
}

/// `<stem> (yyyyMMdd_HHmmss)<ext>`
fn keep_both_name(name: &str, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({stamp}).{ext}"),
        _ => format!("{name} ({stamp})"),
    }
}

fn join_key(save_root: &str, key: &str) -> String {
    if save_root.is_empty() {
        key.to_owned()
    } else {
        format!("{save_root}/{key}")
    }
}

fn strip_key(save_root: &str, path_key: &str) -> String {
    path_key
        .strip_prefix(save_root)
        .map(|s| s.trim_start_matches('/'))
        .unwrap_or(path_key)
        .to_owned()
}

/// Where a remote path-key lands locally. Multi-root jobs prefix keys with
/// the root directory name, so a matching first segment picks that root;
/// otherwise the whole key is relative to the single (first) root.
fn local_path_for(source_roots: &[PathBuf], path_key: &str, save_root: &str) -> PathBuf {
    let key = strip_key(save_root, path_key);
    let first = key.split('/').next().unwrap_or("");
    if let Some(root) =
        source_roots.iter().find(|r| r.file_name().map(|n| n == first).unwrap_or(false))
    {
        let rest = key.strip_prefix(first).map(|s| s.trim_start_matches('/')).unwrap_or("");
        if rest.is_empty() {
            root.clone()
        } else {
            root.join(rest)
        }
    } else if let Some(root) = source_roots.first() {
        root.join(&key)
    } else {
        PathBuf::from(key)
    }
}

fn validate_roots(sources: &[PathBuf], target: Option<&Path>) -> anyhow::Result<()> {
    let Some(target) = target else { return Ok(()) };
    for source in sources {
        if source.starts_with(target) || target.starts_with(source) {
            return Err(SyncError::ConfigInvalid(format!(
                "source root {} and target root {} must not nest",
                source.display(),
                target.display()
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use domain::model::entity::ActionStatus;
    use domain::model::vo::config::TargetOptions;
    use uuid::Uuid;

    use super::*;

    fn local_file(key: &str, size: u64, modified: DateTime<Utc>, sha1: &str) -> LocalEntry {
        LocalEntry {
            path: PathBuf::from(format!("/data/{key}")),
            key: key.into(),
            parent_key: key.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default(),
            is_file: true,
            size,
            created: modified,
            modified,
            fast_hash: None,
            sha1: Some(sha1.into()),
            encrypted: false,
            encrypted_name: None,
        }
    }

    fn local_dir(key: &str) -> LocalEntry {
        let mut e = local_file(key, 0, Utc::now(), "");
        e.is_file = false;
        e.sha1 = None;
        e
    }

    fn remote_file(key: &str, size: u64, updated: DateTime<Utc>, sha1: &str) -> RemoteEntry {
        RemoteEntry {
            id: format!("id-{key}"),
            parent_id: "root".into(),
            name: key.rsplit('/').next().unwrap().into(),
            is_folder: false,
            size,
            sha1: Some(sha1.into()),
            created: updated,
            updated,
            key: key.into(),
        }
    }

    fn remote_folder(key: &str) -> RemoteEntry {
        let mut e = remote_file(key, 0, Utc::now(), "");
        e.is_folder = true;
        e.sha1 = None;
        e
    }

    fn config(mode: SyncMode, conflict: ConflictResolution) -> JobConfig {
        JobConfig {
            id: Uuid::new_v4(),
            name: "t".into(),
            sources: vec!["/data".into()],
            target: TargetOptions::CloudDrive {
                drive_id: "d".into(),
                save_root: "backup".into(),
            },
            mode,
            compare: CompareMethod::Hash,
            conflict,
            sampling_rate: 0.1,
            time_drift_secs: 1,
            parallelism: None,
            max_retries: 3,
            preserve_time: false,
            recycle_bin: false,
            follow_symlinks: false,
            ignore_patterns: vec![],
            encryption: None,
            rapid_upload: true,
            interval_secs: None,
            watcher: false,
            continue_on_error: false,
            read_only_mount: false,
            mount_used_space_local: false,
        }
    }

    fn plan(
        cfg: &JobConfig,
        local: Vec<LocalEntry>,
        remote_files: Vec<RemoteEntry>,
        remote_folders: Vec<RemoteEntry>,
    ) -> Plan {
        let roots = [PathBuf::from("/data")];
        let files: HashMap<_, _> = remote_files.into_iter().map(|e| (e.key.clone(), e)).collect();
        let folders: HashMap<_, _> =
            remote_folders.into_iter().map(|e| (e.key.clone(), e)).collect();
        Planner::from_config(cfg)
            .plan(PlanInput {
                source_roots: &roots,
                target_local_root: None,
                save_root: "backup",
                local: &local,
                remote_files: &files,
                remote_folders: &folders,
                snapshot: &HashMap::new(),
                now: Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap(),
            })
            .unwrap()
    }

    #[test]
    fn one_way_into_empty_target() {
        let cfg = config(SyncMode::OneWay, ConflictResolution::SourceWins);
        let t = Utc::now();
        let plan = plan(
            &cfg,
            vec![local_dir("A"), local_file("A/a.txt", 1024, t, "x")],
            vec![],
            vec![],
        );

        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].kind, ActionKind::CreateDirectory);
        assert_eq!(plan.actions[0].target, "backup/A");
        assert_eq!(plan.actions[1].kind, ActionKind::CopyFile);
        assert_eq!(plan.actions[1].target, "backup/A/a.txt");
        assert_eq!(plan.summary.files_to_copy, 1);
        assert_eq!(plan.summary.bytes_planned, 1024);
        assert_eq!(plan.actions[1].status, ActionStatus::Pending);
    }

    #[test]
    fn mirror_prunes_extras_children_first() {
        let cfg = config(SyncMode::Mirror, ConflictResolution::SourceWins);
        let t = Utc::now();
        let plan = plan(
            &cfg,
            vec![local_dir("A"), local_file("A/a.txt", 10, t, "same")],
            vec![
                remote_file("backup/A/a.txt", 10, t, "same"),
                remote_file("backup/A/b.txt", 5, t, "y"),
            ],
            vec![remote_folder("backup/A"), remote_folder("backup/A/old")],
        );

        let kinds: Vec<_> = plan.actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::DeleteFile, ActionKind::DeleteDirectory]);
        assert_eq!(plan.actions[0].target, "backup/A/b.txt");
        assert_eq!(plan.actions[1].target, "backup/A/old");
        assert_eq!(plan.summary.files_skipped, 1);
        assert_eq!(plan.summary.files_to_copy, 0);
    }

    #[test]
    fn mirror_deletes_nested_dirs_depth_first() {
        let cfg = config(SyncMode::Mirror, ConflictResolution::SourceWins);
        let plan = plan(
            &cfg,
            vec![],
            vec![],
            vec![
                remote_folder("backup/old"),
                remote_folder("backup/old/deep"),
                remote_folder("backup/old/deep/deeper"),
            ],
        );
        let targets: Vec<_> = plan.actions.iter().map(|a| a.target.as_str()).collect();
        assert_eq!(
            targets,
            vec!["backup/old/deep/deeper", "backup/old/deep", "backup/old"]
        );
    }

    #[test]
    fn two_way_newer_picks_fresher_side() {
        let cfg = config(SyncMode::TwoWay, ConflictResolution::Newer);
        let newer = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let plan = plan(
            &cfg,
            vec![local_file("f.txt", 10, newer, "aaa")],
            vec![remote_file("backup/f.txt", 10, older, "bbb")],
            vec![],
        );

        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::UpdateFile);
        assert_eq!(plan.actions[0].direction, Direction::SourceToTarget);
        assert_eq!(plan.summary.files_to_update, 1);
    }

    #[test]
    fn two_way_keep_both_renames_then_copies() {
        let cfg = config(SyncMode::TwoWay, ConflictResolution::KeepBoth);
        let t = Utc::now();
        let plan = plan(
            &cfg,
            vec![local_file("f.txt", 10, t, "aaa")],
            vec![remote_file("backup/f.txt", 10, t, "bbb")],
            vec![],
        );

        let kinds: Vec<_> = plan.actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::CopyFile, ActionKind::RenameFile]);
        let rename = plan.actions.iter().find(|a| a.kind == ActionKind::RenameFile).unwrap();
        assert_eq!(rename.target, "backup/f (20240301_103000).txt");
        // The executor front-runs the paired rename before a KeepBoth copy,
        // so the conflicting name is free when the copy lands.
        assert_eq!(plan.summary.files_to_copy, 1);
        assert_eq!(plan.summary.files_to_rename, 1);
    }

    #[test]
    fn two_way_agreeing_sides_emit_nothing() {
        let cfg = config(SyncMode::TwoWay, ConflictResolution::Newer);
        let t = Utc::now();
        let plan = plan(
            &cfg,
            vec![local_file("f.txt", 10, t, "same")],
            vec![remote_file("backup/f.txt", 10, t, "same")],
            vec![],
        );
        assert!(plan.actions.is_empty());
        assert_eq!(plan.summary.files_skipped, 1);
    }

    #[test]
    fn two_way_remote_only_file_downloads() {
        let cfg = config(SyncMode::TwoWay, ConflictResolution::Newer);
        let plan = plan(
            &cfg,
            vec![],
            vec![remote_file("backup/only-remote.txt", 7, Utc::now(), "zzz")],
            vec![],
        );
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::CopyFile);
        assert_eq!(plan.actions[0].direction, Direction::TargetToSource);
        assert_eq!(plan.actions[0].source, PathBuf::from("/data/only-remote.txt"));
        assert_eq!(plan.actions[0].size, 7);
    }

    #[test]
    fn nested_roots_refuse_to_plan() {
        let cfg = config(SyncMode::OneWay, ConflictResolution::SourceWins);
        let roots = [PathBuf::from("/data")];
        let err = Planner::from_config(&cfg)
            .plan(PlanInput {
                source_roots: &roots,
                target_local_root: Some(Path::new("/data/mirror")),
                save_root: "backup",
                local: &[],
                remote_files: &HashMap::new(),
                remote_folders: &HashMap::new(),
                snapshot: &HashMap::new(),
                now: Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(
            SyncError::of(&err),
            Some(SyncError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn keep_both_name_without_extension() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        assert_eq!(keep_both_name("notes", now), "notes (20240301_103000)");
        assert_eq!(keep_both_name("a.tar.gz", now), "a.tar (20240301_103000).gz");
    }
}
