//! Applies a placement plan through a [`FileOps`] primitive.

use crate::core::image::ImageId;
use crate::core::placement::{PlacementPlan, PlacementRole};
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Symlink,
    Copy,
    Move,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Symlink => "SYMLINK",
            OperationKind::Copy => "COPY",
            OperationKind::Move => "MOVE",
        })
    }
}

/// Physical file operations. Implementations create missing parent
/// directories and must not replace an existing target unless `overwrite`.
pub trait FileOps: Send + Sync {
    /// True for files, directories and dangling symlinks alike.
    fn exists(&self, path: &Path) -> bool;

    fn apply(
        &self,
        source: &Path,
        target: &Path,
        operation: OperationKind,
        overwrite: bool,
    ) -> Result<(), CoreError>;

    /// Symlink at `original` pointing to `moved_to`.
    fn backlink(&self, original: &Path, moved_to: &Path) -> Result<(), CoreError>;

    fn remove(&self, path: &Path) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedEntry {
    pub image: ImageId,
    pub role: PlacementRole,
    pub source: PathBuf,
    pub target: PathBuf,
    pub operation: OperationKind,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub dry_run: bool,
    pub completed: Vec<ExecutedEntry>,
    pub failed: Vec<CoreError>,
    pub excluded: Vec<PathBuf>,
    /// Symlinks left at original locations after moves
    pub backlinks: Vec<PathBuf>,
}

impl ExecutionReport {
    /// `(completed, failed, excluded)` counts.
    pub fn categories(&self) -> (usize, usize, usize) {
        (self.completed.len(), self.failed.len(), self.excluded.len())
    }
}

/// What a dry run believes the filesystem looks like after each step.
#[derive(Default)]
struct VirtualState {
    created: HashSet<PathBuf>,
    removed: HashSet<PathBuf>,
}

impl VirtualState {
    fn exists(&self, fs: &dyn FileOps, path: &Path) -> bool {
        self.created.contains(path) || (!self.removed.contains(path) && fs.exists(path))
    }
}

pub struct ExecutionAdapter {
    fs: Arc<dyn FileOps>,
    best_operation: Option<OperationKind>,
    collection_operation: OperationKind,
    create_backlinks: bool,
}

impl ExecutionAdapter {
    pub fn new(fs: Arc<dyn FileOps>) -> Self {
        Self {
            fs,
            best_operation: None,
            collection_operation: OperationKind::Copy,
            create_backlinks: false,
        }
    }

    /// Operation for winners in `best/`; `None` uses the run's operation.
    pub fn with_best_operation(mut self, operation: Option<OperationKind>) -> Self {
        self.best_operation = operation;
        self
    }

    pub fn with_collection_operation(mut self, operation: OperationKind) -> Self {
        self.collection_operation = operation;
        self
    }

    pub fn with_backlinks(mut self, enabled: bool) -> Self {
        self.create_backlinks = enabled;
        self
    }

    /// Apply every entry in plan order. Failures are collected per entry and
    /// never stop the remaining entries.
    pub fn execute(&self, plan: &PlacementPlan, operation: OperationKind, dry_run: bool) -> ExecutionReport {
        let mut report = ExecutionReport {
            dry_run,
            ..Default::default()
        };
        let mut virtual_state = VirtualState::default();
        // where each moved winner ended up, for its collected entry
        let mut best_targets: HashMap<ImageId, PathBuf> = HashMap::new();

        for entry in &plan.entries {
            let Some(target) = entry.target.as_deref() else {
                report.excluded.push(entry.source.clone());
                continue;
            };

            let (op, read_from) = match entry.role {
                PlacementRole::Collected => {
                    let read_from = best_targets
                        .get(&entry.image)
                        .cloned()
                        .unwrap_or_else(|| entry.source.clone());
                    (self.collection_operation, read_from)
                }
                PlacementRole::Best => (self.best_operation.unwrap_or(operation), entry.source.clone()),
                _ => (operation, entry.source.clone()),
            };

            let result = if dry_run {
                self.simulate(&mut virtual_state, &read_from, target, op, entry.overwrite)
            } else {
                self.fs.apply(&read_from, target, op, entry.overwrite)
            };
            if let Err(e) = result {
                log::warn!("{}", e);
                report.failed.push(e);
                continue;
            }

            if entry.role == PlacementRole::Best && op == OperationKind::Move {
                best_targets.insert(entry.image, target.to_path_buf());
            }
            if op == OperationKind::Move && self.create_backlinks && entry.role != PlacementRole::Collected {
                if dry_run {
                    log::info!("[dry-run] BACKLINK {} -> {}", read_from.display(), target.display());
                    virtual_state.created.insert(read_from.clone());
                    report.backlinks.push(read_from.clone());
                } else {
                    match self.fs.backlink(&read_from, target) {
                        Ok(()) => report.backlinks.push(read_from.clone()),
                        Err(e) => {
                            log::warn!("{}", e);
                            report.failed.push(e);
                        }
                    }
                }
            }

            report.completed.push(ExecutedEntry {
                image: entry.image,
                role: entry.role,
                source: read_from,
                target: target.to_path_buf(),
                operation: op,
                overwrite: entry.overwrite,
            });
        }

        log::info!(
            "{}{} completed, {} failed, {} excluded",
            if dry_run { "[dry-run] " } else { "" },
            report.completed.len(),
            report.failed.len(),
            report.excluded.len()
        );
        report
    }

    /// Check what a real run would check, log the action, and update the
    /// virtual view instead of the disk.
    fn simulate(
        &self,
        state: &mut VirtualState,
        source: &Path,
        target: &Path,
        op: OperationKind,
        overwrite: bool,
    ) -> Result<(), CoreError> {
        let fs = self.fs.as_ref();
        if !state.exists(fs, source) {
            return Err(CoreError::filesystem(source, "source does not exist"));
        }
        if !overwrite && state.exists(fs, target) {
            return Err(CoreError::filesystem(target, "target already exists"));
        }
        log::info!("[dry-run] {} {} -> {}", op, source.display(), target.display());
        state.created.insert(target.to_path_buf());
        state.removed.remove(target);
        if op == OperationKind::Move {
            state.created.remove(source);
            state.removed.insert(source.to_path_buf());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::placement::PlacementEntry;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Node {
        File,
        Link(PathBuf),
    }

    /// In-memory filesystem for planner and adapter tests.
    #[derive(Default)]
    pub(crate) struct MemoryFileOps {
        nodes: Mutex<BTreeMap<PathBuf, Node>>,
        denied: Mutex<HashSet<PathBuf>>,
    }

    impl MemoryFileOps {
        pub(crate) fn add_file(&self, path: impl Into<PathBuf>) {
            self.nodes.lock().insert(path.into(), Node::File);
        }

        pub(crate) fn deny(&self, path: impl Into<PathBuf>) {
            self.denied.lock().insert(path.into());
        }

        pub(crate) fn snapshot(&self) -> BTreeMap<PathBuf, Node> {
            self.nodes.lock().clone()
        }
    }

    impl FileOps for MemoryFileOps {
        fn exists(&self, path: &Path) -> bool {
            self.nodes.lock().contains_key(path)
        }

        fn apply(
            &self,
            source: &Path,
            target: &Path,
            operation: OperationKind,
            overwrite: bool,
        ) -> Result<(), CoreError> {
            if self.denied.lock().contains(target) {
                return Err(CoreError::filesystem(target, "permission denied"));
            }
            let mut nodes = self.nodes.lock();
            if !nodes.contains_key(source) {
                return Err(CoreError::filesystem(source, "source does not exist"));
            }
            if !overwrite && nodes.contains_key(target) {
                return Err(CoreError::filesystem(target, "target already exists"));
            }
            let node = match operation {
                OperationKind::Symlink => Node::Link(source.to_path_buf()),
                OperationKind::Copy => Node::File,
                OperationKind::Move => {
                    nodes.remove(source);
                    Node::File
                }
            };
            nodes.insert(target.to_path_buf(), node);
            Ok(())
        }

        fn backlink(&self, original: &Path, moved_to: &Path) -> Result<(), CoreError> {
            self.nodes
                .lock()
                .insert(original.to_path_buf(), Node::Link(moved_to.to_path_buf()));
            Ok(())
        }

        fn remove(&self, path: &Path) -> Result<(), CoreError> {
            self.nodes
                .lock()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| CoreError::filesystem(path, "not found"))
        }
    }

    fn entry(image: usize, source: &str, target: Option<&str>, role: PlacementRole) -> PlacementEntry {
        PlacementEntry {
            image: ImageId(image),
            source: PathBuf::from(source),
            target: target.map(PathBuf::from),
            role,
            group: 1,
            overwrite: false,
        }
    }

    fn sample_plan() -> PlacementPlan {
        PlacementPlan {
            entries: vec![
                entry(0, "/in/a.jpg", Some("/out/best/a.jpg"), PlacementRole::Best),
                entry(1, "/in/b.jpg", Some("/out/candidates/a_1x1/b.jpg"), PlacementRole::Candidate),
                entry(2, "/in/c.jpg", None, PlacementRole::Excluded),
                entry(0, "/in/a.jpg", Some("/out/best_collection/a.jpg"), PlacementRole::Collected),
            ],
            failures: Vec::new(),
        }
    }

    fn seeded() -> Arc<MemoryFileOps> {
        let fs = Arc::new(MemoryFileOps::default());
        for p in ["/in/a.jpg", "/in/b.jpg", "/in/c.jpg"] {
            fs.add_file(p);
        }
        fs
    }

    #[test]
    fn test_symlink_run() {
        let fs = seeded();
        let adapter = ExecutionAdapter::new(fs.clone());
        let report = adapter.execute(&sample_plan(), OperationKind::Symlink, false);
        assert_eq!(report.categories(), (3, 0, 1));
        assert_eq!(
            fs.snapshot().get(Path::new("/out/best/a.jpg")),
            Some(&Node::Link(PathBuf::from("/in/a.jpg")))
        );
        assert_eq!(
            fs.snapshot().get(Path::new("/out/best_collection/a.jpg")),
            Some(&Node::File)
        );
    }

    #[test]
    fn test_move_with_backlinks_collects_from_new_location() {
        let fs = seeded();
        let adapter = ExecutionAdapter::new(fs.clone()).with_backlinks(true);
        let report = adapter.execute(&sample_plan(), OperationKind::Move, false);
        assert_eq!(report.categories(), (3, 0, 1));
        assert_eq!(report.backlinks.len(), 2);
        assert_eq!(
            fs.snapshot().get(Path::new("/in/a.jpg")),
            Some(&Node::Link(PathBuf::from("/out/best/a.jpg")))
        );
        let collected = report
            .completed
            .iter()
            .find(|e| e.role == PlacementRole::Collected)
            .unwrap();
        assert_eq!(collected.source, PathBuf::from("/out/best/a.jpg"));
        assert_eq!(collected.operation, OperationKind::Copy);
    }

    #[test]
    fn test_best_operation_overrides_winner_only() {
        let fs = seeded();
        let adapter = ExecutionAdapter::new(fs.clone()).with_best_operation(Some(OperationKind::Copy));
        let report = adapter.execute(&sample_plan(), OperationKind::Move, false);
        assert_eq!(report.categories(), (3, 0, 1));

        let snapshot = fs.snapshot();
        // winner copied, so its source stays and the collection reads from it
        assert_eq!(snapshot.get(Path::new("/in/a.jpg")), Some(&Node::File));
        assert_eq!(snapshot.get(Path::new("/out/best/a.jpg")), Some(&Node::File));
        assert_eq!(snapshot.get(Path::new("/in/b.jpg")), None);
        let operations: Vec<(PlacementRole, OperationKind, &Path)> = report
            .completed
            .iter()
            .map(|e| (e.role, e.operation, e.source.as_path()))
            .collect();
        assert_eq!(
            operations,
            vec![
                (PlacementRole::Best, OperationKind::Copy, Path::new("/in/a.jpg")),
                (PlacementRole::Candidate, OperationKind::Move, Path::new("/in/b.jpg")),
                (PlacementRole::Collected, OperationKind::Copy, Path::new("/in/a.jpg")),
            ]
        );
    }

    #[test]
    fn test_dry_run_leaves_filesystem_untouched() {
        let fs = seeded();
        fs.add_file("/out/candidates/a_1x1/b.jpg");
        let before = fs.snapshot();
        let adapter = ExecutionAdapter::new(fs.clone());

        let dry = adapter.execute(&sample_plan(), OperationKind::Move, true);
        assert_eq!(fs.snapshot(), before);
        assert!(dry.dry_run);

        let real = adapter.execute(&sample_plan(), OperationKind::Move, false);
        assert_eq!(dry.categories(), real.categories());
        assert_eq!(real.categories(), (2, 1, 1));
    }

    #[test]
    fn test_failures_do_not_stop_other_entries() {
        let fs = seeded();
        fs.deny("/out/best/a.jpg");
        let adapter = ExecutionAdapter::new(fs.clone());
        let report = adapter.execute(&sample_plan(), OperationKind::Copy, false);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind(), "filesystem_error");
        assert_eq!(report.completed.len(), 2);
    }
}
