//! Output tree planning and collision-safe target naming.
//!
//! The planner never touches the filesystem beyond existence checks. Every
//! target in a returned plan has been claimed in the run's
//! [`CollisionResolutionState`], so no two entries share a target.

use crate::core::execute::FileOps;
use crate::core::image::{ImageId, RecordTable};
use crate::core::metrics::MetricProvider;
use crate::core::ranker::RankedGroup;
use crate::error::CoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

pub const BEST_DIR: &str = "best";
pub const CANDIDATES_DIR: &str = "candidates";

/// Placeholders accepted by the candidate group directory pattern.
pub const NAMING_PLACEHOLDERS: [&str; 4] = ["filename", "width", "height", "group"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionStrategy {
    /// Append more and more of the source's ancestor directories
    #[default]
    Hierarchical,
    /// Append a short content hash
    Hash,
    Numeric,
    /// Prefix with the immediate parent directory name
    ParentOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Input root name plus the source's directories below it
    #[default]
    Mirror,
    ParentOnly,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementRole {
    Best,
    Candidate,
    Collected,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub image: ImageId,
    pub source: PathBuf,
    /// `None` only for [`PlacementRole::Excluded`]
    pub target: Option<PathBuf>,
    pub role: PlacementRole,
    /// 1-based group number in placement order
    pub group: usize,
    /// Target holds a prior run's output that `force` allows replacing
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub entries: Vec<PlacementEntry>,
    pub failures: Vec<CoreError>,
}

impl PlacementPlan {
    pub fn targets(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().filter_map(|e| e.target.as_deref())
    }

    pub fn entries_for(&self, image: ImageId) -> impl Iterator<Item = &PlacementEntry> {
        self.entries.iter().filter(move |e| e.image == image)
    }

    pub fn count(&self, role: PlacementRole) -> usize {
        self.entries.iter().filter(|e| e.role == role).count()
    }
}

/// Result of a successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Vacant,
    /// Present on disk but written by a prior run, and `force` is set
    ReplacesPriorOutput,
}

#[derive(Debug, Default)]
struct ClaimState {
    claimed: HashSet<PathBuf>,
    prior_run: HashSet<PathBuf>,
    force: bool,
}

/// Run-scoped set of claimed targets. Check and insert happen under one lock.
#[derive(Debug, Default)]
pub struct CollisionResolutionState {
    inner: Mutex<ClaimState>,
}

impl CollisionResolutionState {
    pub fn new(force: bool, prior_run: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            inner: Mutex::new(ClaimState {
                claimed: HashSet::new(),
                prior_run: prior_run.into_iter().collect(),
                force,
            }),
        }
    }

    /// Claim `target` if nothing in this run holds it and nothing on disk
    /// blocks it.
    pub fn try_claim(&self, target: &Path, fs: &dyn FileOps) -> Option<Claim> {
        let mut inner = self.inner.lock();
        if inner.claimed.contains(target) {
            return None;
        }
        let claim = if fs.exists(target) {
            if inner.force && inner.prior_run.contains(target) {
                Claim::ReplacesPriorOutput
            } else {
                return None;
            }
        } else {
            Claim::Vacant
        };
        inner.claimed.insert(target.to_path_buf());
        Some(claim)
    }
}

#[derive(Debug, Clone)]
pub struct PlacementOptions {
    pub output_root: PathBuf,
    pub input_roots: Vec<PathBuf>,
    pub strategy: CollisionStrategy,
    pub layout: Layout,
    pub naming_pattern: String,
    pub retain_candidates: bool,
    pub collect_results: bool,
    pub collection_dir: PathBuf,
    pub include_singletons: bool,
    pub singletons_dir: Option<PathBuf>,
    pub max_path_length: Option<usize>,
    pub max_collision_attempts: u32,
}

impl PlacementOptions {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            input_roots: Vec::new(),
            strategy: CollisionStrategy::default(),
            layout: Layout::default(),
            naming_pattern: "{filename}_{width}x{height}".to_string(),
            retain_candidates: true,
            collect_results: false,
            collection_dir: PathBuf::from("best_collection"),
            include_singletons: true,
            singletons_dir: None,
            max_path_length: Some(250),
            max_collision_attempts: 10_000,
        }
    }
}

/// Collaborators the planner consults while naming targets.
pub struct PlacementContext<'a> {
    pub state: &'a CollisionResolutionState,
    pub fs: &'a dyn FileOps,
    /// Only `content_hash` is used
    pub provider: &'a dyn MetricProvider,
}

/// Substitute `{name}` placeholders. Unknown placeholders and unbalanced
/// braces are errors.
pub fn render_pattern(pattern: &str, value: impl Fn(&str) -> Option<String>) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find(['{', '}']) {
        if rest.as_bytes()[open] == b'}' {
            return Err(format!("unbalanced `}}` in `{pattern}`"));
        }
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unclosed `{{` in `{pattern}`"))?;
        let name = &after[..close];
        let rendered = value(name).ok_or_else(|| format!("unknown placeholder `{{{name}}}`"))?;
        out.push_str(&rendered);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// First 8 hex chars of the blake3 hash of `bytes`.
fn short_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex()[..8].to_string()
}

fn file_name_with(stem: &OsStr, prefix: Option<&OsStr>, suffix: Option<&OsStr>, ext: Option<&OsStr>) -> OsString {
    let mut name = OsString::new();
    if let Some(prefix) = prefix {
        name.push(prefix);
        name.push("_");
    }
    name.push(stem);
    if let Some(suffix) = suffix {
        name.push("_");
        name.push(suffix);
    }
    if let Some(ext) = ext {
        name.push(".");
        name.push(ext);
    }
    name
}

/// True when `name` is exactly one normal path component.
fn is_single_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

pub struct PlacementPlanner {
    options: PlacementOptions,
}

impl PlacementPlanner {
    pub fn new(options: PlacementOptions) -> Self {
        Self { options }
    }

    /// Input root containing `source`, longest match first.
    fn input_root_of(&self, source: &Path) -> Option<&Path> {
        self.options
            .input_roots
            .iter()
            .filter(|root| source.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
    }

    /// Directory names between the input root and the file, outermost first.
    fn relative_dirs(&self, source: &Path) -> Vec<OsString> {
        let parent = source.parent().unwrap_or(Path::new(""));
        let relative = self
            .input_root_of(source)
            .and_then(|root| parent.strip_prefix(root).ok())
            .unwrap_or(parent);
        relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_os_string()),
                _ => None,
            })
            .collect()
    }

    fn layout_dir(&self, source: &Path) -> PathBuf {
        match self.options.layout {
            Layout::Flat => PathBuf::new(),
            Layout::ParentOnly => source
                .parent()
                .and_then(Path::file_name)
                .map(PathBuf::from)
                .unwrap_or_default(),
            Layout::Mirror => {
                let root_name = self
                    .input_root_of(source)
                    .and_then(Path::file_name)
                    .map(PathBuf::from)
                    .unwrap_or_default();
                self.relative_dirs(source)
                    .into_iter()
                    .fold(root_name, |dir, name| dir.join(name))
            }
        }
    }

    /// Shorten over-long targets: cut the stem and append a hash of the full
    /// stem so distinct long names stay distinct.
    fn fit_length(&self, path: PathBuf) -> PathBuf {
        let Some(max) = self.options.max_path_length else {
            return path;
        };
        if path.as_os_str().len() <= max {
            return path;
        }
        let (Some(dir), Some(stem)) = (path.parent(), path.file_stem()) else {
            return path;
        };
        let stem = stem.to_string_lossy();
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
        let fixed = dir.as_os_str().len()
            + 1
            + ext.as_ref().map_or(0, |e| e.len() + 1)
            + 9;
        let keep = max.saturating_sub(fixed).max(1);
        let mut cut = keep.min(stem.len());
        while !stem.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut name = format!("{}_{}", &stem[..cut], short_hash(stem.as_bytes()));
        if let Some(ext) = ext {
            name.push('.');
            name.push_str(&ext);
        }
        log::debug!("Shortened long path {} -> {}", path.display(), name);
        dir.join(name)
    }

    /// Alternative file names the strategy tries before the numeric tail.
    fn strategy_names(&self, source: &Path, ctx: &PlacementContext<'_>) -> Vec<OsString> {
        let (Some(stem), ext) = (source.file_stem(), source.extension()) else {
            return Vec::new();
        };
        let hashed = || -> Option<OsString> {
            match ctx.provider.content_hash(source) {
                Ok(hash) => {
                    let short = hash.get(..8).unwrap_or(&hash).to_string();
                    Some(file_name_with(stem, None, Some(OsStr::new(&short)), ext))
                }
                Err(e) => {
                    log::debug!("No content hash for {}: {}", source.display(), e);
                    None
                }
            }
        };

        match self.options.strategy {
            CollisionStrategy::Numeric => Vec::new(),
            CollisionStrategy::Hash => hashed().into_iter().collect(),
            CollisionStrategy::ParentOnly => source
                .parent()
                .and_then(Path::file_name)
                .map(|parent| file_name_with(stem, Some(parent), None, ext))
                .into_iter()
                .collect(),
            CollisionStrategy::Hierarchical => {
                let dirs = self.relative_dirs(source);
                let mut names: Vec<OsString> = (1..=dirs.len())
                    .map(|depth| {
                        let mut suffix = OsString::new();
                        for (i, dir) in dirs[dirs.len() - depth..].iter().enumerate() {
                            if i > 0 {
                                suffix.push("_");
                            }
                            suffix.push(dir);
                        }
                        file_name_with(stem, None, Some(&suffix), ext)
                    })
                    .collect();
                names.extend(hashed());
                names
            }
        }
    }

    /// Claim `desired` or the first free alternative for it.
    fn resolve(
        &self,
        source: &Path,
        desired: PathBuf,
        ctx: &PlacementContext<'_>,
    ) -> Result<(PathBuf, Claim), CoreError> {
        let dir = desired.parent().map(Path::to_path_buf).unwrap_or_default();
        let desired = self.fit_length(desired);
        if let Some(claim) = ctx.state.try_claim(&desired, ctx.fs) {
            return Ok((desired, claim));
        }

        let try_name = |name: OsString| -> Option<(PathBuf, Claim)> {
            let candidate = self.fit_length(dir.join(name));
            let claim = ctx.state.try_claim(&candidate, ctx.fs)?;
            log::info!(
                "Filename collision: {} -> {}",
                desired.display(),
                candidate.display()
            );
            Some((candidate, claim))
        };

        for name in self.strategy_names(source, ctx) {
            if let Some(found) = try_name(name) {
                return Ok(found);
            }
        }

        let stem = desired.file_stem().unwrap_or_else(|| OsStr::new("image"));
        let ext = desired.extension();
        for n in 1..=self.options.max_collision_attempts {
            let counter = OsString::from(n.to_string());
            if let Some(found) = try_name(file_name_with(stem, None, Some(&counter), ext)) {
                return Ok(found);
            }
        }

        log::warn!(
            "Gave up placing {} after {} attempts",
            source.display(),
            self.options.max_collision_attempts
        );
        Err(CoreError::PlacementExhausted {
            path: source.to_path_buf(),
            target: desired,
            attempts: self.options.max_collision_attempts,
        })
    }

    fn place(
        &self,
        plan: &mut PlacementPlan,
        table: &RecordTable,
        image: ImageId,
        role: PlacementRole,
        group: usize,
        desired: PathBuf,
        ctx: &PlacementContext<'_>,
    ) -> bool {
        let source = table.path(image);
        match self.resolve(source, desired, ctx) {
            Ok((target, claim)) => {
                plan.entries.push(PlacementEntry {
                    image,
                    source: source.to_path_buf(),
                    target: Some(target),
                    role,
                    group,
                    overwrite: claim == Claim::ReplacesPriorOutput,
                });
                true
            }
            Err(e) => {
                plan.failures.push(e);
                false
            }
        }
    }

    fn exclude(&self, plan: &mut PlacementPlan, table: &RecordTable, image: ImageId, group: usize) {
        plan.entries.push(PlacementEntry {
            image,
            source: table.path(image).to_path_buf(),
            target: None,
            role: PlacementRole::Excluded,
            group,
            overwrite: false,
        });
    }

    /// Candidate directory for a group, unique within this plan.
    fn group_dir(
        &self,
        table: &RecordTable,
        winner: ImageId,
        group: usize,
        used: &mut BTreeSet<PathBuf>,
    ) -> PathBuf {
        let path = table.path(winner);
        let (width, height) = table.get(winner).dimensions();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rendered = render_pattern(&self.options.naming_pattern, |name| match name {
            "filename" => Some(stem.clone()),
            "width" => Some(width.to_string()),
            "height" => Some(height.to_string()),
            "group" => Some(group.to_string()),
            _ => None,
        })
        .unwrap_or_else(|_| stem.clone());
        let rendered = if is_single_name(&rendered) {
            rendered
        } else {
            log::warn!("Group directory {:?} is not a plain name; using group_{}", rendered, group);
            format!("group_{group}")
        };

        let base = self.options.output_root.join(CANDIDATES_DIR);
        let mut dir = base.join(&rendered);
        let mut n = 0;
        while used.contains(&dir) {
            n += 1;
            dir = base.join(format!("{rendered}_{n}"));
        }
        used.insert(dir.clone());
        dir
    }

    /// Build the plan. Groups are processed by winner path, and within a
    /// group in the order winner, candidates, collected entry.
    pub fn plan(
        &self,
        ranked: &[RankedGroup],
        table: &RecordTable,
        ctx: &PlacementContext<'_>,
    ) -> PlacementPlan {
        let mut ordered: Vec<&RankedGroup> = ranked
            .iter()
            .filter(|g| !g.order.is_empty() || !g.excluded.is_empty())
            .collect();
        ordered.sort_by(|a, b| {
            let key = |g: &RankedGroup| {
                g.winner()
                    .or_else(|| g.excluded.first().copied())
                    .map(|id| table.path(id).to_path_buf())
            };
            key(a).cmp(&key(b))
        });

        let out = &self.options.output_root;
        let mut plan = PlacementPlan::default();
        let mut used_group_dirs = BTreeSet::new();

        for (index, ranked) in ordered.into_iter().enumerate() {
            let group = index + 1;
            let Some(winner) = ranked.winner() else {
                for id in &ranked.excluded {
                    self.exclude(&mut plan, table, *id, group);
                }
                continue;
            };

            let singleton = ranked.is_singleton();
            if singleton && !self.options.include_singletons {
                self.exclude(&mut plan, table, winner, group);
                continue;
            }

            let source = table.path(winner);
            let Some(file_name) = source.file_name() else {
                plan.failures.push(CoreError::filesystem(source, "path has no file name"));
                continue;
            };
            let best_root = match (&self.options.singletons_dir, singleton) {
                (Some(dir), true) => out.join(dir),
                _ => out.join(BEST_DIR),
            };
            let desired = best_root.join(self.layout_dir(source)).join(file_name);
            let placed = self.place(&mut plan, table, winner, PlacementRole::Best, group, desired, ctx);

            if self.options.retain_candidates && !ranked.candidates().is_empty() {
                let dir = self.group_dir(table, winner, group, &mut used_group_dirs);
                for id in ranked.candidates() {
                    match table.path(*id).file_name() {
                        Some(name) => {
                            let desired = dir.join(name);
                            self.place(&mut plan, table, *id, PlacementRole::Candidate, group, desired, ctx);
                        }
                        None => plan
                            .failures
                            .push(CoreError::filesystem(table.path(*id), "path has no file name")),
                    }
                }
            } else {
                for id in ranked.candidates() {
                    self.exclude(&mut plan, table, *id, group);
                }
            }
            for id in &ranked.excluded {
                self.exclude(&mut plan, table, *id, group);
            }

            if self.options.collect_results && placed {
                let desired = out.join(&self.options.collection_dir).join(file_name);
                self.place(&mut plan, table, winner, PlacementRole::Collected, group, desired, ctx);
            }
        }

        log::info!(
            "Planned {} placements ({} best, {} candidates, {} collected, {} excluded, {} failed)",
            plan.entries.len(),
            plan.count(PlacementRole::Best),
            plan.count(PlacementRole::Candidate),
            plan.count(PlacementRole::Collected),
            plan.count(PlacementRole::Excluded),
            plan.failures.len()
        );
        plan
    }
}
