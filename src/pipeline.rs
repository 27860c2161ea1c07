//! Runs one curation pass: evaluate, group, rank, plan, execute.

use crate::config::Config;
use crate::core::execute::{ExecutionAdapter, ExecutionReport, FileOps};
use crate::core::grouper::Grouper;
use crate::core::image::{ImageRecord, RecordTable};
use crate::core::metrics::{MetricEvaluator, MetricProvider};
use crate::core::placement::{
    CollisionResolutionState, PlacementContext, PlacementPlan, PlacementPlanner,
};
use crate::core::ranker::{Decision, RankedGroup};
use crate::core::similarity::SimilarityMethod;
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag shared with whoever may stop the run.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run `f` on its own thread and give up after `timeout`. A computation that
/// is abandoned keeps running detached; its result is dropped.
pub fn with_timeout<T: Send + 'static>(
    timeout: Option<Duration>,
    path: &Path,
    what: &str,
    f: impl FnOnce() -> Result<T, CoreError> + Send + 'static,
) -> Result<T, CoreError> {
    let Some(timeout) = timeout else {
        return f();
    };
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("bestpick-{what}"))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| CoreError::metric_unavailable(path, format!("could not start {what}: {e}")))?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(CoreError::metric_unavailable(
            path,
            format!("{what} timed out after {} ms", timeout.as_millis()),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(CoreError::metric_unavailable(
            path,
            format!("{what} panicked"),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub winner: Option<PathBuf>,
    pub candidates: Vec<PathBuf>,
    pub excluded: Vec<PathBuf>,
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEdge {
    pub a: PathBuf,
    pub b: PathBuf,
    pub score: f64,
    pub method: SimilarityMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub total_images: usize,
    /// Images with a quality vector
    pub evaluated: usize,
    pub groups: Vec<GroupSummary>,
    pub edges: Vec<ReportEdge>,
    pub image_failures: Vec<CoreError>,
    pub plan: PlacementPlan,
    pub execution: Option<ExecutionReport>,
}

impl RunReport {
    fn empty(started_at: DateTime<Utc>, dry_run: bool, total_images: usize) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            dry_run,
            cancelled: false,
            total_images,
            evaluated: 0,
            groups: Vec::new(),
            edges: Vec::new(),
            image_failures: Vec::new(),
            plan: PlacementPlan::default(),
            execution: None,
        }
    }

    pub fn duplicate_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.candidates.len() + g.excluded.len() + usize::from(g.winner.is_some()) > 1)
            .count()
    }

    /// Failures from every stage, counted by kind.
    pub fn failures_by_kind(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        let placement = self.plan.failures.iter();
        let execution = self.execution.iter().flat_map(|e| e.failed.iter());
        for err in self.image_failures.iter().chain(placement).chain(execution) {
            *counts.entry(err.kind()).or_insert(0) += 1;
        }
        counts
    }
}

pub struct Pipeline {
    config: Config,
    evaluator: Arc<MetricEvaluator>,
    provider: Arc<dyn MetricProvider>,
    fs: Arc<dyn FileOps>,
    stop: StopHandle,
    prior_targets: Vec<PathBuf>,
    show_progress: bool,
}

impl Pipeline {
    /// `config` is expected to be validated already.
    pub fn new(config: Config, provider: Arc<dyn MetricProvider>, fs: Arc<dyn FileOps>) -> Self {
        Self {
            evaluator: Arc::new(config.evaluator()),
            config,
            provider,
            fs,
            stop: StopHandle::new(),
            prior_targets: Vec::new(),
            show_progress: false,
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Outputs of earlier runs that `force` may replace.
    pub fn with_prior_targets(mut self, targets: Vec<PathBuf>) -> Self {
        self.prior_targets = targets;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress_bar(&self, len: usize, message: &'static str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_message(message);
        bar
    }

    /// Fill every derived cell of one record. Each computation gets its own
    /// timeout; a failure is memoized like a success.
    fn evaluate_image(&self, record: &ImageRecord) {
        let timeout = self.config.metric_timeout();
        let path = record.path.clone();

        let facts = record.facts_or_init(|| {
            let (provider, p) = (self.provider.clone(), path.clone());
            with_timeout(timeout, &path, "probe", move || provider.probe(&p))
        });
        let facts = match facts {
            Ok(facts) => facts.clone(),
            Err(e) => {
                log::warn!("{}", e);
                return;
            }
        };

        let quality = record.quality_or_init(|| {
            let (provider, evaluator, p) = (self.provider.clone(), self.evaluator.clone(), path.clone());
            with_timeout(timeout, &path, "metrics", move || {
                evaluator.evaluate(provider.as_ref(), &p, &facts)
            })
        });
        if let Err(e) = quality {
            log::warn!("{}", e);
        }

        let embedding = record.embedding_or_init(|| {
            let (provider, p) = (self.provider.clone(), path.clone());
            with_timeout(timeout, &path, "embedding", move || provider.embedding(&p))
        });
        if let Err(e) = embedding {
            log::warn!("{}", e);
            return;
        }

        let count = self.config.region_count;
        if count > 0 {
            let regions = record.regions_or_init(|| {
                let (provider, p) = (self.provider.clone(), path.clone());
                with_timeout(timeout, &path, "regions", move || provider.regions(&p, count))
            });
            if let Err(e) = regions {
                log::warn!("{}", e);
            }
        }
    }

    /// Evaluate in batches; returns false if the run was stopped.
    fn evaluate_all(&self, table: &RecordTable) -> bool {
        let bar = self.progress_bar(table.len(), "Evaluating");
        for batch in table.records().chunks(self.config.batch_size.max(1)) {
            if self.stop.is_stopped() {
                bar.abandon_with_message("Stopped");
                return false;
            }
            batch.par_iter().for_each(|record| {
                if self.stop.is_stopped() {
                    return;
                }
                self.evaluate_image(record);
                bar.inc(1);
            });
        }
        bar.finish_with_message("Evaluated");
        !self.stop.is_stopped()
    }

    fn summarize(ranked: &[RankedGroup], table: &RecordTable) -> Vec<GroupSummary> {
        let paths = |ids: &[crate::core::image::ImageId]| -> Vec<PathBuf> {
            ids.iter().map(|id| table.path(*id).to_path_buf()).collect()
        };
        ranked
            .iter()
            .map(|g| GroupSummary {
                winner: g.winner().map(|id| table.path(id).to_path_buf()),
                candidates: paths(g.candidates()),
                excluded: paths(&g.excluded),
                decision: g.decision,
            })
            .collect()
    }

    /// Run the whole pass over `paths`. Never fails: per-image and
    /// per-entry problems are collected in the report.
    pub fn run(&self, input_roots: &[PathBuf], paths: Vec<PathBuf>, output_root: &Path) -> RunReport {
        let started_at = Utc::now();
        let dry_run = self.config.dry_run;
        let table = RecordTable::new(paths);
        let mut report = RunReport::empty(started_at, dry_run, table.len());
        log::info!("Evaluating {} images", table.len());

        let finished = self.evaluate_all(&table);
        report.evaluated = table.records().iter().filter(|r| r.quality().is_some()).count();
        report.image_failures = table.records().iter().flat_map(|r| r.failures()).collect();
        if !finished {
            log::warn!("Run stopped during evaluation; nothing was placed");
            report.cancelled = true;
            report.finished_at = Utc::now();
            return report;
        }

        let descriptors: Vec<_> = table.records().iter().map(|r| (r.id, r.descriptor())).collect();
        let grouper = Grouper::new(
            self.config.similarity_engine(),
            self.config.threshold(),
            self.config.prefilter_min_images,
        );
        let grouping = grouper.group(&descriptors);
        log::info!(
            "Found {} groups from {} similarity edges",
            grouping.groups.len(),
            grouping.edges.len()
        );
        report.edges = grouping
            .edges
            .iter()
            .map(|e| ReportEdge {
                a: table.path(e.a).to_path_buf(),
                b: table.path(e.b).to_path_buf(),
                score: e.score,
                method: e.method,
            })
            .collect();

        let ranked = self.config.ranker().rank_all(&grouping.groups, &table);
        report.groups = Self::summarize(&ranked, &table);
        if self.stop.is_stopped() {
            report.cancelled = true;
            report.finished_at = Utc::now();
            return report;
        }

        let state = CollisionResolutionState::new(self.config.force, self.prior_targets.iter().cloned());
        let ctx = PlacementContext {
            state: &state,
            fs: self.fs.as_ref(),
            provider: self.provider.as_ref(),
        };
        let planner = PlacementPlanner::new(self.config.placement_options(output_root, input_roots));
        report.plan = planner.plan(&ranked, &table, &ctx);
        for failure in &report.plan.failures {
            log::warn!("{}", failure);
        }

        let adapter = ExecutionAdapter::new(self.fs.clone())
            .with_best_operation(self.config.best_operation)
            .with_collection_operation(self.config.collection_operation)
            .with_backlinks(self.config.create_backlinks);
        report.execution = Some(adapter.execute(&report.plan, self.config.operation, dry_run));
        report.finished_at = Utc::now();
        report
    }
}
