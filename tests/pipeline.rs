use bestpick::config::Config;
use bestpick::core::execute::OperationKind;
use bestpick::core::metrics::{ImageFacts, MetricName, MetricProvider};
use bestpick::core::placement::{CollisionStrategy, Layout, PlacementRole};
use bestpick::error::CoreError;
use bestpick::pipeline::{Pipeline, RunReport, StopHandle};
use bestpick::services::{
    DiscoveryOptions, DiscoveryService, HistoryRecord, HistoryService, LocalFileOps, RestoreSelection,
};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tempfile::TempDir;

#[derive(Clone)]
struct FakeImage {
    width: u32,
    height: u32,
    embedding: Vec<f32>,
}

/// Answers from a table instead of decoding pixels. `slow` hangs the
/// embedding of one image.
#[derive(Clone, Default)]
struct FakeProvider {
    images: HashMap<PathBuf, FakeImage>,
    slow: Option<(PathBuf, Duration)>,
}

impl FakeProvider {
    fn lookup(&self, path: &Path) -> Result<&FakeImage, CoreError> {
        self.images
            .get(path)
            .ok_or_else(|| CoreError::unsupported(path, "not in the fake table"))
    }
}

impl MetricProvider for FakeProvider {
    fn probe(&self, path: &Path) -> Result<ImageFacts, CoreError> {
        let image = self.lookup(path)?;
        Ok(ImageFacts {
            width: image.width,
            height: image.height,
            size_bytes: 1000,
            modified: UNIX_EPOCH + Duration::from_secs(1_000_000),
            created: None,
        })
    }

    fn measure(&self, _path: &Path, metrics: &[MetricName]) -> Result<Vec<f64>, CoreError> {
        Ok(vec![0.5; metrics.len()])
    }

    fn embedding(&self, path: &Path) -> Result<Vec<f32>, CoreError> {
        if let Some((slow, delay)) = &self.slow {
            if slow == path {
                std::thread::sleep(*delay);
            }
        }
        Ok(self.lookup(path)?.embedding.clone())
    }

    fn regions(&self, path: &Path, count: usize) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(vec![self.lookup(path)?.embedding.clone(); count])
    }

    fn content_hash(&self, path: &Path) -> Result<String, CoreError> {
        Ok(blake3::hash(path.as_os_str().as_encoded_bytes()).to_hex().to_string())
    }
}

const SUNSET: [f32; 3] = [1.0, 0.0, 0.0];
const CAT: [f32; 3] = [0.0, 1.0, 0.0];
const TREE: [f32; 3] = [0.0, 0.0, 1.0];

struct Fixture {
    dir: TempDir,
    provider: FakeProvider,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            provider: FakeProvider::default(),
        }
    }

    fn input(&self) -> PathBuf {
        self.dir.path().join("in")
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn add(&mut self, relative: &str, width: u32, height: u32, embedding: [f32; 3]) -> PathBuf {
        let path = self.input().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, relative.as_bytes()).unwrap();
        self.provider.images.insert(
            path.clone(),
            FakeImage {
                width,
                height,
                embedding: embedding.to_vec(),
            },
        );
        path
    }

    fn pipeline(&self, config: Config) -> Pipeline {
        config.validate().unwrap();
        Pipeline::new(
            config,
            Arc::new(self.provider.clone()),
            Arc::new(LocalFileOps::new()),
        )
    }

    fn run(&self, config: Config) -> RunReport {
        let options = DiscoveryOptions {
            skip: vec![self.output()],
            ..Default::default()
        };
        let paths = DiscoveryService::new()
            .discover(&[self.input()], &options)
            .unwrap();
        self.pipeline(config).run(&[self.input()], paths, &self.output())
    }
}

fn copy_config() -> Config {
    Config {
        operation: OperationKind::Copy,
        ..Default::default()
    }
}

fn target_of(report: &RunReport, source: &Path, role: PlacementRole) -> PathBuf {
    report
        .plan
        .entries
        .iter()
        .find(|e| e.source == source && e.role == role)
        .and_then(|e| e.target.clone())
        .unwrap()
}

#[test]
fn test_highest_resolution_wins() {
    let mut fx = Fixture::new();
    let a = fx.add("a.jpg", 1920, 1080, SUNSET);
    let b = fx.add("b.jpg", 3840, 2160, SUNSET);
    let c = fx.add("c.jpg", 1920, 1080, SUNSET);
    let config = Config {
        primary_metrics: vec![MetricName::Resolution],
        ..copy_config()
    };

    let report = fx.run(config);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].winner.as_ref(), Some(&b));
    assert_eq!(report.groups[0].candidates, vec![a.clone(), c.clone()]);

    let best = fx.output().join("best/in/b.jpg");
    assert_eq!(target_of(&report, &b, PlacementRole::Best), best);
    assert_eq!(fs::read(&best).unwrap(), b"b.jpg");
    let candidates = fx.output().join("candidates/b_3840x2160");
    assert!(candidates.join("a.jpg").is_file());
    assert!(candidates.join("c.jpg").is_file());

    let execution = report.execution.unwrap();
    assert_eq!(execution.categories(), (3, 0, 0));
    assert!(report.image_failures.is_empty());
}

#[test]
fn test_identical_metrics_fall_back_to_path_order() {
    let mut fx = Fixture::new();
    let y = fx.add("y.jpg", 800, 600, CAT);
    let x = fx.add("x.jpg", 800, 600, CAT);

    let first = fx.run(Config {
        dry_run: true,
        ..copy_config()
    });
    let second = fx.run(Config {
        dry_run: true,
        ..copy_config()
    });
    assert_eq!(first.groups[0].winner.as_ref(), Some(&x));
    assert_eq!(first.groups[0].candidates, vec![y]);
    assert_eq!(first.plan, second.plan);
    assert_eq!(first.groups, second.groups);
}

#[test]
fn test_numeric_strategy_renames_around_foreign_file() {
    let mut fx = Fixture::new();
    let cat = fx.add("cat.jpg", 640, 480, CAT);
    let foreign = fx.output().join("best/in/cat.jpg");
    fs::create_dir_all(foreign.parent().unwrap()).unwrap();
    fs::write(&foreign, b"not ours").unwrap();

    let report = fx.run(Config {
        collision_strategy: CollisionStrategy::Numeric,
        ..copy_config()
    });
    assert_eq!(
        target_of(&report, &cat, PlacementRole::Best),
        fx.output().join("best/in/cat_1.jpg")
    );
    assert_eq!(fs::read(&foreign).unwrap(), b"not ours");
    assert_eq!(fs::read(fx.output().join("best/in/cat_1.jpg")).unwrap(), b"cat.jpg");
}

#[test]
fn test_hanging_embedding_times_out() {
    let mut fx = Fixture::new();
    let a = fx.add("a.jpg", 1920, 1080, SUNSET);
    let b = fx.add("b.jpg", 1280, 720, SUNSET);
    let slow = fx.add("slow.jpg", 3840, 2160, SUNSET);
    fx.provider.slow = Some((slow.clone(), Duration::from_secs(5)));

    let started = Instant::now();
    let report = fx.run(Config {
        metric_timeout_ms: 100,
        ..copy_config()
    });
    assert!(started.elapsed() < Duration::from_secs(4));

    assert_eq!(report.image_failures.len(), 1);
    assert_eq!(report.image_failures[0].kind(), "metric_unavailable");
    assert_eq!(report.image_failures[0].path(), &slow);

    let pair = report
        .groups
        .iter()
        .find(|g| g.winner.as_ref() == Some(&a))
        .unwrap();
    assert_eq!(pair.candidates, vec![b]);
    assert!(fx.output().join("best/in/a.jpg").is_file());
    // still ranked on its own and placed
    assert!(fx.output().join("best/in/slow.jpg").is_file());
}

#[test]
fn test_groups_partition_the_input() {
    let mut fx = Fixture::new();
    let mut all = BTreeSet::new();
    for (name, embedding) in [
        ("a/1.jpg", SUNSET),
        ("a/2.jpg", CAT),
        ("b/3.jpg", SUNSET),
        ("b/4.jpg", TREE),
        ("c/5.jpg", CAT),
    ] {
        all.insert(fx.add(name, 1024, 768, embedding));
    }

    let report = fx.run(Config {
        dry_run: true,
        ..copy_config()
    });
    let mut seen = BTreeSet::new();
    for group in &report.groups {
        let members = group
            .winner
            .iter()
            .chain(&group.candidates)
            .chain(&group.excluded);
        for path in members {
            assert!(seen.insert(path.clone()), "{} is in two groups", path.display());
        }
    }
    assert_eq!(seen, all);
    assert_eq!(report.groups.len(), 3);
}

#[test]
fn test_same_file_names_never_share_a_target() {
    let mut fx = Fixture::new();
    fx.add("trip/day1/cat.jpg", 640, 480, CAT);
    fx.add("trip/day2/cat.jpg", 640, 480, TREE);
    fx.add("home/cat.jpg", 640, 480, SUNSET);

    let report = fx.run(Config {
        layout: Layout::Flat,
        ..copy_config()
    });
    let targets: Vec<&Path> = report.plan.targets().collect();
    let unique: BTreeSet<&Path> = targets.iter().copied().collect();
    assert_eq!(targets.len(), 3);
    assert_eq!(unique.len(), 3);
    for target in targets {
        assert!(target.starts_with(fx.output().join("best")));
        assert!(target.is_file());
    }
}

#[test]
fn test_dry_run_then_real_run_agree() {
    let mut fx = Fixture::new();
    fx.add("a.jpg", 1920, 1080, SUNSET);
    fx.add("b.jpg", 3840, 2160, SUNSET);
    fx.add("c.jpg", 500, 500, TREE);

    let dry = fx.run(Config {
        dry_run: true,
        ..copy_config()
    });
    assert!(!fx.output().exists());
    let real = fx.run(copy_config());

    let dry_exec = dry.execution.unwrap();
    let real_exec = real.execution.unwrap();
    assert!(dry_exec.dry_run);
    assert_eq!(dry_exec.categories(), real_exec.categories());
    assert_eq!(dry.plan, real.plan);
}

#[test]
fn test_stopped_run_places_nothing() {
    let mut fx = Fixture::new();
    fx.add("a.jpg", 100, 100, SUNSET);
    let stop = StopHandle::new();
    stop.stop();

    let paths = vec![fx.input().join("a.jpg")];
    let report = fx
        .pipeline(copy_config())
        .with_stop_handle(stop)
        .run(&[fx.input()], paths, &fx.output());
    assert!(report.cancelled);
    assert!(report.execution.is_none());
    assert!(!fx.output().exists());
}

#[cfg(unix)]
#[test]
fn test_move_with_backlinks_and_restore() {
    let mut fx = Fixture::new();
    let a = fx.add("a.jpg", 1920, 1080, SUNSET);
    let b = fx.add("b.jpg", 3840, 2160, SUNSET);
    let config = Config {
        operation: OperationKind::Move,
        create_backlinks: true,
        ..Default::default()
    };

    let report = fx.run(config);
    let execution = report.execution.unwrap();
    assert_eq!(execution.backlinks.len(), 2);
    for source in [&a, &b] {
        assert!(fs::symlink_metadata(source).unwrap().file_type().is_symlink());
    }
    assert_eq!(fs::read(&b).unwrap(), b"b.jpg");

    let history = HistoryService::new(&fx.output());
    history
        .append(&HistoryRecord::from_report(&execution, OperationKind::Move))
        .unwrap();
    let summary = history.restore(RestoreSelection::Latest).unwrap();
    assert_eq!(summary.restored, 2);
    for source in [&a, &b] {
        assert!(fs::symlink_metadata(source).unwrap().file_type().is_file());
    }
    assert!(!fx.output().join("best/in/b.jpg").exists());
}
