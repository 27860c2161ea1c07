use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use walkdir::{DirEntry, WalkDir};

pub const DEFAULT_EXTENSIONS: [&str; 10] = [
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "heic", "heif",
];

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Lowercase, without the dot
    pub extensions: Vec<String>,
    /// Directory names skipped wherever they appear
    pub exclude_dirs: Vec<String>,
    pub min_size: u64,
    pub follow_symlinks: bool,
    pub recursive: bool,
    /// Subtrees never entered, typically the output directory
    pub skip: Vec<PathBuf>,
    pub show_progress: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            exclude_dirs: Vec::new(),
            min_size: 0,
            follow_symlinks: false,
            recursive: true,
            skip: Vec::new(),
            show_progress: false,
        }
    }
}

pub struct DiscoveryService;

impl DiscoveryService {
    pub fn new() -> Self {
        Self
    }

    fn is_excluded_dir(entry: &DirEntry, options: &DiscoveryOptions) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        options.exclude_dirs.iter().any(|d| d == name.as_ref())
            || options.skip.iter().any(|s| entry.path().starts_with(s))
    }

    fn is_candidate(entry: &DirEntry, options: &DiscoveryOptions) -> bool {
        if !entry.file_type().is_file() {
            return false;
        }
        let matches_ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .is_some_and(|ext| options.extensions.iter().any(|x| *x == ext));
        if !matches_ext {
            return false;
        }
        match entry.metadata() {
            Ok(m) => m.len() >= options.min_size,
            Err(e) => {
                log::warn!("Skipping {}: {}", entry.path().display(), e);
                false
            }
        }
    }

    /// Walk every root and return absolute, sorted, deduplicated image paths.
    pub fn discover(&self, roots: &[PathBuf], options: &DiscoveryOptions) -> Result<Vec<PathBuf>> {
        let spinner = if options.show_progress {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
        spinner.set_message("Scanning for images…");
        spinner.enable_steady_tick(Duration::from_millis(100));

        let skip: Vec<PathBuf> = options
            .skip
            .iter()
            .map(|p| std::path::absolute(p).unwrap_or_else(|_| p.clone()))
            .collect();
        let options = DiscoveryOptions {
            skip,
            ..options.clone()
        };

        let mut found = BTreeSet::new();
        for root in roots {
            let root = std::path::absolute(root)
                .with_context(|| format!("Failed to resolve input directory {:?}", root))?;
            if !root.is_dir() {
                anyhow::bail!("Input directory {:?} does not exist", root);
            }
            let walker = WalkDir::new(&root)
                .follow_links(options.follow_symlinks)
                .max_depth(if options.recursive { usize::MAX } else { 1 })
                .into_iter()
                .filter_entry(|e| !Self::is_excluded_dir(e, &options));
            for entry in walker {
                match entry {
                    Ok(entry) if Self::is_candidate(&entry, &options) => {
                        found.insert(entry.into_path());
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Walk error: {}", e),
                }
                spinner.tick();
            }
        }

        spinner.finish_with_message(format!("Scan complete: {} images", found.len()));
        log::info!("Discovered {} images in {} roots", found.len(), roots.len());
        Ok(found.into_iter().collect())
    }
}

impl Default for DiscoveryService {
    fn default() -> Self {
        Self::new()
    }
}
