//! File discovery and the producer that feeds the job queue

use mba_common::Fingerprint;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::queue::JobQueue;
use super::types::{Category, Job, Scope};
use crate::error::{IngestError, IngestResult};

/// Parse a comma separated extension list into normalized `.ext` form
///
/// `"pdf, .CSV"` becomes `{".csv", ".pdf"}`.
pub fn parse_extensions(input: &str) -> BTreeSet<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty() && *e != ".")
        .map(|e| format!(".{}", e.trim_start_matches('.').to_ascii_lowercase()))
        .collect()
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
}

/// Include/exclude filter over normalized extensions
#[derive(Debug, Clone, Default)]
pub struct ExtensionFilter {
    include: Option<BTreeSet<String>>,
    exclude: BTreeSet<String>,
}

impl ExtensionFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Self {
        Self {
            include: include.map(parse_extensions).filter(|set| !set.is_empty()),
            exclude: exclude.map(parse_extensions).unwrap_or_default(),
        }
    }

    /// Files without an extension are never accepted
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(ext) = extension_of(path) else {
            return false;
        };
        if let Some(include) = &self.include {
            if !include.contains(&ext) {
                return false;
            }
        }
        !self.exclude.contains(&ext)
    }
}

/// Known scopes plus the fallback used when none matches
#[derive(Debug, Clone)]
pub struct ScopeRules {
    known: Vec<Scope>,
    default: Scope,
}

impl ScopeRules {
    pub fn new(known: Vec<Scope>, default: Scope) -> Self {
        Self { known, default }
    }

    pub fn default_scope(&self) -> &Scope {
        &self.default
    }

    fn match_segment(&self, segment: &str) -> Option<&Scope> {
        self.known
            .iter()
            .find(|scope| scope.as_str().eq_ignore_ascii_case(segment))
    }

    /// Hint, then the first directory below `root` naming a known scope, then an
    /// ancestor of `root`, then the default.
    pub fn resolve(&self, root: &Path, path: &Path, hint: Option<&Scope>) -> Scope {
        if let Some(hint) = hint {
            return hint.clone();
        }

        let below_root = path
            .strip_prefix(root)
            .ok()
            .and_then(|relative| relative.parent())
            .into_iter()
            .flat_map(|dir| dir.components())
            .filter_map(|c| c.as_os_str().to_str());

        let above_root = root
            .ancestors()
            .filter_map(|dir| dir.file_name())
            .filter_map(|name| name.to_str());

        below_root
            .chain(above_root)
            .find_map(|segment| self.match_segment(segment))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Walk `root` and build one job per accepted file, ordered by file name
pub fn discover(
    root: &Path,
    filter: &ExtensionFilter,
    scopes: &ScopeRules,
    hint: Option<&Scope>,
) -> IngestResult<Vec<Job>> {
    if !root.is_dir() {
        return Err(IngestError::Discovery(format!(
            "input directory {} does not exist or is not a directory",
            root.display()
        )));
    }

    let mut jobs = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable directory entry");
                continue;
            },
        };
        if !entry.file_type().is_file() || !filter.accepts(entry.path()) {
            continue;
        }

        let Some(file_name) = entry.file_name().to_str() else {
            warn!(path = %entry.path().display(), "Skipping file with non UTF-8 name");
            continue;
        };

        let path = entry.path().to_path_buf();
        let scope = scopes.resolve(root, &path, hint);
        let category = Category::from_path(&path);
        let job = Job::new(absolute(&path), scope, category, file_name);
        debug!(path = %path.display(), key = %job.destination_key, "Discovered file");
        jobs.push(job);
    }

    info!(root = %root.display(), count = jobs.len(), "Discovery complete");
    Ok(jobs)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub discovered: usize,
    pub enqueued: usize,
}

/// Discovers files under a root and enqueues them in order
#[derive(Debug, Clone)]
pub struct Producer {
    root: PathBuf,
    filter: ExtensionFilter,
    scopes: ScopeRules,
    hint: Option<Scope>,
    eager: bool,
}

impl Producer {
    pub fn new(root: impl Into<PathBuf>, filter: ExtensionFilter, scopes: ScopeRules) -> Self {
        Self {
            root: root.into(),
            filter,
            scopes,
            hint: None,
            eager: false,
        }
    }

    pub fn with_scope_hint(mut self, hint: Option<Scope>) -> Self {
        self.hint = hint;
        self
    }

    /// Fingerprint while discovering instead of leaving it to the workers
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn discover(&self) -> IngestResult<Vec<Job>> {
        discover(&self.root, &self.filter, &self.scopes, self.hint.as_ref())
    }

    /// Enqueue every discovered job; stops quietly once the queue is closed
    pub async fn run(&self, queue: &JobQueue) -> IngestResult<ProducerReport> {
        let jobs = self.discover()?;
        let mut report = ProducerReport {
            discovered: jobs.len(),
            enqueued: 0,
        };

        for mut job in jobs {
            if self.eager {
                job.fingerprint = fingerprint_blocking(job.source_path.clone()).await;
            }
            match queue.enqueue(job) {
                Ok(()) => report.enqueued += 1,
                Err(IngestError::QueueClosed) => {
                    info!(
                        enqueued = report.enqueued,
                        remaining = report.discovered - report.enqueued,
                        "Queue closed, producer stopping"
                    );
                    break;
                },
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }
}

/// Hash on the blocking pool. Failures are left for the worker to report.
async fn fingerprint_blocking(path: PathBuf) -> Option<Fingerprint> {
    match tokio::task::spawn_blocking(move || Fingerprint::from_file(&path)).await {
        Ok(Ok(fingerprint)) => Some(fingerprint),
        Ok(Err(err)) => {
            debug!(error = %err, "Eager fingerprint failed, deferring to worker");
            None
        },
        Err(err) => {
            warn!(error = %err, "Fingerprint task failed");
            None
        },
    }
}
