//! Content-addressed duplicate index with a persisted JSON cache
//!
//! The cache maps a fingerprint to the local paths and remote keys known to hold
//! that content. It is only a hint: with remote checking enabled, a cached key
//! counts as a duplicate only after the store confirms it exists with the same
//! size. All mutations go through one async mutex and flushing replaces the file
//! atomically (temporary file, then rename).

use chrono::{DateTime, Local, Utc};
use mba_common::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::types::Scope;
use crate::error::{IngestError, IngestResult};
use crate::storage::{KeyListing, ObjectInfo, ObjectStore, RetryPolicy};

/// Number of recorded decisions between automatic flushes
pub const DEFAULT_FLUSH_EVERY: usize = 25;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: u64,
    #[serde(default)]
    pub local: BTreeSet<PathBuf>,
    #[serde(default)]
    pub remote: BTreeSet<String>,
}

/// Size and modification time of a hashed file, so rescans can skip rehashing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileStamp {
    fingerprint: Fingerprint,
    size: u64,
    modified_ns: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    entries: BTreeMap<Fingerprint, CacheEntry>,
    #[serde(default)]
    files: BTreeMap<PathBuf, FileStamp>,
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CacheState {
    data: CacheFile,
    unflushed: usize,
}

/// Result of a duplicate check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateCheck {
    pub duplicate: bool,
    pub known_location: Option<String>,
}

impl DuplicateCheck {
    fn found(location: impl Into<String>) -> Self {
        Self {
            duplicate: true,
            known_location: Some(location.into()),
        }
    }

    fn unique() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
pub struct DuplicateIndex {
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
    fingerprint_locks: StdMutex<HashMap<Fingerprint, Weak<Mutex<()>>>>,
}

impl DuplicateIndex {
    /// Cache that is never written to disk
    pub fn in_memory() -> Self {
        Self::with_state(None, CacheFile::default())
    }

    fn with_state(path: Option<PathBuf>, data: CacheFile) -> Self {
        Self {
            path,
            state: Mutex::new(CacheState { data, unflushed: 0 }),
            fingerprint_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Load the cache file. A missing file starts empty; a corrupt one is
    /// reported, discarded and replaced on the next flush.
    pub async fn open(path: impl Into<PathBuf>) -> IngestResult<Self> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(data) => data,
                Err(err) => {
                    let err = IngestError::CacheCorruption(format!("{}: {}", path.display(), err));
                    warn!(error = %err, "Starting with an empty duplicate cache");
                    CacheFile::default()
                },
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CacheFile::default(),
            Err(err) => return Err(IngestError::io(&path, err)),
        };

        info!(
            path = %path.display(),
            entries = data.entries.len(),
            "Duplicate cache loaded"
        );
        Ok(Self::with_state(Some(path), data))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.data.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.state.lock().await.data.entries.get(fingerprint).cloned()
    }

    /// Serialize work on one fingerprint so identical files in the same run are
    /// decided one after the other.
    pub async fn lock_fingerprint(&self, fingerprint: &Fingerprint) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .fingerprint_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(fingerprint).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(fingerprint.clone(), Arc::downgrade(&lock));
                    lock
                },
            }
        };
        lock.lock_owned().await
    }

    /// Decide whether `fingerprint` is already stored under `scope`.
    ///
    /// With `remote_check` off, a cached remote key is trusted as is. With it on,
    /// cached keys are confirmed against the store (stale ones are dropped) and,
    /// failing that, the job's own `candidate_key` is checked.
    #[instrument(skip(self, store, fingerprint), fields(fingerprint = %fingerprint))]
    pub async fn check<S>(
        &self,
        fingerprint: &Fingerprint,
        scope: &Scope,
        size: u64,
        candidate_key: &str,
        store: &S,
        remote_check: bool,
    ) -> IngestResult<DuplicateCheck>
    where
        S: ObjectStore + ?Sized,
    {
        let prefix = scope.prefix();
        let cached: Vec<String> = self
            .lookup(fingerprint)
            .await
            .map(|entry| {
                entry
                    .remote
                    .into_iter()
                    .filter(|key| key.starts_with(&prefix))
                    .collect()
            })
            .unwrap_or_default();

        if !remote_check {
            return Ok(match cached.into_iter().next() {
                Some(key) => DuplicateCheck::found(key),
                None => DuplicateCheck::unique(),
            });
        }

        for key in cached {
            let (exists, remote_size, _) = store.exists(&key).await?;
            if exists && remote_size == size {
                debug!(key, "Cached location confirmed");
                return Ok(DuplicateCheck::found(key));
            }
            debug!(key, exists, remote_size, "Dropping stale cached location");
            self.forget_remote(fingerprint, &key).await;
        }

        let (exists, remote_size, _) = store.exists(candidate_key).await?;
        if exists && remote_size == size {
            self.record_remote(fingerprint, candidate_key, size).await?;
            return Ok(DuplicateCheck::found(candidate_key));
        }

        Ok(DuplicateCheck::unique())
    }

    pub async fn record_local(
        &self,
        fingerprint: &Fingerprint,
        path: &Path,
        size: u64,
    ) -> IngestResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.data.entries.entry(fingerprint.clone()).or_default();
        entry.size = size;
        entry.local.insert(path.to_path_buf());
        self.after_write(&mut state).await
    }

    pub async fn record_remote(
        &self,
        fingerprint: &Fingerprint,
        key: &str,
        size: u64,
    ) -> IngestResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.data.entries.entry(fingerprint.clone()).or_default();
        entry.size = size;
        entry.remote.insert(key.to_string());
        self.after_write(&mut state).await
    }

    async fn forget_remote(&self, fingerprint: &Fingerprint, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.data.entries.get_mut(fingerprint) {
            entry.remote.remove(key);
            state.unflushed += 1;
        }
    }

    async fn after_write(&self, state: &mut CacheState) -> IngestResult<()> {
        state.unflushed += 1;
        if state.unflushed >= DEFAULT_FLUSH_EVERY {
            self.write_locked(state).await?;
        }
        Ok(())
    }

    /// Persist pending changes
    pub async fn flush(&self) -> IngestResult<()> {
        let mut state = self.state.lock().await;
        self.write_locked(&mut state).await
    }

    async fn write_locked(&self, state: &mut CacheState) -> IngestResult<()> {
        let Some(path) = &self.path else {
            state.unflushed = 0;
            return Ok(());
        };

        state.data.updated = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&state.data)
            .map_err(|e| IngestError::CacheCorruption(format!("cannot serialize cache: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IngestError::io(parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| IngestError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| IngestError::io(path, e))?;

        debug!(path = %path.display(), writes = state.unflushed, "Duplicate cache flushed");
        state.unflushed = 0;
        Ok(())
    }

    /// Group every file under `root` by content, reusing cached fingerprints for
    /// files whose size and modification time are unchanged.
    #[instrument(skip(self, root), fields(root = %root.display()))]
    pub async fn scan_directory(&self, root: &Path) -> IngestResult<ScanResult> {
        if !root.is_dir() {
            return Err(IngestError::Discovery(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut result = ScanResult::default();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) if entry.file_type().is_file() => entry,
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable entry");
                    continue;
                },
            };

            let path = std::path::absolute(entry.path()).unwrap_or_else(|_| entry.path().to_path_buf());
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Cannot stat file");
                    continue;
                },
            };
            let size = metadata.len();
            let modified_ns = metadata.modified().map(system_time_ns).unwrap_or(0);

            let fingerprint = match self.cached_stamp(&path, size, modified_ns).await {
                Some(fingerprint) => {
                    result.cache_hits += 1;
                    fingerprint
                },
                None => {
                    let hash_path = path.clone();
                    let hashed = tokio::task::spawn_blocking(move || Fingerprint::from_file(&hash_path))
                        .await
                        .map_err(|e| IngestError::Discovery(format!("hash task failed: {e}")))?;
                    match hashed {
                        Ok(fingerprint) => fingerprint,
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "Cannot hash file");
                            continue;
                        },
                    }
                },
            };

            self.record_stamp(&path, &fingerprint, size, modified_ns).await;
            self.record_local(&fingerprint, &path, size).await?;
            result.files_scanned += 1;
            result.groups.entry(fingerprint).or_default().push(path);
        }
        self.flush().await?;

        let duplicate_groups = result.duplicates().count();
        if duplicate_groups > 0 {
            warn!(groups = duplicate_groups, "Duplicate files found");
        }
        Ok(result)
    }

    async fn cached_stamp(&self, path: &Path, size: u64, modified_ns: u64) -> Option<Fingerprint> {
        let state = self.state.lock().await;
        state
            .data
            .files
            .get(path)
            .filter(|stamp| stamp.size == size && stamp.modified_ns == modified_ns)
            .map(|stamp| stamp.fingerprint.clone())
    }

    async fn record_stamp(&self, path: &Path, fingerprint: &Fingerprint, size: u64, modified_ns: u64) {
        let mut state = self.state.lock().await;
        state.data.files.insert(
            path.to_path_buf(),
            FileStamp {
                fingerprint: fingerprint.clone(),
                size,
                modified_ns,
            },
        );
    }
}

fn system_time_ns(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub files_scanned: usize,
    /// Files whose fingerprint came from the cache
    pub cache_hits: usize,
    pub groups: BTreeMap<Fingerprint, Vec<PathBuf>>,
}

impl ScanResult {
    /// Groups holding more than one file
    pub fn duplicates(&self) -> impl Iterator<Item = (&Fingerprint, &Vec<PathBuf>)> {
        self.groups.iter().filter(|(_, paths)| paths.len() > 1)
    }

    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.groups.values().flatten()
    }
}

const RULE: &str = "==================================================";

/// Human readable report of duplicate groups, oldest file first in each group
pub fn duplicate_report(scan: &ScanResult, base_dir: Option<&Path>) -> String {
    let mut lines = vec![
        RULE.to_string(),
        "Duplicate Detection Report".to_string(),
        RULE.to_string(),
    ];

    let groups: Vec<_> = scan.duplicates().collect();
    if groups.is_empty() {
        lines.push("No duplicates found".to_string());
    } else {
        let redundant: usize = groups.iter().map(|(_, paths)| paths.len() - 1).sum();
        lines.push(format!(
            "Found {} duplicate files in {} groups",
            redundant,
            groups.len()
        ));
        lines.push(String::new());

        for (index, (_, paths)) in groups.iter().enumerate() {
            lines.push(format!("Group {} ({} files):", index + 1, paths.len()));

            let mut files: Vec<_> = paths
                .iter()
                .map(|path| (path, std::fs::metadata(path).ok()))
                .collect();
            files.sort_by_key(|(path, meta)| {
                (meta.as_ref().and_then(|m| m.modified().ok()), (*path).clone())
            });

            for (position, (path, meta)) in files.iter().enumerate() {
                let marker = if position == 0 { "oldest" } else { "duplicate" };
                let display = base_dir
                    .and_then(|base| path.strip_prefix(base).ok())
                    .unwrap_or(path.as_path());
                lines.push(format!("  - {} ({})", display.display(), marker));

                if let Some(meta) = meta {
                    lines.push(format!("    Size: {} bytes", group_thousands(meta.len())));
                    if let Ok(modified) = meta.modified() {
                        let modified: DateTime<Local> = modified.into();
                        lines.push(format!(
                            "    Modified: {}",
                            modified.format("%Y-%m-%d %H:%M:%S")
                        ));
                    }
                }
            }
            lines.push(String::new());
        }
    }

    lines.push(RULE.to_string());
    lines.join("\n")
}

/// How a stored object resembles a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    SameName,
    SameSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimilarObject {
    pub local_path: PathBuf,
    pub key: String,
    pub size: u64,
    pub similarity: Similarity,
}

/// Stored objects that share a file name (case-insensitive) or, failing that,
/// the size of a local file. Unlike the fingerprint check this flags renamed or
/// re-exported copies worth a manual look.
pub fn similar_objects(local_path: &Path, local_size: u64, objects: &[ObjectInfo]) -> Vec<SimilarObject> {
    let local_name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    objects
        .iter()
        .filter_map(|object| {
            let name = object.key.rsplit('/').next().unwrap_or(&object.key).to_lowercase();
            let similarity = if name == local_name {
                Similarity::SameName
            } else if object.size == local_size {
                Similarity::SameSize
            } else {
                return None;
            };
            Some(SimilarObject {
                local_path: local_path.to_path_buf(),
                key: object.key.clone(),
                size: object.size,
                similarity,
            })
        })
        .collect()
}

/// List `prefix` once and match every given file against it
#[instrument(skip(store, files, policy), fields(bucket = store.bucket()))]
pub async fn find_similar_objects<S, P>(
    store: &S,
    prefix: &str,
    files: impl IntoIterator<Item = P>,
    policy: RetryPolicy,
) -> IngestResult<Vec<SimilarObject>>
where
    S: ObjectStore + ?Sized,
    P: AsRef<Path>,
{
    let mut listing = KeyListing::new(store, prefix).with_policy(policy);
    let mut objects = Vec::new();
    while let Some(page) = listing
        .next_objects()
        .await
        .map_err(|e| IngestError::Discovery(format!("listing {prefix:?}: {e}")))?
    {
        objects.extend(page);
    }
    debug!(objects = objects.len(), "Listed stored objects");

    let mut similar = Vec::new();
    for path in files {
        let path = path.as_ref();
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Cannot stat file");
                continue;
            },
        };
        let found = similar_objects(path, size, &objects);
        if !found.is_empty() {
            info!(path = %path.display(), similar = found.len(), "Similar stored objects");
        }
        similar.extend(found);
    }
    Ok(similar)
}

/// Text section listing similar stored objects per local file
pub fn similar_report(similar: &[SimilarObject], base_dir: Option<&Path>) -> String {
    let mut lines = vec![
        RULE.to_string(),
        "Similar Stored Objects".to_string(),
        RULE.to_string(),
    ];
    if similar.is_empty() {
        lines.push("No similar objects found".to_string());
    }

    let mut current: Option<&Path> = None;
    for item in similar {
        if current != Some(item.local_path.as_path()) {
            let display = base_dir
                .and_then(|base| item.local_path.strip_prefix(base).ok())
                .unwrap_or(item.local_path.as_path());
            lines.push(format!("{}:", display.display()));
            current = Some(item.local_path.as_path());
        }
        let reason = match item.similarity {
            Similarity::SameName => "same name",
            Similarity::SameSize => "same size",
        };
        lines.push(format!(
            "  - {} ({}, {} bytes)",
            item.key,
            reason,
            group_thousands(item.size)
        ));
    }

    lines.push(RULE.to_string());
    lines.join("\n")
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
