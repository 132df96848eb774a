//! Filesystem scanner: walks library roots, fingerprints every image and
//! classifies it against the index as a lazy stream of [`ScanEvent`]s.

pub mod discovery;
pub mod hashing;
pub mod metadata;

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ScannerConfig;
use crate::db::{with_retry, IndexStore, Photo, PhotoId, ProcessingState};
use crate::error::{ErrorKind, IndexError, StoreError};

pub use discovery::{has_image_extension, walk_images, Discovered};
pub use hashing::{hash_bytes, hash_file, ContentHash};
pub use metadata::ImageMetadata;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub image_extensions: Vec<String>,
    pub hash_workers: usize,
    pub follow_symlinks: bool,
    pub skip_duplicate_detection: bool,
}

impl ScanOptions {
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            image_extensions: config.image_extensions.clone(),
            hash_workers: config.hash_workers.max(1),
            follow_symlinks: config.follow_symlinks,
            skip_duplicate_detection: config.skip_duplicate_detection,
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&ScannerConfig::default())
    }
}

/// Outcome of scanning one path.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// First sighting of the path, or a soft-removed path that came back
    /// with its old content.
    Added {
        photo: Photo,
        /// Live photo elsewhere in the index with identical content.
        duplicate_of: Option<PhotoId>,
    },
    Unchanged {
        photo: Photo,
    },
    /// Content changed; the photo needs detection again.
    Modified {
        photo: Photo,
        previous_hash: String,
    },
    /// Indexed path not seen by a completed pass; now soft-deleted.
    Removed {
        path: PathBuf,
    },
    Errored {
        path: PathBuf,
        kind: ErrorKind,
        reason: String,
    },
}

impl ScanEvent {
    pub fn path(&self) -> &Path {
        match self {
            ScanEvent::Added { photo, .. }
            | ScanEvent::Unchanged { photo }
            | ScanEvent::Modified { photo, .. } => &photo.path,
            ScanEvent::Removed { path } | ScanEvent::Errored { path, .. } => path,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScanEvent::Added { .. } => "added",
            ScanEvent::Unchanged { .. } => "unchanged",
            ScanEvent::Modified { .. } => "modified",
            ScanEvent::Removed { .. } => "removed",
            ScanEvent::Errored { .. } => "errored",
        }
    }

    pub fn errored(path: impl Into<PathBuf>, error: &IndexError) -> Self {
        ScanEvent::Errored {
            path: path.into(),
            kind: error.kind(),
            reason: error.to_string(),
        }
    }

    /// Photo that face extraction should run on after this event, if any.
    /// Includes unchanged photos an interrupted run left pending.
    pub fn detection_candidate(&self) -> Option<&Photo> {
        match self {
            ScanEvent::Added { photo, .. }
            | ScanEvent::Unchanged { photo }
            | ScanEvent::Modified { photo, .. }
                if photo.needs_detection() =>
            {
                Some(photo)
            }
            _ => None,
        }
    }
}

/// A recorded per-item failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Counts per outcome for one scan invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub added: usize,
    pub unchanged: usize,
    pub modified: usize,
    pub removed: usize,
    pub errored: usize,
    pub duplicates: usize,
    pub cancelled: bool,
    pub failures: Vec<ScanFailure>,
}

impl ScanSummary {
    pub fn record(&mut self, event: &ScanEvent) {
        match event {
            ScanEvent::Added { duplicate_of, .. } => {
                self.added += 1;
                if duplicate_of.is_some() {
                    self.duplicates += 1;
                }
            }
            ScanEvent::Unchanged { .. } => self.unchanged += 1,
            ScanEvent::Modified { .. } => self.modified += 1,
            ScanEvent::Removed { .. } => self.removed += 1,
            ScanEvent::Errored { path, kind, reason } => {
                self.errored += 1;
                self.failures.push(ScanFailure {
                    path: path.clone(),
                    kind: *kind,
                    reason: reason.clone(),
                });
            }
        }
    }

    pub fn total(&self) -> usize {
        self.added + self.unchanged + self.modified + self.removed + self.errored
    }
}

/// Hash and header facts for one file, computed off the scan thread.
#[derive(Debug)]
struct Inspected {
    hash: ContentHash,
    metadata: ImageMetadata,
}

impl Inspected {
    fn into_photo(self, path: PathBuf) -> Photo {
        let mut photo = Photo::new(path, self.hash.sha256, self.hash.size_bytes);
        photo.modified_at = self.metadata.modified_at;
        photo.width = self.metadata.width;
        photo.height = self.metadata.height;
        photo.taken_at = self.metadata.taken_at;
        photo
    }
}

fn inspect(path: &Path) -> Result<Inspected, IndexError> {
    let modified = std::fs::metadata(path)
        .map_err(|e| IndexError::io(path, e))?
        .modified()
        .ok();
    let hash = hash_file(path)?;
    let metadata = metadata::extract_metadata(path, modified);
    Ok(Inspected { hash, metadata })
}

pub struct PhotoScanner {
    options: ScanOptions,
    pool: rayon::ThreadPool,
}

impl PhotoScanner {
    pub fn new(options: ScanOptions) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.hash_workers.max(1))
            .thread_name(|i| format!("facegallery-hash-{}", i))
            .build()
            .context("Failed to build hashing thread pool")?;
        Ok(Self { options, pool })
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Start a scan of `roots`. Nothing happens until the stream is polled;
    /// each yielded event has already been persisted.
    pub fn scan<'a, S: IndexStore>(
        &'a self,
        store: &'a mut S,
        roots: &[PathBuf],
        cancel: &'a AtomicBool,
    ) -> ScanStream<'a, S> {
        ScanStream {
            scanner: self,
            store,
            cancel,
            roots: roots.iter().cloned().collect(),
            current: None,
            seen: HashSet::new(),
            pending: VecDeque::new(),
            summary: ScanSummary::default(),
            finished: false,
            fatal: None,
        }
    }

    /// Drain a whole scan, returning its summary.
    pub fn scan_all<S: IndexStore>(
        &self,
        store: &mut S,
        roots: &[PathBuf],
        cancel: &AtomicBool,
    ) -> Result<ScanSummary, StoreError> {
        let mut stream = self.scan(store, roots, cancel);
        for event in stream.by_ref() {
            tracing::debug!(event = event.label(), path = %event.path().display(), "Scan event");
        }
        stream.finish()
    }

    fn batch_size(&self) -> usize {
        self.options.hash_workers.max(1) * 4
    }

    fn inspect_batch(&self, paths: Vec<PathBuf>) -> Vec<(PathBuf, Result<Inspected, IndexError>)> {
        self.pool.install(|| {
            paths
                .into_par_iter()
                .map(|path| {
                    let inspected = inspect(&path);
                    (path, inspected)
                })
                .collect()
        })
    }
}

struct RootWalk<'a> {
    root: PathBuf,
    files: Box<dyn Iterator<Item = Discovered> + 'a>,
    exhausted: bool,
    /// Entries the walk could not read; indexed photos under them are not
    /// reported as removed.
    unreadable: Vec<PathBuf>,
    inspected: VecDeque<(PathBuf, Result<Inspected, IndexError>)>,
}

/// Lazy scan over a set of roots. Iterating it drives the whole scan.
///
/// Cancellation is checked before every file; a cancelled scan leaves every
/// record it already wrote valid and skips the removal phase, so scanning
/// again continues where it stopped.
pub struct ScanStream<'a, S: IndexStore> {
    scanner: &'a PhotoScanner,
    store: &'a mut S,
    cancel: &'a AtomicBool,
    roots: VecDeque<PathBuf>,
    current: Option<RootWalk<'a>>,
    /// Canonical paths already handled in this invocation.
    seen: HashSet<PathBuf>,
    pending: VecDeque<ScanEvent>,
    summary: ScanSummary,
    finished: bool,
    fatal: Option<StoreError>,
}

impl<'a, S: IndexStore> ScanStream<'a, S> {
    /// The store the scan writes to, for callers that persist follow-up work
    /// between events.
    pub fn store(&mut self) -> &mut S {
        self.store
    }

    pub fn summary(&self) -> &ScanSummary {
        &self.summary
    }

    pub fn is_cancelled(&self) -> bool {
        self.summary.cancelled
    }

    /// Final summary, or the store failure that aborted the scan.
    pub fn finish(mut self) -> Result<ScanSummary, StoreError> {
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(self.summary),
        }
    }

    fn start_root(&mut self, root: PathBuf) {
        let root = match root.canonicalize() {
            Ok(root) => root,
            Err(e) => {
                let err = IndexError::io(&root, e);
                tracing::warn!(root = %root.display(), error = %err, "Cannot scan root");
                self.pending.push_back(ScanEvent::errored(root, &err));
                return;
            }
        };
        tracing::info!(root = %root.display(), "Scanning");
        let scanner: &'a PhotoScanner = self.scanner;
        let options = &scanner.options;
        let files = walk_images(&root, &options.image_extensions, options.follow_symlinks);
        self.current = Some(RootWalk {
            root,
            files: Box::new(files),
            exhausted: false,
            unreadable: Vec::new(),
            inspected: VecDeque::new(),
        });
    }

    /// Advance the current root by one unit: classify one inspected file,
    /// inspect the next batch, or run the removal phase.
    fn step(&mut self) {
        let Some(walk) = self.current.as_mut() else {
            return;
        };

        if let Some((path, inspected)) = walk.inspected.pop_front() {
            self.classify(path, inspected);
            return;
        }

        if walk.exhausted {
            if let Some(walk) = self.current.take() {
                self.finish_root(walk);
            }
            return;
        }

        let batch_size = self.scanner.batch_size();
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match walk.files.next() {
                Some(Discovered::Image(path)) => {
                    if self.seen.insert(path.clone()) {
                        batch.push(path);
                    }
                }
                Some(Discovered::Unreadable { path, error }) => {
                    let err = IndexError::io(&path, error);
                    tracing::warn!(path = %path.display(), error = %err, "Cannot read entry");
                    walk.unreadable.push(path.clone());
                    self.pending.push_back(ScanEvent::errored(path, &err));
                }
                None => {
                    walk.exhausted = true;
                    break;
                }
            }
        }

        if !batch.is_empty() {
            walk.inspected = self.scanner.inspect_batch(batch).into();
        }
    }

    fn classify(&mut self, path: PathBuf, inspected: Result<Inspected, IndexError>) {
        let inspected = match inspected {
            Ok(inspected) => inspected,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot hash file");
                self.pending.push_back(ScanEvent::errored(path, &e));
                return;
            }
        };

        match self.record(path.clone(), inspected) {
            Ok(event) => self.pending.push_back(event),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to record photo");
                self.pending.push_back(ScanEvent::Errored {
                    path,
                    kind: ErrorKind::Store,
                    reason: e.to_string(),
                });
                if e.is_fatal() {
                    self.fatal = Some(e);
                }
            }
        }
    }

    fn record(&mut self, path: PathBuf, inspected: Inspected) -> Result<ScanEvent, StoreError> {
        let skip_duplicates = self.scanner.options.skip_duplicate_detection;
        let store = &mut *self.store;

        let existing = with_retry("get_photo_by_path", || store.get_photo_by_path(&path))?;
        let mut photo = inspected.into_photo(path);

        match existing {
            Some(prev) if !prev.is_removed() && prev.content_hash == photo.content_hash => {
                Ok(ScanEvent::Unchanged { photo: prev })
            }
            Some(prev) if prev.content_hash != photo.content_hash => {
                photo.state = ProcessingState::Hashed;
                let id = with_retry("upsert_photo", || store.upsert_photo(&photo))?;
                photo.id = id;
                tracing::info!(path = %photo.path.display(), "Photo content changed");
                requeue_copy(store, &prev)?;
                Ok(ScanEvent::Modified {
                    photo,
                    previous_hash: prev.content_hash,
                })
            }
            Some(prev) => {
                // Came back with the same bytes: keep its faces and state.
                photo.state = prev.state;
                photo.error = prev.error;
                let id = with_retry("upsert_photo", || store.upsert_photo(&photo))?;
                photo.id = id;
                Ok(ScanEvent::Added {
                    photo,
                    duplicate_of: None,
                })
            }
            None => {
                let duplicate = with_retry("find_photo_by_hash", || {
                    store.find_photo_by_hash(&photo.content_hash, 0)
                })?;
                photo.state = if duplicate.is_some() && skip_duplicates {
                    ProcessingState::FacesExtracted
                } else {
                    ProcessingState::Hashed
                };
                let id = with_retry("upsert_photo", || store.upsert_photo(&photo))?;
                photo.id = id;
                Ok(ScanEvent::Added {
                    photo,
                    duplicate_of: duplicate.map(|d| d.id),
                })
            }
        }
    }

    fn finish_root(&mut self, walk: RootWalk<'a>) {
        let store = &mut *self.store;
        let indexed = match with_retry("photos_under", || store.photos_under(&walk.root)) {
            Ok(photos) => photos,
            Err(e) => {
                tracing::error!(root = %walk.root.display(), error = %e, "Cannot list indexed photos");
                self.pending.push_back(ScanEvent::Errored {
                    path: walk.root,
                    kind: ErrorKind::Store,
                    reason: e.to_string(),
                });
                if e.is_fatal() {
                    self.fatal = Some(e);
                }
                return;
            }
        };

        for photo in indexed {
            if self.seen.contains(&photo.path)
                || walk.unreadable.iter().any(|dir| photo.path.starts_with(dir))
            {
                continue;
            }
            match with_retry("mark_removed", || store.mark_removed(&photo.path)) {
                Ok(()) => {
                    tracing::info!(path = %photo.path.display(), "Photo removed from library");
                    if let Err(e) = requeue_copy(store, &photo) {
                        tracing::warn!(path = %photo.path.display(), error = %e, "Cannot re-queue duplicate");
                        if e.is_fatal() {
                            self.fatal = Some(e);
                            return;
                        }
                    }
                    self.pending.push_back(ScanEvent::Removed { path: photo.path });
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    self.pending.push_back(ScanEvent::Errored {
                        path: photo.path,
                        kind: ErrorKind::Store,
                        reason: e.to_string(),
                    });
                    if fatal {
                        self.fatal = Some(e);
                        return;
                    }
                }
            }
        }
    }
}

/// `holder` no longer shows the content it had: it was modified or removed.
/// If it held the only faces extracted for that content, queue the first live
/// copy skipped as a duplicate for detection so the faces are not lost.
fn requeue_copy<S: IndexStore>(store: &mut S, holder: &Photo) -> Result<Option<PhotoId>, StoreError> {
    let held = with_retry("get_faces_for_photo", || store.get_faces_for_photo(holder.id))?;
    if held.is_empty() {
        return Ok(None);
    }

    let copies = with_retry("photos_with_hash", || store.photos_with_hash(&holder.content_hash))?;
    let mut candidate = None;
    for copy in copies.into_iter().filter(|p| p.id != holder.id) {
        if copy.needs_detection() {
            return Ok(None);
        }
        let faces = with_retry("get_faces_for_photo", || store.get_faces_for_photo(copy.id))?;
        if !faces.is_empty() {
            return Ok(None);
        }
        if candidate.is_none() && copy.state == ProcessingState::FacesExtracted {
            candidate = Some(copy);
        }
    }

    let Some(copy) = candidate else {
        return Ok(None);
    };
    with_retry("set_photo_state", || {
        store.set_photo_state(copy.id, ProcessingState::Hashed, None)
    })?;
    tracing::info!(path = %copy.path.display(), "Duplicate queued for detection");
    Ok(Some(copy.id))
}

impl<'a, S: IndexStore> Iterator for ScanStream<'a, S> {
    type Item = ScanEvent;

    fn next(&mut self) -> Option<ScanEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.summary.record(&event);
                return Some(event);
            }
            if self.finished || self.fatal.is_some() {
                return None;
            }
            if self.cancel.load(Ordering::Relaxed) {
                tracing::info!("Scan cancelled");
                self.summary.cancelled = true;
                self.finished = true;
                self.current = None;
                return None;
            }
            if self.current.is_none() {
                match self.roots.pop_front() {
                    Some(root) => self.start_root(root),
                    None => {
                        self.finished = true;
                        return None;
                    }
                }
                continue;
            }
            self.step();
        }
    }
}
