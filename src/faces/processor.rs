//! Indexing pipeline: scan, detect, cluster, commit.
//!
//! The scanner runs on the calling thread and feeds photos that need face
//! extraction to a bounded set of detect workers. Results come back tagged
//! with their dispatch sequence number and are committed strictly in that
//! order, one photo per transaction, so clustering sees the same face order
//! on every run.

use anyhow::Result as AnyResult;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};

use super::clustering::ClusteringEngine;
use super::provider::{BackendRegistry, DetectedFace, FaceEmbeddingProvider, FaceFilter};
use crate::config::Config;
use crate::db::{
    with_retry, AssignmentOrigin, ClusterAssignment, IndexStore, NewFace, Photo, PhotoId,
    ProcessingState,
};
use crate::error::{ErrorKind, IndexError, StoreError};
use crate::scanner::{PhotoScanner, ScanEvent, ScanFailure, ScanOptions, ScanSummary};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    /// Used unless the selected backend carries its own threshold.
    pub cluster_threshold: f32,
    pub detect_workers: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cluster_threshold: config.faces.cluster_threshold,
            detect_workers: config.faces.detect_workers.max(1),
        }
    }
}

/// Counts per outcome for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub scan: ScanSummary,
    /// Backend that served detection; `None` for a scan-only run.
    pub backend: Option<String>,
    pub photos_processed: usize,
    pub faces_detected: usize,
    /// Faces stored without a person because their embedding was unusable.
    pub faces_unassigned: usize,
    pub faces_discarded: usize,
    pub persons_created: usize,
    pub detection_errors: usize,
    pub store_errors: usize,
    /// Photos still waiting for face extraction when the run ended.
    pub pending: usize,
    pub failures: Vec<ScanFailure>,
}

struct DetectJob {
    seq: u64,
    photo: Photo,
}

struct DetectResult {
    seq: u64,
    photo: Photo,
    outcome: Result<Vec<DetectedFace>, IndexError>,
}

pub struct IndexPipeline {
    scanner: PhotoScanner,
    provider: Option<Arc<FaceEmbeddingProvider>>,
    options: PipelineOptions,
}

impl IndexPipeline {
    pub fn new(scanner: PhotoScanner, provider: Option<FaceEmbeddingProvider>, options: PipelineOptions) -> Self {
        Self {
            scanner,
            provider: provider.map(Arc::new),
            options,
        }
    }

    /// Build from config. With `detect` set, backends are probed in preference
    /// order; if none is available the pipeline runs scan-only and photos stay
    /// queued for detection.
    pub fn from_config(config: &Config, detect: bool) -> AnyResult<Self> {
        let scanner = PhotoScanner::new(ScanOptions::from_config(&config.scanner))?;
        let provider = if detect {
            match FaceEmbeddingProvider::select(
                BackendRegistry::from_config(&config.faces),
                &config.faces.preference_order(),
                FaceFilter::from_config(&config.faces),
            ) {
                Ok(provider) => Some(provider),
                Err(e) => {
                    tracing::warn!(error = %e, "Face detection disabled for this run");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self::new(scanner, provider, PipelineOptions::from_config(config)))
    }

    pub fn provider(&self) -> Option<&FaceEmbeddingProvider> {
        self.provider.as_deref()
    }

    /// Threshold in effect for the selected backend.
    pub fn cluster_threshold(&self) -> f32 {
        match &self.provider {
            Some(p) => p.cluster_threshold(self.options.cluster_threshold),
            None => self.options.cluster_threshold,
        }
    }

    /// Engine loaded from the store with this pipeline's threshold and
    /// embedding size.
    pub fn load_engine<S: IndexStore>(&self, store: &S) -> Result<ClusteringEngine, StoreError> {
        let engine = ClusteringEngine::load(store, self.cluster_threshold())?;
        Ok(match &self.provider {
            Some(p) => engine.with_dimension(p.embedding_dim()),
            None => engine,
        })
    }

    /// Scan `roots`, extract faces from new and changed photos (and from
    /// photos an earlier run left pending) and cluster them. `on_event` sees
    /// every scan event plus an `Errored` event for each photo whose
    /// extraction failed.
    ///
    /// Only a fatal store error fails the run; everything else is counted in
    /// the summary.
    pub fn run<S: IndexStore>(
        &self,
        store: &mut S,
        roots: &[PathBuf],
        cancel: &AtomicBool,
        on_event: &mut dyn FnMut(&ScanEvent),
    ) -> Result<RunSummary, IndexError> {
        let mut engine = self.load_engine(store)?;
        let mut summary = RunSummary {
            backend: self.provider.as_ref().map(|p| p.backend_name().to_string()),
            ..Default::default()
        };

        match &self.provider {
            Some(provider) => {
                self.run_with_detection(provider, store, &mut engine, roots, cancel, on_event, &mut summary)?;
            }
            None => {
                let mut stream = self.scanner.scan(store, roots, cancel);
                while let Some(event) = stream.next() {
                    on_event(&event);
                    if let ScanEvent::Modified { photo, .. } = &event {
                        summary.faces_discarded += discard_faces(&mut engine, stream.store(), photo.id)?;
                    }
                }
                summary.scan = stream.finish()?;
            }
        }

        summary.pending = with_retry("pending_photos", || store.pending_photos())?.len();
        tracing::info!(
            added = summary.scan.added,
            modified = summary.scan.modified,
            removed = summary.scan.removed,
            faces = summary.faces_detected,
            persons_created = summary.persons_created,
            pending = summary.pending,
            "Index run finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_with_detection<S: IndexStore>(
        &self,
        provider: &FaceEmbeddingProvider,
        store: &mut S,
        engine: &mut ClusteringEngine,
        roots: &[PathBuf],
        cancel: &AtomicBool,
        on_event: &mut dyn FnMut(&ScanEvent),
        summary: &mut RunSummary,
    ) -> Result<(), IndexError> {
        let workers = self.options.detect_workers.max(1);
        let (job_tx, job_rx) = mpsc::sync_channel::<DetectJob>(workers * 2);
        let job_rx = Mutex::new(job_rx);
        let (result_tx, result_rx) = mpsc::channel::<DetectResult>();

        std::thread::scope(|scope| -> Result<(), IndexError> {
            for _ in 0..workers {
                let result_tx = result_tx.clone();
                let job_rx = &job_rx;
                scope.spawn(move || detect_worker(provider, job_rx, result_tx, cancel));
            }
            drop(result_tx);

            let mut commit = CommitQueue::new(provider.backend_name());
            let outcome = self.dispatch(store, engine, roots, cancel, on_event, summary, &job_tx, &result_rx, &mut commit);

            // Workers exit once the job channel is closed and drained.
            drop(job_tx);
            for result in result_rx.iter() {
                commit.push(result);
                if outcome.is_ok() {
                    commit.drain(store, engine, on_event, summary)?;
                }
            }
            outcome?;
            commit.drain(store, engine, on_event, summary)?;

            if commit.waiting() > 0 {
                tracing::info!(photos = commit.waiting(), "Leaving uncommitted photos pending");
            }
            Ok(())
        })
    }

    /// Drive the scan and hand photos to the workers, committing whatever
    /// results are ready between events.
    #[allow(clippy::too_many_arguments)]
    fn dispatch<S: IndexStore>(
        &self,
        store: &mut S,
        engine: &mut ClusteringEngine,
        roots: &[PathBuf],
        cancel: &AtomicBool,
        on_event: &mut dyn FnMut(&ScanEvent),
        summary: &mut RunSummary,
        job_tx: &SyncSender<DetectJob>,
        result_rx: &Receiver<DetectResult>,
        commit: &mut CommitQueue,
    ) -> Result<(), IndexError> {
        let mut dispatched: HashSet<PhotoId> = HashSet::new();
        let mut seq = 0u64;

        let mut stream = self.scanner.scan(store, roots, cancel);
        while let Some(event) = stream.next() {
            on_event(&event);

            if let ScanEvent::Modified { photo, .. } = &event {
                match discard_faces(engine, stream.store(), photo.id) {
                    Ok(discarded) => summary.faces_discarded += discarded,
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        // Old faces stay until the photo is committed, which
                        // replaces them.
                        tracing::warn!(path = %photo.path.display(), error = %e, "Failed to discard old faces");
                    }
                }
            }

            if let Some(photo) = event.detection_candidate() {
                if dispatched.insert(photo.id) {
                    send_job(job_tx, seq, photo.clone())?;
                    seq += 1;
                }
            }

            while let Ok(result) = result_rx.try_recv() {
                commit.push(result);
            }
            commit.drain(stream.store(), engine, on_event, summary)?;
        }
        summary.scan = stream.finish()?;

        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }

        // Photos an earlier run hashed but never finished.
        for photo in with_retry("pending_photos", || store.pending_photos())? {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if dispatched.insert(photo.id) {
                tracing::debug!(path = %photo.path.display(), "Resuming pending photo");
                send_job(job_tx, seq, photo)?;
                seq += 1;
            }
            while let Ok(result) = result_rx.try_recv() {
                commit.push(result);
            }
            commit.drain(store, engine, on_event, summary)?;
        }
        Ok(())
    }
}

fn send_job(job_tx: &SyncSender<DetectJob>, seq: u64, photo: Photo) -> Result<(), IndexError> {
    job_tx
        .send(DetectJob { seq, photo })
        .map_err(|_| IndexError::Detection("detect workers stopped".to_string()))
}

fn detect_worker(
    provider: &FaceEmbeddingProvider,
    jobs: &Mutex<Receiver<DetectJob>>,
    results: Sender<DetectResult>,
    cancel: &AtomicBool,
) {
    loop {
        let job = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        let Ok(DetectJob { seq, photo }) = job else {
            return;
        };
        if cancel.load(Ordering::Relaxed) {
            // Dropped jobs stay pending in the index.
            continue;
        }

        let outcome = std::fs::read(&photo.path)
            .map_err(|e| IndexError::io(&photo.path, e))
            .and_then(|bytes| provider.detect(&bytes));
        if results.send(DetectResult { seq, photo, outcome }).is_err() {
            return;
        }
    }
}

/// Reorder buffer: results are committed in dispatch order only.
struct CommitQueue {
    backend: String,
    next_seq: u64,
    ready: BTreeMap<u64, DetectResult>,
}

impl CommitQueue {
    fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            next_seq: 0,
            ready: BTreeMap::new(),
        }
    }

    fn push(&mut self, result: DetectResult) {
        self.ready.insert(result.seq, result);
    }

    fn waiting(&self) -> usize {
        self.ready.len()
    }

    fn drain<S: IndexStore>(
        &mut self,
        store: &mut S,
        engine: &mut ClusteringEngine,
        on_event: &mut dyn FnMut(&ScanEvent),
        summary: &mut RunSummary,
    ) -> Result<(), IndexError> {
        while let Some(result) = self.ready.remove(&self.next_seq) {
            self.next_seq += 1;
            let DetectResult { photo, outcome, .. } = result;
            match outcome {
                Ok(faces) => match commit_photo(store, engine, &photo, faces, &self.backend) {
                    Ok(stats) => {
                        summary.photos_processed += 1;
                        summary.faces_detected += stats.faces;
                        summary.faces_unassigned += stats.unassigned;
                        summary.persons_created += stats.created;
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        summary.store_errors += 1;
                        report_failure(on_event, summary, &photo, &IndexError::Store(e));
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %photo.path.display(), error = %e, "Face extraction failed");
                    summary.detection_errors += 1;
                    let reason = e.to_string();
                    match with_retry("set_photo_state", || {
                        store.set_photo_state(photo.id, ProcessingState::Error, Some(&reason))
                    }) {
                        Ok(()) => {}
                        Err(se) if se.is_fatal() => return Err(se.into()),
                        Err(se) => tracing::warn!(error = %se, "Failed to record extraction error"),
                    }
                    report_failure(on_event, summary, &photo, &e);
                }
            }
        }
        Ok(())
    }
}

fn report_failure(on_event: &mut dyn FnMut(&ScanEvent), summary: &mut RunSummary, photo: &Photo, error: &IndexError) {
    let event = ScanEvent::errored(&photo.path, error);
    on_event(&event);
    summary.failures.push(ScanFailure {
        path: photo.path.clone(),
        kind: error.kind(),
        reason: error.to_string(),
    });
}

struct CommitStats {
    faces: usize,
    unassigned: usize,
    created: usize,
}

/// Cluster one photo's faces and write them, the persons they touched and the
/// `faces-extracted` state in one transaction. On failure the engine is
/// rolled back so it matches the store again.
fn commit_photo<S: IndexStore>(
    store: &mut S,
    engine: &mut ClusteringEngine,
    photo: &Photo,
    mut faces: Vec<DetectedFace>,
    backend: &str,
) -> Result<CommitStats, StoreError> {
    faces.sort_by_key(|f| f.bbox.order_key());

    let checkpoint = engine.checkpoint();
    let existing = with_retry("get_faces_for_photo", || store.get_faces_for_photo(photo.id))?;
    for face in &existing {
        engine.detach(face);
    }

    let mut stats = CommitStats {
        faces: faces.len(),
        unassigned: 0,
        created: 0,
    };
    let new_faces: Vec<NewFace> = faces
        .into_iter()
        .enumerate()
        .map(|(ordinal, face)| {
            let assignment = engine.assign(&face.embedding).map(|d| {
                if d.created {
                    stats.created += 1;
                }
                ClusterAssignment {
                    person_id: d.person_id,
                    distance: d.distance,
                    origin: AssignmentOrigin::AutoCluster,
                }
            });
            if assignment.is_none() {
                stats.unassigned += 1;
            }
            NewFace {
                ordinal: ordinal as u32,
                bbox: face.bbox,
                embedding: face.embedding,
                backend: backend.to_string(),
                confidence: Some(face.confidence),
                assignment,
            }
        })
        .collect();
    let persons = engine.dirty_persons();

    let written = with_retry("commit_photo", || {
        store.atomic(|s| {
            // Persons first: faces reference them.
            for person in &persons {
                s.upsert_person(person)?;
            }
            if !existing.is_empty() {
                s.delete_faces_for_photo(photo.id)?;
            }
            s.insert_faces(photo.id, &new_faces)?;
            s.set_photo_state(photo.id, ProcessingState::FacesExtracted, None)?;
            Ok(())
        })
    });

    match written {
        Ok(()) => {
            engine.clear_dirty();
            tracing::debug!(path = %photo.path.display(), faces = stats.faces, "Committed faces");
            Ok(stats)
        }
        Err(e) => {
            tracing::error!(path = %photo.path.display(), error = %e, "Failed to commit faces");
            engine.restore(checkpoint);
            Err(e)
        }
    }
}

/// Drop a changed photo's faces: they leave their persons' centroids and are
/// deleted together with the updated persons.
pub fn discard_faces<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    photo_id: PhotoId,
) -> Result<usize, StoreError> {
    let faces = with_retry("get_faces_for_photo", || store.get_faces_for_photo(photo_id))?;
    if faces.is_empty() {
        return Ok(0);
    }

    let checkpoint = engine.checkpoint();
    for face in &faces {
        engine.detach(face);
    }
    let persons = engine.dirty_persons();

    let written = with_retry("discard_faces", || {
        store.atomic(|s| {
            s.delete_faces_for_photo(photo_id)?;
            for person in &persons {
                s.upsert_person(person)?;
            }
            Ok(())
        })
    });
    match written {
        Ok(()) => {
            engine.clear_dirty();
            Ok(faces.len())
        }
        Err(e) => {
            engine.restore(checkpoint);
            Err(e)
        }
    }
}

impl RunSummary {
    /// Failures of one kind, from both the scan and face extraction.
    pub fn failures_of(&self, kind: ErrorKind) -> impl Iterator<Item = &ScanFailure> {
        self.scan
            .failures
            .iter()
            .chain(self.failures.iter())
            .filter(move |f| f.kind == kind)
    }
}
