//! Index store: durable record of photos, faces, persons and cluster
//! membership.
//!
//! The engine only talks to the [`IndexStore`] trait. [`SqliteStore`] is the
//! implementation shipped with the crate.

mod schema;
pub mod faces;
pub mod sqlite;

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

pub use faces::{AssignmentOrigin, BoundingBox, ClusterAssignment, Face, NewFace, Person};
pub use schema::SCHEMA;
pub use sqlite::SqliteStore;

pub type PhotoId = i64;
pub type FaceId = i64;
pub type PersonId = i64;

/// Processing state of a photo in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingState {
    Unseen,
    /// Content hash recorded; face extraction still pending.
    Hashed,
    FacesExtracted,
    Error,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Unseen => "unseen",
            ProcessingState::Hashed => "hashed",
            ProcessingState::FacesExtracted => "faces-extracted",
            ProcessingState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unseen" => Some(ProcessingState::Unseen),
            "hashed" => Some(ProcessingState::Hashed),
            "faces-extracted" => Some(ProcessingState::FacesExtracted),
            "error" => Some(ProcessingState::Error),
            _ => None,
        }
    }
}

/// A photo record. Identity is the canonical path; `id` is 0 until stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub id: PhotoId,
    pub path: PathBuf,
    pub content_hash: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Capture time from EXIF, falling back to the filesystem mtime.
    pub taken_at: Option<NaiveDateTime>,
    pub state: ProcessingState,
    pub error: Option<String>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl Photo {
    pub fn new(path: impl Into<PathBuf>, content_hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: 0,
            path: path.into(),
            content_hash: content_hash.into(),
            size_bytes,
            modified_at: None,
            width: None,
            height: None,
            taken_at: None,
            state: ProcessingState::Unseen,
            error: None,
            removed_at: None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// Whether face extraction still has to run for this photo.
    pub fn needs_detection(&self) -> bool {
        !self.is_removed() && matches!(self.state, ProcessingState::Unseen | ProcessingState::Hashed)
    }
}

/// CRUD contract the scanner and the clustering pipeline rely on.
///
/// Every write of one photo's full update (hash, faces, assignments and the
/// persons they touch) must go through [`IndexStore::atomic`].
pub trait IndexStore {
    fn get_photo_by_path(&self, path: &Path) -> Result<Option<Photo>, StoreError>;

    fn get_photo(&self, photo_id: PhotoId) -> Result<Option<Photo>, StoreError>;

    /// Find another live photo with the same content hash.
    fn find_photo_by_hash(&self, hash: &str, exclude: PhotoId) -> Result<Option<Photo>, StoreError>;

    /// Every live photo with this content hash, ascending by id.
    fn photos_with_hash(&self, hash: &str) -> Result<Vec<Photo>, StoreError>;

    /// Insert or update the photo keyed by path and clear any removal mark.
    fn upsert_photo(&mut self, photo: &Photo) -> Result<PhotoId, StoreError>;

    /// Soft-delete: the row, its faces and their assignments are retained.
    fn mark_removed(&mut self, path: &Path) -> Result<(), StoreError>;

    /// Live photos whose path lies under `root`.
    fn photos_under(&self, root: &Path) -> Result<Vec<Photo>, StoreError>;

    /// Live photos still waiting for face extraction, ascending by id.
    fn pending_photos(&self) -> Result<Vec<Photo>, StoreError>;

    fn set_photo_state(
        &mut self,
        photo_id: PhotoId,
        state: ProcessingState,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    fn insert_faces(&mut self, photo_id: PhotoId, faces: &[NewFace]) -> Result<Vec<FaceId>, StoreError>;

    fn delete_faces_for_photo(&mut self, photo_id: PhotoId) -> Result<usize, StoreError>;

    /// Hard-delete one face, e.g. a false detection.
    fn delete_face(&mut self, face_id: FaceId) -> Result<(), StoreError>;

    fn get_faces_for_photo(&self, photo_id: PhotoId) -> Result<Vec<Face>, StoreError>;

    fn get_face(&self, face_id: FaceId) -> Result<Option<Face>, StoreError>;

    /// Every stored face in clustering order: photo id, then detection
    /// ordinal. Faces of soft-removed photos are included; they still hold
    /// their person assignments.
    fn faces_in_cluster_order(&self) -> Result<Vec<Face>, StoreError>;

    fn get_all_persons(&self) -> Result<Vec<Person>, StoreError>;

    fn get_person(&self, person_id: PersonId) -> Result<Option<Person>, StoreError>;

    fn get_faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>, StoreError>;

    /// Insert or update the person with `person.id`.
    fn upsert_person(&mut self, person: &Person) -> Result<(), StoreError>;

    /// Turn every automatic assignment of a person into a manual one.
    fn confirm_person_faces(&mut self, person_id: PersonId) -> Result<usize, StoreError>;

    /// Delete a person; its faces become unassigned.
    fn delete_person(&mut self, person_id: PersonId) -> Result<(), StoreError>;

    fn assign_face(
        &mut self,
        face_id: FaceId,
        person_id: PersonId,
        origin: AssignmentOrigin,
        distance: Option<f32>,
    ) -> Result<(), StoreError>;

    fn unassign_face(&mut self, face_id: FaceId) -> Result<(), StoreError>;

    /// Move every face of `from` to `to`, keeping each face's origin.
    fn move_faces(&mut self, from: PersonId, to: PersonId) -> Result<usize, StoreError>;

    /// Run `work` as one transaction; nothing is written if it fails.
    fn atomic<T, F>(&mut self, work: F) -> Result<T, StoreError>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<T, StoreError>;
}

/// Run a store operation, retrying it once if the first attempt fails with a
/// non-fatal error.
pub fn with_retry<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    match op() {
        Ok(value) => Ok(value),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(operation = what, error = %e, "Store operation failed, retrying once");
            op()
        }
    }
}
