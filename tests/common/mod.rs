#![allow(dead_code)]

use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use facegallery::db::{
    AssignmentOrigin, BoundingBox, Face, FaceId, IndexStore, NewFace, Person, PersonId, Photo, PhotoId,
    ProcessingState, SqliteStore,
};
use facegallery::error::{IndexError, StoreError};
use facegallery::faces::{
    DetectedFace, FaceBackend, FaceEmbeddingProvider, FaceFilter, IndexPipeline, PipelineOptions,
};
use facegallery::scanner::{PhotoScanner, ScanOptions};

pub const TILE: u32 = 16;

pub const RED: [u8; 3] = [255, 0, 0];
pub const ORANGE: [u8; 3] = [255, 100, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const GREEN: [u8; 3] = [0, 255, 0];

/// Every non-black 16x16 tile along the top row is a face whose embedding is
/// the tile's colour.
pub struct ColourBackend;

impl FaceBackend for ColourBackend {
    fn name(&self) -> &str {
        "colour"
    }

    fn embedding_dim(&self) -> usize {
        3
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, IndexError> {
        let (width, height) = image.dimensions();
        if height < TILE {
            return Ok(Vec::new());
        }
        let mut faces = Vec::new();
        for tile in 0..width / TILE {
            let x = tile * TILE;
            let pixel = image.get_pixel(x + TILE / 2, TILE / 2);
            let [r, g, b, _] = pixel.0;
            if r == 0 && g == 0 && b == 0 {
                continue;
            }
            faces.push(DetectedFace {
                bbox: BoundingBox {
                    x: x as i32,
                    y: 0,
                    width: TILE as i32,
                    height: TILE as i32,
                },
                embedding: vec![r as f32, g as f32, b as f32],
                confidence: 0.99,
            });
        }
        Ok(faces)
    }
}

/// Write a PNG with one tile per colour, left to right.
pub fn write_photo(path: &Path, tiles: &[[u8; 3]]) -> PathBuf {
    let width = TILE * tiles.len().max(1) as u32;
    let mut img = RgbImage::new(width, TILE);
    for (i, colour) in tiles.iter().enumerate() {
        for y in 0..TILE {
            for x in 0..TILE {
                img.put_pixel(i as u32 * TILE + x, y, Rgb(*colour));
            }
        }
    }
    img.save(path).unwrap();
    path.canonicalize().unwrap()
}

pub fn provider() -> FaceEmbeddingProvider {
    FaceEmbeddingProvider::new(Arc::new(ColourBackend), FaceFilter::permissive())
}

pub fn scanner() -> PhotoScanner {
    PhotoScanner::new(ScanOptions {
        hash_workers: 2,
        ..ScanOptions::default()
    })
    .unwrap()
}

pub fn options() -> PipelineOptions {
    PipelineOptions {
        cluster_threshold: 0.4,
        detect_workers: 2,
    }
}

pub fn pipeline() -> IndexPipeline {
    IndexPipeline::new(scanner(), Some(provider()), options())
}

pub fn scan_only_pipeline() -> IndexPipeline {
    IndexPipeline::new(scanner(), None, options())
}

/// SQLite store whose `atomic` calls fail for a range of call numbers
/// (counted from zero) before any work runs.
pub struct FlakyStore {
    pub inner: SqliteStore,
    pub atomic_calls: usize,
    failing: Range<usize>,
    error: fn() -> StoreError,
}

impl FlakyStore {
    pub fn new(failing: Range<usize>, error: fn() -> StoreError) -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            atomic_calls: 0,
            failing,
            error,
        }
    }
}

pub fn corrupt() -> StoreError {
    StoreError::Corrupt("injected".to_string())
}

pub fn unavailable() -> StoreError {
    StoreError::Unavailable("injected".to_string())
}

impl IndexStore for FlakyStore {
    fn get_photo_by_path(&self, path: &Path) -> Result<Option<Photo>, StoreError> {
        self.inner.get_photo_by_path(path)
    }

    fn get_photo(&self, photo_id: PhotoId) -> Result<Option<Photo>, StoreError> {
        self.inner.get_photo(photo_id)
    }

    fn find_photo_by_hash(&self, hash: &str, exclude: PhotoId) -> Result<Option<Photo>, StoreError> {
        self.inner.find_photo_by_hash(hash, exclude)
    }

    fn photos_with_hash(&self, hash: &str) -> Result<Vec<Photo>, StoreError> {
        self.inner.photos_with_hash(hash)
    }

    fn upsert_photo(&mut self, photo: &Photo) -> Result<PhotoId, StoreError> {
        self.inner.upsert_photo(photo)
    }

    fn mark_removed(&mut self, path: &Path) -> Result<(), StoreError> {
        self.inner.mark_removed(path)
    }

    fn photos_under(&self, root: &Path) -> Result<Vec<Photo>, StoreError> {
        self.inner.photos_under(root)
    }

    fn pending_photos(&self) -> Result<Vec<Photo>, StoreError> {
        self.inner.pending_photos()
    }

    fn set_photo_state(
        &mut self,
        photo_id: PhotoId,
        state: ProcessingState,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.inner.set_photo_state(photo_id, state, error)
    }

    fn insert_faces(&mut self, photo_id: PhotoId, faces: &[NewFace]) -> Result<Vec<FaceId>, StoreError> {
        self.inner.insert_faces(photo_id, faces)
    }

    fn delete_faces_for_photo(&mut self, photo_id: PhotoId) -> Result<usize, StoreError> {
        self.inner.delete_faces_for_photo(photo_id)
    }

    fn delete_face(&mut self, face_id: FaceId) -> Result<(), StoreError> {
        self.inner.delete_face(face_id)
    }

    fn get_faces_for_photo(&self, photo_id: PhotoId) -> Result<Vec<Face>, StoreError> {
        self.inner.get_faces_for_photo(photo_id)
    }

    fn get_face(&self, face_id: FaceId) -> Result<Option<Face>, StoreError> {
        self.inner.get_face(face_id)
    }

    fn faces_in_cluster_order(&self) -> Result<Vec<Face>, StoreError> {
        self.inner.faces_in_cluster_order()
    }

    fn get_all_persons(&self) -> Result<Vec<Person>, StoreError> {
        self.inner.get_all_persons()
    }

    fn get_person(&self, person_id: PersonId) -> Result<Option<Person>, StoreError> {
        self.inner.get_person(person_id)
    }

    fn get_faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>, StoreError> {
        self.inner.get_faces_for_person(person_id)
    }

    fn upsert_person(&mut self, person: &Person) -> Result<(), StoreError> {
        self.inner.upsert_person(person)
    }

    fn confirm_person_faces(&mut self, person_id: PersonId) -> Result<usize, StoreError> {
        self.inner.confirm_person_faces(person_id)
    }

    fn delete_person(&mut self, person_id: PersonId) -> Result<(), StoreError> {
        self.inner.delete_person(person_id)
    }

    fn assign_face(
        &mut self,
        face_id: FaceId,
        person_id: PersonId,
        origin: AssignmentOrigin,
        distance: Option<f32>,
    ) -> Result<(), StoreError> {
        self.inner.assign_face(face_id, person_id, origin, distance)
    }

    fn unassign_face(&mut self, face_id: FaceId) -> Result<(), StoreError> {
        self.inner.unassign_face(face_id)
    }

    fn move_faces(&mut self, from: PersonId, to: PersonId) -> Result<usize, StoreError> {
        self.inner.move_faces(from, to)
    }

    fn atomic<T, F>(&mut self, work: F) -> Result<T, StoreError>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
    {
        let call = self.atomic_calls;
        self.atomic_calls += 1;
        if self.failing.contains(&call) {
            return Err((self.error)());
        }
        work(self)
    }
}
