//! Face, person and assignment records plus their SQLite row mapping.

use rusqlite::Row;

use super::{FaceId, PersonId, PhotoId};
use crate::error::StoreError;

/// Bounding box for a detected face, in pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Sort key for the stable in-photo face order: top-to-bottom, then
    /// left-to-right.
    pub fn order_key(&self) -> (i32, i32, i32, i32) {
        (self.y, self.x, self.height, self.width)
    }
}

/// How a face came to belong to its person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignmentOrigin {
    AutoCluster,
    /// Set by a human; never changed by the automatic pass.
    Manual,
}

impl AssignmentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentOrigin::AutoCluster => "auto-cluster",
            AssignmentOrigin::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto-cluster" => Some(AssignmentOrigin::AutoCluster),
            "manual" => Some(AssignmentOrigin::Manual),
            _ => None,
        }
    }
}

/// Link between a face and a person.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterAssignment {
    pub person_id: PersonId,
    pub distance: f32,
    pub origin: AssignmentOrigin,
}

/// A detected face in a photo
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub id: FaceId,
    pub photo_id: PhotoId,
    pub ordinal: u32,
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub backend: String,
    pub confidence: Option<f32>,
    pub person_id: Option<PersonId>,
    pub origin: Option<AssignmentOrigin>,
    pub distance: Option<f32>,
}

impl Face {
    pub fn is_manual(&self) -> bool {
        self.origin == Some(AssignmentOrigin::Manual)
    }
}

/// A face about to be inserted, with the assignment decided for it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFace {
    pub ordinal: u32,
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub backend: String,
    pub confidence: Option<f32>,
    pub assignment: Option<ClusterAssignment>,
}

/// A person: named, or provisional while `name` is `None`
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: PersonId,
    pub name: Option<String>,
    /// Running mean of member embeddings; empty when the person has no members.
    pub centroid: Vec<f32>,
    pub member_count: u32,
}

impl Person {
    pub fn provisional(id: PersonId, centroid: Vec<f32>) -> Self {
        Self {
            id,
            name: None,
            centroid,
            member_count: 1,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.name.is_none()
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("Unknown {}", self.id),
        }
    }
}

pub(crate) const FACE_COLUMNS: &str = "id, photo_id, ordinal, bbox_x, bbox_y, bbox_w, bbox_h, \
     embedding, backend, confidence, person_id, origin, distance";

pub(crate) fn face_from_row(row: &Row<'_>) -> rusqlite::Result<Face> {
    let embedding: Vec<u8> = row.get(7)?;
    let origin: Option<String> = row.get(11)?;
    let distance: Option<f64> = row.get(12)?;
    let confidence: Option<f64> = row.get(9)?;
    Ok(Face {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        ordinal: row.get(2)?,
        bbox: BoundingBox {
            x: row.get(3)?,
            y: row.get(4)?,
            width: row.get(5)?,
            height: row.get(6)?,
        },
        embedding: blob_to_embedding(7, &embedding)?,
        backend: row.get(8)?,
        confidence: confidence.map(|c| c as f32),
        person_id: row.get(10)?,
        origin: origin.as_deref().and_then(AssignmentOrigin::parse),
        distance: distance.map(|d| d as f32),
    })
}

pub(crate) const PERSON_COLUMNS: &str = "id, name, centroid, member_count";

pub(crate) fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    let centroid: Option<Vec<u8>> = row.get(2)?;
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        centroid: match centroid {
            Some(bytes) => blob_to_embedding(2, &bytes)?,
            None => Vec::new(),
        },
        member_count: row.get(3)?,
    })
}

fn blob_to_embedding(column: usize, bytes: &[u8]) -> rusqlite::Result<Vec<f32>> {
    checked_embedding(bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Blob, Box::new(e))
    })
}

/// Convert f32 vector to little-endian bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector; a trailing partial value is ignored
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Validate a blob read back from the store.
pub fn checked_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes_to_embedding(bytes))
}
