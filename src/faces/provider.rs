//! Face detection + embedding capability, polymorphic over backends.
//!
//! Backends are probed once at startup in preference order; the first one that
//! loads serves the whole run. A failure on an individual image never
//! switches backend.

use image::{DynamicImage, GenericImageView};
use std::sync::Arc;

use crate::config::FacesConfig;
use crate::db::BoundingBox;
use crate::error::IndexError;
use crate::scanner::metadata::exif_orientation;

/// A detected face with bounding box and embedding
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// A face detection + embedding model.
///
/// Implementations need not be reentrant; concurrent calls must serialize
/// internally.
pub trait FaceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every embedding this backend produces.
    fn embedding_dim(&self) -> usize;

    /// Clustering threshold calibrated for this backend's embedding space.
    fn cluster_threshold(&self) -> Option<f32> {
        None
    }

    /// Detect faces in an upright, decoded image. Bounding boxes are in the
    /// image's pixel space.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, IndexError>;
}

/// Loads a backend at startup; an error means the backend is unavailable.
pub type BackendLoader = Box<dyn FnOnce() -> anyhow::Result<Arc<dyn FaceBackend>>>;

/// Named backends that can be probed.
#[derive(Default)]
pub struct BackendRegistry {
    loaders: Vec<(String, BackendLoader)>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `[[faces.onnx]]` backend from the config.
    pub fn from_config(config: &FacesConfig) -> Self {
        let mut registry = Self::new();
        for backend in &config.onnx {
            let backend = backend.clone();
            let dim = config.embedding_dim;
            let allow_download = config.allow_download;
            registry.register(backend.name.clone(), move || {
                let loaded = super::detector::OnnxBackend::load(&backend, dim, allow_download)?;
                Ok(Arc::new(loaded) as Arc<dyn FaceBackend>)
            });
        }
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, loader: F)
    where
        F: FnOnce() -> anyhow::Result<Arc<dyn FaceBackend>> + 'static,
    {
        self.loaders.push((name.into(), Box::new(loader)));
    }

    pub fn names(&self) -> Vec<&str> {
        self.loaders.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn take(&mut self, name: &str) -> Option<BackendLoader> {
        let index = self.loaders.iter().position(|(n, _)| n == name)?;
        Some(self.loaders.remove(index).1)
    }
}

/// Uniform post-detection filter applied to every backend's output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceFilter {
    pub min_confidence: f32,
    /// Fraction of the image area.
    pub min_face_area: f32,
    pub max_aspect_ratio: f32,
}

impl FaceFilter {
    pub fn from_config(config: &FacesConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            min_face_area: config.min_face_area,
            max_aspect_ratio: config.max_aspect_ratio,
        }
    }

    /// Accept everything with a non-empty box.
    pub fn permissive() -> Self {
        Self {
            min_confidence: 0.0,
            min_face_area: 0.0,
            max_aspect_ratio: f32::INFINITY,
        }
    }

    pub fn accepts(&self, face: &DetectedFace, image_width: u32, image_height: u32) -> bool {
        let bbox = &face.bbox;
        if bbox.width <= 0 || bbox.height <= 0 {
            return false;
        }
        if face.confidence < self.min_confidence {
            return false;
        }

        let image_area = image_width as f64 * image_height as f64;
        if image_area > 0.0 && (bbox.area() as f64 / image_area) < self.min_face_area as f64 {
            return false;
        }

        let (w, h) = (bbox.width as f32, bbox.height as f32);
        w.max(h) / w.min(h) <= self.max_aspect_ratio
    }
}

/// Rotate/flip an image so it displays upright for the given EXIF orientation.
pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// The backend selected for this run plus the uniform filter.
pub struct FaceEmbeddingProvider {
    backend: Arc<dyn FaceBackend>,
    filter: FaceFilter,
}

impl FaceEmbeddingProvider {
    pub fn new(backend: Arc<dyn FaceBackend>, filter: FaceFilter) -> Self {
        Self { backend, filter }
    }

    /// Probe backends in `preference` order and keep the first that loads.
    pub fn select(
        mut registry: BackendRegistry,
        preference: &[String],
        filter: FaceFilter,
    ) -> Result<Self, IndexError> {
        let mut tried = Vec::new();
        for name in preference {
            tried.push(name.clone());
            let Some(loader) = registry.take(name) else {
                tracing::warn!(backend = %name, "Face backend is not configured");
                continue;
            };
            match loader() {
                Ok(backend) => {
                    tracing::info!(
                        backend = %backend.name(),
                        dim = backend.embedding_dim(),
                        "Face backend selected"
                    );
                    return Ok(Self::new(backend, filter));
                }
                Err(e) => {
                    tracing::warn!(backend = %name, error = %format!("{:#}", e), "Face backend unavailable");
                }
            }
        }

        Err(IndexError::DetectorUnavailable {
            tried: if tried.is_empty() {
                "none configured".to_string()
            } else {
                tried.join(", ")
            },
        })
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn embedding_dim(&self) -> usize {
        self.backend.embedding_dim()
    }

    /// The backend's own threshold, or `default`.
    pub fn cluster_threshold(&self, default: f32) -> f32 {
        self.backend.cluster_threshold().unwrap_or(default)
    }

    /// Decode `bytes`, orient upright and detect faces. An empty result is
    /// valid; undecodable input is a [`IndexError::Decode`].
    pub fn detect(&self, bytes: &[u8]) -> Result<Vec<DetectedFace>, IndexError> {
        let decoded = image::load_from_memory(bytes).map_err(|e| IndexError::Decode(e.to_string()))?;
        let image = apply_orientation(decoded, exif_orientation(bytes));
        let (width, height) = image.dimensions();

        let faces = self.backend.detect(&image)?;
        let detected = faces.len();
        let kept: Vec<DetectedFace> = faces
            .into_iter()
            .filter(|face| self.filter.accepts(face, width, height))
            .collect();

        if kept.len() < detected {
            tracing::debug!(detected, kept = kept.len(), "Filtered face detections");
        }
        Ok(kept)
    }
}
