//! ONNX face backend: UltraFace for detection, ArcFace for embeddings.

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use super::embedding::normalize;
use super::provider::{DetectedFace, FaceBackend};
use crate::config::OnnxBackendConfig;
use crate::db::BoundingBox;
use crate::error::IndexError;

const DETECTION_WIDTH: u32 = 320;
const DETECTION_HEIGHT: u32 = 240;
const DETECTION_MIN_SCORE: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.3;
const EMBEDDING_INPUT_SIZE: u32 = 112;

pub struct OnnxBackend {
    name: String,
    embedding_dim: usize,
    cluster_threshold: Option<f32>,
    detection: Mutex<Session>,
    embedding: Mutex<Session>,
}

impl OnnxBackend {
    /// Load both models, downloading missing files when allowed. Any failure
    /// means the backend is unavailable on this machine.
    pub fn load(config: &OnnxBackendConfig, embedding_dim: usize, allow_download: bool) -> Result<Self> {
        ensure_model(&config.detection_model, config.detection_url.as_deref(), allow_download)?;
        ensure_model(&config.embedding_model, config.embedding_url.as_deref(), allow_download)?;

        let detection = open_session(&config.detection_model)?;
        let embedding = open_session(&config.embedding_model)?;

        Ok(Self {
            name: config.name.clone(),
            embedding_dim,
            cluster_threshold: config.cluster_threshold,
            detection: Mutex::new(detection),
            embedding: Mutex::new(embedding),
        })
    }

    fn detect_impl(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let (orig_width, orig_height) = img.dimensions();

        let face_boxes = {
            let mut session = self
                .detection
                .lock()
                .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
            run_ultraface_detection(&mut session, img)?
        };

        if face_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self
            .embedding
            .lock()
            .map_err(|e| anyhow!("Failed to lock embedding model: {}", e))?;

        let mut detected_faces = Vec::with_capacity(face_boxes.len());
        for (bbox, confidence) in face_boxes {
            let face_crop = crop_face(img, &bbox, orig_width, orig_height);

            // A face whose embedding fails is kept with an empty embedding and
            // stays unassigned.
            let embedding = match run_arcface_embedding(&mut session, &face_crop) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(backend = %self.name, error = %e, "Embedding failed for face");
                    Vec::new()
                }
            };

            detected_faces.push(DetectedFace {
                bbox,
                embedding,
                confidence,
            });
        }

        Ok(detected_faces)
    }
}

impl FaceBackend for OnnxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn cluster_threshold(&self) -> Option<f32> {
        self.cluster_threshold
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, IndexError> {
        self.detect_impl(image)
            .map_err(|e| IndexError::Detection(format!("{:#}", e)))
    }
}

fn open_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model {}", path.display()))?;
    Ok(session)
}

/// Download a model file if it doesn't exist
fn ensure_model(path: &Path, url: Option<&str>, allow_download: bool) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let Some(url) = url else {
        bail!("Model {} is missing and has no download URL", path.display());
    };
    if !allow_download {
        bail!("Model {} is missing and downloads are disabled", path.display());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(model = %path.display(), "Downloading model...");
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow!("Failed to download model: {}", e))?;

    // Write beside the target first so an interrupted download never looks
    // like a complete model.
    let partial = path.with_extension("part");
    let mut file = std::fs::File::create(&partial)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    std::fs::rename(&partial, path)?;
    tracing::info!(model = %path.display(), "Model downloaded");

    Ok(())
}

/// Run UltraFace detection model
fn run_ultraface_detection(session: &mut Session, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(DETECTION_WIDTH, DETECTION_HEIGHT, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, normalized to roughly [-1, 1]
    let plane = (DETECTION_HEIGHT * DETECTION_WIDTH) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * DETECTION_WIDTH as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, DETECTION_HEIGHT as usize, DETECTION_WIDTH as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape.get(1).copied().unwrap_or(0).max(0) as usize;
    if scores_data.len() < num_anchors * 2 || boxes_data.len() < num_anchors * 4 {
        bail!("Unexpected UltraFace output shape");
    }

    let mut face_boxes = Vec::new();
    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= DETECTION_MIN_SCORE {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        let x = x1.clamp(0, orig_width as i32);
        let y = y1.clamp(0, orig_height as i32);
        let bbox = BoundingBox {
            x,
            y,
            width: (x2.min(orig_width as i32) - x).max(1),
            height: (y2.min(orig_height as i32) - y).max(1),
        };
        face_boxes.push((bbox, confidence));
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| compute_iou(&kept.0, &candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Compute Intersection over Union between two bounding boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) as i64 * (y2 - y1).max(0) as i64) as f32;
    let union = a.area() as f32 + b.area() as f32 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop face region from image with 20% padding
fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2).max(1) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2).max(1) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run ArcFace embedding model; the result is L2-normalized.
fn run_arcface_embedding(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    let resized = face_img.resize_exact(
        EMBEDDING_INPUT_SIZE,
        EMBEDDING_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let plane = (EMBEDDING_INPUT_SIZE * EMBEDDING_INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * EMBEDDING_INPUT_SIZE as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
        input_data[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, EMBEDDING_INPUT_SIZE as usize, EMBEDDING_INPUT_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    // ArcFace ONNX models name their input "data"
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs.iter().next().ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    normalize(embedding_data).ok_or_else(|| anyhow!("Model produced a zero embedding"))
}
