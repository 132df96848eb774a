use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "FACEGALLERY_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub faces: FacesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Library roots scanned when none are given on the command line.
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Size of the hashing thread pool.
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,

    #[serde(default = "default_true")]
    pub follow_symlinks: bool,

    /// Skip face detection for photos whose content already exists under
    /// another path.
    #[serde(default = "default_true")]
    pub skip_duplicate_detection: bool,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp", "heic", "heif", "gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_hash_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_true() -> bool {
    true
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            image_extensions: default_image_extensions(),
            hash_workers: default_hash_workers(),
            follow_symlinks: true,
            skip_duplicate_detection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacesConfig {
    /// Backend names in preference order. Empty means every configured
    /// `[[faces.onnx]]` backend in file order.
    #[serde(default)]
    pub backends: Vec<String>,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Detection workers; backends are not reentrant, so each worker owns
    /// its turn on the model.
    #[serde(default = "default_detect_workers")]
    pub detect_workers: usize,

    /// Maximum cosine distance (inclusive) for joining an existing person.
    #[serde(default = "default_cluster_threshold")]
    pub cluster_threshold: f32,

    /// Looser distance under which two persons are suggested for merging.
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f32,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Smallest face accepted, as a fraction of the image area.
    #[serde(default = "default_min_face_area")]
    pub min_face_area: f32,

    #[serde(default = "default_max_aspect_ratio")]
    pub max_aspect_ratio: f32,

    /// Fetch missing model files from their configured URLs.
    #[serde(default = "default_true")]
    pub allow_download: bool,

    #[serde(default = "default_onnx_backends")]
    pub onnx: Vec<OnnxBackendConfig>,
}

/// An ONNX detection + embedding model pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OnnxBackendConfig {
    pub name: String,
    pub detection_model: PathBuf,
    #[serde(default)]
    pub detection_url: Option<String>,
    pub embedding_model: PathBuf,
    #[serde(default)]
    pub embedding_url: Option<String>,
    #[serde(default)]
    pub cluster_threshold: Option<f32>,
}

fn default_embedding_dim() -> usize {
    512
}

fn default_detect_workers() -> usize {
    1
}

fn default_cluster_threshold() -> f32 {
    0.40
}

fn default_merge_threshold() -> f32 {
    0.55
}

fn default_min_confidence() -> f32 {
    0.7
}

fn default_min_face_area() -> f32 {
    0.0004
}

fn default_max_aspect_ratio() -> f32 {
    2.0
}

fn models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facegallery")
        .join("models")
}

fn default_onnx_backends() -> Vec<OnnxBackendConfig> {
    let dir = models_dir();
    vec![OnnxBackendConfig {
        name: "ultraface-arcface".to_string(),
        detection_model: dir.join("ultraface-320.onnx"),
        detection_url: Some(
            "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx"
                .to_string(),
        ),
        embedding_model: dir.join("arcface-resnet100.onnx"),
        embedding_url: Some(
            "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx"
                .to_string(),
        ),
        cluster_threshold: None,
    }]
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            embedding_dim: default_embedding_dim(),
            detect_workers: default_detect_workers(),
            cluster_threshold: default_cluster_threshold(),
            merge_threshold: default_merge_threshold(),
            min_confidence: default_min_confidence(),
            min_face_area: default_min_face_area(),
            max_aspect_ratio: default_max_aspect_ratio(),
            allow_download: true,
            onnx: default_onnx_backends(),
        }
    }
}

impl FacesConfig {
    /// Backend names to try, in order.
    pub fn preference_order(&self) -> Vec<String> {
        if self.backends.is_empty() {
            self.onnx.iter().map(|b| b.name.clone()).collect()
        } else {
            self.backends.clone()
        }
    }

    /// Cluster threshold of the most preferred backend, for work that runs
    /// without loading a model.
    pub fn preferred_threshold(&self) -> f32 {
        self.preference_order()
            .first()
            .and_then(|name| self.onnx.iter().find(|b| &b.name == name))
            .and_then(|b| b.cluster_threshold)
            .unwrap_or(self.cluster_threshold)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facegallery")
        .join("index.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scanner: ScannerConfig::default(),
            faces: FacesConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load the config at `path`, writing out defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facegallery")
            .join("config.toml")
    }
}
