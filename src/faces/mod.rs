pub mod clustering;
pub mod detector;
pub mod embedding;
pub mod merge;
pub mod people;
pub mod processor;
pub mod provider;

pub use clustering::{ClusterDecision, ClusteringEngine, ReclusterSummary};
pub use merge::{auto_merge_provisional, merge_persons, merge_suggestions, MergeSuggestion};
pub use processor::{IndexPipeline, PipelineOptions, RunSummary};
pub use provider::{BackendRegistry, DetectedFace, FaceBackend, FaceEmbeddingProvider, FaceFilter};
