use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::db::{IndexStore, PersonId, PhotoId};
use crate::scanner::ScanEvent;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    /// Pick the format from a file extension; anything but `.json` is CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ExportFormat::Json,
            _ => ExportFormat::Csv,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }
}

/// One face and the person it belongs to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedAssignment {
    pub photo_id: PhotoId,
    pub path: String,
    pub face_id: i64,
    pub ordinal: u32,
    pub bbox_x: i32,
    pub bbox_y: i32,
    pub bbox_width: i32,
    pub bbox_height: i32,
    pub person_id: Option<PersonId>,
    pub person: Option<String>,
    pub origin: Option<String>,
    pub distance: Option<f32>,
    pub backend: String,
}

/// Export every face of a live photo with its assignment, in clustering
/// order. Returns the number of rows written.
pub fn export_assignments<S: IndexStore>(store: &S, output_path: &Path, format: ExportFormat) -> Result<usize> {
    let rows = collect_assignments(store)?;
    let count = rows.len();

    match format {
        ExportFormat::Json => export_json(&rows, output_path)?,
        ExportFormat::Csv => export_csv(&rows, output_path)?,
    }

    tracing::info!(rows = count, format = format.name(), path = %output_path.display(), "Exported assignments");
    Ok(count)
}

pub fn collect_assignments<S: IndexStore>(store: &S) -> Result<Vec<ExportedAssignment>> {
    let persons: HashMap<PersonId, String> = store
        .get_all_persons()?
        .into_iter()
        .map(|p| (p.id, p.display_name()))
        .collect();

    // None marks a soft-removed photo; its faces are not exported
    let mut paths: HashMap<PhotoId, Option<String>> = HashMap::new();
    let mut rows = Vec::new();
    for face in store.faces_in_cluster_order()? {
        if !paths.contains_key(&face.photo_id) {
            let path = store
                .get_photo(face.photo_id)?
                .filter(|p| !p.is_removed())
                .map(|p| p.path.to_string_lossy().to_string());
            paths.insert(face.photo_id, path);
        }
        let Some(path) = paths.get(&face.photo_id).cloned().flatten() else {
            continue;
        };

        rows.push(ExportedAssignment {
            photo_id: face.photo_id,
            path,
            face_id: face.id,
            ordinal: face.ordinal,
            bbox_x: face.bbox.x,
            bbox_y: face.bbox.y,
            bbox_width: face.bbox.width,
            bbox_height: face.bbox.height,
            person_id: face.person_id,
            person: face.person_id.and_then(|id| persons.get(&id).cloned()),
            origin: face.origin.map(|o| o.as_str().to_string()),
            distance: face.distance,
            backend: face.backend,
        });
    }
    Ok(rows)
}

fn export_json(rows: &[ExportedAssignment], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(rows)?;
    let mut file = File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(rows: &[ExportedAssignment], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    wtr.write_record([
        "photo_id",
        "path",
        "face_id",
        "ordinal",
        "bbox_x",
        "bbox_y",
        "bbox_width",
        "bbox_height",
        "person_id",
        "person",
        "origin",
        "distance",
        "backend",
    ])?;

    for row in rows {
        wtr.write_record([
            &row.photo_id.to_string(),
            &row.path,
            &row.face_id.to_string(),
            &row.ordinal.to_string(),
            &row.bbox_x.to_string(),
            &row.bbox_y.to_string(),
            &row.bbox_width.to_string(),
            &row.bbox_height.to_string(),
            &row.person_id.map(|v| v.to_string()).unwrap_or_default(),
            row.person.as_deref().unwrap_or(""),
            row.origin.as_deref().unwrap_or(""),
            &row.distance.map(|v| format!("{:.4}", v)).unwrap_or_default(),
            &row.backend,
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// CSV log of every event of a run, errors included.
pub struct ScanReport {
    wtr: csv::Writer<File>,
    rows: usize,
}

impl ScanReport {
    pub fn create(path: &Path) -> Result<Self> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create report {}", path.display()))?;
        wtr.write_record(["event", "path", "detail", "error_kind", "reason"])?;
        Ok(Self { wtr, rows: 0 })
    }

    pub fn record(&mut self, event: &ScanEvent) -> Result<()> {
        let path = event.path().to_string_lossy();
        let (detail, kind, reason) = match event {
            ScanEvent::Added { duplicate_of: Some(id), .. } => (format!("duplicate of {}", id), "", ""),
            ScanEvent::Modified { previous_hash, .. } => (format!("previous hash {}", previous_hash), "", ""),
            ScanEvent::Errored { kind, reason, .. } => (String::new(), kind.as_str(), reason.as_str()),
            _ => (String::new(), "", ""),
        };
        self.wtr
            .write_record([event.label(), path.as_ref(), detail.as_str(), kind, reason])?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and return the number of rows written.
    pub fn finish(mut self) -> Result<usize> {
        self.wtr.flush()?;
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        AssignmentOrigin, BoundingBox, ClusterAssignment, NewFace, Person, Photo, ProcessingState, SqliteStore,
    };
    use crate::error::IndexError;
    use tempfile::TempDir;

    fn store_with_faces() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut ada = Person::provisional(1, vec![1.0, 0.0]);
        ada.name = Some("Ada".to_string());
        store.upsert_person(&ada).unwrap();

        let mut photo = Photo::new("/photos/a.jpg", "abc", 10);
        photo.state = ProcessingState::FacesExtracted;
        let photo_id = store.upsert_photo(&photo).unwrap();
        let face = |ordinal: u32, assignment| NewFace {
            ordinal,
            bbox: BoundingBox { x: 0, y: ordinal as i32, width: 8, height: 8 },
            embedding: vec![1.0, 0.0],
            backend: "test".to_string(),
            confidence: Some(0.9),
            assignment,
        };
        store
            .insert_faces(
                photo_id,
                &[
                    face(
                        0,
                        Some(ClusterAssignment {
                            person_id: 1,
                            distance: 0.125,
                            origin: AssignmentOrigin::Manual,
                        }),
                    ),
                    face(1, None),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ExportFormat::from_path(Path::new("out.JSON")), ExportFormat::Json);
        assert_eq!(ExportFormat::from_path(Path::new("out.csv")), ExportFormat::Csv);
        assert_eq!(ExportFormat::from_path(Path::new("out")), ExportFormat::Csv);
    }

    #[test]
    fn test_export_csv() {
        let store = store_with_faces();
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("assignments.csv");

        let count = export_assignments(&store, &out, ExportFormat::Csv).unwrap();
        assert_eq!(count, 2);

        let content = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("photo_id,path,face_id"));
        assert!(lines[1].contains(",1,Ada,manual,0.1250,test"));
        assert!(lines[2].ends_with(",,,,,test"));
    }

    #[test]
    fn test_export_json() {
        let store = store_with_faces();
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("assignments.json");

        export_assignments(&store, &out, ExportFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["person"], "Ada");
        assert!(parsed[1]["person_id"].is_null());
    }

    #[test]
    fn test_export_skips_removed_photos() {
        let mut store = store_with_faces();
        store.mark_removed(Path::new("/photos/a.jpg")).unwrap();
        assert_eq!(store.faces_in_cluster_order().unwrap().len(), 2);

        let rows = collect_assignments(&store).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_scan_report_rows() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("report.csv");

        let mut report = ScanReport::create(&out).unwrap();
        report
            .record(&ScanEvent::Removed {
                path: "/photos/gone.jpg".into(),
            })
            .unwrap();
        report
            .record(&ScanEvent::errored("/photos/bad.jpg", &IndexError::Decode("truncated".into())))
            .unwrap();
        assert_eq!(report.finish().unwrap(), 2);

        let content = std::fs::read_to_string(&out).unwrap();
        assert!(content.contains("removed,/photos/gone.jpg,,,"));
        assert!(content.contains("errored,/photos/bad.jpg,,decode,Cannot decode image: truncated"));
    }
}
