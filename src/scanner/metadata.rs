use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::time::SystemTime;

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Facts about a photo gathered alongside its hash. Every field is optional:
/// a file whose header cannot be read is still indexed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub modified_at: Option<DateTime<Utc>>,
    /// EXIF `DateTimeOriginal`, or the mtime when the file carries none.
    pub taken_at: Option<NaiveDateTime>,
}

pub fn extract_metadata(path: &Path, modified: Option<SystemTime>) -> ImageMetadata {
    let mut metadata = ImageMetadata {
        modified_at: modified.map(DateTime::<Utc>::from),
        ..Default::default()
    };

    if let Ok(reader) = image::ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        match reader.into_dimensions() {
            Ok((width, height)) => {
                metadata.width = Some(width);
                metadata.height = Some(height);
            }
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "Cannot read image dimensions"),
        }
    }

    metadata.taken_at = File::open(path)
        .ok()
        .and_then(|file| {
            let mut bufreader = BufReader::new(file);
            exif::Reader::new().read_from_container(&mut bufreader).ok()
        })
        .and_then(|exif| date_time_original(&exif))
        .or_else(|| metadata.modified_at.map(|m| m.naive_utc()));

    metadata
}

fn date_time_original(exif: &exif::Exif) -> Option<NaiveDateTime> {
    let field = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Ascii(values) => {
            let raw = values.first()?;
            let text = std::str::from_utf8(raw).ok()?;
            parse_exif_datetime(text)
        }
        _ => None,
    }
}

pub fn parse_exif_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim().trim_matches('\0'), EXIF_DATETIME_FORMAT).ok()
}

/// EXIF orientation (1-8) of an encoded image; 1 when absent.
pub fn exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|exif| {
            exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .filter(|o| (1..=8).contains(o))
        .unwrap_or(1)
}
