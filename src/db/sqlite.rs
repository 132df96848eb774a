//! SQLite backend implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

use super::faces::{
    embedding_to_bytes, face_from_row, person_from_row, AssignmentOrigin, Face, NewFace, Person,
    FACE_COLUMNS, PERSON_COLUMNS,
};
use super::schema::SCHEMA;
use super::{FaceId, IndexStore, PersonId, Photo, PhotoId, ProcessingState};
use crate::error::StoreError;

const TAKEN_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const PHOTO_COLUMNS: &str = "id, path, content_hash, size_bytes, modified_at, width, height, \
     taken_at, state, error_message, removed_at";

pub struct SqliteStore {
    pub(crate) conn: Connection,
    tx_depth: u32,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("cannot open {}: {}", path.display(), e)))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    /// Private in-memory index, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn, tx_depth: 0 };
        store.initialize()?;
        Ok(store)
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn query_photos(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Photo>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let photos = stmt
            .query_map(params, photo_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<Photo> {
    let path: String = row.get(1)?;
    let size_bytes: i64 = row.get(3)?;
    let modified_at: Option<String> = row.get(4)?;
    let taken_at: Option<String> = row.get(7)?;
    let state: String = row.get(8)?;
    let removed_at: Option<String> = row.get(10)?;

    Ok(Photo {
        id: row.get(0)?,
        path: PathBuf::from(path),
        content_hash: row.get(2)?,
        size_bytes: size_bytes.max(0) as u64,
        modified_at: modified_at.as_deref().and_then(parse_timestamp),
        width: row.get(5)?,
        height: row.get(6)?,
        taken_at: taken_at
            .as_deref()
            .and_then(|t| NaiveDateTime::parse_from_str(t, TAKEN_AT_FORMAT).ok()),
        state: ProcessingState::parse(&state).unwrap_or(ProcessingState::Unseen),
        error: row.get(9)?,
        removed_at: removed_at.as_deref().and_then(parse_timestamp),
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

impl IndexStore for SqliteStore {
    fn get_photo_by_path(&self, path: &Path) -> Result<Option<Photo>, StoreError> {
        let sql = format!("SELECT {} FROM photos WHERE path = ?", PHOTO_COLUMNS);
        Ok(self.conn.query_row(&sql, [path_key(path)], photo_from_row).optional()?)
    }

    fn get_photo(&self, photo_id: PhotoId) -> Result<Option<Photo>, StoreError> {
        let sql = format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS);
        Ok(self.conn.query_row(&sql, [photo_id], photo_from_row).optional()?)
    }

    fn find_photo_by_hash(&self, hash: &str, exclude: PhotoId) -> Result<Option<Photo>, StoreError> {
        let sql = format!(
            "SELECT {} FROM photos WHERE content_hash = ? AND id != ? AND removed_at IS NULL \
             ORDER BY id LIMIT 1",
            PHOTO_COLUMNS
        );
        Ok(self.conn.query_row(&sql, params![hash, exclude], photo_from_row).optional()?)
    }

    fn photos_with_hash(&self, hash: &str) -> Result<Vec<Photo>, StoreError> {
        let sql = format!(
            "SELECT {} FROM photos WHERE content_hash = ? AND removed_at IS NULL ORDER BY id",
            PHOTO_COLUMNS
        );
        self.query_photos(&sql, params![hash])
    }

    fn upsert_photo(&mut self, photo: &Photo) -> Result<PhotoId, StoreError> {
        let path = path_key(&photo.path);
        self.conn.execute(
            r#"
            INSERT INTO photos (
                path, content_hash, size_bytes, modified_at, width, height, taken_at,
                state, error_message, removed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                width = excluded.width,
                height = excluded.height,
                taken_at = excluded.taken_at,
                state = excluded.state,
                error_message = excluded.error_message,
                removed_at = NULL,
                scanned_at = CURRENT_TIMESTAMP
            "#,
            params![
                path,
                photo.content_hash,
                photo.size_bytes as i64,
                photo.modified_at.map(|t| t.to_rfc3339()),
                photo.width,
                photo.height,
                photo.taken_at.map(|t| t.format(TAKEN_AT_FORMAT).to_string()),
                photo.state.as_str(),
                photo.error,
            ],
        )?;

        let id = self
            .conn
            .query_row("SELECT id FROM photos WHERE path = ?", [path], |row| row.get(0))?;
        Ok(id)
    }

    fn mark_removed(&mut self, path: &Path) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE photos SET removed_at = ? WHERE path = ? AND removed_at IS NULL",
            params![Utc::now().to_rfc3339(), path_key(path)],
        )?;
        Ok(())
    }

    fn photos_under(&self, root: &Path) -> Result<Vec<Photo>, StoreError> {
        let root_str = path_key(root);
        let prefix = if root_str.ends_with(std::path::MAIN_SEPARATOR) {
            root_str.clone()
        } else {
            format!("{}{}", root_str, std::path::MAIN_SEPARATOR)
        };
        // substr() instead of LIKE so '%' and '_' in paths match literally
        let sql = format!(
            "SELECT {} FROM photos WHERE removed_at IS NULL \
             AND (path = ?1 OR substr(path, 1, length(?2)) = ?2) ORDER BY path",
            PHOTO_COLUMNS
        );
        self.query_photos(&sql, params![root_str, prefix])
    }

    fn pending_photos(&self) -> Result<Vec<Photo>, StoreError> {
        let sql = format!(
            "SELECT {} FROM photos WHERE removed_at IS NULL AND state IN ('unseen', 'hashed') \
             ORDER BY id",
            PHOTO_COLUMNS
        );
        self.query_photos(&sql, [])
    }

    fn set_photo_state(
        &mut self,
        photo_id: PhotoId,
        state: ProcessingState,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE photos SET state = ?, error_message = ? WHERE id = ?",
            params![state.as_str(), error, photo_id],
        )?;
        Ok(())
    }

    fn insert_faces(&mut self, photo_id: PhotoId, faces: &[NewFace]) -> Result<Vec<FaceId>, StoreError> {
        let mut ids = Vec::with_capacity(faces.len());
        let mut stmt = self.conn.prepare(
            r#"
            INSERT INTO faces (
                photo_id, ordinal, bbox_x, bbox_y, bbox_w, bbox_h,
                embedding, embedding_dim, backend, confidence,
                person_id, origin, distance
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )?;

        for face in faces {
            stmt.execute(params![
                photo_id,
                face.ordinal,
                face.bbox.x,
                face.bbox.y,
                face.bbox.width,
                face.bbox.height,
                embedding_to_bytes(&face.embedding),
                face.embedding.len() as i64,
                face.backend,
                face.confidence.map(|c| c as f64),
                face.assignment.map(|a| a.person_id),
                face.assignment.map(|a| a.origin.as_str()),
                face.assignment.map(|a| a.distance as f64),
            ])?;
            ids.push(self.conn.last_insert_rowid());
        }

        Ok(ids)
    }

    fn delete_faces_for_photo(&mut self, photo_id: PhotoId) -> Result<usize, StoreError> {
        Ok(self.conn.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?)
    }

    fn delete_face(&mut self, face_id: FaceId) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM faces WHERE id = ?", [face_id])?;
        Ok(())
    }

    fn get_faces_for_photo(&self, photo_id: PhotoId) -> Result<Vec<Face>, StoreError> {
        let sql = format!(
            "SELECT {} FROM faces WHERE photo_id = ? ORDER BY ordinal",
            FACE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([photo_id], face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    fn get_face(&self, face_id: FaceId) -> Result<Option<Face>, StoreError> {
        let sql = format!("SELECT {} FROM faces WHERE id = ?", FACE_COLUMNS);
        Ok(self.conn.query_row(&sql, [face_id], face_from_row).optional()?)
    }

    fn faces_in_cluster_order(&self) -> Result<Vec<Face>, StoreError> {
        let sql = format!(
            "SELECT {} FROM faces ORDER BY photo_id, ordinal, id",
            FACE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([], face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    fn get_all_persons(&self) -> Result<Vec<Person>, StoreError> {
        let sql = format!("SELECT {} FROM persons ORDER BY id", PERSON_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let persons = stmt
            .query_map([], person_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(persons)
    }

    fn confirm_person_faces(&mut self, person_id: PersonId) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "UPDATE faces SET origin = ? WHERE person_id = ? AND origin = ?",
            params![
                AssignmentOrigin::Manual.as_str(),
                person_id,
                AssignmentOrigin::AutoCluster.as_str()
            ],
        )?)
    }

    fn get_person(&self, person_id: PersonId) -> Result<Option<Person>, StoreError> {
        let sql = format!("SELECT {} FROM persons WHERE id = ?", PERSON_COLUMNS);
        Ok(self.conn.query_row(&sql, [person_id], person_from_row).optional()?)
    }

    fn get_faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>, StoreError> {
        let sql = format!(
            "SELECT {} FROM faces WHERE person_id = ? ORDER BY photo_id, ordinal",
            FACE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([person_id], face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    fn upsert_person(&mut self, person: &Person) -> Result<(), StoreError> {
        let centroid = if person.centroid.is_empty() {
            None
        } else {
            Some(embedding_to_bytes(&person.centroid))
        };
        self.conn.execute(
            r#"
            INSERT INTO persons (id, name, centroid, member_count)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                centroid = excluded.centroid,
                member_count = excluded.member_count,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![person.id, person.name, centroid, person.member_count],
        )?;
        Ok(())
    }

    fn delete_person(&mut self, person_id: PersonId) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE faces SET person_id = NULL, origin = NULL, distance = NULL WHERE person_id = ?",
            [person_id],
        )?;
        self.conn.execute("DELETE FROM persons WHERE id = ?", [person_id])?;
        Ok(())
    }

    fn assign_face(
        &mut self,
        face_id: FaceId,
        person_id: PersonId,
        origin: AssignmentOrigin,
        distance: Option<f32>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE faces SET person_id = ?, origin = ?, distance = ? WHERE id = ?",
            params![person_id, origin.as_str(), distance.map(|d| d as f64), face_id],
        )?;
        if changed == 0 {
            return Err(StoreError::Corrupt(format!("face {} does not exist", face_id)));
        }
        Ok(())
    }

    fn unassign_face(&mut self, face_id: FaceId) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE faces SET person_id = NULL, origin = NULL, distance = NULL WHERE id = ?",
            [face_id],
        )?;
        Ok(())
    }

    fn move_faces(&mut self, from: PersonId, to: PersonId) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "UPDATE faces SET person_id = ? WHERE person_id = ?",
            params![to, from],
        )?)
    }

    fn atomic<T, F>(&mut self, work: F) -> Result<T, StoreError>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
    {
        // Nested calls join the enclosing transaction
        if self.tx_depth > 0 {
            return work(self);
        }

        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.tx_depth += 1;
        let result = work(self);
        self.tx_depth -= 1;

        match result {
            Ok(value) => match self.conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BoundingBox, ClusterAssignment};

    fn photo(path: &str, hash: &str) -> Photo {
        let mut p = Photo::new(path, hash, 100);
        p.state = ProcessingState::Hashed;
        p
    }

    fn new_face(ordinal: u32, embedding: Vec<f32>) -> NewFace {
        NewFace {
            ordinal,
            bbox: BoundingBox { x: 1, y: 2, width: 30, height: 40 },
            embedding,
            backend: "test".to_string(),
            confidence: Some(0.9),
            assignment: None,
        }
    }

    #[test]
    fn test_upsert_photo_keeps_identity() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.upsert_photo(&photo("/lib/a.jpg", "h1")).unwrap();
        let again = store.upsert_photo(&photo("/lib/a.jpg", "h2")).unwrap();
        assert_eq!(id, again);

        let stored = store.get_photo_by_path(Path::new("/lib/a.jpg")).unwrap().unwrap();
        assert_eq!(stored.content_hash, "h2");
        assert_eq!(stored.state, ProcessingState::Hashed);
    }

    #[test]
    fn test_mark_removed_is_soft() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.upsert_photo(&photo("/lib/a.jpg", "h1")).unwrap();
        store.insert_faces(id, &[new_face(0, vec![1.0, 0.0])]).unwrap();

        store.mark_removed(Path::new("/lib/a.jpg")).unwrap();
        let stored = store.get_photo(id).unwrap().unwrap();
        assert!(stored.is_removed());
        assert_eq!(store.get_faces_for_photo(id).unwrap().len(), 1);
        assert!(store.photos_under(Path::new("/lib")).unwrap().is_empty());

        // Seeing the path again revives the same row
        let revived = store.upsert_photo(&photo("/lib/a.jpg", "h1")).unwrap();
        assert_eq!(revived, id);
        assert!(!store.get_photo(id).unwrap().unwrap().is_removed());
    }

    #[test]
    fn test_photos_with_hash_skips_removed() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let a = store.upsert_photo(&photo("/lib/a.jpg", "h1")).unwrap();
        let b = store.upsert_photo(&photo("/lib/b.jpg", "h1")).unwrap();
        let c = store.upsert_photo(&photo("/lib/c.jpg", "h1")).unwrap();
        store.upsert_photo(&photo("/lib/d.jpg", "h2")).unwrap();
        store.insert_faces(a, &[new_face(0, vec![1.0, 0.0])]).unwrap();
        store.mark_removed(Path::new("/lib/a.jpg")).unwrap();

        let ids: Vec<_> = store.photos_with_hash("h1").unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![b, c]);
        // Faces of the removed photo are still in clustering order
        assert_eq!(store.faces_in_cluster_order().unwrap().len(), 1);
    }

    #[test]
    fn test_photos_under_matches_prefix_literally() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.upsert_photo(&photo("/lib/a_b/x.jpg", "h1")).unwrap();
        store.upsert_photo(&photo("/lib/aXb/y.jpg", "h2")).unwrap();
        store.upsert_photo(&photo("/lib/a_b2/z.jpg", "h3")).unwrap();

        let under = store.photos_under(Path::new("/lib/a_b")).unwrap();
        assert_eq!(under.len(), 1);
        assert_eq!(under[0].path, PathBuf::from("/lib/a_b/x.jpg"));
    }

    #[test]
    fn test_faces_and_assignments() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let photo_id = store.upsert_photo(&photo("/lib/a.jpg", "h1")).unwrap();
        store.upsert_person(&Person::provisional(1, vec![1.0, 0.0])).unwrap();

        let mut face = new_face(0, vec![1.0, 0.0]);
        face.assignment = Some(ClusterAssignment {
            person_id: 1,
            distance: 0.0,
            origin: AssignmentOrigin::AutoCluster,
        });
        let ids = store.insert_faces(photo_id, &[face, new_face(1, vec![0.0, 1.0])]).unwrap();
        assert_eq!(ids.len(), 2);

        let faces = store.get_faces_for_photo(photo_id).unwrap();
        assert_eq!(faces[0].person_id, Some(1));
        assert_eq!(faces[0].origin, Some(AssignmentOrigin::AutoCluster));
        assert_eq!(faces[1].person_id, None);

        store.assign_face(ids[1], 1, AssignmentOrigin::Manual, None).unwrap();
        assert!(store.get_face(ids[1]).unwrap().unwrap().is_manual());

        assert_eq!(store.get_faces_for_person(1).unwrap().len(), 2);
        store.delete_person(1).unwrap();
        assert!(store.get_faces_for_photo(photo_id).unwrap().iter().all(|f| f.person_id.is_none()));
    }

    #[test]
    fn test_atomic_rolls_back_on_error() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.atomic(|s| {
            s.upsert_photo(&photo("/lib/a.jpg", "h1"))?;
            Err(StoreError::Corrupt("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.get_photo_by_path(Path::new("/lib/a.jpg")).unwrap().is_none());

        store
            .atomic(|s| s.upsert_photo(&photo("/lib/a.jpg", "h1")).map(|_| ()))
            .unwrap();
        assert!(store.get_photo_by_path(Path::new("/lib/a.jpg")).unwrap().is_some());
    }

    #[test]
    fn test_person_centroid_roundtrip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut person = Person::provisional(4, vec![0.5, 0.25]);
        person.member_count = 3;
        store.upsert_person(&person).unwrap();

        let persons = store.get_all_persons().unwrap();
        assert_eq!(persons, vec![person.clone()]);

        person.name = Some("Grace".to_string());
        store.upsert_person(&person).unwrap();
        assert_eq!(store.get_person(4).unwrap().unwrap().display_name(), "Grace");
    }
}
