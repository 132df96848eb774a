pub const SCHEMA: &str = r#"
-- Photos table: one row per canonical path
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_at TEXT,
    width INTEGER,
    height INTEGER,
    taken_at TEXT,

    -- 'unseen', 'hashed', 'faces-extracted', 'error'
    state TEXT NOT NULL DEFAULT 'unseen',
    error_message TEXT,

    scanned_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    -- Soft delete: set when a completed scan no longer sees the path
    removed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_photos_hash ON photos(content_hash);
CREATE INDEX IF NOT EXISTS idx_photos_state ON photos(state);

-- Persons: named or provisional ("Unknown N") face groupings
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,                       -- NULL while provisional
    centroid BLOB,                   -- running mean of member embeddings (f32 LE)
    member_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Faces: detected faces with their embedding and current assignment
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,        -- Detection order within the photo
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    backend TEXT NOT NULL,
    confidence REAL,

    -- Assignment: a face belongs to at most one person
    person_id INTEGER,
    origin TEXT,                     -- 'auto-cluster' or 'manual'
    distance REAL,                   -- Cosine distance to the centroid when assigned

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id, ordinal);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);
"#;
