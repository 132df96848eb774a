//! Human corrections to the automatic grouping.
//!
//! Every operation updates the engine first, writes the affected rows in one
//! transaction, and rolls the engine back if that write fails.

use super::clustering::ClusteringEngine;
use crate::db::{with_retry, AssignmentOrigin, Face, FaceId, IndexStore, Person, PersonId};
use crate::error::IndexError;

/// Summary row for listing persons.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonOverview {
    pub person: Person,
    pub faces: usize,
    pub manual_faces: usize,
}

/// Every person with its face counts, ascending by id.
pub fn list_persons<S: IndexStore>(store: &S) -> Result<Vec<PersonOverview>, IndexError> {
    let persons = with_retry("get_all_persons", || store.get_all_persons())?;
    let mut overview = Vec::with_capacity(persons.len());
    for person in persons {
        let faces = with_retry("get_faces_for_person", || store.get_faces_for_person(person.id))?;
        overview.push(PersonOverview {
            faces: faces.len(),
            manual_faces: faces.iter().filter(|f| f.is_manual()).count(),
            person,
        });
    }
    Ok(overview)
}

/// Put a face in `person_id` by hand. The assignment is manual from then on
/// and survives every automatic pass.
pub fn assign_face<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    face_id: FaceId,
    person_id: PersonId,
) -> Result<Face, IndexError> {
    let face = with_retry("get_face", || store.get_face(face_id))?
        .ok_or_else(|| IndexError::NotFound(format!("face {}", face_id)))?;

    let checkpoint = engine.checkpoint();
    let distance = engine.reassign_manual(&face, person_id)?;
    let persons = engine.dirty_persons();

    let written = with_retry("assign_face", || {
        store.atomic(|s| {
            for person in &persons {
                s.upsert_person(person)?;
            }
            s.assign_face(face_id, person_id, AssignmentOrigin::Manual, distance)
        })
    });
    if let Err(e) = written {
        engine.restore(checkpoint);
        return Err(e.into());
    }
    engine.clear_dirty();

    tracing::info!(face = face_id, person = person_id, previous = ?face.person_id, "Assigned face manually");
    Ok(Face {
        person_id: Some(person_id),
        origin: Some(AssignmentOrigin::Manual),
        distance,
        ..face
    })
}

/// Name a person, or make it provisional again with `None`. Naming also
/// confirms every face currently in the person, so a later re-cluster keeps
/// them.
pub fn rename_person<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    person_id: PersonId,
    name: Option<&str>,
) -> Result<Person, IndexError> {
    let name = name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);

    let checkpoint = engine.checkpoint();
    let person = engine.set_name(person_id, name)?.clone();

    let written = with_retry("rename_person", || {
        store.atomic(|s| {
            s.upsert_person(&person)?;
            if person.name.is_some() {
                s.confirm_person_faces(person.id)?;
            }
            Ok(())
        })
    });
    if let Err(e) = written {
        engine.restore(checkpoint);
        return Err(e.into());
    }
    engine.clear_dirty();

    tracing::info!(person = person_id, name = %person.display_name(), "Renamed person");
    Ok(person)
}

/// Delete a person. Its faces stay in the index, unassigned, until the next
/// re-cluster picks them up.
pub fn delete_person<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    person_id: PersonId,
) -> Result<Person, IndexError> {
    let person = engine
        .person(person_id)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(format!("person {}", person_id)))?;

    with_retry("delete_person", || store.atomic(|s| s.delete_person(person_id)))?;
    engine.remove_person(person_id);

    tracing::info!(person = person_id, "Deleted person");
    Ok(person)
}

/// Create a person from hand-picked faces. The faces leave their current
/// persons and become manual members of the new one.
pub fn create_person<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    name: Option<&str>,
    face_ids: &[FaceId],
) -> Result<Person, IndexError> {
    let name = name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);

    let mut faces = Vec::with_capacity(face_ids.len());
    for &face_id in face_ids {
        if faces.iter().any(|f: &Face| f.id == face_id) {
            continue;
        }
        let face = with_retry("get_face", || store.get_face(face_id))?
            .ok_or_else(|| IndexError::NotFound(format!("face {}", face_id)))?;
        faces.push(face);
    }

    let checkpoint = engine.checkpoint();
    let person_id = engine.create_person(name);
    let mut moved = Vec::with_capacity(faces.len());
    for face in &faces {
        match engine.reassign_manual(face, person_id) {
            Ok(distance) => moved.push((face.id, distance)),
            Err(e) => {
                engine.restore(checkpoint);
                return Err(e);
            }
        }
    }
    let persons = engine.dirty_persons();

    let written = with_retry("create_person", || {
        store.atomic(|s| {
            for person in &persons {
                s.upsert_person(person)?;
            }
            for (face_id, distance) in &moved {
                s.assign_face(*face_id, person_id, AssignmentOrigin::Manual, *distance)?;
            }
            Ok(())
        })
    });
    if let Err(e) = written {
        engine.restore(checkpoint);
        return Err(e.into());
    }
    engine.clear_dirty();

    let person = engine
        .person(person_id)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(format!("person {}", person_id)))?;
    tracing::info!(person = person_id, name = %person.display_name(), faces = moved.len(), "Created person");
    Ok(person)
}

/// Delete a false detection. Its person's centroid drops the embedding
/// without a recomputation over the remaining members.
pub fn delete_face<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    face_id: FaceId,
) -> Result<Face, IndexError> {
    let face = with_retry("get_face", || store.get_face(face_id))?
        .ok_or_else(|| IndexError::NotFound(format!("face {}", face_id)))?;

    let checkpoint = engine.checkpoint();
    engine.detach(&face);
    let persons = engine.dirty_persons();

    let written = with_retry("delete_face", || {
        store.atomic(|s| {
            s.delete_face(face_id)?;
            for person in &persons {
                s.upsert_person(person)?;
            }
            Ok(())
        })
    });
    if let Err(e) = written {
        engine.restore(checkpoint);
        return Err(e.into());
    }
    engine.clear_dirty();

    tracing::info!(face = face_id, person = ?face.person_id, "Deleted face");
    Ok(face)
}
