//! Incremental greedy nearest-centroid clustering.
//!
//! Faces are assigned one at a time: a face joins the person whose centroid is
//! nearest by cosine distance when that distance is within the threshold
//! (inclusive), otherwise it founds a new provisional person. Centroids are
//! running means updated in O(1) per membership change. Ties go to the lowest
//! person id.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::embedding::{cosine_distance, mean_add, mean_remove, normalize};
use crate::db::{with_retry, AssignmentOrigin, Face, FaceId, IndexStore, Person, PersonId};
use crate::error::{IndexError, StoreError};

/// Where the engine put a face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterDecision {
    pub person_id: PersonId,
    /// Distance to the centroid before the face was added; 0 for a new person.
    pub distance: f32,
    pub created: bool,
}

/// Engine state saved before a unit of work so a failed commit can be undone.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    persons: BTreeMap<PersonId, Person>,
    next_id: PersonId,
    dirty: BTreeSet<PersonId>,
}

#[derive(Debug, Clone)]
pub struct ClusteringEngine {
    threshold: f32,
    dimension: Option<usize>,
    persons: BTreeMap<PersonId, Person>,
    next_id: PersonId,
    /// Ids handed out before `next_id`; only filled by re-cluster-all.
    reusable: VecDeque<PersonId>,
    /// Persons changed since the last `clear_dirty`.
    dirty: BTreeSet<PersonId>,
}

impl ClusteringEngine {
    pub fn new(threshold: f32) -> Self {
        Self::with_persons(threshold, Vec::new())
    }

    pub fn with_persons(threshold: f32, persons: Vec<Person>) -> Self {
        let persons: BTreeMap<PersonId, Person> = persons.into_iter().map(|p| (p.id, p)).collect();
        let next_id = persons.keys().next_back().map_or(1, |max| max + 1);
        Self {
            threshold,
            dimension: None,
            persons,
            next_id,
            reusable: VecDeque::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Load every person from the store.
    pub fn load<S: IndexStore>(store: &S, threshold: f32) -> Result<Self, StoreError> {
        let persons = with_retry("get_all_persons", || store.get_all_persons())?;
        Ok(Self::with_persons(threshold, persons))
    }

    /// Only embeddings of this length are clustered.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn persons(&self) -> impl Iterator<Item = &Person> {
        self.persons.values()
    }

    pub fn person(&self, person_id: PersonId) -> Option<&Person> {
        self.persons.get(&person_id)
    }

    /// Unit-length copy of `embedding`, or `None` when it cannot take part in
    /// clustering (empty, all zero, or the wrong length).
    pub fn prepare(&self, embedding: &[f32]) -> Option<Vec<f32>> {
        if let Some(dim) = self.dimension {
            if embedding.len() != dim {
                return None;
            }
        }
        normalize(embedding)
    }

    /// Nearest person by cosine distance, skipping `exclude` and persons with
    /// no centroid. Equal distances resolve to the lowest id.
    pub fn nearest(&self, embedding: &[f32], exclude: &[PersonId]) -> Option<(PersonId, f32)> {
        let mut best: Option<(PersonId, f32)> = None;
        for (id, person) in &self.persons {
            if person.centroid.is_empty() || exclude.contains(id) {
                continue;
            }
            let Some(distance) = cosine_distance(embedding, &person.centroid) else {
                continue;
            };
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((*id, distance)),
            }
        }
        best
    }

    pub fn assign(&mut self, embedding: &[f32]) -> Option<ClusterDecision> {
        self.assign_excluding(embedding, &[])
    }

    /// Assign one face, considering only persons not in `exclude`. Returns
    /// `None` for embeddings that cannot be clustered.
    pub fn assign_excluding(&mut self, embedding: &[f32], exclude: &[PersonId]) -> Option<ClusterDecision> {
        let embedding = self.prepare(embedding)?;

        if let Some((person_id, distance)) = self.nearest(&embedding, exclude) {
            if distance <= self.threshold {
                self.add_member(person_id, &embedding);
                return Some(ClusterDecision {
                    person_id,
                    distance,
                    created: false,
                });
            }
        }

        let person_id = self.allocate_id();
        self.persons.insert(person_id, Person::provisional(person_id, embedding));
        self.dirty.insert(person_id);
        Some(ClusterDecision {
            person_id,
            distance: 0.0,
            created: true,
        })
    }

    fn allocate_id(&mut self) -> PersonId {
        if let Some(id) = self.reusable.pop_front() {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Fold a unit-length embedding into a person's centroid.
    fn add_member(&mut self, person_id: PersonId, embedding: &[f32]) {
        if let Some(person) = self.persons.get_mut(&person_id) {
            mean_add(&mut person.centroid, person.member_count, embedding);
            person.member_count += 1;
            self.dirty.insert(person_id);
        }
    }

    fn remove_member(&mut self, person_id: PersonId, embedding: &[f32]) {
        if let Some(person) = self.persons.get_mut(&person_id) {
            mean_remove(&mut person.centroid, person.member_count, embedding);
            person.member_count = person.member_count.saturating_sub(1);
            self.dirty.insert(person_id);
        }
    }

    /// Take a stored face out of its person's centroid. Returns the person it
    /// belonged to.
    pub fn detach(&mut self, face: &Face) -> Option<PersonId> {
        let person_id = face.person_id?;
        if let Some(embedding) = self.prepare(&face.embedding) {
            self.remove_member(person_id, &embedding);
        }
        Some(person_id)
    }

    /// Move a face to `person_id` by hand: the old centroid loses it and the
    /// new one gains it immediately. Returns the distance to the new
    /// person's centroid before the move.
    pub fn reassign_manual(&mut self, face: &Face, person_id: PersonId) -> Result<Option<f32>, IndexError> {
        let target = self
            .persons
            .get(&person_id)
            .ok_or_else(|| IndexError::NotFound(format!("person {}", person_id)))?;

        if face.person_id == Some(person_id) {
            let distance = self
                .prepare(&face.embedding)
                .and_then(|e| cosine_distance(&e, &target.centroid));
            return Ok(distance);
        }

        self.detach(face);
        let embedding = self.prepare(&face.embedding);
        let distance = embedding.as_deref().and_then(|e| {
            self.persons
                .get(&person_id)
                .and_then(|p| cosine_distance(e, &p.centroid))
        });
        if let Some(embedding) = embedding {
            self.add_member(person_id, &embedding);
        }
        Ok(distance)
    }

    pub fn set_name(&mut self, person_id: PersonId, name: Option<String>) -> Result<&Person, IndexError> {
        let person = self
            .persons
            .get_mut(&person_id)
            .ok_or_else(|| IndexError::NotFound(format!("person {}", person_id)))?;
        person.name = name;
        self.dirty.insert(person_id);
        Ok(person)
    }

    /// Add an empty person under a fresh id. It joins the automatic passes
    /// once it has members.
    pub fn create_person(&mut self, name: Option<String>) -> PersonId {
        let id = self.allocate_id();
        self.persons.insert(
            id,
            Person {
                id,
                name,
                centroid: Vec::new(),
                member_count: 0,
            },
        );
        self.dirty.insert(id);
        id
    }

    pub fn remove_person(&mut self, person_id: PersonId) -> Option<Person> {
        self.dirty.remove(&person_id);
        self.persons.remove(&person_id)
    }

    pub(crate) fn replace_person(&mut self, person: Person) {
        self.dirty.insert(person.id);
        self.persons.insert(person.id, person);
    }

    /// Persons changed since the last [`ClusteringEngine::clear_dirty`].
    pub fn dirty_persons(&self) -> Vec<Person> {
        self.dirty
            .iter()
            .filter_map(|id| self.persons.get(id))
            .cloned()
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            persons: self.persons.clone(),
            next_id: self.next_id,
            dirty: self.dirty.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.persons = checkpoint.persons;
        self.next_id = checkpoint.next_id;
        self.dirty = checkpoint.dirty;
    }

    /// Recompute every automatic assignment from scratch in stable order
    /// (photo id, then detection ordinal) and write the result in one
    /// transaction.
    ///
    /// Manual assignments are kept and seed their persons' centroids. Persons
    /// left without manual members start empty and take no part until a face
    /// lands in them again; they are kept, never deleted. New clusters reuse
    /// the lowest such provisional ids first, so repeating the operation over
    /// the same data yields identical groupings. Faces of soft-removed photos
    /// take part like any other face, matching the incremental pass.
    pub fn recluster_all<S: IndexStore>(
        store: &mut S,
        threshold: f32,
        dimension: Option<usize>,
    ) -> Result<(Self, ReclusterSummary), IndexError> {
        let faces = with_retry("faces_in_cluster_order", || store.faces_in_cluster_order())?;
        let persons = with_retry("get_all_persons", || store.get_all_persons())?;

        let mut engine = Self::with_persons(
            threshold,
            persons
                .into_iter()
                .map(|mut p| {
                    p.centroid.clear();
                    p.member_count = 0;
                    p
                })
                .collect(),
        );
        engine.dimension = dimension;

        let mut summary = ReclusterSummary::default();

        for face in faces.iter().filter(|f| f.is_manual()) {
            summary.manual_kept += 1;
            if let (Some(person_id), Some(embedding)) = (face.person_id, engine.prepare(&face.embedding)) {
                engine.add_member(person_id, &embedding);
            }
        }

        engine.reusable = engine
            .persons
            .values()
            .filter(|p| p.is_provisional() && p.member_count == 0)
            .map(|p| p.id)
            .collect();

        let mut decisions: Vec<(FaceId, Option<ClusterDecision>)> = Vec::new();
        for face in faces.iter().filter(|f| !f.is_manual()) {
            let decision = engine.assign(&face.embedding);
            match decision {
                Some(d) => {
                    summary.assigned += 1;
                    if d.created {
                        summary.persons_created += 1;
                    }
                }
                None => summary.unassigned += 1,
            }
            decisions.push((face.id, decision));
        }
        engine.reusable.clear();

        let persons: Vec<Person> = engine.persons.values().cloned().collect();
        with_retry("recluster", || {
            store.atomic(|s| {
                for person in &persons {
                    s.upsert_person(person)?;
                }
                for (face_id, decision) in &decisions {
                    match decision {
                        Some(d) => {
                            s.assign_face(*face_id, d.person_id, AssignmentOrigin::AutoCluster, Some(d.distance))?
                        }
                        None => s.unassign_face(*face_id)?,
                    }
                }
                Ok(())
            })
        })?;
        engine.clear_dirty();

        tracing::info!(
            assigned = summary.assigned,
            unassigned = summary.unassigned,
            manual = summary.manual_kept,
            persons_created = summary.persons_created,
            "Re-clustered all faces"
        );
        Ok((engine, summary))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclusterSummary {
    pub assigned: usize,
    pub unassigned: usize,
    pub manual_kept: usize,
    pub persons_created: usize,
}
