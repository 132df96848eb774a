//! Merge suggestions between persons whose centroids are close.
//!
//! Two provisional persons may be merged automatically. A merge involving a
//! named person is a human decision and needs explicit confirmation.

use super::clustering::ClusteringEngine;
use super::embedding::{cosine_distance, mean_merge};
use crate::db::{with_retry, IndexStore, Person, PersonId};
use crate::error::IndexError;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeSuggestion {
    /// Lower id of the pair; survives an automatic merge.
    pub target: PersonId,
    pub source: PersonId,
    pub distance: f32,
    /// Both persons are unnamed, so the merge may happen without asking.
    pub auto_mergeable: bool,
}

/// Every pair of persons with centroids within `merge_threshold`, nearest
/// first. Persons without a centroid are never suggested.
pub fn merge_suggestions(engine: &ClusteringEngine, merge_threshold: f32) -> Vec<MergeSuggestion> {
    let persons: Vec<&Person> = engine.persons().filter(|p| !p.centroid.is_empty()).collect();

    let mut suggestions = Vec::new();
    for (i, a) in persons.iter().enumerate() {
        for b in &persons[i + 1..] {
            let Some(distance) = cosine_distance(&a.centroid, &b.centroid) else {
                continue;
            };
            if distance <= merge_threshold {
                suggestions.push(MergeSuggestion {
                    target: a.id,
                    source: b.id,
                    distance,
                    auto_mergeable: a.is_provisional() && b.is_provisional(),
                });
            }
        }
    }

    suggestions.sort_by(|x, y| {
        x.distance
            .total_cmp(&y.distance)
            .then(x.target.cmp(&y.target))
            .then(x.source.cmp(&y.source))
    });
    suggestions
}

/// Fold `source` into `target`: faces move over with their origins, the
/// centroids combine weighted by member count, and `source` is deleted.
/// The surviving person keeps `target`'s name, or takes `source`'s when it
/// had none.
pub fn merge_persons<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    target: PersonId,
    source: PersonId,
    confirmed: bool,
) -> Result<Person, IndexError> {
    let target_person = engine
        .person(target)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(format!("person {}", target)))?;
    if target == source {
        return Ok(target_person);
    }
    let source_person = engine
        .person(source)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(format!("person {}", source)))?;

    if !confirmed {
        if let Some(named) = [&target_person, &source_person].into_iter().find(|p| !p.is_provisional()) {
            return Err(IndexError::MergeRequiresConfirmation(named.id));
        }
    }

    let merged = Person {
        id: target,
        name: target_person.name.clone().or_else(|| source_person.name.clone()),
        centroid: mean_merge(
            &target_person.centroid,
            target_person.member_count,
            &source_person.centroid,
            source_person.member_count,
        ),
        member_count: target_person.member_count + source_person.member_count,
    };

    let moved = with_retry("merge_persons", || {
        store.atomic(|s| {
            let moved = s.move_faces(source, target)?;
            s.upsert_person(&merged)?;
            s.delete_person(source)?;
            Ok(moved)
        })
    })?;

    engine.replace_person(merged.clone());
    engine.remove_person(source);
    engine.clear_dirty();

    tracing::info!(into = target, from = source, faces = moved, "Merged persons");
    Ok(merged)
}

/// Repeatedly merge the closest pair of provisional persons until no pair is
/// within `merge_threshold`. Returns the merges performed, in order.
pub fn auto_merge_provisional<S: IndexStore>(
    engine: &mut ClusteringEngine,
    store: &mut S,
    merge_threshold: f32,
) -> Result<Vec<MergeSuggestion>, IndexError> {
    let mut merged = Vec::new();
    loop {
        let next = merge_suggestions(engine, merge_threshold)
            .into_iter()
            .find(|s| s.auto_mergeable);
        let Some(suggestion) = next else {
            break;
        };
        merge_persons(engine, store, suggestion.target, suggestion.source, false)?;
        merged.push(suggestion);
    }
    Ok(merged)
}
