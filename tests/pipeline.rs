mod common;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

use common::*;
use facegallery::db::{AssignmentOrigin, Face, IndexStore, PersonId, ProcessingState, SqliteStore};
use facegallery::error::ErrorKind;
use facegallery::faces::{people, ClusteringEngine, IndexPipeline, RunSummary};
use facegallery::scanner::ScanEvent;

fn run(pipeline: &IndexPipeline, store: &mut SqliteStore, root: &Path) -> RunSummary {
    let cancel = AtomicBool::new(false);
    pipeline
        .run(store, &[root.to_path_buf()], &cancel, &mut |_| {})
        .unwrap()
}

/// Person id of every face, keyed by (file name, ordinal).
fn assignments(store: &SqliteStore) -> BTreeMap<(String, u32), Option<PersonId>> {
    store
        .faces_in_cluster_order()
        .unwrap()
        .into_iter()
        .map(|face| {
            let photo = store.get_photo(face.photo_id).unwrap().unwrap();
            let name = photo.path.file_name().unwrap().to_string_lossy().to_string();
            ((name, face.ordinal), face.person_id)
        })
        .collect()
}

fn faces_of(store: &SqliteStore, path: &Path) -> Vec<Face> {
    let photo = store.get_photo_by_path(path).unwrap().unwrap();
    store.get_faces_for_photo(photo.id).unwrap()
}

/// Member counts of persons that have members, largest first.
fn group_sizes(store: &SqliteStore) -> Vec<u32> {
    let mut sizes: Vec<u32> = store
        .get_all_persons()
        .unwrap()
        .into_iter()
        .map(|p| p.member_count)
        .filter(|&n| n > 0)
        .collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    sizes
}

struct Library {
    dir: TempDir,
    a: PathBuf,
    b: PathBuf,
    c: PathBuf,
}

/// a: red, b: orange (same person as red), c: blue.
fn library() -> Library {
    let dir = TempDir::new().unwrap();
    let a = write_photo(&dir.path().join("a.png"), &[RED]);
    let b = write_photo(&dir.path().join("b.png"), &[ORANGE]);
    let c = write_photo(&dir.path().join("c.png"), &[BLUE]);
    Library { dir, a, b, c }
}

#[test]
fn test_three_photos_make_two_persons() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();

    let summary = run(&pipeline(), &mut store, lib.dir.path());
    assert_eq!(summary.scan.added, 3);
    assert_eq!(summary.backend.as_deref(), Some("colour"));
    assert_eq!(summary.photos_processed, 3);
    assert_eq!(summary.faces_detected, 3);
    assert_eq!(summary.persons_created, 2);
    assert_eq!(summary.pending, 0);
    assert_eq!(group_sizes(&store), vec![2, 1]);

    let red = faces_of(&store, &lib.a)[0].person_id;
    assert_eq!(faces_of(&store, &lib.b)[0].person_id, red);
    assert_ne!(faces_of(&store, &lib.c)[0].person_id, red);

    for path in [&lib.a, &lib.b, &lib.c] {
        let photo = store.get_photo_by_path(path).unwrap().unwrap();
        assert_eq!(photo.state, ProcessingState::FacesExtracted);
    }
}

#[test]
fn test_second_run_changes_nothing() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();

    run(&pipeline, &mut store, lib.dir.path());
    let before = assignments(&store);
    let persons_before = store.get_all_persons().unwrap();

    let summary = run(&pipeline, &mut store, lib.dir.path());
    assert_eq!(summary.scan.unchanged, 3);
    assert_eq!(summary.faces_detected, 0);
    assert_eq!(summary.persons_created, 0);
    assert_eq!(assignments(&store), before);
    assert_eq!(store.get_all_persons().unwrap(), persons_before);
}

#[test]
fn test_faces_in_one_photo_follow_detection_order() {
    let dir = TempDir::new().unwrap();
    let group = write_photo(&dir.path().join("group.png"), &[BLUE, RED, GREEN]);
    let mut store = SqliteStore::open_in_memory().unwrap();

    let summary = run(&pipeline(), &mut store, dir.path());
    assert_eq!(summary.faces_detected, 3);
    assert_eq!(summary.persons_created, 3);

    let faces = faces_of(&store, &group);
    let xs: Vec<i32> = faces.iter().map(|f| f.bbox.x).collect();
    assert_eq!(xs, vec![0, 16, 32]);
    let ordinals: Vec<u32> = faces.iter().map(|f| f.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    let persons: Vec<Option<PersonId>> = faces.iter().map(|f| f.person_id).collect();
    assert_eq!(persons, vec![Some(1), Some(2), Some(3)]);
}

#[test]
fn test_modified_photo_is_detected_again() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();
    run(&pipeline, &mut store, lib.dir.path());

    let blue_person = faces_of(&store, &lib.c)[0].person_id.unwrap();
    let red_person = faces_of(&store, &lib.a)[0].person_id.unwrap();

    write_photo(&lib.c, &[RED]);
    let summary = run(&pipeline, &mut store, lib.dir.path());
    assert_eq!(summary.scan.modified, 1);
    assert_eq!(summary.faces_discarded, 1);
    assert_eq!(summary.faces_detected, 1);
    assert_eq!(summary.persons_created, 0);

    let faces = faces_of(&store, &lib.c);
    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0].person_id, Some(red_person));

    // The emptied person is kept, without members.
    let blue = store.get_person(blue_person).unwrap().unwrap();
    assert_eq!(blue.member_count, 0);
    assert_eq!(store.get_person(red_person).unwrap().unwrap().member_count, 3);
}

#[test]
fn test_removed_photo_keeps_its_faces() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();
    run(&pipeline, &mut store, lib.dir.path());

    std::fs::remove_file(&lib.b).unwrap();
    let summary = run(&pipeline, &mut store, lib.dir.path());
    assert_eq!(summary.scan.removed, 1);

    let photo = store.get_photo_by_path(&lib.b).unwrap().unwrap();
    assert!(photo.is_removed());
    assert_eq!(store.get_faces_for_photo(photo.id).unwrap().len(), 1);
}

#[test]
fn test_duplicate_photo_is_not_detected_twice() {
    let lib = library();
    std::fs::copy(&lib.a, lib.dir.path().join("copy.png")).unwrap();
    let mut store = SqliteStore::open_in_memory().unwrap();

    let summary = run(&pipeline(), &mut store, lib.dir.path());
    assert_eq!(summary.scan.added, 4);
    assert_eq!(summary.scan.duplicates, 1);
    assert_eq!(summary.faces_detected, 3);
}

#[test]
fn test_undecodable_photo_is_reported_and_skipped() {
    let lib = library();
    let broken = lib.dir.path().join("broken.png");
    std::fs::write(&broken, b"this is not a png").unwrap();
    let broken = broken.canonicalize().unwrap();
    let mut store = SqliteStore::open_in_memory().unwrap();

    let cancel = AtomicBool::new(false);
    let mut errored = Vec::new();
    let summary = pipeline()
        .run(&mut store, &[lib.dir.path().to_path_buf()], &cancel, &mut |event| {
            if let ScanEvent::Errored { path, kind, .. } = event {
                errored.push((path.clone(), *kind));
            }
        })
        .unwrap();

    assert_eq!(summary.faces_detected, 3);
    assert_eq!(summary.detection_errors, 1);
    assert_eq!(errored, vec![(broken.clone(), ErrorKind::Decode)]);
    assert_eq!(summary.failures_of(ErrorKind::Decode).count(), 1);

    let photo = store.get_photo_by_path(&broken).unwrap().unwrap();
    assert_eq!(photo.state, ProcessingState::Error);
    assert!(photo.error.is_some());
    assert_eq!(summary.pending, 0);
}

#[test]
fn test_scan_only_run_leaves_work_queued() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();

    let summary = run(&scan_only_pipeline(), &mut store, lib.dir.path());
    assert_eq!(summary.backend, None);
    assert_eq!(summary.scan.added, 3);
    assert_eq!(summary.faces_detected, 0);
    assert_eq!(summary.pending, 3);

    let summary = run(&pipeline(), &mut store, lib.dir.path());
    assert_eq!(summary.scan.unchanged, 3);
    assert_eq!(summary.faces_detected, 3);
    assert_eq!(summary.pending, 0);
    assert_eq!(group_sizes(&store), vec![2, 1]);
}

#[test]
fn test_pending_photo_outside_roots_is_picked_up() {
    let lib = library();
    let other = TempDir::new().unwrap();
    write_photo(&other.path().join("d.png"), &[GREEN]);
    let mut store = SqliteStore::open_in_memory().unwrap();

    run(&scan_only_pipeline(), &mut store, other.path());
    let summary = run(&pipeline(), &mut store, lib.dir.path());
    assert_eq!(summary.faces_detected, 4);
    assert_eq!(summary.pending, 0);
}

#[test]
fn test_cancelled_run_resumes_to_same_grouping() {
    let dir = TempDir::new().unwrap();
    let palette = [RED, ORANGE, BLUE, GREEN];
    for i in 0..12 {
        write_photo(&dir.path().join(format!("p{:02}.png", i)), &[palette[i % palette.len()]]);
    }
    let roots = vec![dir.path().to_path_buf()];
    let pipeline = pipeline();

    let mut reference = SqliteStore::open_in_memory().unwrap();
    run(&pipeline, &mut reference, dir.path());

    let mut store = SqliteStore::open_in_memory().unwrap();
    let cancel = AtomicBool::new(false);
    let mut seen = 0;
    let summary = pipeline
        .run(&mut store, &roots, &cancel, &mut |_| {
            seen += 1;
            if seen == 4 {
                cancel.store(true, Ordering::Relaxed);
            }
        })
        .unwrap();
    assert!(summary.scan.cancelled);
    assert_eq!(summary.scan.removed, 0);
    assert!(summary.faces_detected < 12);

    // Every committed photo is complete.
    for face in store.faces_in_cluster_order().unwrap() {
        let photo = store.get_photo(face.photo_id).unwrap().unwrap();
        assert_eq!(photo.state, ProcessingState::FacesExtracted);
    }

    let summary = run(&pipeline, &mut store, dir.path());
    assert!(!summary.scan.cancelled);
    assert_eq!(summary.pending, 0);
    assert_eq!(store.faces_in_cluster_order().unwrap().len(), 12);
    assert_eq!(assignments(&store), assignments(&reference));
    assert_eq!(group_sizes(&store), vec![6, 3, 3]);
}

#[test]
fn test_recluster_is_deterministic() {
    let lib = library();
    write_photo(&lib.dir.path().join("d.png"), &[GREEN, BLUE]);
    let mut store = SqliteStore::open_in_memory().unwrap();
    run(&pipeline(), &mut store, lib.dir.path());
    let incremental = assignments(&store);

    ClusteringEngine::recluster_all(&mut store, 0.4, Some(3)).unwrap();
    let first = assignments(&store);
    let persons_first = store.get_all_persons().unwrap();
    ClusteringEngine::recluster_all(&mut store, 0.4, Some(3)).unwrap();

    assert_eq!(assignments(&store), first);
    assert_eq!(store.get_all_persons().unwrap(), persons_first);
    assert_eq!(first, incremental);
}

#[test]
fn test_manual_assignment_survives_recluster() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();
    run(&pipeline, &mut store, lib.dir.path());

    let red_person = faces_of(&store, &lib.a)[0].person_id.unwrap();
    let blue_face = faces_of(&store, &lib.c)[0].id;

    let mut engine = pipeline.load_engine(&store).unwrap();
    people::assign_face(&mut engine, &mut store, blue_face, red_person).unwrap();

    let (_, summary) = ClusteringEngine::recluster_all(&mut store, 0.4, Some(3)).unwrap();
    assert_eq!(summary.manual_kept, 1);

    let face = store.get_face(blue_face).unwrap().unwrap();
    assert_eq!(face.person_id, Some(red_person));
    assert_eq!(face.origin, Some(AssignmentOrigin::Manual));

    // A new run does not move it either.
    write_photo(&lib.dir.path().join("e.png"), &[BLUE]);
    run(&pipeline, &mut store, lib.dir.path());
    assert_eq!(store.get_face(blue_face).unwrap().unwrap().person_id, Some(red_person));
}

#[test]
fn test_named_person_keeps_faces_after_recluster() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();
    run(&pipeline, &mut store, lib.dir.path());

    let red_person = faces_of(&store, &lib.a)[0].person_id.unwrap();
    let mut engine = pipeline.load_engine(&store).unwrap();
    people::rename_person(&mut engine, &mut store, red_person, Some("Ruby")).unwrap();

    ClusteringEngine::recluster_all(&mut store, 0.4, Some(3)).unwrap();
    let ruby = store.get_person(red_person).unwrap().unwrap();
    assert_eq!(ruby.name.as_deref(), Some("Ruby"));
    assert_eq!(ruby.member_count, 2);
    assert!(faces_of(&store, &lib.b)[0].is_manual());
}

#[test]
fn test_recluster_keeps_faces_of_removed_photos() {
    let lib = library();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();
    run(&pipeline, &mut store, lib.dir.path());

    let red_person = faces_of(&store, &lib.a)[0].person_id.unwrap();
    std::fs::remove_file(&lib.a).unwrap();
    std::fs::remove_file(&lib.b).unwrap();
    run(&pipeline, &mut store, lib.dir.path());

    let (_, summary) = ClusteringEngine::recluster_all(&mut store, 0.4, Some(3)).unwrap();
    assert_eq!(summary.assigned, 3);

    // The removed red and orange faces still form their person.
    assert_eq!(faces_of(&store, &lib.a)[0].person_id, Some(red_person));
    assert_eq!(faces_of(&store, &lib.b)[0].person_id, Some(red_person));
    assert_eq!(store.get_person(red_person).unwrap().unwrap().member_count, 2);
    let blue_person = faces_of(&store, &lib.c)[0].person_id.unwrap();
    assert_ne!(blue_person, red_person);

    // A revived path with new content leaves the blue person alone.
    write_photo(&lib.a, &[GREEN]);
    let summary = run(&pipeline, &mut store, lib.dir.path());
    assert_eq!(summary.scan.modified, 1);
    assert_eq!(summary.faces_discarded, 1);

    assert_eq!(store.get_person(red_person).unwrap().unwrap().member_count, 1);
    assert_eq!(store.get_person(blue_person).unwrap().unwrap().member_count, 1);
    assert_eq!(faces_of(&store, &lib.c)[0].person_id, Some(blue_person));
    let green_person = faces_of(&store, &lib.a)[0].person_id.unwrap();
    assert_ne!(green_person, red_person);
    assert_ne!(green_person, blue_person);
}

#[test]
fn test_duplicate_gets_faces_when_original_changes() {
    let dir = TempDir::new().unwrap();
    let a = write_photo(&dir.path().join("a.png"), &[RED]);
    std::fs::copy(&a, dir.path().join("b.png")).unwrap();
    let b = dir.path().join("b.png").canonicalize().unwrap();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();

    let summary = run(&pipeline, &mut store, dir.path());
    assert_eq!(summary.scan.duplicates, 1);
    assert_eq!(summary.faces_detected, 1);
    assert!(faces_of(&store, &b).is_empty());

    write_photo(&a, &[BLUE]);
    let summary = run(&pipeline, &mut store, dir.path());
    assert_eq!(summary.scan.modified, 1);
    assert_eq!(summary.faces_detected, 2);
    assert_eq!(summary.pending, 0);

    let copy = faces_of(&store, &b);
    assert_eq!(copy.len(), 1);
    assert!(copy[0].person_id.is_some());
    assert_ne!(copy[0].person_id, faces_of(&store, &a)[0].person_id);

    // Nothing left to do on the next pass.
    let summary = run(&pipeline, &mut store, dir.path());
    assert_eq!(summary.faces_detected, 0);
}

#[test]
fn test_duplicate_gets_faces_when_original_is_removed() {
    let dir = TempDir::new().unwrap();
    let a = write_photo(&dir.path().join("a.png"), &[RED]);
    std::fs::copy(&a, dir.path().join("b.png")).unwrap();
    let b = dir.path().join("b.png").canonicalize().unwrap();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let pipeline = pipeline();
    run(&pipeline, &mut store, dir.path());
    let red_person = faces_of(&store, &a)[0].person_id.unwrap();

    std::fs::remove_file(&a).unwrap();
    let summary = run(&pipeline, &mut store, dir.path());
    assert_eq!(summary.scan.removed, 1);
    assert_eq!(summary.faces_detected, 1);
    assert_eq!(summary.pending, 0);

    let copy = faces_of(&store, &b);
    assert_eq!(copy.len(), 1);
    assert_eq!(copy[0].person_id, Some(red_person));
}
