mod common;

use common::{ME, OTHER, RESUMABLE_STATES, World};
use sd_core::{InstanceId, MoveError, MoveLog, MoveState, NoteIndex, FileSystem};
use std::time::Duration;

const THRESHOLD: Duration = Duration::from_secs(5 * 60);

async fn assert_moved_to_b(world: &World, note_id: &str, body: &[u8]) {
    assert_eq!(world.document(&world.b, note_id).await.as_deref(), Some(body));
    assert!(world.document(&world.a, note_id).await.is_none());
    assert!(
        !world
            .fs
            .exists(&format!("/sds/b/notes/.moving-{}", note_id))
            .await
            .unwrap()
    );
    let rows = world.index.find_note(note_id).await.unwrap();
    assert_eq!(rows.len(), 1, "exactly one row for {}", note_id);
    assert_eq!(rows[0].sd_id, world.b.id);
}

#[tokio::test]
async fn test_move_n1_from_a_to_b() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Groceries", b"milk, eggs").await;

    let record = world
        .coordinator(ME)
        .move_note(world.request("n1").with_folder("folder-1"))
        .await
        .unwrap();

    assert_eq!(record.state, MoveState::Completed);
    assert_moved_to_b(&world, "n1", b"milk, eggs").await;
    let note = world.index.get_note(world.b.id, "n1").await.unwrap().unwrap();
    assert_eq!(note.title, "Groceries");
    assert_eq!(note.folder_id.as_deref(), Some("folder-1"));
}

#[tokio::test]
async fn test_crash_in_every_state_is_recovered_by_restart() {
    for state in RESUMABLE_STATES {
        let world = World::new().await;
        world.add_note(&world.a, "n1", "Note", b"content").await;
        let record = world.move_stopped_at(&world.coordinator(ME), "n1", state).await;

        // Same instance, cold start
        let restarted = world.restarted_coordinator(ME).await;
        let report = restarted.recover_incomplete_moves().await.unwrap();

        assert_eq!(report.resumed, vec![record.id.clone()], "stopped at {}", state);
        let stored = restarted.get_move(&record.id).await.unwrap();
        assert_eq!(stored.state, MoveState::Completed, "stopped at {}", state);
        assert_moved_to_b(&world, "n1", b"content").await;
    }
}

#[tokio::test]
async fn test_repeating_any_phase_converges_on_the_same_result() {
    let reference = World::new().await;
    reference.add_note(&reference.a, "n1", "Note", b"content").await;
    reference.coordinator(ME).move_note(reference.request("n1")).await.unwrap();
    let expected_notes = reference.notes().await;
    let expected_files = reference.file_tree("/sds").await;

    for state in RESUMABLE_STATES {
        let world = World::new().await;
        world.add_note(&world.a, "n1", "Note", b"content").await;
        let coordinator = world.coordinator(ME);
        let stopped = world.move_stopped_at(&coordinator, "n1", state).await;

        // Run the phase, then lose the state transition as if we crashed
        coordinator.advance(&stopped.id).await.unwrap();
        world.index.update_move(&stopped).await.unwrap();

        coordinator.recover_incomplete_moves().await.unwrap();
        coordinator.recover_incomplete_moves().await.unwrap();

        assert_eq!(world.notes().await, expected_notes, "repeated {}", state);
        assert_eq!(world.file_tree("/sds").await, expected_files, "repeated {}", state);
    }
}

#[tokio::test]
async fn test_partial_staging_copy_is_rewritten() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Note", b"content").await;
    let coordinator = world.coordinator(ME);
    world.move_stopped_at(&coordinator, "n1", MoveState::Copying).await;
    world
        .fs
        .write("/sds/b/notes/.moving-n1/logs/0001.crdtlog", b"cont")
        .await
        .unwrap();

    coordinator.recover_incomplete_moves().await.unwrap();

    assert_moved_to_b(&world, "n1", b"content").await;
    assert_eq!(
        world.fs.read("/sds/b/notes/n1/meta/snapshot.bin").await.unwrap(),
        b"snapshot"
    );
}

#[tokio::test]
async fn test_lost_staging_directory_is_copied_again() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Note", b"content").await;
    let coordinator = world.coordinator(ME);
    world
        .move_stopped_at(&coordinator, "n1", MoveState::FilesCopied)
        .await;
    world.fs.remove_all("/sds/b/notes/.moving-n1").await.unwrap();

    coordinator.recover_incomplete_moves().await.unwrap();

    assert_moved_to_b(&world, "n1", b"content").await;
}

#[tokio::test]
async fn test_recent_foreign_move_is_left_alone() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Note", b"content").await;
    let record = world
        .move_stopped_at(&world.coordinator(OTHER), "n1", MoveState::Copying)
        .await;
    world.clock.advance(THRESHOLD - Duration::from_millis(1));

    let report = world.coordinator(ME).recover_incomplete_moves().await.unwrap();

    assert_eq!(report.in_progress_elsewhere, vec![record.id.clone()]);
    assert!(report.stale.is_empty());
    assert_eq!(world.index.get_move(&record.id).await.unwrap(), Some(record));
}

#[tokio::test]
async fn test_foreign_move_at_threshold_is_reported_stale_but_untouched() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Note", b"content").await;
    let record = world
        .move_stopped_at(&world.coordinator(OTHER), "n1", MoveState::FilesCopied)
        .await;
    world.clock.advance(THRESHOLD);

    let coordinator = world.coordinator(ME);
    let report = coordinator.recover_incomplete_moves().await.unwrap();

    assert!(report.resumed.is_empty());
    assert_eq!(report.stale.len(), 1);
    let stale = &report.stale[0];
    assert_eq!(stale.move_id, record.id);
    assert_eq!(stale.note_id, "n1");
    assert_eq!(stale.state, MoveState::FilesCopied);
    assert_eq!(stale.age_ms, THRESHOLD.as_millis() as u64);
    assert_eq!(stale.owner, InstanceId::from(OTHER));
    assert_eq!(world.index.get_move(&record.id).await.unwrap(), Some(record));
    assert_eq!(coordinator.stale_moves().await.unwrap(), report.stale);
}

#[tokio::test]
async fn test_take_over_stale_move_finishes_it() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Note", b"content").await;
    let record = world
        .move_stopped_at(&world.coordinator(OTHER), "n1", MoveState::FilesCopied)
        .await;
    world.clock.advance(Duration::from_secs(3600));

    let done = world.coordinator(ME).take_over_move(&record.id).await.unwrap();

    assert_eq!(done.state, MoveState::Completed);
    assert_eq!(done.instance_id, InstanceId::from(ME));
    assert_moved_to_b(&world, "n1", b"content").await;
}

#[tokio::test]
async fn test_unresolvable_sd_is_skipped_without_mutation() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Note", b"content").await;
    let record = world
        .move_stopped_at(&world.coordinator(ME), "n1", MoveState::Copying)
        .await;

    // Target now holds a different SD
    world.fs.write("/sds/b/SD_ID", b"c-uuid").await.unwrap();
    let report = world.coordinator(ME).recover_incomplete_moves().await.unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].move_id, record.id);
    assert!(report.resumed.is_empty());
    assert_eq!(world.index.get_move(&record.id).await.unwrap(), Some(record));
}

#[tokio::test]
async fn test_coordinators_sharing_an_instance_never_double_initiate() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Note", b"content").await;
    let first = world.coordinator(ME);
    let second = world.coordinator(ME);

    let (x, y) = tokio::join!(
        first.initiate_move(world.request("n1")),
        second.initiate_move(world.request("n1")),
    );

    assert!(x.is_ok() != y.is_ok(), "exactly one initiation succeeds");
    let err = x.err().or(y.err()).unwrap();
    assert!(matches!(err, MoveError::MoveInProgress { .. }));
    assert_eq!(world.index.list_active_moves().await.unwrap().len(), 1);
}
