mod common;

use common::{ME, World};
use sd_core::{ConflictPolicy, MoveError, MoveLog, MoveState, NoteIndex};

async fn world_with_clash() -> World {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Moved", b"from a").await;
    world.add_note(&world.b, "n1", "Resident", b"from b").await;
    world
}

#[tokio::test]
async fn test_fail_rejects_live_target() {
    let world = world_with_clash().await;

    let err = world
        .coordinator(ME)
        .move_note(world.request_with("n1", ConflictPolicy::Fail))
        .await
        .unwrap_err();

    assert!(matches!(err, MoveError::AlreadyExists { .. }));
    assert!(err.to_string().contains("already exists"));
    assert!(world.index.list_active_moves().await.unwrap().is_empty());
    assert_eq!(world.document(&world.b, "n1").await.as_deref(), Some(&b"from b"[..]));
}

#[tokio::test]
async fn test_replace_leaves_one_row_with_moved_content() {
    let world = world_with_clash().await;

    world
        .coordinator(ME)
        .move_note(world.request_with("n1", ConflictPolicy::Replace))
        .await
        .unwrap();

    let rows = world.index.find_note("n1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sd_id, world.b.id);
    assert_eq!(rows[0].title, "Moved");
    assert_eq!(world.document(&world.b, "n1").await.as_deref(), Some(&b"from a"[..]));
    assert!(world.document(&world.a, "n1").await.is_none());
}

#[tokio::test]
async fn test_keep_both_mints_new_id_and_purges_source_row() {
    let world = world_with_clash().await;

    let record = world
        .coordinator(ME)
        .move_note(world.request_with("n1", ConflictPolicy::KeepBoth))
        .await
        .unwrap();

    let new_id = record.target_note_id.clone().unwrap();
    assert_ne!(new_id, "n1");
    assert_eq!(record.final_note_id(), new_id);

    let rows = world.index.get_notes_by_sd(world.b.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    let resident = world.index.get_note(world.b.id, "n1").await.unwrap().unwrap();
    assert_eq!(resident.title, "Resident");
    let moved = world.index.get_note(world.b.id, &new_id).await.unwrap().unwrap();
    assert_eq!(moved.title, "Moved");

    // Source row is gone for good, not tombstoned
    assert!(world.index.get_note(world.a.id, "n1").await.unwrap().is_none());
    assert_eq!(world.document(&world.b, "n1").await.as_deref(), Some(&b"from b"[..]));
    assert_eq!(world.document(&world.b, &new_id).await.as_deref(), Some(&b"from a"[..]));
    assert!(world.document(&world.a, "n1").await.is_none());
}

#[tokio::test]
async fn test_tombstoned_target_is_not_a_conflict() {
    let world = world_with_clash().await;
    world.index.tombstone_note(world.b.id, "n1").await.unwrap();

    let record = world
        .coordinator(ME)
        .move_note(world.request_with("n1", ConflictPolicy::Fail))
        .await
        .unwrap();

    assert_eq!(record.state, MoveState::Completed);
    assert!(record.target_note_id.is_none());
    let row = world.index.get_note(world.b.id, "n1").await.unwrap().unwrap();
    assert!(row.is_live());
    assert_eq!(row.title, "Moved");
    assert_eq!(world.document(&world.b, "n1").await.as_deref(), Some(&b"from a"[..]));
}

#[tokio::test]
async fn test_keep_both_resumes_under_the_same_minted_id() {
    let world = world_with_clash().await;
    let coordinator = world.coordinator(ME);
    let mut record = coordinator
        .initiate_move(world.request_with("n1", ConflictPolicy::KeepBoth))
        .await
        .unwrap();
    while record.state != MoveState::FilesCopied {
        record = coordinator.advance(&record.id).await.unwrap();
    }
    let minted = record.target_note_id.clone().unwrap();

    let restarted = world.restarted_coordinator(ME).await;
    restarted.recover_incomplete_moves().await.unwrap();

    assert!(world.index.get_note(world.b.id, &minted).await.unwrap().is_some());
    assert_eq!(world.index.get_notes_by_sd(world.b.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_fail_rechecks_target_before_promotion() {
    let world = World::new().await;
    world.add_note(&world.a, "n1", "Moved", b"from a").await;
    let coordinator = world.coordinator(ME);
    let record = world
        .move_stopped_at(&coordinator, "n1", MoveState::FilesCopied)
        .await;

    // Someone created n1 in B after the move was initiated
    world.add_note(&world.b, "n1", "Late", b"late").await;
    let err = coordinator.advance(&record.id).await.unwrap_err();

    assert!(matches!(err, MoveError::AlreadyExists { .. }));
    let stored = coordinator.get_move(&record.id).await.unwrap();
    assert_eq!(stored.state, MoveState::FilesCopied);
    assert!(stored.error.unwrap().contains("already exists"));
    assert_eq!(world.document(&world.b, "n1").await.as_deref(), Some(&b"late"[..]));

    // The operator can still back out
    let cancelled = coordinator.cancel_move(&record.id).await.unwrap();
    assert_eq!(cancelled.state, MoveState::Cancelled);
    assert_eq!(world.document(&world.a, "n1").await.as_deref(), Some(&b"from a"[..]));
}
