use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::membership::Configuration;
use crate::membership::ServerRole;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::storage::HardState;
use crate::storage::RaftStorage;
use crate::store::DiskStore;
use crate::store::DiskStoreOptions;
use crate::testing::TestRequest;
use crate::testing::TestResponse;
use crate::testing::TestStateMachine;
use crate::StorageErrorKind;

type Store = DiskStore<TestRequest, TestResponse, TestStateMachine>;

/// Each command entry is exactly one 64-byte batch (payload pads to 32),
/// so a segment of this size holds exactly ten entries after its header.
const TEN_ENTRY_SEGMENT: u64 = 8 + 10 * 64;

fn options() -> DiskStoreOptions {
    DiskStoreOptions {
        segment_size: TEN_ENTRY_SEGMENT,
    }
}

async fn open(dir: &Path) -> Store {
    DiskStore::open(dir, options(), TestStateMachine::new()).await.unwrap()
}

fn command(term: u64, index: u64) -> Entry<TestRequest> {
    Entry {
        term,
        index,
        payload: EntryPayload::Command(TestRequest::new(format!("{:016}", index))),
    }
}

fn list_files(dir: &Path, prefix_filter: impl Fn(&str) -> bool) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| prefix_filter(n))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_hard_state_round_trip() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open(tmp.path()).await;
        let hs = HardState {
            current_term: 3,
            voted_for: Some(2),
        };
        store.save_hard_state(&hs).await.unwrap();
        store.close().await.unwrap();
    }
    let store = open(tmp.path()).await;
    let state = store.get_initial_state().await.unwrap();
    assert_eq!(state.hard_state.current_term, 3);
    assert_eq!(state.hard_state.voted_for, Some(2));
}

#[tokio::test]
async fn test_entries_round_trip_across_restart() {
    let tmp = TempDir::new().unwrap();
    let written: Vec<Entry<TestRequest>> = (1..=25).map(|i| command(1, i)).collect();
    {
        let store = open(tmp.path()).await;
        for entry in &written {
            store.append_to_log(std::slice::from_ref(entry)).await.unwrap();
        }
        store.close().await.unwrap();
    }

    let store = open(tmp.path()).await;
    let state = store.get_initial_state().await.unwrap();
    assert_eq!(state.last_log_index, 25);
    assert_eq!(state.last_log_term, 1);
    let reloaded = store.get_log_entries(1, 26).await.unwrap();
    assert_eq!(reloaded, written);
}

#[tokio::test]
async fn test_crash_recovery_repairs_torn_tail() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open(tmp.path()).await;
        store
            .save_hard_state(&HardState {
                current_term: 2,
                voted_for: Some(1),
            })
            .await
            .unwrap();
        for i in 1..=51u64 {
            store.append_to_log(&[command(2, i)]).await.unwrap();
        }
        // Simulated crash: the store is dropped without close; entry 51 sits
        // in the active open segment.
    }

    // Tear the tail of the active segment mid-batch, as a crash mid-write
    // of entry 51 would. The active segment is the open file with the
    // lowest counter; the later ones are still-zeroed pool segments. Entry
    // 51 is its only content: the 8-byte format header plus one 64-byte
    // batch, followed by preallocated zeros.
    let open_files = list_files(tmp.path(), |n| n.starts_with("open-"));
    assert!(!open_files.is_empty(), "an active segment is expected");
    let active = open_files
        .iter()
        .min_by_key(|n| n.trim_start_matches("open-").parse::<u64>().unwrap())
        .unwrap();
    let path = tmp.path().join(active);
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(8 + 64 - 5).unwrap();
    drop(file);

    let store = open(tmp.path()).await;
    let state = store.get_initial_state().await.unwrap();
    assert_eq!(state.last_log_index, 50);
    assert_eq!(state.hard_state.current_term, 2);
    assert_eq!(state.hard_state.voted_for, Some(1));
    let reloaded = store.get_log_entries(1, 100).await.unwrap();
    assert_eq!(reloaded.len(), 50);

    // The store keeps accepting appends where the log left off.
    store.append_to_log(&[command(3, 51)]).await.unwrap();
    assert_eq!(store.try_get_log_entry(51).await.unwrap().unwrap().term, 3);
}

#[tokio::test]
async fn test_snapshot_prunes_segments_to_trailing_window() {
    let tmp = TempDir::new().unwrap();
    let store = open(tmp.path()).await;

    for i in 1..=101u64 {
        store.append_to_log(&[command(1, i)]).await.unwrap();
    }
    // Apply 1..=100 so the snapshot covers index 100.
    let entries = store.get_log_entries(1, 101).await.unwrap();
    for entry in &entries {
        if let EntryPayload::Command(data) = &entry.payload {
            store.apply_entry_to_state_machine(entry.index, data).await.unwrap();
        }
    }

    let snapshot = store.build_snapshot(10).await.unwrap();
    assert_eq!(snapshot.last_index, 100);
    assert_eq!(snapshot.last_term, 1);

    // Exactly one snapshot pair exists.
    let metas = list_files(tmp.path(), |n| n.starts_with("snapshot-") && n.ends_with(".meta"));
    let datas = list_files(tmp.path(), |n| n.starts_with("snapshot-") && !n.ends_with(".meta"));
    assert_eq!(metas.len(), 1);
    assert_eq!(datas.len(), 1);

    // Closed segments below the trailing window are gone: the remaining
    // cover starts at index 91.
    let closed = list_files(tmp.path(), |n| {
        matches!(
            crate::store::segment::parse_filename(n),
            Some(crate::store::segment::SegmentName::Closed { .. })
        )
    });
    assert_eq!(closed, vec![crate::store::segment::closed_filename(91, 100)]);

    // Entry 101 is still live in the active segment.
    assert!(store.try_get_log_entry(101).await.unwrap().is_some());
    assert!(store.try_get_log_entry(90).await.unwrap().is_none());
    assert!(store.try_get_log_entry(91).await.unwrap().is_some());
}

#[tokio::test]
async fn test_snapshot_prune_keeps_last_two_pairs() {
    let tmp = TempDir::new().unwrap();
    let store = open(tmp.path()).await;

    for round in 1..=4u64 {
        let upto = round * 10;
        for i in (upto - 9)..=upto {
            store.append_to_log(&[command(1, i)]).await.unwrap();
            let entry = store.try_get_log_entry(i).await.unwrap().unwrap();
            if let EntryPayload::Command(data) = &entry.payload {
                store.apply_entry_to_state_machine(i, data).await.unwrap();
            }
        }
        store.build_snapshot(5).await.unwrap();
    }

    let metas = list_files(tmp.path(), |n| n.starts_with("snapshot-") && n.ends_with(".meta"));
    assert_eq!(metas.len(), 2);
}

#[tokio::test]
async fn test_install_snapshot_resets_the_log() {
    let tmp = TempDir::new().unwrap();
    let store = open(tmp.path()).await;
    for i in 1..=20u64 {
        store.append_to_log(&[command(1, i)]).await.unwrap();
    }

    let mut configuration = Configuration::new();
    configuration.add(1, "n1", ServerRole::Voter).unwrap();
    let snapshot = crate::storage::Snapshot {
        last_index: 100,
        last_term: 4,
        configuration_index: 90,
        configuration,
        data: serde_json::to_vec(&vec![(100u64, "far-ahead".to_string())]).unwrap(),
    };
    store.install_snapshot(&snapshot).await.unwrap();

    // The local log is wholly superseded.
    assert!(store.get_log_entries(1, 200).await.unwrap().is_empty());
    assert_eq!(store.get_current_snapshot().await.unwrap().unwrap().last_index, 100);
    assert_eq!(store.state_machine().applied(), vec![(100, "far-ahead".to_string())]);

    // Appends continue from the snapshot boundary.
    store.append_to_log(&[command(4, 101)]).await.unwrap();

    // And a restart comes back to the same state.
    store.close().await.unwrap();
    let store = open(tmp.path()).await;
    let state = store.get_initial_state().await.unwrap();
    assert_eq!(state.last_log_index, 101);
    assert_eq!(state.last_applied, 100);
    assert_eq!(state.snapshot_last, Some((4, 100)));
}

#[tokio::test]
async fn test_truncate_across_segments() {
    let tmp = TempDir::new().unwrap();
    let store = open(tmp.path()).await;
    for i in 1..=25u64 {
        store.append_to_log(&[command(1, i)]).await.unwrap();
    }

    // Index 15 lands inside the closed segment 11-20.
    store.truncate_log(15).await.unwrap();
    assert_eq!(store.get_log_entries(1, 100).await.unwrap().len(), 14);
    assert!(store.try_get_log_entry(15).await.unwrap().is_none());

    // New appends take the truncated indices, and survive a restart.
    for i in 15..=22u64 {
        store.append_to_log(&[command(2, i)]).await.unwrap();
    }
    store.close().await.unwrap();

    let store = open(tmp.path()).await;
    let state = store.get_initial_state().await.unwrap();
    assert_eq!(state.last_log_index, 22);
    assert_eq!(store.try_get_log_entry(14).await.unwrap().unwrap().term, 1);
    assert_eq!(store.try_get_log_entry(15).await.unwrap().unwrap().term, 2);
}

#[tokio::test]
async fn test_bootstrap_requires_pristine_store() {
    let tmp = TempDir::new().unwrap();
    let store = open(tmp.path()).await;
    let mut configuration = Configuration::new();
    configuration.add(1, "n1", ServerRole::Voter).unwrap();
    configuration.add(2, "n2", ServerRole::Voter).unwrap();
    store.bootstrap(&configuration).await.unwrap();

    // The baseline is not a real snapshot: the log still starts at 1.
    assert!(store.get_current_snapshot().await.unwrap().is_none());
    store.append_to_log(&[command(1, 1)]).await.unwrap();

    // A second bootstrap is refused.
    let err = store.bootstrap(&configuration).await.unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::Io);

    // The configuration survives a restart.
    store.close().await.unwrap();
    let store = open(tmp.path()).await;
    let state = store.get_initial_state().await.unwrap();
    assert_eq!(state.configuration, configuration);
    assert_eq!(state.configuration_index, 0);
    assert_eq!(state.last_log_index, 1);
}

#[tokio::test]
async fn test_closed_store_refuses_operations() {
    let tmp = TempDir::new().unwrap();
    let store = open(tmp.path()).await;
    store.close().await.unwrap();
    let err = store.append_to_log(&[command(1, 1)]).await.unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::Shutdown);
    let err = store.get_initial_state().await.unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::Shutdown);
}

#[tokio::test]
async fn test_prepare_pool_quiesces_within_bounds() {
    let tmp = TempDir::new().unwrap();
    let store = open(tmp.path()).await;
    for i in 1..=35u64 {
        store.append_to_log(&[command(1, i)]).await.unwrap();
    }
    // Let the background creator settle.
    for _ in 0..100 {
        let (ready, inflight) = store.prepare_stats();
        assert!(ready <= 2);
        assert!(inflight <= 1);
        if ready == 2 && inflight == 0 {
            return;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    }
    panic!("prepare pool did not settle at its target size");
}
