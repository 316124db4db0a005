use crate::support::run_record;
use scripthub::error::HubError;
use scripthub::ledger::{Filter, Ledger};
use scripthub::model::RunStatus;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::thread;
use tempfile::tempdir;
use time::{Duration, OffsetDateTime};

fn at(seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + seconds)
}

#[test]
fn append_and_list_newest_first() {
    let dir = tempdir().expect("tempdir");
    let ledger = Ledger::new(dir.path().join("runs.jsonl"));

    ledger
        .append(&run_record("a", "one.sh", RunStatus::Succeeded, at(1)))
        .expect("append a");
    ledger
        .append(&run_record("c", "two.sh", RunStatus::Failed, at(3)))
        .expect("append c");
    ledger
        .append(&run_record("b", "one.sh", RunStatus::TimedOut, at(2)))
        .expect("append b");

    let ids: Vec<String> = ledger
        .list(None, 0, &Filter::default())
        .expect("list")
        .into_iter()
        .map(|run| run.id)
        .collect();
    assert_eq!(ids, vec!["c", "b", "a"]);

    let page: Vec<String> = ledger
        .list(Some(1), 1, &Filter::default())
        .expect("page")
        .into_iter()
        .map(|run| run.id)
        .collect();
    assert_eq!(page, vec!["b"]);
}

#[test]
fn equal_start_times_order_by_id() {
    let dir = tempdir().expect("tempdir");
    let ledger = Ledger::new(dir.path().join("runs.jsonl"));

    for id in ["2", "1", "3"] {
        ledger
            .append(&run_record(id, "same.sh", RunStatus::Succeeded, at(0)))
            .expect("append");
    }

    let ids: Vec<String> = ledger
        .list(None, 0, &Filter::default())
        .expect("list")
        .into_iter()
        .map(|run| run.id)
        .collect();
    assert_eq!(ids, vec!["3", "2", "1"]);
}

#[test]
fn list_filters_by_status_and_script() {
    let dir = tempdir().expect("tempdir");
    let ledger = Ledger::new(dir.path().join("runs.jsonl"));

    ledger
        .append(&run_record("1", "seo.py", RunStatus::Succeeded, at(1)))
        .expect("append");
    ledger
        .append(&run_record("2", "seo.py", RunStatus::Failed, at(2)))
        .expect("append");
    ledger
        .append(&run_record("3", "stock.py", RunStatus::Failed, at(3)))
        .expect("append");

    let failed = ledger
        .list(
            None,
            0,
            &Filter {
                status: Some(RunStatus::Failed),
                ..Filter::default()
            },
        )
        .expect("failed");
    assert_eq!(failed.len(), 2);

    let seo_failed = ledger
        .list(
            None,
            0,
            &Filter {
                status: Some(RunStatus::Failed),
                script: Some("SEO.py".to_string()),
            },
        )
        .expect("seo failed");
    assert_eq!(seo_failed.len(), 1);
    assert_eq!(seo_failed[0].id, "2");
}

#[test]
fn history_survives_reopening() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("runs.jsonl");

    {
        let ledger = Ledger::new(&path);
        ledger
            .append(&run_record("kept", "one.sh", RunStatus::Succeeded, at(1)))
            .expect("append");
    }

    let reopened = Ledger::new(&path);
    let run = reopened.get("kept").expect("get after reopen");
    assert_eq!(run.script_name, "one.sh");
    assert_eq!(run.stdout, "ok\n");
}

#[test]
fn get_unknown_is_not_found() {
    let dir = tempdir().expect("tempdir");
    let ledger = Ledger::new(dir.path().join("runs.jsonl"));
    assert!(matches!(ledger.get("nope"), Err(HubError::NotFound(_))));
}

#[test]
fn delete_removes_from_get_and_list() {
    let dir = tempdir().expect("tempdir");
    let ledger = Ledger::new(dir.path().join("runs.jsonl"));

    ledger
        .append(&run_record("1", "one.sh", RunStatus::Succeeded, at(1)))
        .expect("append");
    ledger
        .append(&run_record("2", "one.sh", RunStatus::Succeeded, at(2)))
        .expect("append");

    ledger.delete("1").expect("delete");
    assert!(matches!(ledger.get("1"), Err(HubError::NotFound(_))));
    assert!(matches!(ledger.delete("1"), Err(HubError::NotFound(_))));
    assert!(matches!(ledger.delete("missing"), Err(HubError::NotFound(_))));

    let runs = ledger.list(None, 0, &Filter::default()).expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, "2");
}

#[test]
fn list_ignores_malformed_lines() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("runs.jsonl");
    let ledger = Ledger::new(&path);

    ledger
        .append(&run_record("good", "one.sh", RunStatus::Succeeded, at(1)))
        .expect("append");

    let mut file = OpenOptions::new()
        .append(true)
        .open(&path)
        .expect("open for append");
    writeln!(file, "{{bad").expect("write malformed");

    let runs = ledger.list(None, 0, &Filter::default()).expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, "good");
}

#[test]
fn list_missing_file_is_empty() {
    let dir = tempdir().expect("tempdir");
    let ledger = Ledger::new(dir.path().join("missing.jsonl"));
    assert!(ledger.list(None, 0, &Filter::default()).expect("list").is_empty());
}

#[test]
fn compact_drops_tombstones_and_garbage() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("runs.jsonl");
    let ledger = Ledger::new(&path);

    for (id, secs) in [("1", 1), ("2", 2), ("3", 3)] {
        ledger
            .append(&run_record(id, "one.sh", RunStatus::Succeeded, at(secs)))
            .expect("append");
    }
    ledger.delete("2").expect("delete");
    fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "not json"))
        .expect("write garbage");

    assert_eq!(ledger.compact().expect("compact"), 2);

    let text = fs::read_to_string(&path).expect("read ledger");
    assert_eq!(text.lines().count(), 2);
    assert!(!text.contains("deleted"));

    let ids: Vec<String> = ledger
        .list(None, 0, &Filter::default())
        .expect("list")
        .into_iter()
        .map(|run| run.id)
        .collect();
    assert_eq!(ids, vec!["3", "1"]);
}

#[test]
fn non_terminal_run_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let ledger = Ledger::new(dir.path().join("runs.jsonl"));

    let mut run = run_record("open", "one.sh", RunStatus::Succeeded, at(1));
    run.finished_at = None;

    assert!(matches!(ledger.append(&run), Err(HubError::Storage(_))));
    assert!(ledger.list(None, 0, &Filter::default()).expect("list").is_empty());
}

#[test]
fn unavailable_storage_holds_run_until_flushed() {
    let dir = tempdir().expect("tempdir");
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").expect("write blocker");
    let ledger = Ledger::new(blocker.join("runs.jsonl"));

    let run = run_record("held", "one.sh", RunStatus::Failed, at(1));
    let err = ledger.append(&run).expect_err("storage should be unavailable");
    assert!(matches!(err, HubError::Storage(_)));
    assert_eq!(ledger.pending_count(), 1);

    // still visible while held
    assert_eq!(ledger.get("held").expect("pending get").id, "held");
    let listed = ledger.list(None, 0, &Filter::default()).expect("pending list");
    assert_eq!(listed.len(), 1);

    fs::remove_file(&blocker).expect("remove blocker");
    assert_eq!(ledger.flush_pending().expect("flush"), 1);
    assert_eq!(ledger.pending_count(), 0);

    let reopened = Ledger::new(blocker.join("runs.jsonl"));
    assert_eq!(reopened.get("held").expect("persisted").status, RunStatus::Failed);
}

#[test]
fn compaction_in_another_handle_keeps_concurrent_appends() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("runs.jsonl");
    let writer = Ledger::new(&path);
    let compactor = Ledger::new(&path);

    let appends = thread::spawn(move || {
        for i in 0..150 {
            let id = format!("run-{i:03}");
            writer
                .append(&run_record(&id, "one.sh", RunStatus::Succeeded, at(i)))
                .expect("append");
        }
    });

    while !appends.is_finished() {
        compactor.compact().expect("compact");
    }
    appends.join().expect("join writer");
    compactor.compact().expect("final compact");

    let runs = Ledger::new(&path)
        .list(None, 0, &Filter::default())
        .expect("list");
    assert_eq!(runs.len(), 150);
    assert_eq!(runs[0].id, "run-149");
}

#[test]
fn held_runs_survive_a_new_handle() {
    let dir = tempdir().expect("tempdir");
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").expect("write blocker");
    let path = blocker.join("runs.jsonl");

    {
        let first = Ledger::new(&path);
        let run = run_record("held", "one.sh", RunStatus::Failed, at(1));
        first.append(&run).expect_err("storage should be unavailable");
    }

    let second = Ledger::new(&path);
    assert_eq!(second.pending_count(), 1);
    assert_eq!(second.get("held").expect("held get").status, RunStatus::Failed);

    fs::remove_file(&blocker).expect("remove blocker");
    second
        .append(&run_record("next", "one.sh", RunStatus::Succeeded, at(2)))
        .expect("append after recovery");
    assert_eq!(second.pending_count(), 0);

    let ids: Vec<String> = Ledger::new(&path)
        .list(None, 0, &Filter::default())
        .expect("list")
        .into_iter()
        .map(|run| run.id)
        .collect();
    assert_eq!(ids, vec!["next", "held"]);
}

#[test]
fn unwritable_ledger_spools_next_to_it() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("runs.jsonl");
    fs::create_dir(&path).expect("directory in the ledger's place");

    let ledger = Ledger::new(&path);
    ledger
        .append(&run_record("spooled", "one.sh", RunStatus::Succeeded, at(1)))
        .expect_err("ledger path is a directory");

    let sidecar = dir.path().join("runs.jsonl.pending.jsonl");
    assert!(sidecar.exists());
    assert_eq!(Ledger::new(&path).pending_count(), 1);

    fs::remove_dir(&path).expect("remove directory");
    assert_eq!(Ledger::new(&path).flush_pending().expect("flush"), 1);
    assert!(!sidecar.exists());
    assert_eq!(
        Ledger::new(&path).get("spooled").expect("persisted").status,
        RunStatus::Succeeded
    );
}

#[test]
fn deleting_a_held_run_drops_it() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("runs.jsonl");
    fs::create_dir(&path).expect("directory in the ledger's place");

    let ledger = Ledger::new(&path);
    ledger
        .append(&run_record("gone", "one.sh", RunStatus::Failed, at(1)))
        .expect_err("ledger path is a directory");
    ledger.delete("gone").expect("delete held run");

    assert_eq!(Ledger::new(&path).pending_count(), 0);
    assert!(matches!(ledger.get("gone"), Err(HubError::NotFound(_))));
}
