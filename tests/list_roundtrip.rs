//! Properties of the rewritten file list

mod common;

use backhaul::backup::FullBackupStrategy;
use backhaul::client::AgentConnection;
use backhaul::settings::TransferMode;
use backhaul::{FullFileBackup, Outcome, ServerContext, ServerStatus};
use common::*;
use std::path::Path;
use std::sync::Arc;

async fn run_once(
    root: &Path,
    list: &str,
    files: &[(&str, &[u8])],
    blockhash: bool,
    partial: &[&str],
) -> (backhaul::RunReport, Vec<u8>) {
    let mut settings = test_settings(root);
    if blockhash {
        settings.local_incr_file_transfer_mode = TransferMode::Blockhash;
    }
    let settings = Arc::new(settings);
    let dao = Arc::new(MemoryDao::default());
    let status = Arc::new(ServerStatus::new());

    let mut builder = MockAgent::builder(list);
    for (name, content) in files {
        builder = builder.file(name, content);
    }
    for name in partial {
        builder = builder.partial(name);
    }
    let (agent, _) = builder.build();
    let agent: Arc<dyn AgentConnection> = agent;

    let backup = FullFileBackup::new(
        ServerContext::new("test-server", ""),
        settings.clone(),
        dao,
        status,
        agent,
        Arc::new(FullBackupStrategy),
        1,
        "alpha",
        1,
        0,
    );
    let report = backup.run().await;
    let committed = settings.backupfolder.join("alpha/clientlist_0.ub");
    let pending = settings.backupfolder.join("alpha/clientlist_0.ub.new");
    let bytes = std::fs::read(&committed)
        .or_else(|_| std::fs::read(&pending))
        .expect("a new list was written");
    (report, bytes)
}

#[tokio::test]
async fn identical_inputs_produce_byte_identical_lists() {
    let content: &[u8] = b"stable content";
    let list = format!(
        "{}{}{}{}",
        dir_line("Volume"),
        hashed_file_line("a.txt", content, 1_700_000_000),
        hashed_file_line("b.txt", content, 1_700_000_001),
        leave_line()
    );
    let files: &[(&str, &[u8])] = &[("Volume/a.txt", content), ("Volume/b.txt", content)];

    let first_root = tempfile::tempdir().expect("tempdir");
    let second_root = tempfile::tempdir().expect("tempdir");
    let (report_a, list_a) = run_once(first_root.path(), &list, files, false, &[]).await;
    let (report_b, list_b) = run_once(second_root.path(), &list, files, false, &[]).await;

    assert_eq!(report_a.outcome, Outcome::Success);
    assert_eq!(report_b.outcome, Outcome::Success);
    assert_eq!(list_a, list_b);
}

#[tokio::test]
async fn written_list_is_a_subsequence_of_the_input() {
    let list = format!(
        "{}{}{}{}{}{}",
        dir_line("Volume"),
        file_line("kept.txt", 4, 100, &[]),
        dir_line("sub"),
        file_line("gone.txt", 4, 100, &[]),
        leave_line(),
        leave_line()
    );
    // "gone.txt" never transfers, so the rewrite must drop it
    let (agent, _) = MockAgent::builder(list.clone())
        .file("Volume/kept.txt", b"data")
        .failing("Volume/sub/gone.txt")
        .build();

    let root = tempfile::tempdir().expect("tempdir");
    let settings = Arc::new(test_settings(root.path()));
    let backup = FullFileBackup::new(
        ServerContext::new("test-server", ""),
        settings.clone(),
        Arc::new(MemoryDao::default()),
        Arc::new(ServerStatus::new()),
        agent,
        Arc::new(FullBackupStrategy),
        1,
        "alpha",
        1,
        0,
    );
    let report = backup.run().await;
    assert_eq!(report.outcome, Outcome::Success);

    let written = parse_list(
        &std::fs::read(settings.backupfolder.join("alpha/clientlist_0.ub"))
            .expect("committed list"),
    );
    let input = parse_list(list.as_bytes());
    assert!(is_subsequence(&input, &written));
    assert!(written.iter().any(|e| e.name == "kept.txt"));
    assert!(!written.iter().any(|e| e.name == "gone.txt"));
}

#[tokio::test]
async fn partial_files_keep_their_line_with_a_poisoned_timestamp() {
    let content: &[u8] = b"eight by.";
    let list = format!(
        "{}{}{}",
        dir_line("Volume"),
        file_line("part.bin", content.len() as i64, 1_700_000_000, &[]),
        leave_line()
    );
    let root = tempfile::tempdir().expect("tempdir");
    let (report, bytes) = run_once(
        root.path(),
        &list,
        &[("Volume/part.bin", content)],
        true,
        &["Volume/part.bin"],
    )
    .await;

    // Partial files are per-file events, not run failures
    assert_eq!(report.outcome, Outcome::Success);
    let written = parse_list(&bytes);
    let entry = written
        .iter()
        .find(|e| e.name == "part.bin")
        .expect("partial file kept in list");
    assert_ne!(
        entry.last_modified, 1_700_000_000,
        "partial files must look changed to the next incremental"
    );
}
