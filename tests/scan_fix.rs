//! End-to-end scan/fix flows over the file-atomic backend.

use logmend::core::audit::AuditLog;
use logmend::core::config::Config;
use logmend::core::engine::{DuplicatePolicy, MissingPolicy, OrphanPolicy, RepairPolicy};
use logmend::core::logfile::LogFile;
use logmend::core::manager::{DefectSelection, RepairManager};
use logmend::core::scanner;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn write_log(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn file_manager() -> RepairManager {
    RepairManager::new(Config::default(), AuditLog::disabled()).unwrap()
}

fn fix_all(manager: &mut RepairManager, path: &Path, policy: &RepairPolicy) {
    manager.load(path).unwrap();
    manager.scan().unwrap();
    manager
        .preview(&DefectSelection::All, policy, "user")
        .unwrap();
    let outcome = manager.confirm().unwrap();
    assert!(outcome.fully_applied(), "batch halted: {:?}", outcome.failed);
}

#[test]
fn test_interrupted_tool_call_scenario() {
    let dir = tempdir().unwrap();
    let path = write_log(
        dir.path(),
        "log.jsonl",
        concat!(
            r#"{"kind":"assistant","uuid":"a","session_id":"s","content":[{"type":"tool_use","id":"T1"}]}"#,
            "\n",
            r#"{"kind":"user","uuid":"u","parent_uuid":"a","session_id":"s","content":[{"type":"text","text":"next"}]}"#,
            "\n",
        ),
    );

    let mut manager = file_manager();
    manager.load(&path).unwrap();
    let report = manager.scan().unwrap();
    assert_eq!(report.defects.len(), 1);
    assert_eq!(report.defects[0].kind_str(), "missing_tool_result");

    manager
        .preview(&DefectSelection::All, &RepairPolicy::default(), "user")
        .unwrap();
    manager.confirm().unwrap();

    // on disk: u's content now leads with the cancelled result
    let repaired = LogFile::load(&path).unwrap();
    let u = repaired.record("u").unwrap();
    assert_eq!(u.blocks.len(), 2);
    assert_eq!(u.tool_result_count("T1"), 1);
    let first = u.blocks[0].raw();
    assert_eq!(first["tool_use_id"], "T1");
    assert_eq!(first["content"], "cancelled");
    assert_eq!(first["is_error"], true);

    // re-scan: empty
    assert!(manager.scan().unwrap().defects.is_empty());
}

#[test]
fn test_duplicate_tool_result_scenario() {
    let dir = tempdir().unwrap();
    let path = write_log(
        dir.path(),
        "log.jsonl",
        concat!(
            r#"{"kind":"user","uuid":"u","session_id":"s","content":[{"type":"tool_result","tool_use_id":"T2","content":"ok"},{"type":"tool_result","tool_use_id":"T2","content":"ok again"},{"type":"text","text":"done"}]}"#,
            "\n",
        ),
    );

    let mut manager = file_manager();
    fix_all(&mut manager, &path, &RepairPolicy::default());

    let repaired = LogFile::load(&path).unwrap();
    let u = repaired.record("u").unwrap();
    assert_eq!(u.blocks.len(), 2);
    assert_eq!(u.blocks[0].raw()["content"], "ok");
    assert_eq!(u.blocks[1].raw()["text"], "done");
    assert!(manager.scan().unwrap().defects.is_empty());
}

#[test]
fn test_explosion_guard_scenario() {
    let dir = tempdir().unwrap();
    let blocks: Vec<String> = (0..250)
        .map(|i| format!(r#"{{"type":"tool_result","tool_use_id":"T","content":"r{}"}}"#, i))
        .collect();
    let path = write_log(
        dir.path(),
        "log.jsonl",
        &format!(
            "{{\"kind\":\"user\",\"uuid\":\"u\",\"session_id\":\"s\",\"content\":[{}]}}\n",
            blocks.join(",")
        ),
    );

    let mut manager = file_manager();
    manager.load(&path).unwrap();
    let report = manager.scan().unwrap();
    assert_eq!(report.defects.len(), 1);
    match &report.defects[0] {
        logmend::core::scanner::Defect::DuplicateToolResult {
            drop_indexes,
            oom_risk,
            ..
        } => {
            assert_eq!(drop_indexes.len(), 249);
            assert!(oom_risk);
        }
        other => panic!("unexpected defect {:?}", other),
    }

    manager
        .preview(&DefectSelection::All, &RepairPolicy::default(), "user")
        .unwrap();
    let outcome = manager.confirm().unwrap();
    assert_eq!(outcome.applied.len(), 249);

    let repaired = LogFile::load(&path).unwrap();
    assert_eq!(repaired.record("u").unwrap().tool_result_count("T"), 1);
    assert!(manager.scan().unwrap().defects.is_empty());
}

#[test]
fn test_full_defect_set_then_rescan_is_empty() {
    let dir = tempdir().unwrap();
    let path = write_log(
        dir.path(),
        "log.jsonl",
        concat!(
            r#"{"kind":"user","uuid":"root","session_id":"s","timestamp":"2026-01-01T10:00:00Z","content":[{"type":"text","text":"start searching apples"}]}"#,
            "\n",
            r#"{"kind":"assistant","uuid":"a","parent_uuid":"root","session_id":"s","timestamp":"2026-01-01T10:00:01Z","content":[{"type":"tool_use","id":"T1"}]}"#,
            "\n",
            r#"{"kind":"user","uuid":"u","parent_uuid":"a","session_id":"s","timestamp":"2026-01-01T10:00:02Z","content":[{"type":"tool_result","tool_use_id":"T9","content":"x"},{"type":"tool_result","tool_use_id":"T9","content":"y"},{"type":"text","text":"hm"}]}"#,
            "\n",
            r#"{"kind":"user","uuid":"c","parent_uuid":"ghost","session_id":"s","timestamp":"2026-01-01T10:00:03Z","content":[{"type":"text","text":"start searching apples"}]}"#,
            "\n",
        ),
    );

    let mut manager = file_manager();
    manager.load(&path).unwrap();
    let report = manager.scan().unwrap();
    let kinds: Vec<_> = report.defects.iter().map(|d| d.kind_str()).collect();
    assert!(kinds.contains(&"missing_tool_result"));
    assert!(kinds.contains(&"duplicate_tool_result"));
    assert!(kinds.contains(&"orphan_parent"));

    fix_all(&mut manager, &path, &RepairPolicy::default());
    assert!(manager.scan().unwrap().defects.is_empty());
}

#[test]
fn test_fix_is_idempotent() {
    let dir = tempdir().unwrap();
    let source = concat!(
        r#"{"kind":"assistant","uuid":"a","session_id":"s","content":[{"type":"tool_use","id":"T1"}]}"#,
        "\n",
        r#"{"kind":"user","uuid":"u","parent_uuid":"a","session_id":"s","content":[{"type":"text","text":"next"}]}"#,
        "\n",
    );
    let path = write_log(dir.path(), "log.jsonl", source);

    let mut manager = file_manager();
    fix_all(&mut manager, &path, &RepairPolicy::default());
    let once = fs::read_to_string(&path).unwrap();

    // running the whole pipeline again changes nothing
    let mut manager2 = file_manager();
    manager2.load(&path).unwrap();
    assert!(manager2.scan().unwrap().defects.is_empty());
    assert_eq!(fs::read_to_string(&path).unwrap(), once);
}

#[test]
fn test_leave_policies_leave_defects_behind() {
    let dir = tempdir().unwrap();
    let path = write_log(
        dir.path(),
        "log.jsonl",
        concat!(
            r#"{"kind":"assistant","uuid":"a","session_id":"s","content":[{"type":"tool_use","id":"T1"}]}"#,
            "\n",
        ),
    );
    let before = fs::read_to_string(&path).unwrap();

    let policy = RepairPolicy {
        duplicates: DuplicatePolicy::KeepFirst,
        missing: MissingPolicy::Leave,
        orphans: OrphanPolicy::Leave,
    };
    let mut manager = file_manager();
    manager.load(&path).unwrap();
    manager.scan().unwrap();
    let preview = manager
        .preview(&DefectSelection::All, &policy, "user")
        .unwrap();
    assert!(preview.operations.is_empty());
    assert_eq!(preview.skipped.len(), 1);
    let outcome = manager.confirm().unwrap();
    assert_eq!(outcome.applied.len(), 0);

    // nothing was written
    assert_eq!(fs::read_to_string(&path).unwrap(), before);
    assert_eq!(manager.scan().unwrap().defects.len(), 1);
}

#[test]
fn test_log_with_only_invalid_lines() {
    let dir = tempdir().unwrap();
    let path = write_log(dir.path(), "log.jsonl", "not json\nalso not json\n");
    let log = LogFile::load(&path).unwrap();
    let report = scanner::scan(&log, &Config::default().scanner);
    assert!(report.defects.is_empty());
    assert_eq!(report.line_errors.len(), 2);
    // rewriting preserves the lines verbatim
    assert_eq!(log.render(), "not json\nalso not json\n");
}

#[test]
fn test_empty_and_single_record_logs() {
    let dir = tempdir().unwrap();
    let empty = write_log(dir.path(), "empty.jsonl", "");
    let single = write_log(
        dir.path(),
        "single.jsonl",
        "{\"kind\":\"user\",\"uuid\":\"u\"}\n",
    );

    for path in [empty, single] {
        let log = LogFile::load(&path).unwrap();
        let report = scanner::scan(&log, &Config::default().scanner);
        assert!(report.is_clean(), "{} should be clean", path.display());
    }
}

#[test]
fn test_cycle_aborts_load() {
    let dir = tempdir().unwrap();
    let path = write_log(
        dir.path(),
        "log.jsonl",
        concat!(
            r#"{"kind":"user","uuid":"a","parent_uuid":"b","session_id":"s"}"#,
            "\n",
            r#"{"kind":"user","uuid":"b","parent_uuid":"a","session_id":"s"}"#,
            "\n",
        ),
    );
    let mut manager = file_manager();
    let err = manager.load(&path).unwrap_err();
    assert!(matches!(
        err,
        logmend::core::error::MendError::StructuralError { .. }
    ));
    assert_eq!(err.exit_code(), 4);
}
