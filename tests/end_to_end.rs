//! End-to-end scenarios driven through the worker host, the same surface
//! a shell would use: import, nickname history, incremental top-up, and
//! the three merge outcomes (auto-dedupe, real conflict, mixed platforms
//! rejected).

use chatlab_core::format::registry::Registry;
use chatlab_core::model::Filter;
use chatlab_core::worker::{Operation, QueryOp, Request, WorkerHost, WorkerMessage};
use chatlab_core::AppPaths;
use std::io::Write;
use std::path::Path;

fn write_qq_export(path: &Path, messages: &str) {
    let mut f = std::fs::File::create(path).unwrap();
    write!(
        f,
        r#"{{"qq_export":{{"group_name":"friends","is_group":true}},"members":[{{"uin":"1","card":"Alice"}},{{"uin":"2","card":"Bob"}}],"messages":[{messages}]}}"#
    )
    .unwrap();
}

fn write_wechat_export(path: &Path, messages: &str) {
    let mut f = std::fs::File::create(path).unwrap();
    write!(
        f,
        r#"{{"wx_export":{{"chat_name":"friends","is_group":true}},"members":[{{"wxid":"1","remark":"Alice"}}],"msgList":[{messages}]}}"#
    )
    .unwrap();
}

fn request(host: &WorkerHost, op: Operation) -> Result<serde_json::Value, chatlab_core::ErrorPayload> {
    let (tx, rx) = crossbeam_channel::unbounded();
    host.submit(
        Request {
            id: "t".into(),
            op,
        },
        tx,
    );
    loop {
        match rx.recv().unwrap() {
            WorkerMessage::Progress(_) => continue,
            WorkerMessage::Response { result, .. } => return result,
        }
    }
}

#[test]
fn basic_import_exposes_members_and_messages() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("export.json");
    write_qq_export(
        &source,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"hello"},
           {"sender_uin":"2","sender_card":"Bob","time":1700000060,"msg_type":"text","content":"hi there"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let outcome = request(&host, Operation::ImportStream { source }).unwrap();
    let session_id = outcome["session_id"].as_str().unwrap().to_string();
    assert_eq!(outcome["total_messages"], 2);
    assert_eq!(outcome["dropped_messages"], 0);

    let members = request(
        &host,
        Operation::MemberList {
            session_id: session_id.clone(),
        },
    )
    .unwrap();
    assert_eq!(members.as_array().unwrap().len(), 2);

    let recent = request(
        &host,
        Operation::MsgRecent {
            session_id,
            filter: Filter::default(),
            limit: 10,
        },
    )
    .unwrap();
    assert_eq!(recent.as_array().unwrap().len(), 2);

    host.shutdown();
}

#[test]
fn drops_messages_with_unparsable_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("export.json");
    write_qq_export(
        &source,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"ok"},
           {"sender_uin":"1","sender_card":"Alice","time":"not-a-timestamp","msg_type":"text","content":"bad"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let outcome = request(&host, Operation::ImportStream { source }).unwrap();
    assert_eq!(outcome["total_messages"], 1);
    assert_eq!(outcome["dropped_messages"], 1);

    host.shutdown();
}

#[test]
fn incremental_import_only_adds_new_messages() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.json");
    write_qq_export(
        &first,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"a"}"#,
    );
    let second = dir.path().join("second.json");
    write_qq_export(
        &second,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"a"},
           {"sender_uin":"1","sender_card":"Alice","time":1700000100,"msg_type":"text","content":"b"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let outcome = request(&host, Operation::ImportStream { source: first }).unwrap();
    let session_id = outcome["session_id"].as_str().unwrap().to_string();

    let incremental = request(
        &host,
        Operation::ImportIncremental {
            session_id: session_id.clone(),
            source: second,
        },
    )
    .unwrap();
    assert_eq!(incremental["new"], 1);
    assert_eq!(incremental["duplicate"], 1);
    assert_eq!(incremental["total"], 2);

    host.shutdown();
}

#[test]
fn nickname_change_is_recorded_in_history() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("export.json");
    write_qq_export(
        &source,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"first"},
           {"sender_uin":"1","sender_card":"Alicia","time":1700000100,"msg_type":"text","content":"second"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let outcome = request(&host, Operation::ImportStream { source }).unwrap();
    let session_id = outcome["session_id"].as_str().unwrap().to_string();

    let members = request(
        &host,
        Operation::MemberList {
            session_id: session_id.clone(),
        },
    )
    .unwrap();
    let member_id = members[0]["id"].as_i64().unwrap();

    let history = request(
        &host,
        Operation::MemberNameHistory {
            session_id,
            member_id,
        },
    )
    .unwrap();
    assert!(history.as_array().unwrap().len() >= 2);

    host.shutdown();
}

#[test]
fn merge_auto_dedupes_identical_messages_across_sources() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.json");
    let b = dir.path().join("b.json");
    write_qq_export(
        &a,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"same"}"#,
    );
    write_qq_export(
        &b,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"same"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let report = request(
        &host,
        Operation::MergeCheckConflicts {
            merge_id: "m1".into(),
            sources: vec![a, b],
        },
    )
    .unwrap();
    assert_eq!(report["conflicts"].as_array().unwrap().len(), 0);
    assert_eq!(report["post_dedup_count"], 1);

    host.shutdown();
}

#[test]
fn merge_reports_genuine_content_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.json");
    let b = dir.path().join("b.json");
    write_qq_export(
        &a,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"left"}"#,
    );
    write_qq_export(
        &b,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"right"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let report = request(
        &host,
        Operation::MergeCheckConflicts {
            merge_id: "m2".into(),
            sources: vec![a, b],
        },
    )
    .unwrap();
    assert_eq!(report["conflicts"].as_array().unwrap().len(), 1);

    host.shutdown();
}

#[test]
fn merge_rejects_mixed_platforms() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.json");
    let b = dir.path().join("b.json");
    write_qq_export(
        &a,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"hi"}"#,
    );
    write_wechat_export(
        &b,
        r#"{"from_wxid":"1","from_remark":"Alice","createTime":1700000100,"type":1,"content":"hi"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let result = request(
        &host,
        Operation::MergeMergeFiles {
            merge_id: "m3".into(),
            sources: vec![a, b],
            group_name: "friends".into(),
            output_path: dir.path().join("out.json"),
            reimport: false,
        },
    );
    assert!(result.is_err());
    assert_eq!(result.unwrap_err().code, chatlab_core::ErrorCode::MixedPlatforms);

    host.shutdown();
}

#[test]
fn query_layer_is_reachable_through_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("export.json");
    write_qq_export(
        &source,
        r#"{"sender_uin":"1","sender_card":"Alice","time":1700000000,"msg_type":"text","content":"a a a"},
           {"sender_uin":"1","sender_card":"Alice","time":1700000001,"msg_type":"text","content":"a a a"},
           {"sender_uin":"1","sender_card":"Alice","time":1700000002,"msg_type":"text","content":"a a a"}"#,
    );

    let paths = AppPaths::new(dir.path().join("docs"), "chatlab-test");
    paths.ensure_dirs().unwrap();
    let host = WorkerHost::spawn(Registry::standard(), paths);

    let outcome = request(&host, Operation::ImportStream { source }).unwrap();
    let session_id = outcome["session_id"].as_str().unwrap().to_string();

    let chains = request(
        &host,
        Operation::Query {
            session_id,
            filter: Filter::default(),
            op: QueryOp::Repeat,
        },
    )
    .unwrap();
    assert_eq!(chains.as_array().unwrap().len(), 1);
    assert_eq!(chains[0]["length"], 3);

    host.shutdown();
}
