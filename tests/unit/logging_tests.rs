//! Unit tests for master-side log routing: prefixes, envelope unwrapping
//! and context merging.

use serde_json::{json, Value};

use procfleet::logging::{context_of, merge_context, LogLevel, ProcessLogger};
use procfleet::protocol::{encode_envelope, LogEnvelope};

use super::test_helpers::MemorySink;

fn envelope(level: LogLevel, message: &str, pairs: &[(&str, &str)]) -> String {
    encode_envelope(&LogEnvelope {
        level,
        message: message.to_owned(),
        context: context_of(pairs),
    })
}

#[test]
fn prefix_follows_group_host_display_order() {
    let sink = MemorySink::new();
    let logger = ProcessLogger::master(sink.clone());
    logger.info(
        "hello",
        context_of(&[("display", "cmd/1/1"), ("host", "localhost"), ("group", "test")]),
    );
    assert_eq!(sink.lines(), vec!["info - [test] [localhost] [cmd/1/1] hello"]);
}

#[test]
fn prefix_keys_are_removed_and_others_kept() {
    let sink = MemorySink::new();
    let logger = ProcessLogger::master(sink.clone());
    logger.error(
        "boom",
        context_of(&[("group", "test"), ("pid", "42")]),
    );

    let records = sink.records();
    assert_eq!(records[0].1, "[test] boom");
    assert!(!records[0].2.contains_key("group"));
    assert_eq!(records[0].2.get("pid"), Some(&Value::String("42".into())));
}

#[test]
fn missing_prefix_keys_are_skipped() {
    let sink = MemorySink::new();
    ProcessLogger::master(sink.clone()).notice("Stopping...", context_of(&[("display", "master")]));
    assert_eq!(sink.lines(), vec!["notice - [master] Stopping..."]);
}

#[test]
fn envelope_takes_level_and_message_from_inside() {
    let sink = MemorySink::new();
    let logger = ProcessLogger::master(sink.clone());
    let line = envelope(LogLevel::Emergency, "ONE_LINE", &[]);
    logger.info(
        &line,
        context_of(&[("display", "cmd/1/1"), ("host", "localhost"), ("group", "test")]),
    );
    assert_eq!(
        sink.lines(),
        vec!["emergency - [test] [localhost] [cmd/1/1] ONE_LINE"]
    );
}

#[test]
fn nested_envelopes_unwrap_recursively_keeping_the_outer_host() {
    let sink = MemorySink::new();
    let logger = ProcessLogger::master(sink.clone());

    // Worker on the far host, relayed by the far-side launcher, read over SSH.
    let worker_line = envelope(LogLevel::Emergency, "ONE_LINE", &[]);
    let relay_line = envelope(
        LogLevel::Info,
        &worker_line,
        &[("display", "single-line/1/1"), ("host", "localhost"), ("group", "test")],
    );
    logger.info(&relay_line, context_of(&[("host", "127.0.0.1"), ("group", "test")]));

    assert_eq!(
        sink.lines(),
        vec!["emergency - [test] [127.0.0.1] [single-line/1/1] ONE_LINE"]
    );
}

#[test]
fn merge_context_inner_wins_except_host() {
    let outer = context_of(&[("host", "outer"), ("group", "a"), ("extra", "kept")]);
    let inner = context_of(&[("host", "inner"), ("group", "b"), ("display", "d")]);

    let merged = merge_context(outer, inner);
    assert_eq!(merged.get("host"), Some(&json!("outer")));
    assert_eq!(merged.get("group"), Some(&json!("b")));
    assert_eq!(merged.get("display"), Some(&json!("d")));
    assert_eq!(merged.get("extra"), Some(&json!("kept")));
}

#[test]
fn merge_context_without_outer_host_keeps_inner_host() {
    let merged = merge_context(
        context_of(&[("group", "a")]),
        context_of(&[("host", "inner")]),
    );
    assert_eq!(merged.get("host"), Some(&json!("inner")));
}

#[test]
fn relay_logger_is_not_master() {
    assert!(!ProcessLogger::relay().is_master());
    assert!(ProcessLogger::master(MemorySink::new()).is_master());
}

#[test]
fn levels_render_lowercase_and_order_by_severity() {
    assert_eq!(LogLevel::Emergency.to_string(), "emergency");
    assert_eq!(LogLevel::Notice.as_str(), "notice");
    assert!(LogLevel::Debug < LogLevel::Error);
    assert_eq!(
        serde_json::to_value(LogLevel::Warning).unwrap(),
        json!("warning")
    );
}
