//! The structured test-output document: a `<testrun>` root holding one
//! top-level `<suite>`, which nests further suites, `<meta>` items, and
//! `<test>` leaves with optional `<log>` lines. The parser walks the tree
//! and produces the same run/result shape the live collector builds;
//! the writer renders a run back into the document for CI jobs to upload.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::errors::ParseError;
use crate::metadata;
use crate::model::{GradingPayload, TestResult, TestRun, TestStatus, GRADING_MARKER};

#[derive(Debug)]
pub struct ParsedRun {
    pub run: TestRun,
    pub results: Vec<TestResult>,
}

pub fn parse_document(text: &str) -> Result<ParsedRun, ParseError> {
    let doc = roxmltree::Document::parse(text)?;
    let root = doc.root_element();
    let suite = match root.tag_name().name() {
        "testrun" => root
            .children()
            .find(|n| n.has_tag_name("suite"))
            .ok_or(ParseError::Missing("top-level suite"))?,
        "suite" => root,
        other => {
            return Err(ParseError::Malformed(format!(
                "unexpected root element <{}>",
                other
            )))
        }
    };

    let mut items: BTreeMap<String, String> = BTreeMap::new();
    let mut results: Vec<TestResult> = Vec::new();
    let mut test_duration = 0.0_f64;
    walk_suite(suite, &mut items, &mut results, &mut test_duration)?;

    let started_at = root
        .attribute("generated")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let suite_name = suite.attribute("name").unwrap_or("unnamed").to_string();
    let mut run = TestRun::new(suite_name, started_at);
    for result in &results {
        match result.status {
            TestStatus::Pass => run.passed += 1,
            TestStatus::Fail => run.failed += 1,
            TestStatus::Skip => run.skipped += 1,
        }
    }
    run.total = results.len() as u32;
    run.duration_seconds = suite
        .attribute("duration")
        .and_then(|v| v.parse().ok())
        .unwrap_or(test_duration);

    // Absent items fall through to the resolver's environment tier.
    metadata::resolve(&items).apply_to(&mut run);

    Ok(ParsedRun { run, results })
}

fn walk_suite(
    node: roxmltree::Node<'_, '_>,
    items: &mut BTreeMap<String, String>,
    results: &mut Vec<TestResult>,
    test_duration: &mut f64,
) -> Result<(), ParseError> {
    for child in node.children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "meta" => {
                if let Some(key) = child.attribute("name") {
                    let key = key.trim().to_ascii_lowercase();
                    let value = child.text().unwrap_or("").trim().to_string();
                    // Outermost suite wins when an item repeats deeper down.
                    items.entry(key).or_insert(value);
                }
            }
            "suite" => walk_suite(child, items, results, test_duration)?,
            "test" => results.push(parse_test(child, test_duration)?),
            _ => {}
        }
    }
    Ok(())
}

fn parse_test(
    node: roxmltree::Node<'_, '_>,
    test_duration: &mut f64,
) -> Result<TestResult, ParseError> {
    let name = node.attribute("name").ok_or(ParseError::Missing("test name"))?;
    let status = TestStatus::parse(node.attribute("status").unwrap_or(""));
    if let Some(d) = node.attribute("duration").and_then(|v| v.parse::<f64>().ok()) {
        *test_duration += d;
    }
    let mut result = TestResult::status_only(name, status);
    let logs: Vec<&str> = node
        .children()
        .filter(|n| n.has_tag_name("log"))
        .filter_map(|n| n.text())
        .collect();
    if let Some(payload) = GradingPayload::extract(logs.iter().copied()) {
        payload.apply_to(&mut result);
    }
    Ok(result)
}

pub fn write_document(run: &TestRun, results: &[TestResult]) -> String {
    let mut xml = String::new();
    xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    xml.push('\n');
    xml.push_str(&format!(
        r#"<testrun generated="{}">"#,
        run.started_at.to_rfc3339()
    ));
    xml.push('\n');
    xml.push_str(&format!(
        r#"  <suite name="{}" duration="{}">"#,
        escape(&run.suite),
        run.duration_seconds
    ));
    xml.push('\n');

    for (key, value) in meta_items(run) {
        xml.push_str(&format!(
            r#"    <meta name="{}">{}</meta>"#,
            escape(key),
            escape(&value)
        ));
        xml.push('\n');
    }

    for r in results {
        xml.push_str(&format!(
            r#"    <test name="{}" status="{}">"#,
            escape(&r.test_name),
            r.status.as_str()
        ));
        let payload = GradingPayload {
            v: 1,
            score: r.score,
            question: r.question.clone(),
            expected: r.expected.clone(),
            actual: r.actual.clone(),
            reason: r.reason.clone(),
        };
        if r.score.is_some() || r.reason.is_some() || r.expected.is_some() {
            if let Ok(json) = serde_json::to_string(&payload) {
                xml.push_str(&format!(
                    "<log>{} {}</log>",
                    GRADING_MARKER,
                    escape(&json)
                ));
            }
        }
        xml.push_str("</test>\n");
    }

    xml.push_str("  </suite>\n</testrun>\n");
    xml
}

pub fn write_xml(run: &TestRun, results: &[TestResult], out: &Path) -> anyhow::Result<()> {
    std::fs::write(out, write_document(run, results))?;
    Ok(())
}

fn meta_items(run: &TestRun) -> Vec<(&'static str, String)> {
    let mut items = Vec::new();
    if !run.model.is_empty() {
        items.push(("model", run.model.clone()));
    }
    let optional = [
        ("model_release", &run.model_release),
        ("commit", &run.commit_sha),
        ("branch", &run.branch),
        ("pipeline_url", &run.pipeline_url),
        ("runner", &run.runner),
        ("runner_tags", &run.runner_tags),
        ("harness_version", &run.harness_version),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            items.push((key, v.clone()));
        }
    }
    if let Some(t) = run.temperature {
        items.push(("temperature", t.to_string()));
    }
    if let Some(s) = run.seed {
        items.push(("seed", s.to_string()));
    }
    if let Some(p) = run.top_p {
        items.push(("top_p", p.to_string()));
    }
    if let Some(k) = run.top_k {
        items.push(("top_k", k.to_string()));
    }
    if let Some(c) = run.cost_usd {
        items.push(("cost_usd", c.to_string()));
    }
    items
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_suites_aggregate_into_one_run() {
        let doc = r#"<?xml version="1.0"?>
<testrun generated="2026-03-01T10:00:00+00:00">
  <suite name="nightly">
    <meta name="Model">sonnet-4</meta>
    <meta name="temperature">0.2</meta>
    <suite name="math">
      <test name="add" status="pass" duration="1.5"/>
      <test name="div" status="fail" duration="2.0">
        <log>grading-json: {"v":1,"score":0.1,"expected":"2","actual":"3","reason":"off by one"}</log>
      </test>
    </suite>
    <suite name="logic">
      <suite name="deep">
        <test name="syllogism" status="skip"/>
      </suite>
    </suite>
  </suite>
</testrun>"#;
        let parsed = parse_document(doc).unwrap();
        assert_eq!(parsed.run.suite, "nightly");
        assert_eq!(parsed.run.total, 3);
        assert_eq!(parsed.run.passed, 1);
        assert_eq!(parsed.run.failed, 1);
        assert_eq!(parsed.run.skipped, 1);
        assert_eq!(parsed.run.model, "sonnet-4");
        assert_eq!(parsed.run.temperature, Some(0.2));
        assert!((parsed.run.duration_seconds - 3.5).abs() < 1e-9);

        assert_eq!(parsed.results.len(), 3);
        let div = parsed.results.iter().find(|r| r.test_name == "div").unwrap();
        assert_eq!(div.score, Some(0.1));
        assert_eq!(div.reason.as_deref(), Some("off by one"));
    }

    #[test]
    fn zero_test_document_parses_to_zero_counts() {
        let doc = r#"<testrun><suite name="empty"/></testrun>"#;
        let parsed = parse_document(doc).unwrap();
        assert_eq!(parsed.run.total, 0);
        assert_eq!(parsed.run.passed, 0);
        assert!(parsed.results.is_empty());
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        assert!(matches!(
            parse_document("<testrun><suite"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_document("<other/>"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_document("<testrun/>"),
            Err(ParseError::Missing(_))
        ));
    }

    #[test]
    fn legacy_alias_metadata_keys_resolve() {
        let doc = r#"<testrun>
  <suite name="s">
    <meta name="model_name">haiku-3</meta>
    <meta name="git_sha">deadbeef</meta>
    <test name="t" status="pass"/>
  </suite>
</testrun>"#;
        let parsed = parse_document(doc).unwrap();
        assert_eq!(parsed.run.model, "haiku-3");
        assert_eq!(parsed.run.commit_sha.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn outermost_metadata_item_wins() {
        let doc = r#"<testrun>
  <suite name="s">
    <meta name="model">outer</meta>
    <suite name="inner">
      <meta name="model">inner</meta>
      <test name="t" status="pass"/>
    </suite>
  </suite>
</testrun>"#;
        let parsed = parse_document(doc).unwrap();
        assert_eq!(parsed.run.model, "outer");
    }

    #[test]
    fn written_document_parses_back() {
        let mut run = TestRun::new("roundtrip", Utc::now());
        run.model = "sonnet-4".into();
        run.commit_sha = Some("cafe01".into());
        run.total = 1;
        run.passed = 1;
        let results = vec![TestResult {
            test_name: "t1".into(),
            status: TestStatus::Pass,
            score: Some(0.9),
            question: Some("2+2?".into()),
            expected: Some("4".into()),
            actual: Some("4".into()),
            reason: Some("exact".into()),
        }];
        let doc = write_document(&run, &results);
        let parsed = parse_document(&doc).unwrap();
        assert_eq!(parsed.run.model, "sonnet-4");
        assert_eq!(parsed.run.total, 1);
        assert_eq!(parsed.results[0].score, Some(0.9));
        assert_eq!(parsed.results[0].expected.as_deref(), Some("4"));
    }
}
