//! Persistence tests for gpfl's output files.
//!
//! These tests verify that the rule index, the flat rule file and the
//! prediction file written by one run can be read back by the next one.

use std::sync::Arc;

use gpfl::config::{ApplyMode, Config};
use gpfl::context::TemplateHandle;
use gpfl::graph::{Direction, Pair};
use gpfl::persist::predictions::{
    QueryDirection, format_prediction_block, query_string, read_prediction_file,
};
use gpfl::persist::rule_file::{format_line, read_rule_file};
use gpfl::persist::rule_index::{
    IndexRecord, InstanceRecord, RuleIndexWriter, order_by_handle, read_rules,
};
use gpfl::rule::{BodyAtom, Metrics, OverfittingCheck, QualityMeasure, Rule, RuleStats, Template};
use gpfl::symbol::SymbolTable;

fn symbols() -> SymbolTable {
    let mut s = SymbolTable::new();
    s.intern_relation("nationality");
    s.intern_relation("lives_in");
    s.intern_entity("alice");
    s.intern_entity("bob");
    s.intern_entity("france");
    s
}

fn metrics(quality: f64, valid_precision: f64) -> Metrics {
    Metrics {
        standard_conf: quality,
        smoothed_conf: quality,
        pca_conf: quality,
        apca_conf: quality,
        head_coverage: 0.5,
        valid_precision,
    }
}

fn template(s: &SymbolTable, closed: bool) -> Arc<Template> {
    Arc::new(Template {
        head: s.relation("nationality").unwrap(),
        body: vec![BodyAtom {
            relation: s.relation("lives_in").unwrap(),
            direction: Direction::Outgoing,
        }],
        closed,
        from_subject: true,
    })
}

fn no_overfitting() -> OverfittingCheck {
    OverfittingCheck {
        factor: 0.0,
        use_sigmoid: false,
        measure: QualityMeasure::SmoothedConf,
    }
}

#[test]
fn index_is_reordered_and_read_back() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("index").join("nationality.txt");
    let s = symbols();
    let france = s.entity("france").unwrap();

    let mut writer = RuleIndexWriter::create(&path).unwrap();
    writer
        .write(
            &IndexRecord {
                handle: TemplateHandle::new(4),
                template: template(&s, true),
                metrics: metrics(0.6, 0.6),
                instances: Vec::new(),
            },
            &s,
        )
        .unwrap();
    writer
        .write(
            &IndexRecord {
                handle: TemplateHandle::new(1),
                template: template(&s, false),
                metrics: metrics(0.3, 0.3),
                instances: vec![InstanceRecord {
                    anchor: france,
                    tail: None,
                    metrics: metrics(0.8, 0.8),
                }],
            },
            &s,
        )
        .unwrap();
    assert_eq!(writer.finish().unwrap(), 2);

    assert_eq!(order_by_handle(&path).unwrap(), 2);
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("ABS: 1\tOAR\t"));

    let target = s.relation("nationality").unwrap();
    let loaded = read_rules(&path, &s, target, &no_overfitting()).unwrap();
    assert_eq!(loaded.rules.len(), 2);
    assert_eq!(loaded.skipped, 0);
    let anchored = loaded.rules.iter().find(|r| !r.closed()).unwrap();
    assert_eq!(anchored.anchor(), Some(france));
    assert_eq!(anchored.quality(QualityMeasure::SmoothedConf), 0.8);

    // Another target sees nothing in this file.
    let other = s.relation("lives_in").unwrap();
    assert!(read_rules(&path, &s, other, &no_overfitting()).unwrap().rules.is_empty());
}

#[test]
fn overfitting_rules_are_dropped_on_read() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nationality.txt");
    let s = symbols();

    let mut writer = RuleIndexWriter::create(&path).unwrap();
    writer
        .write(
            &IndexRecord {
                handle: TemplateHandle::new(0),
                template: template(&s, true),
                metrics: metrics(0.9, 0.1),
                instances: Vec::new(),
            },
            &s,
        )
        .unwrap();
    writer.finish().unwrap();

    let strict = OverfittingCheck {
        factor: 1.0,
        ..no_overfitting()
    };
    let target = s.relation("nationality").unwrap();
    let loaded = read_rules(&path, &s, target, &strict).unwrap();
    assert!(loaded.rules.is_empty());
    assert_eq!(loaded.overfitting, 1);
}

#[test]
fn corrupt_index_lines_are_skipped() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nationality.txt");
    let s = symbols();
    let good = IndexRecord {
        handle: TemplateHandle::new(2),
        template: template(&s, true),
        metrics: metrics(0.5, 0.5),
        instances: Vec::new(),
    }
    .to_lines(&s);
    std::fs::write(&path, format!("garbage\nABS: x\tCAR\n{good}")).unwrap();

    let target = s.relation("nationality").unwrap();
    let loaded = read_rules(&path, &s, target, &no_overfitting()).unwrap();
    assert_eq!(loaded.rules.len(), 1);
    assert_eq!(loaded.skipped, 2);
}

#[test]
fn flat_rule_file_is_summarized() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("rules.txt");
    let s = symbols();
    let france = s.entity("france").unwrap();

    let mut closed = Rule::from_template(template(&s, true));
    closed.stats = RuleStats::from_metrics(metrics(0.4, 0.4));
    let mut anchored = Rule::head_anchored(template(&s, false), france);
    anchored.stats = RuleStats::from_metrics(metrics(0.7, 0.7));

    let text = [closed, anchored]
        .iter()
        .map(|r| format_line(r, &s, QualityMeasure::SmoothedConf))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(&path, format!("{text}\nnot a rule\n")).unwrap();

    let file = read_rule_file(&path).unwrap();
    assert_eq!(file.lines.len(), 2);
    assert_eq!(file.skipped, 1);
    assert_eq!(file.counts_by_tag().get("CAR"), Some(&1));
    assert_eq!(file.counts_by_tag().get("HAR"), Some(&1));
    assert_eq!(file.counts_by_length().get(&1), Some(&2));
    let top = file.top(1);
    assert_eq!(top[0].tag, "HAR");
    assert_eq!(top[0].quality, 0.7);
}

#[test]
fn prediction_blocks_read_back() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("predictions.txt");
    let s = symbols();
    let target = s.relation("nationality").unwrap();
    let alice = s.entity("alice").unwrap();
    let bob = s.entity("bob").unwrap();
    let france = s.entity("france").unwrap();

    let query = Pair::new(alice, france);
    let answer = query_string(&s, target, &query);
    let other = query_string(&s, target, &Pair::new(bob, france));
    let mut text = format_prediction_block(
        QueryDirection::Head,
        &answer,
        [(other.as_str(), 0.9), (answer.as_str(), 0.5)],
    );
    text.push_str(&format_prediction_block(
        QueryDirection::Tail,
        &answer,
        std::iter::empty::<(&str, f64)>(),
    ));
    std::fs::write(&path, text).unwrap();

    let file = read_prediction_file(&path).unwrap();
    assert_eq!(file.skipped, 0);
    assert_eq!(file.queries.len(), 2);
    let head = &file.queries[0];
    assert_eq!(head.direction, QueryDirection::Head);
    assert_eq!(head.relation, "nationality");
    assert_eq!(head.pair, query);
    assert_eq!(head.answers.len(), 2);
    assert_eq!(head.answers[1].pair, query);
    assert!(file.queries[1].answers.is_empty());
}

#[test]
fn config_survives_a_save_load_cycle() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("gpfl.toml");
    let mut config = Config::default();
    config.data.targets = vec!["nationality".into()];
    config.learn.quality_measure = QualityMeasure::ApcaConf;
    config.apply.mode = ApplyMode::Converge;
    config.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("apcaConf"));
    assert!(text.contains("converge"));
    assert_eq!(Config::load(&path).unwrap(), config);
}
