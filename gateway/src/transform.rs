//! The transform chain applied to parsed metric batches before forwarding.
//!
//! Transforms run per series, in the order they were composed, and must keep
//! series order intact so downstream deduplication sees a stable stream.

use crate::metrics_defs::DROPPED_SERIES_TOTAL;
use crate::prompb::{Label, TimeSeries, WriteRequest};
use regex::Regex;
use shared::counter;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub const NAME_LABEL: &str = "__name__";

#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    #[error("duplicate label {name:?} within a single series")]
    DuplicateLabel { name: String },
}

#[derive(thiserror::Error, Debug)]
#[error("invalid allow-list rule {rule:?}: {reason}")]
pub struct RuleError {
    rule: String,
    reason: String,
}

pub trait Transform: Send + Sync {
    /// Returns false to drop the series from the batch.
    fn transform(&self, series: &mut TimeSeries) -> Result<bool, TransformError>;
}

/// Ordered composition of transforms. An error from any transform fails the
/// whole batch.
#[derive(Clone, Default)]
pub struct MultiTransformer {
    transforms: Vec<Arc<dyn Transform>>,
}

impl MultiTransformer {
    pub fn with(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn apply(&self, request: &mut WriteRequest) -> Result<(), TransformError> {
        let mut kept = Vec::with_capacity(request.timeseries.len());
        for mut series in request.timeseries.drain(..) {
            let mut keep = true;
            for transform in &self.transforms {
                if !transform.transform(&mut series)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                kept.push(series);
            }
        }
        request.timeseries = kept;
        Ok(())
    }
}

enum MatchOp {
    Equal(String),
    Matches(Regex),
}

struct LabelMatcher {
    name: String,
    op: MatchOp,
}

impl LabelMatcher {
    fn matches(&self, series: &TimeSeries) -> bool {
        let Some(value) = series.label_value(&self.name) else {
            return false;
        };
        match &self.op {
            MatchOp::Equal(expected) => value == expected,
            MatchOp::Matches(regex) => regex.is_match(value),
        }
    }
}

struct AllowRule {
    matchers: Vec<LabelMatcher>,
}

impl AllowRule {
    fn matches(&self, series: &TimeSeries) -> bool {
        self.matchers.iter().all(|matcher| matcher.matches(series))
    }
}

/// Drops every series that matches none of the configured rules. Dropping is
/// silent; it is not an error for a client to push unsolicited metrics.
pub struct AllowList {
    rules: Vec<AllowRule>,
}

impl AllowList {
    pub fn new(rules: &[String]) -> Result<Self, RuleError> {
        let rules = rules
            .iter()
            .map(|rule| parse_rule(rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AllowList { rules })
    }
}

impl Transform for AllowList {
    fn transform(&self, series: &mut TimeSeries) -> Result<bool, TransformError> {
        if self.rules.iter().any(|rule| rule.matches(series)) {
            Ok(true)
        } else {
            counter!(DROPPED_SERIES_TOTAL).increment(1);
            Ok(false)
        }
    }
}

/// Parses a rule of the form `name`, `{label="v",other=~"re"}`, or
/// `name{label="v"}`. Matcher values must not contain commas.
fn parse_rule(rule: &str) -> Result<AllowRule, RuleError> {
    let invalid = |reason: &str| RuleError {
        rule: rule.to_string(),
        reason: reason.to_string(),
    };

    let (name, body) = match rule.find('{') {
        Some(open) => {
            let Some(body) = rule[open + 1..].strip_suffix('}') else {
                return Err(invalid("unbalanced braces"));
            };
            (rule[..open].trim(), body)
        }
        None => (rule.trim(), ""),
    };

    let mut matchers = Vec::new();
    if !name.is_empty() {
        matchers.push(LabelMatcher {
            name: NAME_LABEL.to_string(),
            op: MatchOp::Equal(name.to_string()),
        });
    }

    for matcher in body.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        let (label, op, raw_value) = if let Some((label, value)) = matcher.split_once("=~") {
            (label.trim(), true, value.trim())
        } else if let Some((label, value)) = matcher.split_once('=') {
            (label.trim(), false, value.trim())
        } else {
            return Err(invalid("matcher is not of the form label=\"value\""));
        };
        if label.is_empty() {
            return Err(invalid("matcher has no label name"));
        }

        let value = raw_value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(raw_value);

        let op = if op {
            let regex = Regex::new(&format!("^(?:{value})$"))
                .map_err(|e| invalid(&format!("bad regex: {e}")))?;
            MatchOp::Matches(regex)
        } else {
            MatchOp::Equal(value.to_string())
        };
        matchers.push(LabelMatcher {
            name: label.to_string(),
            op,
        });
    }

    if matchers.is_empty() {
        return Err(invalid("rule matches nothing"));
    }
    Ok(AllowRule { matchers })
}

/// Injects labels into every series, overwriting existing values.
pub struct AddLabels {
    labels: BTreeMap<String, String>,
}

impl AddLabels {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        AddLabels { labels }
    }
}

impl Transform for AddLabels {
    fn transform(&self, series: &mut TimeSeries) -> Result<bool, TransformError> {
        for (name, value) in &self.labels {
            match series.labels.iter().position(|label| &label.name == name) {
                Some(index) => series.labels[index].value = value.clone(),
                None => series.labels.push(Label {
                    name: name.clone(),
                    value: value.clone(),
                }),
            }
        }
        Ok(true)
    }
}

/// Strips the configured label names from every series.
pub struct Elide {
    names: HashSet<String>,
}

impl Elide {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Elide {
            names: names.into_iter().collect(),
        }
    }
}

impl Transform for Elide {
    fn transform(&self, series: &mut TimeSeries) -> Result<bool, TransformError> {
        series.labels.retain(|label| !self.names.contains(&label.name));
        Ok(true)
    }
}

/// Sorts labels by name and rejects series carrying the same label twice.
/// Runs last so every outgoing series is normalized.
pub struct SortLabels;

impl Transform for SortLabels {
    fn transform(&self, series: &mut TimeSeries) -> Result<bool, TransformError> {
        series.labels.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in series.labels.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(TransformError::DuplicateLabel {
                    name: pair[0].name.clone(),
                });
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(labels: &[(&str, &str)]) -> TimeSeries {
        TimeSeries {
            labels: labels
                .iter()
                .map(|(name, value)| Label {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
            samples: Vec::new(),
        }
    }

    fn batch(all: Vec<TimeSeries>) -> WriteRequest {
        WriteRequest { timeseries: all }
    }

    #[test]
    fn allow_list_keeps_matching_series_in_order() {
        let allow = AllowList::new(&[
            "up".to_string(),
            "{job=\"node\"}".to_string(),
            "kube_pod_info{namespace=~\"kube-.*\"}".to_string(),
        ])
        .expect("rules");
        let chain = MultiTransformer::default().with(Arc::new(allow));

        let mut request = batch(vec![
            series(&[("__name__", "up"), ("_id", "a")]),
            series(&[("__name__", "scrape_duration_seconds"), ("job", "node")]),
            series(&[("__name__", "kube_pod_info"), ("namespace", "kube-system")]),
            series(&[("__name__", "kube_pod_info"), ("namespace", "default")]),
            series(&[("__name__", "node_memory_bytes")]),
        ]);
        chain.apply(&mut request).expect("apply");

        let names: Vec<_> = request
            .timeseries
            .iter()
            .map(|s| s.label_value("__name__").unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["up", "scrape_duration_seconds", "kube_pod_info"]
        );
        assert_eq!(
            request.timeseries[2].label_value("namespace"),
            Some("kube-system")
        );
    }

    #[test]
    fn bad_rules_are_rejected_at_parse_time() {
        assert!(AllowList::new(&["{unclosed=\"x\"".to_string()]).is_err());
        assert!(AllowList::new(&["{nonsense}".to_string()]).is_err());
        assert!(AllowList::new(&["{a=~\"(\"}".to_string()]).is_err());
    }

    #[test]
    fn added_labels_overwrite_existing_values() {
        let add = AddLabels::new(BTreeMap::from([
            ("region".to_string(), "us".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]));
        let mut s = series(&[("__name__", "up"), ("region", "eu")]);
        add.transform(&mut s).expect("transform");
        assert_eq!(s.label_value("region"), Some("us"));
        assert_eq!(s.label_value("env"), Some("prod"));
    }

    #[test]
    fn elided_labels_are_removed() {
        let elide = Elide::new(["prometheus_replica".to_string()]);
        let mut s = series(&[("__name__", "up"), ("prometheus_replica", "r-0")]);
        elide.transform(&mut s).expect("transform");
        assert_eq!(s.label_value("prometheus_replica"), None);
        assert_eq!(s.label_value("__name__"), Some("up"));
    }

    #[test]
    fn labels_are_sorted_by_name() {
        let mut s = series(&[("zone", "a"), ("__name__", "up"), ("job", "node")]);
        SortLabels.transform(&mut s).expect("transform");
        let names: Vec<_> = s.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "job", "zone"]);
    }

    #[test]
    fn duplicate_labels_fail_the_batch() {
        let chain = MultiTransformer::default().with(Arc::new(SortLabels));
        let mut request = batch(vec![
            series(&[("__name__", "up")]),
            series(&[("job", "a"), ("job", "b")]),
        ]);
        let err = chain.apply(&mut request).unwrap_err();
        assert!(matches!(
            err,
            TransformError::DuplicateLabel { name } if name == "job"
        ));
    }

    #[test]
    fn full_chain_composes_in_order() {
        let chain = MultiTransformer::default()
            .with(Arc::new(
                AllowList::new(&["up".to_string()]).expect("rules"),
            ))
            .with(Arc::new(AddLabels::new(BTreeMap::from([(
                "region".to_string(),
                "us".to_string(),
            )]))))
            .with(Arc::new(Elide::new(["host".to_string()])))
            .with(Arc::new(SortLabels));

        let mut request = batch(vec![
            series(&[("host", "h1"), ("__name__", "up"), ("_id", "cluster-A")]),
            series(&[("__name__", "dropped_metric")]),
        ]);
        chain.apply(&mut request).expect("apply");

        assert_eq!(request.timeseries.len(), 1);
        let labels: Vec<_> = request.timeseries[0]
            .labels
            .iter()
            .map(|l| (l.name.as_str(), l.value.as_str()))
            .collect();
        assert_eq!(
            labels,
            vec![("__name__", "up"), ("_id", "cluster-A"), ("region", "us")]
        );
    }
}
