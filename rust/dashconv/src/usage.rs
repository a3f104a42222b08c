//! Index of which dashboards reference which destination metrics.
//!
//! A downstream reconciliation step uses it to check that every referenced
//! metric exists on the destination side. Entries are appended in
//! conversion order.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageEntry {
    Target {
        panel_id: String,
        panel_title: String,
        ref_id: String,
        expr: String,
    },
    Template {
        name: String,
        query: String,
    },
}

/// metric -> dashboard title -> entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MetricUsageIndex {
    metrics: BTreeMap<String, BTreeMap<String, Vec<UsageEntry>>>,
}

impl MetricUsageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metric: &str, dashboard: &str, entry: UsageEntry) {
        self.metrics
            .entry(metric.to_string())
            .or_default()
            .entry(dashboard.to_string())
            .or_default()
            .push(entry);
    }

    pub fn entries(&self, metric: &str, dashboard: &str) -> &[UsageEntry] {
        self.metrics
            .get(metric)
            .and_then(|dashboards| dashboards.get(dashboard))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.metrics.contains_key(metric)
    }

    /// Metrics that instantiate a template measurement token: the token
    /// itself or any `{token}_` name.
    pub fn instantiations_of(&self, token: &str) -> Vec<String> {
        let prefix = format!("{token}_");
        self.metrics
            .keys()
            .filter(|metric| metric.as_str() == token || metric.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Appends every entry of `other` after the entries already present.
    pub fn merge(&mut self, other: MetricUsageIndex) {
        for (metric, dashboards) in other.metrics {
            let target = self.metrics.entry(metric).or_default();
            for (dashboard, entries) in dashboards {
                target.entry(dashboard).or_default().extend(entries);
            }
        }
    }

    /// dashboard title -> metrics it references
    pub fn metrics_by_dashboard(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut report: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (metric, dashboards) in &self.metrics {
            for dashboard in dashboards.keys() {
                report
                    .entry(dashboard.clone())
                    .or_default()
                    .insert(metric.clone());
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn target(ref_id: &str) -> UsageEntry {
        UsageEntry::Target {
            panel_id: "1".into(),
            panel_title: "Traffic".into(),
            ref_id: ref_id.into(),
            expr: "avg(net_bytes_recv)".into(),
        }
    }

    #[test]
    fn records_in_order() {
        let mut index = MetricUsageIndex::new();
        index.record("net_bytes_recv", "Hosts", target("A"));
        index.record("net_bytes_recv", "Hosts", target("B"));
        assert_eq!(
            index.entries("net_bytes_recv", "Hosts"),
            &[target("A"), target("B")]
        );
        assert!(index.entries("net_bytes_recv", "Other").is_empty());
    }

    #[test]
    fn finds_instantiations_by_prefix() {
        let mut index = MetricUsageIndex::new();
        for metric in ["net_bytes_recv", "net_bytes_sent", "netstat_tcp", "net"] {
            index.record(metric, "Hosts", target("A"));
        }
        assert_eq!(
            index.instantiations_of("net"),
            vec!["net".to_string(), "net_bytes_recv".into(), "net_bytes_sent".into()]
        );
        assert!(index.instantiations_of("disk").is_empty());
    }

    #[test]
    fn merge_appends_and_reports_by_dashboard() {
        let mut first = MetricUsageIndex::new();
        first.record("cpu_usage_idle", "Hosts", target("A"));
        let mut second = MetricUsageIndex::new();
        second.record("cpu_usage_idle", "Hosts", target("B"));
        second.record("mem_used", "Memory", target("A"));

        first.merge(second);
        assert_eq!(first.len(), 2);
        assert_eq!(first.entries("cpu_usage_idle", "Hosts").len(), 2);

        let report = first.metrics_by_dashboard();
        assert_eq!(
            report.get("Hosts").map(|metrics| metrics.iter().cloned().collect::<Vec<_>>()),
            Some(vec!["cpu_usage_idle".to_string()])
        );
        assert!(report["Memory"].contains("mem_used"));
    }

    #[test]
    fn serializes_as_nested_maps() {
        let mut index = MetricUsageIndex::new();
        index.record(
            "net_bytes_recv",
            "Hosts",
            UsageEntry::Template {
                name: "host".into(),
                query: "label_values(net_bytes_recv,host)".into(),
            },
        );
        assert_eq!(
            serde_json::to_value(&index).unwrap(),
            serde_json::json!({
                "net_bytes_recv": {
                    "Hosts": [{"kind": "template", "name": "host", "query": "label_values(net_bytes_recv,host)"}]
                }
            })
        );
    }
}
