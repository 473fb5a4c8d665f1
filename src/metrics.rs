//! Observability sink.
//!
//! The gateway emits counters and histograms through the `MetricsSink` port;
//! the default sink accumulates in memory and renders the Prometheus text
//! exposition for `GET /metrics`. Exporter wiring (OTel, push gateways)
//! lives outside this crate.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Label-stable counter and histogram sink.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]);
    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
    /// Prometheus text exposition of everything recorded so far.
    fn render(&self) -> String;
}

/// Millisecond-oriented bucket bounds shared by all histograms.
const BUCKETS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
    60000.0, 120000.0,
];

#[derive(Clone)]
struct Histogram {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: vec![0; BUCKETS.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, bound) in BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

/// In-memory sink rendering Prometheus text format.
pub struct PromSink {
    counters: Mutex<BTreeMap<(String, String), u64>>,
    histograms: Mutex<BTreeMap<(String, String), Histogram>>,
}

fn label_string(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "'")))
        .collect::<Vec<_>>()
        .join(",")
}

impl PromSink {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
            histograms: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for PromSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PromSink {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let mut counters = self.counters.lock().unwrap();
        *counters
            .entry((name.to_string(), label_string(labels)))
            .or_insert(0) += 1;
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut histograms = self.histograms.lock().unwrap();
        histograms
            .entry((name.to_string(), label_string(labels)))
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    fn render(&self) -> String {
        let mut out = String::new();
        {
            let counters = self.counters.lock().unwrap();
            for ((name, labels), value) in counters.iter() {
                if labels.is_empty() {
                    out.push_str(&format!("{} {}\n", name, value));
                } else {
                    out.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
                }
            }
        }
        let histograms = self.histograms.lock().unwrap();
        for ((name, labels), histogram) in histograms.iter() {
            let sep = if labels.is_empty() { "" } else { "," };
            for (i, bound) in BUCKETS.iter().enumerate() {
                out.push_str(&format!(
                    "{}_bucket{{{}{}le=\"{}\"}} {}\n",
                    name, labels, sep, bound, histogram.bucket_counts[i]
                ));
            }
            out.push_str(&format!(
                "{}_bucket{{{}{}le=\"+Inf\"}} {}\n",
                name, labels, sep, histogram.count
            ));
            if labels.is_empty() {
                out.push_str(&format!("{}_sum {}\n", name, histogram.sum));
                out.push_str(&format!("{}_count {}\n", name, histogram.count));
            } else {
                out.push_str(&format!("{}_sum{{{}}} {}\n", name, labels, histogram.sum));
                out.push_str(&format!("{}_count{{{}}} {}\n", name, labels, histogram.count));
            }
        }
        out
    }
}
