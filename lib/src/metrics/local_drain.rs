//! A local drain accumulating the metrics of one proxy
//!
//! The metrics are stored following this hierarchy (pseudo-rust):
//!
//! ```plain
//! LocalDrain {
//!     proxy_metrics: MetricsMap {
//!         map: BTreeMap<metric_name, AggregatedMetric>
//!     },
//!     destination_metrics: BTreeMap<"host:port", MetricsMap>
//! }
//! ```
use std::{collections::BTreeMap, fmt, time::Instant};

use hdrhistogram::Histogram;

use crate::metrics::{MetricError, MetricValue};

/// metrics as stored in the local drain
#[derive(Debug, Clone)]
pub enum AggregatedMetric {
    Gauge(usize),
    Count(i64),
    Time(Histogram<u32>),
}

impl AggregatedMetric {
    fn new(metric: MetricValue) -> Result<AggregatedMetric, MetricError> {
        match metric {
            MetricValue::Gauge(value) => Ok(AggregatedMetric::Gauge(value)),
            MetricValue::GaugeAdd(value) => Ok(AggregatedMetric::Gauge(value.max(0) as usize)),
            MetricValue::Count(value) => Ok(AggregatedMetric::Count(value)),
            MetricValue::Time(value) => {
                let mut histogram = Histogram::new(3).map_err(|error| {
                    MetricError::HistogramCreation {
                        time_metric: metric.clone(),
                        error: error.to_string(),
                    }
                })?;

                histogram.record(value as u64).map_err(|error| {
                    MetricError::TimeMetricRecordingError {
                        time_metric: metric.clone(),
                        error: error.to_string(),
                    }
                })?;

                Ok(AggregatedMetric::Time(histogram))
            }
        }
    }

    fn update(&mut self, key: &str, metric: MetricValue) -> Result<(), MetricError> {
        match (self, metric) {
            (AggregatedMetric::Gauge(v1), MetricValue::Gauge(v2)) => {
                *v1 = v2;
            }
            (AggregatedMetric::Gauge(v1), MetricValue::GaugeAdd(v2)) => {
                *v1 = (*v1 as i64 + v2).max(0) as usize;
            }
            (AggregatedMetric::Count(v1), MetricValue::Count(v2)) => {
                *v1 += v2;
            }
            (AggregatedMetric::Time(histogram), MetricValue::Time(v2)) => {
                histogram.record(v2 as u64).map_err(|error| {
                    MetricError::TimeMetricRecordingError {
                        time_metric: MetricValue::Time(v2),
                        error: error.to_string(),
                    }
                })?;
            }
            (existing, update) => {
                return Err(MetricError::WrongType {
                    key: key.to_owned(),
                    existing: existing.to_string(),
                    update,
                })
            }
        }
        Ok(())
    }

    pub fn as_count(&self) -> Option<i64> {
        match self {
            AggregatedMetric::Count(count) => Some(*count),
            _ => None,
        }
    }

    pub fn as_gauge(&self) -> Option<usize> {
        match self {
            AggregatedMetric::Gauge(gauge) => Some(*gauge),
            _ => None,
        }
    }

    pub fn as_percentiles(&self) -> Option<Percentiles> {
        match self {
            AggregatedMetric::Time(histogram) => Some(histogram_to_percentiles(histogram)),
            _ => None,
        }
    }
}

impl fmt::Display for AggregatedMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatedMetric::Gauge(gauge) => write!(f, "gauge {}", gauge),
            AggregatedMetric::Count(count) => write!(f, "count {}", count),
            AggregatedMetric::Time(histogram) => {
                write!(f, "time {}", histogram_to_percentiles(histogram))
            }
        }
    }
}

/// milliseconds at the usual percentiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Percentiles {
    pub samples: u64,
    pub p_50: u64,
    pub p_90: u64,
    pub p_99: u64,
    pub p_99_9: u64,
    pub p_100: u64,
}

impl fmt::Display for Percentiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples={} p50={} p90={} p99={} p99.9={} p100={}",
            self.samples, self.p_50, self.p_90, self.p_99, self.p_99_9, self.p_100
        )
    }
}

pub fn histogram_to_percentiles(hist: &Histogram<u32>) -> Percentiles {
    Percentiles {
        samples: hist.len(),
        p_50: hist.value_at_percentile(50.0),
        p_90: hist.value_at_percentile(90.0),
        p_99: hist.value_at_percentile(99.0),
        p_99_9: hist.value_at_percentile(99.9),
        p_100: hist.value_at_percentile(100.0),
    }
}

/// a map of metric_name -> metric value
#[derive(Debug, Clone, Default)]
pub struct MetricsMap {
    map: BTreeMap<String, AggregatedMetric>,
}

impl MetricsMap {
    fn receive_metric(&mut self, metric_name: &str, metric: MetricValue) -> Result<(), MetricError> {
        match self.map.get_mut(metric_name) {
            Some(existing_metric) => existing_metric.update(metric_name, metric),
            None => {
                let aggregated_metric = AggregatedMetric::new(metric)?;
                self.map.insert(metric_name.to_owned(), aggregated_metric);
                Ok(())
            }
        }
    }

    pub fn get(&self, metric_name: &str) -> Option<&AggregatedMetric> {
        self.map.get(metric_name)
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.map.keys().map(|k| k.to_owned()).collect()
    }

    fn dump(&self, prefix: &str, indent: &str, out: &mut String) {
        for (name, metric) in &self.map {
            out.push_str(&format!("{}{}{}: {}\n", indent, prefix, name, metric));
        }
    }
}

/// This gathers the metrics of a proxy, to be read once it stops
#[derive(Debug)]
pub struct LocalDrain {
    /// a prefix to metric keys, usually "relais."
    pub prefix: String,
    pub created: Instant,
    /// metrics of the whole proxy (metric_name -> metric value)
    pub proxy_metrics: MetricsMap,
    /// "host:port" -> metrics of the remote endpoints opened towards it
    destination_metrics: BTreeMap<String, MetricsMap>,
}

impl LocalDrain {
    pub fn new(prefix: String) -> Self {
        LocalDrain {
            prefix,
            created: Instant::now(),
            proxy_metrics: MetricsMap::default(),
            destination_metrics: BTreeMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.proxy_metrics = MetricsMap::default();
        self.destination_metrics.clear();
    }

    /// Records a metric for the whole proxy, and for the destination if
    /// there is one. Errors are logged, a metric never fails the caller.
    pub fn receive_metric(&mut self, key: &str, destination: Option<&str>, metric: MetricValue) {
        trace!(
            "receiving metric with key {}, destination: {:?}, metric data: {:?}",
            key,
            destination,
            metric
        );

        let mut receive_result = match destination {
            Some(destination) => self
                .destination_metrics
                .entry(destination.to_owned())
                .or_default()
                .receive_metric(key, metric.clone()),
            None => Ok(()),
        };
        if receive_result.is_ok() {
            receive_result = self.proxy_metrics.receive_metric(key, metric);
        }

        if let Err(e) = receive_result {
            error!("Could not receive metric: {}", e);
        }
    }

    pub fn get(&self, metric_name: &str) -> Option<&AggregatedMetric> {
        self.proxy_metrics.get(metric_name)
    }

    pub fn get_destination(&self, destination: &str, metric_name: &str) -> Option<&AggregatedMetric> {
        self.destination_metrics
            .get(destination)
            .and_then(|metrics| metrics.get(metric_name))
    }

    pub fn count(&self, metric_name: &str) -> i64 {
        self.get(metric_name)
            .and_then(AggregatedMetric::as_count)
            .unwrap_or(0)
    }

    pub fn destinations(&self) -> Vec<String> {
        self.destination_metrics.keys().cloned().collect()
    }

    /// proxy metric names, then the destination ones, sorted and deduplicated
    pub fn metric_names(&self) -> Vec<String> {
        let mut names = self.proxy_metrics.metric_names();
        for metrics in self.destination_metrics.values() {
            names.extend(metrics.metric_names());
        }
        names.sort();
        names.dedup();
        names
    }

    /// A human readable listing of every metric
    pub fn dump(&self) -> String {
        let mut out = format!(
            "metrics after {:.3}s\n",
            self.created.elapsed().as_secs_f64()
        );
        self.proxy_metrics.dump(&self.prefix, "", &mut out);
        for (destination, metrics) in &self.destination_metrics {
            out.push_str(&format!("{}:\n", destination));
            metrics.dump(&self.prefix, "  ", &mut out);
        }
        out
    }
}
