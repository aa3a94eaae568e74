//! Counters, gauges and timings of the proxy, fed by the diagnostics
//! subscriber of every endpoint
pub mod local_drain;

use std::time::Instant;

use crate::endpoint::{Endpoint, EndpointEvent, Role};

pub use self::local_drain::{AggregatedMetric, LocalDrain, Percentiles};

pub const METRICS_PREFIX: &str = "relais.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricValue {
    Gauge(usize),
    GaugeAdd(i64),
    Count(i64),
    /// milliseconds
    Time(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    #[error("could not create histogram for time metric {time_metric:?}: {error}")]
    HistogramCreation {
        time_metric: MetricValue,
        error: String,
    },
    #[error("could not record time metric {time_metric:?}: {error}")]
    TimeMetricRecordingError {
        time_metric: MetricValue,
        error: String,
    },
    #[error("tried to update metric {key} of value {existing} with an incompatible metric: {update:?}")]
    WrongType {
        key: String,
        existing: String,
        update: MetricValue,
    },
}

/// Records endpoint activity. Client endpoints are `frontend`, upstream ones
/// `backend`, the latter also keyed by destination.
#[derive(Debug)]
pub struct Diagnostics {
    drain: LocalDrain,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics {
            drain: LocalDrain::new(METRICS_PREFIX.to_owned()),
        }
    }

    pub fn drain(&self) -> &LocalDrain {
        &self.drain
    }

    pub fn into_drain(self) -> LocalDrain {
        self.drain
    }

    pub fn on_accept(&mut self) {
        self.drain
            .receive_metric("frontend.connections", None, MetricValue::Count(1));
        self.drain
            .receive_metric("frontend.active", None, MetricValue::GaugeAdd(1));
    }

    pub fn on_refused(&mut self) {
        self.drain
            .receive_metric("frontend.refused", None, MetricValue::Count(1));
    }

    pub fn record(&mut self, endpoint: &Endpoint, event: &EndpointEvent) {
        let (side, destination) = match endpoint.role {
            Role::Local => ("frontend", None),
            Role::Remote => ("backend", Some(endpoint.name())),
        };
        let destination = destination.as_deref();

        match event {
            EndpointEvent::Input(data) => self.drain.receive_metric(
                &format!("{}.bytes_in", side),
                destination,
                MetricValue::Count(data.len() as i64),
            ),
            EndpointEvent::Connected => {
                self.drain
                    .receive_metric("backend.connections", destination, MetricValue::Count(1));
                self.drain
                    .receive_metric("backend.active", None, MetricValue::GaugeAdd(1));
                self.drain.receive_metric(
                    "backend.connect_time",
                    destination,
                    MetricValue::Time(elapsed_ms(endpoint.created)),
                );
            }
            EndpointEvent::Disconnected => match endpoint.role {
                Role::Local => {
                    self.drain
                        .receive_metric("frontend.active", None, MetricValue::GaugeAdd(-1));
                    self.drain.receive_metric(
                        "frontend.connection_time",
                        None,
                        MetricValue::Time(elapsed_ms(endpoint.created)),
                    );
                }
                Role::Remote if endpoint.connected_at.is_some() => self
                    .drain
                    .receive_metric("backend.active", None, MetricValue::GaugeAdd(-1)),
                Role::Remote => {}
            },
            EndpointEvent::Error(error) => self.drain.receive_metric(
                &format!("{}.errors.{}", side, error.kind()),
                destination,
                MetricValue::Count(1),
            ),
            EndpointEvent::Drained => self.drain.receive_metric(
                &format!("{}.drained", side),
                destination,
                MetricValue::Count(1),
            ),
        }
    }
}

fn elapsed_ms(since: Instant) -> usize {
    since.elapsed().as_millis() as usize
}
