//! Export of [`MetricsSnapshot`]s through OpenTelemetry instruments.
//!
//! The runtime keeps cumulative totals. Gauges take the snapshot values as
//! they are; counters are fed the difference from the previously recorded
//! snapshot so the exported sums match the runtime totals.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, MeterProvider as _};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use sigbot_types::breaker::CircuitState;
use sigbot_types::metrics::MetricsSnapshot;

use crate::metric_names::*;

struct Instruments {
    queue_depth: Gauge<u64>,
    queue_latency_mean: Gauge<f64>,
    overflow_drops: Counter<u64>,
    processed: Counter<u64>,
    parse_errors: Counter<u64>,
    command_calls: Counter<u64>,
    command_latency_mean: Gauge<f64>,
    dlq_backlog: Gauge<u64>,
    dlq_events: Counter<u64>,
    breaker_state: Gauge<u64>,
    rate_limit_waits: Counter<u64>,
    ingest_pauses: Counter<u64>,
}

impl Instruments {
    fn new(provider: &SdkMeterProvider) -> Self {
        let meter = provider.meter("sigbot");
        Self {
            queue_depth: meter
                .u64_gauge(QUEUE_DEPTH)
                .with_description("Items waiting per queue shard")
                .build(),
            queue_latency_mean: meter
                .f64_gauge(QUEUE_LATENCY_MEAN)
                .with_unit("ms")
                .build(),
            overflow_drops: meter.u64_counter(QUEUE_OVERFLOW_DROPS).build(),
            processed: meter.u64_counter(MESSAGES_PROCESSED).build(),
            parse_errors: meter.u64_counter(PARSE_ERRORS).build(),
            command_calls: meter.u64_counter(COMMAND_CALLS).build(),
            command_latency_mean: meter
                .f64_gauge(COMMAND_LATENCY_MEAN)
                .with_unit("ms")
                .build(),
            dlq_backlog: meter.u64_gauge(DLQ_BACKLOG).build(),
            dlq_events: meter.u64_counter(DLQ_EVENTS).build(),
            breaker_state: meter.u64_gauge(BREAKER_STATE).build(),
            rate_limit_waits: meter.u64_counter(RATE_LIMIT_WAITS).build(),
            ingest_pauses: meter.u64_counter(INGEST_PAUSES).build(),
        }
    }
}

/// Counter increments between two snapshots.
///
/// A total that went backwards (a new runtime behind the same exporter)
/// yields its full current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterDeltas {
    pub processed: u64,
    pub parse_errors: u64,
    pub overflow_drops: u64,
    /// Keyed by `(command, outcome)`.
    pub command_calls: BTreeMap<(String, &'static str), u64>,
    /// Keyed by event name.
    pub dlq_events: BTreeMap<&'static str, u64>,
    /// Keyed by bucket upper bound in milliseconds.
    pub rate_limit_waits: BTreeMap<u64, u64>,
    pub ingest_pauses: BTreeMap<String, u64>,
}

fn delta(previous: u64, current: u64) -> u64 {
    if current >= previous { current - previous } else { current }
}

fn map_deltas<K: Ord + Clone>(previous: &BTreeMap<K, u64>, current: &BTreeMap<K, u64>) -> BTreeMap<K, u64> {
    current
        .iter()
        .filter_map(|(key, &value)| {
            let d = delta(previous.get(key).copied().unwrap_or(0), value);
            (d > 0).then(|| (key.clone(), d))
        })
        .collect()
}

impl CounterDeltas {
    pub fn between(previous: &MetricsSnapshot, current: &MetricsSnapshot) -> Self {
        let mut command_calls = BTreeMap::new();
        for (name, stats) in &current.commands {
            let before = previous.commands.get(name).cloned().unwrap_or_default();
            for (outcome, d) in [
                ("success", delta(before.successes, stats.successes)),
                ("failure", delta(before.failures, stats.failures)),
            ] {
                if d > 0 {
                    command_calls.insert((name.clone(), outcome), d);
                }
            }
        }

        let dlq_events = [
            ("sent", delta(previous.dlq.sent, current.dlq.sent)),
            ("ready", delta(previous.dlq.ready, current.dlq.ready)),
            ("requeued", delta(previous.dlq.requeued, current.dlq.requeued)),
            ("discarded", delta(previous.dlq.discarded, current.dlq.discarded)),
        ]
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .collect();

        Self {
            processed: delta(previous.messages_processed, current.messages_processed),
            parse_errors: delta(previous.parse_errors, current.parse_errors),
            overflow_drops: delta(previous.overflow_drops, current.overflow_drops),
            command_calls,
            dlq_events,
            rate_limit_waits: map_deltas(&previous.rate_limiter.wait_buckets, &current.rate_limiter.wait_buckets),
            ingest_pauses: map_deltas(&previous.ingest_pauses, &current.ingest_pauses),
        }
    }
}

/// Records runtime snapshots into an OpenTelemetry meter provider.
pub struct MetricsExporter {
    provider: SdkMeterProvider,
    instruments: Instruments,
    last: Mutex<MetricsSnapshot>,
}

impl MetricsExporter {
    /// Exporter that prints to stdout every `interval`.
    pub fn stdout(interval: Duration) -> Self {
        let reader = PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(interval)
            .build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        opentelemetry::global::set_meter_provider(provider.clone());
        Self::with_provider(provider)
    }

    pub fn with_provider(provider: SdkMeterProvider) -> Self {
        let instruments = Instruments::new(&provider);
        Self {
            provider,
            instruments,
            last: Mutex::new(MetricsSnapshot::default()),
        }
    }

    /// Record `snapshot`; returns the counter increments that were applied.
    pub fn record(&self, snapshot: &MetricsSnapshot) -> CounterDeltas {
        let deltas = {
            let mut last = self.last.lock().expect("metrics exporter lock poisoned");
            let deltas = CounterDeltas::between(&last, snapshot);
            *last = snapshot.clone();
            deltas
        };
        let i = &self.instruments;

        for (shard, depth) in snapshot.queue_depths.iter().enumerate() {
            i.queue_depth.record(*depth as u64, &[KeyValue::new(ATTR_SHARD, shard as i64)]);
        }
        if let Some(mean) = snapshot.mean_queue_latency_ms {
            i.queue_latency_mean.record(mean, &[]);
        }
        i.dlq_backlog.record(snapshot.dlq.backlog, &[]);

        for (name, stats) in &snapshot.commands {
            if let Some(mean) = stats.mean_latency_ms() {
                i.command_latency_mean
                    .record(mean, &[KeyValue::new(ATTR_COMMAND, name.clone())]);
            }
        }
        for (endpoint, current) in &snapshot.breaker_states {
            for state in CircuitState::ALL {
                i.breaker_state.record(
                    u64::from(state == *current),
                    &[
                        KeyValue::new(ATTR_ENDPOINT, endpoint.clone()),
                        KeyValue::new(ATTR_STATE, state.to_string()),
                    ],
                );
            }
        }

        i.processed.add(deltas.processed, &[]);
        i.parse_errors.add(deltas.parse_errors, &[]);
        i.overflow_drops.add(deltas.overflow_drops, &[]);
        for ((name, outcome), d) in &deltas.command_calls {
            i.command_calls.add(
                *d,
                &[KeyValue::new(ATTR_COMMAND, name.clone()), KeyValue::new(ATTR_OUTCOME, *outcome)],
            );
        }
        for (event, d) in &deltas.dlq_events {
            i.dlq_events.add(*d, &[KeyValue::new(ATTR_EVENT, *event)]);
        }
        for (bucket, d) in &deltas.rate_limit_waits {
            i.rate_limit_waits.add(*d, &[KeyValue::new(ATTR_LE_MS, *bucket as i64)]);
        }
        for (reason, d) in &deltas.ingest_pauses {
            i.ingest_pauses.add(*d, &[KeyValue::new(ATTR_REASON, reason.clone())]);
        }

        deltas
    }

    /// Flush and stop the reader. Errors are reported, not returned.
    pub fn shutdown(&self) {
        if let Err(e) = self.provider.shutdown() {
            tracing::warn!(error = %e, "metrics provider shutdown error");
        }
    }
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter").finish_non_exhaustive()
    }
}
