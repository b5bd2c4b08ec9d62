use std::{
    borrow::Cow,
    sync::{Arc, LazyLock},
};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};

/// Central metrics singleton for admission pool metrics.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> = LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("db.client.connection.pool.name");
const KEY_STATE: Key = Key::from_static_str("db.client.connection.state");
const KEY_OUTCOME: Key = Key::from_static_str("db.client.connection.timeout.outcome");
const KEY_OPERATION: Key = Key::from_static_str("db.operation.name");
const KEY_ERROR: Key = Key::from_static_str("error.type");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of admitted and queued callers.
    pub(crate) conn_count: Gauge<u64>,
    /// The time it took to be admitted.
    pub(crate) wait_time: Histogram<f64>,
    /// The time between admission and release.
    pub(crate) use_time: Histogram<f64>,
    /// Duration of units of work run under admission control.
    pub(crate) op_duration: Histogram<f64>,
    /// The minimum number of idle slots, advisory.
    pub(crate) idle_min: Gauge<u64>,
    /// The maximum number of concurrently admitted callers.
    pub(crate) conn_max: Gauge<u64>,
    /// The number of admission waits that ran out of time.
    pub(crate) timeouts: Counter<u64>,
}

impl Metrics {
    /// Create new storage for pool metrics.
    ///
    /// All gates use the central [`POOL_METRICS`] singleton.
    pub(crate) fn new() -> Self {
        let meter = global::meter("crewdb");
        let conn_count = meter
            .u64_gauge("db.client.connection.count")
            .with_description(
                "The number of callers that are currently in state described by the state attribute.",
            )
            .build();
        let wait_time = meter
            .f64_histogram("db.client.connection.wait_time")
            .with_unit("s")
            .with_description("The time it took to be admitted to the shared client.")
            .build();
        let use_time = meter
            .f64_histogram("db.client.connection.use_time")
            .with_unit("s")
            .with_description("The time between admission and release of a slot.")
            .build();
        let op_duration = meter
            .f64_histogram("db.client.operation.duration")
            .with_unit("s")
            .with_description("Duration of units of work run under admission control.")
            .build();
        let idle_min = meter
            .u64_gauge("db.client.connection.idle.min")
            .with_description("The minimum number of idle slots, advisory.")
            .build();
        let conn_max = meter
            .u64_gauge("db.client.connection.max")
            .with_description("The maximum number of concurrently admitted callers.")
            .build();
        let timeouts = meter
            .u64_counter("db.client.connection.timeouts")
            .with_description("The number of admission waits that ran out of time.")
            .build();
        Metrics {
            conn_count,
            wait_time,
            use_time,
            op_duration,
            idle_min,
            conn_max,
            timeouts,
        }
    }

    /// Record static pool limits.
    pub(crate) fn record_limits(&self, label: &[KeyValue], max: usize, min_idle: usize) {
        self.conn_max.record(max as u64, label);
        self.idle_min.record(min_idle as u64, label);
    }

    /// Record current admitted and queued counts.
    pub(crate) fn record_counts(&self, label: &[KeyValue], admitted: usize, queued: usize) {
        self.conn_count
            .record(admitted as u64, &state_kv(label[0].clone(), "used"));
        self.conn_count
            .record(queued as u64, &state_kv(label[0].clone(), "pending"));
    }

    /// Count an admission wait that ran out of time.
    pub(crate) fn record_timeout(&self, label: &[KeyValue], outcome: &'static str) {
        self.timeouts.add(
            1,
            &[
                label[0].clone(),
                KeyValue::new(KEY_OUTCOME, Value::String(StringValue::from(outcome))),
            ],
        );
    }

    /// Record duration of a unit of work.
    pub(crate) fn record_operation(
        &self,
        label: &[KeyValue],
        operation: &'static str,
        secs: f64,
        failed: bool,
    ) {
        let op = KeyValue::new(KEY_OPERATION, Value::String(StringValue::from(operation)));
        if failed {
            let attrs = [label[0].clone(), op, KeyValue::new(KEY_ERROR, "_OTHER")];
            self.op_duration.record(secs, &attrs);
        } else {
            self.op_duration.record(secs, &[label[0].clone(), op]);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

pub(crate) fn pool_kv(name: Cow<'static, str>) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, Value::String(StringValue::from(name)))]
}

pub(crate) fn state_kv(name: KeyValue, state: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(state))),
    ]
}
