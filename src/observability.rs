use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("parley.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("parley.client.request_errors");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("parley.client.request_duration_seconds");
pub(crate) static CLIENT_CANCELLED: Counter = Counter::new("parley.client.cancelled");

pub(crate) static STREAM_LINES: Counter = Counter::new("parley.stream.lines");
pub(crate) static STREAM_DELTAS: Counter = Counter::new("parley.stream.deltas");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("parley.stream.errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("parley.stream.bytes");
pub(crate) static STREAM_TTFB: Moments = Moments::new("parley.stream.ttfb_seconds");

pub(crate) static KEY_FILE_READS: Counter = Counter::new("parley.keys.file_reads");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_moments(&CLIENT_REQUEST_DURATION);
    collector.register_counter(&CLIENT_CANCELLED);

    collector.register_counter(&STREAM_LINES);
    collector.register_counter(&STREAM_DELTAS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_moments(&STREAM_TTFB);

    collector.register_counter(&KEY_FILE_READS);
}
