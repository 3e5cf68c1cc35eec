use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    analysis_counter: Counter<u64>,
    analysis_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("opg_analysis");
        global::set_meter_provider(provider);

        let analysis_counter = meter
            .u64_counter("analysis_requests_total")
            .with_description("Total number of analysis requests by outcome")
            .build();

        // Runs take anywhere from a second to the full two minute budget.
        let boundaries = generate_boundaries((500, 5_000, 20_000, 60_000, 120_000));

        let analysis_duration = meter
            .u64_histogram("analysis_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of analysis requests in milliseconds")
            .build();

        Ok(Metrics {
            analysis_counter,
            analysis_duration,
            registry,
        })
    }

    pub fn record_analysis(&self, outcome: &str, duration_ms: u64) {
        let attributes = vec![KeyValue::new("outcome", outcome.to_string())];
        self.analysis_counter.add(1, &attributes);
        self.analysis_duration.record(duration_ms, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 500;
    let middle_step: usize = 2_500;
    let end_step: usize = 10_000;
    let tail_step: usize = 20_000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
