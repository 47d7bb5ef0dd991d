//! Microbenchmarks for the conversion and enqueue paths.
//!
//! Run with: `cargo bench -p fluxline -- line_protocol`

#![allow(missing_docs, clippy::cast_precision_loss)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use fluxline::entity::{self, Column, Entity, EntitySchema, Value};
use fluxline::{
    BatchOptions, Point, TransportError, WriteApi, WriteDefaults, WritePrecision, WriteRequest,
    WriteTransport,
};

struct CpuSample {
    host: String,
    core: u32,
    usage: f64,
    time_ns: i64,
}

impl Entity for CpuSample {
    fn schema() -> EntitySchema {
        EntitySchema::new("cpu")
            .column(Column::tag("host"))
            .column(Column::field("core"))
            .column(Column::field("usage"))
            .column(Column::timestamp("time_ns"))
    }

    fn value(&self, property: &str) -> Value<'_> {
        match property {
            "host" => self.host.as_str().into(),
            "core" => self.core.into(),
            "usage" => self.usage.into(),
            "time_ns" => self.time_ns.into(),
            _ => Value::Null,
        }
    }
}

/// Accepts everything without doing any I/O.
struct Discard;

#[async_trait]
impl WriteTransport for Discard {
    async fn post_write(&self, _request: &WriteRequest) -> Result<(), TransportError> {
        Ok(())
    }
}

fn bench_point_render(c: &mut Criterion) {
    let defaults = BTreeMap::new();
    let point = Point::measurement("cpu")
        .tag("host", "web1")
        .tag("region", "eu west")
        .field("usage", 85.5)
        .field("idle", 14.5)
        .field("label", "user \"load\"")
        .time(UNIX_EPOCH + Duration::from_secs(1_700_000_000), WritePrecision::Ns);

    c.bench_function("line_protocol/point", |b| {
        b.iter(|| black_box(point.to_line_protocol(black_box(&defaults))));
    });
}

fn bench_entity_render(c: &mut Criterion) {
    let defaults = BTreeMap::new();
    let sample = CpuSample {
        host: "web1".to_string(),
        core: 3,
        usage: 42.5,
        time_ns: 1_700_000_000_000_000_000,
    };

    c.bench_function("line_protocol/entity_cached", |b| {
        b.iter(|| {
            entity::to_line_protocol(black_box(&sample), WritePrecision::Ns, &defaults).unwrap()
        });
    });
}

fn bench_enqueue(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let mut group = c.benchmark_group("enqueue/batch_size");

    for batch_size in [100, 1_000, 10_000] {
        let api = WriteApi::builder(Arc::new(Discard))
            .with_batch_options(
                BatchOptions::default()
                    .with_batch_size(batch_size)
                    .with_buffer_limit(batch_size * 10),
            )
            .with_defaults(
                WriteDefaults::default()
                    .with_bucket("bench")
                    .with_organization("bench"),
            )
            .build()
            .unwrap();
        let mut ts = 1_700_000_000_000_000_000i64;

        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, _| {
                b.iter(|| {
                    ts += 1_000_000_000;
                    let sample = CpuSample {
                        host: "web1".to_string(),
                        core: 0,
                        usage: ts as f64,
                        time_ns: ts,
                    };
                    api.write_measurement(WritePrecision::Ns, black_box(&sample))
                        .unwrap();
                });
            },
        );

        runtime.block_on(api.close());
    }

    group.finish();
}

criterion_group!(benches, bench_point_render, bench_entity_render, bench_enqueue);
criterion_main!(benches);
