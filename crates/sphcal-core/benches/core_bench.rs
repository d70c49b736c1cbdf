//! Criterion benchmarks for sphcal-core.
//!
//! Everything here runs without the external engine or a Python runtime.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init + migration overhead of a session store.
//! 2. **contracts**: Slug serialize/deserialize and contract file parsing.
//! 3. **document**: Discovery and binding on a synthetic case definition.
//! 4. **scoring**: Reference windows and full measurement scoring.
//! 5. **surrogate**: Gaussian-process fit + acquisition at several sizes.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/sphcal-core/Cargo.toml
//! # Run only the surrogate group:
//! cargo bench --manifest-path crates/sphcal-core/Cargo.toml -- surrogate
//! ```

use std::fs;
use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rusqlite::Connection;

use _sphcal_core::config::OptimizerConfig;
use _sphcal_core::document::binder::apply;
use _sphcal_core::document::discovery::{discover_contracts, RecordAll};
use _sphcal_core::document::ConfigDocument;
use _sphcal_core::optimizer::{GaussianProcessSurrogate, Surrogate};
use _sphcal_core::params::contract_file::{parse_contracts, render_contracts};
use _sphcal_core::params::{ParameterContract, ParameterSet, ScalarKind, SecondaryKey};
use _sphcal_core::scoring::{reference_window, MeasurementTable, Metric, ScoringEngine};
use _sphcal_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Case definition with `n` numeric constants and the execution block.
fn synthetic_definition(n: usize) -> String {
    let mut xml = String::from("<case>\n<constants>\n");
    for i in 0..n {
        xml.push_str(&format!(
            "<const{i} value=\"{}\" coef=\"{}\" label=\"c{i}\" />\n",
            i as f64 * 0.5,
            i
        ));
    }
    xml.push_str("</constants>\n<execution><parameters>\n");
    xml.push_str("<parameter key=\"TimeMax\" value=\"1\" />\n<parameter key=\"TimeOut\" value=\"0.1\" />\n");
    xml.push_str("</parameters></execution>\n</case>\n");
    xml
}

fn contract_set(n: usize) -> ParameterSet {
    ParameterSet::from_defaults((0..n).map(|i| {
        ParameterContract::new(format!("./constants/const{i}"), "value", 0.5, ScalarKind::Float64)
            .unwrap()
            .with_bounds(0.0, 10.0)
            .unwrap()
    }))
}

/// Measurement file with `probes` probes and `steps` time steps, plus the
/// reference files they compare against.
fn write_scoring_fixture(dir: &Path, probes: usize, steps: usize) -> String {
    let coords: Vec<String> = (0..probes)
        .flat_map(|i| [format!("{}.5", 2 + i % 6), "0.0".into(), format!("{}", (i % 3) as f64 * 0.7)])
        .collect();
    let mut text = format!("Pos;;{}\n", coords.join(";"));
    let headers: Vec<String> = (0..probes).map(|i| format!("Vel_{i}.x [m/s]")).collect();
    text.push_str(&format!("Part;Time [s];{}\n", headers.join(";")));
    for step in 0..steps {
        let values: Vec<String> = (0..probes)
            .map(|i| format!("{:.4}", ((step + i) as f64 * 0.01).sin()))
            .collect();
        text.push_str(&format!("{step};{};{}\n", step as f64 * 0.01, values.join(";")));
    }

    for location in 2..8 {
        for band in ["Bottom", "Middle", "Top"] {
            let body: String = (0..steps * 3)
                .map(|i| format!("{} {:.4}\n", i as f64 * 0.01, (i as f64 * 0.013).cos()))
                .collect();
            fs::write(
                dir.join(format!("Data_Depth1000mm_Upstream{location}m_{band}.txt")),
                body,
            )
            .unwrap();
        }
    }
    text
}

fn trained_surrogate(dimension: usize, observations: usize) -> GaussianProcessSurrogate {
    let config = OptimizerConfig {
        acquisition_samples: 500,
        ..OptimizerConfig::default()
    };
    let mut gp = GaussianProcessSurrogate::from_config(&config, vec![(0.0, 10.0); dimension]).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..observations {
        let point: Vec<f64> = (0..dimension).map(|_| rng.gen_range(0.0..10.0)).collect();
        let target = -point.iter().map(|x| (x - 4.0).powi(2)).sum::<f64>();
        gp.register(&point, target).unwrap();
    }
    gp
}

// ---------------------------------------------------------------------------
// 1. schema
// ---------------------------------------------------------------------------

fn bench_schema(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema");

    group.bench_function("init_and_migrate", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
            for stmt in SCHEMA_STATEMENTS {
                conn.execute_batch(stmt).unwrap();
            }
            migrate_schema(&conn).unwrap();
            black_box(&conn);
        });
    });

    group.bench_function("migration_noop_on_current", |b| {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        b.iter(|| migrate_schema(black_box(&conn)).unwrap());
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. contracts
// ---------------------------------------------------------------------------

fn bench_contracts(c: &mut Criterion) {
    let mut group = c.benchmark_group("contracts");

    let keyed = ParameterContract::new("./execution/parameters/parameter", "value", 0.25, ScalarKind::Float32)
        .unwrap()
        .with_secondary_key(SecondaryKey::new("key", "TimeOut"))
        .unwrap();
    let slug = keyed.serialize();

    group.bench_function("serialize", |b| b.iter(|| black_box(&keyed).serialize()));
    group.bench_function("deserialize", |b| {
        b.iter(|| ParameterContract::deserialize(black_box(&slug)).unwrap())
    });

    for n in [10usize, 100] {
        let text = render_contracts(&contract_set(n));
        group.bench_with_input(BenchmarkId::new("parse_file", n), &text, |b, text| {
            b.iter(|| parse_contracts(black_box(text)).unwrap())
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 3. document
// ---------------------------------------------------------------------------

fn bench_document(c: &mut Criterion) {
    let mut group = c.benchmark_group("document");

    for n in [20usize, 200] {
        let xml = synthetic_definition(n);
        let doc = ConfigDocument::parse(&xml).unwrap();
        group.bench_with_input(BenchmarkId::new("discover", n), &doc, |b, doc| {
            b.iter(|| discover_contracts(black_box(doc), &mut RecordAll).unwrap())
        });

        let set = contract_set(n);
        group.bench_with_input(BenchmarkId::new("apply", n), &set, |b, set| {
            let mut doc = ConfigDocument::parse(&xml).unwrap();
            b.iter(|| apply(&mut doc, black_box(set)).unwrap())
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 4. scoring
// ---------------------------------------------------------------------------

fn bench_scoring(c: &mut Criterion) {
    let mut group = c.benchmark_group("scoring");

    group.bench_function("reference_window", |b| {
        b.iter(|| reference_window(black_box(4200), black_box(900), black_box(7)).unwrap())
    });

    let dir = tempfile::tempdir().unwrap();
    let text = write_scoring_fixture(dir.path(), 12, 1200);
    let table = MeasurementTable::parse(text.as_bytes()).unwrap();
    let engine = ScoringEngine::with_reference_dir(dir.path(), 1000);

    group.bench_function("parse_measurements", |b| {
        b.iter(|| MeasurementTable::parse(black_box(text.as_bytes())).unwrap())
    });
    for metric in [Metric::Mad, Metric::Mse] {
        group.bench_with_input(BenchmarkId::new("score", metric), &metric, |b, &metric| {
            b.iter(|| engine.score(&table, &table.probes, metric, 100, 1).unwrap())
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 5. surrogate
// ---------------------------------------------------------------------------

fn bench_surrogate(c: &mut Criterion) {
    let mut group = c.benchmark_group("surrogate");
    group.sample_size(20);

    for observations in [5usize, 25, 50] {
        let gp = trained_surrogate(4, observations);
        group.bench_with_input(BenchmarkId::new("suggest", observations), &gp, |b, gp| {
            b.iter(|| {
                let mut gp = gp.clone();
                black_box(gp.suggest().unwrap())
            })
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_schema,
    bench_contracts,
    bench_document,
    bench_scoring,
    bench_surrogate,
);
criterion_main!(benches);
