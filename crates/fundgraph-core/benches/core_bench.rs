//! Criterion benchmarks for fundgraph-core.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init + migration overhead.
//! 2. **merge**: Header alignment and multi-page table merging.
//! 3. **normalize**: Weight parsing and row normalization.
//! 4. **classify**: Asset-class rule evaluation.
//! 5. **resolve**: Exact and fuzzy identity resolution against a registry.
//! 6. **commit**: Snapshot writes through the temporal graph writer.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/fundgraph-core/Cargo.toml
//! # Run only the resolver group:
//! cargo bench --manifest-path crates/fundgraph-core/Cargo.toml -- resolve
//! ```

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use fundgraph_core::config::PipelineConfig;
use fundgraph_core::extract::classifier::AssetClassifier;
use fundgraph_core::extract::identity::{IdentityResolver, InstrumentRegistry, RegistryEntry};
use fundgraph_core::extract::merger::{align_headers, header_signature, TableMerger};
use fundgraph_core::extract::normalizer::{parse_weight, HeuristicNormalizer, RecordNormalizer};
use fundgraph_core::extract::pipeline::IngestionPipeline;
use fundgraph_core::models::{Document, PageText, Period, RawTableBlock};
use fundgraph_core::store::database::Database;
use fundgraph_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};
use fundgraph_core::store::writer::TemporalGraphWriter;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SECTORS: &[&str] = &["Bank", "Motors", "Pharma", "Cement", "Power", "Textiles"];

fn company(i: usize) -> String {
    format!("Company{} {} Ltd", i, SECTORS[i % SECTORS.len()])
}

fn synthetic_registry(n: usize) -> Arc<InstrumentRegistry> {
    Arc::new(InstrumentRegistry::from_entries((0..n).map(|i| {
        RegistryEntry {
            instrument_id: format!("INE{i:06}A01"),
            canonical_name: format!("Company{} {} Limited", i, SECTORS[i % SECTORS.len()]),
            aliases: vec![],
            market_cap_bucket: Some(if i % 3 == 0 { "Large Cap" } else { "Mid Cap" }.into()),
        }
    })))
}

/// `pages` blocks sharing one header, `rows_per_page` holdings each.
fn synthetic_blocks(pages: usize, rows_per_page: usize) -> Vec<RawTableBlock> {
    let mut blocks = Vec::with_capacity(pages);
    let mut idx = 0;
    for page in 1..=pages {
        let mut rows = Vec::with_capacity(rows_per_page + 1);
        if page == 1 {
            rows.push(vec!["Equity & Equity Related".to_string(), String::new(), String::new()]);
        }
        for _ in 0..rows_per_page {
            rows.push(vec![
                company(idx),
                format!("{}", 1000 + idx * 7),
                format!("{:.2}%", 0.25 + (idx % 9) as f64 * 0.1),
            ]);
            idx += 1;
        }
        blocks.push(RawTableBlock {
            page_index: page,
            header_row: vec!["Name of Instrument".into(), "Quantity".into(), "% to NAV".into()],
            rows,
        });
    }
    blocks
}

fn synthetic_document(id: &str, fund: &str, month: u32, pages: usize, rows_per_page: usize) -> Document {
    Document {
        document_id: id.to_string(),
        as_of: Period { year: 2025, month },
        blocks: synthetic_blocks(pages, rows_per_page),
        pages: vec![PageText {
            page_index: 1,
            lines: vec!["Bench Mutual Fund".into(), fund.to_string()],
        }],
    }
}

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        normalize_retry_backoff_ms: 0,
        ..PipelineConfig::default()
    }
}

// ---------------------------------------------------------------------------
// 1. schema
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema_init_and_migrate", |b| {
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
}

// ---------------------------------------------------------------------------
// 2. merge
// ---------------------------------------------------------------------------

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    let left = header_signature(&["Name of Instrument", "Quantity", "% to NAV"].map(String::from));
    let right = header_signature(&["Name of the Instrument", "Qty", "% of NAV"].map(String::from));
    group.bench_function("align_headers_near_match", |b| {
        b.iter(|| align_headers(black_box(&left), black_box(&right), 0.85));
    });

    let merger = TableMerger::new(&PipelineConfig::default());
    for pages in [2usize, 8, 32] {
        let blocks = synthetic_blocks(pages, 40);
        group.bench_with_input(BenchmarkId::new("merge_pages", pages), &blocks, |b, blocks| {
            b.iter(|| merger.merge(black_box(blocks)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 3. normalize
// ---------------------------------------------------------------------------

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    for raw in ["9.18%", "1.234,56", "(0.42)", "--"] {
        group.bench_with_input(BenchmarkId::new("parse_weight", raw), raw, |b, raw| {
            b.iter(|| parse_weight(black_box(raw)));
        });
    }

    let config = quiet_config();
    let capability = HeuristicNormalizer;
    let normalizer = RecordNormalizer::new(&capability, &config);
    let table = TableMerger::new(&config)
        .merge(&synthetic_blocks(4, 50))
        .tables
        .remove(0);
    group.bench_function("normalize_table_200_rows", |b| {
        b.iter(|| normalizer.normalize_table(black_box(&table)).unwrap());
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// 4. classify
// ---------------------------------------------------------------------------

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    let classifier = AssetClassifier::new();
    let samples = [
        ("Equity & Equity Related", "HDFC Bank Ltd"),
        ("Money Market Instruments", "91 Days Treasury Bill 2025"),
        ("Debt Instruments", "7.38% GOI 2027"),
        ("", "Net Current Assets"),
        ("", "Nippon India ETF Gold BeES"),
    ];
    for (category, name) in samples {
        group.bench_with_input(BenchmarkId::new("classify", name), &(category, name), |b, (cat, sec)| {
            b.iter(|| classifier.classify(black_box(cat), black_box(sec)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 5. resolve
// ---------------------------------------------------------------------------

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    let config = PipelineConfig::default();

    for size in [500usize, 5000] {
        let resolver = IdentityResolver::new(synthetic_registry(size), &config);
        let exact = format!("Company{} {} Limited", size / 2, SECTORS[(size / 2) % SECTORS.len()]);
        let fuzzy = company(size / 3);
        group.bench_with_input(BenchmarkId::new("exact", size), &exact, |b, name| {
            b.iter(|| resolver.resolve(black_box(name)));
        });
        group.bench_with_input(BenchmarkId::new("fuzzy", size), &fuzzy, |b, name| {
            b.iter(|| resolver.resolve(black_box(name)));
        });
        group.bench_with_input(BenchmarkId::new("unresolved", size), "Mystery Widgets", |b, name| {
            b.iter(|| resolver.resolve(black_box(name)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 6. commit
// ---------------------------------------------------------------------------

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    group.sample_size(20);

    let tmp = tempfile::tempdir().unwrap();
    let db = Database::new(tmp.path().join("bench.db")).unwrap();
    db.init_schema().unwrap();
    let writer = TemporalGraphWriter::new(db);
    let pipeline = IngestionPipeline::new(
        quiet_config(),
        Arc::new(HeuristicNormalizer),
        synthetic_registry(400),
        Arc::new(fundgraph_core::extract::funds::DerivedFundDirectory),
    );

    let prepared = pipeline
        .prepare(&synthetic_document("bench-1", "Bench Flexi Cap Fund", 1, 4, 50))
        .unwrap();
    let set = prepared.sets[0].clone();

    // First call creates; the measured loop hits the unchanged path.
    writer.commit(&set).unwrap();
    group.bench_function("commit_unchanged_200_holdings", |b| {
        b.iter(|| writer.commit(black_box(&set)).unwrap());
    });

    let mut month = 0u32;
    group.bench_function("ingest_document_200_holdings", |b| {
        b.iter(|| {
            month = month % 12 + 1;
            let doc = synthetic_document("bench-2", "Bench Midcap Fund", month, 4, 50);
            pipeline.ingest(black_box(&doc), &writer).unwrap()
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_schema_init,
    bench_merge,
    bench_normalize,
    bench_classify,
    bench_resolve,
    bench_commit,
);
criterion_main!(benches);
