//! Performance benchmarks for the eagleeye engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use eagleeye::templates::{parse_template, Response, TemplateCache};
use eagleeye::utils::resolve_targets;
use eagleeye::utils::target_parser::TargetParser;
use eagleeye::RawTemplate;

const PGSQL: &str = r#"id: pgsql-detect
info:
  name: PostgreSQL Authentication - Detect
  severity: info
  tags: network,postgresql,db,detect
tcp:
  - inputs:
      - data: "000000500003000075736572"
        type: hex
    host:
      - "{{Hostname}}"
    port: 5432
    read-size: 2048
    matchers-condition: and
    matchers:
      - type: word
        words: ["C0A000", "28P01", "pg_hba.conf"]
      - type: regex
        regex: ["SFATAL.*password"]
      - type: word
        words: ["HTTP/1.1"]
        negative: true
"#;

/// Benchmark target expansion
fn bench_target_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("target_resolution");
    let parser = TargetParser::default();
    let none: [&str; 0] = [];

    for spec in ["10.0.0.0/24", "10.0.0.0/20", "10.0.0.0-10.0.63.255"] {
        group.bench_with_input(BenchmarkId::from_parameter(spec), &spec, |b, spec| {
            b.iter(|| resolve_targets(black_box(&[*spec]), &none, &parser))
        });
    }

    group.bench_function("cidr_minus_exclusions", |b| {
        let excludes: Vec<String> = (0..64).map(|i| format!("10.0.1.{}", i)).collect();
        let targets = vec!["10.0.0.0/22".to_string()];
        b.iter(|| resolve_targets(black_box(&targets), black_box(&excludes), &parser))
    });

    group.finish();
}

/// Benchmark template parsing and the per-entry cache
fn bench_templates(c: &mut Criterion) {
    let mut group = c.benchmark_group("templates");
    let raw = RawTemplate::new("pgsql-detect", PGSQL);

    group.bench_function("parse", |b| b.iter(|| parse_template(black_box(&raw))));

    group.bench_function("cache_hit", |b| {
        let cache = TemplateCache::new();
        b.iter(|| cache.get_or_parse(black_box(&raw)))
    });

    group.finish();
}

/// Benchmark matcher evaluation over growing responses
fn bench_matchers(c: &mut Criterion) {
    let mut group = c.benchmark_group("matchers");
    let template = match parse_template(&RawTemplate::new("pgsql-detect", PGSQL)) {
        Ok(template) => template,
        Err(e) => panic!("{}", e),
    };
    let matchers = &template.tcp[0].matchers;

    for size in [64usize, 1024, 16 * 1024] {
        let mut body = vec![b'x'; size];
        body.extend_from_slice(b"SFATAL C28P01 password authentication failed");
        let response = Response::from_bytes(body);

        group.bench_with_input(BenchmarkId::from_parameter(size), &response, |b, response| {
            b.iter(|| matchers.evaluate(black_box(response)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_target_resolution, bench_templates, bench_matchers);
criterion_main!(benches);
