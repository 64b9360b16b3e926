use criterion::{black_box, criterion_group, criterion_main, Criterion};
use regex::Regex;

use logpipe::accounting::event::ClassifiedEvent;
use logpipe::accounting::latency::LatencyClassTable;
use logpipe::accounting::mapping::RequestMapper;
use logpipe::accounting::Aggregator;
use logpipe::config::{DEFAULT_LINE_REGEX, DEFAULT_STATIC_CONTENT_REGEX};
use logpipe::ingest::parse::LineParser;

const LINE: &str = r#"10.0.0.1 www.example.org - - [01/Mar/2024:12:00:00 +0100] "GET /api/users/42?expand=1 HTTP/1.1" 200 512 "-" "Mozilla/5.0 (X11; Linux x86_64)" 48213"#;

fn build_mapper() -> RequestMapper {
    RequestMapper::new(
        Some(Regex::new(DEFAULT_STATIC_CONTENT_REGEX).expect("static regex")),
        vec![
            ("all".to_string(), Regex::new(".*").expect("regex")),
            ("api".to_string(), Regex::new("^/api/").expect("regex")),
            ("admin".to_string(), Regex::new("^/admin").expect("regex")),
        ],
    )
}

fn build_events() -> Vec<ClassifiedEvent> {
    (0..1_024u64)
        .map(|i| {
            ClassifiedEvent::new(
                format!("vhost{}.example.org", i % 16),
                format!("/api/items/{i}"),
                (i * 7_919 % 12_000_000).to_string(),
                if i % 10 == 0 { 304 } else { 200 },
            )
        })
        .collect()
}

fn bench_parse_line(c: &mut Criterion) {
    let parser = LineParser::new(DEFAULT_LINE_REGEX).expect("line regex");

    c.bench_function("parse_line/combined", |b| {
        b.iter(|| parser.parse(black_box(LINE)).expect("parse line").code)
    });

    c.bench_function("parse_line/not_matched", |b| {
        b.iter(|| parser.parse(black_box("garbage that is no access log line")))
    });
}

fn bench_classify(c: &mut Criterion) {
    let events = build_events();
    let table = LatencyClassTable::default();

    c.bench_function("latency_class/default_table", |b| {
        b.iter(|| table.classify(black_box(7_000_000)))
    });

    c.bench_function("aggregator/classify_batch", |b| {
        let mut aggregator = Aggregator::new(LatencyClassTable::default(), build_mapper());
        b.iter(|| {
            for event in &events {
                black_box(aggregator.classify(black_box(event)));
            }
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_line(c);
    bench_classify(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
