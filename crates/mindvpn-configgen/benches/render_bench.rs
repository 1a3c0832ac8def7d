// Criterion benchmarks for mindvpn-configgen
//
// Run benchmarks with:
//   cargo bench -p mindvpn-configgen

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mindvpn_configgen::{check_structure, render, INBOUND_FILE};
use serde_json::{json, Value};

fn overrides_with_users(n: usize) -> Value {
    let users: Vec<Value> = (0..n)
        .map(|i| {
            json!({
                "uuid": format!("00000000-0000-4000-8000-{:012}", i),
                "email": format!("user{}@example.com", i),
            })
        })
        .collect();
    json!({"users": users, "server_name": "www.example.org", "private_key": "k"})
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render");

    for users in [1usize, 10, 100] {
        let overrides = overrides_with_users(users);
        group.bench_with_input(
            BenchmarkId::new("xray_reality_tcp", users),
            &overrides,
            |b, overrides| {
                b.iter(|| render(black_box("xray"), 443, "reality_tcp", overrides, &[]));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("singbox_hysteria2", users),
            &overrides,
            |b, overrides| {
                b.iter(|| render(black_box("singbox"), 8443, "hysteria2", overrides, &[]));
            },
        );
    }

    group.finish();
}

fn bench_digest_and_check(c: &mut Criterion) {
    let rendered = match render("xray", 443, "reality_grpc", &overrides_with_users(50), &[]) {
        Ok(rendered) => rendered,
        Err(e) => panic!("render failed: {}", e),
    };
    let inbound = rendered.get(INBOUND_FILE).unwrap_or_default().to_string();

    c.bench_function("digest", |b| b.iter(|| black_box(&rendered).digest()));
    c.bench_function("check_structure", |b| {
        b.iter(|| check_structure("xray", black_box(&inbound)))
    });
}

criterion_group!(benches, bench_render, bench_digest_and_check);
criterion_main!(benches);
