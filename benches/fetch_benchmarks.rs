use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use resilient_fetch::cache::CacheConfig;
use resilient_fetch::config::FetchLayerConfig;
use resilient_fetch::sources::fetcher_fn;
use resilient_fetch::{Payload, Priority, RequestKey, ResilientFetcher, ResponseCache};
use serde_json::json;

fn benchmark_request_key(c: &mut Criterion) {
    c.bench_function("request_key_fingerprint", |b| {
        b.iter(|| {
            black_box(
                RequestKey::new("quote")
                    .param("symbol", "AAPL")
                    .param("interval", "1d")
                    .param("range", "5y")
                    .fingerprint(),
            )
        })
    });
}

fn benchmark_cache_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get");

    for size in [100usize, 1_000, 10_000].iter() {
        let cache: ResponseCache<Payload> = ResponseCache::new(CacheConfig {
            max_capacity: *size,
            ..Default::default()
        });
        for i in 0..*size {
            cache.insert(format!("quote:{}", i), Payload::Json(json!({ "price": i })));
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let key = format!("quote:{}", rng.gen_range(0..size));
                black_box(cache.get(&key))
            })
        });
    }
    group.finish();
}

fn benchmark_cache_insert_with_eviction(c: &mut Criterion) {
    let cache: ResponseCache<Payload> = ResponseCache::new(CacheConfig {
        max_capacity: 1_000,
        ..Default::default()
    });
    let mut next = 0u64;

    c.bench_function("cache_insert_evicting", |b| {
        b.iter(|| {
            next += 1;
            cache.insert(format!("quote:{}", next), Payload::Text("187.25".into()));
        })
    });
}

fn benchmark_fetch_cache_hit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let fetcher = ResilientFetcher::builder().build();
    let sources = fetcher_fn(|source, key| async move {
        Ok(Payload::Json(json!({ "source": source, "key": key })))
    });
    let order = vec!["yahoo".to_string()];

    runtime.block_on(async {
        fetcher
            .fetch("quote:AAPL", Priority::Normal, &order, sources.clone())
            .await
            .unwrap();
    });

    c.bench_function("fetch_cache_hit", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                fetcher
                    .fetch("quote:AAPL", Priority::Normal, &order, sources.clone())
                    .await
                    .unwrap(),
            )
        })
    });
}

fn benchmark_config_parsing(c: &mut Criterion) {
    let yaml = r#"
preset: server
breaker:
  failure_threshold: 5
  success_threshold: 2
  open_timeout_ms: 60000
sources:
  - id: yahoo
    url: "https://query1.finance.yahoo.com/v8/finance/chart/{key}"
  - id: finnhub
    url: "https://finnhub.io/api/v1/quote?symbol={key}"
    api_key_param: token
    api_key: "secret://finnhub"
    requests_per_minute: 60
fetch:
  default_sources: [yahoo, finnhub]
"#;

    c.bench_function("config_parsing", |b| {
        b.iter(|| black_box(FetchLayerConfig::from_yaml(yaml)))
    });
}

criterion_group!(
    benches,
    benchmark_request_key,
    benchmark_cache_get,
    benchmark_cache_insert_with_eviction,
    benchmark_fetch_cache_hit,
    benchmark_config_parsing
);
criterion_main!(benches);
