use criterion::{criterion_group, criterion_main, Criterion};
use pulse_cache::SemanticCache;
use pulse_core::CacheConfig;
use std::hint::black_box;

const DIMS: usize = 64;

fn embedding(seed: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..DIMS)
        .map(|i| (((seed * 31 + i * 17) % 97) as f32) / 97.0 - 0.5)
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

fn filled_cache(entries: usize, with_embeddings: bool) -> SemanticCache {
    let cache = SemanticCache::new("bench", CacheConfig::default());
    for i in 0..entries {
        let query = format!("how do I configure feature number {i} on my phone");
        let emb = with_embeddings.then(|| embedding(i));
        cache.store(&query, emb, "answer", 0.9);
    }
    cache
}

fn bench_cache_query(c: &mut Criterion) {
    let text_cache = filled_cache(1_000, false);
    c.bench_function("cache/query_jaccard_1k", |b| {
        b.iter(|| {
            let lookup = text_cache.query(black_box("how do I configure feature number 512 on my phone"), None);
            black_box(lookup.is_hit());
        })
    });

    let vector_cache = filled_cache(1_000, true);
    let query_vector = embedding(512);
    c.bench_function("cache/query_cosine_1k", |b| {
        b.iter(|| {
            let lookup = vector_cache.query(black_box("unrelated wording"), Some(query_vector.clone()));
            black_box(lookup.is_hit());
        })
    });

    c.bench_function("cache/shareable_top20", |b| {
        b.iter(|| black_box(text_cache.shareable(black_box(20)).len()))
    });
}

criterion_group!(benches, bench_cache_query);
criterion_main!(benches);
