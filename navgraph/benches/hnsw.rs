use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode};
use navgraph::{
    AllLive, GraphIndexBuilder, GraphSearcher, IndexConfig, ListVectorSource, SearchScoreProvider,
    VectorSimilarityFunction,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const DIM: usize = 32;

fn random_vectors(n: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f32>> {
    (0..n)
        .map(|_| (0..DIM).map(|_| rng.gen::<f32>()).collect())
        .collect()
}

fn config() -> IndexConfig {
    IndexConfig::new(DIM, 16, 100, 1.2).with_similarity(VectorSimilarityFunction::Euclidean)
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(10);
    group.sampling_mode(SamplingMode::Flat);

    for database_size in [1000_usize, 10000] {
        let mut rng = ChaCha8Rng::seed_from_u64(0_u64);
        let vectors = random_vectors(database_size, &mut rng);

        group.bench_function(BenchmarkId::new("parallel", database_size), |b| {
            b.iter_batched(
                || ListVectorSource::new(DIM, vectors.clone()).unwrap(),
                |source| {
                    let mut builder = GraphIndexBuilder::new(config(), source).unwrap();
                    builder.build().unwrap();
                    black_box(builder.graph().size())
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    for database_size in [1000_usize, 10000] {
        let mut rng = ChaCha8Rng::seed_from_u64(0_u64);
        let source = ListVectorSource::new(DIM, random_vectors(database_size, &mut rng)).unwrap();
        let mut builder = GraphIndexBuilder::new(config(), source).unwrap();
        builder.build().unwrap();
        let queries = random_vectors(100, &mut rng);
        let similarity = VectorSimilarityFunction::Euclidean;

        group.bench_function(BenchmarkId::new("top10", database_size), |b| {
            let mut searcher = GraphSearcher::from_config(builder.graph(), builder.config());
            let mut idx = 0;
            b.iter(|| {
                let query = &queries[idx % queries.len()];
                idx += 1;
                let provider =
                    SearchScoreProvider::for_query(builder.source(), &similarity, query).unwrap();
                black_box(searcher.search(&provider, 10, &AllLive))
            })
        });
    }
    group.finish();
}

criterion_group! {
    hnsw,
    bench_build,
    bench_search,
}

criterion_main!(hnsw);
