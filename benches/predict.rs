use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ndarray::{Array2, Array3};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
use ndarray_rand::rand_distr::{Normal, Uniform};
use tascat::{
    leakage_model::{Aes, LeakageModel, LeakageTarget},
    template::{TemplateArtifacts, TemplateSet},
};

fn templates(num_classes: usize, dim: usize, rng: &mut StdRng) -> TemplateSet {
    let artifacts = TemplateArtifacts {
        means: Array2::random_using((num_classes, dim), Uniform::new(-5., 5.), rng),
        covariances: Array3::from_shape_fn((num_classes, dim, dim), |(_, i, j)| {
            if i == j { 1. } else { 0.1 }
        }),
    };

    TemplateSet::new(&artifacts, dim).unwrap()
}

fn bench_predict(c: &mut Criterion) {
    // Seed rng to get the same output each run
    let mut rng = StdRng::seed_from_u64(0);

    let mut group = c.benchmark_group("predict");

    for (model, dim) in [
        (LeakageModel::HammingWeightOfSbox, 9),
        (LeakageModel::SboxOutput, 10),
    ] {
        let target = LeakageTarget::new(Aes, model, 0).unwrap();
        let templates = templates(model.num_classes(), dim, &mut rng);

        for nb_traces in [500, 2000].into_iter() {
            let traces =
                Array2::random_using((nb_traces, dim), Normal::new(0., 2.).unwrap(), &mut rng);
            let plaintexts =
                Array2::random_using((nb_traces, 16), Uniform::new_inclusive(0u8, 255), &mut rng);

            group.bench_with_input(
                BenchmarkId::new(format!("sequential_{model}"), nb_traces),
                &(&traces, &plaintexts),
                |b, (traces, plaintexts)| {
                    b.iter(|| templates.score(traces.view(), plaintexts.view(), &target, 0.))
                },
            );
            group.bench_with_input(
                BenchmarkId::new(format!("parallel_{model}"), nb_traces),
                &(&traces, &plaintexts),
                |b, (traces, plaintexts)| {
                    b.iter(|| {
                        templates
                            .par_score(traces.view(), plaintexts.view(), &target, 0.)
                            .unwrap()
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_predict);
criterion_main!(benches);
