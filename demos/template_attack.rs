use anyhow::Result;
use ndarray::Array2;
use ndarray_rand::RandomExt;
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
use ndarray_rand::rand_distr::{Normal, Uniform};
use std::path::{Path, PathBuf};
use tascat::{
    leakage_detection::Snr,
    leakage_model::{Aes, LeakageModel, LeakageTarget, aes::sbox, hw},
    preprocessors::Preprocessor,
    template::{TemplateAttack, TemplateConfig},
    trace_store::{SampleType, TraceWriter},
    util::key_to_hex,
};

const NUM_SAMPLES: usize = 200;

/// Simulated acquisition: the Hamming weight of the first S-box output leaks around sample 80,
/// on top of a slow drift and gaussian noise, stored as 16-bit ADC codes.
fn acquire(path: &Path, key: [u8; 16], num_traces: usize, rng: &mut StdRng) -> Result<PathBuf> {
    let plaintexts = Array2::random_using((num_traces, 16), Uniform::new_inclusive(0u8, 255), rng);
    let mut traces = Array2::random_using((num_traces, NUM_SAMPLES), Normal::new(0., 20.)?, rng);
    let rows = traces.rows_mut().into_iter().zip(plaintexts.rows());
    for (i, (mut trace, plaintext)) in rows.enumerate() {
        let leakage = hw(sbox(plaintext[0] ^ key[0]) as usize) as f64;
        for j in 78..84 {
            trace[j] += 30. * leakage;
        }
        trace.mapv_inplace(|x| x + 500. * ((i % 1000) as f64 / 1000.));
    }

    let sample_type = SampleType::Int16 {
        channel_range: 6,
        max_adc: 32512,
    };
    let mut writer = TraceWriter::create(path, NUM_SAMPLES, sample_type, 16, key)?;
    writer.append(traces.view(), plaintexts.view())?;
    Ok(path.to_path_buf())
}

fn main() -> Result<()> {
    let folder = std::env::temp_dir().join("tascat_demo");
    std::fs::create_dir_all(&folder)?;
    // Seed rng to get the same output each run
    let mut rng = StdRng::seed_from_u64(0);

    let mut profiling = Vec::new();
    for k in (0..=255u8).step_by(17) {
        let key = [k; 16];
        let path = folder.join(format!("profiling_{}.dat", key_to_hex(&key[..1])));
        profiling.push(acquire(&path, key, 3000, &mut rng)?);
    }
    let mut attack_files = Vec::new();
    for k in [0x2b, 0x7e, 0x15] {
        let key = [k; 16];
        let path = folder.join(format!("attack_{}.dat", key_to_hex(&key[..1])));
        attack_files.push(acquire(&path, key, 100, &mut rng)?);
    }

    let target = LeakageTarget::new(Aes, LeakageModel::HammingWeightOfSbox, 0)?;
    let preprocessor = Preprocessor::new(1, true);
    if let Some(snr) = Snr::from_file(&profiling[0], target, preprocessor, None, 1000)? {
        let best = (0..snr.len()).max_by(|&a, &b| snr[a].total_cmp(&snr[b])).unwrap_or(0);
        println!("Highest SNR {:.2} at sample {best}", snr[best]);
    }

    let config = TemplateConfig {
        mode: LeakageModel::HammingWeightOfSbox,
        filter: true,
        aggregate_n_samples: 2,
        n_principal_comp: 5,
        ..Default::default()
    };
    let mut attack = TemplateAttack::open(folder.join("session"), config)?;
    attack.compute_pca(&profiling, false)?;
    attack.fit(&profiling, false)?;
    let metrics = attack.guessing_metrics(&attack_files, None, false)?;

    println!("Guessing entropy = {}", metrics.guessing_entropy);
    println!("Guessing distance = {}", metrics.guessing_distance);
    match metrics.traces_to_one() {
        Some(n) => println!("Key ranked first from {n} traces"),
        None => println!("Key not ranked first"),
    }

    Ok(())
}
