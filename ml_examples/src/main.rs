// ml_examples/src/main.rs
use anyhow::Result;
use log::info;
use primitive_nn::gradient_check;
use primitive_nn::{accuracy, confusion_matrix, Network, NetworkConfig, Registry, Trainer, TrainerConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const XOR_NET: &str = r#"{
    "input_dimension": 2,
    "default_activation": { "type": "tanh" },
    "seed": 3,
    "layers": [
        { "type": "dense", "nodes": 6 },
        { "type": "dense", "nodes": 2, "activation": { "type": "sigmoid" } }
    ]
}"#;

const XOR_TRAINER: &str = r#"{
    "loss": { "type": "euclidean" },
    "regularizer": { "type": "l2", "lambda": 0.0001 },
    "optimizer": { "type": "adam", "beta1": 0.9, "beta2": 0.999, "epsilon": 1e-8 },
    "scheduler": { "type": "time_decay", "initial": 0.05, "decay": 0.01 }
}"#;

/// Noisy XOR samples with one-hot targets.
fn xor_data(n_samples: usize, seed: u64) -> Vec<(Vec<f64>, Vec<f64>)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n_samples)
        .map(|_| {
            let a = rng.gen_bool(0.5);
            let b = rng.gen_bool(0.5);
            let input = vec![
                f64::from(u8::from(a)) + rng.gen_range(-0.1..0.1),
                f64::from(u8::from(b)) + rng.gen_range(-0.1..0.1),
            ];
            let target = if a != b { vec![0.0, 1.0] } else { vec![1.0, 0.0] };
            (input, target)
        })
        .collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=== XOR ===");
    let data = xor_data(200, 17);
    let mut registry = Registry::new();
    let network = NetworkConfig::from_json(XOR_NET)?.build_network(&mut registry)?;
    println!("Model Summary:\n{network}");

    let (input, target) = &data[0];
    let report = gradient_check::check(&network, &*registry.loss(TrainerConfig::default().loss)?, input, target, 1e-5)?;
    println!("Gradient check max relative error: {:.2e}", report.max_relative_error);

    let mut trainer = Trainer::from_config(network, &TrainerConfig::from_json(XOR_TRAINER)?, &mut registry)?;
    let losses = trainer.fit(&data, 150, 8, 99)?;
    if let (Some(first), Some(last)) = (losses.first(), losses.last()) {
        info!("loss went from {first:.6} to {last:.6}");
    }
    let network = trainer.into_network();
    println!("XOR Accuracy: {:.2}%", accuracy(&data, &network)? * 100.0);
    println!("Confusion matrix: {:?}", confusion_matrix(&data, &network, 2)?);

    // Demo: save and load model
    let path = std::env::temp_dir().join("xor_model.nn.gz");
    network.save(&path)?;
    let reloaded = Network::load(&path)?;
    println!("XOR Accuracy (reloaded): {:.2}%", accuracy(&data, &reloaded)? * 100.0);

    Ok(())
}
