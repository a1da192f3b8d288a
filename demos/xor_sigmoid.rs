use jobnet::{Dataset, ImageShape, Network, NetworkConfig, TrainConfig};

fn main() -> jobnet::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // XOR as two-class classification with one-hot targets.
    let xs = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
    let train = Dataset::from_floats(xs.to_vec(), vec![0, 1, 1, 0], ImageShape::flat(2), 2)?;

    let mut net = Network::with_seed(NetworkConfig::new(&[2, 6, 2])?, 0)?;
    let report = net.fit(
        &train,
        Some(&train),
        &TrainConfig {
            epochs: 2_000,
            batch_size: 4,
            learning_rate: 3.0,
            lanes: 4,
            ..TrainConfig::default()
        },
    )?;

    println!("final_cost={:?}", report.final_cost());
    for (x, label) in xs.chunks(2).zip([0, 1, 1, 0]) {
        let out = net.forward(x)?.to_vec();
        println!("x={x:?} label={label} out={out:?}");
    }
    Ok(())
}
