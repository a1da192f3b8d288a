use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use jobnet::{Activation, Cost, Dataset, ImageShape, NetworkBuilder, Sgd, Shuffler, Trainer};

// Three Gaussian blobs in 2D, trained with a hand-driven minibatch loop.
fn blobs(rng: &mut StdRng, per_class: usize) -> jobnet::Result<Dataset> {
    let centers = [(-2.0_f32, 0.0_f32), (2.0, 0.0), (0.0, 2.5)];
    let mut images = Vec::with_capacity(per_class * 6);
    let mut labels = Vec::with_capacity(per_class * 3);
    for (class, (cx, cy)) in centers.into_iter().enumerate() {
        for _ in 0..per_class {
            images.push(cx + rng.gen_range(-0.8..0.8));
            images.push(cy + rng.gen_range(-0.8..0.8));
            labels.push(class);
        }
    }
    Dataset::from_floats(images, labels, ImageShape::flat(2), 3)
}

fn main() -> jobnet::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut rng = StdRng::seed_from_u64(7);
    let train = blobs(&mut rng, 200)?;
    let test = blobs(&mut rng, 50)?;

    let mut net = NetworkBuilder::new(2)?
        .add_stochastic_layer(16, Activation::Relu, 0.05)?
        .add_layer(3, Activation::Sigmoid)?
        .threads(4)
        .build_with_seed(0)?;

    let sgd = Sgd::new(0.5)?;
    let mut trainer = Trainer::new(&mut net, 4)?;
    let mut shuffler = Shuffler::new(train.len());
    let mut batch = Vec::new();

    for epoch in 0..20 {
        let mut total = 0.0;
        for _ in 0..train.len().div_ceil(16) {
            shuffler.next_batch(16, &mut rng, &mut batch);
            total += trainer.train_indices(
                &mut net,
                &train,
                &batch,
                sgd.rate_for_batch(batch.len()),
                Cost::SumSquares,
            )?;
        }
        let eval = net.evaluate(&test)?;
        println!(
            "epoch={epoch} mean_cost={:.4} test_accuracy={:.3}",
            total / train.len() as f32,
            eval.accuracy
        );
    }
    Ok(())
}
