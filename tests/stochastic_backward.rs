use approx::assert_abs_diff_eq;

use jobnet::math::sigmoid;
use jobnet::{Gradients, JobGraph, Lane, LayerKind, LayerSpec, Network, NetworkConfig};

const STDDEV: f32 = 0.5;

fn noisy_network() -> Network {
    let specs = vec![
        LayerSpec {
            kind: LayerKind::Stochastic { stddev: STDDEV },
            ..LayerSpec::default()
        },
        LayerSpec::default(),
    ];
    let cfg = NetworkConfig::with_specs(&[2, 3, 2], specs).unwrap();
    let params = vec![
        (vec![0.1, -0.3, 0.2], vec![0.5, -0.4, 0.3, 0.8, -0.6, 0.1]),
        (vec![0.05, -0.1], vec![0.7, -0.2, 0.4, -0.5, 0.3, 0.6]),
    ];
    let mut net = Network::from_parameters(cfg, params).unwrap();
    net.reseed_noise(17);
    net
}

/// Forward pass on `lane` with whatever noise it currently holds.
fn half_sq_cost(net: &Network, lane: &Lane, x: &[f32], t: &[f32]) -> f64 {
    net.stage(lane, x, Some(t)).unwrap();
    let mut graph = JobGraph::new();
    net.schedule_forward(&mut graph, lane).unwrap();
    net.complete(&mut graph);
    net.arena()
        .read(lane.output())
        .iter()
        .zip(t)
        .map(|(&o, &t)| {
            let e = f64::from(o) - f64::from(t);
            0.5 * e * e
        })
        .sum()
}

fn assert_close(analytic: f32, numeric: f64, what: &str) {
    let diff = (f64::from(analytic) - numeric).abs();
    assert!(
        diff <= 1e-3 + 1e-2 * numeric.abs(),
        "{what}: analytic={analytic} numeric={numeric}"
    );
}

fn run_example(net: &mut Network, lane: &Lane, grads: &Gradients, x: &[f32], t: &[f32]) {
    net.stage(lane, x, Some(t)).unwrap();
    net.sample_noise(lane).unwrap();
    let mut graph = JobGraph::new();
    net.schedule_forward(&mut graph, lane).unwrap();
    net.schedule_backward(&mut graph, lane, grads).unwrap();
    net.complete(&mut graph);
}

#[test]
fn sampled_bias_enters_the_forward_pass() {
    let mut net = noisy_network();
    let lane = net.lane();
    let grads = net.gradients();
    let x = [0.6, -0.9];
    run_example(&mut net, &lane, &grads, &x, &[1.0, 0.0]);

    let noise = net.arena().read(lane.noise(0).unwrap()).to_vec();
    assert!(noise.iter().any(|&e| e != 0.0));
    assert!(lane.noise(1).is_none());

    let mean = net.biases(0).to_vec();
    let w = net.weights(0).to_vec();
    let hidden = net.arena().read(lane.outputs()[0]).to_vec();
    for n in 0..3 {
        let z = mean[n] + STDDEV * noise[n] + w[2 * n] * x[0] + w[2 * n + 1] * x[1];
        assert_abs_diff_eq!(hidden[n], sigmoid(z), epsilon = 1e-6);
    }
}

#[test]
fn gradient_through_noisy_layer_matches_finite_differences() {
    let mut net = noisy_network();
    let lane = net.lane();
    let grads = net.gradients();
    let (x, t) = ([0.6, -0.9], [1.0, 0.0]);
    run_example(&mut net, &lane, &grads, &x, &t);

    let noise = net.arena().read(lane.noise(0).unwrap()).to_vec();
    let eps = 1e-2_f32;
    for l in 0..net.num_layers() {
        let dcdz = net.arena().read(grads.layer(l).dcdz()).to_vec();
        let dcdw = net.arena().read(grads.layer(l).dcdw()).to_vec();
        let biases = net.biases(l).to_vec();
        let weights = net.weights(l).to_vec();

        for i in 0..biases.len() {
            let mut b = biases.clone();
            b[i] = biases[i] + eps;
            net.set_parameters(l, &b, &weights).unwrap();
            let plus = half_sq_cost(&net, &lane, &x, &t);
            b[i] = biases[i] - eps;
            net.set_parameters(l, &b, &weights).unwrap();
            let minus = half_sq_cost(&net, &lane, &x, &t);
            net.set_parameters(l, &biases, &weights).unwrap();

            let numeric = (plus - minus) / (2.0 * f64::from(eps));
            assert_close(dcdz[i], numeric, &format!("layer {l} bias mean {i}"));
        }

        for i in 0..weights.len() {
            let mut w = weights.clone();
            w[i] = weights[i] + eps;
            net.set_parameters(l, &biases, &w).unwrap();
            let plus = half_sq_cost(&net, &lane, &x, &t);
            w[i] = weights[i] - eps;
            net.set_parameters(l, &biases, &w).unwrap();
            let minus = half_sq_cost(&net, &lane, &x, &t);
            net.set_parameters(l, &biases, &weights).unwrap();

            let numeric = (plus - minus) / (2.0 * f64::from(eps));
            assert_close(dcdw[i], numeric, &format!("layer {l} weight {i}"));
        }
    }

    // Staging and forward passes never resample.
    assert_eq!(&*net.arena().read(lane.noise(0).unwrap()), noise.as_slice());
}

#[test]
fn update_moves_bias_mean_by_its_delta() {
    let mut net = noisy_network();
    let lane = net.lane();
    let grads = net.gradients();
    run_example(&mut net, &lane, &grads, &[0.6, -0.9], &[1.0, 0.0]);

    let rate = 0.25;
    let dcdz = net.arena().read(grads.layer(0).dcdz()).to_vec();
    let before = net.biases(0).to_vec();
    assert!(dcdz.iter().any(|&d| d != 0.0));

    net.update(&grads, rate).unwrap();

    let expected: Vec<f32> = before
        .iter()
        .zip(&dcdz)
        .map(|(&b, &d)| b - d * rate)
        .collect();
    assert_eq!(&*net.biases(0), expected.as_slice());
}
