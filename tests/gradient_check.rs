use jobnet::{Network, NetworkConfig};

fn half_sq_cost(net: &mut Network, x: &[f32], t: &[f32]) -> f64 {
    let out = net.forward(x).unwrap();
    out.iter()
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

#[test]
fn analytic_gradient_matches_finite_differences() {
    let mut net = Network::with_seed(NetworkConfig::new(&[3, 4, 2]).unwrap(), 5).unwrap();
    let x = [0.3, -0.7, 0.9];
    let t = [1.0, 0.0];

    let grads = net.gradients();
    net.gradient(&x, &t, &grads).unwrap();

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
            let plus = half_sq_cost(&mut net, &x, &t);
            b[i] = biases[i] - eps;
            net.set_parameters(l, &b, &weights).unwrap();
            let minus = half_sq_cost(&mut net, &x, &t);
            net.set_parameters(l, &biases, &weights).unwrap();

            let numeric = (plus - minus) / (2.0 * f64::from(eps));
            assert_close(dcdz[i], numeric, &format!("layer {l} bias {i}"));
        }

        for i in 0..weights.len() {
            let mut w = weights.clone();
            w[i] = weights[i] + eps;
            net.set_parameters(l, &biases, &w).unwrap();
            let plus = half_sq_cost(&mut net, &x, &t);
            w[i] = weights[i] - eps;
            net.set_parameters(l, &biases, &w).unwrap();
            let minus = half_sq_cost(&mut net, &x, &t);
            net.set_parameters(l, &biases, &weights).unwrap();

            let numeric = (plus - minus) / (2.0 * f64::from(eps));
            assert_close(dcdw[i], numeric, &format!("layer {l} weight {i}"));
        }
    }
}

#[test]
fn gradient_vanishes_at_the_target() {
    // A single sigmoid unit whose output already equals the target.
    let cfg = NetworkConfig::new(&[1, 1]).unwrap();
    let mut net = Network::from_parameters(cfg, vec![(vec![0.0], vec![0.0])]).unwrap();
    let grads = net.gradients();
    net.gradient(&[2.0], &[0.5], &grads).unwrap();

    assert_eq!(&*net.arena().read(grads.layer(0).dcdz()), &[0.0]);
    assert_eq!(&*net.arena().read(grads.layer(0).dcdw()), &[0.0]);
}
