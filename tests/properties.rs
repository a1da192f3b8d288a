use proptest::prelude::*;

use jobnet::math::{arg_max, one_hot};
use jobnet::{Network, NetworkConfig};

fn layer_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..6, 2..5)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn forward_output_has_output_width(sizes in layer_sizes(), seed in any::<u64>()) {
        let cfg = NetworkConfig::new(&sizes).unwrap();
        let mut net = Network::with_seed(cfg, seed).unwrap();
        let input = vec![0.5; sizes[0]];
        let out = net.forward(&input).unwrap();
        prop_assert_eq!(out.len(), *sizes.last().unwrap());
        prop_assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn same_seed_same_output(sizes in layer_sizes(), seed in any::<u64>(), x in -2.0f32..2.0) {
        let cfg = NetworkConfig::new(&sizes).unwrap();
        let input = vec![x; sizes[0]];
        let mut a = Network::with_seed(cfg.clone(), seed).unwrap();
        let mut b = Network::with_seed(cfg, seed).unwrap();
        b.set_threads(1).unwrap();
        let oa = a.forward(&input).unwrap().to_vec();
        let ob = b.forward(&input).unwrap().to_vec();
        prop_assert_eq!(oa, ob);
    }

    #[test]
    fn one_hot_then_arg_max_recovers_class(classes in 1usize..20, pick in any::<prop::sample::Index>()) {
        let class = pick.index(classes);
        let mut v = vec![0.0; classes];
        one_hot(class, &mut v).unwrap();
        prop_assert_eq!(arg_max(&v), Some(class));
        prop_assert_eq!(v.iter().sum::<f32>(), 1.0);
    }
}
