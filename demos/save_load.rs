use jobnet::{Activation, Network, NetworkBuilder, persist};

fn main() -> jobnet::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let mut net = NetworkBuilder::new(3)?
        .add_layer(4, Activation::Relu)?
        .add_layer(2, Activation::Sigmoid)?
        .build_with_seed(0)?;

    let dir = std::env::temp_dir();
    let json = dir.join("jobnet_demo.json");
    let bin = dir.join("jobnet_demo.bin");

    net.save_json(&json)?;
    persist::save_file(&net, &bin)?;

    let mut from_json = Network::load_json(&json)?;
    let mut from_bin = persist::load_file(&bin)?;

    let x = [0.1, 0.2, 0.3];
    let y = net.forward(&x)?.to_vec();
    let y_json = from_json.forward(&x)?.to_vec();
    // The binary format keeps parameters only, so layer 0 comes back as sigmoid.
    let y_bin = from_bin.forward(&x)?.to_vec();
    println!("original={y:?}\njson={y_json:?}\nbinary={y_bin:?}");
    Ok(())
}
