use std::path::PathBuf;

use anyhow::Result;
use burn::{
    backend::{ndarray::NdArrayDevice, NdArray},
    config::Config,
    tensor::Tensor,
};
use clap::Parser;
use frustum_feature_net::{
    registry::BackboneRegistry, BackboneWeights, FrustumFeatureNet, FrustumFeatureNetConfig,
};

type B = NdArray<f32>;

#[derive(Parser)]
#[command(name = "ffn-print")]
#[command(about = "Build the frustum feature network and print its structure")]
struct Cli {
    /// Constructor name: ResNet50 or ResNet101
    #[arg(default_value = "ResNet50")]
    constructor: String,

    /// safetensors checkpoint to apply on top of the network
    #[arg(short, long)]
    pretrained: Option<PathBuf>,

    /// JSON configuration file; overrides the other arguments
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip the ImageNet backbone download
    #[arg(long)]
    random_backbone: bool,

    /// Run a zero batch of this height and width and print the feature shape
    #[arg(long, num_args = 2, value_names = ["HEIGHT", "WIDTH"])]
    probe: Option<Vec<usize>>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let device = NdArrayDevice::default();

    let config = match &cli.config {
        Some(path) => FrustumFeatureNetConfig::load(path)?,
        None => {
            let weights = if cli.random_backbone {
                BackboneWeights::Random
            } else {
                BackboneWeights::ImageNet1kV1
            };
            FrustumFeatureNetConfig::new(cli.constructor.clone())
                .with_pretrained_path(cli.pretrained.clone())
                .with_backbone_weights(weights)
        }
    };

    let registry = BackboneRegistry::<B>::with_defaults();
    let model = registry.build(FrustumFeatureNet::<B>::NAME, &config, &device)?;

    println!("{}", model);
    println!("stages: {}", model.stem().stage_names().join(" -> "));

    if let Some([height, width]) = cli.probe.as_deref().map(|dims| [dims[0], dims[1]]) {
        let features = model.forward(Tensor::zeros([1, 3, height, width], &device));
        println!("features: {:?}", features.dims());
    }

    Ok(())
}
