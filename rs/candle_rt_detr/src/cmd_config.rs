//! Config subcommand: validate and summarize a configuration.

use std::path::PathBuf;

use candle_rt_detr::RtDetrConfig;
use clap::Args;

/// Arguments for the config subcommand
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Write the full resolved configuration as YAML to this file.
    #[arg(long)]
    pub dump: Option<PathBuf>,
}

/// Run the config subcommand
pub fn run(args: &ConfigArgs, config: &RtDetrConfig) -> anyhow::Result<()> {
    config.validate()?;

    let m = &config.model;
    let d = &m.decoder;
    let c = &config.criterion;
    println!("Model:");
    println!("  Num classes: {}", m.num_classes);
    println!("  Backbone: ResNet-{}{}", m.backbone.depth, m.backbone.variant);
    println!("  Hidden dim: {}", d.hidden_dim);
    println!("  Queries: {}", d.num_queries);
    println!("  Decoder layers: {} (aux loss: {})", d.num_decoder_layers, d.aux_loss);
    println!(
        "  Denoising: {} (label noise {}, box noise {})",
        d.num_denoising, d.label_noise_ratio, d.box_noise_scale
    );
    println!("Criterion:");
    println!("  Losses: {:?}", c.losses);
    println!("  Weights: {:?}", c.weight_dict);
    println!(
        "  Matcher costs: class {}, bbox {}, giou {}",
        c.matcher.cost_class, c.matcher.cost_bbox, c.matcher.cost_giou
    );
    println!("  Aux matching: {:?}", c.aux_matching);
    println!("Postprocessor:");
    println!(
        "  Top queries: {}, threshold: {}, nms: {}",
        m.postprocessor.num_top_queries, m.postprocessor.score_threshold, m.postprocessor.use_nms
    );
    println!("Training:");
    println!("  Epochs: {}, seed: {}", config.epoches, config.seed);

    if let Some(path) = &args.dump {
        std::fs::write(path, serde_yaml::to_string(config)?)?;
        println!("Resolved configuration written to: {:?}", path);
    }
    Ok(())
}
