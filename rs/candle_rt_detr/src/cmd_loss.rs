//! Loss subcommand: score saved decoder outputs against annotations.
//!
//! The safetensors file holds `pred_logits` / `pred_boxes` for the final
//! layer, and optionally `aux.{i}.pred_logits` / `aux.{i}.pred_boxes` and
//! `enc.{i}.pred_logits` / `enc.{i}.pred_boxes`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::{Device, Tensor};
use candle_rt_detr::{DetrOutputs, ImageTargets, LayerOutput, RtDetrConfig, SetCriterion};
use clap::Args;

/// Arguments for the loss subcommand
#[derive(Args, Debug)]
pub struct LossArgs {
    /// Decoder outputs in safetensors format.
    #[arg(long)]
    pub outputs: PathBuf,
    /// Annotations: a JSON list of `{image_id, objects: [{label, bbox}]}`.
    #[arg(long)]
    pub targets: PathBuf,
}

fn take_layer(tensors: &mut HashMap<String, Tensor>, prefix: &str) -> Option<LayerOutput> {
    let logits = tensors.remove(&format!("{}pred_logits", prefix))?;
    let boxes = tensors.remove(&format!("{}pred_boxes", prefix))?;
    Some(LayerOutput::new(logits, boxes))
}

fn take_indexed(tensors: &mut HashMap<String, Tensor>, group: &str) -> Vec<LayerOutput> {
    (0..)
        .map_while(|i| take_layer(tensors, &format!("{}.{}.", group, i)))
        .collect()
}

/// Run the loss subcommand
pub fn run(args: &LossArgs, config: &RtDetrConfig, device: &Device) -> anyhow::Result<()> {
    for path in [&args.outputs, &args.targets] {
        if !path.exists() {
            anyhow::bail!("File not found: {:?}", path);
        }
    }

    let mut tensors = candle_core::safetensors::load(&args.outputs, device)?;
    let Some(main) = take_layer(&mut tensors, "") else {
        anyhow::bail!(
            "{:?} has no pred_logits/pred_boxes.\n\
            Export the final decoder layer under those names.",
            args.outputs
        );
    };
    let aux = take_indexed(&mut tensors, "aux");
    let encoder = take_indexed(&mut tensors, "enc");
    for name in tensors.keys() {
        log::warn!("ignoring tensor {}", name);
    }

    let targets: Vec<ImageTargets> =
        serde_json::from_reader(std::fs::File::open(&args.targets)?)?;
    println!(
        "Scoring {} images: {} aux layers, {} encoder outputs",
        targets.len(),
        aux.len(),
        encoder.len()
    );

    let aux = if config.model.decoder.aux_loss { aux } else { Vec::new() };
    if aux.len() + 1 != config.num_supervised_layers() {
        log::warn!(
            "{} decoder layers in {:?}, config expects {}",
            aux.len() + 1,
            args.outputs,
            config.num_supervised_layers()
        );
    }
    let outputs = DetrOutputs {
        main,
        aux,
        encoder,
        denoising: None,
    };
    let criterion = SetCriterion::from_config(config)?;

    let start = Instant::now();
    let result = criterion.forward(&outputs, &targets)?;
    println!("Criterion evaluated in {:?}", start.elapsed());

    for (i, assignment) in result.assignments.iter().enumerate() {
        println!("  image {}: {:?}", targets[i].image_id, assignment.pairs());
    }
    for (name, value) in result.scalars()? {
        println!("{:<24} {:.6}", name, value);
    }
    Ok(())
}
