//! Postprocess subcommand: decode saved head outputs into detections.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{Device, Tensor};
use candle_rt_detr::{coco_classes, Detection, ImageSize, PostProcessor, RtDetrConfig};
use clap::Args;
use serde::Serialize;

/// Arguments for the postprocess subcommand
#[derive(Args, Debug)]
pub struct PostprocessArgs {
    /// Class logits, `[B, Q, C]` or `[Q, C]`, in npy format.
    #[arg(long)]
    pub logits: PathBuf,
    /// Boxes (normalized cx, cy, w, h), `[B, Q, 4]` or `[Q, 4]`, in npy format.
    #[arg(long)]
    pub boxes: PathBuf,
    /// Original image width in pixels.
    #[arg(long)]
    pub width: u32,
    /// Original image height in pixels.
    #[arg(long)]
    pub height: u32,
    /// Write detections as JSON to this file.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Serialize)]
struct ImageDetections<'a> {
    image_index: usize,
    detections: &'a [Detection],
}

/// Read an npy file and add a batch dimension to 2-d arrays.
fn load_batched(path: &PathBuf, device: &Device) -> anyhow::Result<Tensor> {
    if !path.exists() {
        anyhow::bail!("File not found: {:?}", path);
    }
    let t = Tensor::read_npy(path)?.to_device(device)?;
    Ok(match t.rank() {
        2 => t.unsqueeze(0)?,
        3 => t,
        r => anyhow::bail!("{:?} has rank {}, expected 2 or 3", path, r),
    })
}

/// Run the postprocess subcommand
pub fn run(args: &PostprocessArgs, config: &RtDetrConfig, device: &Device) -> anyhow::Result<()> {
    let logits = load_batched(&args.logits, device)?;
    let boxes = load_batched(&args.boxes, device)?;
    println!("  logits shape: {:?}", logits.dims());
    println!("  boxes shape: {:?}", boxes.dims());

    let postprocessor = PostProcessor::from_config(config)?;
    let sizes = vec![ImageSize::new(args.width, args.height); logits.dim(0)?];

    let start = Instant::now();
    let detections = postprocessor.forward(&logits, &boxes, &sizes)?;
    println!("Post-processing completed in {:?}", start.elapsed());

    let pp = &config.model.postprocessor;
    let named = config.num_classes() == coco_classes::CATEGORIES.len() && !pp.remap_mscoco_category;
    for (i, dets) in detections.iter().enumerate() {
        println!(
            "Image {}: {} detections (max {}, threshold {})",
            i,
            dets.len(),
            postprocessor.max_detections(),
            pp.score_threshold
        );
        for det in dets.iter().take(10) {
            if named {
                println!("  {}: {}", coco_classes::class_name(det.class_id), det);
            } else {
                println!("  {}", det);
            }
        }
    }

    if let Some(path) = &args.output {
        let records: Vec<ImageDetections> = detections
            .iter()
            .enumerate()
            .map(|(image_index, d)| ImageDetections {
                image_index,
                detections: d,
            })
            .collect();
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &records)?;
        println!("Detections saved to: {:?}", path);
    }
    Ok(())
}
