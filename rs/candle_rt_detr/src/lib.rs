//! RT-DETR training core on candle
//!
//! Set-prediction matching, contrastive denoising queries, the set criterion
//! and NMS-free decoding for DETR-family detectors. Backbone, encoder and
//! decoder are external and plug in through [`model::DetectionModel`].

pub mod assignment;
pub mod attention;
pub mod box_ops;
pub mod coco_classes;
pub mod config;
pub mod criterion;
pub mod denoising;
pub mod detection;
pub mod error;
pub mod losses;
pub mod matcher;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod target;

pub use config::RtDetrConfig;
pub use criterion::{CriterionOutput, DetrOutputs, LayerOutput, SetCriterion};
pub use denoising::{DenoisingQueries, DenoisingQueryGenerator, Mode};
pub use detection::Detection;
pub use error::{DetrError, Result};
pub use matcher::HungarianMatcher;
pub use pipeline::DetrPipeline;
pub use postprocess::PostProcessor;
pub use target::{GroundTruthObject, ImageSize, ImageTargets};
