//! RT-DETR Configuration
//!
//! This module defines the configuration tree read from a YAML file. The
//! sections owned by this crate (`model`, `criterion`) are fully typed;
//! sections that only describe external collaborators (data loaders,
//! optimizer, scheduler, evaluator) keep their own parameters in opaque
//! YAML values. Unknown keys are rejected everywhere a struct is typed.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DetrError, Result};

/// Classification loss/score family used by the heads, matcher and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Sigmoid focal loss, reported as `loss_ce`
    Focal,
    /// Softmax cross-entropy with a no-object class, reported as `loss_ce`
    Labels,
    /// Varifocal loss, reported as `loss_vfl`
    Vfl,
    /// L1 + GIoU box regression, reported as `loss_bbox` and `loss_giou`
    Boxes,
    /// Detached count error, reported as `loss_cardinality`
    Cardinality,
}

/// Where auxiliary decoder layers get their assignment from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxMatching {
    /// Every layer runs its own bipartite matching
    #[default]
    PerLayer,
    /// Every layer reuses the final layer's assignment
    ReuseFinal,
}

/// Backbone description (external collaborator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackboneConfig {
    /// ResNet depth (18, 34, 50, 101)
    pub depth: usize,
    pub variant: String,
    pub freeze_at: i64,
    pub return_idx: Vec<usize>,
    pub num_stages: usize,
    pub freeze_norm: bool,
    pub pretrained: bool,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            depth: 50,
            variant: "d".to_string(),
            freeze_at: 0,
            return_idx: vec![1, 2, 3],
            num_stages: 4,
            freeze_norm: true,
            pretrained: true,
        }
    }
}

/// Hybrid encoder description (external collaborator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HybridEncoderConfig {
    pub in_channels: Vec<usize>,
    pub feat_strides: Vec<usize>,
    pub hidden_dim: usize,
    pub use_encoder_idx: Vec<usize>,
    pub num_encoder_layers: usize,
    pub nhead: usize,
    pub dim_feedforward: usize,
    pub dropout: f64,
    pub enc_act: String,
    pub expansion: f64,
    pub depth_mult: f64,
    pub act: String,
}

impl Default for HybridEncoderConfig {
    fn default() -> Self {
        Self {
            in_channels: vec![512, 1024, 2048],
            feat_strides: vec![8, 16, 32],
            hidden_dim: 256,
            use_encoder_idx: vec![2],
            num_encoder_layers: 1,
            nhead: 8,
            dim_feedforward: 1024,
            dropout: 0.0,
            enc_act: "gelu".to_string(),
            expansion: 1.0,
            depth_mult: 1.0,
            act: "silu".to_string(),
        }
    }
}

/// Transformer decoder and query configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub feat_channels: Vec<usize>,
    pub feat_strides: Vec<usize>,
    /// Hidden dimension of the decoder
    pub hidden_dim: usize,
    /// Number of feature levels sampled by deformable attention
    pub num_levels: usize,
    /// Number of learned object queries
    pub num_queries: usize,
    /// Number of decoder layers
    pub num_decoder_layers: usize,
    /// Cap on positive denoising queries per forward pass (0 disables denoising)
    pub num_denoising: usize,
    /// Probability of replacing a noised query's label
    pub label_noise_ratio: f64,
    /// Box perturbation scale, relative to the box size
    pub box_noise_scale: f64,
    /// Decoder layer used at inference (-1 = last)
    pub eval_idx: i64,
    pub num_points: usize,
    pub nhead: usize,
    pub dim_feedforward: usize,
    /// Whether intermediate decoder layers are supervised
    pub aux_loss: bool,
    pub learnt_init_query: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            feat_channels: vec![256, 256, 256],
            feat_strides: vec![8, 16, 32],
            hidden_dim: 256,
            num_levels: 3,
            num_queries: 300,
            num_decoder_layers: 6,
            num_denoising: 100,
            label_noise_ratio: 0.5,
            box_noise_scale: 1.0,
            eval_idx: -1,
            num_points: 4,
            nhead: 8,
            dim_feedforward: 1024,
            aux_loss: true,
            learnt_init_query: false,
        }
    }
}

/// Inference-time decoding of the final decoder layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostProcessorConfig {
    /// Maximum number of detections per image
    pub num_top_queries: usize,
    /// Detections scoring below this are dropped (0.0 keeps everything)
    pub score_threshold: f32,
    /// Sigmoid scores (focal head) instead of softmax with a no-object class
    pub use_focal_loss: bool,
    /// Use per-class NMS instead of flattened top-k
    pub use_nms: bool,
    pub nms_iou_threshold: f32,
    /// Map contiguous labels to COCO category ids
    pub remap_mscoco_category: bool,
}

impl Default for PostProcessorConfig {
    fn default() -> Self {
        Self {
            num_top_queries: 300,
            score_threshold: 0.0,
            use_focal_loss: true,
            use_nms: false,
            nms_iou_threshold: 0.7,
            remap_mscoco_category: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Number of object classes (COCO = 80, no background channel)
    pub num_classes: usize,
    pub backbone: BackboneConfig,
    pub encoder: HybridEncoderConfig,
    pub decoder: DecoderConfig,
    pub postprocessor: PostProcessorConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 80,
            backbone: BackboneConfig::default(),
            encoder: HybridEncoderConfig::default(),
            decoder: DecoderConfig::default(),
            postprocessor: PostProcessorConfig::default(),
        }
    }
}

/// Matching cost weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherConfig {
    pub cost_class: f64,
    pub cost_bbox: f64,
    pub cost_giou: f64,
    pub alpha: f64,
    pub gamma: f64,
    pub use_focal_loss: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            cost_class: 1.0,
            cost_bbox: 5.0,
            cost_giou: 2.0,
            alpha: 0.25,
            gamma: 2.0,
            use_focal_loss: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CriterionConfig {
    /// Weight of each named loss in the total; unnamed losses are report-only
    pub weight_dict: BTreeMap<String, f64>,
    pub losses: Vec<LossKind>,
    pub alpha: f64,
    pub gamma: f64,
    pub aux_matching: AuxMatching,
    pub matcher: MatcherConfig,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        let weight_dict = [("loss_ce", 1.0), ("loss_bbox", 5.0), ("loss_giou", 2.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            weight_dict,
            losses: vec![LossKind::Focal, LossKind::Boxes, LossKind::Cardinality],
            alpha: 0.25,
            gamma: 2.0,
            aux_matching: AuxMatching::PerLayer,
            matcher: MatcherConfig::default(),
        }
    }
}

/// Data loader description (external collaborator).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataLoaderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub batch_size: usize,
    pub shuffle: bool,
    pub num_workers: usize,
    pub drop_last: bool,
    /// Dataset and transform parameters, owned by the data pipeline
    pub dataset: serde_yaml::Value,
    pub collate_fn: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub lr: f64,
    pub betas: Vec<f64>,
    pub weight_decay: f64,
    /// Parameter groups, owned by the optimizer
    pub params: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LrSchedulerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub milestones: Vec<usize>,
    pub gamma: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluatorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub iou_types: Vec<String>,
}

/// Complete training/evaluation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RtDetrConfig {
    pub model: ModelConfig,
    pub criterion: CriterionConfig,
    pub train_dataloader: DataLoaderConfig,
    pub val_dataloader: DataLoaderConfig,
    pub optimizer: OptimizerConfig,
    pub lr_scheduler: LrSchedulerConfig,
    pub evaluator: EvaluatorConfig,

    // Training loop knobs, consumed by the external trainer
    pub epoches: usize,
    pub use_amp: bool,
    pub use_ema: bool,
    pub clip_max_norm: f64,
    /// Global seed; denoising noise streams derive from it
    pub seed: u64,
    pub device: String,
    pub output_dir: String,
    pub print_freq: usize,
    pub checkpoint_freq: usize,
}

impl Default for RtDetrConfig {
    fn default() -> Self {
        Self::r50vd()
    }
}

impl RtDetrConfig {
    fn with_model(model: ModelConfig) -> Self {
        Self {
            model,
            criterion: CriterionConfig::default(),
            train_dataloader: DataLoaderConfig {
                kind: "DataLoader".to_string(),
                batch_size: 4,
                shuffle: true,
                num_workers: 4,
                drop_last: true,
                ..Default::default()
            },
            val_dataloader: DataLoaderConfig {
                kind: "DataLoader".to_string(),
                batch_size: 8,
                shuffle: false,
                num_workers: 4,
                drop_last: false,
                ..Default::default()
            },
            optimizer: OptimizerConfig {
                kind: "AdamW".to_string(),
                lr: 1e-4,
                betas: vec![0.9, 0.999],
                weight_decay: 1e-4,
                params: serde_yaml::Value::Null,
            },
            lr_scheduler: LrSchedulerConfig {
                kind: "MultiStepLR".to_string(),
                milestones: vec![1000],
                gamma: 0.1,
            },
            evaluator: EvaluatorConfig {
                kind: "CocoEvaluator".to_string(),
                iou_types: vec!["bbox".to_string()],
            },
            epoches: 72,
            use_amp: false,
            use_ema: true,
            clip_max_norm: 0.1,
            seed: 0,
            device: "cuda".to_string(),
            output_dir: "./output".to_string(),
            print_freq: 100,
            checkpoint_freq: 1,
        }
    }

    /// RT-DETR with a ResNet-18-vd backbone and 3 decoder layers
    pub fn r18vd() -> Self {
        let mut model = ModelConfig::default();
        model.backbone.depth = 18;
        model.backbone.freeze_at = -1;
        model.backbone.freeze_norm = false;
        model.encoder.in_channels = vec![128, 256, 512];
        model.encoder.expansion = 0.5;
        model.decoder.num_decoder_layers = 3;
        Self::with_model(model)
    }

    /// RT-DETR with a ResNet-34-vd backbone and 4 decoder layers
    pub fn r34vd() -> Self {
        let mut config = Self::r18vd();
        config.model.backbone.depth = 34;
        config.model.decoder.num_decoder_layers = 4;
        config
    }

    /// RT-DETR with a ResNet-50-vd backbone and 6 decoder layers
    pub fn r50vd() -> Self {
        Self::with_model(ModelConfig::default())
    }

    /// RT-DETR with a ResNet-101-vd backbone and a wider encoder
    pub fn r101vd() -> Self {
        let mut model = ModelConfig::default();
        model.backbone.depth = 101;
        model.encoder.hidden_dim = 384;
        model.encoder.dim_feedforward = 2048;
        model.decoder.feat_channels = vec![384, 384, 384];
        Self::with_model(model)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes
    }

    pub fn num_queries(&self) -> usize {
        self.model.decoder.num_queries
    }

    /// Number of per-layer outputs the criterion scores (final + auxiliary)
    pub fn num_supervised_layers(&self) -> usize {
        if self.model.decoder.aux_loss {
            self.model.decoder.num_decoder_layers
        } else {
            1
        }
    }

    /// Check value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let d = &m.decoder;
        let e = &m.encoder;
        let c = &self.criterion;

        if m.num_classes == 0 {
            return Err(DetrError::config("model.num_classes must be positive"));
        }
        if d.num_queries == 0 {
            return Err(DetrError::config("decoder.num_queries must be positive"));
        }
        if d.num_decoder_layers == 0 {
            return Err(DetrError::config("decoder.num_decoder_layers must be positive"));
        }
        if d.hidden_dim == 0 || d.nhead == 0 || d.hidden_dim % d.nhead != 0 {
            return Err(DetrError::config(format!(
                "decoder.hidden_dim ({}) must be a positive multiple of decoder.nhead ({})",
                d.hidden_dim, d.nhead
            )));
        }
        if e.hidden_dim == 0 || e.nhead == 0 || e.hidden_dim % e.nhead != 0 {
            return Err(DetrError::config(format!(
                "encoder.hidden_dim ({}) must be a positive multiple of encoder.nhead ({})",
                e.hidden_dim, e.nhead
            )));
        }
        if d.feat_channels.len() != d.num_levels || d.feat_strides.len() != d.num_levels {
            return Err(DetrError::config(format!(
                "decoder.feat_channels and feat_strides must have num_levels ({}) entries",
                d.num_levels
            )));
        }
        if e.in_channels.len() != e.feat_strides.len() {
            return Err(DetrError::config(
                "encoder.in_channels and encoder.feat_strides differ in length",
            ));
        }
        if !(0.0..=1.0).contains(&d.label_noise_ratio) {
            return Err(DetrError::config("decoder.label_noise_ratio must be in [0, 1]"));
        }
        if d.box_noise_scale < 0.0 {
            return Err(DetrError::config("decoder.box_noise_scale must be non-negative"));
        }
        if m.postprocessor.num_top_queries == 0 {
            return Err(DetrError::config("postprocessor.num_top_queries must be positive"));
        }
        if !(0.0..=1.0).contains(&m.postprocessor.nms_iou_threshold) {
            return Err(DetrError::config("postprocessor.nms_iou_threshold must be in [0, 1]"));
        }

        for alpha in [c.alpha, c.matcher.alpha] {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(DetrError::config("focal alpha must be in [0, 1]"));
            }
        }
        if c.gamma < 0.0 || c.matcher.gamma < 0.0 {
            return Err(DetrError::config("focal gamma must be non-negative"));
        }
        if c.losses.is_empty() {
            return Err(DetrError::config("criterion.losses must not be empty"));
        }
        let classification = c
            .losses
            .iter()
            .filter(|k| matches!(k, LossKind::Focal | LossKind::Vfl | LossKind::Labels))
            .count();
        if classification > 1 {
            return Err(DetrError::config(
                "criterion.losses may hold only one of focal, vfl and labels",
            ));
        }
        let sigmoid_head = m.postprocessor.use_focal_loss;
        if c.losses.contains(&LossKind::Labels) == sigmoid_head && classification == 1 {
            return Err(DetrError::config(if sigmoid_head {
                "the labels loss needs a softmax head (use_focal_loss: false)"
            } else {
                "focal and vfl losses need a sigmoid head (use_focal_loss: true)"
            }));
        }
        const KNOWN: [&str; 5] = [
            "loss_ce",
            "loss_vfl",
            "loss_bbox",
            "loss_giou",
            "loss_cardinality",
        ];
        for (name, weight) in &c.weight_dict {
            if !KNOWN.contains(&name.as_str()) {
                return Err(DetrError::config(format!(
                    "criterion.weight_dict has unknown loss '{}'",
                    name
                )));
            }
            if !weight.is_finite() {
                return Err(DetrError::config(format!("weight of '{}' is not finite", name)));
            }
        }
        if c.matcher.use_focal_loss != m.postprocessor.use_focal_loss {
            return Err(DetrError::config(
                "matcher.use_focal_loss and postprocessor.use_focal_loss disagree",
            ));
        }
        if self.epoches == 0 {
            return Err(DetrError::config("epoches must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for config in [
            RtDetrConfig::r18vd(),
            RtDetrConfig::r34vd(),
            RtDetrConfig::r50vd(),
            RtDetrConfig::r101vd(),
        ] {
            config.validate().unwrap();
        }
        assert_eq!(RtDetrConfig::r18vd().model.decoder.num_decoder_layers, 3);
        assert_eq!(RtDetrConfig::r50vd().num_supervised_layers(), 6);
    }

    #[test]
    fn test_default_matches_reference_knobs() {
        let config = RtDetrConfig::default();
        assert_eq!(config.num_queries(), 300);
        assert_eq!(config.model.decoder.num_denoising, 100);
        assert_eq!(config.criterion.weight_dict["loss_bbox"], 5.0);
        assert_eq!(config.criterion.matcher.cost_giou, 2.0);
        assert_eq!(config.criterion.aux_matching, AuxMatching::PerLayer);
    }

    #[test]
    fn test_bundled_config_parses() {
        let yaml = include_str!("../../../configs/rtdetr_r50vd_6x_coco.yml");
        let config = RtDetrConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.num_classes(), 80);
        assert_eq!(config.model.decoder.num_decoder_layers, 6);
        assert_eq!(
            config.criterion.losses,
            vec![LossKind::Focal, LossKind::Boxes, LossKind::Cardinality]
        );
        assert!(config.model.postprocessor.remap_mscoco_category);
        assert_eq!(config.train_dataloader.batch_size, 4);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let yaml = "epoches: 10\nlearning_rate: 0.1\n";
        assert!(RtDetrConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_nested_key_rejected() {
        let yaml = "model:\n  decoder:\n    num_querys: 10\n";
        assert!(RtDetrConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "model:\n  num_classes: 20\ncriterion:\n  aux_matching: reuse_final\nseed: 7\n";
        let config = RtDetrConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.num_classes(), 20);
        assert_eq!(config.num_queries(), 300);
        assert_eq!(config.criterion.aux_matching, AuxMatching::ReuseFinal);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn test_inconsistent_values_rejected() {
        let mut config = RtDetrConfig::default();
        config.model.decoder.nhead = 7;
        assert!(config.validate().is_err());

        let mut config = RtDetrConfig::default();
        config.model.decoder.label_noise_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = RtDetrConfig::default();
        config.criterion.weight_dict.insert("loss_mask".to_string(), 1.0);
        assert!(config.validate().is_err());

        let mut config = RtDetrConfig::default();
        config.criterion.losses = vec![LossKind::Focal, LossKind::Vfl];
        assert!(config.validate().is_err());

        let mut config = RtDetrConfig::default();
        config.criterion.losses = vec![LossKind::Labels, LossKind::Boxes];
        assert!(config.validate().is_err());
        config.model.postprocessor.use_focal_loss = false;
        config.criterion.matcher.use_focal_loss = false;
        config.validate().unwrap();
    }
}
