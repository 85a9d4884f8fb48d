//! Training and inference wiring around an external [`DetectionModel`].

use candle_core::Tensor;
use log::info;

use crate::config::RtDetrConfig;
use crate::criterion::{CriterionOutput, DetrOutputs, LayerOutput, SetCriterion};
use crate::denoising::{DenoisingQueries, DenoisingQueryGenerator, Mode};
use crate::detection::Detection;
use crate::error::{DetrError, Result};
use crate::model::DetectionModel;
use crate::postprocess::PostProcessor;
use crate::target::{ImageSize, ImageTargets};

pub struct DetrPipeline<M: DetectionModel> {
    model: M,
    generator: DenoisingQueryGenerator,
    criterion: SetCriterion,
    postprocessor: PostProcessor,
    aux_loss: bool,
    eval_idx: i64,
}

impl<M: DetectionModel> DetrPipeline<M> {
    /// Wire `model` to the components described by `config`.
    ///
    /// Fails when the model's classes, hidden size or query count disagree
    /// with the configuration.
    pub fn new(model: M, config: &RtDetrConfig) -> Result<Self> {
        config.validate()?;
        let d = &config.model.decoder;
        let expected_classes = if config.model.postprocessor.use_focal_loss {
            config.num_classes()
        } else {
            config.num_classes() + 1
        };
        let checks = [
            ("classification channels", model.num_classes(), expected_classes),
            ("hidden_dim", model.hidden_dim(), d.hidden_dim),
            ("num_queries", model.num_queries(), d.num_queries),
        ];
        for (what, got, want) in checks {
            if got != want {
                return Err(DetrError::shape(format!(
                    "model {} is {}, configuration says {}",
                    what, got, want
                )));
            }
        }
        let layers = d.num_decoder_layers as i64;
        if d.eval_idx >= layers || d.eval_idx < -layers {
            return Err(DetrError::config(format!(
                "decoder.eval_idx {} is out of range for {} layers",
                d.eval_idx, layers
            )));
        }

        info!(
            "pipeline: {} classes, {} queries, {} decoder layers, {} denoising",
            config.num_classes(),
            d.num_queries,
            d.num_decoder_layers,
            d.num_denoising
        );
        Ok(Self {
            model,
            generator: DenoisingQueryGenerator::from_config(config)?,
            criterion: SetCriterion::from_config(config)?,
            postprocessor: PostProcessor::from_config(config)?,
            aux_loss: d.aux_loss,
            eval_idx: d.eval_idx,
        })
    }

    /// Denoising queries for `mode`; always `None` outside training.
    pub fn prepare_queries(
        &self,
        mode: Mode,
        targets: &[ImageTargets],
        step: u64,
        images: &Tensor,
    ) -> Result<Option<DenoisingQueries>> {
        self.generator.generate(targets, step, mode, images.device())
    }

    /// One training forward: denoising queries, model, criterion.
    pub fn train_step(
        &self,
        images: &Tensor,
        targets: &[ImageTargets],
        step: u64,
    ) -> Result<CriterionOutput> {
        let dn = self.prepare_queries(Mode::Train, targets, step, images)?;
        let out = self.model.forward(images, dn.as_ref())?;
        let outputs = DetrOutputs::from_decoder_layers(
            out.decoder,
            out.encoder,
            dn.as_ref().map(|d| &d.meta),
            self.aux_loss,
        )?;
        self.criterion.forward(&outputs, targets)
    }

    /// Inference: model, then post-processing of the evaluation layer.
    pub fn infer(&self, images: &Tensor, sizes: &[ImageSize]) -> Result<Vec<Vec<Detection>>> {
        let dn = self.prepare_queries(Mode::Eval, &[], 0, images)?;
        let out = self.model.forward(images, dn.as_ref())?;
        let layer = self.eval_layer(&out.decoder)?;
        self.postprocessor.forward(&layer.logits, &layer.boxes, sizes)
    }

    fn eval_layer<'a>(&self, layers: &'a [LayerOutput]) -> Result<&'a LayerOutput> {
        let n = layers.len() as i64;
        let idx = if self.eval_idx < 0 { n + self.eval_idx } else { self.eval_idx };
        usize::try_from(idx)
            .ok()
            .and_then(|i| layers.get(i))
            .ok_or_else(|| DetrError::shape(format!("model returned {} decoder layers", n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelOutputs;
    use crate::target::GroundTruthObject;
    use candle_core::{DType, Device};

    /// Emits background logits and a fixed box for every learned query and
    /// echoes the noised boxes back for denoising slots.
    struct StubModel {
        num_classes: usize,
        num_queries: usize,
        num_layers: usize,
    }

    impl DetectionModel for StubModel {
        fn num_classes(&self) -> usize {
            self.num_classes
        }

        fn hidden_dim(&self) -> usize {
            256
        }

        fn num_queries(&self) -> usize {
            self.num_queries
        }

        fn forward(
            &self,
            images: &Tensor,
            denoising: Option<&DenoisingQueries>,
        ) -> Result<ModelOutputs> {
            let (bs, device) = (images.dim(0)?, images.device());
            let mut logits = Tensor::full(-4f32, (bs, self.num_queries, self.num_classes), device)?;
            let mut boxes = Tensor::full(0.25f32, (bs, self.num_queries, 4), device)?;
            if let Some(dn) = denoising {
                let num_dn = dn.meta.num_denoising_queries;
                let dn_logits = Tensor::zeros((bs, num_dn, self.num_classes), DType::F32, device)?;
                logits = Tensor::cat(&[&dn_logits, &logits], 1)?;
                boxes = Tensor::cat(&[&dn.boxes, &boxes], 1)?;
            }
            let layer = LayerOutput::new(logits, boxes);
            Ok(ModelOutputs {
                decoder: vec![layer; self.num_layers],
                encoder: vec![],
            })
        }
    }

    fn config() -> RtDetrConfig {
        let mut config = RtDetrConfig::r18vd();
        config.model.num_classes = 4;
        config.model.decoder.num_queries = 6;
        config.model.decoder.num_decoder_layers = 2;
        config.model.decoder.num_denoising = 4;
        config
    }

    fn stub() -> StubModel {
        StubModel {
            num_classes: 4,
            num_queries: 6,
            num_layers: 2,
        }
    }

    #[test]
    fn test_mismatched_model_rejected() {
        let mut model = stub();
        model.num_classes = 80;
        assert!(matches!(DetrPipeline::new(model, &config()), Err(DetrError::Shape(_))));
    }

    #[test]
    fn test_train_step_scores_every_layer() {
        let device = Device::Cpu;
        let pipeline = DetrPipeline::new(stub(), &config()).unwrap();
        let images = Tensor::zeros((2, 3, 32, 32), DType::F32, &device).unwrap();
        let targets = vec![
            ImageTargets::new(1, vec![GroundTruthObject::new(2, [0.3, 0.3, 0.2, 0.2])]),
            ImageTargets::new(2, vec![]),
        ];
        let out = pipeline.train_step(&images, &targets, 0).unwrap();
        for name in ["loss_ce", "loss_bbox_aux_0", "loss_giou_dn_0", "loss_ce_dn_1"] {
            assert!(out.losses.contains_key(name), "missing {}", name);
        }
        let scalars = out.scalars().unwrap();
        assert!(scalars.values().all(|v| v.is_finite()));
        assert_eq!(out.assignments[0].len(), 1);
        assert!(out.assignments[1].is_empty());
    }

    #[test]
    fn test_infer_caps_detections() {
        let device = Device::Cpu;
        let mut cfg = config();
        cfg.model.postprocessor.num_top_queries = 5;
        let pipeline = DetrPipeline::new(stub(), &cfg).unwrap();
        let images = Tensor::zeros((1, 3, 32, 32), DType::F32, &device).unwrap();
        let dets = pipeline.infer(&images, &[ImageSize::new(64, 48)]).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].len(), 5);
    }
}
