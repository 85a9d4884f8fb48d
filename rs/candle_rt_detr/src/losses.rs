//! Per-layer loss dictionaries and their weighted reduction.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::config::RtDetrConfig;
use crate::error::{DetrError, Result};

/// Losses of one scored output, keyed by base name (`loss_ce`, `loss_bbox`, ...).
pub type LossDict = BTreeMap<String, Tensor>;

/// Which model output a [`LossDict`] was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Final decoder layer
    Main,
    /// Intermediate decoder layer `i`
    Aux(usize),
    /// Denoising slots of decoder layer `i`
    Denoising(usize),
    /// Encoder proposal head `i`
    Encoder(usize),
}

impl LayerKind {
    /// Suffix appended to every loss name of this layer.
    pub fn suffix(&self) -> String {
        match self {
            LayerKind::Main => String::new(),
            LayerKind::Aux(i) => format!("_aux_{}", i),
            LayerKind::Denoising(i) => format!("_dn_{}", i),
            LayerKind::Encoder(i) => format!("_enc_{}", i),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerLosses {
    pub kind: LayerKind,
    pub losses: LossDict,
}

impl LayerLosses {
    pub fn new(kind: LayerKind, losses: LossDict) -> Self {
        Self { kind, losses }
    }

    /// `(full name, base name, value)` for every loss of the layer.
    pub fn named(&self) -> impl Iterator<Item = (String, &str, &Tensor)> + '_ {
        let suffix = self.kind.suffix();
        self.losses
            .iter()
            .map(move |(base, v)| (format!("{}{}", base, suffix), base.as_str(), v))
    }
}

/// Folds per-layer loss dictionaries into one scalar using a shared
/// `weight_dict`. Losses without a weight are reported but not summed.
#[derive(Debug, Clone)]
pub struct WeightedReducer {
    weights: BTreeMap<String, f64>,
}

impl WeightedReducer {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    pub fn from_config(config: &RtDetrConfig) -> Self {
        Self::new(config.criterion.weight_dict.clone())
    }

    pub fn weight(&self, base_name: &str) -> Option<f64> {
        self.weights.get(base_name).copied()
    }

    /// Returns the weighted total and every loss under its full name.
    pub fn reduce(&self, layers: &[LayerLosses]) -> Result<(Tensor, BTreeMap<String, Tensor>)> {
        let mut total: Option<Tensor> = None;
        let mut all = BTreeMap::new();
        let mut device = None;

        for layer in layers {
            for (name, base, value) in layer.named() {
                device.get_or_insert_with(|| value.device().clone());
                if let Some(w) = self.weight(base) {
                    let term = value.to_dtype(DType::F32)?.affine(w, 0.0)?;
                    total = Some(match total {
                        Some(t) => (t + term)?,
                        None => term,
                    });
                }
                all.insert(name, value.clone());
            }
        }

        let total = match (total, device) {
            (Some(t), _) => t,
            (None, Some(d)) => Tensor::zeros((), DType::F32, &d)?,
            (None, None) => return Err(DetrError::shape("no losses to reduce")),
        };
        Ok((total, all))
    }
}
