// DeepLstm: stacked LSTM + linear projection to per-character logits.
//
// Two entry points share the same weights:
//   forward()      variable-length batch, packed (no padding), training
//   forward_one()  one timestep with caller-owned RecurrentState, inference
//
// Packing: sequences are visited in descending-length order so the sequences
// still running at step t are always a prefix of that order. The state is
// narrowed to that prefix as shorter sequences finish, and the per-step
// hidden rows are gathered back into input order before the projection.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::rnn::LSTMState;
use candle_nn::{linear, lstm, LSTMConfig, Linear, VarBuilder, VarMap, LSTM, RNN};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ModelError;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn default_dropout() -> f32 {
    0.2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub n_layers: usize,
    /// One-hot width plus context width.
    pub in_size: usize,
    pub hidden_size: usize,
    /// Logit width; `num_chars + 1` for character prediction.
    pub out_size: usize,
    /// Applied to the input of every layer after the first, training only.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl NetworkConfig {
    /// Sizes derived from the alphabet and the context width.
    pub fn for_alphabet(
        num_chars: usize,
        context_dim: usize,
        n_layers: usize,
        hidden_size: usize,
    ) -> Self {
        Self {
            n_layers,
            in_size: num_chars + context_dim,
            hidden_size,
            out_size: num_chars + 1,
            dropout: default_dropout(),
        }
    }

    /// Small config for tests (fast).
    pub fn tiny(num_chars: usize, context_dim: usize) -> Self {
        Self {
            dropout: 0.0,
            ..Self::for_alphabet(num_chars, context_dim, 2, 16)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_layers == 0 || self.in_size == 0 || self.hidden_size == 0 || self.out_size == 0 {
            return Err(ModelError::shape(format!(
                "network sizes must be positive: {self:?}"
            ))
            .into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recurrent state
// ---------------------------------------------------------------------------

/// (hidden, cell) for every layer. Owned by a single decode session and
/// replaced wholesale by each `forward_one` call.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    layers: Vec<LSTMState>,
}

impl RecurrentState {
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn batch_size(&self) -> Result<usize> {
        match self.layers.first() {
            Some(s) => Ok(s.h.dim(0)?),
            None => Ok(0),
        }
    }

    pub fn hidden(&self, layer: usize) -> Option<&Tensor> {
        self.layers.get(layer).map(|s| &s.h)
    }

    pub fn cell(&self, layer: usize) -> Option<&Tensor> {
        self.layers.get(layer).map(|s| &s.c)
    }
}

// ---------------------------------------------------------------------------
// DeepLstm
// ---------------------------------------------------------------------------

pub struct DeepLstm {
    pub config: NetworkConfig,
    layers: Vec<LSTM>,
    post_linear: Linear,
    device: Device,
}

impl DeepLstm {
    pub fn from_vb(config: NetworkConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let in_dim = if i == 0 { config.in_size } else { config.hidden_size };
            let cfg = LSTMConfig {
                layer_idx: i,
                ..Default::default()
            };
            layers.push(lstm(in_dim, config.hidden_size, cfg, vb.pp("lstm"))?);
        }
        let post_linear = linear(config.hidden_size, config.out_size, vb.pp("post_linear"))?;
        Ok(Self {
            config,
            layers,
            post_linear,
            device: vb.device().clone(),
        })
    }

    pub fn new(config: NetworkConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::from_vb(config, vb)
    }

    /// Build the architecture and restore a saved weight set into it. Any
    /// missing, extra or differently shaped tensor is an error.
    pub fn load(
        config: NetworkConfig,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let model = Self::new(config, &varmap, device)?;
        crate::training::load_checkpoint(&varmap, path, device)?;
        Ok((model, varmap))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Batched forward over `xs[i]: (len_i, in_size)`. Returns `(len_i, out_size)`
    /// logits per sequence, in input order. `train` enables inter-layer dropout.
    pub fn forward(&self, xs: &[Tensor], train: bool) -> Result<Vec<Tensor>> {
        let lengths = self.check_batch(xs)?;

        let mut order: Vec<usize> = (0..xs.len()).collect();
        order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
        let max_len = lengths[order[0]];

        let mut states = self
            .layers
            .iter()
            .map(|l| l.zero_state(xs.len()))
            .collect::<candle_core::Result<Vec<_>>>()?;

        // steps[t]: top-layer hidden rows of the sequences active at t, in `order`
        let mut steps: Vec<Tensor> = Vec::with_capacity(max_len);
        for t in 0..max_len {
            let active = order.iter().take_while(|&&i| lengths[i] > t).count();
            let rows = order[..active]
                .iter()
                .map(|&i| xs[i].get(t))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let mut x = Tensor::stack(&rows, 0)?;

            for (l, (layer, state)) in self.layers.iter().zip(states.iter_mut()).enumerate() {
                if train && l > 0 && self.config.dropout > 0.0 {
                    x = candle_nn::ops::dropout(&x, self.config.dropout)?;
                }
                let next = layer.step(&x, &narrow_state(state, active)?)?;
                x = next.h.clone();
                *state = next;
            }
            steps.push(x);
        }

        let mut rank = vec![0usize; xs.len()];
        for (pos, &i) in order.iter().enumerate() {
            rank[i] = pos;
        }
        let hs = (0..xs.len())
            .map(|i| {
                let rows = (0..lengths[i])
                    .map(|t| steps[t].get(rank[i]))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Tensor::stack(&rows, 0)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let packed = Tensor::cat(&hs, 0)?;
        let logits = self.post_linear.forward(&packed)?;
        split_rows(&logits, &lengths)
    }

    /// One timestep for a batch `x: (batch, in_size)`. `state` is `None` on the
    /// first step of a session.
    pub fn forward_one(
        &self,
        x: &Tensor,
        state: Option<&RecurrentState>,
    ) -> Result<(RecurrentState, Tensor)> {
        let (batch, width) = x.dims2().map_err(|_| {
            ModelError::shape(format!(
                "expected (batch, {}), got {:?}",
                self.config.in_size,
                x.dims()
            ))
        })?;
        if width != self.config.in_size {
            return Err(ModelError::shape(format!(
                "input width {width} != in_size {}",
                self.config.in_size
            ))
            .into());
        }

        let prev = match state {
            Some(s) => {
                if s.n_layers() != self.layers.len() {
                    return Err(ModelError::shape(format!(
                        "state has {} layers, model has {}",
                        s.n_layers(),
                        self.layers.len()
                    ))
                    .into());
                }
                let rows = s.batch_size()?;
                if rows != batch {
                    return Err(ModelError::shape(format!(
                        "state batch {rows} != input batch {batch}"
                    ))
                    .into());
                }
                s.layers.clone()
            }
            None => self
                .layers
                .iter()
                .map(|l| l.zero_state(batch))
                .collect::<candle_core::Result<Vec<_>>>()?,
        };

        let mut h = x.clone();
        let mut next = Vec::with_capacity(self.layers.len());
        for (layer, s) in self.layers.iter().zip(prev.iter()) {
            let s = layer.step(&h, s)?;
            h = s.h.clone();
            next.push(s);
        }
        let logits = self.post_linear.forward(&h)?;
        Ok((RecurrentState { layers: next }, logits))
    }

    fn check_batch(&self, xs: &[Tensor]) -> Result<Vec<usize>> {
        if xs.is_empty() {
            return Err(ModelError::EmptyBatch.into());
        }
        let mut lengths = Vec::with_capacity(xs.len());
        for (index, x) in xs.iter().enumerate() {
            let (len, width) = x.dims2().map_err(|_| {
                ModelError::shape(format!("sequence {index} must be 2-D, got {:?}", x.dims()))
            })?;
            if width != self.config.in_size {
                return Err(ModelError::shape(format!(
                    "sequence {index} has width {width}, in_size is {}",
                    self.config.in_size
                ))
                .into());
            }
            if len == 0 {
                return Err(ModelError::EmptySequence { index }.into());
            }
            lengths.push(len);
        }
        Ok(lengths)
    }
}

fn narrow_state(state: &LSTMState, rows: usize) -> Result<LSTMState> {
    if state.h.dim(0)? == rows {
        return Ok(state.clone());
    }
    Ok(LSTMState {
        h: state.h.narrow(0, 0, rows)?,
        c: state.c.narrow(0, 0, rows)?,
    })
}

/// Split a packed `(sum(lengths), n)` matrix at cumulative offsets.
pub fn split_rows(packed: &Tensor, lengths: &[usize]) -> Result<Vec<Tensor>> {
    let total: usize = lengths.iter().sum();
    if packed.dim(0)? != total {
        return Err(ModelError::shape(format!(
            "packed rows {} != sum of lengths {total}",
            packed.dim(0)?
        ))
        .into());
    }
    let mut offset = 0;
    let mut out = Vec::with_capacity(lengths.len());
    for &len in lengths {
        out.push(packed.narrow(0, offset, len)?);
        offset += len;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
