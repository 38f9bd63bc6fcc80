use anyhow::{anyhow, bail, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, SGD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::codec::CharCodec;
use crate::config::Config;
use crate::dataset::{load_alphabet, load_texts, make_records, Batches, SplitDataset};
use crate::embed::ContextEmbedder;
use crate::error::ModelError;
use crate::network::DeepLstm;
use crate::objective::{SequenceRecord, TrainingObjective};

// ---------------------------------------------------------------------------
// Linear LR shift
// ---------------------------------------------------------------------------

/// Learning rate moves linearly from `value_range.0` to `value_range.1` while
/// the iteration goes from `time_range.0` to `time_range.1`, and is held
/// constant outside that window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearShift {
    pub value_range: (f64, f64),
    pub time_range: (usize, usize),
}

impl LinearShift {
    pub fn value_at(&self, iteration: usize) -> f64 {
        let (v0, v1) = self.value_range;
        let (t0, t1) = self.time_range;
        if iteration <= t0 {
            v0
        } else if iteration >= t1 {
            v1
        } else {
            let rate = (iteration - t0) as f64 / (t1 - t0) as f64;
            v0 + rate * (v1 - v0)
        }
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

/// Selected by `"name"` in the config; the remaining keys are the optimizer's
/// own hyperparameters. Learning rate and weight decay stay in `TrainConfig`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum OptimizerConfig {
    /// AdamW; with `weight_decay = 0` this is plain Adam.
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_eps")]
        eps: f64,
    },
    Sgd,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
        }
    }
}

enum TrainOptimizer {
    Adam(AdamW),
    Sgd(SGD),
}

impl TrainOptimizer {
    fn new(config: &TrainConfig, vars: Vec<Var>) -> Result<Self> {
        let lr = config.initial_lr();
        Ok(match &config.optimizer {
            OptimizerConfig::Adam { beta1, beta2, eps } => {
                let params = ParamsAdamW {
                    lr,
                    beta1: *beta1,
                    beta2: *beta2,
                    eps: *eps,
                    weight_decay: config.weight_decay,
                };
                Self::Adam(AdamW::new(vars, params)?)
            }
            OptimizerConfig::Sgd => {
                if config.weight_decay != 0.0 {
                    tracing::warn!(
                        weight_decay = config.weight_decay,
                        "weight decay is ignored by sgd"
                    );
                }
                Self::Sgd(SGD::new(vars, lr)?)
            }
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.step(grads)?,
            Self::Sgd(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }
}

// ---------------------------------------------------------------------------
// Training Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub log_iteration: usize,
    pub snapshot_iteration: usize,
    pub stop_iteration: usize,
    pub lr: f64,
    #[serde(default)]
    pub weight_decay: f64,
    /// Max global gradient L2 norm; `None` disables clipping.
    #[serde(default)]
    pub gradient_clipping: Option<f64>,
    #[serde(default)]
    pub linear_shift: Option<LinearShift>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl TrainConfig {
    /// Small config for tests (fast).
    pub fn tiny() -> Self {
        Self {
            batch_size: 2,
            log_iteration: 5,
            snapshot_iteration: 10,
            stop_iteration: 10,
            lr: 1e-2,
            weight_decay: 0.0,
            gradient_clipping: Some(5.0),
            linear_shift: None,
            optimizer: OptimizerConfig::default(),
        }
    }

    fn initial_lr(&self) -> f64 {
        match &self.linear_shift {
            Some(shift) => shift.value_at(0),
            None => self.lr,
        }
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer<'m> {
    objective: TrainingObjective<'m>,
    optimizer: TrainOptimizer,
    config: TrainConfig,
    vars: Vec<Var>,
    iteration: usize,
    timer_start: Instant,
}

impl<'m> Trainer<'m> {
    pub fn new(model: &'m DeepLstm, varmap: &VarMap, config: TrainConfig) -> Result<Self> {
        let vars = varmap.all_vars();
        let optimizer = TrainOptimizer::new(&config, vars.clone())?;
        Ok(Self {
            objective: TrainingObjective::new(model),
            optimizer,
            config,
            vars,
            iteration: 0,
            timer_start: Instant::now(),
        })
    }

    /// One update: forward with dropout, backward, clip, optimizer step.
    /// Returns the batch loss. A NaN or infinite loss aborts training.
    pub fn step(&mut self, batch: &[SequenceRecord]) -> Result<f32> {
        let loss = self.objective.compute(batch, true)?;
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            bail!("loss is not finite at iteration {}: {value}", self.iteration);
        }

        let mut grads = loss.backward()?;
        if let Some(max_norm) = self.config.gradient_clipping {
            clip_grad_norm(&mut grads, &self.vars, max_norm)?;
        }
        self.optimizer.step(&grads)?;

        self.iteration += 1;
        if let Some(shift) = &self.config.linear_shift {
            self.optimizer.set_learning_rate(shift.value_at(self.iteration));
        }
        Ok(value)
    }

    pub fn objective(&self) -> &TrainingObjective<'m> {
        &self.objective
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn current_lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.timer_start.elapsed().as_secs_f64()
    }
}

/// Rescale all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = sq.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (g * scale)?);
            }
        }
    }
    Ok(norm)
}

/// Row-weighted mean loss over `records`, dropout off.
pub fn evaluate(
    objective: &TrainingObjective,
    records: &[SequenceRecord],
    batch_size: usize,
) -> Result<f32> {
    if records.is_empty() {
        return Err(ModelError::EmptyBatch.into());
    }
    let mut total = 0f64;
    let mut rows = 0usize;
    for chunk in records.chunks(batch_size.max(1)) {
        let n: usize = chunk.iter().map(SequenceRecord::len).sum();
        total += objective.compute(chunk, false)?.to_scalar::<f32>()? as f64 * n as f64;
        rows += n;
    }
    Ok((total / rows as f64) as f32)
}

// ---------------------------------------------------------------------------
// Training run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub iterations: usize,
    pub losses: Vec<f32>,
    pub snapshots: Vec<PathBuf>,
}

/// Train from the files named in `config`, writing `config.json` and
/// `main_{iteration}.safetensors` snapshots into `output`.
pub fn run_training(
    config: &Config,
    output: &Path,
    embedder: &dyn ContextEmbedder,
    device: &Device,
) -> Result<TrainSummary> {
    fs::create_dir_all(output)?;
    config.save_json(output.join("config.json"))?;

    let codec = CharCodec::new(&load_alphabet(&config.dataset.char_path)?)?;
    config.check_widths(codec.num_chars())?;
    if embedder.dim() != config.dataset.embedding_dim {
        return Err(ModelError::shape(format!(
            "embedder dim {} != embedding_dim {}",
            embedder.dim(),
            config.dataset.embedding_dim
        ))
        .into());
    }

    let texts = load_texts(&config.dataset.text_path)?;
    let split = SplitDataset::new(texts, config.dataset.seed, config.dataset.num_test);
    if split.train.is_empty() {
        bail!("no training texts left after holding out {} for test", split.test.len());
    }
    let train = make_records(&codec, embedder, &split.train, device)?;
    let test = make_records(&codec, embedder, &split.test, device)?;
    let train_eval = make_records(&codec, embedder, &split.train_eval, device)?;
    tracing::info!(
        train = train.len(),
        test = test.len(),
        num_chars = codec.num_chars(),
        "dataset ready"
    );

    let varmap = VarMap::new();
    let model = DeepLstm::new(config.network.clone(), &varmap, device)?;
    let tc = &config.train;
    let mut trainer = Trainer::new(&model, &varmap, tc.clone())?;
    let mut batches = Batches::new(train.len(), tc.batch_size, config.dataset.seed)?;

    let mut losses = Vec::with_capacity(tc.stop_iteration);
    let mut snapshots = Vec::new();
    while trainer.iteration() < tc.stop_iteration {
        let batch: Vec<SequenceRecord> = batches
            .next_indices()
            .into_iter()
            .map(|i| train[i].clone())
            .collect();
        let loss = trainer.step(&batch)?;
        losses.push(loss);
        let it = trainer.iteration();

        if tc.log_iteration > 0 && it % tc.log_iteration == 0 {
            let test_loss = if test.is_empty() {
                None
            } else {
                Some(evaluate(trainer.objective(), &test, tc.batch_size)?)
            };
            let train_loss = if train_eval.is_empty() {
                None
            } else {
                Some(evaluate(trainer.objective(), &train_eval, tc.batch_size)?)
            };
            tracing::info!(
                iteration = it,
                epoch = batches.epoch(),
                loss,
                ?train_loss,
                ?test_loss,
                lr = trainer.current_lr(),
                elapsed = trainer.elapsed_secs(),
                "train"
            );
        }
        if tc.snapshot_iteration > 0 && it % tc.snapshot_iteration == 0 {
            let path = checkpoint_path(output, it);
            save_checkpoint(&varmap, &path)?;
            snapshots.push(path);
        }
    }

    Ok(TrainSummary {
        iterations: trainer.iteration(),
        losses,
        snapshots,
    })
}

// ---------------------------------------------------------------------------
// Model Checkpointing (safetensors)
// ---------------------------------------------------------------------------

pub fn checkpoint_path(dir: &Path, iteration: usize) -> PathBuf {
    dir.join(format!("main_{iteration}.safetensors"))
}

/// Highest-numbered `main_*.safetensors` in `dir`.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let iteration = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("main_"))
            .and_then(|n| n.strip_suffix(".safetensors"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(it) = iteration {
            if best.as_ref().map_or(true, |(b, _)| it > *b) {
                best = Some((it, path));
            }
        }
    }
    Ok(best.map(|(_, p)| p))
}

pub fn save_checkpoint(varmap: &VarMap, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let data = varmap.data().lock().map_err(|_| anyhow!("varmap lock poisoned"))?;
    let named: HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&named, path)?;
    tracing::info!(params = named.len(), path = %path.display(), "saved checkpoint");
    Ok(())
}

/// Restore every variable of `varmap` from `path`. The file must hold exactly
/// the same names and shapes; nothing is modified unless all of them match.
pub fn load_checkpoint(varmap: &VarMap, path: impl AsRef<Path>, device: &Device) -> Result<()> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().map_err(|_| anyhow!("varmap lock poisoned"))?;

    for (name, var) in data.iter() {
        let saved = tensors.get(name).ok_or_else(|| {
            ModelError::shape(format!("{} has no tensor {name}", path.display()))
        })?;
        if saved.dims() != var.as_tensor().dims() {
            return Err(ModelError::shape(format!(
                "{name}: saved {:?}, model {:?}",
                saved.dims(),
                var.as_tensor().dims()
            ))
            .into());
        }
    }
    if let Some(extra) = tensors.keys().find(|k| !data.contains_key(*k)) {
        return Err(ModelError::shape(format!(
            "{} has unexpected tensor {extra}",
            path.display()
        ))
        .into());
    }

    for (name, var) in data.iter() {
        var.set(&tensors[name])?;
    }
    tracing::info!(params = data.len(), path = %path.display(), "loaded checkpoint");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
