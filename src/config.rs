// Run configuration, stored as JSON next to the checkpoints it produced.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::network::NetworkConfig;
use crate::training::TrainConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub char_path: String,
    pub text_path: String,
    pub seed: u64,
    pub num_test: usize,
    /// Width of the context vector produced by the embedder.
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub network: NetworkConfig,
    pub train: TrainConfig,
}

impl Config {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// The network's input/output widths must agree with the alphabet and
    /// the embedder.
    pub fn check_widths(&self, num_chars: usize) -> Result<()> {
        let net = &self.network;
        let want_in = num_chars + self.dataset.embedding_dim;
        if net.in_size != want_in || net.out_size != num_chars + 1 {
            return Err(crate::error::ModelError::shape(format!(
                "network in/out {}/{} but alphabet of {num_chars} and embedding_dim {} \
                 need {want_in}/{}",
                net.in_size,
                net.out_size,
                self.dataset.embedding_dim,
                num_chars + 1
            ))
            .into());
        }
        Ok(())
    }
}
