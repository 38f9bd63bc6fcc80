// Corpus files, alphabet selection, splits and batch iteration.
//
// File formats:
//   texts     newline-delimited JSON, one {"str": "..."} per line
//   alphabet  JSON array of one-character strings, in id order

use anyhow::{bail, Context, Result};
use candle_core::Device;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::codec::CharCodec;
use crate::embed::ContextEmbedder;
use crate::objective::SequenceRecord;

// ---------------------------------------------------------------------------
// Alphabet selection
// ---------------------------------------------------------------------------

/// The `num_chars` most frequent characters, most frequent first. Ties keep
/// first-occurrence order.
pub fn select_alphabet(texts: &[String], num_chars: usize) -> Vec<char> {
    let mut counts: HashMap<char, (usize, usize)> = HashMap::new();
    let mut seen = 0usize;
    for c in texts.iter().flat_map(|t| t.chars()) {
        let entry = counts.entry(c).or_insert_with(|| {
            seen += 1;
            (0, seen)
        });
        entry.0 += 1;
    }
    let mut ranked: Vec<(char, usize, usize)> =
        counts.into_iter().map(|(c, (n, first))| (c, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(num_chars).map(|(c, _, _)| c).collect()
}

pub fn contains_unknown(text: &str, alphabet: &HashSet<char>) -> bool {
    text.chars().any(|c| !alphabet.contains(&c))
}

#[derive(Debug, Clone)]
pub struct PreparedCorpus {
    pub texts: Vec<String>,
    pub chars: Vec<char>,
}

/// Split `raw` on whitespace, drop texts containing any eliminated word, pick
/// the alphabet, then drop texts that need characters outside it.
pub fn make_dataset(raw: &str, num_chars: usize, eliminate_words: &[String]) -> PreparedCorpus {
    let texts: Vec<String> = raw
        .split_whitespace()
        .filter(|s| eliminate_words.iter().all(|w| !s.contains(w.as_str())))
        .map(str::to_string)
        .collect();
    let chars = select_alphabet(&texts, num_chars);
    let alphabet: HashSet<char> = chars.iter().copied().collect();
    let texts = texts
        .into_iter()
        .filter(|t| !contains_unknown(t, &alphabet))
        .collect();
    PreparedCorpus { texts, chars }
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct TextEntry {
    #[serde(rename = "str")]
    text: String,
}

pub fn load_texts(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut texts = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: TextEntry = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: bad text entry", path.display(), n + 1))?;
        texts.push(entry.text);
    }
    Ok(texts)
}

pub fn save_texts(path: impl AsRef<Path>, texts: &[String]) -> Result<()> {
    let path = path.as_ref();
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for text in texts {
        serde_json::to_writer(&mut w, &TextEntry { text: text.clone() })?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

pub fn load_alphabet(path: impl AsRef<Path>) -> Result<Vec<char>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let entries: Vec<String> = serde_json::from_str(&raw)
        .with_context(|| format!("{}: expected a JSON array of strings", path.display()))?;
    entries
        .iter()
        .map(|s| {
            let mut it = s.chars();
            match (it.next(), it.next()) {
                (Some(c), None) => Ok(c),
                _ => bail!("{}: alphabet entry {s:?} is not a single character", path.display()),
            }
        })
        .collect()
}

pub fn save_alphabet(path: impl AsRef<Path>, chars: &[char]) -> Result<()> {
    let path = path.as_ref();
    let entries: Vec<String> = chars.iter().map(|c| c.to_string()).collect();
    fs::write(path, serde_json::to_string(&entries)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Splits and records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SplitDataset {
    pub train: Vec<String>,
    pub test: Vec<String>,
    /// First `num_test` training texts, for comparing train and test loss.
    pub train_eval: Vec<String>,
}

impl SplitDataset {
    /// Seeded shuffle, then the first `num_test` texts are held out.
    pub fn new(mut texts: Vec<String>, seed: u64, num_test: usize) -> Self {
        texts.shuffle(&mut StdRng::seed_from_u64(seed));
        let num_test = num_test.min(texts.len());
        let train = texts.split_off(num_test);
        let train_eval = train[..num_test.min(train.len())].to_vec();
        Self {
            train,
            test: texts,
            train_eval,
        }
    }
}

pub fn make_record(
    codec: &CharCodec,
    embedder: &dyn ContextEmbedder,
    text: &str,
    device: &Device,
) -> Result<SequenceRecord> {
    let context = embedder.embed(text)?;
    SequenceRecord::from_text(codec, text, context, device)
}

pub fn make_records(
    codec: &CharCodec,
    embedder: &dyn ContextEmbedder,
    texts: &[String],
    device: &Device,
) -> Result<Vec<SequenceRecord>> {
    texts
        .iter()
        .map(|t| make_record(codec, embedder, t, device))
        .collect()
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Endless shuffled batches of indices into a dataset of `len` items. A batch
/// that crosses an epoch boundary is completed from the next shuffle.
pub struct Batches {
    len: usize,
    batch_size: usize,
    order: Vec<usize>,
    pos: usize,
    epoch: usize,
    rng: StdRng,
}

impl Batches {
    pub fn new(len: usize, batch_size: usize, seed: u64) -> Result<Self> {
        if len == 0 {
            bail!("cannot batch an empty dataset");
        }
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            len,
            batch_size,
            order,
            pos: 0,
            epoch: 0,
            rng,
        })
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn next_indices(&mut self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.batch_size);
        while out.len() < self.batch_size {
            if self.pos == self.len {
                self.order.shuffle(&mut self.rng);
                self.pos = 0;
                self.epoch += 1;
            }
            let take = (self.batch_size - out.len()).min(self.len - self.pos);
            out.extend_from_slice(&self.order[self.pos..self.pos + take]);
            self.pos += take;
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
