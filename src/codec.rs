// CharCodec: alphabet <-> id mapping, one-hot rows, start/end sentinels.
//
// Ids 0..num_chars are real characters, `end_id == num_chars` is the end
// sentinel. The sentinel only ever appears as a target id; input rows are
// `num_chars` wide and the start row is all zeros.

use anyhow::Result;
use std::collections::HashMap;

use crate::error::ModelError;

#[derive(Clone, Debug)]
pub struct CharCodec {
    chars: Vec<char>,
    char2id: HashMap<char, u32>,
}

impl CharCodec {
    /// Build from an ordered alphabet. Order is part of the model: reordering
    /// the alphabet invalidates trained weights.
    pub fn new(chars: &[char]) -> Result<Self> {
        if chars.is_empty() {
            return Err(ModelError::EmptyAlphabet.into());
        }
        let mut char2id = HashMap::with_capacity(chars.len());
        for (i, &c) in chars.iter().enumerate() {
            if char2id.insert(c, i as u32).is_some() {
                return Err(ModelError::DuplicateCharacter(c).into());
            }
        }
        Ok(Self {
            chars: chars.to_vec(),
            char2id,
        })
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn num_chars(&self) -> usize {
        self.chars.len()
    }

    pub fn end_id(&self) -> u32 {
        self.chars.len() as u32
    }

    /// Vocabulary size including the end sentinel; the logit width.
    pub fn num_id(&self) -> usize {
        self.chars.len() + 1
    }

    pub fn to_id(&self, c: char) -> Result<u32> {
        self.char2id
            .get(&c)
            .copied()
            .ok_or_else(|| ModelError::UnknownCharacter(c).into())
    }

    pub fn to_char(&self, id: u32) -> Result<char> {
        self.chars
            .get(id as usize)
            .copied()
            .ok_or_else(|| self.invalid(id).into())
    }

    pub fn to_one_hot(&self, id: u32) -> Result<Vec<f32>> {
        if id as usize >= self.chars.len() {
            return Err(self.invalid(id).into());
        }
        let mut row = self.start_vector();
        row[id as usize] = 1.0;
        Ok(row)
    }

    pub fn start_vector(&self) -> Vec<f32> {
        vec![0.0; self.chars.len()]
    }

    pub fn append_end(&self, ids: &[u32]) -> Vec<u32> {
        let mut out = Vec::with_capacity(ids.len() + 1);
        out.extend_from_slice(ids);
        out.push(self.end_id());
        out
    }

    pub fn prepend_start(&self, rows: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(rows.len() + 1);
        out.push(self.start_vector());
        out.extend(rows.iter().cloned());
        out
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars().map(|c| self.to_id(c)).collect()
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        ids.iter().map(|&id| self.to_char(id)).collect()
    }

    /// Teacher-forced `(input rows, target ids)` for one text: the start row
    /// followed by the one-hot history, and the ids followed by `end_id`.
    /// Both have `len(text) + 1` entries.
    pub fn teacher_forcing(&self, text: &str) -> Result<(Vec<Vec<f32>>, Vec<u32>)> {
        let ids = self.encode(text)?;
        let history = ids
            .iter()
            .map(|&id| self.to_one_hot(id))
            .collect::<Result<Vec<_>>>()?;
        Ok((self.prepend_start(&history), self.append_end(&ids)))
    }

    fn invalid(&self, id: u32) -> ModelError {
        ModelError::InvalidId {
            id,
            num_chars: self.chars.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
