// Text -> fixed-width context vector.
//
// The network only sees the vector; any embedder with a stable `dim()` can be
// plugged in. HashingEmbedder is a dependency-free stand-in: character unigrams
// and bigrams hashed into `dim` buckets, L2-normalized.

use anyhow::Result;

pub trait ContextEmbedder {
    fn dim(&self) -> usize;

    /// Must return exactly `dim()` values and be deterministic for a given text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(chars: &[char]) -> u64 {
    let mut h = FNV_OFFSET;
    for c in chars {
        let mut buf = [0u8; 4];
        for b in c.encode_utf8(&mut buf).bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        // separator so "ab" and "a","b" hash apart
        h ^= 0xff;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl ContextEmbedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];
        if self.dim == 0 {
            return Ok(v);
        }
        let chars: Vec<char> = text.chars().collect();
        for n in 1..=2 {
            for gram in chars.windows(n) {
                let h = fnv1a(gram);
                let bucket = (h % self.dim as u64) as usize;
                // top bit picks the sign so collisions partly cancel
                let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
                v[bucket] += sign;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}
