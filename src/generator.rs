// Autoregressive decoding: context vector -> text.
//
// A DecodeSession owns its recurrent state and input row; the model and codec
// are only borrowed, so any number of sessions can run against one model.
//
//   INIT      state = None, input = start ++ context, text = "", steps = 0
//   STEPPING  forward_one -> sample -> end_id ? DONE : push char, feed one-hot
//   DONE      end sentinel drawn, or `max_length` characters emitted

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

use crate::codec::CharCodec;
use crate::embed::ContextEmbedder;
use crate::error::ModelError;
use crate::network::{DeepLstm, NetworkConfig, RecurrentState};

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

pub enum SamplingPolicy {
    /// argmax, lowest index on ties.
    Greedy,
    /// One categorical draw per row from softmax(logits). The generator is
    /// owned by the caller; nothing here seeds it.
    Stochastic(StdRng),
}

impl SamplingPolicy {
    pub fn seeded(seed: u64) -> Self {
        Self::Stochastic(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::Stochastic(StdRng::from_entropy())
    }

    /// logits: (batch, num_id) -> one id per row.
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        match self {
            Self::Greedy => Ok(logits.to_vec2::<f32>()?.iter().map(|r| argmax(r)).collect()),
            Self::Stochastic(rng) => {
                let probs = candle_nn::ops::softmax_last_dim(logits)?.to_vec2::<f32>()?;
                probs
                    .iter()
                    .map(|p| -> Result<u32> {
                        Ok(WeightedIndex::new(p)?.sample(&mut *rng) as u32)
                    })
                    .collect()
            }
        }
    }
}

fn argmax(row: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best as u32
}

// ---------------------------------------------------------------------------
// Decode session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndSentinel,
    MaxLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub stop: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stepping,
    Done(StopReason),
}

pub struct DecodeSession<'a> {
    model: &'a DeepLstm,
    codec: &'a CharCodec,
    context: Vec<f32>,
    state: Option<RecurrentState>,
    input: Tensor,
    text: String,
    steps: usize,
    max_length: usize,
    phase: Phase,
}

impl<'a> DecodeSession<'a> {
    /// Advance one character. Returns the emitted character, or `None` once the
    /// session is done.
    pub fn step(&mut self, policy: &mut SamplingPolicy) -> Result<Option<char>> {
        if self.phase != Phase::Stepping {
            return Ok(None);
        }
        if self.steps >= self.max_length {
            self.phase = Phase::Done(StopReason::MaxLength);
            return Ok(None);
        }

        let (state, logits) = self.model.forward_one(&self.input, self.state.as_ref())?;
        self.state = Some(state);

        let char_id = policy.sample(&logits)?[0];
        if char_id == self.codec.end_id() {
            self.phase = Phase::Done(StopReason::EndSentinel);
            return Ok(None);
        }

        let c = self.codec.to_char(char_id)?;
        self.text.push(c);
        let one_hot = self.codec.to_one_hot(char_id)?;
        self.input = input_row(one_hot, &self.context, self.model.device())?;
        self.steps += 1;
        Ok(Some(c))
    }

    pub fn run(mut self, policy: &mut SamplingPolicy) -> Result<Decoded> {
        while self.step(policy)?.is_some() {}
        let stop = match self.phase {
            Phase::Done(reason) => reason,
            Phase::Stepping => StopReason::MaxLength,
        };
        Ok(Decoded {
            text: self.text,
            stop,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.phase {
            Phase::Done(reason) => Some(reason),
            Phase::Stepping => None,
        }
    }
}

fn input_row(mut row: Vec<f32>, context: &[f32], device: &Device) -> Result<Tensor> {
    row.extend_from_slice(context);
    let width = row.len();
    Ok(Tensor::from_vec(row, (1, width), device)?)
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct Generator<'a> {
    model: &'a DeepLstm,
    codec: &'a CharCodec,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a DeepLstm, codec: &'a CharCodec) -> Result<Self> {
        let cfg = &model.config;
        if cfg.out_size != codec.num_id() {
            return Err(ModelError::shape(format!(
                "model out_size {} != num_id {}",
                cfg.out_size,
                codec.num_id()
            ))
            .into());
        }
        if cfg.in_size < codec.num_chars() {
            return Err(ModelError::shape(format!(
                "model in_size {} < num_chars {}",
                cfg.in_size,
                codec.num_chars()
            ))
            .into());
        }
        Ok(Self { model, codec })
    }

    pub fn context_dim(&self) -> usize {
        self.model.config.in_size - self.codec.num_chars()
    }

    pub fn session(&self, context: &[f32], max_length: usize) -> Result<DecodeSession<'a>> {
        if context.len() != self.context_dim() {
            return Err(ModelError::shape(format!(
                "context has {} values, model expects {}",
                context.len(),
                self.context_dim()
            ))
            .into());
        }
        let input = input_row(self.codec.start_vector(), context, self.model.device())?;
        Ok(DecodeSession {
            model: self.model,
            codec: self.codec,
            context: context.to_vec(),
            state: None,
            input,
            text: String::new(),
            steps: 0,
            max_length,
            phase: Phase::Stepping,
        })
    }

    pub fn decode(
        &self,
        context: &[f32],
        max_length: usize,
        policy: &mut SamplingPolicy,
    ) -> Result<Decoded> {
        self.session(context, max_length)?.run(policy)
    }

    pub fn generate(
        &self,
        context: &[f32],
        max_length: usize,
        policy: &mut SamplingPolicy,
    ) -> Result<String> {
        Ok(self.decode(context, max_length, policy)?.text)
    }
}

// ---------------------------------------------------------------------------
// Bot: loaded model + codec + embedder behind one call
// ---------------------------------------------------------------------------

pub struct Bot {
    model: DeepLstm,
    codec: CharCodec,
    embedder: Box<dyn ContextEmbedder>,
    max_length: usize,
    policy: SamplingPolicy,
}

impl Bot {
    pub fn new(
        model: DeepLstm,
        codec: CharCodec,
        embedder: Box<dyn ContextEmbedder>,
        max_length: usize,
        policy: SamplingPolicy,
    ) -> Result<Self> {
        Generator::new(&model, &codec)?;
        if embedder.dim() != model.config.in_size - codec.num_chars() {
            return Err(ModelError::shape(format!(
                "embedder dim {} does not match model context width {}",
                embedder.dim(),
                model.config.in_size - codec.num_chars()
            ))
            .into());
        }
        Ok(Self {
            model,
            codec,
            embedder,
            max_length,
            policy,
        })
    }

    /// Restore weights from `weights` into a model built from `config`.
    pub fn load(
        config: NetworkConfig,
        weights: impl AsRef<Path>,
        codec: CharCodec,
        embedder: Box<dyn ContextEmbedder>,
        max_length: usize,
        policy: SamplingPolicy,
        device: &Device,
    ) -> Result<Self> {
        let (model, _varmap) = DeepLstm::load(config, weights.as_ref(), device)?;
        tracing::info!(path = %weights.as_ref().display(), "loaded generator");
        Self::new(model, codec, embedder, max_length, policy)
    }

    pub fn text_to_vec(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder.embed(text)
    }

    pub fn generate(&mut self, context: &[f32]) -> Result<String> {
        Generator::new(&self.model, &self.codec)?.generate(
            context,
            self.max_length,
            &mut self.policy,
        )
    }

    pub fn reply(&mut self, text: &str) -> Result<String> {
        let context = self.text_to_vec(text)?;
        self.generate(&context)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;
    use candle_nn::VarMap;

    const CTX: usize = 4;

    fn setup() -> Result<(DeepLstm, VarMap, CharCodec)> {
        let codec = CharCodec::new(&['a', 'b', 'c'])?;
        let varmap = VarMap::new();
        let model = DeepLstm::new(NetworkConfig::tiny(3, CTX), &varmap, &Device::Cpu)?;
        Ok((model, varmap, codec))
    }

    /// Zero the projection weight and set its bias so argmax is fixed.
    fn rig_output(varmap: &VarMap, bias: &[f32]) -> Result<()> {
        let data = varmap.data().lock().unwrap();
        let w = data.get("post_linear.weight").expect("projection weight");
        w.set(&w.as_tensor().zeros_like()?)?;
        let b = data.get("post_linear.bias").expect("projection bias");
        b.set(&Tensor::from_slice(bias, bias.len(), &Device::Cpu)?)?;
        Ok(())
    }

    #[test]
    fn test_greedy_tie_breaks_low() -> Result<()> {
        let logits = Tensor::new(&[[1f32, 3., 3., 0.], [5., 5., 5., 5.]], &Device::Cpu)?;
        assert_eq!(SamplingPolicy::Greedy.sample(&logits)?, vec![1, 0]);
        Ok(())
    }

    #[test]
    fn test_stochastic_follows_distribution() -> Result<()> {
        let logits = Tensor::new(&[[0f32, 200., 0., 0.], [0., 0., 0., 200.]], &Device::Cpu)?;
        let mut policy = SamplingPolicy::seeded(7);
        for _ in 0..20 {
            assert_eq!(policy.sample(&logits)?, vec![1, 3]);
        }
        Ok(())
    }

    #[test]
    fn test_stochastic_matches_softmax_frequencies() -> Result<()> {
        // softmax([0, ln 3, 0, 0]) = [1/6, 1/2, 1/6, 1/6]
        let row = [0f32, 3f32.ln(), 0., 0.];
        let logits = Tensor::from_slice(&row, (1, 4), &Device::Cpu)?.repeat((1000, 1))?;
        let mut policy = SamplingPolicy::seeded(11);
        let mut counts = [0usize; 4];
        for _ in 0..60 {
            for id in policy.sample(&logits)? {
                counts[id as usize] += 1;
            }
        }
        let total = counts.iter().sum::<usize>() as f64;
        assert_eq!(total, 60_000.0);
        for (id, expected) in [1.0 / 6.0, 0.5, 1.0 / 6.0, 1.0 / 6.0].into_iter().enumerate() {
            let freq = counts[id] as f64 / total;
            assert!(
                (freq - expected).abs() < 0.01,
                "id {id}: frequency {freq:.4}, expected {expected:.4} ({counts:?})"
            );
        }
        Ok(())
    }

    /// One-layer model whose hidden state is (roughly) the one-hot of the last
    /// input character, with the projection mapping 'a' -> 'b' -> 'c' -> end
    /// and the start row -> 'a'.
    fn chain_model() -> Result<(DeepLstm, CharCodec)> {
        let codec = CharCodec::new(&['a', 'b', 'c'])?;
        let config = NetworkConfig {
            n_layers: 1,
            ..NetworkConfig::tiny(3, CTX)
        };
        let (hidden, in_size) = (config.hidden_size, config.in_size);
        let varmap = VarMap::new();
        let model = DeepLstm::new(config, &varmap, &Device::Cpu)?;

        // gate blocks are [input, forget, cell, output], `hidden` rows each
        let mut w_ih = vec![0f32; 4 * hidden * in_size];
        for j in 0..3 {
            w_ih[(2 * hidden + j) * in_size + j] = 10.0;
        }
        let mut b_ih = vec![0f32; 4 * hidden];
        for k in 0..hidden {
            b_ih[k] = 10.0;
            b_ih[hidden + k] = -10.0;
            b_ih[3 * hidden + k] = 10.0;
        }
        let mut w_out = vec![0f32; 4 * hidden];
        for (from, to) in [(0, 1), (1, 2), (2, 3)] {
            w_out[to * hidden + from] = 10.0;
        }

        let data = varmap.data().lock().unwrap();
        let set = |name: &str, values: &[f32]| -> Result<()> {
            let var = data.get(name).expect(name);
            let t = Tensor::from_slice(values, var.as_tensor().dims(), &Device::Cpu)?;
            var.set(&t)?;
            Ok(())
        };
        set("lstm.weight_ih_l0", &w_ih)?;
        set("lstm.weight_hh_l0", &vec![0f32; 4 * hidden * hidden])?;
        set("lstm.bias_ih_l0", &b_ih)?;
        set("lstm.bias_hh_l0", &vec![0f32; 4 * hidden])?;
        set("post_linear.weight", &w_out)?;
        set("post_linear.bias", &[1., 0., 0., 0.])?;
        drop(data);
        Ok((model, codec))
    }

    #[test]
    fn test_stops_on_end_sentinel_mid_sequence() -> Result<()> {
        let (model, codec) = chain_model()?;
        let generator = Generator::new(&model, &codec)?;
        let out = generator.decode(&[0.0; CTX], 10, &mut SamplingPolicy::Greedy)?;
        assert_eq!(out.text, "abc");
        assert_eq!(out.stop, StopReason::EndSentinel);

        // a tighter bound cuts the same chain short
        let cut = generator.decode(&[0.0; CTX], 2, &mut SamplingPolicy::Greedy)?;
        assert_eq!(cut.text, "ab");
        assert_eq!(cut.stop, StopReason::MaxLength);
        Ok(())
    }

    #[test]
    fn test_stops_on_end_sentinel() -> Result<()> {
        let (model, varmap, codec) = setup()?;
        rig_output(&varmap, &[0., 0., 0., 100.])?;
        let generator = Generator::new(&model, &codec)?;
        let out = generator.decode(&[0.0; CTX], 10, &mut SamplingPolicy::Greedy)?;
        assert_eq!(out.text, "");
        assert_eq!(out.stop, StopReason::EndSentinel);
        Ok(())
    }

    #[test]
    fn test_stops_at_max_length() -> Result<()> {
        let (model, varmap, codec) = setup()?;
        rig_output(&varmap, &[100., 0., 0., 0.])?;
        let generator = Generator::new(&model, &codec)?;
        let out = generator.decode(&[0.0; CTX], 10, &mut SamplingPolicy::Greedy)?;
        assert_eq!(out.text, "aaaaaaaaaa");
        assert_eq!(out.stop, StopReason::MaxLength);

        let none = generator.decode(&[0.0; CTX], 0, &mut SamplingPolicy::Greedy)?;
        assert_eq!(none.text, "");
        assert_eq!(none.stop, StopReason::MaxLength);
        Ok(())
    }

    #[test]
    fn test_untrained_greedy_bounded() -> Result<()> {
        let (model, _varmap, codec) = setup()?;
        let generator = Generator::new(&model, &codec)?;
        let text = generator.generate(&[0.3, -0.1, 0.2, 0.9], 10, &mut SamplingPolicy::Greedy)?;
        assert!(text.chars().count() <= 10);
        assert!(text.chars().all(|c| codec.to_id(c).is_ok()));
        Ok(())
    }

    #[test]
    fn test_seeded_stochastic_reproducible() -> Result<()> {
        let (model, _varmap, codec) = setup()?;
        let generator = Generator::new(&model, &codec)?;
        let ctx = [0.5, 0.5, -0.5, 0.0];
        let a = generator.decode(&ctx, 16, &mut SamplingPolicy::seeded(42))?;
        let b = generator.decode(&ctx, 16, &mut SamplingPolicy::seeded(42))?;
        assert_eq!(a, b);
        assert!(a.text.chars().count() <= 16);
        Ok(())
    }

    #[test]
    fn test_sessions_are_independent() -> Result<()> {
        let (model, _varmap, codec) = setup()?;
        let generator = Generator::new(&model, &codec)?;
        let ctx_a = [1.0, 0.0, 0.0, 0.0];
        let ctx_b = [0.0, 0.0, -1.0, 1.0];

        let solo_a = generator.generate(&ctx_a, 8, &mut SamplingPolicy::Greedy)?;
        let solo_b = generator.generate(&ctx_b, 8, &mut SamplingPolicy::Greedy)?;

        let mut sa = generator.session(&ctx_a, 8)?;
        let mut sb = generator.session(&ctx_b, 8)?;
        let mut policy = SamplingPolicy::Greedy;
        loop {
            let a = sa.step(&mut policy)?;
            let b = sb.step(&mut policy)?;
            if a.is_none() && b.is_none() {
                break;
            }
        }
        assert_eq!(sa.text(), solo_a);
        assert_eq!(sb.text(), solo_b);
        assert!(sa.stop_reason().is_some());
        Ok(())
    }

    #[test]
    fn test_context_width_checked() -> Result<()> {
        let (model, _varmap, codec) = setup()?;
        let generator = Generator::new(&model, &codec)?;
        let err = generator.generate(&[0.0; CTX + 1], 5, &mut SamplingPolicy::Greedy).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_codec_model_mismatch() -> Result<()> {
        let (model, _varmap, _) = setup()?;
        let other = CharCodec::new(&['a', 'b'])?;
        assert!(Generator::new(&model, &other).is_err());
        Ok(())
    }

    #[test]
    fn test_bot_reply() -> Result<()> {
        let (model, varmap, codec) = setup()?;
        rig_output(&varmap, &[0., 0., 100., 0.])?;
        let mut bot = Bot::new(
            model,
            codec,
            Box::new(HashingEmbedder::new(CTX)),
            5,
            SamplingPolicy::Greedy,
        )?;
        assert_eq!(bot.text_to_vec("hello")?.len(), CTX);
        assert_eq!(bot.reply("hello")?, "ccccc");
        Ok(())
    }

    #[test]
    fn test_bot_rejects_wrong_embedder() -> Result<()> {
        let (model, _varmap, codec) = setup()?;
        let bot = Bot::new(
            model,
            codec,
            Box::new(HashingEmbedder::new(CTX + 2)),
            5,
            SamplingPolicy::Greedy,
        );
        assert!(bot.is_err());
        Ok(())
    }
}
