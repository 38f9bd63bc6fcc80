// Sequence records and the teacher-forced cross-entropy objective.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::codec::CharCodec;
use crate::error::ModelError;
use crate::network::DeepLstm;

/// One training example. `input_array` and `target_ids` always have the same
/// number of rows (`len(text) + 1`).
#[derive(Debug, Clone)]
pub struct SequenceRecord {
    /// `(len + 1, num_chars)`: start row, then the one-hot history.
    pub input_array: Tensor,
    /// Character ids followed by `end_id`.
    pub target_ids: Vec<u32>,
    pub context: Vec<f32>,
}

impl SequenceRecord {
    pub fn from_text(
        codec: &CharCodec,
        text: &str,
        context: Vec<f32>,
        device: &Device,
    ) -> Result<Self> {
        let (rows, target_ids) = codec.teacher_forcing(text)?;
        let input_array = rows_to_tensor(&rows, codec.num_chars(), device)?;
        Ok(Self {
            input_array,
            target_ids,
            context,
        })
    }

    pub fn len(&self) -> usize {
        self.target_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target_ids.is_empty()
    }

    /// `input_array` with the context repeated on every row:
    /// `(len + 1, num_chars + context_dim)`.
    pub fn model_input(&self) -> Result<Tensor> {
        let rows = self.input_array.dim(0)?;
        if rows != self.target_ids.len() {
            return Err(ModelError::shape(format!(
                "input has {rows} rows but {} targets",
                self.target_ids.len()
            ))
            .into());
        }
        with_context(&self.input_array, &self.context)
    }
}

/// Concatenate `context` onto every row of `rows: (n, w)`.
pub fn with_context(rows: &Tensor, context: &[f32]) -> Result<Tensor> {
    if context.is_empty() {
        return Ok(rows.clone());
    }
    let n = rows.dim(0)?;
    let ctx = Tensor::from_slice(context, (1, context.len()), rows.device())?.repeat((n, 1))?;
    Ok(Tensor::cat(&[rows, &ctx], 1)?)
}

pub fn rows_to_tensor(rows: &[Vec<f32>], width: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(rows.len() * width);
    for row in rows {
        if row.len() != width {
            return Err(ModelError::shape(format!("row width {} != {width}", row.len())).into());
        }
        data.extend_from_slice(row);
    }
    Ok(Tensor::from_vec(data, (rows.len(), width), device)?)
}

/// Mean `-log softmax(logits)[target]` over rows. logits: (n, vocab), targets: n ids.
pub fn softmax_cross_entropy(logits: &Tensor, targets: &[u32]) -> Result<Tensor> {
    let (n, _vocab) = logits.dims2()?;
    if n != targets.len() {
        return Err(ModelError::shape(format!(
            "{n} logit rows but {} targets",
            targets.len()
        ))
        .into());
    }
    let targets = Tensor::from_slice(targets, n, logits.device())?;
    Ok(candle_nn::loss::cross_entropy(logits, &targets)?)
}

pub struct TrainingObjective<'m> {
    model: &'m DeepLstm,
}

impl<'m> TrainingObjective<'m> {
    pub fn new(model: &'m DeepLstm) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &DeepLstm {
        self.model
    }

    /// Logits for every record: `(len_i + 1, num_id)` each, in batch order.
    pub fn logits(&self, batch: &[SequenceRecord], train: bool) -> Result<Vec<Tensor>> {
        if batch.is_empty() {
            return Err(ModelError::EmptyBatch.into());
        }
        let inputs = batch
            .iter()
            .map(SequenceRecord::model_input)
            .collect::<Result<Vec<_>>>()?;
        self.model.forward(&inputs, train)
    }

    /// Mean cross-entropy over the concatenation of every record's rows. The
    /// returned scalar stays attached to the graph for `backward()`.
    pub fn compute(&self, batch: &[SequenceRecord], train: bool) -> Result<Tensor> {
        let logits = self.logits(batch, train)?;
        let logits = Tensor::cat(&logits, 0)?;
        let targets: Vec<u32> = batch
            .iter()
            .flat_map(|r| r.target_ids.iter().copied())
            .collect();
        let loss = softmax_cross_entropy(&logits, &targets)?;
        tracing::debug!(
            loss = loss.to_scalar::<f32>()?,
            records = batch.len(),
            rows = targets.len(),
            "objective"
        );
        Ok(loss)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;
    use candle_nn::VarMap;

    fn abc() -> CharCodec {
        CharCodec::new(&['a', 'b', 'c']).unwrap()
    }

    #[test]
    fn test_record_from_text() -> Result<()> {
        let codec = abc();
        let rec = SequenceRecord::from_text(&codec, "ab", vec![0.5, -0.5], &Device::Cpu)?;
        assert_eq!(rec.input_array.dims2()?, (3, 3));
        assert_eq!(rec.target_ids, vec![0, 1, 3]);
        assert_eq!(
            rec.input_array.to_vec2::<f32>()?,
            vec![vec![0., 0., 0.], vec![1., 0., 0.], vec![0., 1., 0.]]
        );
        assert_eq!(rec.len(), 3);

        let input = rec.model_input()?;
        assert_eq!(input.dims2()?, (3, 5));
        for row in input.to_vec2::<f32>()? {
            assert_eq!(&row[3..], &[0.5, -0.5]);
        }
        Ok(())
    }

    #[test]
    fn test_loss_confident_and_wrong() -> Result<()> {
        let device = Device::Cpu;
        let good = Tensor::new(&[[100f32, 0., 0., 0.]], &device)?;
        let bad = Tensor::new(&[[0f32, 0., 0., 100.]], &device)?;
        let low = softmax_cross_entropy(&good, &[0])?.to_scalar::<f32>()?;
        let high = softmax_cross_entropy(&bad, &[0])?.to_scalar::<f32>()?;
        assert!(low < 1e-4, "loss should be near zero, got {low}");
        assert!(high > 50.0, "loss should be large, got {high}");
        Ok(())
    }

    #[test]
    fn test_loss_uniform_logits() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &device)?;
        let loss = softmax_cross_entropy(&logits, &[1, 3])?.to_scalar::<f32>()?;
        assert!((loss - 4f32.ln()).abs() < 1e-5);
        assert!(softmax_cross_entropy(&logits, &[1]).is_err());
        Ok(())
    }

    #[test]
    fn test_compute_matches_manual_concat() -> Result<()> {
        let device = Device::Cpu;
        let codec = abc();
        let varmap = VarMap::new();
        let model = DeepLstm::new(NetworkConfig::tiny(3, 2), &varmap, &device)?;
        let objective = TrainingObjective::new(&model);

        let batch = vec![
            SequenceRecord::from_text(&codec, "abc", vec![0.1, 0.2], &device)?,
            SequenceRecord::from_text(&codec, "", vec![0.3, 0.4], &device)?,
            SequenceRecord::from_text(&codec, "ca", vec![-1.0, 1.0], &device)?,
        ];
        let logits = objective.logits(&batch, false)?;
        assert_eq!(logits[0].dims2()?, (4, 4));
        assert_eq!(logits[1].dims2()?, (1, 4));
        assert_eq!(logits[2].dims2()?, (3, 4));

        // Row-weighted mean of per-record losses equals the batch loss.
        let mut weighted = 0f32;
        for (rec, l) in batch.iter().zip(logits.iter()) {
            let per = softmax_cross_entropy(l, &rec.target_ids)?.to_scalar::<f32>()?;
            weighted += per * rec.len() as f32;
        }
        weighted /= 8.0;
        let loss = objective.compute(&batch, false)?.to_scalar::<f32>()?;
        assert!((loss - weighted).abs() < 1e-5, "{loss} vs {weighted}");
        Ok(())
    }

    #[test]
    fn test_empty_batch() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = DeepLstm::new(NetworkConfig::tiny(3, 2), &varmap, &device)?;
        let err = TrainingObjective::new(&model).compute(&[], false).unwrap_err();
        assert_eq!(err.downcast_ref::<ModelError>(), Some(&ModelError::EmptyBatch));
        Ok(())
    }

    #[test]
    fn test_context_width_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let codec = abc();
        let varmap = VarMap::new();
        let model = DeepLstm::new(NetworkConfig::tiny(3, 2), &varmap, &device)?;
        let rec = SequenceRecord::from_text(&codec, "ab", vec![0.0; 5], &device)?;
        let err = TrainingObjective::new(&model).compute(&[rec], false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::ShapeMismatch(_))
        ));
        Ok(())
    }
}
