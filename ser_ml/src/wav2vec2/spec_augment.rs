use burn::prelude::{Backend, Tensor, TensorData};
use burn::tensor::Distribution;

/// Random spans of a fixed length masked along one axis of the hidden states.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpanMasking {
    pub prob: f64,
    pub length: usize,
    pub min_masks: usize,
}

impl SpanMasking {
    /// Number of spans to mask in a sequence of `len` positions.
    ///
    /// `epsilon` is a uniform draw in `[0, 1)` which rounds the expected count up or down.
    pub fn span_count(&self, len: usize, epsilon: f64) -> usize {
        if self.length == 0 || self.length > len {
            return 0;
        }

        let count = ((self.prob * len as f64 / self.length as f64 + epsilon) as usize).max(self.min_masks);
        let count = if count * self.length > len { len / self.length } else { count };

        count.min(len - self.length + 1)
    }

    /// Build a row-major `[rows, len]` mask from one score per candidate span start.
    ///
    /// Each row masks the spans whose starts have the highest scores, which picks starts uniformly
    /// without replacement when the scores are uniform draws. Spans may overlap.
    pub fn mask_from_scores(&self, rows: usize, len: usize, epsilon: f64, scores: &[f32]) -> Vec<bool> {
        let mut mask = vec![false; rows * len];
        let count = self.span_count(len, epsilon);
        if count == 0 {
            return mask;
        }

        let candidates = len - self.length + 1;
        for (row, row_scores) in scores.chunks_exact(candidates).take(rows).enumerate() {
            let mut starts = (0..candidates).collect::<Vec<_>>();
            starts.sort_by(|a, b| row_scores[*b].total_cmp(&row_scores[*a]));

            for start in starts.into_iter().take(count) {
                let offset = row * len + start;
                mask[offset..offset + self.length].fill(true);
            }
        }

        mask
    }

    /// Sample a `[rows, len]` mask with `1.0` at masked positions, drawing from the backend RNG.
    ///
    /// Returns `None` when nothing would be masked.
    pub fn sample<B: Backend>(&self, rows: usize, len: usize, device: &B::Device) -> Option<Tensor<B, 2>> {
        if self.prob <= 0.0 || self.length == 0 || self.length > len || rows == 0 {
            return None;
        }

        let candidates = len - self.length + 1;
        let draws = Tensor::<B, 1>::random([1 + rows * candidates], Distribution::Default, device)
            .into_data()
            .iter::<f32>()
            .collect::<Vec<_>>();
        let (epsilon, scores) = draws.split_first()?;

        let mask = self.mask_from_scores(rows, len, *epsilon as f64, scores);
        if !mask.contains(&true) {
            return None;
        }

        let values = mask.into_iter().map(|masked| if masked { 1.0f32 } else { 0.0 }).collect::<Vec<_>>();
        Some(Tensor::from_data(TensorData::new(values, [rows, len]), device))
    }
}
