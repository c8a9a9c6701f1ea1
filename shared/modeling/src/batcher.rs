use tch::{Device, Kind, Tensor};

/// A batch of token sequences right-aligned to a common width so that
/// generation can continue directly after the last real token of every row.
#[derive(Debug, Clone, PartialEq)]
pub struct LeftPaddedBatch {
    input_ids: Vec<i64>,
    attention_mask: Vec<bool>,
    rows: usize,
    width: usize,
}

impl LeftPaddedBatch {
    pub fn collate(sequences: &[&[i64]], pad_token_id: i64) -> Self {
        let rows = sequences.len();
        let width = sequences.iter().map(|x| x.len()).max().unwrap_or(0);
        let mut input_ids = Vec::with_capacity(rows * width);
        let mut attention_mask = Vec::with_capacity(rows * width);
        for sequence in sequences {
            let padding = width - sequence.len();
            input_ids.extend(std::iter::repeat(pad_token_id).take(padding));
            input_ids.extend_from_slice(sequence);
            attention_mask.extend(std::iter::repeat(false).take(padding));
            attention_mask.extend(std::iter::repeat(true).take(sequence.len()));
        }
        Self {
            input_ids,
            attention_mask,
            rows,
            width,
        }
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row(&self, index: usize) -> &[i64] {
        &self.input_ids[index * self.width..(index + 1) * self.width]
    }

    pub fn mask_row(&self, index: usize) -> &[bool] {
        &self.attention_mask[index * self.width..(index + 1) * self.width]
    }

    /// `(input_ids, attention_mask)`, both `(rows, width)` int64 on `device`.
    pub fn to_tensors(&self, device: Device) -> (Tensor, Tensor) {
        let shape = [self.rows as i64, self.width as i64];
        let input_ids = Tensor::from_slice(&self.input_ids)
            .reshape(shape)
            .to(device);
        let mask = self
            .attention_mask
            .iter()
            .map(|x| *x as i64)
            .collect::<Vec<_>>();
        let attention_mask = Tensor::from_slice(&mask)
            .reshape(shape)
            .to_kind(Kind::Int64)
            .to(device);
        (input_ids, attention_mask)
    }
}

/// Splits tokenized sequences, in order, into left-padded batches of at most
/// `batch_size` rows.
pub struct Batcher<'a> {
    sequences: &'a [Vec<i64>],
    batch_size: usize,
    pad_token_id: i64,
    position: usize,
}

impl<'a> Batcher<'a> {
    pub fn new(sequences: &'a [Vec<i64>], batch_size: usize, pad_token_id: i64) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        Self {
            sequences,
            batch_size,
            pad_token_id,
            position: 0,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.sequences.len().div_ceil(self.batch_size)
    }
}

impl Iterator for Batcher<'_> {
    type Item = LeftPaddedBatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.sequences.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.sequences.len());
        let chunk = self.sequences[self.position..end]
            .iter()
            .map(|x| x.as_slice())
            .collect::<Vec<_>>();
        self.position = end;
        Some(LeftPaddedBatch::collate(&chunk, self.pad_token_id))
    }
}
