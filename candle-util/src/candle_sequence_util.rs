use candle_core::{DType, Device, Result, Tensor};

/// One-hot embedding of token ids
///
/// * `tokens_bt` - token ids (batch x time), `u32`
/// * `n_vocab` - vocabulary size
/// * `pad_idx` - padding id; its rows come out all zero
/// * `dtype` - output type
///
/// # Returns `onehot_btv` (batch x time x vocab)
pub fn one_hot_embedding(
    tokens_bt: &Tensor,
    n_vocab: usize,
    pad_idx: u32,
    dtype: DType,
) -> Result<Tensor> {
    let (nb, nt) = tokens_bt.dims2()?;
    let device = tokens_bt.device();

    let vocab_11v = Tensor::arange(0u32, n_vocab as u32, device)?.reshape((1, 1, n_vocab))?;
    let tokens_bt1 = tokens_bt.to_dtype(DType::U32)?.unsqueeze(2)?;

    let hit_btv = tokens_bt1
        .broadcast_as((nb, nt, n_vocab))?
        .eq(&vocab_11v.broadcast_as((nb, nt, n_vocab))?)?
        .to_dtype(dtype)?;

    let keep_bt1 = tokens_bt1.ne(pad_idx as f64)?.to_dtype(dtype)?;
    hit_btv.broadcast_mul(&keep_bt1)
}

/// Scheduled word dropout on the teacher-forcing input
///
/// Each token is replaced by `unk_idx` with probability `rate`.
/// Start-of-sequence and padding tokens are never replaced.
///
/// With `rate <= 0` the input is returned as it is.
pub fn word_dropout(
    tokens_bt: &Tensor,
    rate: f64,
    sos_idx: u32,
    pad_idx: u32,
    unk_idx: u32,
) -> Result<Tensor> {
    if rate <= 0. {
        return Ok(tokens_bt.clone());
    }

    let u_bt = Tensor::rand(0f32, 1f32, tokens_bt.shape(), tokens_bt.device())?;
    let survive_bt = u_bt.ge(rate)?.to_dtype(DType::F32)?;
    let is_sos_bt = tokens_bt.eq(sos_idx as f64)?.to_dtype(DType::F32)?;
    let is_pad_bt = tokens_bt.eq(pad_idx as f64)?.to_dtype(DType::F32)?;

    let keep_bt = ((survive_bt + is_sos_bt)? + is_pad_bt)?.gt(0.0)?;
    let unk_bt = Tensor::full(unk_idx, tokens_bt.shape(), tokens_bt.device())?
        .to_dtype(tokens_bt.dtype())?;

    keep_bt.where_cond(tokens_bt, &unk_bt)
}

/// Descending length order of a batch and its inverse
///
/// `sorted_idx[i]` is the original row placed at sorted position `i`;
/// `restore_idx` undoes it, so `restore_rows(sort_rows(x)) == x`.
/// Ties keep their original relative order.
#[derive(Clone, Debug)]
pub struct LengthOrder {
    sorted_lengths: Vec<usize>,
    sorted_idx: Vec<u32>,
    restore_idx: Vec<u32>,
}

impl LengthOrder {
    pub fn new(lengths: &[usize]) -> Self {
        let mut order: Vec<usize> = (0..lengths.len()).collect();
        order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));

        let mut restore_idx = vec![0u32; lengths.len()];
        for (pos, &row) in order.iter().enumerate() {
            restore_idx[row] = pos as u32;
        }

        Self {
            sorted_lengths: order.iter().map(|&r| lengths[r]).collect(),
            sorted_idx: order.iter().map(|&r| r as u32).collect(),
            restore_idx,
        }
    }

    pub fn sorted_lengths(&self) -> &[usize] {
        &self.sorted_lengths
    }

    pub fn sorted_idx(&self) -> &[u32] {
        &self.sorted_idx
    }

    pub fn restore_idx(&self) -> &[u32] {
        &self.restore_idx
    }

    pub fn max_length(&self) -> usize {
        self.sorted_lengths.first().copied().unwrap_or(0)
    }

    /// rows of `x` (dim 0) in descending length order
    pub fn sort_rows(&self, x: &Tensor) -> Result<Tensor> {
        let idx = Tensor::new(self.sorted_idx.as_slice(), x.device())?;
        x.index_select(&idx, 0)
    }

    /// rows of `x_sorted` (dim 0) back in the caller's order
    pub fn restore_rows(&self, x_sorted: &Tensor) -> Result<Tensor> {
        let idx = Tensor::new(self.restore_idx.as_slice(), x_sorted.device())?;
        x_sorted.index_select(&idx, 0)
    }
}

/// A padded batch prepared for the recurrent layers
///
/// Holds `data_btf` (batch x time x feature) cut to the longest
/// sequence, together with lengths in descending order.
pub struct PackedSequence {
    data_btf: Tensor,
    lengths: Vec<usize>,
}

impl PackedSequence {
    /// Fails unless `lengths` are sorted in descending order and fit
    /// in the time dimension of `data_btf`.
    pub fn pack(data_btf: &Tensor, lengths: &[usize]) -> Result<Self> {
        let (nb, nt, _) = data_btf.dims3()?;

        if nb != lengths.len() {
            candle_core::bail!("{} rows but {} lengths", nb, lengths.len());
        }

        if lengths.windows(2).any(|w| w[0] < w[1]) {
            candle_core::bail!("lengths must be sorted in descending order: {:?}", lengths);
        }

        let max_len = lengths.first().copied().unwrap_or(0);
        if max_len > nt {
            candle_core::bail!("length {} exceeds the padded width {}", max_len, nt);
        }

        Ok(Self {
            data_btf: data_btf.narrow(1, 0, max_len)?,
            lengths: lengths.to_vec(),
        })
    }

    pub fn data(&self) -> &Tensor {
        &self.data_btf
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_length(&self) -> usize {
        self.lengths.first().copied().unwrap_or(0)
    }

    /// 1 for rows still running at time `t`, 0 otherwise (batch x 1)
    pub fn step_mask(&self, t: usize, dtype: DType) -> Result<Tensor> {
        step_mask(&self.lengths, t, self.data_btf.device())?.to_dtype(dtype)
    }
}

fn step_mask(lengths: &[usize], t: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = lengths
        .iter()
        .map(|&l| if t < l { 1. } else { 0. })
        .collect();
    Tensor::from_vec(mask, (lengths.len(), 1), device)
}
