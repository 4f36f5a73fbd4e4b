use candle_core::{DType, Result, Tensor};

/// A minibatch of padded token sequences
pub struct SequenceBatch {
    /// example names; only their count matters to the losses
    pub names: Vec<Box<str>>,
    /// token ids (batch x max_length), `u32`, right-padded
    pub inputs: Tensor,
    /// aligned targets (batch x max_length), `u32`
    pub targets: Tensor,
    /// valid length of each row
    pub lengths: Vec<usize>,
    /// rows carrying ranking supervision
    pub ranking_indicator: Vec<bool>,
    pub ranking: Option<RankingCandidates>,
}

/// One positive (index 0) and `K` negatives per example
pub struct RankingCandidates {
    /// token ids (batch x (1 + K) x max_length)
    pub inputs: Tensor,
    /// lengths, row-major over (batch x (1 + K))
    pub lengths: Vec<usize>,
}

impl SequenceBatch {
    pub fn batch_size(&self) -> usize {
        self.names.len()
    }

    /// the longest valid length in the batch
    pub fn max_length(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// indexes of rows with ranking supervision
    pub fn ranking_rows(&self) -> Vec<u32> {
        self.ranking_indicator
            .iter()
            .enumerate()
            .filter_map(|(i, &on)| if on { Some(i as u32) } else { None })
            .collect()
    }

    /// Checks shapes against each other
    pub fn check(&self) -> Result<()> {
        let nb = self.batch_size();
        let (nb_in, _) = self.inputs.dims2()?;
        let (nb_out, nt_out) = self.targets.dims2()?;

        if nb_in != nb || nb_out != nb || self.lengths.len() != nb {
            candle_core::bail!(
                "batch of {} names with {} inputs, {} targets, {} lengths",
                nb,
                nb_in,
                nb_out,
                self.lengths.len()
            );
        }

        if self.ranking_indicator.len() != nb {
            candle_core::bail!(
                "{} ranking indicators for {} examples",
                self.ranking_indicator.len(),
                nb
            );
        }

        if self.max_length() > nt_out {
            candle_core::bail!(
                "targets are {} wide but the longest input is {}",
                nt_out,
                self.max_length()
            );
        }

        if let Some(ranking) = &self.ranking {
            let (nb_rank, n_group, _) = ranking.inputs.dims3()?;
            if nb_rank != nb || ranking.lengths.len() != nb * n_group {
                candle_core::bail!(
                    "ranking candidates {:?} with {} lengths for {} examples",
                    ranking.inputs.dims(),
                    ranking.lengths.len(),
                    nb
                );
            }
        }
        Ok(())
    }

    /// Checks that every token id, including the ranking
    /// candidates, falls inside a vocabulary of `n_vocab`
    pub fn check_vocab(&self, n_vocab: usize) -> Result<()> {
        let mut tokens = vec![("inputs", &self.inputs), ("targets", &self.targets)];
        if let Some(ranking) = &self.ranking {
            tokens.push(("ranking candidates", &ranking.inputs));
        }

        for (what, x) in tokens {
            if let Some(id) = max_token_id(x)? {
                if id >= n_vocab {
                    candle_core::bail!("{} hold token id {} outside vocabulary of {}", what, id, n_vocab);
                }
            }
        }
        Ok(())
    }
}

fn max_token_id(tokens: &Tensor) -> Result<Option<usize>> {
    if tokens.elem_count() == 0 {
        return Ok(None);
    }
    let id = tokens.max_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    Ok(Some(id as usize))
}

impl RankingCandidates {
    /// 1 + K
    pub fn group_size(&self) -> Result<usize> {
        Ok(self.inputs.dims3()?.1)
    }

    /// Candidates of the selected rows, flattened to
    /// (selected * (1 + K)) sequences
    ///
    /// # Returns `(tokens_nt, lengths)`
    pub fn select_flatten(&self, rows: &[u32]) -> Result<(Tensor, Vec<usize>)> {
        let (_, n_group, nt) = self.inputs.dims3()?;
        let idx = Tensor::new(rows, self.inputs.device())?;
        let tokens = self
            .inputs
            .index_select(&idx, 0)?
            .reshape((rows.len() * n_group, nt))?;
        let lengths = rows
            .iter()
            .flat_map(|&r| {
                let r = r as usize;
                self.lengths[r * n_group..(r + 1) * n_group].iter().copied()
            })
            .collect();
        Ok((tokens, lengths))
    }
}
