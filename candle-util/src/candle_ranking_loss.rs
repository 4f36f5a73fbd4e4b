use crate::candle_loss_functions::pairwise_distance;
use crate::candle_model_traits::SequenceEncoderModuleT;
use crate::candle_sequence_batch::SequenceBatch;
use candle_core::{DType, Result, Tensor};

/// added to difference vectors so the distance gradient stays
/// finite at zero
pub const RANKING_DISTANCE_EPS: f64 = 1e-6;

/// Softmax-margin ranking loss over anchor-candidate distances
///
/// loss(s) = d(s, 0) + logsumexp_j ( -d(s, j) )
///         = -log softmax(-d(s, .))[0]
///
/// * `dist_sg` - distances (anchors x (1 + K)), positive at 0
///
/// # Returns the mean over anchors
pub fn softmax_margin_ranking_loss(dist_sg: &Tensor) -> Result<Tensor> {
    let positive_s = dist_sg.narrow(1, 0, 1)?.squeeze(1)?;
    let lse_s = dist_sg.neg()?.log_sum_exp(1)?;
    (positive_s + lse_s)?.mean_all()
}

/// Ranking loss on encoded means of anchors and their candidates
///
/// Only rows flagged in `batch.ranking_indicator` take part; with
/// none flagged the loss is exactly zero.
pub fn latent_ranking_loss<Enc>(encoder: &Enc, batch: &SequenceBatch, dtype: DType) -> Result<Tensor>
where
    Enc: SequenceEncoderModuleT,
{
    let rows = batch.ranking_rows();
    let device = batch.inputs.device();

    if rows.is_empty() {
        return Tensor::zeros((), dtype, device);
    }

    let Some(candidates) = batch.ranking.as_ref() else {
        candle_core::bail!("{} rows flagged for ranking without candidates", rows.len());
    };

    let n_sel = rows.len();
    let n_group = candidates.group_size()?;

    // anchors
    let idx = Tensor::new(rows.as_slice(), device)?;
    let anchor_tokens = batch.inputs.index_select(&idx, 0)?;
    let anchor_lengths: Vec<usize> = rows.iter().map(|&r| batch.lengths[r as usize]).collect();
    let (anchor_sk, _) = encoder.posterior_in_order(&anchor_tokens, &anchor_lengths)?;

    // candidates
    let (cand_tokens, cand_lengths) = candidates.select_flatten(&rows)?;
    let (cand_nk, _) = encoder.posterior_in_order(&cand_tokens, &cand_lengths)?;

    let n_latent = anchor_sk.dim(1)?;
    let anchor_nk = anchor_sk
        .unsqueeze(1)?
        .broadcast_as((n_sel, n_group, n_latent))?
        .reshape((n_sel * n_group, n_latent))?;

    let dist_sg = pairwise_distance(&cand_nk, &anchor_nk, RANKING_DISTANCE_EPS)?
        .reshape((n_sel, n_group))?;

    softmax_margin_ranking_loss(&dist_sg)
}
