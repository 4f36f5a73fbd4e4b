use crate::candle_decoder_sequence::*;
use crate::candle_encoder_sequence::*;
use crate::candle_latent_divergence::*;
use crate::candle_loss_functions::masked_sequence_nll;
use crate::candle_model_traits::*;
use crate::candle_ranking_loss::latent_ranking_loss;
use crate::candle_sequence_batch::SequenceBatch;
use crate::candle_sequence_util::LengthOrder;
use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use log::{debug, info};
use std::fmt;
use std::str::FromStr;

/// Which losses to evaluate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    /// reconstruction with the latent regularizers
    Reconstruction,
    /// ranking on auxiliary labels only
    Ranking,
    Both,
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vae" | "reconstruction" => Ok(Task::Reconstruction),
            "atc" | "ranking" => Ok(Task::Ranking),
            "vae + atc" | "vae+atc" | "both" => Ok(Task::Both),
            _ => Err(format!("unknown task: {}", s)),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Reconstruction => write!(f, "reconstruction"),
            Task::Ranking => write!(f, "ranking"),
            Task::Both => write!(f, "both"),
        }
    }
}

/// Regularizer weights
///
/// * `alpha` - marginal KL, KL(q(z) || p(z))
/// * `beta` - conditional KL, KL(q(z|x) || p(z))
/// * `gamma` - MMD(q(z), p(z))
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

/// Five scalar losses; terms a task does not touch are zero
pub struct EvaeLosses {
    pub reconstruction: Tensor,
    pub conditional_kl: Tensor,
    pub marginal_kl: Tensor,
    pub mmd: Tensor,
    pub ranking: Tensor,
}

impl EvaeLosses {
    /// recon + beta * kl + alpha * mkl + gamma * mmd + ranking
    pub fn weighted_total(&self, weights: &LossWeights) -> Result<Tensor> {
        let total = (&self.reconstruction + (&self.conditional_kl * weights.beta)?)?;
        let total = (total + (&self.marginal_kl * weights.alpha)?)?;
        let total = (total + (&self.mmd * weights.gamma)?)?;
        total + &self.ranking
    }

    /// [reconstruction, conditional_kl, marginal_kl, mmd, ranking]
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        [
            &self.reconstruction,
            &self.conditional_kl,
            &self.marginal_kl,
            &self.mmd,
            &self.ranking,
        ]
        .iter()
        .map(|x| x.to_dtype(DType::F32)?.to_scalar::<f32>())
        .collect()
    }
}

pub struct EvaeArgs {
    pub n_vocab: usize,
    pub max_sequence_length: usize,
    pub n_hidden: usize,
    pub n_latent: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
    pub word_dropout_rate: f64,
    pub special: SpecialTokens,
    pub prior: Prior,
    pub weights: LossWeights,
}

/// Sequence VAE with marginal KL, MMD and ranking regularizers
pub struct Evae {
    encoder: SequenceGruEncoder,
    decoder: SequenceGruDecoder,
    prior: Prior,
    weights: LossWeights,
    max_sequence_length: usize,
    dtype: DType,
}

impl Evae {
    /// Will create the encoder (`enc.*`) and decoder (`dec.*`)
    /// variables in `vs`
    pub fn new(args: EvaeArgs, vs: VarBuilder) -> Result<Self> {
        check_args(&args)?;

        let dtype = vs.dtype();

        let encoder = SequenceGruEncoder::new(
            SequenceGruEncoderArgs {
                n_vocab: args.n_vocab,
                n_latent: args.n_latent,
                n_hidden: args.n_hidden,
                num_layers: args.num_layers,
                bidirectional: args.bidirectional,
                pad_idx: args.special.pad,
            },
            vs.clone(),
        )?;

        let decoder = SequenceGruDecoder::new(
            SequenceGruDecoderArgs {
                n_vocab: args.n_vocab,
                n_latent: args.n_latent,
                n_hidden: args.n_hidden,
                num_layers: args.num_layers,
                word_dropout_rate: args.word_dropout_rate,
                special: args.special,
            },
            vs,
        )?;

        info!(
            "vocab {} -> gru {} x {}{} -> latent {} (prior: {})",
            args.n_vocab,
            args.n_hidden,
            args.num_layers,
            if args.bidirectional { " x 2" } else { "" },
            args.n_latent,
            args.prior
        );

        Ok(Self {
            encoder,
            decoder,
            prior: args.prior,
            weights: args.weights,
            max_sequence_length: args.max_sequence_length,
            dtype,
        })
    }

    pub fn encoder(&self) -> &SequenceGruEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &SequenceGruDecoder {
        &self.decoder
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    pub fn prior(&self) -> Prior {
        self.prior
    }

    pub fn set_word_dropout_rate(&mut self, rate: f64) {
        self.decoder.set_word_dropout_rate(rate);
    }

    /// Evaluate the losses of `task` on a minibatch
    ///
    /// * `num_samples` - dataset size, for the marginal KL weights
    /// * `train` - whether to apply word dropout
    pub fn forward_t(
        &self,
        task: Task,
        batch: &SequenceBatch,
        num_samples: usize,
        train: bool,
    ) -> Result<EvaeLosses> {
        batch.check()?;

        let (nb, nt) = batch.inputs.dims2()?;
        if nt > self.max_sequence_length {
            candle_core::bail!(
                "batch is {} wide, model takes up to {}",
                nt,
                self.max_sequence_length
            );
        }
        if nb == 0 {
            candle_core::bail!("empty batch");
        }
        batch.check_vocab(self.encoder.dim_vocab())?;

        let zero = || self.zero(batch);

        let losses = match task {
            Task::Reconstruction => {
                let (reconstruction, conditional_kl, marginal_kl, mmd) =
                    self.vae_losses(batch, num_samples, train)?;
                EvaeLosses {
                    reconstruction,
                    conditional_kl,
                    marginal_kl,
                    mmd,
                    ranking: zero()?,
                }
            }
            Task::Ranking => EvaeLosses {
                reconstruction: zero()?,
                conditional_kl: zero()?,
                marginal_kl: zero()?,
                mmd: zero()?,
                ranking: self.ranking_loss(batch)?,
            },
            Task::Both => {
                let (reconstruction, conditional_kl, marginal_kl, mmd) =
                    self.vae_losses(batch, num_samples, train)?;
                EvaeLosses {
                    reconstruction,
                    conditional_kl,
                    marginal_kl,
                    mmd,
                    ranking: self.ranking_loss(batch)?,
                }
            }
        };

        if log::log_enabled!(log::Level::Debug) {
            let v = losses.to_vec()?;
            debug!(
                "{}: recon {:.4}, kl {:.4}, mkl {:.4}, mmd {:.4}, ranking {:.4}",
                task, v[0], v[1], v[2], v[3], v[4]
            );
        }

        Ok(losses)
    }

    /// Reconstruction and latent regularizers
    ///
    /// # Returns `(recon, kl, mkl, mmd)`
    pub fn vae_losses(
        &self,
        batch: &SequenceBatch,
        num_samples: usize,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let nb = batch.batch_size() as f64;

        let order = LengthOrder::new(&batch.lengths);
        let tokens_sorted = order.sort_rows(&batch.inputs)?;

        let (z_mean, z_lnvar) = self
            .encoder
            .latent_gaussian_params(&tokens_sorted, order.sorted_lengths())?;
        let z = self.encoder.reparameterize(&z_mean, &z_lnvar)?;

        let logp_btv = self.decoder.forward_t(&tokens_sorted, &order, &z, train)?;
        let target_bt = batch.targets.narrow(1, 0, order.max_length())?;

        let recon = (masked_sequence_nll(&logp_btv, &target_bt, self.decoder.special_tokens().pad)? / nb)?;

        let kl = if self.weights.beta > 0. {
            (conditional_kl(self.prior, &z_mean, &z_lnvar, &z)? / nb)?
        } else {
            self.zero(batch)?
        };

        let mkl = if self.weights.alpha > 0. {
            (marginal_posterior_divergence(self.prior, &z_mean, &z_lnvar, &z, num_samples)? / nb)?
        } else {
            self.zero(batch)?
        };

        let mmd = if self.weights.gamma > 0. {
            mmd_to_prior(self.prior, &z)?
        } else {
            self.zero(batch)?
        };

        Ok((recon, kl, mkl, mmd))
    }

    /// Ranking loss on the rows flagged for auxiliary supervision
    pub fn ranking_loss(&self, batch: &SequenceBatch) -> Result<Tensor> {
        latent_ranking_loss(&self.encoder, batch, self.dtype)
    }

    /// Posterior mean, log variance and a draw for every row, in
    /// the batch's own order
    ///
    /// # Returns `(z_mean_bk, z_lnvar_bk, z_bk)`
    pub fn intermediates(&self, batch: &SequenceBatch) -> Result<(Tensor, Tensor, Tensor)> {
        batch.check_vocab(self.encoder.dim_vocab())?;
        self.encoder.encode_in_order(&batch.inputs, &batch.lengths)
    }

    fn zero(&self, batch: &SequenceBatch) -> Result<Tensor> {
        Tensor::zeros((), self.dtype, batch.inputs.device())
    }
}

fn check_args(args: &EvaeArgs) -> Result<()> {
    if args.n_vocab == 0 || args.n_hidden == 0 || args.n_latent == 0 || args.num_layers == 0 {
        candle_core::bail!(
            "vocab {}, hidden {}, latent {}, layers {}: all must be positive",
            args.n_vocab,
            args.n_hidden,
            args.n_latent,
            args.num_layers
        );
    }

    let sp = &args.special;
    for (name, id) in [("sos", sp.sos), ("eos", sp.eos), ("pad", sp.pad), ("unk", sp.unk)] {
        if id as usize >= args.n_vocab {
            candle_core::bail!("{} id {} outside vocabulary of {}", name, id, args.n_vocab);
        }
    }

    if !(0. ..=1.).contains(&args.word_dropout_rate) {
        candle_core::bail!("word dropout rate {} not in [0, 1]", args.word_dropout_rate);
    }

    let w = &args.weights;
    if w.alpha < 0. || w.beta < 0. || w.gamma < 0. {
        candle_core::bail!("negative loss weight: {:?}", w);
    }
    Ok(())
}
