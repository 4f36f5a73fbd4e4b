use crate::candle_aux_layers::*;
use crate::candle_model_traits::SequenceEncoderModuleT;
use crate::candle_sequence_util::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// GRU encoder over one-hot token sequences
pub struct SequenceGruEncoder {
    n_vocab: usize,
    n_latent: usize,
    pad_idx: u32,
    rnn: StackedGru,
    z_mean: Linear,
    z_lnvar: Linear,
}

pub struct SequenceGruEncoderArgs {
    pub n_vocab: usize,
    pub n_latent: usize,
    pub n_hidden: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
    pub pad_idx: u32,
}

impl SequenceEncoderModuleT for SequenceGruEncoder {
    fn latent_gaussian_params(
        &self,
        tokens_bt: &Tensor,
        sorted_lengths: &[usize],
    ) -> Result<(Tensor, Tensor)> {
        let h_bh = self.encode_hidden(tokens_bt, sorted_lengths)?;
        let z_mean_bk = self.z_mean.forward(&h_bh)?;
        let z_lnvar_bk = self.z_lnvar.forward(&h_bh)?;
        Ok((z_mean_bk, z_lnvar_bk))
    }

    fn dim_vocab(&self) -> usize {
        self.n_vocab
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl SequenceGruEncoder {
    /// Final recurrent states, all layers and directions
    /// concatenated (batch x hidden * layers * directions)
    pub fn encode_hidden(&self, tokens_bt: &Tensor, sorted_lengths: &[usize]) -> Result<Tensor> {
        let x_btv = one_hot_embedding(
            tokens_bt,
            self.n_vocab,
            self.pad_idx,
            self.z_mean.weight().dtype(),
        )?;
        let packed = PackedSequence::pack(&x_btv, sorted_lengths)?;
        self.rnn.forward_packed(&packed, None)?.flat_hidden()
    }

    /// Will create a new sequence encoder with these variables:
    ///
    /// * `enc.rnn.l{}.{fwd,bwd}.{weight,bias}_{ih,hh}_l0`
    /// * `enc.z.mean.{weight,bias}`
    /// * `enc.z.lnvar.{weight,bias}`
    pub fn new(args: SequenceGruEncoderArgs, vs: VarBuilder) -> Result<Self> {
        let rnn = StackedGru::new(
            args.n_vocab,
            args.n_hidden,
            args.num_layers,
            args.bidirectional,
            vs.pp("enc.rnn"),
        )?;

        let d_hidden = args.n_hidden * rnn.num_layers() * rnn.num_directions();
        let z_mean = candle_nn::linear(d_hidden, args.n_latent, vs.pp("enc.z.mean"))?;
        let z_lnvar = candle_nn::linear(d_hidden, args.n_latent, vs.pp("enc.z.lnvar"))?;

        Ok(Self {
            n_vocab: args.n_vocab,
            n_latent: args.n_latent,
            pad_idx: args.pad_idx,
            rnn,
            z_mean,
            z_lnvar,
        })
    }
}
