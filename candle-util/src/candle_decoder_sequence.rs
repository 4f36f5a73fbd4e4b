use crate::candle_aux_layers::*;
use crate::candle_model_traits::SequenceDecoderModuleT;
use crate::candle_sequence_util::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, VarBuilder};

/// GRU decoder seeded by the latent state
///
/// z -> initial hidden per layer -> GRU over the teacher-forcing
/// input -> vocabulary log-probabilities
pub struct SequenceGruDecoder {
    n_vocab: usize,
    n_hidden: usize,
    special: SpecialTokens,
    word_dropout_rate: f64,
    rnn: StackedGru,
    latent_to_hidden: Linear,
    output_to_vocab: Linear,
}

/// Reserved token ids
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecialTokens {
    pub sos: u32,
    pub eos: u32,
    pub pad: u32,
    pub unk: u32,
}

pub struct SequenceGruDecoderArgs {
    pub n_vocab: usize,
    pub n_latent: usize,
    pub n_hidden: usize,
    pub num_layers: usize,
    pub word_dropout_rate: f64,
    pub special: SpecialTokens,
}

impl SequenceDecoderModuleT for SequenceGruDecoder {
    fn forward_t(
        &self,
        tokens_bt: &Tensor,
        order: &LengthOrder,
        z_bk: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let nb = z_bk.dim(0)?;
        let num_layers = self.rnn.num_layers();

        // z -> (batch x layers x hidden) -> one state per layer
        let h_blh = self
            .latent_to_hidden
            .forward(z_bk)?
            .reshape((nb, num_layers, self.n_hidden))?;
        let h0 = (0..num_layers)
            .map(|l| h_blh.narrow(1, l, 1)?.squeeze(1)?.contiguous())
            .collect::<Result<Vec<_>>>()?;

        let rate = if train { self.word_dropout_rate() } else { 0. };
        let input_bt = word_dropout(
            tokens_bt,
            rate,
            self.special.sos,
            self.special.pad,
            self.special.unk,
        )?;

        let x_btv = one_hot_embedding(
            &input_bt,
            self.n_vocab,
            self.special.pad,
            self.output_to_vocab.weight().dtype(),
        )?;
        let packed = PackedSequence::pack(&x_btv, order.sorted_lengths())?;
        let out_bth = self.rnn.forward_packed(&packed, Some(h0.as_slice()))?.output;

        let out_bth = order.restore_rows(&out_bth)?;
        let logits_btv = self.output_to_vocab.forward(&out_bth)?;
        ops::log_softmax(&logits_btv, 2)
    }
}

impl SequenceGruDecoder {
    pub fn word_dropout_rate(&self) -> f64 {
        self.word_dropout_rate
    }

    /// Change the word dropout rate between calls, e.g. on a schedule
    pub fn set_word_dropout_rate(&mut self, rate: f64) {
        self.word_dropout_rate = rate.clamp(0., 1.);
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    /// Will create a new sequence decoder with these variables:
    ///
    /// * `dec.rnn.l{}.fwd.{weight,bias}_{ih,hh}_l0`
    /// * `dec.latent.hidden.{weight,bias}`
    /// * `dec.vocab.{weight,bias}`
    pub fn new(args: SequenceGruDecoderArgs, vs: VarBuilder) -> Result<Self> {
        let rnn = StackedGru::new(
            args.n_vocab,
            args.n_hidden,
            args.num_layers,
            false,
            vs.pp("dec.rnn"),
        )?;

        let latent_to_hidden = candle_nn::linear(
            args.n_latent,
            args.n_hidden * args.num_layers,
            vs.pp("dec.latent.hidden"),
        )?;
        let output_to_vocab = candle_nn::linear(args.n_hidden, args.n_vocab, vs.pp("dec.vocab"))?;

        Ok(Self {
            n_vocab: args.n_vocab,
            n_hidden: args.n_hidden,
            special: args.special,
            word_dropout_rate: args.word_dropout_rate.clamp(0., 1.),
            rnn,
            latent_to_hidden,
            output_to_vocab,
        })
    }
}
