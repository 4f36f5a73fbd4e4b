use crate::candle_sequence_util::LengthOrder;
use candle_core::{Result, Tensor};

pub trait SequenceEncoderModuleT {
    /// Posterior parameters of sequences already sorted by
    /// descending length
    ///
    /// # Arguments
    /// * `tokens_bt` - token ids (batch x time)
    /// * `sorted_lengths` - lengths in descending order
    ///
    /// # Returns `(z_mean_bk, z_lnvar_bk)`
    fn latent_gaussian_params(
        &self,
        tokens_bt: &Tensor,
        sorted_lengths: &[usize],
    ) -> Result<(Tensor, Tensor)>;

    /// z = mu + sigma * eps, where eps ~ N(0, 1)
    fn reparameterize(&self, z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
        let eps = Tensor::randn_like(z_mean, 0., 1.)?;
        z_mean + (z_lnvar * 0.5)?.exp()? * eps
    }

    /// Sort by length, encode, and put the rows back in the
    /// caller's order
    ///
    /// # Returns `(z_mean_bk, z_lnvar_bk)`
    fn posterior_in_order(&self, tokens_bt: &Tensor, lengths: &[usize]) -> Result<(Tensor, Tensor)> {
        let order = LengthOrder::new(lengths);
        let tokens_sorted = order.sort_rows(tokens_bt)?;
        let (z_mean, z_lnvar) =
            self.latent_gaussian_params(&tokens_sorted, order.sorted_lengths())?;
        Ok((order.restore_rows(&z_mean)?, order.restore_rows(&z_lnvar)?))
    }

    /// [`Self::posterior_in_order`] plus a posterior draw
    ///
    /// # Returns `(z_mean_bk, z_lnvar_bk, z_bk)`
    fn encode_in_order(
        &self,
        tokens_bt: &Tensor,
        lengths: &[usize],
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (z_mean, z_lnvar) = self.posterior_in_order(tokens_bt, lengths)?;
        let z = self.reparameterize(&z_mean, &z_lnvar)?;
        Ok((z_mean, z_lnvar, z))
    }

    fn dim_vocab(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait SequenceDecoderModuleT {
    /// Log-probabilities over the vocabulary for every step
    ///
    /// # Arguments
    /// * `tokens_bt` - teacher-forcing input, sorted by length
    /// * `order` - the sort that was applied to `tokens_bt` and `z_bk`
    /// * `z_bk` - latent states, sorted like `tokens_bt`
    /// * `train` - whether to apply word dropout
    ///
    /// # Returns `logp_btv` in the caller's original row order,
    /// with `t` running to the longest sequence
    fn forward_t(
        &self,
        tokens_bt: &Tensor,
        order: &LengthOrder,
        z_bk: &Tensor,
        train: bool,
    ) -> Result<Tensor>;
}
