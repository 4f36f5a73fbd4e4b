use crate::candle_sequence_util::PackedSequence;
use candle_core::{Result, Tensor};
use candle_nn::rnn::{GRUConfig, GRUState, GRU, RNN};
use candle_nn::VarBuilder;

/// One direction of one GRU layer, stepped over a packed batch
///
/// The gates are candle's [`GRU`]; this adds the per-step length
/// mask that keeps finished rows frozen.
#[derive(Clone, Debug)]
pub struct GruCell {
    dim_hidden: usize,
    gru: GRU,
}

impl GruCell {
    /// Will create `{prefix}.weight_ih_l0`, `{prefix}.weight_hh_l0`,
    /// `{prefix}.bias_ih_l0`, `{prefix}.bias_hh_l0`
    pub fn new(dim_input: usize, dim_hidden: usize, vs: VarBuilder) -> Result<Self> {
        let gru = candle_nn::rnn::gru(dim_input, dim_hidden, GRUConfig::default(), vs)?;
        Ok(Self { dim_hidden, gru })
    }

    /// * `x_bf` - input (batch x feature)
    /// * `h_bh` - previous hidden state (batch x hidden)
    pub fn step(&self, x_bf: &Tensor, h_bh: &Tensor) -> Result<Tensor> {
        let state = GRUState {
            h: h_bh.contiguous()?,
        };
        Ok(self.gru.step(x_bf, &state)?.h)
    }

    /// Runs over a packed batch in one direction.
    ///
    /// Rows that already finished keep their hidden state and emit zeros.
    ///
    /// # Returns `(out_bth, h_bh)`
    /// * `out_bth` - per-step outputs (batch x time x hidden)
    /// * `h_bh` - final hidden state per row
    pub fn scan(
        &self,
        xs: &PackedSequence,
        xs_btf: &Tensor,
        h0_bh: &Tensor,
        reverse: bool,
    ) -> Result<(Tensor, Tensor)> {
        let nt = xs.max_length();
        let dtype = h0_bh.dtype();

        let mut h_bh = h0_bh.clone();
        let mut outputs: Vec<Option<Tensor>> = vec![None; nt];

        let steps: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..nt).rev())
        } else {
            Box::new(0..nt)
        };

        for t in steps {
            let x_bf = xs_btf.narrow(1, t, 1)?.squeeze(1)?.contiguous()?;
            let mask_b1 = xs.step_mask(t, dtype)?;
            let h_new = self.step(&x_bf, &h_bh)?;
            h_bh = (&h_bh + (h_new - &h_bh)?.broadcast_mul(&mask_b1)?)?;
            outputs[t] = Some(h_bh.broadcast_mul(&mask_b1)?);
        }

        let outputs = outputs.into_iter().flatten().collect::<Vec<_>>();

        let out_bth = if outputs.is_empty() {
            Tensor::zeros((h0_bh.dim(0)?, 0, self.dim_hidden), dtype, h0_bh.device())?
        } else {
            Tensor::stack(&outputs, 1)?
        };
        Ok((out_bth, h_bh))
    }
}

/// Multi-layer, optionally bidirectional GRU over packed batches
///
/// Layer `l > 0` reads the per-step outputs of layer `l - 1`,
/// forward and backward outputs concatenated.
pub struct StackedGru {
    dim_hidden: usize,
    num_layers: usize,
    bidirectional: bool,
    forward_cells: Vec<GruCell>,
    backward_cells: Vec<GruCell>,
}

/// Output of [`StackedGru::forward_packed`]
pub struct GruOutput {
    /// last layer outputs (batch x time x hidden * directions)
    pub output: Tensor,
    /// final states (layers * directions) of (batch x hidden),
    /// ordered l0-fwd, l0-bwd, l1-fwd, ...
    pub hidden: Vec<Tensor>,
}

impl GruOutput {
    /// Concatenate all final states per row
    /// (batch x hidden * layers * directions)
    pub fn flat_hidden(&self) -> Result<Tensor> {
        if self.hidden.len() == 1 {
            Ok(self.hidden[0].clone())
        } else {
            Tensor::cat(&self.hidden, 1)
        }
    }
}

impl StackedGru {
    /// Will create `{prefix}.l{layer}.fwd.*` and, if bidirectional,
    /// `{prefix}.l{layer}.bwd.*`
    pub fn new(
        dim_input: usize,
        dim_hidden: usize,
        num_layers: usize,
        bidirectional: bool,
        vs: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            candle_core::bail!("need at least one recurrent layer");
        }

        let num_dirs = if bidirectional { 2 } else { 1 };
        let mut forward_cells = Vec::with_capacity(num_layers);
        let mut backward_cells = Vec::with_capacity(num_layers);

        let mut prev_dim = dim_input;
        for l in 0..num_layers {
            let vs_l = vs.pp(format!("l{}", l));
            forward_cells.push(GruCell::new(prev_dim, dim_hidden, vs_l.pp("fwd"))?);
            if bidirectional {
                backward_cells.push(GruCell::new(prev_dim, dim_hidden, vs_l.pp("bwd"))?);
            }
            prev_dim = dim_hidden * num_dirs;
        }

        Ok(Self {
            dim_hidden,
            num_layers,
            bidirectional,
            forward_cells,
            backward_cells,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// * `xs` - packed input batch
    /// * `h0` - initial states, one (batch x hidden) per layer and
    ///   direction in the same order as [`GruOutput::hidden`];
    ///   zeros when `None`
    pub fn forward_packed(&self, xs: &PackedSequence, h0: Option<&[Tensor]>) -> Result<GruOutput> {
        let nb = xs.batch_size();
        let num_dirs = self.num_directions();
        let x = xs.data();

        if let Some(h0) = h0 {
            if h0.len() != self.num_layers * num_dirs {
                candle_core::bail!(
                    "expected {} initial states, got {}",
                    self.num_layers * num_dirs,
                    h0.len()
                );
            }
        }

        let zero = Tensor::zeros((nb, self.dim_hidden), x.dtype(), x.device())?;
        let init = |k: usize| -> Tensor {
            h0.map(|h| h[k].clone()).unwrap_or_else(|| zero.clone())
        };

        let mut layer_input = x.clone();
        let mut hidden = Vec::with_capacity(self.num_layers * num_dirs);

        for l in 0..self.num_layers {
            let (out_fwd, h_fwd) =
                self.forward_cells[l].scan(xs, &layer_input, &init(l * num_dirs), false)?;
            hidden.push(h_fwd);

            layer_input = if self.bidirectional {
                let (out_bwd, h_bwd) =
                    self.backward_cells[l].scan(xs, &layer_input, &init(l * num_dirs + 1), true)?;
                hidden.push(h_bwd);
                Tensor::cat(&[out_fwd, out_bwd], 2)?
            } else {
                out_fwd
            };
        }

        Ok(GruOutput {
            output: layer_input,
            hidden,
        })
    }
}
