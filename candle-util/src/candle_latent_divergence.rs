use crate::candle_loss_functions::*;
use candle_core::{Device, Result, Tensor};
use std::fmt;
use std::str::FromStr;

/// Prior families over the latent code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Prior {
    /// p(z) = N(0, I)
    #[default]
    Standard,
}

impl Prior {
    /// log p(z), summed over the last dim
    pub fn log_density(&self, z: &Tensor) -> Result<Tensor> {
        match self {
            Prior::Standard => standard_normal_log_density(z),
        }
    }

    /// one prior draw shaped like `z`
    pub fn sample_like(&self, z: &Tensor) -> Result<Tensor> {
        match self {
            Prior::Standard => Tensor::randn_like(z, 0., 1.),
        }
    }
}

impl FromStr for Prior {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "normal" | "gaussian" => Ok(Prior::Standard),
            _ => Err(format!("unknown prior family: {}", s)),
        }
    }
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prior::Standard => write!(f, "Standard"),
        }
    }
}

/// Single-sample KL(q(z|x) || p(z)) summed over the batch
///
/// sum_b [ log q(z_b | x_b) - log p(z_b) ]
///
/// * `z_mean_bk`, `z_lnvar_bk` - posterior parameters
/// * `z_bk` - a draw from the posterior
pub fn conditional_kl(
    prior: Prior,
    z_mean_bk: &Tensor,
    z_lnvar_bk: &Tensor,
    z_bk: &Tensor,
) -> Result<Tensor> {
    let log_q_b = diag_gaussian_log_density(z_bk, z_mean_bk, z_lnvar_bk)?;
    let log_p_b = prior.log_density(z_bk)?;
    (log_q_b - log_p_b)?.sum_all()
}

/// Minibatch-weighted estimate of KL(q(z) || p(z)) for the
/// aggregate posterior q(z) = E_x[ q(z|x) ], summed over the batch
///
/// log q(z_b) ≈ logsumexp_r [ log q(z_b | x_r) + log w(b,r) ]
///
/// w(b,b) = 1 / N
/// w(b,r) = (N - 1) / ((B - 1) N)  for r != b
///
/// where `N` is `num_samples` (dataset size) and `B` the batch
/// size. With B = 1 only the self term remains.
pub fn marginal_posterior_divergence(
    prior: Prior,
    z_mean_bk: &Tensor,
    z_lnvar_bk: &Tensor,
    z_bk: &Tensor,
    num_samples: usize,
) -> Result<Tensor> {
    let (nb, _) = z_bk.dims2()?;

    if num_samples == 0 {
        candle_core::bail!("num_samples must be positive");
    }

    // log q(z_b | x_r) for every (b, r)
    let log_q_br = diag_gaussian_log_density(
        &z_bk.unsqueeze(1)?,
        &z_mean_bk.unsqueeze(0)?,
        &z_lnvar_bk.unsqueeze(0)?,
    )?;

    let log_w_br = importance_log_weights(nb, num_samples, z_bk)?;
    let log_q_b = log_q_br.add(&log_w_br)?.log_sum_exp(1)?;
    let log_p_b = prior.log_density(z_bk)?;

    (log_q_b - log_p_b)?.sum_all()
}

fn importance_log_weights(nb: usize, num_samples: usize, like: &Tensor) -> Result<Tensor> {
    let n = num_samples as f64;
    let self_w = -n.ln();
    let cross_w = if nb > 1 {
        ((n - 1.) / ((nb - 1) as f64 * n)).ln()
    } else {
        f64::NEG_INFINITY
    };

    let w: Vec<f64> = (0..nb * nb)
        .map(|i| if i / nb == i % nb { self_w } else { cross_w })
        .collect();

    // cast on the host; not every device takes f64
    Tensor::from_vec(w, (nb, nb), &Device::Cpu)?
        .to_dtype(like.dtype())?
        .to_device(like.device())
}

/// MMD between posterior draws and as many prior draws
pub fn mmd_to_prior(prior: Prior, z_bk: &Tensor) -> Result<Tensor> {
    let true_bk = prior.sample_like(z_bk)?;
    compute_mmd(&true_bk, z_bk)
}
