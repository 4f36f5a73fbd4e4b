use candle_core::{DType, Result, Tensor};

const LN_2PI: f64 = 1.8378770664093453;

/// Log density of a diagonal Gaussian, summed over the last dim
///
/// log N(z; mu, diag(exp(lnvar)))
///  = -0.5 * sum_k [ ln(2π) + lnvar(k) + (z(k) - mu(k))^2 / exp(lnvar(k)) ]
///
/// Shapes broadcast, e.g. `z` (n x 1 x k) against `mu` (1 x m x k)
/// gives (n x m).
pub fn diag_gaussian_log_density(z: &Tensor, z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let sq = z.broadcast_sub(z_mean)?.sqr()?;
    let maha = sq.broadcast_mul(&z_lnvar.neg()?.exp()?)?;
    let terms = (maha.broadcast_add(z_lnvar)? + LN_2PI)?;
    terms.sum(terms.rank() - 1)? * (-0.5)
}

/// Log density of the standard normal, summed over the last dim
///
/// log N(z; 0, I) = -0.5 * sum_k [ ln(2π) + z(k)^2 ]
pub fn standard_normal_log_density(z: &Tensor) -> Result<Tensor> {
    let terms = (z.sqr()? + LN_2PI)?;
    terms.sum(terms.rank() - 1)? * (-0.5)
}

/// Negative log-likelihood of aligned targets, ignoring padding
///
/// nll = - sum_{(b,t): y(b,t) != pad} logp(b, t, y(b,t))
///
/// * `logp_btv` - log-probabilities (batch x time x vocab)
/// * `target_bt` - target ids (batch x time), `u32`
/// * `pad_idx` - ignored target id
pub fn masked_sequence_nll(logp_btv: &Tensor, target_bt: &Tensor, pad_idx: u32) -> Result<Tensor> {
    let (nb, nt, nv) = logp_btv.dims3()?;
    let logp_nv = logp_btv.reshape((nb * nt, nv))?;
    let target_n1 = target_bt.to_dtype(DType::U32)?.reshape((nb * nt, 1))?;

    let picked_n = logp_nv.gather(&target_n1.contiguous()?, 1)?.squeeze(1)?;
    let keep_n = target_n1
        .squeeze(1)?
        .ne(pad_idx as f64)?
        .to_dtype(logp_btv.dtype())?;

    picked_n.mul(&keep_n)?.sum_all()?.neg()
}

/// Squared-exponential kernel with the bandwidth tied to dimension
///
/// K(i,j) = exp( - mean_k (x(i,k) - y(j,k))^2 / d )
///
/// * `x_nd` - samples (n x d)
/// * `y_md` - samples (m x d)
///
/// # Returns `k_nm`
pub fn gaussian_kernel(x_nd: &Tensor, y_md: &Tensor) -> Result<Tensor> {
    let (_, d) = x_nd.dims2()?;
    let diff_nmd = x_nd.unsqueeze(1)?.broadcast_sub(&y_md.unsqueeze(0)?)?;
    (diff_nmd.sqr()?.mean(2)? / d as f64)?.neg()?.exp()
}

/// Biased estimate of squared maximum mean discrepancy
///
/// mean(K_xx) + mean(K_yy) - 2 mean(K_xy)
pub fn compute_mmd(x_nd: &Tensor, y_md: &Tensor) -> Result<Tensor> {
    let k_xx = gaussian_kernel(x_nd, x_nd)?.mean_all()?;
    let k_yy = gaussian_kernel(y_md, y_md)?.mean_all()?;
    let k_xy = gaussian_kernel(x_nd, y_md)?.mean_all()?;
    (k_xx + k_yy)? - (k_xy * 2.)?
}

/// Row-wise Euclidean distance, || a - b + eps ||
///
/// * `a_nd`, `b_nd` - (n x d)
///
/// # Returns `dist_n`
pub fn pairwise_distance(a_nd: &Tensor, b_nd: &Tensor, eps: f64) -> Result<Tensor> {
    ((a_nd - b_nd)? + eps)?.sqr()?.sum(1)?.sqrt()
}
