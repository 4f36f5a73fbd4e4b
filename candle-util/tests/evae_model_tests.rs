use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_decoder_sequence::SpecialTokens;
use candle_util::candle_evae_model::*;
use candle_util::candle_latent_divergence::Prior;
use candle_util::candle_model_traits::*;
use candle_util::candle_sequence_batch::*;
use candle_util::candle_sequence_util::LengthOrder;

const N_VOCAB: usize = 8;
const N_LATENT: usize = 3;
const WIDTH: usize = 6;

fn special() -> SpecialTokens {
    SpecialTokens {
        sos: 1,
        eos: 2,
        pad: 0,
        unk: 3,
    }
}

fn make_args(weights: LossWeights, word_dropout_rate: f64) -> EvaeArgs {
    EvaeArgs {
        n_vocab: N_VOCAB,
        max_sequence_length: WIDTH,
        n_hidden: 5,
        n_latent: N_LATENT,
        num_layers: 2,
        bidirectional: true,
        word_dropout_rate,
        special: special(),
        prior: Prior::Standard,
        weights,
    }
}

fn make_model(weights: LossWeights) -> (VarMap, Evae) {
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = Evae::new(make_args(weights, 0.), vs).unwrap();
    (varmap, model)
}

fn all_weights() -> LossWeights {
    LossWeights {
        alpha: 1.,
        beta: 1.,
        gamma: 1.,
    }
}

fn rows() -> Vec<Vec<u32>> {
    vec![
        vec![1, 4, 5, 6, 2, 0],
        vec![1, 7, 2, 0, 0, 0],
        vec![1, 4, 4, 5, 7, 2],
        vec![1, 6, 6, 2, 0, 0],
    ]
}

fn lengths() -> Vec<usize> {
    vec![5, 3, 6, 4]
}

fn to_tensor(rows: &[Vec<u32>], dev: &Device) -> Result<Tensor> {
    let nt = rows[0].len();
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), nt), dev)
}

/// candidates: the row itself, then two other rows
fn self_first(i: usize, n: usize) -> [usize; 3] {
    [i, (i + 1) % n, (i + 2) % n]
}

fn make_batch(ranking_indicator: Vec<bool>, with_candidates: bool) -> Result<SequenceBatch> {
    let groups: Option<fn(usize, usize) -> [usize; 3]> = if with_candidates {
        Some(self_first)
    } else {
        None
    };
    make_batch_with_groups(ranking_indicator, groups)
}

/// `groups(i, n)` lists the rows whose sequences are the candidates of
/// row `i`, positive first
fn make_batch_with_groups(
    ranking_indicator: Vec<bool>,
    groups: Option<fn(usize, usize) -> [usize; 3]>,
) -> Result<SequenceBatch> {
    let dev = Device::Cpu;
    let rows = rows();
    let targets: Vec<Vec<u32>> = rows
        .iter()
        .map(|r| r[1..].iter().copied().chain(std::iter::once(0)).collect())
        .collect();

    let ranking = if let Some(groups) = groups {
        let n = rows.len();
        let mut flat = vec![];
        let mut cand_lengths = vec![];
        for i in 0..n {
            for j in groups(i, n) {
                flat.extend(rows[j].iter().copied());
                cand_lengths.push(lengths()[j]);
            }
        }
        Some(RankingCandidates {
            inputs: Tensor::from_vec(flat, (n, 3, WIDTH), &dev)?,
            lengths: cand_lengths,
        })
    } else {
        None
    };

    Ok(SequenceBatch {
        names: (0..rows.len())
            .map(|i| format!("mol{}", i).into_boxed_str())
            .collect(),
        inputs: to_tensor(&rows, &dev)?,
        targets: to_tensor(&targets, &dev)?,
        lengths: lengths(),
        ranking_indicator,
        ranking,
    })
}

fn scalar(x: &Tensor) -> f32 {
    x.to_scalar::<f32>().unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    scalar(&(a - b).unwrap().abs().unwrap().max_all().unwrap())
}

#[test]
fn decoder_output_follows_caller_order() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let dev = Device::Cpu;

    let tokens = to_tensor(&rows(), &dev)?;
    let lengths = lengths();
    let z = Tensor::randn(0f32, 1f32, (lengths.len(), N_LATENT), &dev)?;

    let decode = |tokens: &Tensor, lengths: &[usize], z: &Tensor| -> Result<Tensor> {
        let order = LengthOrder::new(lengths);
        model
            .decoder()
            .forward_t(&order.sort_rows(tokens)?, &order, &order.sort_rows(z)?, false)
    };

    let base = decode(&tokens, &lengths, &z)?;
    assert_eq!(base.dims(), &[4, 6, N_VOCAB]);

    let perm = [2u32, 0, 3, 1];
    let perm_t = Tensor::new(&perm, &dev)?;
    let lengths_p: Vec<usize> = perm.iter().map(|&p| lengths[p as usize]).collect();
    let shuffled = decode(
        &tokens.index_select(&perm_t, 0)?,
        &lengths_p,
        &z.index_select(&perm_t, 0)?,
    )?;

    for (i, &p) in perm.iter().enumerate() {
        let a = shuffled.narrow(0, i, 1)?;
        let b = base.narrow(0, p as usize, 1)?;
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    // each step is a distribution over the vocabulary
    let total: Vec<f32> = base.exp()?.sum(2)?.flatten_all()?.to_vec1()?;
    assert!(total.iter().all(|s| (s - 1.).abs() < 1e-4));
    Ok(())
}

#[test]
fn intermediates_match_one_at_a_time_encoding() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let batch = make_batch(vec![false; 4], false)?;

    let (mean, logv, z) = model.intermediates(&batch)?;
    assert_eq!(mean.dims(), &[4, N_LATENT]);
    assert_eq!(logv.dims(), &[4, N_LATENT]);
    assert_eq!(z.dims(), &[4, N_LATENT]);

    for (i, &len) in batch.lengths.iter().enumerate() {
        let row = batch.inputs.narrow(0, i, 1)?;
        let (mean_i, logv_i) = model.encoder().posterior_in_order(&row, &[len])?;
        assert!(max_abs_diff(&mean.narrow(0, i, 1)?, &mean_i) < 1e-5);
        assert!(max_abs_diff(&logv.narrow(0, i, 1)?, &logv_i) < 1e-5);
    }
    Ok(())
}

#[test]
fn reconstruction_task_leaves_ranking_at_zero() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let batch = make_batch(vec![true, false, true, false], true)?;

    let losses = model.forward_t(Task::Reconstruction, &batch, 100, true)?;
    let v = losses.to_vec()?;
    assert!(v[0] > 0. && v[0].is_finite());
    assert!(v[1].is_finite() && v[2].is_finite() && v[3].is_finite());
    assert_eq!(v[4], 0.);
    Ok(())
}

#[test]
fn ranking_task_leaves_other_terms_at_zero() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let batch = make_batch(vec![true, false, true, true], true)?;

    let v = model.forward_t(Task::Ranking, &batch, 100, true)?.to_vec()?;
    assert_eq!(&v[..4], &[0., 0., 0., 0.]);
    // -log softmax is positive with more than one candidate
    assert!(v[4] > 0. && v[4].is_finite());

    let both = model.forward_t(Task::Both, &batch, 100, false)?.to_vec()?;
    assert!(both.iter().all(|x| x.is_finite()));
    assert!((both[4] - v[4]).abs() < 1e-5);
    Ok(())
}

#[test]
fn ranking_without_flagged_rows_is_zero() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let batch = make_batch(vec![false; 4], false)?;
    let loss = model.ranking_loss(&batch)?;
    assert_eq!(loss.dims(), &[] as &[usize]);
    assert_eq!(scalar(&loss), 0.);
    Ok(())
}

#[test]
fn flagged_rows_need_candidates() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let batch = make_batch(vec![true, false, false, false], false)?;
    assert!(model.forward_t(Task::Ranking, &batch, 100, false).is_err());
    Ok(())
}

#[test]
fn zero_weights_skip_regularizers() -> Result<()> {
    let weights = LossWeights {
        alpha: 0.,
        beta: 0.,
        gamma: 0.,
    };
    let (_vm, model) = make_model(weights);
    let batch = make_batch(vec![false; 4], false)?;

    let losses = model.forward_t(Task::Reconstruction, &batch, 100, false)?;
    let v = losses.to_vec()?;
    assert_eq!(&v[1..], &[0., 0., 0., 0.]);

    let total = scalar(&losses.weighted_total(model.weights())?);
    assert!((total - v[0]).abs() < 1e-5);
    Ok(())
}

#[test]
fn weighted_total_combines_terms() -> Result<()> {
    let weights = LossWeights {
        alpha: 0.5,
        beta: 2.,
        gamma: 3.,
    };
    let (_vm, model) = make_model(weights);
    let batch = make_batch(vec![true; 4], true)?;

    let losses = model.forward_t(Task::Both, &batch, 100, true)?;
    let v = losses.to_vec()?;
    let expected = v[0] + 2. * v[1] + 0.5 * v[2] + 3. * v[3] + v[4];
    let total = scalar(&losses.weighted_total(&weights)?);
    assert!((total - expected).abs() < 1e-3 * expected.abs().max(1.));
    Ok(())
}

#[test]
fn bad_configuration_is_rejected() {
    let dev = Device::Cpu;

    let varmap = VarMap::new();
    let mut args = make_args(all_weights(), 0.);
    args.special.pad = N_VOCAB as u32;
    assert!(Evae::new(args, VarBuilder::from_varmap(&varmap, DType::F32, &dev)).is_err());

    let varmap = VarMap::new();
    let mut args = make_args(all_weights(), 0.);
    args.weights.gamma = -1.;
    assert!(Evae::new(args, VarBuilder::from_varmap(&varmap, DType::F32, &dev)).is_err());

    let varmap = VarMap::new();
    let args = make_args(all_weights(), 1.5);
    assert!(Evae::new(args, VarBuilder::from_varmap(&varmap, DType::F32, &dev)).is_err());
}

#[test]
fn too_wide_batch_is_rejected() -> Result<()> {
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut args = make_args(all_weights(), 0.);
    args.max_sequence_length = 4;
    let model = Evae::new(args, vs)?;
    let batch = make_batch(vec![false; 4], false)?;
    assert!(model.forward_t(Task::Reconstruction, &batch, 10, false).is_err());
    Ok(())
}

#[test]
fn out_of_vocabulary_tokens_are_rejected() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let dev = Device::Cpu;

    let mut bad_rows = rows();
    bad_rows[0][3] = N_VOCAB as u32 + 3;

    let mut batch = make_batch(vec![false; 4], false)?;
    batch.inputs = to_tensor(&bad_rows, &dev)?;
    assert!(model.forward_t(Task::Reconstruction, &batch, 100, false).is_err());
    assert!(model.intermediates(&batch).is_err());

    let mut batch = make_batch(vec![false; 4], false)?;
    batch.targets = to_tensor(&bad_rows, &dev)?;
    assert!(model.forward_t(Task::Reconstruction, &batch, 100, false).is_err());

    // the last vocabulary id is fine
    let mut edge_rows = rows();
    edge_rows[0][3] = N_VOCAB as u32 - 1;
    let mut batch = make_batch(vec![true; 4], true)?;
    batch.inputs = to_tensor(&edge_rows, &dev)?;
    model.forward_t(Task::Both, &batch, 100, false)?;

    let mut batch = make_batch(vec![true; 4], true)?;
    if let Some(ranking) = batch.ranking.as_mut() {
        ranking.inputs = (ranking.inputs.to_dtype(DType::F32)? + N_VOCAB as f64)?.to_dtype(DType::U32)?;
    }
    assert!(model.forward_t(Task::Ranking, &batch, 100, false).is_err());
    Ok(())
}

#[test]
fn word_dropout_applies_only_in_training() -> Result<()> {
    let (_vm, mut model) = make_model(all_weights());
    let dev = Device::Cpu;
    let sp = special();

    let tokens = to_tensor(&rows(), &dev)?;
    let order = LengthOrder::new(&lengths());
    let z = Tensor::randn(0f32, 1f32, (4, N_LATENT), &dev)?;
    let tokens_sorted = order.sort_rows(&tokens)?;
    let z_sorted = order.sort_rows(&z)?;

    let decode = |model: &Evae, tokens_sorted: &Tensor, train: bool| -> Result<Tensor> {
        model
            .decoder()
            .forward_t(tokens_sorted, &order, &z_sorted, train)
    };

    let clean = decode(&model, &tokens_sorted, false)?;

    model.set_word_dropout_rate(1.);
    assert_eq!(model.decoder().word_dropout_rate(), 1.);

    // evaluation ignores the rate
    let eval = decode(&model, &tokens_sorted, false)?;
    assert_eq!(max_abs_diff(&clean, &eval), 0.);

    // with rate 1 every token but SOS and padding reads as UNK
    let dropped_rows: Vec<Vec<u32>> = rows()
        .iter()
        .map(|r| {
            r.iter()
                .map(|&x| if x == sp.sos || x == sp.pad { x } else { sp.unk })
                .collect()
        })
        .collect();
    let dropped_sorted = order.sort_rows(&to_tensor(&dropped_rows, &dev)?)?;

    let trained = decode(&model, &tokens_sorted, true)?;
    let expected = decode(&model, &dropped_sorted, false)?;
    assert!(max_abs_diff(&trained, &expected) < 1e-6);
    assert!(max_abs_diff(&trained, &clean) > 1e-6);

    // rates outside [0, 1] are clamped
    model.set_word_dropout_rate(-0.5);
    assert_eq!(model.decoder().word_dropout_rate(), 0.);
    let trained = decode(&model, &tokens_sorted, true)?;
    assert_eq!(max_abs_diff(&clean, &trained), 0.);
    Ok(())
}

/// candidates: previous row (positive), the row itself, the next row
fn shifted_positive(i: usize, n: usize) -> [usize; 3] {
    [(i + n - 1) % n, i, (i + 1) % n]
}

#[test]
fn ranking_loss_matches_hand_computation() -> Result<()> {
    let (_vm, model) = make_model(all_weights());
    let batch = make_batch_with_groups(vec![true, false, true, true], Some(shifted_positive))?;

    let loss = scalar(&model.ranking_loss(&batch)?) as f64;

    // posterior means, one row at a time
    let means: Vec<Vec<f64>> = (0..4)
        .map(|i| {
            let row = batch.inputs.narrow(0, i, 1)?;
            let (mean, _) = model.encoder().posterior_in_order(&row, &[batch.lengths[i]])?;
            Ok(mean.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
        })
        .collect::<Result<_>>()?;

    let eps = candle_util::candle_ranking_loss::RANKING_DISTANCE_EPS;
    let dist = |a: &[f64], c: &[f64]| -> f64 {
        a.iter()
            .zip(c)
            .map(|(x, y)| (y - x + eps).powi(2))
            .sum::<f64>()
            .sqrt()
    };

    let anchors = [0usize, 2, 3];
    let expected = anchors
        .iter()
        .map(|&i| {
            let d: Vec<f64> = shifted_positive(i, 4)
                .iter()
                .map(|&j| dist(&means[i], &means[j]))
                .collect();
            d[0] + d.iter().map(|x| (-x).exp()).sum::<f64>().ln()
        })
        .sum::<f64>()
        / anchors.len() as f64;

    assert!(
        (loss - expected).abs() < 1e-4,
        "loss {} expected {}",
        loss,
        expected
    );
    Ok(())
}
