use crate::lentil_common::*;
use crate::lentil_config::ModelConfig;
use crate::lentil_input::BatchRecord;
use candle_util::candle_core::DType;
use candle_util::candle_evae_model::Task;
use clap::Args;
use log::info;

#[derive(Args, Debug)]
pub struct ScoreArgs {
    #[arg(long, short, required = true, help = "Model configuration (JSON)")]
    config: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Minibatch (JSON)",
        long_help = "Minibatch with `names`, `inputs`, `targets`, `lengths`\n\
		     and optionally `ranking_indicator`, `ranking_inputs`,\n\
		     `ranking_lengths`. Gzipped files are fine."
    )]
    batch: Box<str>,

    #[arg(long, short, help = "Model parameters (safetensors)")]
    params: Option<Box<str>>,

    #[arg(
        long,
        short,
        default_value = "both",
        help = "Losses to evaluate",
        long_help = "Which losses to evaluate:\n\
		     - reconstruction (or vae): reconstruction, KL, marginal KL, MMD\n\
		     - ranking (or atc): ranking on auxiliary labels\n\
		     - both\n"
    )]
    task: Task,

    #[arg(
        long,
        short,
        default_value_t = 1000,
        help = "Dataset size",
        long_help = "Number of training examples,\n\
		     used to weight the marginal KL estimate"
    )]
    num_samples: usize,

    #[arg(long, default_value_t = false, help = "Apply word dropout")]
    train: bool,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number")]
    device_no: usize,
}

pub fn run_score(args: &ScoreArgs) -> anyhow::Result<()> {
    let config = ModelConfig::from_json_file(&args.config)?;
    let dev = args.device.to_device(args.device_no)?;

    let (_parameters, model) = build_model(&config, args.params.as_deref(), &dev)?;

    let batch = BatchRecord::from_json_file(&args.batch)?.to_batch(&dev)?;
    info!(
        "Scoring {} examples ({}) with N = {}",
        batch.batch_size(),
        args.task,
        args.num_samples
    );

    let losses = model.forward_t(args.task, &batch, args.num_samples, args.train)?;
    let total = losses
        .weighted_total(model.weights())?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?;
    let v = losses.to_vec()?;

    println!("task\trecon\tkl\tmarginal_kl\tmmd\tranking\ttotal");
    println!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        args.task, v[0], v[1], v[2], v[3], v[4], total
    );

    Ok(())
}
