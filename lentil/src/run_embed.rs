use crate::lentil_common::*;
use crate::lentil_config::ModelConfig;
use crate::lentil_input::BatchRecord;
use crate::lentil_io::open_buf_writer;
use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_model_traits::SequenceEncoderModuleT;
use clap::Args;
use log::info;
use std::io::Write;

#[derive(Args, Debug)]
pub struct EmbedArgs {
    #[arg(long, short, required = true, help = "Model configuration (JSON)")]
    config: Box<str>,

    #[arg(long, short, required = true, help = "Minibatch (JSON)")]
    batch: Box<str>,

    #[arg(long, short, help = "Model parameters (safetensors)")]
    params: Option<Box<str>>,

    #[arg(
        long,
        short,
        default_value = "stdout",
        help = "Output file",
        long_help = "Tab-separated output, one row per example:\n\
		     name, mean_1..K, logv_1..K, z_1..K.\n\
		     `stdout` or a `.gz` file name work too."
    )]
    out: Box<str>,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number")]
    device_no: usize,
}

pub fn run_embed(args: &EmbedArgs) -> anyhow::Result<()> {
    let config = ModelConfig::from_json_file(&args.config)?;
    let dev = args.device.to_device(args.device_no)?;

    let (_parameters, model) = build_model(&config, args.params.as_deref(), &dev)?;
    let batch = BatchRecord::from_json_file(&args.batch)?.to_batch(&dev)?;
    batch.check()?;

    let (mean, logv, z) = model.intermediates(&batch)?;
    let k = model.encoder().dim_latent();

    let mut writer = open_buf_writer(&args.out)?;

    let header = ["mean", "logv", "z"]
        .iter()
        .flat_map(|what| (1..=k).map(move |j| format!("{}_{}", what, j)))
        .collect::<Vec<_>>();
    writeln!(writer, "name\t{}", header.join("\t"))?;

    let mean = to_rows(&mean)?;
    let logv = to_rows(&logv)?;
    let z = to_rows(&z)?;

    for (i, name) in batch.names.iter().enumerate() {
        let values = mean[i]
            .iter()
            .chain(logv[i].iter())
            .chain(z[i].iter())
            .map(|x| x.to_string())
            .collect::<Vec<_>>();
        writeln!(writer, "{}\t{}", name, values.join("\t"))?;
    }
    writer.flush()?;

    info!("Wrote {} x {} latent states to {}", batch.batch_size(), k, args.out);
    Ok(())
}

fn to_rows(x: &Tensor) -> anyhow::Result<Vec<Vec<f32>>> {
    Ok(x.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec2()?)
}
