use crate::lentil_common::*;
use crate::lentil_config::ModelConfig;
use clap::Args;
use log::info;

#[derive(Args, Debug)]
pub struct InitArgs {
    #[arg(long, short, required = true, help = "Model configuration (JSON)")]
    config: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.safetensors\n\
		     - {out}.config.json\n"
    )]
    out: Box<str>,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number")]
    device_no: usize,
}

pub fn run_init(args: &InitArgs) -> anyhow::Result<()> {
    let config = ModelConfig::from_json_file(&args.config)?;
    let dev = args.device.to_device(args.device_no)?;

    let (parameters, _model) = build_model(&config, None, &dev)?;

    let param_file = format!("{}.safetensors", args.out);
    parameters.save(&param_file)?;
    info!("Saved {} tensors to {}", parameters.all_vars().len(), param_file);

    let config_file = format!("{}.config.json", args.out);
    config.to_json_file(&config_file)?;
    info!("Saved the configuration to {}", config_file);

    Ok(())
}
