use crate::lentil_config::ModelConfig;
use candle_util::candle_core::{DType, Device};
use candle_util::candle_evae_model::Evae;
use candle_util::candle_nn::{VarBuilder, VarMap};
use clap::ValueEnum;
use log::info;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self, device_no: usize) -> anyhow::Result<Device> {
        Ok(match self {
            ComputeDevice::Metal => Device::new_metal(device_no)?,
            ComputeDevice::Cuda => Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => Device::Cpu,
        })
    }
}

/// Build the model described by `config` and, if given, load its
/// parameters from a safetensors file
///
/// The returned `VarMap` owns the parameters.
pub fn build_model(
    config: &ModelConfig,
    param_file: Option<&str>,
    device: &Device,
) -> anyhow::Result<(VarMap, Evae)> {
    let mut parameters = VarMap::new();
    let param_builder = VarBuilder::from_varmap(&parameters, DType::F32, device);
    let model = Evae::new(config.to_evae_args()?, param_builder)?;

    match param_file {
        Some(param_file) => {
            info!("Loading parameters from {}", param_file);
            parameters.load(param_file)?;
        }
        None => info!("Using freshly initialized parameters"),
    }

    Ok((parameters, model))
}
