use crate::lentil_io::read_json;
use anyhow::Context;
use candle_util::candle_decoder_sequence::SpecialTokens;
use candle_util::candle_evae_model::{EvaeArgs, LossWeights};
use candle_util::candle_latent_divergence::Prior;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Model hyperparameters as stored in a JSON file
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub latent_size: usize,
    pub bidirectional: bool,
    pub num_layers: usize,
    pub word_dropout_rate: f64,
    pub vocab_size: usize,
    pub max_sequence_length: usize,
    pub sos_idx: u32,
    pub eos_idx: u32,
    pub pad_idx: u32,
    pub unk_idx: u32,
    pub prior: String,
    /// marginal KL weight
    pub alpha: f64,
    /// conditional KL weight
    pub beta: f64,
    /// MMD weight
    pub gamma: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            latent_size: 64,
            bidirectional: true,
            num_layers: 1,
            word_dropout_rate: 0.,
            vocab_size: 0,
            max_sequence_length: 120,
            sos_idx: 1,
            eos_idx: 2,
            pad_idx: 0,
            unk_idx: 3,
            prior: "Standard".to_string(),
            alpha: 1.,
            beta: 1.,
            gamma: 1.,
        }
    }
}

impl ModelConfig {
    /// Read and validate a configuration file
    pub fn from_json_file(config_file: &str) -> anyhow::Result<Self> {
        let config: Self = read_json(config_file)
            .with_context(|| format!("failed to read model configuration {}", config_file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, config_file: &str) -> anyhow::Result<()> {
        let mut writer = crate::lentil_io::open_buf_writer(config_file)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vocab_size == 0 {
            anyhow::bail!("vocab_size must be set");
        }
        if self.hidden_size == 0 || self.latent_size == 0 || self.num_layers == 0 {
            anyhow::bail!(
                "hidden_size {}, latent_size {}, num_layers {}: all must be positive",
                self.hidden_size,
                self.latent_size,
                self.num_layers
            );
        }
        if self.max_sequence_length == 0 {
            anyhow::bail!("max_sequence_length must be positive");
        }
        for (name, id) in [
            ("sos_idx", self.sos_idx),
            ("eos_idx", self.eos_idx),
            ("pad_idx", self.pad_idx),
            ("unk_idx", self.unk_idx),
        ] {
            if id as usize >= self.vocab_size {
                anyhow::bail!("{} = {} outside vocabulary of {}", name, id, self.vocab_size);
            }
        }
        if !(0. ..=1.).contains(&self.word_dropout_rate) {
            anyhow::bail!("word_dropout_rate {} not in [0, 1]", self.word_dropout_rate);
        }
        if self.alpha < 0. || self.beta < 0. || self.gamma < 0. {
            anyhow::bail!(
                "loss weights must be non-negative: alpha {}, beta {}, gamma {}",
                self.alpha,
                self.beta,
                self.gamma
            );
        }
        self.prior()?;
        Ok(())
    }

    pub fn prior(&self) -> anyhow::Result<Prior> {
        self.prior.parse::<Prior>().map_err(anyhow::Error::msg)
    }

    pub fn loss_weights(&self) -> LossWeights {
        LossWeights {
            alpha: self.alpha,
            beta: self.beta,
            gamma: self.gamma,
        }
    }

    pub fn to_evae_args(&self) -> anyhow::Result<EvaeArgs> {
        Ok(EvaeArgs {
            n_vocab: self.vocab_size,
            max_sequence_length: self.max_sequence_length,
            n_hidden: self.hidden_size,
            n_latent: self.latent_size,
            num_layers: self.num_layers,
            bidirectional: self.bidirectional,
            word_dropout_rate: self.word_dropout_rate,
            special: SpecialTokens {
                sos: self.sos_idx,
                eos: self.eos_idx,
                pad: self.pad_idx,
                unk: self.unk_idx,
            },
            prior: self.prior()?,
            weights: self.loss_weights(),
        })
    }
}
