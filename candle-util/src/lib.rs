pub mod candle_aux_layers;
pub mod candle_decoder_sequence;
pub mod candle_encoder_sequence;
pub mod candle_evae_model;
pub mod candle_latent_divergence;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_ranking_loss;
pub mod candle_sequence_batch;
pub mod candle_sequence_util;

pub use candle_core;
pub use candle_nn;
