mod lentil_common;
mod lentil_config;
mod lentil_input;
mod lentil_io;
mod run_embed;
mod run_init;
mod run_score;

use run_embed::*;
use run_init::*;
use run_score::*;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Latent Embedding of molecular sequences with a variational autoencoder.\n\
		  A GRU encoder-decoder over SMILES-like token sequences regularized by\n\
		  conditional KL, marginal KL, MMD and a ranking loss on auxiliary labels."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Initialize model parameters from a configuration")]
    Init(InitArgs),

    #[command(
        about = "Evaluate the losses on a minibatch",
        long_about = "Evaluate reconstruction, conditional KL, marginal KL, MMD\n\
		      and ranking losses on a minibatch, together with their\n\
		      weighted total."
    )]
    Score(ScoreArgs),

    #[command(
        about = "Write latent states of a minibatch",
        long_about = "Write posterior means, log variances and one latent draw\n\
		      per example in the minibatch's own order."
    )]
    Embed(EmbedArgs),
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.commands {
        Commands::Init(args) => {
            run_init(args)?;
        }
        Commands::Score(args) => {
            run_score(args)?;
        }
        Commands::Embed(args) => {
            run_embed(args)?;
        }
    }

    Ok(())
}
