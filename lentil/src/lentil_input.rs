use crate::lentil_io::read_json;
use anyhow::Context;
use candle_util::candle_core::{Device, Tensor};
use candle_util::candle_sequence_batch::{RankingCandidates, SequenceBatch};
use serde::{Deserialize, Serialize};

/// A minibatch as written by the tokenizer, one entry per example
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BatchRecord {
    pub names: Vec<String>,
    /// right-padded token ids
    pub inputs: Vec<Vec<u32>>,
    /// aligned targets, same width as `inputs`
    pub targets: Vec<Vec<u32>>,
    pub lengths: Vec<usize>,
    /// 1 where ranking candidates are meaningful
    #[serde(default)]
    pub ranking_indicator: Vec<u8>,
    /// per example: positive first, then negatives
    #[serde(default)]
    pub ranking_inputs: Option<Vec<Vec<Vec<u32>>>>,
    #[serde(default)]
    pub ranking_lengths: Option<Vec<Vec<usize>>>,
}

impl BatchRecord {
    pub fn from_json_file(batch_file: &str) -> anyhow::Result<Self> {
        read_json(batch_file).with_context(|| format!("failed to read batch {}", batch_file))
    }

    /// Check the record and move it to `device`
    pub fn to_batch(&self, device: &Device) -> anyhow::Result<SequenceBatch> {
        let nb = self.names.len();
        if nb == 0 {
            anyhow::bail!("empty batch");
        }
        if self.inputs.len() != nb || self.targets.len() != nb || self.lengths.len() != nb {
            anyhow::bail!(
                "{} names, {} inputs, {} targets, {} lengths",
                nb,
                self.inputs.len(),
                self.targets.len(),
                self.lengths.len()
            );
        }

        let width = self.inputs[0].len();
        let inputs = rows_to_tensor(&self.inputs, width, device).context("inputs")?;
        let targets = rows_to_tensor(&self.targets, width, device).context("targets")?;

        for (name, &len) in self.names.iter().zip(self.lengths.iter()) {
            if len > width {
                anyhow::bail!("{}: length {} exceeds width {}", name, len, width);
            }
        }

        let ranking_indicator: Vec<bool> = if self.ranking_indicator.is_empty() {
            vec![false; nb]
        } else if self.ranking_indicator.len() == nb {
            self.ranking_indicator.iter().map(|&x| x == 1).collect()
        } else {
            anyhow::bail!(
                "{} ranking indicators for {} examples",
                self.ranking_indicator.len(),
                nb
            );
        };

        let ranking = match (&self.ranking_inputs, &self.ranking_lengths) {
            (Some(groups), Some(group_lengths)) => {
                Some(ranking_candidates(groups, group_lengths, nb, width, device)?)
            }
            (None, None) => None,
            _ => anyhow::bail!("ranking_inputs and ranking_lengths go together"),
        };

        Ok(SequenceBatch {
            names: self.names.iter().map(|x| x.clone().into_boxed_str()).collect(),
            inputs,
            targets,
            lengths: self.lengths.clone(),
            ranking_indicator,
            ranking,
        })
    }
}

fn rows_to_tensor(rows: &[Vec<u32>], width: usize, device: &Device) -> anyhow::Result<Tensor> {
    if let Some(bad) = rows.iter().position(|r| r.len() != width) {
        anyhow::bail!("row {} has {} tokens, expected {}", bad, rows[bad].len(), width);
    }
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

fn ranking_candidates(
    groups: &[Vec<Vec<u32>>],
    group_lengths: &[Vec<usize>],
    nb: usize,
    width: usize,
    device: &Device,
) -> anyhow::Result<RankingCandidates> {
    if groups.len() != nb || group_lengths.len() != nb {
        anyhow::bail!(
            "ranking groups for {} and {} examples, expected {}",
            groups.len(),
            group_lengths.len(),
            nb
        );
    }

    let n_group = groups[0].len();
    if n_group < 2 {
        anyhow::bail!("need a positive and at least one negative per group");
    }

    let mut flat = Vec::with_capacity(nb * n_group * width);
    let mut lengths = Vec::with_capacity(nb * n_group);

    for (i, (group, lens)) in groups.iter().zip(group_lengths.iter()).enumerate() {
        if group.len() != n_group || lens.len() != n_group {
            anyhow::bail!("ranking group {} is not of size {}", i, n_group);
        }
        for (seq, &len) in group.iter().zip(lens.iter()) {
            if seq.len() != width || len > width {
                anyhow::bail!("ranking group {}: sequences must be {} wide", i, width);
            }
            flat.extend_from_slice(seq);
            lengths.push(len);
        }
    }

    Ok(RankingCandidates {
        inputs: Tensor::from_vec(flat, (nb, n_group, width), device)?,
        lengths,
    })
}
