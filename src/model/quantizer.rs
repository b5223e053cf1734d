//! Vector-quantization layers and their assembly into one suffix vector.
//!
//! Each [`VqLayer`] owns a `[K, D]` codebook and snaps its input to the
//! nearest entry. A [`VqStack`] cuts the encoder state into slices, runs the
//! layers over them and joins the results according to an [`AssemblyMode`].

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::Initializer;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

// ─── Single Layer ─────────────────────────────────────────────────

/// Configuration of one quantization layer.
#[derive(Config, Debug)]
pub struct VqLayerConfig {
    /// Number of codebook entries (K).
    pub num_codes: usize,
    /// Entry width (D).
    pub d_code: usize,
    /// Commitment weight.
    #[config(default = 0.2)]
    pub beta: f64,
}

impl VqLayerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> VqLayer<B> {
        let bound = 1.0 / self.num_codes as f64;
        VqLayer {
            codebook: Initializer::Uniform {
                min: -bound,
                max: bound,
            }
            .init([self.num_codes, self.d_code], device),
            beta: self.beta,
        }
    }
}

/// One codebook with nearest-neighbour lookup.
#[derive(Module, Debug)]
pub struct VqLayer<B: Backend> {
    /// `[K, D]` entries.
    pub codebook: Param<Tensor<B, 2>>,
    beta: f64,
}

/// Result of quantizing a batch with one layer.
#[derive(Debug, Clone)]
pub struct VqOutput<B: Backend> {
    /// `[batch, D]` straight-through output: `x + sg[e - x]`.
    pub quantized: Tensor<B, 2>,
    /// Selected entry per example.
    pub indices: Vec<usize>,
    /// `[batch]` codebook loss plus β times commitment loss.
    pub loss: Tensor<B, 1>,
}

impl<B: Backend> VqLayer<B> {
    pub fn num_codes(&self) -> usize {
        self.codebook.dims()[0]
    }

    pub fn d_code(&self) -> usize {
        self.codebook.dims()[1]
    }

    /// Index of the nearest entry for every row of `x`. Ties go to the
    /// lowest index.
    pub fn nearest(&self, x: Tensor<B, 2>) -> Result<Vec<usize>> {
        let [batch, d] = x.dims();
        let [k, d_code] = self.codebook.dims();
        if d != d_code {
            return Err(ModelError::shape("quantizer input", d_code, d));
        }
        let diff = x.detach().unsqueeze_dim::<3>(1)
            - self.codebook.val().detach().unsqueeze_dim::<3>(0);
        let dist: Vec<f32> = diff
            .powf_scalar(2.0)
            .sum_dim(2)
            .into_data()
            .iter::<f32>()
            .collect();
        Ok((0..batch).map(|row| argmin(&dist[row * k..(row + 1) * k])).collect())
    }

    /// Rows of the codebook for the given indices.
    pub fn lookup(&self, indices: &[usize]) -> Result<Tensor<B, 2>> {
        let k = self.num_codes();
        if let Some(&bad) = indices.iter().find(|&&i| i >= k) {
            return Err(ModelError::MissingVocabEntry(format!(
                "code {} outside codebook of {} entries",
                bad, k
            )));
        }
        let device = self.codebook.device();
        let data: Vec<i32> = indices.iter().map(|&i| i as i32).collect();
        let idx = Tensor::<B, 1, Int>::from_data(TensorData::new(data, [indices.len()]), &device);
        Ok(self.codebook.val().select(0, idx))
    }

    /// Quantize `[batch, D]` inputs.
    pub fn forward(&self, x: Tensor<B, 2>) -> Result<VqOutput<B>> {
        let indices = self.nearest(x.clone())?;
        let entries = self.lookup(&indices)?;

        let codebook_loss = (entries.clone() - x.clone().detach())
            .powf_scalar(2.0)
            .mean_dim(1);
        let commitment = (entries.clone().detach() - x.clone())
            .powf_scalar(2.0)
            .mean_dim(1);
        let loss = (codebook_loss + commitment.mul_scalar(self.beta)).squeeze_dim::<1>(1);

        let quantized = x.clone() + (entries - x).detach();
        Ok(VqOutput {
            quantized,
            indices,
            loss,
        })
    }
}

fn argmin(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v < values[best] {
            best = i;
        }
    }
    best
}

// ─── Stack ────────────────────────────────────────────────────────

/// How layer outputs are joined into the suffix vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AssemblyMode {
    /// Every layer quantizes its own slice; slices are concatenated.
    Concat,
    /// Every layer quantizes the whole vector; outputs are summed.
    Sum,
    /// `groups` slices, each quantized by `N / groups` layers whose outputs
    /// are summed; group results are concatenated.
    SumAndConcat { groups: usize },
}

impl AssemblyMode {
    /// Number of slices the input is cut into for `num_layers` layers.
    pub fn groups(self, num_layers: usize) -> usize {
        match self {
            AssemblyMode::Concat => num_layers,
            AssemblyMode::Sum => 1,
            AssemblyMode::SumAndConcat { groups } => groups,
        }
    }
}

/// Configuration of the quantizer stack.
#[derive(Config, Debug)]
pub struct VqStackConfig {
    /// Number of layers (N).
    #[config(default = 11)]
    pub num_layers: usize,
    /// Entries per codebook (K).
    #[config(default = 6)]
    pub num_codes: usize,
    /// Width of the vector being quantized (W).
    #[config(default = 660)]
    pub width: usize,
    #[config(default = "AssemblyMode::SumAndConcat { groups: 11 }")]
    pub mode: AssemblyMode,
    #[config(default = 0.2)]
    pub beta: f64,
}

impl VqStackConfig {
    /// Check that the layers and width divide evenly into groups.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(ModelError::Config("quantizer stack needs at least one layer".into()));
        }
        let groups = self.mode.groups(self.num_layers);
        if groups == 0 || self.num_layers % groups != 0 {
            return Err(ModelError::shape(
                "layers per assembly group",
                self.num_layers,
                groups,
            ));
        }
        if self.width % groups != 0 {
            return Err(ModelError::shape("suffix slice width", self.width, groups));
        }
        Ok(())
    }

    /// Width of one codebook entry.
    pub fn d_code(&self) -> usize {
        self.width / self.mode.groups(self.num_layers).max(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VqStack<B>> {
        self.validate()?;
        let layer = VqLayerConfig::new(self.num_codes, self.d_code()).with_beta(self.beta);
        Ok(VqStack {
            layers: (0..self.num_layers).map(|_| layer.init(device)).collect(),
            groups: self.mode.groups(self.num_layers),
            width: self.width,
        })
    }
}

/// N quantization layers assembled into one suffix vector.
#[derive(Module, Debug)]
pub struct VqStack<B: Backend> {
    pub layers: Vec<VqLayer<B>>,
    groups: usize,
    width: usize,
}

/// Result of running the whole stack.
#[derive(Debug, Clone)]
pub struct StackOutput<B: Backend> {
    /// `[batch, W]` assembled suffix.
    pub suffix: Tensor<B, 2>,
    /// Per-layer results, in layer order.
    pub layers: Vec<VqOutput<B>>,
}

impl<B: Backend> StackOutput<B> {
    /// Code tuple of every example, `[batch][layer]`.
    pub fn code_tuples(&self) -> Vec<Vec<usize>> {
        let batch = self.layers.first().map_or(0, |l| l.indices.len());
        (0..batch)
            .map(|b| self.layers.iter().map(|l| l.indices[b]).collect())
            .collect()
    }
}

impl<B: Backend> VqStack<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_codes(&self) -> usize {
        self.layers.first().map_or(0, VqLayer::num_codes)
    }

    pub fn d_code(&self) -> usize {
        self.width / self.groups
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn layers_per_group(&self) -> usize {
        self.layers.len() / self.groups
    }

    /// Group a layer belongs to.
    pub fn group_of(&self, layer: usize) -> usize {
        layer / self.layers_per_group()
    }

    /// The slice of `x` that `layer` quantizes.
    pub fn slice(&self, x: Tensor<B, 2>, layer: usize) -> Tensor<B, 2> {
        let d = self.d_code();
        x.narrow(1, self.group_of(layer) * d, d)
    }

    /// Join per-layer `[batch, D]` codes: sum within a group, concatenate groups.
    pub fn assemble(&self, codes: Vec<Tensor<B, 2>>) -> Result<Tensor<B, 2>> {
        if codes.len() != self.layers.len() {
            return Err(ModelError::shape("assembled codes", self.layers.len(), codes.len()));
        }
        let per_group = self.layers_per_group();
        let mut groups = Vec::with_capacity(self.groups);
        let mut codes = codes.into_iter();
        for _ in 0..self.groups {
            let mut acc: Option<Tensor<B, 2>> = None;
            for code in codes.by_ref().take(per_group) {
                acc = Some(match acc {
                    Some(a) => a + code,
                    None => code,
                });
            }
            if let Some(g) = acc {
                groups.push(g);
            }
        }
        Ok(Tensor::cat(groups, 1))
    }

    /// Quantize `[batch, W]` inputs through every layer.
    pub fn forward(&self, x: Tensor<B, 2>) -> Result<StackOutput<B>> {
        let w = x.dims()[1];
        if w != self.width {
            return Err(ModelError::shape("quantizer stack input", self.width, w));
        }
        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| layer.forward(self.slice(x.clone(), i)))
            .collect::<Result<Vec<_>>>()?;
        let suffix = self.assemble(layers.iter().map(|l| l.quantized.clone()).collect())?;
        Ok(StackOutput { suffix, layers })
    }

    /// Entries and index column of every layer for one code tuple per
    /// example.
    pub fn lookup_layers(&self, tuples: &[Vec<usize>]) -> Result<(Vec<Tensor<B, 2>>, Vec<Vec<usize>>)> {
        let n = self.layers.len();
        let mut codes = Vec::with_capacity(n);
        let mut columns = Vec::with_capacity(n);
        for (i, layer) in self.layers.iter().enumerate() {
            let column = tuples
                .iter()
                .map(|t| {
                    t.get(i)
                        .copied()
                        .ok_or_else(|| ModelError::shape("code tuple length", n, t.len()))
                })
                .collect::<Result<Vec<_>>>()?;
            codes.push(layer.lookup(&column)?);
            columns.push(column);
        }
        Ok((codes, columns))
    }

    /// Entries for a full code tuple per example, assembled into `[batch, W]`.
    pub fn lookup_tuples(&self, tuples: &[Vec<usize>]) -> Result<Tensor<B, 2>> {
        let (codes, _) = self.lookup_layers(tuples)?;
        self.assemble(codes)
    }

    /// Re-initialize codebooks from a pretrained `[rows, cols]` matrix.
    ///
    /// Layer `i` takes rows `0..K` and columns `i*D..(i+1)*D`.
    pub fn init_codebooks_from(mut self, matrix: Tensor<B, 2>) -> Result<Self> {
        let [rows, cols] = matrix.dims();
        let k = self.num_codes();
        let d = self.d_code();
        let n = self.layers.len();
        if rows < k {
            return Err(ModelError::shape("pretrained codebook rows", k, rows));
        }
        if cols < n * d {
            return Err(ModelError::shape("pretrained codebook columns", n * d, cols));
        }
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let block = matrix.clone().narrow(0, 0, k).narrow(1, i * d, d);
            layer.codebook = Param::from_tensor(block);
        }
        Ok(self)
    }
}
