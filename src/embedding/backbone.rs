// src/embedding/backbone.rs
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};
use image::imageops::FilterType;
use log::{info, warn};
use once_cell::sync::OnceCell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::resnet::ResNet18;
use crate::utils::candle::{candle_device, flatten_to_vec, tensors_fingerprint};
use crate::utils::pipeline_config::BackboneConfig;

/// Channel progression of the compact net's three stride-2 convolutions.
pub const CHANNELS: [usize; 4] = [3, 16, 32, 64];
const KERNEL: usize = 3;

// ImageNet statistics, RGB order.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackboneArch {
    /// ImageNet-pretrained ResNet-18 trunk; needs a weights file.
    ResNet18,
    /// Three-convolution net with seeded weights. Offline fallback.
    Compact,
}

impl BackboneArch {
    pub fn default_input_size(&self) -> usize {
        match self {
            BackboneArch::ResNet18 => 224,
            BackboneArch::Compact => 128,
        }
    }

    fn min_input_size(&self) -> usize {
        match self {
            BackboneArch::ResNet18 => 32,
            BackboneArch::Compact => 8,
        }
    }
}

impl FromStr for BackboneArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "resnet18" | "resnet-18" | "resnet" => Ok(BackboneArch::ResNet18),
            "compact" | "seeded" => Ok(BackboneArch::Compact),
            other => Err(format!("unknown backbone '{}'", other)),
        }
    }
}

impl fmt::Display for BackboneArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneArch::ResNet18 => f.write_str("resnet18"),
            BackboneArch::Compact => f.write_str("compact"),
        }
    }
}

enum Trunk {
    Compact(Vec<Conv2d>),
    ResNet18(ResNet18),
}

/// Frozen convolutional feature extractor. Batch norm runs on its stored
/// statistics and there is no dropout, so the same input always yields the
/// same embedding.
pub struct Backbone {
    trunk: Trunk,
    arch: BackboneArch,
    input_size: usize,
    fingerprint: String,
    device: Device,
}

impl fmt::Debug for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backbone")
            .field("arch", &self.arch)
            .field("input_size", &self.input_size)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Backbone {
    pub fn load(config: &BackboneConfig) -> Result<Self> {
        let device = candle_device().clone();
        match (&config.weights_path, config.arch) {
            (Some(path), arch) => {
                info!("Loading {} backbone weights from {}", arch, path.display());
                let tensors = candle_core::safetensors::load(path, &device).with_context(|| {
                    format!("Failed to load backbone weights from {}", path.display())
                })?;
                Self::from_tensors(arch, tensors, config.input_size_for(arch), &device)
            }
            (None, arch) => {
                if arch == BackboneArch::ResNet18 {
                    warn!(
                        "No pretrained weights configured (VALUATION_BACKBONE_WEIGHTS); \
                         falling back to the seeded compact backbone"
                    );
                }
                info!("Using seeded compact backbone (seed {})", config.seed);
                let compact = BackboneArch::Compact;
                Self::from_tensors(
                    compact,
                    Self::seeded_tensors(config.seed, &device)?,
                    config.input_size_for(compact),
                    &device,
                )
            }
        }
    }

    pub fn from_tensors(
        arch: BackboneArch,
        tensors: HashMap<String, Tensor>,
        input_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if input_size < arch.min_input_size() {
            return Err(anyhow!(
                "Backbone input size {} is too small for {} (minimum {})",
                input_size,
                arch,
                arch.min_input_size()
            ));
        }
        let fingerprint = tensors_fingerprint(&tensors)?;
        let stem_width = tensors
            .get("conv1.weight")
            .and_then(|t| t.dims().first().copied());
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);

        let trunk = match arch {
            BackboneArch::Compact => {
                let cfg = Conv2dConfig {
                    padding: 1,
                    stride: 2,
                    ..Default::default()
                };
                let convs = (0..CHANNELS.len() - 1)
                    .map(|i| {
                        let name = format!("conv{}", i + 1);
                        candle_nn::conv2d(CHANNELS[i], CHANNELS[i + 1], KERNEL, cfg, vb.pp(&name))
                            .with_context(|| format!("Backbone weights lack a valid '{}' layer", name))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Trunk::Compact(convs)
            }
            BackboneArch::ResNet18 => {
                let width =
                    stem_width.ok_or_else(|| anyhow!("ResNet-18 weights lack 'conv1.weight'"))?;
                let net = ResNet18::new(width, vb)
                    .context("Weights do not match the ResNet-18 layout")?;
                Trunk::ResNet18(net)
            }
        };

        Ok(Self {
            trunk,
            arch,
            input_size,
            fingerprint,
            device: device.clone(),
        })
    }

    /// Kaiming-uniform weights for the compact net from a fixed seed, so the
    /// fallback backbone is reproducible across runs and machines.
    pub fn seeded_tensors(seed: u64, device: &Device) -> Result<HashMap<String, Tensor>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tensors = HashMap::new();
        for i in 0..CHANNELS.len() - 1 {
            let (c_in, c_out) = (CHANNELS[i], CHANNELS[i + 1]);
            let fan_in = (c_in * KERNEL * KERNEL) as f32;
            let bound = (6.0 / fan_in).sqrt();
            let weights: Vec<f32> = (0..c_out * c_in * KERNEL * KERNEL)
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            let bias_bound = 1.0 / fan_in.sqrt();
            let bias: Vec<f32> = (0..c_out)
                .map(|_| rng.gen_range(-bias_bound..bias_bound))
                .collect();
            tensors.insert(
                format!("conv{}.weight", i + 1),
                Tensor::from_vec(weights, (c_out, c_in, KERNEL, KERNEL), device)?,
            );
            tensors.insert(
                format!("conv{}.bias", i + 1),
                Tensor::from_vec(bias, c_out, device)?,
            );
        }
        Ok(tensors)
    }

    pub fn arch(&self) -> BackboneArch {
        self.arch
    }

    pub fn dim(&self) -> usize {
        match &self.trunk {
            Trunk::Compact(_) => CHANNELS[CHANNELS.len() - 1],
            Trunk::ResNet18(net) => net.out_channels(),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Decodes, resizes and normalises a tile into a `(1, 3, S, S)` tensor.
    pub fn preprocess(&self, bytes: &[u8]) -> Result<Tensor> {
        let decoded = image::load_from_memory(bytes).context("Failed to decode tile image")?;
        let size = self.input_size as u32;
        let rgb = image::imageops::resize(&decoded.to_rgb8(), size, size, FilterType::Triangle);

        let plane = self.input_size * self.input_size;
        let mut data = vec![0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * self.input_size + x as usize;
            for c in 0..3 {
                data[c * plane + offset] = (pixel.0[c] as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }
        Tensor::from_vec(data, (1, 3, self.input_size, self.input_size), &self.device)
            .context("Failed to build input tensor")
    }

    /// Activation of the last convolutional stage (after ReLU): `(1, C, h, w)`.
    pub fn feature_map(&self, input: &Tensor) -> Result<Tensor> {
        match &self.trunk {
            Trunk::Compact(convs) => {
                let mut x = input.clone();
                for conv in convs {
                    x = conv.forward(&x)?.relu()?;
                }
                Ok(x)
            }
            Trunk::ResNet18(net) => Ok(net.feature_map(input)?),
        }
    }

    /// Global average pool over the spatial dimensions of a feature map.
    pub fn pool(feature_map: &Tensor) -> Result<Tensor> {
        Ok(feature_map.mean((2, 3))?)
    }

    pub fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let input = self.preprocess(bytes)?;
        let pooled = Self::pool(&self.feature_map(&input)?)?;
        flatten_to_vec(&pooled)
    }
}

type BackboneKey = (BackboneArch, Option<PathBuf>, u64, Option<usize>);

fn backbone_key(config: &BackboneConfig) -> BackboneKey {
    (
        config.arch,
        config.weights_path.clone(),
        config.seed,
        config.input_size,
    )
}

/// A backbone loaded at most once, remembering the configuration it came from.
struct BackboneSlot(OnceCell<(BackboneKey, Arc<Backbone>)>);

impl BackboneSlot {
    const fn new() -> Self {
        Self(OnceCell::new())
    }

    fn get(&self, config: &BackboneConfig) -> Result<Arc<Backbone>> {
        let key = backbone_key(config);
        let (loaded_key, backbone) = self
            .0
            .get_or_try_init(|| Backbone::load(config).map(|b| (key.clone(), Arc::new(b))))?;
        if *loaded_key != key {
            return Err(anyhow!(
                "Backbone already loaded with {:?}; cannot switch to {:?} in the same process",
                loaded_key,
                key
            ));
        }
        Ok(Arc::clone(backbone))
    }
}

static SHARED_BACKBONE: BackboneSlot = BackboneSlot::new();

/// Loads the backbone once per process and hands out shared references. A
/// request for a different configuration than the one loaded is an error.
pub fn shared_backbone(config: &BackboneConfig) -> Result<Arc<Backbone>> {
    SHARED_BACKBONE.get(config)
}
