// src/embedding/resnet.rs
//! ResNet-18 feature trunk (no classifier head) in inference mode.
//!
//! Parameter names follow the torchvision / timm layout (`conv1`, `bn1`,
//! `layer{1..4}.{0,1}.{conv1,bn1,conv2,bn2,downsample.{0,1}}`), so ImageNet
//! safetensors exports load directly. Any `fc.*` tensors are ignored.

use candle_core::{Result, Tensor, D};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

const BN_EPS: f64 = 1e-5;

fn conv(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    candle_nn::conv2d_no_bias(c_in, c_out, kernel, cfg, vb)
}

struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let downsample = if stride != 1 || c_in != c_out {
            let ds = vb.pp("downsample");
            Some((
                conv(c_in, c_out, 1, 0, stride, ds.pp("0"))?,
                candle_nn::batch_norm(c_out, BN_EPS, ds.pp("1"))?,
            ))
        } else {
            None
        };
        Ok(Self {
            conv1: conv(c_in, c_out, 3, 1, stride, vb.pp("conv1"))?,
            bn1: candle_nn::batch_norm(c_out, BN_EPS, vb.pp("bn1"))?,
            conv2: conv(c_out, c_out, 3, 1, 1, vb.pp("conv2"))?,
            bn2: candle_nn::batch_norm(c_out, BN_EPS, vb.pp("bn2"))?,
            downsample,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .apply(&self.conv2)?
            .apply_t(&self.bn2, false)?;
        let shortcut = match &self.downsample {
            Some((conv, bn)) => xs.apply(conv)?.apply_t(bn, false)?,
            None => xs.clone(),
        };
        (shortcut + ys)?.relu()
    }
}

pub struct ResNet18 {
    conv1: Conv2d,
    bn1: BatchNorm,
    blocks: Vec<BasicBlock>,
    width: usize,
}

impl ResNet18 {
    /// `width` is the stem's channel count: 64 for the published weights.
    pub fn new(width: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv(3, width, 7, 3, 2, vb.pp("conv1"))?;
        let bn1 = candle_nn::batch_norm(width, BN_EPS, vb.pp("bn1"))?;

        let mut blocks = Vec::with_capacity(8);
        let mut c_in = width;
        for (layer, multiplier) in [1usize, 2, 4, 8].into_iter().enumerate() {
            let c_out = width * multiplier;
            let stride = if layer == 0 { 1 } else { 2 };
            let lvb = vb.pp(format!("layer{}", layer + 1));
            blocks.push(BasicBlock::new(c_in, c_out, stride, lvb.pp("0"))?);
            blocks.push(BasicBlock::new(c_out, c_out, 1, lvb.pp("1"))?);
            c_in = c_out;
        }
        Ok(Self {
            conv1,
            bn1,
            blocks,
            width,
        })
    }

    /// Channels of the `layer4` activation.
    pub fn out_channels(&self) -> usize {
        self.width * 8
    }

    /// `layer4` activation: `(N, 8 * width, H/32, W/32)`.
    pub fn feature_map(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }
}
