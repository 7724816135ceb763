// src/interpretation/gradcam.rs
use anyhow::{anyhow, Context, Result};
use candle_core::{Tensor, Var};
use image::imageops::FilterType;
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::Array1;
use std::path::Path;

use crate::embedding::Backbone;
use crate::models::artifact::{ModelArtifact, ModelKind, SchemaError};
use crate::training::features::to_price;
use crate::utils::candle::flatten_to_vec;

/// Normalised class-activation map over the last convolution's spatial grid.
#[derive(Debug, Clone)]
pub struct GradCamMap {
    /// Row-major, values in `[0, 1]`.
    pub values: Vec<f32>,
    pub width: usize,
    pub height: usize,
    pub predicted_price: f64,
}

/// Grad-CAM for an image-only ridge model: the gradient of the model output
/// with respect to the last activation, averaged spatially, weights each
/// channel; the map is the ReLU of the weighted channel sum.
pub fn grad_cam(
    backbone: &Backbone,
    artifact: &ModelArtifact,
    tile_bytes: &[u8],
) -> Result<GradCamMap> {
    if artifact.kind() != ModelKind::Image {
        return Err(anyhow!(
            "Grad-CAM needs the image model, got the {} model",
            artifact.kind()
        ));
    }
    let embedding = artifact
        .schema
        .embedding
        .as_ref()
        .ok_or(SchemaError::EmbeddingsRequired(ModelKind::Image))?;
    if embedding.dim != backbone.dim() {
        return Err(SchemaError::Mismatch {
            what: "embedding dimension",
            expected: embedding.dim.to_string(),
            found: backbone.dim().to_string(),
        }
        .into());
    }
    if embedding.backbone_fingerprint != backbone.fingerprint() {
        return Err(SchemaError::Mismatch {
            what: "backbone fingerprint",
            expected: embedding.backbone_fingerprint.clone(),
            found: backbone.fingerprint().to_string(),
        }
        .into());
    }
    let ridge = artifact
        .regressor
        .as_ridge()
        .ok_or_else(|| anyhow!("Grad-CAM needs a linear image head, got {}", artifact.regressor.describe()))?;

    let input = backbone.preprocess(tile_bytes)?;
    let feature_map = backbone.feature_map(&input)?;
    let (_, channels, height, width) = feature_map.dims4()?;
    let device = feature_map.device().clone();

    let activation = Var::from_tensor(&feature_map)?;
    let pooled = Backbone::pool(activation.as_tensor())?;

    let head = |values: &[f64]| -> Result<Tensor> {
        let data: Vec<f32> = values[..channels].iter().map(|&v| v as f32).collect();
        Ok(Tensor::from_vec(data, (1, channels), &device)?)
    };
    let output = pooled
        .broadcast_sub(&head(&ridge.means)?)?
        .broadcast_div(&head(&ridge.scales)?)?
        .broadcast_mul(&head(&ridge.weights)?)?
        .sum_all()?;
    let grads = output.backward().context("Backward pass for Grad-CAM failed")?;
    let gradient = grads
        .get(activation.as_tensor())
        .ok_or_else(|| anyhow!("No gradient reached the last convolution"))?;

    let channel_weights = gradient.mean_keepdim((2, 3))?;
    let cam = feature_map
        .broadcast_mul(&channel_weights)?
        .sum(1)?
        .relu()?;
    let mut values = flatten_to_vec(&cam)?;
    let max = values.iter().copied().fold(0f32, f32::max);
    if max > 0.0 {
        values.iter_mut().for_each(|v| *v /= max);
    }

    let mut features: Vec<f64> = flatten_to_vec(&pooled)?.into_iter().map(f64::from).collect();
    if artifact.schema.has_image_indicator() {
        features.push(1.0);
    }
    let raw = ridge.predict_row(Array1::from(features).view());

    Ok(GradCamMap {
        values,
        width,
        height,
        predicted_price: to_price(raw, artifact.log_target),
    })
}

fn jet(v: f32) -> [u8; 3] {
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Upsamples the map to the tile's size, colourises it and blends it over the tile.
pub fn render_overlay(tile_bytes: &[u8], map: &GradCamMap, opacity: f32) -> Result<RgbImage> {
    let tile = image::load_from_memory(tile_bytes)
        .context("Failed to decode tile for overlay")?
        .to_rgb8();
    let coarse = GrayImage::from_fn(map.width as u32, map.height as u32, |x, y| {
        let v = map.values[y as usize * map.width + x as usize];
        Luma([(v.clamp(0.0, 1.0) * 255.0).round() as u8])
    });
    let heat = image::imageops::resize(&coarse, tile.width(), tile.height(), FilterType::Triangle);

    let alpha = opacity.clamp(0.0, 1.0);
    Ok(RgbImage::from_fn(tile.width(), tile.height(), |x, y| {
        let base = tile.get_pixel(x, y).0;
        let color = jet(heat.get_pixel(x, y).0[0] as f32 / 255.0);
        Rgb([0, 1, 2].map(|c| {
            (base[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha).round() as u8
        }))
    }))
}

pub fn save_overlay(path: &Path, overlay: &RgbImage) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    overlay
        .save(path)
        .with_context(|| format!("Failed to write Grad-CAM overlay {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{BackboneArch, EmbeddingTable, MissingImagePolicy};
    use crate::models::artifact::{EmbeddingSchema, FeatureSchema};
    use crate::regression::{FittedRegressor, RidgeRegressor};
    use crate::testing::png_bytes;
    use candle_core::Device;
    use chrono::Utc;
    use ndarray::Array2;

    fn fixture(seed: u64) -> (Backbone, ModelArtifact) {
        let backbone = Backbone::from_tensors(
            BackboneArch::Compact,
            Backbone::seeded_tensors(seed, &Device::Cpu).unwrap(),
            32,
            &Device::Cpu,
        )
        .unwrap();
        let mut table = EmbeddingTable::new(backbone.fingerprint(), backbone.dim());
        for i in 0..12u8 {
            table
                .entries
                .insert(i as i64, backbone.embed_bytes(&png_bytes(i * 20)).unwrap());
        }
        let x = Array2::from_shape_fn((12, backbone.dim()), |(i, j)| {
            table.entries[&(i as i64)][j] as f64
        });
        let y = Array1::from_shape_fn(12, |i| 12.0 + i as f64 * 0.05);
        let ridge = RidgeRegressor::fit(&x, &y, 1.0).unwrap();

        let artifact = ModelArtifact {
            schema: FeatureSchema {
                kind: ModelKind::Image,
                tabular_columns: vec![],
                omitted_columns: vec![],
                embedding: Some(EmbeddingSchema {
                    dim: backbone.dim(),
                    backbone_fingerprint: backbone.fingerprint().to_string(),
                }),
                missing_image_policy: Some(MissingImagePolicy::Exclude),
            },
            regressor: FittedRegressor::Ridge(ridge),
            log_target: true,
            cv_scores: vec![],
            run_id: "run".into(),
            trained_at: Utc::now(),
            training_rows: 12,
            inputs_digest: None,
        };
        (backbone, artifact)
    }

    #[test]
    fn test_map_is_normalised_over_the_last_grid() {
        let (backbone, artifact) = fixture(4);
        let map = grad_cam(&backbone, &artifact, &png_bytes(77)).unwrap();
        assert_eq!((map.width, map.height), (4, 4));
        assert_eq!(map.values.len(), 16);
        assert!(map.values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(map.predicted_price > 0.0);

        let overlay = render_overlay(&png_bytes(77), &map, 0.5).unwrap();
        assert_eq!(overlay.dimensions(), (32, 32));
    }

    #[test]
    fn test_foreign_backbone_is_rejected() {
        let (_, artifact) = fixture(4);
        let (other_backbone, _) = fixture(5);
        let err = grad_cam(&other_backbone, &artifact, &png_bytes(1)).unwrap_err();
        assert!(err.to_string().contains("backbone fingerprint"));
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), [0, 0, 127]);
        assert_eq!(jet(1.0), [127, 0, 0]);
    }
}
