use anyhow::{Context, Result as AnyhowResult};
use candle_core::{DType, Device, Tensor};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

static CANDLE_DEVICE: Lazy<Device> = Lazy::new(|| {
    if std::env::var("VALUATION_FORCE_CPU").is_ok() {
        log::info!("VALUATION_FORCE_CPU set. Using Candle CPU device.");
        return Device::Cpu;
    }
    // Device::new_metal(0) tries to get the first Metal device.
    match Device::new_metal(0) {
        Ok(metal_device) => {
            if metal_device.is_metal() {
                log::info!("Successfully initialized Candle Metal device (GPU).");
                metal_device
            } else {
                log::warn!(
                    "Device::new_metal(0) succeeded but device.is_metal() is false. Using CPU."
                );
                Device::Cpu
            }
        }
        Err(err) => {
            // Not compiled with the "metal" feature, or no usable Metal device.
            log::debug!(
                "Failed to initialize Candle Metal device: {:?}. Falling back to CPU device.",
                err
            );
            log::info!("Using Candle CPU device.");
            Device::Cpu
        }
    }
});

/// The process-wide device every tensor in the pipeline lives on.
pub fn candle_device() -> &'static Device {
    &CANDLE_DEVICE
}

/// Copies any tensor back to host memory as a flat `f32` vector.
pub fn flatten_to_vec(tensor: &Tensor) -> AnyhowResult<Vec<f32>> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .with_context(|| format!("Failed to copy tensor of shape {:?} to host", tensor.shape()))
}

/// SHA-256 over named tensors, visited in name order, covering names, shapes and
/// little-endian values. Identical weights always give the same fingerprint.
pub fn tensors_fingerprint(tensors: &HashMap<String, Tensor>) -> AnyhowResult<String> {
    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();

    let mut hasher = Sha256::new();
    for name in names {
        let tensor = &tensors[name];
        hasher.update(name.as_bytes());
        for dim in tensor.dims() {
            hasher.update((*dim as u64).to_le_bytes());
        }
        for value in flatten_to_vec(tensor)? {
            hasher.update(value.to_le_bytes());
        }
    }
    Ok(hex::encode(hasher.finalize()))
}
