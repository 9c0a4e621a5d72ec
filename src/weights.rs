// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Lookup of persisted tensors by name.

use std::collections::HashMap;

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};

use crate::error::{Result, RotaryError};

/// Source of named tensors, such as a checkpoint.
pub trait WeightSource {
    /// Fetch `name` onto `device` in its stored precision.
    ///
    /// # Errors
    /// Returns `MissingWeight` if no tensor has that name.
    fn get_tensor(&self, name: &str, device: &Device) -> Result<Tensor>;

    /// Fetch `name` onto `device` as `f32`, whatever the stored precision.
    ///
    /// # Errors
    /// Returns `MissingWeight` if no tensor has that name.
    fn get_tensor_f32(&self, name: &str, device: &Device) -> Result<Tensor> {
        Ok(self.get_tensor(name, device)?.to_dtype(DType::F32)?)
    }
}

impl WeightSource for HashMap<String, Tensor> {
    fn get_tensor(&self, name: &str, device: &Device) -> Result<Tensor> {
        let tensor = self
            .get(name)
            .ok_or_else(|| RotaryError::MissingWeight(name.to_string()))?;
        Ok(tensor.to_device(device)?)
    }
}

impl WeightSource for MmapedSafetensors {
    fn get_tensor(&self, name: &str, device: &Device) -> Result<Tensor> {
        if self.get(name).is_err() {
            return Err(RotaryError::MissingWeight(name.to_string()));
        }
        Ok(self.load(name, device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_source_reads_f32() {
        let device = Device::Cpu;
        let stored = Tensor::new(&[1.0f32, 0.5], &device)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let mut weights = HashMap::new();
        weights.insert("rotary.inv_freq".to_string(), stored);

        let loaded = weights.get_tensor_f32("rotary.inv_freq", &device).unwrap();
        assert_eq!(loaded.dtype(), DType::F32);
        assert_eq!(loaded.to_vec1::<f32>().unwrap(), vec![1.0, 0.5]);
    }

    #[test]
    fn test_map_source_missing() {
        let weights: HashMap<String, Tensor> = HashMap::new();
        let err = weights.get_tensor("absent", &Device::Cpu).unwrap_err();
        assert!(matches!(err, RotaryError::MissingWeight(name) if name == "absent"));
    }
}
