//! Serializable model snapshot
//!
//! A snapshot is the ordered list of named parameter tensors every run
//! starts from. It round-trips through JSON, and `init_mlp` builds one
//! deterministically from an explicit seed.

use std::fs;
use std::path::Path;

use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::nn::layout::ParamLayout;
use crate::nn::mlp::MlpConfig;

/// One parameter tensor, row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NamedTensor {
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            values: vec![0.0; numel],
        }
    }
}

#[derive(Deserialize)]
struct RawSnapshot {
    tensors: Vec<NamedTensor>,
}

/// Immutable set of trainable parameter values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSnapshot")]
pub struct ModelSnapshot {
    tensors: Vec<NamedTensor>,
}

impl TryFrom<RawSnapshot> for ModelSnapshot {
    type Error = Error;

    fn try_from(raw: RawSnapshot) -> Result<Self> {
        Self::new(raw.tensors)
    }
}

impl ModelSnapshot {
    /// Validate names, shapes and value counts.
    pub fn new(tensors: Vec<NamedTensor>) -> Result<Self> {
        if tensors.is_empty() {
            return Err(Error::ModelError {
                reason: "snapshot has no tensors".to_string(),
            });
        }
        for t in &tensors {
            let numel: usize = t.shape.iter().product();
            if numel != t.values.len() {
                return Err(Error::ModelError {
                    reason: format!(
                        "tensor '{}' has shape {:?} ({numel} elements) but {} values",
                        t.name,
                        t.shape,
                        t.values.len()
                    ),
                });
            }
        }
        let snapshot = Self { tensors };
        // duplicate names and empty shapes
        snapshot.layout()?;
        Ok(snapshot)
    }

    /// Fresh MLP parameters: Xavier-uniform weights, zero biases.
    pub fn init_mlp(config: &MlpConfig, seed: u64) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut tensors = Vec::new();
        for (name, shape) in config.param_specs() {
            let mut tensor = NamedTensor::zeros(name, shape);
            if let [fan_in, fan_out] = tensor.shape[..] {
                let limit = (6.0 / (fan_in + fan_out) as f64).sqrt() as f32;
                let dist = Uniform::new_inclusive(-limit, limit);
                for v in tensor.values.iter_mut() {
                    *v = dist.sample(&mut rng);
                }
            }
            tensors.push(tensor);
        }
        Self::new(tensors)
    }

    pub fn tensors(&self) -> &[NamedTensor] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.tensors.iter().map(|t| t.values.len()).sum()
    }

    /// Layout of the flat buffer produced by [`flatten`](Self::flatten).
    pub fn layout(&self) -> Result<ParamLayout> {
        ParamLayout::new(self.tensors.iter().map(|t| (t.name.clone(), t.shape.clone())))
    }

    /// Concatenate all tensors in snapshot order.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.num_params());
        for t in &self.tensors {
            flat.extend_from_slice(&t.values);
        }
        flat
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_mlp_is_deterministic() {
        let config = MlpConfig::new(8);
        let a = ModelSnapshot::init_mlp(&config, 2022).unwrap();
        let b = ModelSnapshot::init_mlp(&config, 2022).unwrap();
        let c = ModelSnapshot::init_mlp(&config, 7).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_init_mlp_shapes_and_ranges() {
        let config = MlpConfig::new(8);
        let snap = ModelSnapshot::init_mlp(&config, 1).unwrap();
        assert_eq!(snap.tensors().len(), 6);
        assert_eq!(snap.num_params(), 8 * 8 + 8 + 8 * 8 + 8 + 8 * 10 + 10);

        let bias = snap.get("linear1.bias").unwrap();
        assert!(bias.values.iter().all(|&v| v == 0.0));

        let w = snap.get("linear3.weight").unwrap();
        let limit = (6.0f64 / 18.0).sqrt() as f32;
        assert!(w.values.iter().all(|v| v.abs() <= limit));
        assert!(w.values.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_flatten_matches_layout() {
        let snap = ModelSnapshot::init_mlp(&MlpConfig::new(4), 3).unwrap();
        let layout = snap.layout().unwrap();
        let flat = snap.flatten();
        assert_eq!(flat.len(), layout.total_numel());
        let idx = layout.index_of("linear2.weight").unwrap();
        assert_eq!(layout.slice(&flat, idx).unwrap(), &snap.get("linear2.weight").unwrap().values[..]);
    }

    #[test]
    fn test_new_rejects_inconsistent_tensors() {
        let bad = NamedTensor {
            name: "w".to_string(),
            shape: vec![2, 2],
            values: vec![0.0; 3],
        };
        assert!(ModelSnapshot::new(vec![bad]).is_err());
        assert!(ModelSnapshot::new(vec![]).is_err());
        let dup = vec![NamedTensor::zeros("w", vec![1]), NamedTensor::zeros("w", vec![2])];
        assert!(ModelSnapshot::new(dup).is_err());
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let snap = ModelSnapshot::init_mlp(&MlpConfig::new(3), 11).unwrap();
        snap.save_json(&path).unwrap();
        let loaded = ModelSnapshot::load_json(&path).unwrap();
        assert_eq!(snap, loaded);
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{"tensors":[{"name":"w","shape":[2],"values":[1.0]}]}"#;
        assert!(serde_json::from_str::<ModelSnapshot>(json).is_err());
    }
}
