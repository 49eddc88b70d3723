//! Named-state persistence for nn modules.
//!
//! A module's state is the set of tensors reported by
//! [`Module::visit_state`], keyed by dotted path. The layout matches
//! checkpoints exported from `PyTorch`, so a `ResNet` state dict can be
//! loaded straight from a converted `.safetensors` file.
//!
//! # Example
//!
//! ```no_run
//! use masked_backbone::nn::serialize::{load_state_dict, load_state_dict_file, save_model};
//! use masked_backbone::nn::FrozenBatchNorm2d;
//!
//! let bn = FrozenBatchNorm2d::new(64);
//! save_model(&bn, "bn.safetensors").unwrap();
//!
//! let mut restored = FrozenBatchNorm2d::new(64);
//! let state = load_state_dict_file("bn.safetensors").unwrap();
//! load_state_dict(&mut restored, &state, true).unwrap();
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::module::Module;
use crate::error::{BackboneError, Result};
use crate::serialization::safetensors::{
    extract_tensor, load_safetensors, save_safetensors, save_safetensors_typed,
};
use crate::tensor::{DType, Tensor};

/// State dictionary: mapping from parameter names to tensor data and shapes.
pub type StateDict = BTreeMap<String, (Vec<f32>, Vec<usize>)>;

/// Cursor over a [`StateDict`] that records which keys were consumed.
///
/// Modules pull their tensors with [`StateLoader::take`]; after loading,
/// [`StateLoader::unconsumed`] reports keys no module asked for.
#[derive(Debug)]
pub struct StateLoader<'a> {
    state: &'a StateDict,
    consumed: BTreeSet<&'a str>,
}

impl<'a> StateLoader<'a> {
    /// Start loading from `state`.
    #[must_use]
    pub fn new(state: &'a StateDict) -> Self {
        Self {
            state,
            consumed: BTreeSet::new(),
        }
    }

    /// Take the tensor stored under `key`, checking its shape.
    ///
    /// The returned tensor is frozen (`requires_grad == false`).
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::MissingParameter`] if the key is absent and
    /// [`BackboneError::ShapeMismatch`] if the stored shape differs.
    pub fn take(&mut self, key: &str, expected_shape: &[usize]) -> Result<Tensor> {
        let (stored_key, (data, shape)) = self
            .state
            .get_key_value(key)
            .ok_or_else(|| BackboneError::MissingParameter(key.to_string()))?;

        if shape.as_slice() != expected_shape {
            return Err(BackboneError::shape_mismatch(key, expected_shape, shape));
        }
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(BackboneError::shape_mismatch(key, &[numel], &[data.len()]));
        }

        self.consumed.insert(stored_key.as_str());
        Ok(Tensor::new(data, shape))
    }

    /// Mark `key` consumed without reading it. Returns whether it existed.
    pub fn discard(&mut self, key: &str) -> bool {
        match self.state.get_key_value(key) {
            Some((stored_key, _)) => {
                self.consumed.insert(stored_key.as_str());
                true
            }
            None => false,
        }
    }

    /// Mark every key under `prefix.` consumed. Returns how many there were.
    pub fn discard_prefix(&mut self, prefix: &str) -> usize {
        let dotted = format!("{prefix}.");
        let mut count = 0;
        for key in self.state.keys().filter(|k| k.starts_with(&dotted)) {
            self.consumed.insert(key.as_str());
            count += 1;
        }
        count
    }

    /// Keys nothing consumed, in sorted order.
    #[must_use]
    pub fn unconsumed(&self) -> Vec<String> {
        self.state
            .keys()
            .filter(|k| !self.consumed.contains(k.as_str()))
            .cloned()
            .collect()
    }
}

/// Extract the named state of a module.
///
/// # Arguments
///
/// * `module` - The module to extract state from
/// * `prefix` - Prefix for every name (empty for the root module)
pub fn state_dict<M: Module + ?Sized>(module: &M, prefix: &str) -> StateDict {
    let mut state = StateDict::new();
    module.visit_state(prefix, &mut |name, tensor| {
        state.insert(name, (tensor.data().to_vec(), tensor.shape().to_vec()));
    });
    state
}

/// Load a state dictionary into a module.
///
/// Every tensor the module needs must be present with the right shape. With
/// `strict`, keys the module did not consume are an error as well.
///
/// # Errors
///
/// Returns [`BackboneError::MissingParameter`],
/// [`BackboneError::ShapeMismatch`] or, with `strict`,
/// [`BackboneError::UnexpectedParameters`].
pub fn load_state_dict<M: Module + ?Sized>(
    module: &mut M,
    state: &StateDict,
    strict: bool,
) -> Result<()> {
    let mut loader = StateLoader::new(state);
    module.load_state(&mut loader, "")?;
    if strict {
        let unexpected = loader.unconsumed();
        if !unexpected.is_empty() {
            return Err(BackboneError::UnexpectedParameters(unexpected));
        }
    }
    Ok(())
}

/// Save a module's named state to a SafeTensors file as F32.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_model<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> Result<()> {
    save_safetensors(path, &state_dict(module, ""))
}

/// Save a module's named state with every tensor encoded as `dtype`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_model_as<M: Module + ?Sized, P: AsRef<Path>>(
    module: &M,
    path: P,
    dtype: DType,
) -> Result<()> {
    save_safetensors_typed(path, &state_dict(module, ""), dtype)
}

/// Read a SafeTensors file into a state dictionary.
///
/// # Errors
///
/// Returns an error if the file is unreadable or malformed.
pub fn load_state_dict_file<P: AsRef<Path>>(path: P) -> Result<StateDict> {
    let (metadata, raw_data) = load_safetensors(path)?;

    let mut state = StateDict::new();
    for (name, tensor_meta) in metadata {
        let data = extract_tensor(&raw_data, &tensor_meta)?;
        state.insert(name, (data, tensor_meta.shape));
    }
    Ok(state)
}
