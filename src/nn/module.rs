//! The [`Module`] trait shared by every layer.

use super::serialize::StateLoader;
use crate::error::Result;
use crate::tensor::Tensor;

/// A network layer or composition of layers.
///
/// Modules are `Send + Sync`: once built and loaded, a module is only read
/// during `forward`, so one instance can serve concurrent callers.
///
/// # State
///
/// Besides `parameters`, a module exposes its *named* state (parameters and
/// buffers such as running statistics) through [`Module::visit_state`] and
/// restores it through [`Module::load_state`]. Names are dot-joined paths
/// (`layer1.0.conv1.weight`), matching the layout of exported checkpoints.
pub trait Module: Send + Sync {
    /// Forward pass.
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Tensors an optimizer would update. Buffers are not included.
    fn parameters(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    /// Mutable access to [`Module::parameters`].
    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }

    /// Call `visitor` with the full name of every persisted tensor.
    fn visit_state(&self, _prefix: &str, _visitor: &mut dyn FnMut(String, &Tensor)) {}

    /// Restore every persisted tensor from `loader`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor is missing or has the wrong shape.
    fn load_state(&mut self, _loader: &mut StateLoader<'_>, _prefix: &str) -> Result<()> {
        Ok(())
    }

    /// Switch to training mode.
    fn train(&mut self) {}

    /// Switch to evaluation mode.
    fn eval(&mut self) {}

    /// Whether the module is in training mode.
    fn training(&self) -> bool {
        false
    }
}

/// Join a state prefix and a child name with a dot.
#[must_use]
pub fn state_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
