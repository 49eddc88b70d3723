//! Container modules for composing networks.

use super::module::{state_key, Module};
use super::serialize::StateLoader;
use crate::error::Result;
use crate::tensor::Tensor;

/// Sequential container for chaining modules.
///
/// Modules are executed in order, with each module's output becoming the
/// next module's input. Child state is named by position (`0.weight`,
/// `1.running_mean`, ...).
///
/// # Example
///
/// ```
/// use masked_backbone::nn::{Conv2d, FrozenBatchNorm2d, Module, Sequential};
/// use masked_backbone::tensor::Tensor;
///
/// let downsample = Sequential::new()
///     .add(Conv2d::with_options(64, 256, (1, 1), (1, 1), (0, 0), false, Some(0)))
///     .add(FrozenBatchNorm2d::new(256));
/// let y = downsample.forward(&Tensor::zeros(&[1, 64, 4, 4]));
/// assert_eq!(y.shape(), &[1, 256, 4, 4]);
/// ```
pub struct Sequential {
    modules: Vec<Box<dyn Module>>,
    training: bool,
}

impl Sequential {
    /// Create an empty Sequential container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            training: false,
        }
    }

    /// Add a module to the sequence.
    ///
    /// Returns self for method chaining.
    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn add<M: Module + 'static>(mut self, module: M) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    /// Get the number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Check if the container is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.modules
            .iter()
            .fold(input.clone(), |x, module| module.forward(&x))
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.modules.iter().flat_map(|m| m.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.modules
            .iter_mut()
            .flat_map(|m| m.parameters_mut())
            .collect()
    }

    fn visit_state(&self, prefix: &str, visitor: &mut dyn FnMut(String, &Tensor)) {
        for (i, module) in self.modules.iter().enumerate() {
            module.visit_state(&state_key(prefix, &i.to_string()), visitor);
        }
    }

    fn load_state(&mut self, loader: &mut StateLoader<'_>, prefix: &str) -> Result<()> {
        for (i, module) in self.modules.iter_mut().enumerate() {
            module.load_state(loader, &state_key(prefix, &i.to_string()))?;
        }
        Ok(())
    }

    fn train(&mut self) {
        self.training = true;
        for module in &mut self.modules {
            module.train();
        }
    }

    fn eval(&mut self) {
        self.training = false;
        for module in &mut self.modules {
            module.eval();
        }
    }

    fn training(&self) -> bool {
        self.training
    }
}

impl std::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequential")
            .field("num_modules", &self.modules.len())
            .field("training", &self.training)
            .finish()
    }
}
