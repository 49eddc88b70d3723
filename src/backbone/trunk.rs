//! The trunk collaborator: a stack of named convolutional stages.

use std::fmt;

use crate::tensor::Tensor;

/// Named sequential stage of a classification-style CNN trunk.
///
/// Stages run in declaration order; each maps a `[B, C, H, W]` tensor to a
/// tensor of equal or smaller spatial resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Input convolution, normalization, activation and pooling (stride 4)
    Stem,
    /// First residual stage (stride 4)
    Layer1,
    /// Second residual stage (stride 8)
    Layer2,
    /// Third residual stage (stride 16)
    Layer3,
    /// Fourth residual stage (stride 32, or 16 when dilated)
    Layer4,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Stem,
        Stage::Layer1,
        Stage::Layer2,
        Stage::Layer3,
        Stage::Layer4,
    ];

    /// State-dict style name (`stem`, `layer1`, ...).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Stage::Stem => "stem",
            Stage::Layer1 => "layer1",
            Stage::Layer2 => "layer2",
            Stage::Layer3 => "layer3",
            Stage::Layer4 => "layer4",
        }
    }

    /// Position in [`Stage::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Total stride of this stage's output relative to the input image.
    ///
    /// With `dilated`, the last stage keeps the resolution of the stage
    /// before it.
    #[must_use]
    pub fn stride(self, dilated: bool) -> usize {
        match self {
            Stage::Stem | Stage::Layer1 => 4,
            Stage::Layer2 => 8,
            Stage::Layer3 => 16,
            Stage::Layer4 if dilated => 16,
            Stage::Layer4 => 32,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A convolutional trunk the extractor can tap.
///
/// Implementations must be pure functions of their (frozen) parameters:
/// running the same stage on the same input twice yields identical output.
pub trait Trunk: Send + Sync {
    /// Run one stage on the output of the previous stage (or the images for
    /// [`Stage::Stem`]).
    fn run_stage(&self, stage: Stage, input: &Tensor) -> Tensor;

    /// Channel count emitted by `stage`.
    fn out_channels(&self, stage: Stage) -> usize;

    /// Channel count the stem expects (RGB by default).
    fn in_channels(&self) -> usize {
        3
    }

    /// Whether the last stage trades its stride for dilation.
    fn dilated_last_stage(&self) -> bool {
        false
    }

    /// Human-readable variant name, used in error messages.
    fn name(&self) -> String {
        "custom".to_string()
    }
}
