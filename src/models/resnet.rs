//! ResNet trunks with frozen batch normalization.
//!
//! Layout and state names follow `torchvision.models.resnet`, so converted
//! ImageNet checkpoints load without renaming:
//!
//! ```text
//! conv1 -> bn1 -> relu -> maxpool          (stem, stride 4)
//! layer1 .. layer4                         (strides 4, 8, 16, 32)
//! layer{i}.{j}.conv{k} / bn{k}             (block convolutions)
//! layer{i}.0.downsample.{0,1}              (projection shortcut)
//! ```
//!
//! # References
//!
//! - He, K., et al. (2016). Deep residual learning for image recognition. CVPR.
//! - Yu, F., & Koltun, V. (2016). Multi-scale context aggregation by dilated
//!   convolutions. ICLR.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backbone::{Stage, Trunk};
use crate::error::{BackboneError, Result};
use crate::nn::serialize::{StateDict, StateLoader};
use crate::nn::{state_key, Conv2d, FrozenBatchNorm2d, MaxPool2d, Module, ReLU, Sequential};
use crate::tensor::Tensor;

/// Supported ResNet depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResNetVariant {
    /// 18 layers, basic blocks
    ResNet18,
    /// 34 layers, basic blocks
    ResNet34,
    /// 50 layers, bottleneck blocks
    #[default]
    ResNet50,
    /// 101 layers, bottleneck blocks
    ResNet101,
    /// 152 layers, bottleneck blocks
    ResNet152,
}

impl ResNetVariant {
    /// Blocks per residual stage.
    #[must_use]
    pub fn block_counts(self) -> [usize; 4] {
        match self {
            Self::ResNet18 => [2, 2, 2, 2],
            Self::ResNet34 | Self::ResNet50 => [3, 4, 6, 3],
            Self::ResNet101 => [3, 4, 23, 3],
            Self::ResNet152 => [3, 8, 36, 3],
        }
    }

    /// Whether the variant is built from bottleneck blocks.
    #[must_use]
    pub fn uses_bottleneck(self) -> bool {
        !matches!(self, Self::ResNet18 | Self::ResNet34)
    }

    /// Output channels over input width of one block.
    #[must_use]
    pub fn expansion(self) -> usize {
        if self.uses_bottleneck() {
            4
        } else {
            1
        }
    }

    /// Channels emitted by each stage, stem first.
    #[must_use]
    pub fn stage_channels(self) -> [usize; 5] {
        let e = self.expansion();
        [64, 64 * e, 128 * e, 256 * e, 512 * e]
    }

    /// Lowercase name (`resnet50`).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ResNet18 => "resnet18",
            Self::ResNet34 => "resnet34",
            Self::ResNet50 => "resnet50",
            Self::ResNet101 => "resnet101",
            Self::ResNet152 => "resnet152",
        }
    }
}

impl fmt::Display for ResNetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResNetVariant {
    type Err = BackboneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resnet18" => Ok(Self::ResNet18),
            "resnet34" => Ok(Self::ResNet34),
            "resnet50" => Ok(Self::ResNet50),
            "resnet101" => Ok(Self::ResNet101),
            "resnet152" => Ok(Self::ResNet152),
            other => Err(BackboneError::UnsupportedVariant {
                variant: other.to_string(),
                reason: "unknown backbone name".to_string(),
            }),
        }
    }
}

/// Per-layer seeds derived from one base seed.
struct SeedSequence {
    base: Option<u64>,
    next: u64,
}

impl SeedSequence {
    fn new(base: Option<u64>) -> Self {
        Self { base, next: 0 }
    }

    fn next(&mut self) -> Option<u64> {
        let seed = self.base.map(|b| b.wrapping_add(self.next));
        self.next += 1;
        seed
    }
}

fn conv3x3(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    dilation: usize,
    seeds: &mut SeedSequence,
) -> Conv2d {
    Conv2d::with_options(
        in_planes,
        out_planes,
        (3, 3),
        (stride, stride),
        (dilation, dilation),
        false,
        seeds.next(),
    )
    .with_dilation((dilation, dilation))
}

fn conv1x1(in_planes: usize, out_planes: usize, stride: usize, seeds: &mut SeedSequence) -> Conv2d {
    Conv2d::with_options(
        in_planes,
        out_planes,
        (1, 1),
        (stride, stride),
        (0, 0),
        false,
        seeds.next(),
    )
}

/// Two 3x3 convolutions with an identity (or projected) shortcut.
pub struct BasicBlock {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    conv2: Conv2d,
    bn2: FrozenBatchNorm2d,
    downsample: Option<Sequential>,
}

impl BasicBlock {
    fn new(
        inplanes: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Sequential>,
        seeds: &mut SeedSequence,
    ) -> Self {
        Self {
            conv1: conv3x3(inplanes, planes, stride, 1, seeds),
            bn1: FrozenBatchNorm2d::new(planes),
            conv2: conv3x3(planes, planes, 1, 1, seeds),
            bn2: FrozenBatchNorm2d::new(planes),
            downsample,
        }
    }
}

impl Module for BasicBlock {
    fn forward(&self, input: &Tensor) -> Tensor {
        let out = self.bn1.forward(&self.conv1.forward(input)).relu();
        let out = self.bn2.forward(&self.conv2.forward(&out));
        let identity = match &self.downsample {
            Some(ds) => ds.forward(input),
            None => input.clone(),
        };
        out.add(&identity).relu()
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.conv2.parameters());
        if let Some(ds) = &self.downsample {
            params.extend(ds.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.conv2.parameters_mut());
        if let Some(ds) = &mut self.downsample {
            params.extend(ds.parameters_mut());
        }
        params
    }

    fn visit_state(&self, prefix: &str, visitor: &mut dyn FnMut(String, &Tensor)) {
        self.conv1.visit_state(&state_key(prefix, "conv1"), visitor);
        self.bn1.visit_state(&state_key(prefix, "bn1"), visitor);
        self.conv2.visit_state(&state_key(prefix, "conv2"), visitor);
        self.bn2.visit_state(&state_key(prefix, "bn2"), visitor);
        if let Some(ds) = &self.downsample {
            ds.visit_state(&state_key(prefix, "downsample"), visitor);
        }
    }

    fn load_state(&mut self, loader: &mut StateLoader<'_>, prefix: &str) -> Result<()> {
        self.conv1.load_state(loader, &state_key(prefix, "conv1"))?;
        self.bn1.load_state(loader, &state_key(prefix, "bn1"))?;
        self.conv2.load_state(loader, &state_key(prefix, "conv2"))?;
        self.bn2.load_state(loader, &state_key(prefix, "bn2"))?;
        if let Some(ds) = &mut self.downsample {
            ds.load_state(loader, &state_key(prefix, "downsample"))?;
        }
        Ok(())
    }
}

/// 1x1 reduce, 3x3 (strided, possibly dilated), 1x1 expand, plus shortcut.
///
/// The stride sits on the 3x3 convolution (the "ResNet v1.5" placement).
pub struct Bottleneck {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    conv2: Conv2d,
    bn2: FrozenBatchNorm2d,
    conv3: Conv2d,
    bn3: FrozenBatchNorm2d,
    downsample: Option<Sequential>,
}

impl Bottleneck {
    const EXPANSION: usize = 4;

    fn new(
        inplanes: usize,
        planes: usize,
        stride: usize,
        dilation: usize,
        downsample: Option<Sequential>,
        seeds: &mut SeedSequence,
    ) -> Self {
        let out = planes * Self::EXPANSION;
        Self {
            conv1: conv1x1(inplanes, planes, 1, seeds),
            bn1: FrozenBatchNorm2d::new(planes),
            conv2: conv3x3(planes, planes, stride, dilation, seeds),
            bn2: FrozenBatchNorm2d::new(planes),
            conv3: conv1x1(planes, out, 1, seeds),
            bn3: FrozenBatchNorm2d::new(out),
            downsample,
        }
    }
}

impl Module for Bottleneck {
    fn forward(&self, input: &Tensor) -> Tensor {
        let out = self.bn1.forward(&self.conv1.forward(input)).relu();
        let out = self.bn2.forward(&self.conv2.forward(&out)).relu();
        let out = self.bn3.forward(&self.conv3.forward(&out));
        let identity = match &self.downsample {
            Some(ds) => ds.forward(input),
            None => input.clone(),
        };
        out.add(&identity).relu()
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.conv2.parameters());
        params.extend(self.conv3.parameters());
        if let Some(ds) = &self.downsample {
            params.extend(ds.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.conv2.parameters_mut());
        params.extend(self.conv3.parameters_mut());
        if let Some(ds) = &mut self.downsample {
            params.extend(ds.parameters_mut());
        }
        params
    }

    fn visit_state(&self, prefix: &str, visitor: &mut dyn FnMut(String, &Tensor)) {
        self.conv1.visit_state(&state_key(prefix, "conv1"), visitor);
        self.bn1.visit_state(&state_key(prefix, "bn1"), visitor);
        self.conv2.visit_state(&state_key(prefix, "conv2"), visitor);
        self.bn2.visit_state(&state_key(prefix, "bn2"), visitor);
        self.conv3.visit_state(&state_key(prefix, "conv3"), visitor);
        self.bn3.visit_state(&state_key(prefix, "bn3"), visitor);
        if let Some(ds) = &self.downsample {
            ds.visit_state(&state_key(prefix, "downsample"), visitor);
        }
    }

    fn load_state(&mut self, loader: &mut StateLoader<'_>, prefix: &str) -> Result<()> {
        self.conv1.load_state(loader, &state_key(prefix, "conv1"))?;
        self.bn1.load_state(loader, &state_key(prefix, "bn1"))?;
        self.conv2.load_state(loader, &state_key(prefix, "conv2"))?;
        self.bn2.load_state(loader, &state_key(prefix, "bn2"))?;
        self.conv3.load_state(loader, &state_key(prefix, "conv3"))?;
        self.bn3.load_state(loader, &state_key(prefix, "bn3"))?;
        if let Some(ds) = &mut self.downsample {
            ds.load_state(loader, &state_key(prefix, "downsample"))?;
        }
        Ok(())
    }
}

/// Residual trunk without the classification head.
///
/// # Example
///
/// ```no_run
/// use masked_backbone::backbone::{Stage, Trunk};
/// use masked_backbone::models::{ResNet, ResNetVariant};
/// use masked_backbone::tensor::Tensor;
///
/// let trunk = ResNet::new(ResNetVariant::ResNet50, false, Some(0)).unwrap();
/// let x = trunk.run_stage(Stage::Stem, &Tensor::zeros(&[1, 3, 64, 64]));
/// assert_eq!(x.shape(), &[1, 64, 16, 16]);
/// ```
pub struct ResNet {
    variant: ResNetVariant,
    dilation: bool,
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    relu: ReLU,
    maxpool: MaxPool2d,
    layers: [Sequential; 4],
}

impl ResNet {
    /// Build a trunk with seeded random weights and identity normalization.
    ///
    /// With `dilation`, `layer4` replaces its stride with dilation 2.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::UnsupportedVariant`] when dilation is
    /// requested for a basic-block variant.
    pub fn new(variant: ResNetVariant, dilation: bool, seed: Option<u64>) -> Result<Self> {
        if dilation && !variant.uses_bottleneck() {
            return Err(BackboneError::UnsupportedVariant {
                variant: variant.to_string(),
                reason: "dilation is only supported with bottleneck blocks".to_string(),
            });
        }

        let mut seeds = SeedSequence::new(seed);
        let conv1 = Conv2d::with_options(3, 64, (7, 7), (2, 2), (3, 3), false, seeds.next());

        let counts = variant.block_counts();
        let mut builder = LayerBuilder {
            variant,
            inplanes: 64,
            dilation: 1,
            seeds,
        };
        let layers = [
            builder.make_layer(64, counts[0], 1, false),
            builder.make_layer(128, counts[1], 2, false),
            builder.make_layer(256, counts[2], 2, false),
            builder.make_layer(512, counts[3], 2, dilation),
        ];

        debug!(%variant, dilation, "built resnet trunk");
        Ok(Self {
            variant,
            dilation,
            conv1,
            bn1: FrozenBatchNorm2d::new(64),
            relu: ReLU::new(),
            maxpool: MaxPool2d::new(3, 2, 1),
            layers,
        })
    }

    /// The depth variant.
    #[must_use]
    pub fn variant(&self) -> ResNetVariant {
        self.variant
    }

    /// Load an ImageNet-style checkpoint.
    ///
    /// Classifier keys (`fc.*`) are skipped; every other key must be
    /// consumed and every trunk tensor must be present.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::MissingParameter`],
    /// [`BackboneError::ShapeMismatch`] or
    /// [`BackboneError::UnexpectedParameters`].
    pub fn load_pretrained(&mut self, state: &StateDict) -> Result<()> {
        let mut loader = StateLoader::new(state);
        self.load_state(&mut loader, "")?;
        let skipped = loader.discard_prefix("fc");
        let unexpected = loader.unconsumed();
        if !unexpected.is_empty() {
            return Err(BackboneError::UnexpectedParameters(unexpected));
        }
        debug!(variant = %self.variant, skipped, "loaded pretrained weights");
        Ok(())
    }

    /// Clear the gradient flag on every tensor.
    pub fn freeze(&mut self) {
        for param in self.parameters_mut() {
            param.requires_grad_(false);
        }
    }
}

struct LayerBuilder {
    variant: ResNetVariant,
    inplanes: usize,
    dilation: usize,
    seeds: SeedSequence,
}

impl LayerBuilder {
    fn make_layer(&mut self, planes: usize, blocks: usize, stride: usize, dilate: bool) -> Sequential {
        let expansion = self.variant.expansion();
        let previous_dilation = self.dilation;
        let mut stride = stride;
        if dilate {
            self.dilation *= stride;
            stride = 1;
        }

        let downsample = (stride != 1 || self.inplanes != planes * expansion).then(|| {
            Sequential::new()
                .add(conv1x1(self.inplanes, planes * expansion, stride, &mut self.seeds))
                .add(FrozenBatchNorm2d::new(planes * expansion))
        });

        let mut layer = Sequential::new();
        if self.variant.uses_bottleneck() {
            layer = layer.add(Bottleneck::new(
                self.inplanes,
                planes,
                stride,
                previous_dilation,
                downsample,
                &mut self.seeds,
            ));
        } else {
            layer = layer.add(BasicBlock::new(
                self.inplanes,
                planes,
                stride,
                downsample,
                &mut self.seeds,
            ));
        }
        self.inplanes = planes * expansion;

        for _ in 1..blocks {
            layer = if self.variant.uses_bottleneck() {
                layer.add(Bottleneck::new(
                    self.inplanes,
                    planes,
                    1,
                    self.dilation,
                    None,
                    &mut self.seeds,
                ))
            } else {
                layer.add(BasicBlock::new(self.inplanes, planes, 1, None, &mut self.seeds))
            };
        }
        layer
    }
}

impl Trunk for ResNet {
    fn run_stage(&self, stage: Stage, input: &Tensor) -> Tensor {
        match stage {
            Stage::Stem => {
                let x = self.bn1.forward(&self.conv1.forward(input));
                self.maxpool.forward(&self.relu.forward(&x))
            }
            Stage::Layer1 => self.layers[0].forward(input),
            Stage::Layer2 => self.layers[1].forward(input),
            Stage::Layer3 => self.layers[2].forward(input),
            Stage::Layer4 => self.layers[3].forward(input),
        }
    }

    fn out_channels(&self, stage: Stage) -> usize {
        self.variant.stage_channels()[stage.index()]
    }

    fn in_channels(&self) -> usize {
        self.conv1.in_channels()
    }

    fn dilated_last_stage(&self) -> bool {
        self.dilation
    }

    fn name(&self) -> String {
        self.variant.to_string()
    }
}

impl Module for ResNet {
    fn forward(&self, input: &Tensor) -> Tensor {
        Stage::ALL
            .iter()
            .fold(input.clone(), |x, &stage| self.run_stage(stage, &x))
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.parameters();
        for layer in &self.layers {
            params.extend(layer.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.conv1.parameters_mut();
        for layer in &mut self.layers {
            params.extend(layer.parameters_mut());
        }
        params
    }

    fn visit_state(&self, prefix: &str, visitor: &mut dyn FnMut(String, &Tensor)) {
        self.conv1.visit_state(&state_key(prefix, "conv1"), visitor);
        self.bn1.visit_state(&state_key(prefix, "bn1"), visitor);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_state(&state_key(prefix, &format!("layer{}", i + 1)), visitor);
        }
    }

    fn load_state(&mut self, loader: &mut StateLoader<'_>, prefix: &str) -> Result<()> {
        self.conv1.load_state(loader, &state_key(prefix, "conv1"))?;
        self.bn1.load_state(loader, &state_key(prefix, "bn1"))?;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.load_state(loader, &state_key(prefix, &format!("layer{}", i + 1)))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResNet")
            .field("variant", &self.variant)
            .field("dilation", &self.dilation)
            .finish_non_exhaustive()
    }
}
