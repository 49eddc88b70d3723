//! Convolution and pooling layers.
//!
//! # Shape
//!
//! Both layers take `[N, C, H, W]` input. Output spatial size follows
//!
//! ```text
//! out = (in + 2 * padding - dilation * (kernel - 1) - 1) / stride + 1
//! ```
//!
//! so a stride-2 layer with "same" padding maps `n` to `ceil(n / 2)`.

use rayon::prelude::*;
use trueno::Matrix;

use super::init::{kaiming_normal, zeros};
use super::module::{state_key, Module};
use super::serialize::StateLoader;
use crate::error::Result;
use crate::tensor::Tensor;

/// Output length of a strided, padded, dilated window along one axis.
#[inline]
fn output_len(input: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> usize {
    let span = dilation * (kernel - 1) + 1;
    let padded = input + 2 * padding;
    assert!(
        padded >= span,
        "window of extent {span} does not fit input of length {input} with padding {padding}"
    );
    (padded - span) / stride + 1
}

/// 2D convolution with frozen weights.
///
/// Evaluated as im2col followed by a GEMM whose output rows (one per output
/// channel) are computed in parallel.
///
/// # Example
///
/// ```
/// use masked_backbone::nn::{Conv2d, Module};
/// use masked_backbone::tensor::Tensor;
///
/// let conv = Conv2d::with_options(3, 8, (3, 3), (2, 2), (1, 1), false, Some(0));
/// let y = conv.forward(&Tensor::zeros(&[1, 3, 9, 9]));
/// assert_eq!(y.shape(), &[1, 8, 5, 5]);
/// ```
pub struct Conv2d {
    /// Weight tensor, shape: [`out_channels`, `in_channels`, `kernel_h`, `kernel_w`]
    weight: Tensor,
    /// Bias tensor, shape: [`out_channels`], or None
    bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    kernel_h: usize,
    kernel_w: usize,
    stride_h: usize,
    stride_w: usize,
    padding_h: usize,
    padding_w: usize,
    dilation_h: usize,
    dilation_w: usize,
}

impl Conv2d {
    /// Create Conv2d with custom options and unit dilation.
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `kernel_size` - (height, width) of the kernel
    /// * `stride` - (height, width) stride
    /// * `padding` - (height, width) zero padding
    /// * `bias` - If true, adds a bias
    /// * `seed` - Optional seed for the weight initialization
    #[must_use]
    pub fn with_options(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        bias: bool,
        seed: Option<u64>,
    ) -> Self {
        let (kernel_h, kernel_w) = kernel_size;
        assert!(
            kernel_h > 0 && kernel_w > 0 && stride.0 > 0 && stride.1 > 0,
            "Conv2d kernel and stride must be positive"
        );

        // Kaiming initialization, fan-out mode
        let fan_out = out_channels * kernel_h * kernel_w;
        let weight = kaiming_normal(
            &[out_channels, in_channels, kernel_h, kernel_w],
            fan_out,
            seed,
        );

        Self {
            weight,
            bias: bias.then(|| zeros(&[out_channels])),
            in_channels,
            out_channels,
            kernel_h,
            kernel_w,
            stride_h: stride.0,
            stride_w: stride.1,
            padding_h: padding.0,
            padding_w: padding.1,
            dilation_h: 1,
            dilation_w: 1,
        }
    }

    /// Set the dilation (spacing between kernel taps).
    #[must_use]
    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        assert!(
            dilation.0 > 0 && dilation.1 > 0,
            "Conv2d dilation must be positive"
        );
        self.dilation_h = dilation.0;
        self.dilation_w = dilation.1;
        self
    }

    /// Number of input channels.
    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of output channels.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Get kernel size as (height, width).
    #[must_use]
    pub fn kernel_size(&self) -> (usize, usize) {
        (self.kernel_h, self.kernel_w)
    }

    /// Get stride as (height, width).
    #[must_use]
    pub fn stride(&self) -> (usize, usize) {
        (self.stride_h, self.stride_w)
    }

    /// Get padding as (height, width).
    #[must_use]
    pub fn padding(&self) -> (usize, usize) {
        (self.padding_h, self.padding_w)
    }

    /// Get dilation as (height, width).
    #[must_use]
    pub fn dilation(&self) -> (usize, usize) {
        (self.dilation_h, self.dilation_w)
    }

    /// Weight tensor.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Spatial output size for an `in_h x in_w` input.
    #[must_use]
    pub fn output_size(&self, in_h: usize, in_w: usize) -> (usize, usize) {
        (
            output_len(in_h, self.kernel_h, self.stride_h, self.padding_h, self.dilation_h),
            output_len(in_w, self.kernel_w, self.stride_w, self.padding_w, self.dilation_w),
        )
    }

    /// Unfold one image `[C, H, W]` into columns `[C * kH * kW, out_h * out_w]`.
    fn im2col(&self, image: &[f32], in_h: usize, in_w: usize, out_h: usize, out_w: usize) -> Vec<f32> {
        let spatial = out_h * out_w;
        let rows = self.in_channels * self.kernel_h * self.kernel_w;
        let mut cols = vec![0.0; rows * spatial];

        cols.par_chunks_mut(spatial)
            .enumerate()
            .for_each(|(row, dst)| {
                let kw = row % self.kernel_w;
                let kh = (row / self.kernel_w) % self.kernel_h;
                let c = row / (self.kernel_w * self.kernel_h);
                let plane = &image[c * in_h * in_w..(c + 1) * in_h * in_w];
                let off_h = (kh * self.dilation_h) as isize - self.padding_h as isize;
                let off_w = (kw * self.dilation_w) as isize - self.padding_w as isize;

                for oh in 0..out_h {
                    let ih = (oh * self.stride_h) as isize + off_h;
                    if ih < 0 || ih >= in_h as isize {
                        continue;
                    }
                    let src_row = &plane[ih as usize * in_w..(ih as usize + 1) * in_w];
                    let dst_row = &mut dst[oh * out_w..(oh + 1) * out_w];
                    for (ow, d) in dst_row.iter_mut().enumerate() {
                        let iw = (ow * self.stride_w) as isize + off_w;
                        if iw >= 0 && iw < in_w as isize {
                            *d = src_row[iw as usize];
                        }
                    }
                }
            });

        cols
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        assert_eq!(
            input.ndim(),
            4,
            "Conv2d expects 4D input [N, C, H, W], got {}D",
            input.ndim()
        );
        let (batch_size, in_channels, in_h, in_w) = input.dims4();
        assert_eq!(
            in_channels, self.in_channels,
            "Expected {} input channels, got {}",
            self.in_channels, in_channels
        );

        let (out_h, out_w) = self.output_size(in_h, in_w);
        let spatial = out_h * out_w;
        let k = self.in_channels * self.kernel_h * self.kernel_w;
        let image_len = in_channels * in_h * in_w;
        let weight = Matrix::from_vec(self.out_channels, k, self.weight.data().to_vec())
            .expect("weight holds out_channels * k values");
        let bias = self.bias.as_ref().map(Tensor::data);

        let mut output = vec![0.0; batch_size * self.out_channels * spatial];
        for (n, out_image) in output
            .chunks_mut(self.out_channels * spatial)
            .enumerate()
        {
            let image = &input.data()[n * image_len..(n + 1) * image_len];
            let cols = Matrix::from_vec(k, spatial, self.im2col(image, in_h, in_w, out_h, out_w))
                .expect("im2col yields k * spatial values");

            // GEMM: [out_channels, k] x [k, spatial]
            let product = weight.matmul(&cols).expect("inner dimensions agree");
            out_image.copy_from_slice(product.as_slice());
            if let Some(bias) = bias {
                for (row, &b) in out_image.chunks_mut(spatial).zip(bias) {
                    row.iter_mut().for_each(|v| *v += b);
                }
            }
        }

        let mut out = Tensor::from_vec(output, &[batch_size, self.out_channels, out_h, out_w]);
        out.cast_(input.dtype());
        out
    }

    fn parameters(&self) -> Vec<&Tensor> {
        match &self.bias {
            Some(b) => vec![&self.weight, b],
            None => vec![&self.weight],
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        match &mut self.bias {
            Some(b) => vec![&mut self.weight, b],
            None => vec![&mut self.weight],
        }
    }

    fn visit_state(&self, prefix: &str, visitor: &mut dyn FnMut(String, &Tensor)) {
        visitor(state_key(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            visitor(state_key(prefix, "bias"), bias);
        }
    }

    fn load_state(&mut self, loader: &mut StateLoader<'_>, prefix: &str) -> Result<()> {
        self.weight = loader.take(&state_key(prefix, "weight"), self.weight.shape())?;
        if let Some(bias) = &mut self.bias {
            *bias = loader.take(&state_key(prefix, "bias"), bias.shape())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Conv2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conv2d")
            .field("in_channels", &self.in_channels)
            .field("out_channels", &self.out_channels)
            .field("kernel_size", &(self.kernel_h, self.kernel_w))
            .field("stride", &(self.stride_h, self.stride_w))
            .field("padding", &(self.padding_h, self.padding_w))
            .field("dilation", &(self.dilation_h, self.dilation_w))
            .field("bias", &self.bias.is_some())
            .finish_non_exhaustive()
    }
}

/// Max Pooling 2D.
///
/// Padded positions never win the max.
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    kernel_h: usize,
    kernel_w: usize,
    stride_h: usize,
    stride_w: usize,
    padding_h: usize,
    padding_w: usize,
}

impl MaxPool2d {
    /// Create `MaxPool2d` with square kernel, stride and padding.
    #[must_use]
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Self {
        assert!(
            padding * 2 <= kernel_size,
            "MaxPool2d padding {padding} must be at most half of kernel size {kernel_size}"
        );
        Self {
            kernel_h: kernel_size,
            kernel_w: kernel_size,
            stride_h: stride,
            stride_w: stride,
            padding_h: padding,
            padding_w: padding,
        }
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        assert_eq!(input.ndim(), 4, "MaxPool2d expects 4D input [N, C, H, W]");

        let (batch_size, channels, in_h, in_w) = input.dims4();
        let out_h = output_len(in_h, self.kernel_h, self.stride_h, self.padding_h, 1);
        let out_w = output_len(in_w, self.kernel_w, self.stride_w, self.padding_w, 1);

        let input_data = input.data();
        let mut output = vec![f32::NEG_INFINITY; batch_size * channels * out_h * out_w];

        output
            .par_chunks_mut(out_h * out_w)
            .enumerate()
            .for_each(|(plane_idx, out_plane)| {
                let plane = &input_data[plane_idx * in_h * in_w..(plane_idx + 1) * in_h * in_w];
                for oh in 0..out_h {
                    let h0 = (oh * self.stride_h).saturating_sub(self.padding_h);
                    let h1 = (oh * self.stride_h + self.kernel_h - self.padding_h).min(in_h);
                    for ow in 0..out_w {
                        let w0 = (ow * self.stride_w).saturating_sub(self.padding_w);
                        let w1 = (ow * self.stride_w + self.kernel_w - self.padding_w).min(in_w);
                        let mut max_val = f32::NEG_INFINITY;
                        for ih in h0..h1 {
                            for &v in &plane[ih * in_w + w0..ih * in_w + w1] {
                                max_val = max_val.max(v);
                            }
                        }
                        out_plane[oh * out_w + ow] = max_val;
                    }
                }
            });

        let mut out = Tensor::from_vec(output, &[batch_size, channels, out_h, out_w]);
        out.cast_(input.dtype());
        out
    }
}
