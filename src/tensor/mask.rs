//! Boolean padding masks.
//!
//! A mask has shape `[B, H, W]`; `true` marks a padded (invalid) pixel and
//! `false` marks real image content.

use std::fmt;

/// Boolean `[B, H, W]` validity mask, `true` = padding.
#[derive(Clone, PartialEq, Eq)]
pub struct Mask {
    data: Vec<bool>,
    shape: [usize; 3],
}

impl Mask {
    /// Create a mask from row-major data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` doesn't equal `B * H * W`.
    #[must_use]
    pub fn new(data: Vec<bool>, shape: [usize; 3]) -> Self {
        let expected = shape.iter().product::<usize>();
        assert_eq!(
            data.len(),
            expected,
            "Mask data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );
        Self { data, shape }
    }

    /// A mask with no padding at all.
    #[must_use]
    pub fn all_valid(batch: usize, height: usize, width: usize) -> Self {
        Self::new(vec![false; batch * height * width], [batch, height, width])
    }

    /// Build the padding mask for images of the given `(h, w)` sizes placed
    /// at the top-left corner of a `height x width` canvas.
    ///
    /// # Panics
    ///
    /// Panics if an image is larger than the canvas.
    #[must_use]
    pub fn from_image_sizes(sizes: &[(usize, usize)], height: usize, width: usize) -> Self {
        let mut data = vec![true; sizes.len() * height * width];
        for (b, &(h, w)) in sizes.iter().enumerate() {
            assert!(
                h <= height && w <= width,
                "image {b} of size {h}x{w} exceeds canvas {height}x{width}"
            );
            for y in 0..h {
                let row = (b * height + y) * width;
                data[row..row + w].fill(false);
            }
        }
        Self::new(data, [sizes.len(), height, width])
    }

    /// Shape as `[B, H, W]`.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Batch size.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.shape[0]
    }

    /// Spatial size `(H, W)`.
    #[must_use]
    pub fn spatial_size(&self) -> (usize, usize) {
        (self.shape[1], self.shape[2])
    }

    /// Row-major flags.
    #[must_use]
    pub fn data(&self) -> &[bool] {
        &self.data
    }

    /// Whether pixel `(y, x)` of image `b` is padding.
    #[inline]
    #[must_use]
    pub fn is_padded(&self, b: usize, y: usize, x: usize) -> bool {
        let [_, h, w] = self.shape;
        self.data[(b * h + y) * w + x]
    }

    /// Number of padded pixels across the batch.
    #[must_use]
    pub fn count_padded(&self) -> usize {
        self.data.iter().filter(|&&p| p).count()
    }

    /// True when no pixel is padding.
    #[must_use]
    pub fn is_all_valid(&self) -> bool {
        !self.data.iter().any(|&p| p)
    }

    /// Resize to `(out_h, out_w)` with nearest-neighbour sampling.
    ///
    /// Each output pixel copies source pixel
    /// `(floor(y * in_h / out_h), floor(x * in_w / out_w))`, computed in
    /// integer arithmetic. The two axes scale independently: a target with
    /// a different aspect ratio stretches the mask rather than failing.
    ///
    /// # Panics
    ///
    /// Panics if either target dimension is zero.
    #[must_use]
    pub fn interpolate_nearest(&self, out_h: usize, out_w: usize) -> Mask {
        assert!(
            out_h > 0 && out_w > 0,
            "cannot resize mask to {out_h}x{out_w}"
        );
        let [batch, in_h, in_w] = self.shape;
        if (in_h, in_w) == (out_h, out_w) {
            return self.clone();
        }

        let src_x: Vec<usize> = (0..out_w)
            .map(|x| nearest_source(x, in_w, out_w))
            .collect();
        let mut data = Vec::with_capacity(batch * out_h * out_w);
        for b in 0..batch {
            for y in 0..out_h {
                let sy = nearest_source(y, in_h, out_h);
                let row = &self.data[(b * in_h + sy) * in_w..(b * in_h + sy + 1) * in_w];
                data.extend(src_x.iter().map(|&sx| row[sx]));
            }
        }
        Mask::new(data, [batch, out_h, out_w])
    }
}

/// Source index for nearest-neighbour resampling along one axis.
#[inline]
fn nearest_source(dst: usize, in_len: usize, out_len: usize) -> usize {
    ((dst * in_len) / out_len).min(in_len.saturating_sub(1))
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mask")
            .field("shape", &self.shape)
            .field("padded", &self.count_padded())
            .finish()
    }
}
