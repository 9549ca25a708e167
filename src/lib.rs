//! Palette quantization for RGBA images.
//!
//! Turns a truecolor RGBA bitmap into a palette of up to 256 colors plus an
//! 8-bit indexed image, minimizing a perceptually weighted error measured in
//! a premultiplied-alpha, gamma-corrected color space. This is the kind of
//! engine a PNG optimizer uses to turn truecolor PNGs into palettized PNGs
//! with alpha.
//!
//! ```rust
//! use alphaquant::{Attributes, RGBA};
//!
//! let width = 2;
//! let height = 1;
//! let bitmap = [RGBA::new(255, 0, 0, 255), RGBA::new(0, 0, 255, 255)];
//!
//! let mut attr = Attributes::new();
//! attr.set_quality(70, 100)?;
//!
//! let mut img = attr.new_image(&bitmap, width, height, 0.0)?;
//! let mut res = attr.quantize(&mut img)?;
//! res.set_dithering_level(1.0)?;
//!
//! let (palette, pixels) = res.remapped(&mut img)?;
//! assert_eq!(pixels.len(), width * height);
//! assert!(palette.len() <= 256);
//! # Ok::<_, alphaquant::Error>(())
//! ```

mod attr;
mod blur;
mod error;
mod hist;
mod image;
mod kmeans;
mod mediancut;
mod nearest;
mod pal;
mod quant;
mod remap;
mod rows;
mod seacow;

pub use crate::attr::{Attributes, ControlFlow};
pub use crate::error::Error;
pub use crate::image::Image;
pub use crate::pal::{Palette, RGBA, MAX_COLORS};
pub use crate::quant::QuantizationResult;

/// Starts the configuration. Same as [`Attributes::new`].
#[inline]
#[must_use]
pub fn new() -> Attributes {
    Attributes::new()
}

/// Total order over well-behaved floats, for sorting
#[derive(PartialEq, PartialOrd, Copy, Clone, Default, Debug)]
pub(crate) struct OrdFloat<F>(F);

impl<F: PartialOrd> Eq for OrdFloat<F> {}

#[allow(clippy::derive_ord_xor_partial_ord)]
impl<F: PartialOrd> Ord for OrdFloat<F> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.partial_cmp(other).unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl OrdFloat<f32> {
    /// The value must not be NaN
    #[inline]
    pub fn new(v: f32) -> Self {
        debug_assert!(!v.is_nan());
        Self(v)
    }
}
