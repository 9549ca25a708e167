use crate::error::Error;
use crate::image::Image;
use crate::pal::{PalLen, RGBA, MAX_COLORS};
use crate::quant::{mse_to_quality, quality_to_mse, QuantizationResult};
use crate::remap::DitherMapMode;
use std::mem::MaybeUninit;
use std::sync::Arc;

/// Configuration for the quantization process. Create with
/// [`Attributes::new`], tweak with the setters, then call
/// [`Attributes::quantize`].
#[derive(Clone)]
pub struct Attributes {
    pub(crate) max_colors: PalLen,
    target_mse: f64,
    max_mse: Option<f64>,
    kmeans_iteration_limit: f64,
    kmeans_iterations: u16,
    feedback_loop_trials: u16,
    pub(crate) max_histogram_entries: u32,
    min_posterization_output: u8,
    min_posterization_input: u8,
    pub(crate) min_opaque_val: f32,
    pub(crate) last_index_transparent: bool,
    pub(crate) use_contrast_maps: bool,
    pub(crate) use_dither_map: DitherMapMode,
    pub(crate) fast_palette: bool,
    speed: u8,
    pub(crate) progress_stage1: u8,
    pub(crate) progress_stage2: u8,
    pub(crate) progress_stage3: u8,

    progress_callback: Option<Arc<dyn Fn(f32) -> ControlFlow + Send + Sync>>,
    log_callback: Option<Arc<dyn Fn(&Attributes, &str) + Send + Sync>>,
    log_flush_callback: Option<Arc<dyn Fn(&Attributes) + Send + Sync>>,
}

impl Attributes {
    /// New handle for library configuration.
    ///
    /// See also [`Attributes::new_image`].
    #[must_use]
    pub fn new() -> Self {
        let mut attr = Self {
            max_colors: MAX_COLORS as PalLen,
            target_mse: 0.,
            max_mse: None,
            kmeans_iteration_limit: 0.,
            kmeans_iterations: 0,
            feedback_loop_trials: 0,
            max_histogram_entries: 0,
            min_posterization_output: 0,
            min_posterization_input: 0,
            min_opaque_val: 1.,
            last_index_transparent: false,
            use_contrast_maps: false,
            use_dither_map: DitherMapMode::None,
            fast_palette: false,
            speed: 0,
            progress_stage1: 0,
            progress_stage2: 0,
            progress_stage3: 0,
            progress_callback: None,
            log_callback: None,
            log_flush_callback: None,
        };
        let _ = attr.set_speed(3);
        attr
    }

    /// Restricts the palette to `colors` entries. It's better to use
    /// [`Attributes::set_quality`] and let the quantizer decide.
    #[inline]
    pub fn set_max_colors(&mut self, colors: u32) -> Result<(), Error> {
        if !(2..=MAX_COLORS as u32).contains(&colors) {
            return Err(Error::ValueOutOfRange);
        }
        self.max_colors = colors as PalLen;
        Ok(())
    }

    /// Number of least significant bits to ignore in the output.
    ///
    /// Useful for ARGB4444-style targets and other platforms with reduced
    /// per-channel precision.
    #[inline]
    pub fn set_min_posterization(&mut self, bits: u8) -> Result<(), Error> {
        if !(0..=4).contains(&bits) {
            return Err(Error::ValueOutOfRange);
        }
        self.min_posterization_output = bits;
        Ok(())
    }

    /// Returns the number of bits of precision truncated on output
    #[inline(always)]
    #[must_use]
    pub fn min_posterization(&self) -> u8 {
        self.min_posterization_output
    }

    /// Quality range 0-100, roughly like JPEG.
    ///
    /// If the minimum quality can't be met, quantization fails with
    /// [`Error::QualityTooLow`]. The default is min 0, target 100.
    pub fn set_quality(&mut self, minimum: u8, target: u8) -> Result<(), Error> {
        if target > 100 || target < minimum {
            return Err(Error::ValueOutOfRange);
        }
        self.target_mse = quality_to_mse(target);
        self.max_mse = Some(quality_to_mse(minimum));
        Ok(())
    }

    /// Reads the (minimum, target) values set with
    /// [`Attributes::set_quality`]
    #[must_use]
    pub fn quality(&self) -> (u8, u8) {
        (
            self.max_mse.map(mse_to_quality).unwrap_or(0),
            mse_to_quality(self.target_mse),
        )
    }

    /// Speed/quality trade-off, 1-10. Higher is faster but lower quality.
    ///
    /// The default is 3. Speeds 8 and up posterize the histogram input;
    /// speeds above 7 skip the contrast maps.
    pub fn set_speed(&mut self, value: u8) -> Result<(), Error> {
        if !(1..=10).contains(&value) {
            return Err(Error::ValueOutOfRange);
        }
        let mut iterations = u16::from(8u8.saturating_sub(value));
        iterations += iterations * iterations / 2;
        self.kmeans_iterations = iterations;
        self.kmeans_iteration_limit = 1. / f64::from(1u32 << (23 - u32::from(value)));
        self.feedback_loop_trials = 56u16.saturating_sub(9 * u16::from(value));
        self.max_histogram_entries = (1 << 17) + (1 << 18) * (10 - u32::from(value));
        self.min_posterization_input = if value >= 8 { 1 } else { 0 };
        self.fast_palette = value >= 7;
        // a parallelized dither map is cheap enough to keep on longer
        let dither_map_limit = if rayon::current_num_threads() > 1 { 7 } else { 5 };
        self.use_dither_map = if value <= dither_map_limit {
            if value < 3 { DitherMapMode::Always } else { DitherMapMode::Enabled }
        } else {
            DitherMapMode::None
        };
        self.use_contrast_maps = value <= 7 || self.use_dither_map != DitherMapMode::None;
        self.speed = value;

        self.progress_stage1 = if self.use_contrast_maps { 20 } else { 8 };
        if self.feedback_loop_trials < 2 {
            self.progress_stage1 += 30;
        }
        self.progress_stage3 = (50 / (1 + value)).min(100 - self.progress_stage1);
        self.progress_stage2 = 100 - self.progress_stage1 - self.progress_stage3;
        Ok(())
    }

    /// Returns the currently set speed/quality trade-off
    #[inline(always)]
    #[must_use]
    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// Returns the maximum number of palette entries
    #[inline(always)]
    #[must_use]
    pub fn max_colors(&self) -> u32 {
        self.max_colors.into()
    }

    /// Rounds colors with opacity of at least `min / 255` to fully opaque.
    ///
    /// A workaround for rendering stacks that dither or reject
    /// almost-opaque pixels. 255 (the default) disables it.
    pub fn set_min_opacity(&mut self, min: u8) -> Result<(), Error> {
        self.min_opaque_val = f32::from(min) / 255.;
        Ok(())
    }

    /// Reads the value set with [`Attributes::set_min_opacity`]
    #[must_use]
    pub fn min_opacity(&self) -> u8 {
        (256. * self.min_opaque_val).min(255.) as u8
    }

    /// Moves the transparent color to the last palette entry.
    ///
    /// This is less efficient for PNG, but required by some broken software.
    #[inline(always)]
    pub fn set_last_index_transparent(&mut self, is_last: bool) {
        self.last_index_transparent = is_last;
    }

    /// Describes a contiguous slice of RGBA pixels.
    ///
    /// Use 0.0 for gamma if the image is sRGB (most images are).
    #[inline]
    pub fn new_image<'pixels>(&self, bitmap: &'pixels [RGBA], width: usize, height: usize, gamma: f64) -> Result<Image<'pixels>, Error> {
        Image::new(self, bitmap, width, height, gamma)
    }

    /// Like [`Attributes::new_image`], but the image takes ownership of the
    /// pixels
    #[inline]
    pub fn new_image_owned(&self, bitmap: Vec<RGBA>, width: usize, height: usize, gamma: f64) -> Result<Image<'static>, Error> {
        Image::new_owned(self, bitmap, width, height, gamma)
    }

    /// Describes an image made of possibly discontiguous rows
    #[inline]
    pub fn new_image_rows<'pixels>(&self, rows: &'pixels [&'pixels [RGBA]], width: usize, height: usize, gamma: f64) -> Result<Image<'pixels>, Error> {
        Image::new_rows(self, rows, width, height, gamma)
    }

    /// Describes an image whose rows are pulled from a callback
    #[inline]
    pub fn new_image_fn<F>(&self, row_callback: F, width: usize, height: usize, gamma: f64) -> Result<Image<'static>, Error>
    where F: Fn(&mut [MaybeUninit<RGBA>], usize) + Send + Sync + 'static {
        Image::new_fn(self, row_callback, width, height, gamma)
    }

    /// Generates a palette for the image
    pub fn quantize(&self, image: &mut Image<'_>) -> Result<QuantizationResult, Error> {
        let hist = crate::hist::build_histogram(self, image)?;
        let fixed_colors = image.fixed_colors.clone();
        QuantizationResult::new(self, hist, &fixed_colors, image.px.gamma)
    }

    /// Set the callback the library calls to print a message.
    ///
    /// Without one, messages go to `log::debug!`. To share data with the
    /// callback, use `Arc` or atomics and a `move ||` closure.
    #[inline]
    pub fn set_log_callback<F: Fn(&Attributes, &str) + Send + Sync + 'static>(&mut self, callback: F) {
        self.log_callback = Some(Arc::new(callback));
    }

    /// Set the callback the library calls when done printing a batch of
    /// messages
    #[inline]
    pub fn set_log_flush_callback<F: Fn(&Attributes) + Send + Sync + 'static>(&mut self, callback: F) {
        self.log_flush_callback = Some(Arc::new(callback));
    }

    /// Set the callback the library calls to report progress, 0-100.
    /// Returning [`ControlFlow::Break`] cancels the operation.
    #[inline]
    pub fn set_progress_callback<F: Fn(f32) -> ControlFlow + Send + Sync + 'static>(&mut self, callback: F) {
        self.progress_callback = Some(Arc::new(callback));
    }

    // true == abort
    pub(crate) fn progress(&self, percent: f32) -> bool {
        if let Some(f) = &self.progress_callback {
            f(percent) == ControlFlow::Break
        } else {
            false
        }
    }

    #[inline(always)]
    pub(crate) fn verbose_print(&self, msg: impl AsRef<str>) {
        fn print(attr: &Attributes, msg: &str) {
            match &attr.log_callback {
                Some(f) => f(attr, msg),
                None => log::debug!("{msg}"),
            }
        }
        print(self, msg.as_ref());
    }

    pub(crate) fn verbose_print_flush(&self) {
        if let Some(f) = &self.log_flush_callback {
            f(self);
        }
    }

    pub(crate) fn use_dither_map(&self) -> bool {
        self.use_dither_map != DitherMapMode::None
    }

    /// Trials are throttled for huge histograms, where each one is costly
    pub(crate) fn feedback_loop_trials(&self, hist_items: usize) -> u16 {
        let mut trials = self.feedback_loop_trials;
        for threshold in [5000, 25_000, 50_000, 100_000] {
            if hist_items > threshold {
                trials = (trials * 3 + 3) / 4;
            }
        }
        trials
    }

    /// Returns (max_mse, target_mse, whether the user asked for a perfect
    /// match). Posterized output can't be a perfect match, so the target is
    /// raised accordingly.
    pub(crate) fn target_mse(&self, hist_items: usize) -> (Option<f64>, f64, bool) {
        let aim_for_perfect_quality = self.target_mse == 0.;
        let max_mse = self.max_mse.map(|mse| mse * if hist_items <= MAX_COLORS { 0.33 } else { 1. });
        let mut target_mse = self.target_mse.max((f64::from(1u32 << self.min_posterization_output) / 1024.).powi(2));
        if let Some(max_mse) = max_mse {
            target_mse = target_mse.min(max_mse);
        }
        (max_mse, target_mse, aim_for_perfect_quality)
    }

    /// Returns (iterations, iteration_limit) for the refinement loop
    pub(crate) fn kmeans_iterations(&self, hist_items: usize, palette_error_is_known: bool) -> (u16, f64) {
        let mut iterations = self.kmeans_iterations;
        let mut iteration_limit = self.kmeans_iteration_limit;
        for threshold in [5000, 25_000, 50_000] {
            if hist_items > threshold {
                iterations = (iterations * 3 + 3) / 4;
            }
        }
        if hist_items > 100_000 {
            iterations = (iterations * 3 + 3) / 4;
            iteration_limit *= 2.;
        }
        // without at least one iteration the total error is never measured
        // and the minimum-quality limit can't be enforced
        if iterations == 0 && !palette_error_is_known && self.max_mse.is_some() {
            iterations = 1;
        }
        (iterations, iteration_limit)
    }

    #[inline]
    pub(crate) fn posterize_bits(&self) -> u8 {
        self.min_posterization_output.max(self.min_posterization_input)
    }
}

impl Drop for Attributes {
    fn drop(&mut self) {
        self.verbose_print_flush();
    }
}

impl Default for Attributes {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

/// Result of the callback in [`Attributes::set_progress_callback`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlFlow {
    /// Continue processing as normal
    Continue = 1,
    /// Abort processing and fail
    Break = 0,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_validate_ranges() {
        let mut attr = Attributes::new();
        assert_eq!(attr.set_max_colors(1).err(), Some(Error::ValueOutOfRange));
        assert_eq!(attr.set_max_colors(257).err(), Some(Error::ValueOutOfRange));
        assert!(attr.set_max_colors(2).is_ok());
        assert_eq!(attr.set_speed(0).err(), Some(Error::ValueOutOfRange));
        assert_eq!(attr.set_speed(11).err(), Some(Error::ValueOutOfRange));
        assert_eq!(attr.set_quality(80, 50).err(), Some(Error::ValueOutOfRange));
        assert_eq!(attr.set_min_posterization(5).err(), Some(Error::ValueOutOfRange));
    }

    #[test]
    fn speed_presets_follow_the_documented_formulas() {
        let mut attr = Attributes::new();
        for speed in 1..=10u8 {
            attr.set_speed(speed).unwrap();
            let base = u16::from(8u8.saturating_sub(speed));
            assert_eq!(attr.kmeans_iterations, base + base * base / 2);
            assert_eq!(attr.feedback_loop_trials, 56u16.saturating_sub(9 * u16::from(speed)));
            assert_eq!(attr.max_histogram_entries, (1 << 17) + (1 << 18) * (10 - u32::from(speed)));
            assert_eq!(attr.min_posterization_input, if speed >= 8 { 1 } else { 0 });
            assert_eq!(attr.fast_palette, speed >= 7);
            assert_eq!(attr.progress_stage1 + attr.progress_stage2 + attr.progress_stage3, 100);
        }
    }

    #[test]
    fn quality_setters_roundtrip() {
        let mut attr = Attributes::new();
        attr.set_quality(30, 80).unwrap();
        assert_eq!(attr.quality(), (30, 80));
    }
}
