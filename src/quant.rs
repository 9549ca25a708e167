use crate::attr::{Attributes, ControlFlow};
use crate::error::Error;
use crate::hist::{FixedColorsSet, HistogramInternal};
use crate::image::Image;
use crate::kmeans::Kmeans;
use crate::mediancut::mediancut;
use crate::pal::{f_pixel, PalF, PalLen, PalPop, Palette, MAX_COLORS, MAX_DIFF, MAX_TRANSP_A, MIN_OPAQUE_A, RGBA};
use crate::remap::{to_standard_mse, DitherMapMode, Remapped};
use crate::seacow::RowBitmapMut;
use crate::OrdFloat;
use arrayvec::ArrayVec;
use fallible_collections::FallibleVec;
use std::cmp::Reverse;
use std::fmt;
use std::mem::MaybeUninit;

/// The palette found by [`Attributes::quantize`], and the machinery to remap
/// images to it
pub struct QuantizationResult {
    remapped: Option<Box<Remapped>>,
    pub(crate) palette: PalF,
    progress_callback: Option<Box<dyn Fn(f32) -> ControlFlow + Send + Sync>>,
    pub(crate) int_palette: Palette,
    pub(crate) dither_level: f32,
    pub(crate) gamma: f64,
    pub(crate) palette_error: Option<f64>,
    pub(crate) min_posterization_output: u8,
    pub(crate) use_dither_map: DitherMapMode,
    pub(crate) fast_palette: bool,
}

impl QuantizationResult {
    pub(crate) fn new(attr: &Attributes, hist: HistogramInternal, fixed_colors: &FixedColorsSet, gamma: f64) -> Result<Self, Error> {
        if attr.progress(f32::from(attr.progress_stage1)) {
            return Err(Error::Aborted);
        }
        let (max_mse, target_mse, target_mse_is_zero) = attr.target_mse(hist.items.len());
        // a perfect match is impossible with a posterized histogram anyway
        let fast_palette = attr.fast_palette || hist.posterized;
        let (mut palette, palette_error) = find_best_palette(attr, target_mse, target_mse_is_zero, max_mse, hist, fixed_colors)?;
        if attr.progress(f32::from(attr.progress_stage1) + f32::from(attr.progress_stage2) + f32::from(attr.progress_stage3) * 0.95) {
            return Err(Error::Aborted);
        }
        if let (Some(palette_error), Some(max_mse)) = (palette_error, max_mse) {
            if palette_error > max_mse {
                attr.verbose_print(format!(
                    "  image degradation MSE={:0.3} (Q={}) exceeded limit of {:0.3} ({})",
                    to_standard_mse(palette_error),
                    mse_to_quality(palette_error),
                    to_standard_mse(max_mse),
                    mse_to_quality(max_mse)
                ));
                return Err(Error::QualityTooLow);
            }
        }

        sort_palette(attr, &mut palette);

        Ok(Self {
            palette,
            gamma,
            palette_error,
            min_posterization_output: attr.min_posterization(),
            use_dither_map: attr.use_dither_map,
            fast_palette,
            remapped: None,
            progress_callback: None,
            int_palette: Palette {
                count: 0,
                entries: [RGBA::default(); MAX_COLORS],
            },
            dither_level: 0.,
        })
    }

    /// Sets how much dithering the remap applies, 0.0 to 1.0.
    /// 1.0 (the default) gives a nice smooth image.
    pub fn set_dithering_level(&mut self, value: f32) -> Result<(), Error> {
        if !(0. ..=1.).contains(&value) {
            return Err(Error::ValueOutOfRange);
        }

        self.remapped = None;
        self.int_palette.count = 0;
        self.dither_level = value;
        Ok(())
    }

    /// Sets the gamma the output palette is rounded in.
    /// The default is sRGB gamma (~1/2.2).
    pub fn set_output_gamma(&mut self, value: f64) -> Result<(), Error> {
        if value <= 0. || value >= 1. {
            return Err(Error::ValueOutOfRange);
        }

        self.remapped = None;
        self.int_palette.count = 0;
        self.gamma = value;
        Ok(())
    }

    /// Approximate gamma correction value used for the output.
    ///
    /// Colors are converted from the input gamma to this gamma.
    #[inline]
    #[must_use]
    pub fn output_gamma(&self) -> f64 {
        self.gamma
    }

    /// Number 0-100 guessing how nice the input image will look when
    /// remapped to this palette
    #[must_use]
    pub fn quantization_quality(&self) -> Option<u8> {
        self.palette_error.map(mse_to_quality)
    }

    /// Approximate mean square error of the palette; `None` until it has
    /// been measured
    #[must_use]
    pub fn quantization_error(&self) -> Option<f64> {
        self.palette_error.map(to_standard_mse)
    }

    /// Approximate mean square error of the last remap
    #[must_use]
    pub fn remapping_error(&self) -> Option<f64> {
        self.remapped
            .as_ref()
            .and_then(|re| re.palette_error)
            .map(to_standard_mse)
    }

    /// Quality of the last remap, 0-100
    #[must_use]
    pub fn remapping_quality(&self) -> Option<u8> {
        self.remapped
            .as_ref()
            .and_then(|re| re.palette_error)
            .map(mse_to_quality)
    }

    /// Final palette, copied.
    ///
    /// It's slightly better to take the palette after a remap, because
    /// remapping refines it.
    #[must_use]
    pub fn palette_vec(&mut self) -> Vec<RGBA> {
        let pal = self.palette();
        let mut out = Vec::with_capacity(pal.len());
        out.extend_from_slice(pal);
        out
    }

    /// Final palette.
    ///
    /// It's slightly better to take the palette after a remap, because
    /// remapping refines it.
    #[inline]
    pub fn palette(&mut self) -> &[RGBA] {
        self.int_palette().as_slice()
    }

    pub(crate) fn int_palette(&mut self) -> &Palette {
        match self.remapped.as_ref() {
            Some(remap) => {
                debug_assert!(remap.int_palette.count > 0);
                &remap.int_palette
            },
            None => {
                if self.int_palette.count == 0 {
                    self.int_palette = Remapped::make_int_palette(&mut self.palette, self.gamma, self.min_posterization_output);
                }
                &self.int_palette
            },
        }
    }

    /// Callback for progress of the remapping, 0-100. Returning
    /// [`ControlFlow::Break`] aborts it.
    #[inline(always)]
    pub fn set_progress_callback<F: Fn(f32) -> ControlFlow + Send + Sync + 'static>(&mut self, callback: F) {
        self.progress_callback = Some(Box::new(callback));
    }

    // true == abort
    pub(crate) fn remap_progress(&self, percent: f32) -> bool {
        if let Some(cb) = &self.progress_callback {
            cb(percent) == ControlFlow::Break
        } else {
            false
        }
    }

    /// Remaps the image and returns the palette together with a
    /// 1-byte-per-pixel row-major bitmap of palette indices
    pub fn remapped(&mut self, image: &mut Image<'_>) -> Result<(Vec<RGBA>, Vec<u8>), Error> {
        let len = image.width() * image.height();
        // the capacity is essential here, as it creates an uninitialized buffer
        unsafe {
            let mut buf: Vec<u8> = FallibleVec::try_with_capacity(len).map_err(|_| Error::OutOfMemory)?;
            let uninit_slice = std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<MaybeUninit<u8>>(), buf.capacity());
            self.remap_into(image, uninit_slice)?;
            buf.set_len(len);
            Ok((self.palette_vec(), buf))
        }
    }

    /// Remaps the image into a preallocated buffer of at least
    /// `width * height` bytes.
    ///
    /// Call [`QuantizationResult::palette`] _after_ this call, not before
    /// it, because remapping refines the palette.
    pub fn remap_into(&mut self, image: &mut Image<'_>, output_buf: &mut [MaybeUninit<u8>]) -> Result<(), Error> {
        let required_size = image.width() * image.height();
        let output_buf = output_buf.get_mut(0..required_size).ok_or(Error::BufferTooSmall)?;

        let rows = RowBitmapMut::new_contiguous(output_buf, image.width());
        self.remapped = Some(Box::new(Remapped::new(self, image, rows)?));
        Ok(())
    }
}

impl fmt::Debug for QuantizationResult {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuantizationResult(q={})", self.quantization_quality().unwrap_or(0))
    }
}

/// Orders the palette the way PNG encoders like it: transparent entries
/// first (smaller tRNS chunk), each group by popularity. Fixed colors are
/// left at the front in the order they were added.
fn sort_palette(attr: &Attributes, palette: &mut PalF) {
    let num_fixed = palette.num_fixed();
    let len = palette.len();

    if attr.last_index_transparent {
        let alpha_index = palette.as_slice()[num_fixed..len]
            .iter()
            .position(|c| c.a < MAX_TRANSP_A)
            .map(|i| i + num_fixed);
        if let Some(alpha_index) = alpha_index {
            palette.swap(alpha_index, len - 1);
            sort_tail_by_popularity(palette, num_fixed, len - 1);
            return;
        }
    }

    let mut tmp: ArrayVec<(f_pixel, PalPop), MAX_COLORS> = palette
        .iter()
        .skip(num_fixed)
        .map(|(c, p)| (*c, *p))
        .collect();
    tmp.sort_by_key(|(color, pop)| {
        let is_opaque = color.a >= MIN_OPAQUE_A;
        (is_opaque, Reverse(OrdFloat::new(pop.popularity())))
    });
    let num_transparent = tmp.iter().filter(|(color, _)| color.a < MIN_OPAQUE_A).count();
    for ((dcol, dpop), (scol, spop)) in palette.iter_mut().skip(num_fixed).zip(tmp) {
        *dcol = scol;
        *dpop = spop;
    }

    attr.verbose_print(format!(
        "  eliminated opaque tRNS-chunk entries...{num_transparent} entr{} transparent",
        if num_transparent == 1 { "y" } else { "ies" }
    ));

    // a palette sorted strictly by popularity confuses byte-level
    // predictors in PNG compressors; these swaps measurably help
    if len > 16 && len - num_fixed > 9 {
        palette.swap(num_fixed + 7, num_fixed + 1);
        palette.swap(num_fixed + 8, num_fixed + 2);
        palette.swap(num_fixed + 9, num_fixed + 3);
    }
}

fn sort_tail_by_popularity(palette: &mut PalF, start: usize, end: usize) {
    let mut tmp: ArrayVec<(f_pixel, PalPop), MAX_COLORS> = palette
        .iter()
        .skip(start)
        .take(end - start)
        .map(|(c, p)| (*c, *p))
        .collect();
    tmp.sort_by_key(|(_, pop)| Reverse(OrdFloat::new(pop.popularity())));
    for ((dcol, dpop), (scol, spop)) in palette.iter_mut().skip(start).take(end - start).zip(tmp) {
        *dcol = scol;
        *dpop = spop;
    }
}

/// Repeats mediancut with different histogram weights to find the palette
/// with the lowest error.
///
/// The number of trials is controlled by the speed setting; each trial also
/// runs one k-means step that measures the error and biases the weights of
/// poorly matched colors for the next trial.
pub(crate) fn find_best_palette(attr: &Attributes, target_mse: f64, target_mse_is_zero: bool, max_mse: Option<f64>, mut hist: HistogramInternal, fixed_colors: &FixedColorsSet) -> Result<(PalF, Option<f64>), Error> {
    // if the image has few colors to begin with (and no quality degradation
    // is required), the quantization can be skipped entirely
    let few_input_colors = hist.items.len() + fixed_colors.len() <= attr.max_colors as usize;
    if few_input_colors && target_mse_is_zero {
        return Ok(palette_from_histogram(&hist, attr.max_colors, fixed_colors));
    }

    let fast_palette = attr.fast_palette || hist.posterized;
    let mut max_colors = attr.max_colors;
    let total_trials = i32::from(attr.feedback_loop_trials(hist.items.len()));
    let mut trials_left = total_trials;
    let mut best_palette: Option<PalF> = None;
    let mut target_mse_overshoot = if total_trials > 0 { 1.05 } else { 1. };
    let mut least_error: Option<f64> = None;

    let mut palette = loop {
        let max_mse_per_color = target_mse
            .max(least_error.unwrap_or(quality_to_mse(1)))
            .max(quality_to_mse(51))
            * 1.2;
        let mut new_palette = mediancut(&mut hist, max_colors.saturating_sub(fixed_colors.len() as PalLen), target_mse * target_mse_overshoot, max_mse_per_color, attr.min_opaque_val)
            .with_fixed_colors(max_colors, fixed_colors);

        let stage_done = 1. - (trials_left.max(0) as f32 / (total_trials + 1) as f32).powi(2);
        let overall_done = f32::from(attr.progress_stage1) + stage_done * f32::from(attr.progress_stage2);
        attr.verbose_print(format!("  selecting colors...{}%", (100. * stage_done) as u8));

        if trials_left <= 0 {
            break new_palette;
        }

        let first_run_of_target_mse = best_palette.is_none() && target_mse > 0.;
        let total_error = Kmeans::iteration(&mut hist, &mut new_palette, !first_run_of_target_mse, best_palette.is_none() || fast_palette);
        if best_palette.is_none() || total_error < least_error.unwrap_or(MAX_DIFF) || (total_error <= target_mse && (new_palette.len() as PalLen) < max_colors) {
            if total_error < target_mse && total_error > 0. {
                // the k-means step improves quality above what mediancut aims
                // for; compensate by letting mediancut aim lower
                target_mse_overshoot = (target_mse_overshoot * 1.25).min(target_mse / total_error);
            }
            least_error = Some(total_error);
            // if the number of colors could be reduced, try to keep it that
            // way, with one extra color of wiggle room
            max_colors = max_colors.min(new_palette.len() as PalLen + 1);
            trials_left -= 1;
            best_palette = Some(new_palette);
        } else {
            for item in hist.items.iter_mut() {
                item.adjusted_weight = (item.perceptual_weight + item.adjusted_weight) / 2.;
            }
            target_mse_overshoot = 1.;
            trials_left -= 6;
            // if the error is really bad it's unlikely to improve, end sooner
            if total_error > least_error.unwrap_or(MAX_DIFF) * 4. {
                trials_left -= 3;
            }
        }

        if attr.progress(overall_done) || trials_left <= 0 {
            break best_palette.ok_or(Error::Aborted)?;
        }
    };

    // stale guesses must not point outside the palette
    if palette.len() < MAX_COLORS {
        let len = palette.len();
        for item in hist.items.iter_mut() {
            if item.likely_colormap_index as usize >= len {
                // the actual value doesn't matter, the guess is out of date anyway
                item.likely_colormap_index = 0;
            }
        }
    }

    refine_palette(&mut palette, attr, &mut hist, max_mse, &mut least_error, fast_palette);
    Ok((palette, least_error))
}

/// Iterates k-means until the error settles into a local minimum or the
/// iteration budget runs out
fn refine_palette(palette: &mut PalF, attr: &Attributes, hist: &mut HistogramInternal, max_mse: Option<f64>, palette_error: &mut Option<f64>, fast_palette: bool) {
    let (iterations, iteration_limit) = attr.kmeans_iterations(hist.items.len(), palette_error.is_some());
    if iterations == 0 {
        return;
    }

    attr.verbose_print("  moving colormap towards local minimum");
    let mut i = 0;
    while i < iterations {
        let stage_done = f32::from(i) / f32::from(iterations);
        let overall_done = f32::from(attr.progress_stage1) + f32::from(attr.progress_stage2) + stage_done * f32::from(attr.progress_stage3) * 0.89;
        if attr.progress(overall_done) {
            break;
        }

        let pal_err = Kmeans::iteration(hist, palette, false, i == 0 || fast_palette);
        debug_assert!(pal_err < MAX_DIFF);
        let previous_palette_error = *palette_error;
        *palette_error = Some(pal_err);

        if let Some(previous_palette_error) = previous_palette_error {
            if (previous_palette_error - pal_err).abs() < iteration_limit {
                break;
            }
        }

        let max_mse = max_mse.unwrap_or(MAX_DIFF);
        if pal_err > max_mse * 3. {
            break; // hopeless
        }
        i += if pal_err > max_mse * 1.5 { 2 } else { 1 };
    }
}

fn palette_from_histogram(hist: &HistogramInternal, max_colors: PalLen, fixed_colors: &FixedColorsSet) -> (PalF, Option<f64>) {
    let mut hist_pal = PalF::new();
    for item in hist.items.iter() {
        hist_pal.push(item.color, PalPop::new(item.perceptual_weight));
    }
    (hist_pal.with_fixed_colors(max_colors, fixed_colors), Some(0.))
}

pub(crate) fn quality_to_mse(quality: u8) -> f64 {
    if quality == 0 {
        return MAX_DIFF;
    }
    if quality >= 100 {
        return 0.;
    }
    // the curve is fudged to roughly match libjpeg quality, except the
    // lowest 10, which land on a really low number of colors
    let extra_low_quality_fudge = (0.016 / (0.001 + f64::from(quality)) - 0.001).max(0.);
    extra_low_quality_fudge + 2.5 / (210. + f64::from(quality)).powf(1.2) * (100.1 - f64::from(quality)) / 100.
}

pub(crate) fn mse_to_quality(mse: f64) -> u8 {
    for i in (1..101).rev() {
        // + epsilon for floating point errors
        if mse <= quality_to_mse(i) + 0.000001 {
            return i;
        }
    }
    0
}
