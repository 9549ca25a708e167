use crate::error::Error;
use crate::image::Image;
use crate::kmeans::Kmeans;
use crate::nearest::Nearest;
use crate::pal::{f_pixel, gamma_lut, PalF, PalIndex, Palette, ARGBF, MAX_COLORS, RGBA};
use crate::seacow::{RowBitmap, RowBitmapMut};
use crate::quant::QuantizationResult;
use crate::rows::temp_buf;
use rayon::iter::ParallelBridge;
use rayon::iter::ParallelIterator;
use rgb::ComponentMap;
use std::cell::RefCell;
use std::mem::MaybeUninit;
use thread_local::ThreadLocal;

#[derive(Eq, PartialEq, Clone, Copy)]
pub(crate) enum DitherMapMode {
    None,
    Enabled,
    /// use the dither map even for huge images
    Always,
}

/// Cache of the last remap, owned by the result
pub(crate) struct Remapped {
    pub(crate) int_palette: Palette,
    pub(crate) palette_error: Option<f64>,
}

/// Writes the nearest palette index for every pixel, and folds the mapped
/// colors back into the palette as one more refinement step (which is why
/// the final palette must be read after remapping, not before).
#[inline(never)]
pub(crate) fn remap_to_palette<'x, 'b: 'x>(image: &mut Image<'_>, output_pixels: &'x mut RowBitmapMut<'b, MaybeUninit<u8>>, palette: &mut PalF, fast: bool) -> Result<(f64, RowBitmap<'x, u8>), Error> {
    let width = image.width();
    let height = image.height();
    image.px.prepare_f_cache(image.low_memory_hint)?;
    let px = &image.px;

    let n = Nearest::new(palette, fast);
    let palette_len = palette.len();

    let tls = ThreadLocal::new();
    let per_thread_buffers = move || RefCell::new((Kmeans::new(palette_len), temp_buf::<RGBA>(width), temp_buf::<f_pixel>(width)));

    let remapping_error = output_pixels
        .rows_mut()
        .enumerate()
        .par_bridge()
        .map(|(row, output_pixels_row)| {
            let mut remapping_error = 0.;
            let (kmeans, temp_rgba, temp_f) = &mut *tls.get_or(per_thread_buffers).borrow_mut();

            let output_pixels_row = &mut output_pixels_row[..width];
            let row_pixels = &px.row_f(temp_rgba, temp_f, row)[..width];

            let mut last_match: PalIndex = 0;
            for (inp, out) in row_pixels.iter().zip(output_pixels_row) {
                let (idx, diff) = n.search(inp, last_match);
                last_match = idx;
                out.write(last_match);
                remapping_error += f64::from(diff);
                kmeans.update_color(*inp, 1., last_match);
            }
            remapping_error
        })
        .sum::<f64>();

    drop(n);
    if let Some(kmeans) = tls.into_iter().map(RefCell::into_inner).map(|t| t.0).reduce(Kmeans::merge) {
        kmeans.finalize(palette);
    }

    let remapping_error = remapping_error / (width * height) as f64;
    Ok((remapping_error, unsafe { output_pixels.assume_init() }))
}

/// Adds the accumulated error to the pixel, clipping the correction so that
/// no channel leaves [0, 1.03]. The clip uses a single ratio for all three
/// color channels so hues are preserved; alpha is clamped on its own.
fn get_dithered_pixel(dither_level: f32, max_dither_error: f32, thiserr: f_pixel, px: f_pixel) -> f_pixel {
    let s = thiserr.0 * dither_level;

    let mut ratio: f32 = 1.;
    // allowing some overflow prevents undithered bands caused by clamping
    // of all channels at once
    const MAX_OVERFLOW: f32 = 1.03;
    if px.r + s.r > MAX_OVERFLOW {
        ratio = ratio.min((MAX_OVERFLOW - px.r) / s.r);
    } else if px.r + s.r < 0. {
        ratio = ratio.min(px.r / -s.r);
    }
    if px.g + s.g > MAX_OVERFLOW {
        ratio = ratio.min((MAX_OVERFLOW - px.g) / s.g);
    } else if px.g + s.g < 0. {
        ratio = ratio.min(px.g / -s.g);
    }
    if px.b + s.b > MAX_OVERFLOW {
        ratio = ratio.min((MAX_OVERFLOW - px.b) / s.b);
    } else if px.b + s.b < 0. {
        ratio = ratio.min(px.b / -s.b);
    }

    let a = (px.a + s.a).clamp(0., 1.);

    // if the correction is crazy high, don't propagate all of it.
    // This prevents gaudy green pixels popping out of the blue (or red or black!)
    let dither_error = s.r * s.r + s.g * s.g + s.b * s.b + s.a * s.a;
    if dither_error > max_dither_error {
        ratio *= 0.8;
    } else if dither_error < 2. / 256. / 256. {
        // don't dither areas that don't have a noticeable error; this makes
        // the file smaller
        return px;
    }

    f_pixel(ARGBF {
        a,
        r: px.r + s.r * ratio,
        g: px.g + s.g * ratio,
        b: px.b + s.b * ratio,
    })
}

/// Remaps with zig-zag Floyd-Steinberg error diffusion.
///
/// The edge/noise map (or the refined dither map) scales the error applied
/// at each pixel: dithering on sharp edges creates jagged lines, and noisy
/// areas are dithered "naturally" already.
///
/// When `output_image_is_remapped` is set, the output buffer already holds a
/// plain remap and its indices are used as the initial nearest guesses.
#[inline(never)]
pub(crate) fn remap_to_palette_floyd(input_image: &mut Image<'_>, mut output_pixels: RowBitmapMut<'_, MaybeUninit<u8>>, quant: &QuantizationResult, max_dither_error: f32, output_image_is_remapped: bool) -> Result<(), Error> {
    let width = input_image.width();
    let height = input_image.height();
    let progress_stage1: f32 = if quant.use_dither_map != DitherMapMode::None { 20. } else { 0. };

    input_image.px.prepare_f_cache(input_image.low_memory_hint)?;

    let dither_map = if quant.use_dither_map != DitherMapMode::None {
        input_image.dither_map.as_deref().or(input_image.edges.as_deref()).unwrap_or(&[])
    } else {
        &[]
    };

    let errwidth = width + 2; // +2 saves from checking out of bounds access
    let mut thiserr_data = vec![f_pixel::default(); errwidth * 2];
    let (mut thiserr, mut nexterr) = thiserr_data.split_at_mut(errwidth);

    // deterministic dithering is better for comparing results between runs
    let mut rng = fastrand::Rng::with_seed(12345);
    for err in thiserr.iter_mut() {
        err.0 = ARGBF {
            r: (rng.f32() - 0.5) / 255.,
            g: (rng.f32() - 0.5) / 255.,
            b: (rng.f32() - 0.5) / 255.,
            a: (rng.f32() - 0.5) / 255.,
        };
    }

    let n = Nearest::new(&quant.palette, false);
    let palette = quant.palette.as_slice();

    // the response to this value is non-linear, and without the warp any
    // level below 0.8 would give almost no dithering at all
    let d = quant.dither_level;
    let mut base_dithering_level = 1. - (1. - d) * (1. - d) * (1. - d);
    if !dither_map.is_empty() {
        base_dithering_level /= 255.; // the map is in byte scale
    }
    base_dithering_level *= 15. / 16.; // prevent small errors from accumulating

    let mut temp_rgba = temp_buf::<RGBA>(width);
    let mut temp_f = temp_buf::<f_pixel>(width);
    let mut scan_forward = true;
    let mut last_match: PalIndex = 0;

    for (row, output_pixels_row) in output_pixels.rows_mut().enumerate() {
        if quant.remap_progress(progress_stage1 + row as f32 * (100. - progress_stage1) / height as f32) {
            return Err(Error::Aborted);
        }

        nexterr.fill_with(f_pixel::default);
        let row_pixels = input_image.px.row_f(&mut temp_rgba, &mut temp_f, row);
        let dither_map_row = dither_map.get(row * width..row * width + width).unwrap_or(&[]);

        let mut col = if scan_forward { 0 } else { width - 1 };
        loop {
            let mut dither_level = base_dithering_level;
            if let Some(&l) = dither_map_row.get(col) {
                dither_level *= f32::from(l);
            }

            let spx = get_dithered_pixel(dither_level, max_dither_error, thiserr[col + 1], row_pixels[col]);
            let guessed_match = if output_image_is_remapped {
                unsafe { output_pixels_row[col].assume_init() }
            } else {
                last_match
            };
            let (idx, _) = n.search(&spx, guessed_match);
            last_match = idx;
            let output_px = palette[last_match as usize];
            output_pixels_row[col].write(last_match);

            let mut err = spx.0 - output_px.0;
            // a huge error will only produce noise, so don't propagate all of it
            if err.r * err.r + err.g * err.g + err.b * err.b + err.a * err.a > max_dither_error {
                dither_level *= 0.75;
            }
            // error in the color channels matters less the more transparent
            // the chosen color is
            let colorimp = (3. + output_px.a) / 4. * dither_level;
            err.r *= colorimp;
            err.g *= colorimp;
            err.b *= colorimp;
            err.a *= dither_level;

            if scan_forward {
                thiserr[col + 2].0 += err * (7. / 16.);
                nexterr[col + 2].0 = err * (1. / 16.);
                nexterr[col + 1].0 += err * (5. / 16.);
                nexterr[col].0 += err * (3. / 16.);
                col += 1;
                if col >= width {
                    break;
                }
            } else {
                thiserr[col].0 += err * (7. / 16.);
                nexterr[col].0 = err * (1. / 16.);
                nexterr[col + 1].0 += err * (5. / 16.);
                nexterr[col + 2].0 += err * (3. / 16.);
                if col == 0 {
                    break;
                }
                col -= 1;
            }
        }

        std::mem::swap(&mut thiserr, &mut nexterr);
        scan_forward = !scan_forward;
    }
    Ok(())
}

impl Remapped {
    pub fn new(result: &QuantizationResult, image: &mut Image<'_>, mut output_pixels: RowBitmapMut<'_, MaybeUninit<u8>>) -> Result<Self, Error> {
        let mut palette = result.palette.clone();
        let posterize = result.min_posterization_output;
        let progress_stage1: f32 = if result.use_dither_map != DitherMapMode::None { 20. } else { 0. };
        if result.remap_progress(progress_stage1 * 0.25) {
            return Err(Error::Aborted);
        }

        let mut palette_error = result.palette_error;
        let int_palette;
        if result.dither_level == 0. {
            int_palette = Self::make_int_palette(&mut palette, result.gamma, posterize);
            palette_error = Some(remap_to_palette(image, &mut output_pixels, &mut palette, result.fast_palette)?.0);
        } else {
            let is_image_huge = image.width() * image.height() > 2000 * 2000;
            let allow_dither_map = result.use_dither_map == DitherMapMode::Always || (!is_image_huge && result.use_dither_map != DitherMapMode::None);
            let generate_dither_map = allow_dither_map && image.edges.is_some() && image.dither_map.is_none();
            if generate_dither_map {
                // the plain remap finds the areas that will need dithering
                let (tmp_re, row_pointers_remapped) = remap_to_palette(image, &mut output_pixels, &mut palette, result.fast_palette)?;
                palette_error = Some(tmp_re);
                image.update_dither_map(&row_pointers_remapped);
            }

            if result.remap_progress(progress_stage1 * 0.5) {
                return Err(Error::Aborted);
            }

            // that remap was the last chance to refine the palette, hence the
            // final palette is set after remapping, not before
            int_palette = Self::make_int_palette(&mut palette, result.gamma, posterize);
            let max_dither_error = palette_error.map_or(16. / 256., |e| e * 2.4).max(16. / 256.) as f32;
            remap_to_palette_floyd(image, output_pixels, result, max_dither_error, generate_dither_map)?;
        }

        Ok(Self { int_palette, palette_error })
    }

    /// Rounds the palette to bytes in the output gamma; also re-rounds the
    /// float palette through the LUT, so remapping and dithering measure
    /// against the same quantized colors the output will carry
    pub fn make_int_palette(palette: &mut PalF, gamma: f64, posterize: u8) -> Palette {
        let mut int_palette = Palette {
            count: palette.len() as u32,
            entries: [RGBA::default(); MAX_COLORS],
        };
        let lut = gamma_lut(gamma);
        for ((f_color, _), int_pal) in palette.iter_mut().zip(int_palette.entries.iter_mut()) {
            let px = f_color.to_rgb(gamma).map(move |c| posterize_channel(c, posterize));
            *f_color = f_pixel::from_rgba(&lut, px);
            *int_pal = px;
        }
        int_palette
    }
}

/// Scales the internal error to the user-visible 8-bit-ish units
pub(crate) fn to_standard_mse(mse: f64) -> f64 {
    mse * 65536. / 6.
}

/// Replicates the top `bits` of the byte into the low bits, so that the
/// posterized value still spans the full 0-255 range
#[inline]
fn posterize_channel(color: u8, bits: u8) -> u8 {
    if bits == 0 {
        color
    } else {
        (color & !((1 << bits) - 1)) | (color >> (8 - bits))
    }
}
