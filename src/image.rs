use crate::attr::Attributes;
use crate::blur;
use crate::error::Error;
use crate::hist::FixedColorsSet;
use crate::pal::{f_pixel, RGBA, MAX_COLORS};
use crate::rows::{DynamicRows, PixelsSource, RowCallback};
use crate::seacow::{RowBitmap, SeaCow};
use fallible_collections::FallibleVec;
use std::mem::MaybeUninit;

/// Both maps are skipped for images with a larger surface
const CONTRAST_MAPS_MEMORY_LIMIT: usize = 1 << 26;

/// An image to be quantized or remapped. Owns the optional edge/noise maps
/// derived from the pixels.
pub struct Image<'pixels> {
    pub(crate) px: DynamicRows<'pixels>,
    /// flatness per pixel, used to weight the histogram
    pub(crate) importance_map: Option<Box<[u8]>>,
    /// 255 - edge strength per pixel, used to modulate dithering
    pub(crate) edges: Option<Box<[u8]>>,
    /// per-pixel dithering gain derived from the edges map
    pub(crate) dither_map: Option<Box<[u8]>>,
    pub(crate) fixed_colors: FixedColorsSet,
    /// don't cache f-pixels if the converted image won't be reused much
    pub(crate) low_memory_hint: bool,
}

impl<'pixels> Image<'pixels> {
    /// Describes a contiguous row-major RGBA bitmap borrowed from the caller.
    ///
    /// Use gamma 0.0 for sRGB images (most images are).
    pub fn new(attr: &Attributes, bitmap: &'pixels [RGBA], width: usize, height: usize, gamma: f64) -> Result<Self, Error> {
        if bitmap.len() < width * height {
            return Err(Error::BufferTooSmall);
        }
        Self::new_internal(attr, PixelsSource::Bitmap(SeaCow::Borrowed(bitmap)), width, height, gamma)
    }

    /// Like [`Image::new`], but the image takes ownership of the pixels
    pub fn new_owned(attr: &Attributes, bitmap: Vec<RGBA>, width: usize, height: usize, gamma: f64) -> Result<Image<'static>, Error> {
        if bitmap.len() < width * height {
            return Err(Error::BufferTooSmall);
        }
        Image::new_internal(attr, PixelsSource::Bitmap(SeaCow::Boxed(bitmap.into_boxed_slice())), width, height, gamma)
    }

    /// Describes an image made of possibly discontiguous rows
    pub fn new_rows(attr: &Attributes, rows: &'pixels [&'pixels [RGBA]], width: usize, height: usize, gamma: f64) -> Result<Self, Error> {
        if rows.len() < height || rows.iter().any(|r| r.len() < width) {
            return Err(Error::InvalidPointer);
        }
        let rows = rows[..height].to_vec().into_boxed_slice();
        Self::new_internal(attr, PixelsSource::Rows(rows), width, height, gamma)
    }

    /// Describes an image whose rows are pulled from a callback.
    ///
    /// The callback gets the row index and must write `width` pixels.
    pub fn new_fn<F>(attr: &Attributes, row_callback: F, width: usize, height: usize, gamma: f64) -> Result<Image<'static>, Error>
    where F: Fn(&mut [MaybeUninit<RGBA>], usize) + Send + Sync + 'static {
        Image::new_internal(attr, PixelsSource::Callback(Box::new(row_callback) as Box<RowCallback<'static>>), width, height, gamma)
    }

    fn new_internal(attr: &Attributes, pixels: PixelsSource<'pixels>, width: usize, height: usize, gamma: f64) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            attr.verbose_print("  error: width and height must be > 0");
            return Err(Error::ValueOutOfRange);
        }
        if !(0. ..=1.).contains(&gamma) {
            attr.verbose_print("  error: gamma must be >= 0 and <= 1 (try 1/gamma instead)");
            return Err(Error::ValueOutOfRange);
        }
        // 16 bytes per cached f-pixel
        if width.checked_mul(height).and_then(|px| px.checked_mul(16)).map_or(true, |b| b > i32::MAX as usize) {
            attr.verbose_print("  error: image too large");
            return Err(Error::ValueOutOfRange);
        }

        let gamma = if gamma > 0. { gamma } else { 0.45455 };
        let alpha_floor = attr.min_opaque_val;
        if alpha_floor < 1. {
            attr.verbose_print("  rounding almost-opaque colors to opaque");
        }

        Ok(Self {
            px: DynamicRows::new(width, height, gamma, pixels, alpha_floor),
            importance_map: None,
            edges: None,
            dither_map: None,
            fixed_colors: FixedColorsSet::new(),
            low_memory_hint: !attr.use_contrast_maps && !attr.use_dither_map(),
        })
    }

    /// Width of the image in pixels
    #[inline(always)]
    #[must_use]
    pub fn width(&self) -> usize {
        self.px.width
    }

    /// Height of the image in pixels
    #[inline(always)]
    #[must_use]
    pub fn height(&self) -> usize {
        self.px.height
    }

    /// Reserves a palette entry for this color. Must be called before
    /// quantization. Fixed colors come out of the `max_colors` budget.
    pub fn add_fixed_color(&mut self, color: RGBA) -> Result<(), Error> {
        if self.fixed_colors.len() >= MAX_COLORS {
            return Err(Error::ValueOutOfRange);
        }
        let lut = self.px.gamma_lut();
        self.fixed_colors.push(f_pixel::from_rgba(lut, color));
        Ok(())
    }

    /// Builds the edges and noise maps.
    ///
    /// noise is an approximation of areas with high-frequency noise, except
    /// straight edges. 255=flat, 0=noisy. edges is the noise map including
    /// all edges.
    pub(crate) fn contrast_maps(&mut self) -> Result<(), Error> {
        let cols = self.width();
        let rows = self.height();
        if cols < 4 || rows < 4 || 3 * cols * rows > CONTRAST_MAPS_MEMORY_LIMIT {
            return Ok(());
        }

        self.px.prepare_f_cache(false)?;
        let cache = match self.px.f_cache() {
            Some(c) => c,
            None => return Ok(()), // image too large to analyze
        };

        let mut noise: Vec<u8> = FallibleVec::try_with_capacity(cols * rows)?;
        noise.resize(cols * rows, 0);
        let mut edges: Vec<u8> = FallibleVec::try_with_capacity(cols * rows)?;
        edges.resize(cols * rows, 0);
        let mut tmp: Vec<u8> = FallibleVec::try_with_capacity(cols * rows)?;
        tmp.resize(cols * rows, 0);

        let mut next_row = &cache[0..cols];
        let mut curr_row = next_row;
        let mut prev_row;

        for j in 0..rows {
            prev_row = curr_row;
            curr_row = next_row;
            next_row = &cache[(j + 1).min(rows - 1) * cols..][..cols];

            let mut prev;
            let mut curr = curr_row[0];
            let mut next = curr;
            for i in 0..cols {
                prev = curr;
                curr = next;
                next = curr_row[(i + 1).min(cols - 1)];

                // contrast is the difference between the pixel and its
                // horizontal and vertical neighbors
                let horiz = (prev.a + next.a - curr.a * 2.).abs()
                    .max((prev.r + next.r - curr.r * 2.).abs())
                    .max((prev.g + next.g - curr.g * 2.).abs())
                    .max((prev.b + next.b - curr.b * 2.).abs());
                let prevl = prev_row[i];
                let nextl = next_row[i];
                let vert = (prevl.a + nextl.a - curr.a * 2.).abs()
                    .max((prevl.r + nextl.r - curr.r * 2.).abs())
                    .max((prevl.g + nextl.g - curr.g * 2.).abs())
                    .max((prevl.b + nextl.b - curr.b * 2.).abs());
                let edge = horiz.max(vert);
                let mut z = edge - (horiz - vert).abs() * 0.5;
                z = 1. - z.max(horiz.min(vert));
                z *= z; // noise is amplified
                z *= z;

                z *= 256.;
                noise[j * cols + i] = if z < 256. { z as u8 } else { 255 };
                let e = (1. - edge) * 256.;
                edges[j * cols + i] = if e < 256. { e as u8 } else { 255 };
            }
        }

        // noise areas are shrunk and then expanded to remove thin edges from the map
        blur::max3(&noise, &mut tmp, cols, rows);
        blur::max3(&tmp, &mut noise, cols, rows);

        blur::blur(&mut noise, &mut tmp, cols, rows, 3);

        blur::max3(&noise, &mut tmp, cols, rows);

        blur::min3(&tmp, &mut noise, cols, rows);
        blur::min3(&noise, &mut tmp, cols, rows);
        blur::min3(&tmp, &mut noise, cols, rows);

        blur::min3(&edges, &mut tmp, cols, rows);
        blur::max3(&tmp, &mut edges, cols, rows);
        for (e, n) in edges.iter_mut().zip(&noise) {
            *e = (*e).min(*n);
        }

        self.importance_map = Some(noise.into_boxed_slice());
        self.edges = Some(edges.into_boxed_slice());
        Ok(())
    }

    /// Builds a map of neighbor pixels mapped to the same palette entry, and
    /// uses it to scale down the edges map where dithering would be wasted.
    ///
    /// For efficiency it only looks for runs of identical indices
    /// horizontally and peeks one pixel above and below; a full 2D region
    /// search doesn't improve the result noticeably.
    pub(crate) fn update_dither_map(&mut self, remapped: &RowBitmap<'_, u8>) {
        let width = self.width();
        let mut edges = match self.edges.take() {
            Some(e) => e,
            None => return,
        };

        let rows: Vec<&[u8]> = remapped.rows().collect();
        let height = rows.len();

        for (row, output) in rows.iter().enumerate() {
            let mut lastpixel = output[0];
            let mut lastcol = 0;
            for col in 1..width {
                let px = output[col];
                if px != lastpixel || col == width - 1 {
                    let mut neighbor_count = 2.5 + (col - lastcol) as f32;
                    for i in lastcol..col {
                        if row > 0 && rows[row - 1][i] == lastpixel {
                            neighbor_count += 1.;
                        }
                        if row < height - 1 && rows[row + 1][i] == lastpixel {
                            neighbor_count += 1.;
                        }
                    }
                    while lastcol <= col {
                        let mut e = f32::from(edges[row * width + lastcol]) / 255.;
                        e *= 1. - 2.5 / neighbor_count;
                        edges[row * width + lastcol] = (e * 255.) as u8;
                        lastcol += 1;
                    }
                    lastpixel = px;
                }
            }
        }
        self.dither_map = Some(edges);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::Attributes;

    #[test]
    fn rejects_empty_dimensions() {
        let attr = Attributes::new();
        let px = [RGBA::new(0, 0, 0, 255)];
        assert_eq!(Image::new(&attr, &px, 0, 1, 0.).err(), Some(Error::ValueOutOfRange));
        assert_eq!(Image::new(&attr, &px, 1, 0, 0.).err(), Some(Error::ValueOutOfRange));
    }

    #[test]
    fn rejects_short_buffer() {
        let attr = Attributes::new();
        let px = [RGBA::new(0, 0, 0, 255); 3];
        assert_eq!(Image::new(&attr, &px, 2, 2, 0.).err(), Some(Error::BufferTooSmall));
    }

    #[test]
    fn rejects_bad_gamma() {
        let attr = Attributes::new();
        let px = [RGBA::new(0, 0, 0, 255)];
        assert_eq!(Image::new(&attr, &px, 1, 1, 2.2).err(), Some(Error::ValueOutOfRange));
        assert!(Image::new(&attr, &px, 1, 1, 0.45455).is_ok());
    }

    #[test]
    fn contrast_maps_flag_flat_regions_as_flat() {
        let attr = Attributes::new();
        let mut px = vec![RGBA::new(50, 50, 50, 255); 16 * 16];
        // a hard vertical edge in the middle
        for row in 0..16 {
            for col in 8..16 {
                px[row * 16 + col] = RGBA::new(220, 220, 220, 255);
            }
        }
        let mut img = Image::new(&attr, &px, 16, 16, 0.).unwrap();
        img.contrast_maps().unwrap();
        let noise = img.importance_map.as_ref().unwrap();
        let edges = img.edges.as_ref().unwrap();
        assert_eq!(noise.len(), 16 * 16);
        // far from the edge the image is flat
        assert!(noise[16 * 8 + 2] > 128);
        // the edge map dips near the boundary column
        assert!(edges[16 * 8 + 8] <= edges[16 * 8 + 2]);
    }

    #[test]
    fn tiny_images_get_no_maps() {
        let attr = Attributes::new();
        let px = vec![RGBA::new(0, 0, 0, 255); 4];
        let mut img = Image::new(&attr, &px, 2, 2, 0.).unwrap();
        img.contrast_maps().unwrap();
        assert!(img.importance_map.is_none());
        assert!(img.edges.is_none());
    }
}
