use crate::error::Error;
use crate::pal::{f_pixel, gamma_lut, RGBA};
use crate::seacow::SeaCow;
use fallible_collections::FallibleVec;
use std::mem::MaybeUninit;

/// Pulls one row of RGBA pixels into the destination buffer
pub(crate) type RowCallback<'a> = dyn Fn(&mut [MaybeUninit<RGBA>], usize) + Send + Sync + 'a;

pub(crate) enum PixelsSource<'pixels> {
    /// One contiguous row-major bitmap
    Bitmap(SeaCow<'pixels, RGBA>),
    /// Possibly discontiguous rows
    Rows(Box<[&'pixels [RGBA]]>),
    /// Rows generated on demand
    Callback(Box<RowCallback<'pixels>>),
}

/// Don't cache converted pixels beyond this; fall back to converting rows
/// on demand into per-thread scratch
const HIGH_MEMORY_LIMIT: usize = 1 << 26;

/// The image's pixel rows plus a lazily built cache of their premultiplied
/// gamma-linear form
pub(crate) struct DynamicRows<'pixels> {
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) gamma: f64,
    lut: [f32; 256],
    pixels: PixelsSource<'pixels>,
    f_pixels: Option<Box<[f_pixel]>>,
    /// raise almost-opaque alpha to this level during row reads; 1.0 disables
    alpha_floor: f32,
}

impl<'pixels> DynamicRows<'pixels> {
    pub fn new(width: usize, height: usize, gamma: f64, pixels: PixelsSource<'pixels>, alpha_floor: f32) -> Self {
        debug_assert!(gamma > 0.);
        Self {
            width,
            height,
            gamma,
            lut: gamma_lut(gamma),
            pixels,
            f_pixels: None,
            alpha_floor,
        }
    }

    #[inline]
    pub fn gamma_lut(&self) -> &[f32; 256] {
        &self.lut
    }

    fn should_use_low_memory(&self, low_memory_hint: bool) -> bool {
        let limit = if low_memory_hint { HIGH_MEMORY_LIMIT / 8 } else { HIGH_MEMORY_LIMIT };
        self.width * self.height * std::mem::size_of::<f_pixel>() > limit
    }

    /// Converts and caches the whole image in f-pixel form. Silently skips
    /// the cache for images over the memory limit, or when the allocation
    /// fails; row accessors then convert on demand.
    pub fn prepare_f_cache(&mut self, low_memory_hint: bool) -> Result<(), Error> {
        if self.f_pixels.is_some() || self.should_use_low_memory(low_memory_hint) {
            return Ok(());
        }

        let len = self.width * self.height;
        let mut cache: Vec<f_pixel> = match FallibleVec::try_with_capacity(len) {
            Ok(v) => v,
            Err(_) => return Ok(()), // conserving memory instead
        };
        let mut temp_row = temp_buf::<RGBA>(self.width);
        for row in 0..self.height {
            let row_px = self.row_rgba(&mut temp_row, row);
            cache.extend(row_px.iter().map(|px| f_pixel::from_rgba(&self.lut, *px)));
        }
        self.f_pixels = Some(cache.into_boxed_slice());
        Ok(())
    }

    #[inline]
    pub fn f_cache(&self) -> Option<&[f_pixel]> {
        self.f_pixels.as_deref()
    }

    /// Returns one row of byte pixels, using `temp` when the source needs
    /// a copy (callback rows, or the alpha workaround)
    pub fn row_rgba<'t>(&'t self, temp: &'t mut [MaybeUninit<RGBA>], row: usize) -> &'t [RGBA] {
        debug_assert!(row < self.height);
        let needs_copy = self.alpha_floor < 1.;
        let direct: &[RGBA] = match &self.pixels {
            PixelsSource::Bitmap(b) => &b.as_slice()[row * self.width..][..self.width],
            PixelsSource::Rows(rows) => &rows[row][..self.width],
            PixelsSource::Callback(cb) => {
                let temp = &mut temp[..self.width];
                cb(temp, row);
                let out = unsafe { slice_assume_init_mut(temp) };
                if needs_copy {
                    modify_alpha(out, self.alpha_floor);
                }
                return out;
            },
        };
        if needs_copy {
            let temp = &mut temp[..self.width];
            for (d, s) in temp.iter_mut().zip(direct) {
                d.write(*s);
            }
            let out = unsafe { slice_assume_init_mut(temp) };
            modify_alpha(out, self.alpha_floor);
            out
        } else {
            direct
        }
    }

    /// Returns one row in premultiplied gamma-linear form, from the cache
    /// when present
    pub fn row_f<'t>(&'t self, temp_rgba: &mut [MaybeUninit<RGBA>], temp_f: &'t mut [MaybeUninit<f_pixel>], row: usize) -> &'t [f_pixel] {
        if let Some(cache) = &self.f_pixels {
            return &cache[row * self.width..][..self.width];
        }

        let rgba_row = self.row_rgba(temp_rgba, row);
        let temp_f = &mut temp_f[..self.width];
        for (d, s) in temp_f.iter_mut().zip(rgba_row) {
            d.write(f_pixel::from_rgba(&self.lut, *s));
        }
        unsafe { slice_assume_init_mut(temp_f) }
    }
}

/// Raises the opacity of almost-opaque pixels so that they can be rounded to
/// fully opaque. The ramp below the floor stays linear to avoid a visible
/// step.
fn modify_alpha(row: &mut [RGBA], min_opaque_val: f32) {
    let almost_opaque_val = min_opaque_val * 169. / 256.;
    let almost_opaque_val_int = (almost_opaque_val * 255.) as u8;

    for px in row {
        if px.a >= almost_opaque_val_int {
            let mut al = f32::from(px.a) / 255.;
            al = almost_opaque_val + (al - almost_opaque_val) * (1. - almost_opaque_val) / (min_opaque_val - almost_opaque_val);
            al *= 256.;
            px.a = if al >= 255. { 255 } else { al as u8 };
        }
    }
}

/// Scratch row for per-thread conversions
pub(crate) fn temp_buf<T>(len: usize) -> Box<[MaybeUninit<T>]> {
    let mut buf = Vec::with_capacity(len);
    // uninitialized scratch; every use writes before reading
    unsafe { buf.set_len(len) };
    buf.into_boxed_slice()
}

unsafe fn slice_assume_init_mut<T>(s: &mut [MaybeUninit<T>]) -> &mut [T] {
    &mut *(s as *mut [MaybeUninit<T>] as *mut [T])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_rows(pixels: &[RGBA], width: usize, height: usize) -> DynamicRows<'_> {
        DynamicRows::new(width, height, 0.45455, PixelsSource::Bitmap(SeaCow::Borrowed(pixels)), 1.)
    }

    #[test]
    fn bitmap_rows_are_borrowed_directly() {
        let px: Vec<RGBA> = (0..6).map(|i| RGBA::new(i, 0, 0, 255)).collect();
        let rows = bitmap_rows(&px, 3, 2);
        let mut temp = temp_buf(3);
        assert_eq!(rows.row_rgba(&mut temp, 1), &px[3..6]);
    }

    #[test]
    fn callback_rows_fill_scratch() {
        let cb = move |out: &mut [MaybeUninit<RGBA>], row: usize| {
            for (i, px) in out.iter_mut().enumerate() {
                px.write(RGBA::new(i as u8, row as u8, 0, 255));
            }
        };
        let rows = DynamicRows::new(2, 2, 0.45455, PixelsSource::Callback(Box::new(cb)), 1.);
        let mut temp = temp_buf(2);
        let r1 = rows.row_rgba(&mut temp, 1).to_vec();
        assert_eq!(r1, vec![RGBA::new(0, 1, 0, 255), RGBA::new(1, 1, 0, 255)]);
    }

    #[test]
    fn f_cache_matches_on_demand_rows() {
        let px: Vec<RGBA> = (0..8).map(|i| RGBA::new(i * 30, 255 - i * 30, i, 200)).collect();
        let mut cached = bitmap_rows(&px, 4, 2);
        cached.prepare_f_cache(false).unwrap();
        assert!(cached.f_cache().is_some());

        let uncached = bitmap_rows(&px, 4, 2);
        let mut temp_rgba = temp_buf(4);
        let mut temp_f = temp_buf(4);
        for row in 0..2 {
            let a = cached.row_f(&mut temp_buf(4), &mut temp_buf(4), row).to_vec();
            let b = uncached.row_f(&mut temp_rgba, &mut temp_f, row).to_vec();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn alpha_floor_raises_almost_opaque() {
        let px = [RGBA::new(10, 20, 30, 250), RGBA::new(10, 20, 30, 100)];
        let rows = DynamicRows::new(2, 1, 0.45455, PixelsSource::Bitmap(SeaCow::Borrowed(&px)), 238. / 255.);
        let mut temp = temp_buf(2);
        let out = rows.row_rgba(&mut temp, 0);
        assert_eq!(out[0].a, 255);
        assert_eq!(out[1].a, 100);
    }
}
