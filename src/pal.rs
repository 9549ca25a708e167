use crate::hist::FixedColorsSet;
use arrayvec::ArrayVec;
use std::ops::{Deref, DerefMut};

/// 8-bit RGBA as consumed and emitted at the boundary. Non-premultiplied.
pub type RGBA = rgb::RGBA8;
/// Alpha-first float pixel layout used internally
pub type ARGBF = rgb::alt::ARGB<f32>;

pub const MAX_COLORS: usize = 256;
pub type PalIndex = u8;
pub type PalLen = u16;

/// A perceptual exponent between sRGB and linear. Distances computed in this
/// space correlate better with perceived error than either.
const INTERNAL_GAMMA: f64 = 0.5499;

/// Sentinel "infinite" distance. No real color pair exceeds ~4.
pub(crate) const MAX_DIFF: f64 = 1e20;

/// Entries at least this opaque may be rounded to fully opaque
pub(crate) const MIN_OPAQUE_A: f32 = 255. / 256.;
/// Entries this transparent are treated as fully transparent
pub(crate) const MAX_TRANSP_A: f32 = 1. / 256.;

/// Builds the table mapping byte values in the given gamma to the internal
/// gamma-linear scale
pub(crate) fn gamma_lut(gamma: f64) -> [f32; 256] {
    debug_assert!(gamma > 0.);
    let mut tmp = [0.; 256];
    for (i, t) in tmp.iter_mut().enumerate() {
        *t = ((i as f64 / 255.).powf(INTERNAL_GAMMA / gamma)) as f32;
    }
    tmp
}

/// Premultiplied alpha, gamma-corrected RGB.
///
/// Premultiplication is what makes blending (and therefore color distance
/// near transparency) meaningful, and every averaging routine assumes it.
/// Invariant: `0 <= r,g,b <= a <= 1`.
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, Default, PartialEq)]
#[repr(transparent)]
pub struct f_pixel(pub ARGBF);

impl f_pixel {
    /// Perceptually weighted distance between two premultiplied pixels.
    ///
    /// Takes the worst case of the error visible when the colors are
    /// composited on a white or a black background, so colors that differ
    /// only under one extreme still count as different. The alpha channel
    /// is not added directly; it influences every RGB term through the
    /// alpha difference.
    #[inline]
    pub fn diff(&self, other: &f_pixel) -> f32 {
        let alphas = f64::from(other.a) - f64::from(self.a);

        let ch = |x: f32, y: f32| -> f64 {
            let black = f64::from(x) - f64::from(y);
            let white = black + alphas;
            black * black + white * white
        };

        (ch(self.r, other.r) + ch(self.g, other.g) + ch(self.b, other.b)) as f32
    }

    /// Converts to a byte pixel in the given output gamma, un-premultiplying
    /// the color channels.
    pub fn to_rgb(&self, gamma: f64) -> RGBA {
        if self.a < MAX_TRANSP_A {
            return RGBA::new(0, 0, 0, 0);
        }

        let r = self.r / self.a;
        let g = self.g / self.a;
        let b = self.b / self.a;
        let a = self.a;

        let gamma = (gamma / INTERNAL_GAMMA) as f32;
        // scale by 256 and clamp, because values are 1..255.9999 rounded down
        let r = r.powf(gamma) * 256.;
        let g = g.powf(gamma) * 256.;
        let b = b.powf(gamma) * 256.;
        let a = a * 256.;

        RGBA {
            r: if r >= 255. { 255 } else { r as u8 },
            g: if g >= 255. { 255 } else { g as u8 },
            b: if b >= 255. { 255 } else { b as u8 },
            a: if a >= 255. { 255 } else { a as u8 },
        }
    }

    #[inline]
    pub fn from_rgba(lut: &[f32; 256], px: RGBA) -> Self {
        let a = f32::from(px.a) / 255.;
        Self(ARGBF {
            a,
            r: lut[px.r as usize] * a,
            g: lut[px.g as usize] * a,
            b: lut[px.b as usize] * a,
        })
    }
}

impl Deref for f_pixel {
    type Target = ARGBF;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for f_pixel {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<ARGBF> for f_pixel {
    #[inline(always)]
    fn from(px: ARGBF) -> Self {
        Self(px)
    }
}

/// Popularity of a palette entry, plus whether the entry's color is pinned
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PalPop {
    popularity: f32,
    fixed: bool,
}

impl PalPop {
    #[inline(always)]
    pub(crate) fn new(popularity: f32) -> Self {
        Self { popularity, fixed: false }
    }

    pub(crate) fn with_fixed(popularity: f32, fixed: bool) -> Self {
        Self { popularity, fixed }
    }

    #[inline(always)]
    #[must_use]
    pub fn popularity(self) -> f32 {
        self.popularity
    }

    #[inline(always)]
    pub(crate) fn is_fixed(self) -> bool {
        self.fixed
    }

    #[must_use]
    pub(crate) fn to_fixed(self) -> Self {
        Self { popularity: self.popularity, fixed: true }
    }
}

/// A palette of premultiplied float colors under construction.
///
/// Fixed entries always come first, in the order they were added.
/// May carry a snapshot of an earlier, smaller version of itself
/// (the subset palette) for seeding nearest-color searches.
#[derive(Clone, Default)]
pub(crate) struct PalF {
    colors: ArrayVec<f_pixel, MAX_COLORS>,
    pops: ArrayVec<PalPop, MAX_COLORS>,
    subset: Option<Box<PalF>>,
}

impl PalF {
    #[inline]
    pub fn new() -> Self {
        debug_assert!(PalLen::MAX as usize >= MAX_COLORS);
        Self {
            colors: ArrayVec::default(),
            pops: ArrayVec::default(),
            subset: None,
        }
    }

    #[inline(always)]
    pub fn push(&mut self, color: f_pixel, popularity: PalPop) {
        self.colors.push(color);
        self.pops.push(popularity);
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[f_pixel] {
        &self.colors
    }

    #[inline(always)]
    pub fn pops(&self) -> &[PalPop] {
        &self.pops
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.colors.len()
    }

    #[inline(always)]
    pub fn iter(&self) -> impl Iterator<Item = (&f_pixel, &PalPop)> {
        self.colors.iter().zip(&self.pops)
    }

    #[inline(always)]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&mut f_pixel, &mut PalPop)> {
        self.colors.iter_mut().zip(&mut self.pops)
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        self.colors.swap(a, b);
        self.pops.swap(a, b);
    }

    /// Entries at the front whose colors are pinned
    pub fn num_fixed(&self) -> usize {
        self.pops.iter().take_while(|p| p.is_fixed()).count()
    }

    pub fn set_subset(&mut self, subset: Option<PalF>) {
        self.subset = subset.map(Box::new);
    }

    pub fn subset(&self) -> Option<&PalF> {
        self.subset.as_deref()
    }

    /// Prepends the fixed colors, in the order they were added, dropping
    /// generated entries that duplicate them or exceed the budget
    #[must_use]
    pub fn with_fixed_colors(mut self, max_colors: PalLen, fixed_colors: &FixedColorsSet) -> Self {
        if fixed_colors.is_empty() {
            return self;
        }

        let mut new_pal = Self::new();
        new_pal.subset = self.subset.take();
        for color in fixed_colors.iter().take(max_colors as usize) {
            new_pal.push(*color, PalPop::new(0.).to_fixed());
        }
        for (color, pop) in self.iter() {
            if new_pal.len() >= max_colors as usize {
                break;
            }
            if fixed_colors.iter().any(|fixed| fixed == color) {
                continue;
            }
            new_pal.push(*color, *pop);
        }
        new_pal
    }
}

/// The final palette, in rounded 8-bit colors
#[derive(Clone)]
pub struct Palette {
    pub(crate) count: u32,
    pub(crate) entries: [RGBA; MAX_COLORS],
}

impl Palette {
    /// Palette colors, at most 256 of them
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[RGBA] {
        &self.entries[..self.count as usize]
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
