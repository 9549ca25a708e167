//! Palette refinement: each palette entry moves to the weighted centroid of
//! the histogram entries that map to it (one step of Lloyd's algorithm).

use crate::hist::HistogramInternal;
use crate::nearest::Nearest;
use crate::pal::{f_pixel, PalF, PalIndex, PalPop, ARGBF};
use rayon::prelude::*;
use std::cell::RefCell;
use thread_local::ThreadLocal;

/// Accumulator for one palette entry. Aligned so per-thread accumulators
/// never share a cache line.
#[derive(Copy, Clone, Default)]
#[repr(align(64))]
struct KmeansSlot {
    a: f64,
    r: f64,
    g: f64,
    b: f64,
    total: f64,
}

pub(crate) struct Kmeans {
    averages: Vec<KmeansSlot>,
}

impl Kmeans {
    #[inline]
    pub fn new(palette_len: usize) -> Self {
        Self {
            averages: vec![KmeansSlot::default(); palette_len],
        }
    }

    #[inline]
    pub fn update_color(&mut self, px: f_pixel, value: f32, matched: PalIndex) {
        let slot = &mut self.averages[matched as usize];
        let value = f64::from(value);
        slot.a += f64::from(px.a) * value;
        slot.r += f64::from(px.r) * value;
        slot.g += f64::from(px.g) * value;
        slot.b += f64::from(px.b) * value;
        slot.total += value;
    }

    pub fn merge(mut self, other: Self) -> Self {
        debug_assert_eq!(self.averages.len(), other.averages.len());
        for (a, b) in self.averages.iter_mut().zip(other.averages) {
            a.a += b.a;
            a.r += b.r;
            a.g += b.g;
            a.b += b.b;
            a.total += b.total;
        }
        self
    }

    /// Moves every non-fixed entry to its centroid. Fixed entries keep their
    /// color; every entry gets the total weight mapped to it as popularity.
    pub fn finalize(self, palette: &mut PalF) {
        for (i, (color, pop)) in palette.iter_mut().enumerate() {
            let slot = &self.averages[i];
            let mut total = slot.total;
            if !pop.is_fixed() {
                if total > 0. {
                    *color = f_pixel(ARGBF {
                        a: (slot.a / total) as f32,
                        r: (slot.r / total) as f32,
                        g: (slot.g / total) as f32,
                        b: (slot.b / total) as f32,
                    });
                } else {
                    // an unused entry; tiny bias keeps entries distinguishable
                    total = i as f64 / 1024.;
                }
            }
            *pop = PalPop::with_fixed(total as f32, pop.is_fixed());
        }
    }

    /// One refinement pass over the histogram. Returns the mean error.
    ///
    /// When `adjust_weights` is set, poorly matched entries get heavier, so
    /// the next mediancut trial spends more colors on them.
    pub fn iteration(hist: &mut HistogramInternal, palette: &mut PalF, adjust_weights: bool, use_subset_seeds: bool) -> f64 {
        if hist.items.is_empty() {
            return 0.;
        }

        let palette_len = palette.len();
        let total = hist.total_perceptual_weight;
        let n = Nearest::new(palette, use_subset_seeds);
        let tls = ThreadLocal::new();
        let total_diff: f64 = hist.items
            .par_chunks_mut(1024)
            .map(|chunk| {
                let kmeans = tls.get_or(|| RefCell::new(Kmeans::new(palette_len)));
                let mut kmeans = kmeans.borrow_mut();
                let mut chunk_diff = 0f64;
                for item in chunk {
                    let (matched, diff) = n.search(&item.color, item.likely_colormap_index);
                    item.likely_colormap_index = matched;
                    chunk_diff += f64::from(diff) * f64::from(item.perceptual_weight);
                    kmeans.update_color(item.color, item.perceptual_weight, matched);
                    if adjust_weights {
                        item.adjusted_weight = (item.perceptual_weight + item.adjusted_weight) * (1. + diff).sqrt();
                    }
                }
                chunk_diff
            })
            .sum();

        drop(n);
        if let Some(kmeans) = tls.into_iter().map(RefCell::into_inner).reduce(Kmeans::merge) {
            kmeans.finalize(palette);
        }
        total_diff / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hist::HistItem;
    use crate::pal::{gamma_lut, RGBA};

    fn hist_of(colors: &[(RGBA, f32)]) -> HistogramInternal {
        let lut = gamma_lut(0.45455);
        let items: Vec<_> = colors
            .iter()
            .map(|&(c, w)| HistItem {
                color: f_pixel::from_rgba(&lut, c),
                perceptual_weight: w,
                adjusted_weight: w,
                color_weight: 0.,
                sort_value: 0,
                likely_colormap_index: 0,
            })
            .collect();
        HistogramInternal {
            total_perceptual_weight: colors.iter().map(|&(_, w)| f64::from(w)).sum(),
            items: items.into_boxed_slice(),
            posterized: false,
        }
    }

    #[test]
    fn exact_palette_has_zero_error() {
        let lut = gamma_lut(0.45455);
        let colors = [RGBA::new(255, 0, 0, 255), RGBA::new(0, 0, 255, 255)];
        let mut hist = hist_of(&[(colors[0], 2.), (colors[1], 3.)]);
        let mut pal = PalF::new();
        for &c in &colors {
            pal.push(f_pixel::from_rgba(&lut, c), PalPop::new(1.));
        }
        let err = Kmeans::iteration(&mut hist, &mut pal, false, false);
        assert_eq!(err, 0.);
        // popularity now reflects the mapped weight
        assert!((pal.pops()[0].popularity() - 2.).abs() < 1e-6);
        assert!((pal.pops()[1].popularity() - 3.).abs() < 1e-6);
    }

    #[test]
    fn centroid_moves_toward_heavy_colors() {
        let lut = gamma_lut(0.45455);
        let dark = f_pixel::from_rgba(&lut, RGBA::new(10, 10, 10, 255));
        let mut hist = hist_of(&[
            (RGBA::new(10, 10, 10, 255), 100.),
            (RGBA::new(40, 40, 40, 255), 1.),
        ]);
        let mut pal = PalF::new();
        pal.push(f_pixel::from_rgba(&lut, RGBA::new(25, 25, 25, 255)), PalPop::new(1.));
        let before = pal.as_slice()[0].diff(&dark);
        Kmeans::iteration(&mut hist, &mut pal, false, false);
        let after = pal.as_slice()[0].diff(&dark);
        assert!(after < before);
    }

    #[test]
    fn fixed_entries_keep_their_color() {
        let lut = gamma_lut(0.45455);
        let black = f_pixel::from_rgba(&lut, RGBA::new(0, 0, 0, 255));
        let mut hist = hist_of(&[(RGBA::new(60, 60, 60, 255), 5.)]);
        let mut pal = PalF::new();
        pal.push(black, PalPop::new(0.).to_fixed());
        Kmeans::iteration(&mut hist, &mut pal, false, false);
        assert_eq!(pal.as_slice()[0], black);
        assert!(pal.pops()[0].is_fixed());
        assert!((pal.pops()[0].popularity() - 5.).abs() < 1e-6);
    }

    #[test]
    fn weight_adjustment_boosts_badly_matched_entries() {
        let lut = gamma_lut(0.45455);
        let mut hist = hist_of(&[
            (RGBA::new(0, 0, 0, 255), 1.),
            (RGBA::new(255, 255, 255, 255), 1.),
        ]);
        let mut pal = PalF::new();
        pal.push(f_pixel::from_rgba(&lut, RGBA::new(0, 0, 0, 255)), PalPop::new(1.));
        Kmeans::iteration(&mut hist, &mut pal, true, false);
        let white = hist.items.iter().find(|i| i.color.r > 0.5).unwrap();
        let black = hist.items.iter().find(|i| i.color.r < 0.5).unwrap();
        assert!(white.adjusted_weight > black.adjusted_weight);
    }
}
