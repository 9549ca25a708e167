//! Median-cut palette generation.
//!
//! Based on Paul Heckbert's "Color Image Quantization for Frame Buffer
//! Display", SIGGRAPH 1982, with variance-driven box selection and a
//! weighted median split.

use crate::hist::{HistItem, HistogramInternal};
use crate::pal::{f_pixel, PalF, PalIndex, PalLen, ARGBF, MIN_OPAQUE_A};

/// A contiguous slice of the histogram treated as one cluster
struct MBox {
    /// weighted centroid of the colors in the box
    color: f_pixel,
    /// per-channel weighted variance
    variance: ARGBF,
    /// sum of adjusted weights
    sum: f64,
    /// worst distance from the centroid
    max_error: f64,
    /// weighted total error from the centroid; `None` = stale
    total_error: Option<f64>,
    ind: usize,
    colors: usize,
}

impl MBox {
    fn new(ind: usize, colors: usize, items: &[HistItem], min_opaque_val: f32, center: f_pixel) -> Self {
        let slice = &items[ind..ind + colors];
        let color = averagepixels(slice, min_opaque_val, center);
        let mut b = Self {
            color,
            variance: ARGBF::default(),
            sum: slice.iter().map(|i| f64::from(i.adjusted_weight)).sum(),
            max_error: 0.,
            total_error: None,
            ind,
            colors,
        };
        b.variance = box_variance(slice, color);
        b.max_error = box_max_error(slice, color);
        b
    }

    fn items<'a>(&self, items: &'a [HistItem]) -> &'a [HistItem] {
        &items[self.ind..self.ind + self.colors]
    }

    fn items_mut<'a>(&self, items: &'a mut [HistItem]) -> &'a mut [HistItem] {
        &mut items[self.ind..self.ind + self.colors]
    }
}

fn variance_diff(val: f64, good_enough: f64) -> f64 {
    let val = val * val;
    if val < good_enough * good_enough {
        return val * 0.25;
    }
    val
}

/// Weighted per-channel variance, used to pick the channel to split by
fn box_variance(items: &[HistItem], mean: f_pixel) -> ARGBF {
    let mut variance_a = 0f64;
    let mut variance_r = 0f64;
    let mut variance_g = 0f64;
    let mut variance_b = 0f64;
    for item in items {
        let px = item.color;
        let weight = f64::from(item.adjusted_weight);
        variance_a += variance_diff(f64::from(mean.a - px.a), 2. / 256.) * weight;
        variance_r += variance_diff(f64::from(mean.r - px.r), 1. / 256.) * weight;
        variance_g += variance_diff(f64::from(mean.g - px.g), 1. / 256.) * weight;
        variance_b += variance_diff(f64::from(mean.b - px.b), 1. / 256.) * weight;
    }
    ARGBF {
        a: (variance_a * (4. / 16.)) as f32,
        r: (variance_r * (7. / 16.)) as f32,
        g: (variance_g * (9. / 16.)) as f32,
        b: (variance_b * (5. / 16.)) as f32,
    }
}

fn box_max_error(items: &[HistItem], mean: f_pixel) -> f64 {
    items.iter().map(|i| f64::from(mean.diff(&i.color))).fold(0., f64::max)
}

fn box_error(bx: &MBox, items: &[HistItem]) -> f64 {
    let avg = bx.color;
    bx.items(items).iter().map(|i| f64::from(avg.diff(&i.color)) * f64::from(i.perceptual_weight)).sum()
}

fn channel(px: &f_pixel, ch: usize) -> f32 {
    match ch {
        0 => px.a,
        1 => px.r,
        2 => px.g,
        _ => px.b,
    }
}

fn qsort_pivot(base: &[HistItem]) -> usize {
    let len = base.len();
    if len < 32 {
        return len / 2;
    }
    let (aidx, bidx, cidx) = (8, len / 2, len - 1);
    let a = base[aidx].sort_value;
    let b = base[bidx].sort_value;
    let c = base[cidx].sort_value;
    if a < b {
        if b < c { bidx } else if a < c { cidx } else { aidx }
    } else if b > c {
        bidx
    } else if a < c {
        aidx
    } else {
        cidx
    }
}

/// Partitions with values >= pivot on the left; returns the pivot position
fn qsort_partition(base: &mut [HistItem]) -> usize {
    let len = base.len();
    let mut l = 1;
    let mut r = len;
    if len >= 8 {
        let pivot = qsort_pivot(base);
        base.swap(0, pivot);
    }
    let pivot_value = base[0].sort_value;
    while l < r {
        if base[l].sort_value >= pivot_value {
            l += 1;
        } else {
            loop {
                r -= 1;
                if !(l < r && base[r].sort_value <= pivot_value) {
                    break;
                }
            }
            base.swap(l, r);
        }
    }
    l -= 1;
    base.swap(0, l);
    l
}

/// Quick select: sorts only as much as needed to place `sort_start` correctly
fn hist_item_sort_range(items: &mut [HistItem], mut sort_start: usize) {
    let mut lo = 0;
    let mut len = items.len();
    loop {
        let l = qsort_partition(&mut items[lo..lo + len]);
        let r = l + 1;
        if l > 0 && sort_start < l {
            len = l;
        } else if r < len && sort_start > r {
            lo += r;
            len -= r;
            sort_start -= r;
        } else {
            break;
        }
    }
}

/// Sorts just enough to locate where the cumulative `color_weight` crosses
/// `halfvar`; returns the index of the crossing entry
fn hist_item_sort_halfvar(items: &mut [HistItem], lowervar: &mut f64, halfvar: f64) -> Option<usize> {
    let total_len = items.len();
    let mut base = 0;
    let mut len = total_len;
    loop {
        let l = qsort_partition(&mut items[base..base + len]);
        let r = l + 1;

        // if the sum of the left side stays under half it needn't be sorted
        let mut tmpsum = *lowervar;
        let mut t = 0;
        while t <= l && tmpsum < halfvar {
            tmpsum += f64::from(items[base + t].color_weight);
            t += 1;
        }

        if tmpsum < halfvar {
            *lowervar = tmpsum;
        } else if l > 0 {
            if let Some(res) = hist_item_sort_halfvar(&mut items[base..base + l], lowervar, halfvar) {
                return Some(base + res);
            }
        } else {
            // end of the left recursion; runs in order from the first entry
            *lowervar += f64::from(items[base].color_weight);
            if *lowervar > halfvar {
                return Some(base);
            }
        }

        if len > r {
            base += r;
            len -= r;
        } else {
            let i = (base + r).min(total_len - 1);
            *lowervar += f64::from(items[i].color_weight);
            return if *lowervar > halfvar { Some(base + r) } else { None };
        }
    }
}

/// Finds the median color of a box by sorting only the middle of it
fn get_median(bx: &MBox, items: &mut [HistItem]) -> f_pixel {
    let median_start = (bx.colors - 1) / 2;
    let slice = bx.items_mut(items);
    hist_item_sort_range(slice, median_start);
    if bx.colors & 1 == 1 {
        return slice[median_start].color;
    }
    // the second color is not guaranteed to be in its sorted place, but
    // most of the time it's close enough to be useful
    averagepixels(&slice[median_start..median_start + 2], 1., f_pixel(ARGBF { a: 0.5, r: 0.5, g: 0.5, b: 0.5 }))
}

fn color_weight(median: f_pixel, item: &HistItem) -> f64 {
    let mut diff = f64::from(median.diff(&item.color));
    // if the color is "good enough", don't split further
    if diff < 2. / 256. / 256. {
        diff /= 2.;
    }
    diff.sqrt() * ((1. + f64::from(item.adjusted_weight)).sqrt() - 1.)
}

/// Orders the channels by variance and packs a sort key per entry.
/// Only the first channel really matters; when median cut is retried with
/// different weights, sort randomness shouldn't influence the outcome.
/// Returns half the total `color_weight` of the box, the split target.
fn prepare_sort(bx: &MBox, items: &mut [HistItem]) -> f64 {
    let mut channels: [(usize, f32); 4] = [
        (1, bx.variance.r),
        (2, bx.variance.g),
        (3, bx.variance.b),
        (0, bx.variance.a),
    ];
    channels.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    for item in bx.items_mut(items) {
        let px = item.color;
        let primary = f64::from(channel(&px, channels[0].0));
        let tangent = f64::from(channel(&px, channels[2].0))
            + f64::from(channel(&px, channels[1].0)) / 2.
            + f64::from(channel(&px, channels[3].0)) / 4.;
        item.sort_value = (((primary * 65535.) as u32) << 16) | ((tangent * 65535.) as u32);
    }

    let median = get_median(bx, items);

    let mut totalvar = 0f64;
    for item in bx.items_mut(items) {
        let w = color_weight(median, item);
        item.color_weight = w as f32;
        totalvar += w;
    }
    totalvar / 2.
}

/// Picks the box most worth splitting, or None when no box has 2 colors.
/// Looks only at the maximum variance, because that's the split channel.
fn best_splittable_box(bv: &[MBox], max_mse: f64) -> Option<usize> {
    let mut best = None;
    let mut maxsum = 0f64;
    for (i, bx) in bv.iter().enumerate() {
        if bx.colors < 2 {
            continue;
        }
        let cv = bx.variance.r.max(bx.variance.g).max(bx.variance.b);
        let mut thissum = bx.sum * f64::from(bx.variance.a.max(cv));
        if bx.max_error > max_mse {
            thissum = thissum * bx.max_error / max_mse;
        }
        if thissum > maxsum {
            maxsum = thissum;
            best = Some(i);
        }
    }
    best
}

fn total_box_error_below_target(mut target_mse: f64, bv: &mut [MBox], hist: &HistogramInternal) -> bool {
    target_mse *= hist.total_perceptual_weight;
    let mut total_error = 0f64;

    // the error is only recalculated for boxes that changed
    for bx in bv.iter() {
        if let Some(e) = bx.total_error {
            total_error += e;
        }
        if total_error > target_mse {
            return false;
        }
    }
    for bx in bv.iter_mut() {
        if bx.total_error.is_none() {
            let e = box_error(bx, &hist.items);
            bx.total_error = Some(e);
            total_error += e;
        }
        if total_error > target_mse {
            return false;
        }
    }
    true
}

/// Splits the histogram into up to `newcolors` boxes.
///
/// Instead of the classic even-population split this balances
/// `sqrt(popularity) * variance`, so boxes with similar colors can stay
/// large, and the median (not the mean) is used as the expected value.
pub(crate) fn mediancut(hist: &mut HistogramInternal, newcolors: PalLen, target_mse: f64, max_mse_per_color: f64, min_opaque_val: f32) -> PalF {
    let newcolors = newcolors as usize;
    if newcolors == 0 || hist.items.is_empty() {
        return PalF::new();
    }

    let center = f_pixel(ARGBF { a: 0.5, r: 0.5, g: 0.5, b: 0.5 });
    let mut bv = Vec::with_capacity(newcolors);
    bv.push(MBox::new(0, hist.items.len(), &hist.items, min_opaque_val, center));

    // remember a smaller palette for seeding nearest-color searches
    let mut representative_subset = None;
    let subset_size = (newcolors as f32).powf(0.7).ceil() as usize;

    while bv.len() < newcolors {
        if bv.len() == subset_size {
            representative_subset = Some(palette_from_boxes(&bv, &hist.items));
        }

        // split boxes that exceed the quality limit first (to keep colors for
        // things like a lone green pixel), then widen the limit so large
        // smooth gradients also get their colors
        let current_max_mse = max_mse_per_color + (bv.len() as f64 / newcolors as f64) * 16. * max_mse_per_color;
        let bi = match best_splittable_box(&bv, current_max_mse) {
            Some(bi) => bi,
            None => break, // ran out of colors
        };

        let indx = bv[bi].ind;
        let clrs = bv[bi].colors;
        let halfvar = prepare_sort(&bv[bi], &mut hist.items);
        let mut lowervar = 0.;

        let break_p = hist_item_sort_halfvar(&mut hist.items[indx..indx + clrs], &mut lowervar, halfvar);
        let break_at = match break_p {
            Some(p) => (p + 1).min(clrs - 1),
            None => clrs - 1,
        };

        let previous_center = bv[bi].color;
        bv[bi] = MBox::new(indx, break_at, &hist.items, min_opaque_val, previous_center);
        bv.push(MBox::new(indx + break_at, clrs - break_at, &hist.items, min_opaque_val, previous_center));

        if total_box_error_below_target(target_mse, &mut bv, hist) {
            break;
        }
    }

    let mut palette = palette_from_boxes(&bv, &hist.items);
    palette.set_subset(representative_subset);
    adjust_histogram(&mut hist.items, palette.as_slice(), &bv);
    palette
}

/// A representative color per box: its centroid, with the total popularity
/// of the colors it covers
fn palette_from_boxes(bv: &[MBox], items: &[HistItem]) -> PalF {
    let mut palette = PalF::new();
    for bx in bv {
        let mut popularity = 0.;
        for item in bx.items(items) {
            popularity += item.perceptual_weight;
        }
        palette.push(bx.color, crate::pal::PalPop::new(popularity));
    }
    palette
}

/// Bumps weights of entries poorly served by their box, and seeds the
/// nearest-search guess with the box index
fn adjust_histogram(items: &mut [HistItem], palette: &[f_pixel], bv: &[MBox]) {
    for (bi, bx) in bv.iter().enumerate() {
        let center = palette[bi];
        for item in &mut items[bx.ind..bx.ind + bx.colors] {
            item.adjusted_weight *= (1. + center.diff(&item.color) / 4.).sqrt();
            item.likely_colormap_index = bi as PalIndex;
        }
    }
}

/// Weighted centroid of a slice of histogram entries.
///
/// The first pass settles the final opacity so colors can be blended at it;
/// entries further from the previous center get extra weight, which keeps
/// whites from fading and images from desaturating.
pub(crate) fn averagepixels(items: &[HistItem], min_opaque_val: f32, center: f_pixel) -> f_pixel {
    let mut new_a = 0f64;
    let mut sum = 0f64;
    let mut maxa = 0f32;

    for item in items {
        let px = item.color;
        new_a += f64::from(px.a) * f64::from(item.adjusted_weight);
        sum += f64::from(item.adjusted_weight);
        if px.a > maxa {
            maxa = px.a;
        }
    }
    if sum > 0. {
        new_a /= sum;
    }
    // if there was at least one completely opaque color, round the result
    // to opaque as well
    if new_a >= f64::from(min_opaque_val) && maxa >= MIN_OPAQUE_A {
        new_a = 1.;
    }

    let mut r = 0f64;
    let mut g = 0f64;
    let mut b = 0f64;
    let mut a = 0f64;
    let mut sum = 0f64;
    for item in items.iter().rev() {
        let mut px = item.color;
        let mut weight = 1f64;

        let tmp = f64::from(center.r - px.r);
        weight += tmp * tmp;
        let tmp = f64::from(center.g - px.g);
        weight += tmp * tmp;
        let tmp = f64::from(center.b - px.b);
        weight += tmp * tmp;

        weight *= f64::from(item.adjusted_weight);
        sum += weight;

        if px.a > 0. {
            px.r /= px.a;
            px.g /= px.a;
            px.b /= px.a;
        }

        r += f64::from(px.r) * new_a * weight;
        g += f64::from(px.g) * new_a * weight;
        b += f64::from(px.b) * new_a * weight;
        a += new_a * weight;
    }

    if sum > 0. {
        r /= sum;
        g /= sum;
        b /= sum;
        a /= sum;
    }

    debug_assert!(!r.is_nan() && !g.is_nan() && !b.is_nan() && !a.is_nan());
    f_pixel(ARGBF { a: a as f32, r: r as f32, g: g as f32, b: b as f32 })
}
