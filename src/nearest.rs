//! Nearest-palette-entry search over a vantage-point tree.

use crate::pal::{f_pixel, PalF, PalIndex, MAX_COLORS, MAX_DIFF};
use crate::OrdFloat;
use arrayvec::ArrayVec;

pub(crate) struct Nearest<'pal> {
    map: &'pal PalF,
    root: Node,
    /// half the squared distance from entry i to its nearest other entry;
    /// any query closer than this provably has i as the answer
    nearest_other_color_dist: [f32; MAX_COLORS],
    /// entries seeded from the subset palette to tighten the initial
    /// candidate when the guess short-circuit misses
    subset_seeds: ArrayVec<PalIndex, MAX_COLORS>,
}

struct Node {
    vantage_point: f_pixel,
    radius: f32,
    idx: PalIndex,
    near: Option<Box<Node>>,
    far: Option<Box<Node>>,
}

impl<'pal> Nearest<'pal> {
    pub fn new(palette: &'pal PalF, use_subset_seeds: bool) -> Self {
        debug_assert!(!palette.as_slice().is_empty());
        let mut indexes: Vec<(f32, PalIndex)> = (0..palette.len())
            .map(|i| (0., i as PalIndex))
            .collect();
        let root = vp_create_node(&mut indexes, palette);

        let mut handle = Self {
            map: palette,
            root,
            nearest_other_color_dist: [0.; MAX_COLORS],
            subset_seeds: ArrayVec::new(),
        };

        for (i, color) in palette.as_slice().iter().enumerate() {
            let mut best = SearchCandidate {
                distance: MAX_DIFF as f32,
                idx: i as PalIndex,
                exclude: Some(i as PalIndex),
            };
            vp_search_node(&handle.root, color, &mut best);
            handle.nearest_other_color_dist[i] = best.distance * best.distance / 4.;
        }

        if use_subset_seeds {
            if let Some(subset) = palette.subset() {
                let full = palette.as_slice();
                let mut seen = [false; MAX_COLORS];
                for seed_color in subset.as_slice() {
                    let (best, _) = brute_force_nearest(full, seed_color);
                    if !seen[best as usize] {
                        seen[best as usize] = true;
                        handle.subset_seeds.push(best);
                    }
                }
            }
        }

        handle
    }

    /// Returns the index of the closest palette entry and the squared
    /// distance to it. `likely` is a guess (e.g. the match of the previous
    /// pixel); when the guess is close enough the tree isn't walked at all.
    #[inline]
    pub fn search(&self, px: &f_pixel, likely: PalIndex) -> (PalIndex, f32) {
        let likely = (likely as usize).min(self.map.len() - 1);
        let guess_diff = self.map.as_slice()[likely].diff(px);
        if guess_diff < self.nearest_other_color_dist[likely] {
            return (likely as PalIndex, guess_diff);
        }

        let mut best = SearchCandidate {
            distance: guess_diff.sqrt(),
            idx: likely as PalIndex,
            exclude: None,
        };
        for &seed in &self.subset_seeds {
            let d = self.map.as_slice()[seed as usize].diff(px).sqrt();
            if d < best.distance {
                best.distance = d;
                best.idx = seed;
            }
        }
        vp_search_node(&self.root, px, &mut best);
        (best.idx, best.distance * best.distance)
    }
}

struct SearchCandidate {
    distance: f32,
    idx: PalIndex,
    exclude: Option<PalIndex>,
}

/// Usually a vantage point should be the farthest point, but picking the
/// most popular entry turns out to make searches quicker
fn find_best_vantage_point(indexes: &[(f32, PalIndex)], palette: &PalF) -> usize {
    let pops = palette.pops();
    let mut best = 0;
    let mut best_popularity = pops[indexes[0].1 as usize].popularity();
    for (i, &(_, idx)) in indexes.iter().enumerate().skip(1) {
        if pops[idx as usize].popularity() > best_popularity {
            best_popularity = pops[idx as usize].popularity();
            best = i;
        }
    }
    best
}

fn vp_create_node(indexes: &mut [(f32, PalIndex)], palette: &PalF) -> Node {
    debug_assert!(!indexes.is_empty());
    let items = palette.as_slice();

    if indexes.len() == 1 {
        return Node {
            vantage_point: items[indexes[0].1 as usize],
            idx: indexes[0].1,
            radius: MAX_DIFF as f32,
            near: None,
            far: None,
        };
    }

    let ref_ = find_best_vantage_point(indexes, palette);
    let ref_idx = indexes[ref_].1;

    // the vantage point is included in this node, remove it from the rest
    let num_indexes = indexes.len() - 1;
    indexes[ref_] = indexes[num_indexes];
    let indexes = &mut indexes[..num_indexes];

    let vantage_point = items[ref_idx as usize];
    for i in indexes.iter_mut() {
        i.0 = vantage_point.diff(&items[i.1 as usize]);
    }
    indexes.sort_unstable_by_key(|&(d, _)| OrdFloat::new(d));

    // the remaining items split at the median distance
    let half_idx = indexes.len() / 2;
    let radius = indexes[half_idx].0.sqrt();

    let (near_half, far_half) = indexes.split_at_mut(half_idx);
    Node {
        vantage_point,
        idx: ref_idx,
        radius,
        near: if near_half.is_empty() { None } else { Some(Box::new(vp_create_node(near_half, palette))) },
        far: Some(Box::new(vp_create_node(far_half, palette))),
    }
}

fn vp_search_node(mut node: &Node, needle: &f_pixel, best_candidate: &mut SearchCandidate) {
    loop {
        let distance = node.vantage_point.diff(needle).sqrt();

        if distance < best_candidate.distance && best_candidate.exclude != Some(node.idx) {
            best_candidate.distance = distance;
            best_candidate.idx = node.idx;
        }

        // recurse towards the most likely side first to narrow the best
        // distance as soon as possible
        if distance < node.radius {
            if let Some(near) = &node.near {
                vp_search_node(near, needle, best_candidate);
            }
            // the final answer may be just outside the radius, but not
            // farther than the best distance found so far
            match &node.far {
                Some(far) if distance >= node.radius - best_candidate.distance => node = far,
                _ => return,
            }
        } else {
            if let Some(far) = &node.far {
                vp_search_node(far, needle, best_candidate);
            }
            match &node.near {
                Some(near) if distance <= node.radius + best_candidate.distance => node = near,
                _ => return,
            }
        }
    }
}

fn brute_force_nearest(palette: &[f_pixel], px: &f_pixel) -> (PalIndex, f32) {
    let mut best = 0;
    let mut best_diff = palette[0].diff(px);
    for (i, color) in palette.iter().enumerate().skip(1) {
        let diff = color.diff(px);
        if diff < best_diff {
            best_diff = diff;
            best = i;
        }
    }
    (best as PalIndex, best_diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::{gamma_lut, PalPop, RGBA};

    fn test_palette(colors: &[RGBA]) -> PalF {
        let lut = gamma_lut(0.45455);
        let mut pal = PalF::new();
        for (i, &c) in colors.iter().enumerate() {
            pal.push(f_pixel::from_rgba(&lut, c), PalPop::new(1. + i as f32));
        }
        pal
    }

    #[test]
    fn agrees_with_brute_force() {
        let colors: Vec<RGBA> = (0u32..64)
            .map(|i| {
                RGBA::new(
                    ((i * 97) % 256) as u8,
                    ((i * 41 + 13) % 256) as u8,
                    ((i * 211 + 5) % 256) as u8,
                    if i % 7 == 0 { 128 } else { 255 },
                )
            })
            .collect();
        let pal = test_palette(&colors);
        let n = Nearest::new(&pal, false);

        let lut = gamma_lut(0.45455);
        for r in (0..=255u32).step_by(17) {
            for b in (0..=255u32).step_by(23) {
                let q = f_pixel::from_rgba(&lut, RGBA::new(r as u8, 100, b as u8, 255));
                let (_, tree_diff) = n.search(&q, 0);
                let (_, brute_diff) = brute_force_nearest(pal.as_slice(), &q);
                assert!((tree_diff - brute_diff).abs() <= f32::EPSILON, "query {r},{b}: {tree_diff} vs {brute_diff}");
            }
        }
    }

    #[test]
    fn guess_short_circuit_is_consistent() {
        let colors: Vec<RGBA> = (0u32..32).map(|i| RGBA::new((i * 8) as u8, (255 - i * 8) as u8, 3, 255)).collect();
        let pal = test_palette(&colors);
        let n = Nearest::new(&pal, false);
        let lut = gamma_lut(0.45455);
        for (i, &c) in colors.iter().enumerate() {
            // query exactly at a palette color, with every possible guess
            let q = f_pixel::from_rgba(&lut, c);
            for guess in 0..colors.len() {
                let (idx, diff) = n.search(&q, guess as PalIndex);
                assert_eq!(diff, 0.);
                assert_eq!(idx as usize, i);
            }
        }
    }

    #[test]
    fn single_entry_palette() {
        let pal = test_palette(&[RGBA::new(1, 2, 3, 255)]);
        let n = Nearest::new(&pal, false);
        let lut = gamma_lut(0.45455);
        let q = f_pixel::from_rgba(&lut, RGBA::new(250, 250, 250, 255));
        let (idx, _) = n.search(&q, 0);
        assert_eq!(idx, 0);
    }
}
