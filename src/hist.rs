use crate::attr::Attributes;
use crate::error::Error;
use crate::image::Image;
use crate::pal::{f_pixel, PalIndex, RGBA, MAX_COLORS};
use crate::rows::temp_buf;
use arrayvec::ArrayVec;
use fallible_collections::FallibleVec;

/// Colors that must appear in the palette, in the order they were added
pub(crate) type FixedColorsSet = ArrayVec<f_pixel, MAX_COLORS>;

/// One distinct (posterized) color of the image and its weight
pub(crate) struct HistItem {
    pub color: f_pixel,
    /// number of pixels weighted by the importance of their area
    pub perceptual_weight: f32,
    /// weight tweaked by the feedback loop to influence the next mediancut
    pub adjusted_weight: f32,
    /// scratch recomputed every time a histogram subset is sorted
    pub color_weight: f32,
    pub sort_value: u32,
    /// cached last nearest-palette guess; stale values are harmless
    pub likely_colormap_index: PalIndex,
}

pub(crate) struct HistogramInternal {
    pub items: Box<[HistItem]>,
    pub total_perceptual_weight: f64,
    /// colors were bucketed with reduced precision, so a perfect palette
    /// match is not possible anyway
    pub posterized: bool,
}

#[derive(Copy, Clone)]
struct HashEntry {
    color: u32,
    perceptual_weight: f32,
}

/// Two colors stored inline to keep most buckets allocation-free
#[derive(Default, Clone)]
struct Bucket {
    inline: ArrayVec<HashEntry, 2>,
    other_items: Vec<HashEntry>,
}

/// Hash table of posterized colors. Rebuilt with a higher `ignorebits` when
/// the image has more distinct colors than the budget allows.
struct AcolorHash {
    buckets: Box<[Bucket]>,
    ignorebits: u8,
    maxcolors: usize,
    colors: usize,
}

impl AcolorHash {
    fn new(maxcolors: usize, surface: usize, ignorebits: u8) -> Result<Self, Error> {
        let estimated_colors = maxcolors.min(surface / (ignorebits as usize + if surface > 512 * 512 { 5 } else { 4 }).max(1));
        let hash_size = if estimated_colors < 66_000 { 6673 } else if estimated_colors < 200_000 { 12011 } else { 24019 };

        let mut buckets: Vec<Bucket> = FallibleVec::try_with_capacity(hash_size)?;
        buckets.resize(hash_size, Bucket::default());
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            ignorebits,
            maxcolors,
            colors: 0,
        })
    }

    /// Adds one row of pixels. Returns false when the distinct-color budget
    /// would be exceeded; the whole pass must then restart with coarser
    /// posterization.
    #[inline(never)]
    fn add_row(&mut self, row: &[RGBA], importance_map: Option<&[u8]>) -> bool {
        let ignorebits = u32::from(self.ignorebits);
        let channel_mask = (255u32 >> ignorebits) << ignorebits;
        let channel_hmask = (255u32 >> ignorebits) ^ 0xFF;
        let posterize_mask = channel_mask * 0x0101_0101;
        let posterize_high_mask = channel_hmask * 0x0101_0101;
        let hash_size = self.buckets.len() as u32;

        for (col, px) in row.iter().enumerate() {
            let boost = match importance_map {
                Some(m) => 0.5 + f32::from(m[col]) / 255.,
                None => 1.,
            };

            // fully transparent pixels may have any RGB value; merge them all
            let key = if px.a == 0 {
                0
            } else {
                let packed = u32::from_le_bytes([px.r, px.g, px.b, px.a]);
                // the mask posterizes all 4 channels in one go; replicating
                // the top bits into the low ones keeps white white
                (packed & posterize_mask) | ((packed & posterize_high_mask) >> (8 - ignorebits))
            };
            let hash = (key % hash_size) as usize;

            let bucket = &mut self.buckets[hash];
            if let Some(entry) = bucket.inline.iter_mut().chain(bucket.other_items.iter_mut()).find(|e| e.color == key) {
                entry.perceptual_weight += boost;
                continue;
            }

            if self.colors >= self.maxcolors {
                return false;
            }
            self.colors += 1;
            let entry = HashEntry { color: key, perceptual_weight: boost };
            if bucket.inline.try_push(entry).is_err() {
                bucket.other_items.push(entry);
            }
        }
        true
    }

    fn into_histogram(self, lut: &[f32; 256]) -> Result<HistogramInternal, Error> {
        let mut items: Vec<HistItem> = FallibleVec::try_with_capacity(self.colors)?;
        let mut total_weight = 0f64;

        for bucket in self.buckets.iter() {
            for entry in bucket.inline.iter().chain(&bucket.other_items) {
                let [r, g, b, a] = entry.color.to_le_bytes();
                total_weight += f64::from(entry.perceptual_weight);
                items.push(HistItem {
                    color: f_pixel::from_rgba(lut, RGBA { r, g, b, a }),
                    perceptual_weight: entry.perceptual_weight,
                    adjusted_weight: entry.perceptual_weight,
                    color_weight: 0.,
                    sort_value: 0,
                    likely_colormap_index: 0,
                });
            }
        }

        Ok(HistogramInternal {
            items: items.into_boxed_slice(),
            total_perceptual_weight: total_weight,
            posterized: self.ignorebits > 0,
        })
    }
}

/// Counts how many times each distinct color occurs, weighted by the noise
/// map when there is one. Color accuracy in noisy areas matters less, and
/// the noise map excludes edges so anti-aliasing is preserved.
pub(crate) fn build_histogram(attr: &Attributes, image: &mut Image<'_>) -> Result<HistogramInternal, Error> {
    if attr.use_contrast_maps && image.importance_map.is_none() && image.edges.is_none() {
        image.contrast_maps()?;
    }

    let cols = image.width();
    let rows = image.height();
    let maxcolors = attr.max_histogram_entries as usize;
    let mut ignorebits = attr.posterize_bits();

    let hist = 'rebuild: loop {
        let mut acht = AcolorHash::new(maxcolors, cols * rows, ignorebits)?;
        let mut temp_row = temp_buf::<RGBA>(cols);
        for row in 0..rows {
            let row_pixels = image.px.row_rgba(&mut temp_row, row);
            let importance = image.importance_map.as_deref().map(|m| &m[row * cols..row * cols + cols]);
            if !acht.add_row(row_pixels, importance) {
                ignorebits += 1;
                attr.verbose_print(format!("  too many colors! Scaling colors to improve clustering... {ignorebits}"));
                continue 'rebuild;
            }
        }
        break acht.into_histogram(image.px.gamma_lut())?;
    };

    // the noise map has served its purpose; edges stay for dithering
    image.importance_map = None;

    attr.verbose_print(format!("  made histogram...{} colors found", hist.items.len()));
    Ok(hist)
}
