//! Byte-map morphology used by the contrast/noise maps.

/// Blurs the map horizontally with a box of width `2*size` and writes the
/// result transposed, so two passes give a 2D blur
fn transposing_1d_blur(src: &[u8], dst: &mut [u8], width: usize, height: usize, size: usize) {
    assert!(size > 0);
    assert!(width >= 2 * size + 1);

    for (j, row) in src.chunks_exact(width).enumerate() {
        // seed the running sum as if pixels outside the line repeated the edge
        let mut sum = u32::from(row[0]) * size as u32;
        for &v in &row[..size] {
            sum += u32::from(v);
        }

        for i in 0..size {
            sum -= u32::from(row[0]);
            sum += u32::from(row[i + size]);
            dst[i * height + j] = (sum / (size as u32 * 2)) as u8;
        }

        for i in size..width - size {
            sum -= u32::from(row[i - size]);
            sum += u32::from(row[i + size]);
            dst[i * height + j] = (sum / (size as u32 * 2)) as u8;
        }

        for i in width - size..width {
            sum -= u32::from(row[i - size]);
            sum += u32::from(row[width - 1]);
            dst[i * height + j] = (sum / (size as u32 * 2)) as u8;
        }
    }
}

/// Picks the maximum of the 3x3 neighborhood of every pixel (blur + lighten)
pub(crate) fn max3(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    for j in 0..height {
        let row = &src[j * width..j * width + width];
        let prevrow = &src[j.saturating_sub(1) * width..];
        let nextrow = &src[(j + 1).min(height - 1) * width..];

        let mut prev;
        let mut curr = row[0];
        let mut next = row[0];
        let out = &mut dst[j * width..j * width + width];
        for i in 0..width - 1 {
            prev = curr;
            curr = next;
            next = row[i + 1];

            let t1 = prev.max(next);
            let t2 = nextrow[i].max(prevrow[i]);
            out[i] = curr.max(t1.max(t2));
        }
        let t1 = curr.max(next);
        let t2 = nextrow[width - 1].max(prevrow[width - 1]);
        out[width - 1] = t1.max(t2);
    }
}

/// Picks the minimum of the 3x3 neighborhood of every pixel (blur + darken)
pub(crate) fn min3(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    for j in 0..height {
        let row = &src[j * width..j * width + width];
        let prevrow = &src[j.saturating_sub(1) * width..];
        let nextrow = &src[(j + 1).min(height - 1) * width..];

        let mut prev;
        let mut curr = row[0];
        let mut next = row[0];
        let out = &mut dst[j * width..j * width + width];
        for i in 0..width - 1 {
            prev = curr;
            curr = next;
            next = row[i + 1];

            let t1 = prev.min(next);
            let t2 = nextrow[i].min(prevrow[i]);
            out[i] = curr.min(t1.min(t2));
        }
        let t1 = curr.min(next);
        let t2 = nextrow[width - 1].min(prevrow[width - 1]);
        out[width - 1] = t1.min(t2);
    }
}

/// Box-blurs `buf` in place with radius `size`, using `tmp` as scratch.
/// Images smaller than the kernel are left untouched.
pub(crate) fn blur(buf: &mut [u8], tmp: &mut [u8], width: usize, height: usize, size: usize) {
    assert!(size > 0);
    if width < 2 * size + 1 || height < 2 * size + 1 {
        return;
    }
    transposing_1d_blur(buf, tmp, width, height, size);
    transposing_1d_blur(tmp, buf, height, width, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max3_dilates_single_pixel() {
        let mut src = vec![0u8; 25];
        src[12] = 255; // center of 5x5
        let mut dst = vec![0u8; 25];
        max3(&src, &mut dst, 5, 5);
        for j in 0..5 {
            for i in 0..5 {
                let expected = if (1..=3).contains(&i) && (1..=3).contains(&j) { 255 } else { 0 };
                assert_eq!(dst[j * 5 + i], expected, "at {i},{j}");
            }
        }
    }

    #[test]
    fn min3_erodes_single_hole() {
        let mut src = vec![255u8; 25];
        src[12] = 0;
        let mut dst = vec![255u8; 25];
        min3(&src, &mut dst, 5, 5);
        assert_eq!(dst[12], 0);
        assert_eq!(dst[6], 0);
        assert_eq!(dst[0], 255);
    }

    #[test]
    fn min3_then_max3_removes_speck() {
        let mut src = vec![0u8; 49];
        src[24] = 255; // lone bright pixel in 7x7
        let mut tmp = vec![0u8; 49];
        let mut out = vec![0u8; 49];
        min3(&src, &mut tmp, 7, 7);
        max3(&tmp, &mut out, 7, 7);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn blur_preserves_flat_field() {
        let mut buf = vec![100u8; 9 * 9];
        let mut tmp = vec![0u8; 9 * 9];
        blur(&mut buf, &mut tmp, 9, 9, 3);
        assert!(buf.iter().all(|&v| v == 100));
    }

    #[test]
    fn blur_skips_tiny_images() {
        let mut buf = vec![1u8, 2, 3, 4];
        let mut tmp = vec![0u8; 4];
        blur(&mut buf, &mut tmp, 2, 2, 3);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn blur_smears_impulse() {
        let mut buf = vec![0u8; 15 * 15];
        buf[7 * 15 + 7] = 240;
        let mut tmp = vec![0u8; 15 * 15];
        blur(&mut buf, &mut tmp, 15, 15, 3);
        let center = buf[7 * 15 + 7];
        assert!(center > 0 && center < 240);
        assert!(buf[7 * 15 + 6] > 0);
        assert!(buf[6 * 15 + 7] > 0);
    }
}
