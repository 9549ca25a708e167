use alphaquant::{Attributes, ControlFlow, Error, RGBA};
use std::mem::MaybeUninit;

fn single_threaded<T>(f: impl FnOnce() -> T + Send) -> T
where T: Send {
    rayon::ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .unwrap()
        .install(f)
}

#[test]
fn single_solid_pixel() {
    let bitmap = [RGBA::new(255, 0, 0, 255)];
    let mut attr = Attributes::new();
    attr.set_max_colors(2).unwrap();
    let mut img = attr.new_image(&bitmap, 1, 1, 0.45455).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();

    let (palette, pixels) = res.remapped(&mut img).unwrap();
    assert_eq!(palette.len(), 1);
    assert_eq!(palette[0], RGBA::new(255, 0, 0, 255));
    assert_eq!(pixels, vec![0]);
    assert_eq!(res.quantization_error(), Some(0.));
    assert_eq!(res.remapping_error(), Some(0.));
}

#[test]
fn two_colors_survive_exactly() {
    let bitmap = [RGBA::new(255, 0, 0, 255), RGBA::new(0, 0, 255, 255)];
    let mut attr = Attributes::new();
    attr.set_max_colors(2).unwrap();
    let mut img = attr.new_image(&bitmap, 2, 1, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();

    let (palette, pixels) = res.remapped(&mut img).unwrap();
    assert_eq!(palette.len(), 2);
    for (px, idx) in bitmap.iter().zip(&pixels) {
        assert_eq!(palette[*idx as usize], *px);
    }
    assert_eq!(res.remapping_error(), Some(0.));
}

#[test]
fn fully_transparent_pixels_merge() {
    let bitmap = [
        RGBA::new(10, 20, 30, 0),
        RGBA::new(40, 50, 60, 0),
        RGBA::new(0, 0, 0, 0),
        RGBA::new(128, 128, 128, 0),
    ];
    let mut attr = Attributes::new();
    attr.set_max_colors(8).unwrap();
    let mut img = attr.new_image(&bitmap, 4, 1, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();

    let (palette, pixels) = res.remapped(&mut img).unwrap();
    assert_eq!(palette.len(), 1);
    assert_eq!(palette[0].a, 0);
    assert_eq!(pixels, vec![0, 0, 0, 0]);
    assert_eq!(res.remapping_error(), Some(0.));
}

#[test]
fn fixed_color_is_honored() {
    let bitmap = [RGBA::new(255, 255, 255, 255)];
    let mut attr = Attributes::new();
    attr.set_max_colors(2).unwrap();
    let mut img = attr.new_image(&bitmap, 1, 1, 0.).unwrap();
    img.add_fixed_color(RGBA::new(0, 0, 0, 255)).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();

    let (palette, pixels) = res.remapped(&mut img).unwrap();
    assert_eq!(palette.len(), 2);
    // the fixed color comes first, exactly as added
    assert_eq!(palette[0], RGBA::new(0, 0, 0, 255));
    assert!(palette.contains(&RGBA::new(255, 255, 255, 255)));
    // the white pixel maps to the white entry, not the fixed black
    assert_eq!(palette[pixels[0] as usize], RGBA::new(255, 255, 255, 255));
}

#[test]
fn progress_callback_can_abort_quantization() {
    let bitmap = vec![RGBA::new(100, 150, 200, 255); 16];
    let mut attr = Attributes::new();
    attr.set_progress_callback(|_| ControlFlow::Break);
    let mut img = attr.new_image(&bitmap, 4, 4, 0.).unwrap();
    assert_eq!(attr.quantize(&mut img).err(), Some(Error::Aborted));
}

#[test]
fn progress_callback_can_abort_remapping() {
    let bitmap = vec![RGBA::new(100, 150, 200, 255); 16];
    let attr = Attributes::new();
    let mut img = attr.new_image(&bitmap, 4, 4, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    res.set_progress_callback(|_| ControlFlow::Break);
    assert_eq!(res.remapped(&mut img).err(), Some(Error::Aborted));
}

#[test]
fn short_output_buffer_is_rejected_untouched() {
    let bitmap = vec![RGBA::new(9, 9, 9, 255); 16];
    let attr = Attributes::new();
    let mut img = attr.new_image(&bitmap, 4, 4, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();

    let mut buf = [MaybeUninit::new(77u8); 15];
    assert_eq!(res.remap_into(&mut img, &mut buf).err(), Some(Error::BufferTooSmall));
    for b in &buf {
        assert_eq!(unsafe { b.assume_init() }, 77);
    }
}

fn gradient(width: usize, height: usize) -> Vec<RGBA> {
    let mut px = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            px.push(RGBA::new(
                (x * 255 / width.max(1)) as u8,
                (y * 255 / height.max(1)) as u8,
                ((x + y) * 127 / (width + height)) as u8,
                255,
            ));
        }
    }
    px
}

#[test]
fn palette_size_is_bounded_and_reached() {
    let bitmap = gradient(64, 64);
    let mut attr = Attributes::new();
    attr.set_max_colors(16).unwrap();
    let mut img = attr.new_image(&bitmap, 64, 64, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (palette, pixels) = res.remapped(&mut img).unwrap();

    // far more than 16 distinct input colors and a zero target error,
    // so the whole budget must be used
    assert_eq!(palette.len(), 16);
    assert!(pixels.iter().all(|&i| (i as usize) < palette.len()));
}

#[test]
fn low_color_images_roundtrip_exactly() {
    let colors = [
        RGBA::new(255, 0, 0, 255),
        RGBA::new(0, 255, 0, 255),
        RGBA::new(0, 0, 255, 255),
        RGBA::new(10, 20, 30, 128),
    ];
    let bitmap: Vec<RGBA> = (0..64).map(|i| colors[i % colors.len()]).collect();
    let mut attr = Attributes::new();
    attr.set_max_colors(8).unwrap();
    let mut img = attr.new_image(&bitmap, 8, 8, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (palette, pixels) = res.remapped(&mut img).unwrap();

    assert_eq!(palette.len(), colors.len());
    for c in &colors {
        assert!(palette.contains(c), "palette is missing {c:?}");
    }
    for (px, idx) in bitmap.iter().zip(&pixels) {
        assert_eq!(palette[*idx as usize], *px);
    }
    assert_eq!(res.remapping_error(), Some(0.));
}

#[test]
fn single_threaded_runs_are_deterministic() {
    let bitmap = gradient(48, 48);
    let run = || {
        single_threaded(|| {
            let mut attr = Attributes::new();
            attr.set_max_colors(32).unwrap();
            let mut img = attr.new_image(&bitmap, 48, 48, 0.).unwrap();
            let mut res = attr.quantize(&mut img).unwrap();
            res.set_dithering_level(1.).unwrap();
            res.remapped(&mut img).unwrap()
        })
    };
    let (pal_a, px_a) = run();
    let (pal_b, px_b) = run();
    assert_eq!(pal_a, pal_b);
    assert_eq!(px_a, px_b);
}

#[test]
fn dithered_output_is_valid_and_reproducible() {
    let bitmap = gradient(32, 32);
    let mut attr = Attributes::new();
    attr.set_max_colors(8).unwrap();
    let mut img = attr.new_image(&bitmap, 32, 32, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    res.set_dithering_level(1.).unwrap();

    // the first remap also derives the dither map from the edges map
    let (palette, pixels) = res.remapped(&mut img).unwrap();
    assert!(pixels.iter().all(|&i| (i as usize) < palette.len()));

    // once the dither map exists the remap is a pure function of the result
    let (_, second) = res.remapped(&mut img).unwrap();
    let (_, third) = res.remapped(&mut img).unwrap();
    assert_eq!(second, third);
}

#[test]
fn posterized_output_is_idempotent() {
    fn posterize(c: u8, bits: u8) -> u8 {
        (c & !((1 << bits) - 1)) | (c >> (8 - bits))
    }

    let bitmap = gradient(32, 32);
    let mut attr = Attributes::new();
    attr.set_max_colors(16).unwrap();
    attr.set_min_posterization(2).unwrap();
    let mut img = attr.new_image(&bitmap, 32, 32, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (palette, _) = res.remapped(&mut img).unwrap();

    for color in &palette {
        assert_eq!(color.r, posterize(color.r, 2));
        assert_eq!(color.g, posterize(color.g, 2));
        assert_eq!(color.b, posterize(color.b, 2));
        assert_eq!(color.a, posterize(color.a, 2));
    }
}

#[test]
fn impossible_quality_fails_cleanly() {
    let bitmap = gradient(64, 64);
    let mut attr = Attributes::new();
    attr.set_max_colors(4).unwrap();
    attr.set_quality(100, 100).unwrap();
    let mut img = attr.new_image(&bitmap, 64, 64, 0.).unwrap();
    assert_eq!(attr.quantize(&mut img).err(), Some(Error::QualityTooLow));
}

#[test]
fn result_setters_validate_ranges() {
    let bitmap = [RGBA::new(1, 2, 3, 255)];
    let attr = Attributes::new();
    let mut img = attr.new_image(&bitmap, 1, 1, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    assert_eq!(res.set_dithering_level(1.5).err(), Some(Error::ValueOutOfRange));
    assert_eq!(res.set_output_gamma(0.).err(), Some(Error::ValueOutOfRange));
    assert_eq!(res.set_output_gamma(1.).err(), Some(Error::ValueOutOfRange));
    assert!(res.set_output_gamma(0.5).is_ok());
}

#[test]
fn zero_dither_level_matches_plain_remap() {
    let bitmap = gradient(24, 24);
    let mut attr = Attributes::new();
    attr.set_max_colors(8).unwrap();

    let run = |dither: Option<f32>| {
        single_threaded(|| {
            let mut img = attr.new_image(&bitmap, 24, 24, 0.).unwrap();
            let mut res = attr.quantize(&mut img).unwrap();
            if let Some(d) = dither {
                res.set_dithering_level(d).unwrap();
            }
            res.remapped(&mut img).unwrap()
        })
    };

    let (pal_plain, px_plain) = run(None);
    let (pal_zero, px_zero) = run(Some(0.));
    assert_eq!(pal_plain, pal_zero);
    assert_eq!(px_plain, px_zero);
}

#[test]
fn callback_image_source_works() {
    let mut attr = Attributes::new();
    attr.set_max_colors(4).unwrap();
    let mut img = attr
        .new_image_fn(
            |row_out, row| {
                for (col, px) in row_out.iter_mut().enumerate() {
                    px.write(RGBA::new(if (col + row) % 2 == 0 { 0 } else { 255 }, 0, 0, 255));
                }
            },
            8,
            8,
            0.,
        )
        .unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (palette, pixels) = res.remapped(&mut img).unwrap();
    assert_eq!(palette.len(), 2);
    assert_eq!(pixels.len(), 64);
    // the checkerboard must map to alternating indices
    assert_ne!(pixels[0], pixels[1]);
    assert_eq!(pixels[0], pixels[2]);
}

#[test]
fn rows_image_source_works() {
    let row_a = [RGBA::new(255, 0, 0, 255), RGBA::new(255, 0, 0, 255)];
    let row_b = [RGBA::new(0, 0, 255, 255), RGBA::new(0, 0, 255, 255)];
    let rows: Vec<&[RGBA]> = vec![&row_a, &row_b];
    let mut attr = Attributes::new();
    attr.set_max_colors(4).unwrap();
    let mut img = attr.new_image_rows(&rows, 2, 2, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let (palette, pixels) = res.remapped(&mut img).unwrap();
    assert_eq!(palette.len(), 2);
    assert_eq!(pixels[0], pixels[1]);
    assert_eq!(pixels[2], pixels[3]);
    assert_ne!(pixels[0], pixels[2]);
}

#[test]
fn output_gamma_changes_rounded_palette() {
    let bitmap = vec![RGBA::new(120, 33, 201, 255); 4];
    let attr = Attributes::new();
    let mut img = attr.new_image(&bitmap, 2, 2, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let srgb = res.palette_vec();
    res.set_output_gamma(0.9).unwrap();
    let linearish = res.palette_vec();
    assert_ne!(srgb, linearish);
    assert_eq!(srgb[0].a, linearish[0].a);
}

#[test]
fn quality_reporting_is_consistent() {
    let bitmap = gradient(32, 32);
    let mut attr = Attributes::new();
    attr.set_max_colors(8).unwrap();
    let mut img = attr.new_image(&bitmap, 32, 32, 0.).unwrap();
    let mut res = attr.quantize(&mut img).unwrap();
    let _ = res.remapped(&mut img).unwrap();

    let err = res.quantization_error().unwrap();
    let q = res.quantization_quality().unwrap();
    assert!(err > 0.);
    assert!(q < 100);
    assert!(res.remapping_error().is_some());
}
