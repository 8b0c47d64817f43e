//! Presence DLP - Physical Spoof Heuristics
//!
//! Three checks on a full-resolution face crop:
//!
//! - **Glare**: screens and glass reflect lamps, skin scatters them.
//! - **Skin spectrum**: real skin sits in a narrow Cr/Cb band; displays and
//!   printers drift out of it.
//! - **Texture**: Laplacian variance. Paper is blurry, screens show a
//!   pixel grid, live faces sit in between.

use image::RgbImage;

/// Tunable limits for the spoof checks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessThresholds {
    /// HSV value above which a pixel counts as hard glare
    pub glare_value: u8,
    /// Largest tolerated share of glare pixels
    pub max_glare_ratio: f64,
    /// Inclusive Cr band of skin tones
    pub skin_cr: (u8, u8),
    /// Inclusive Cb band of skin tones
    pub skin_cb: (u8, u8),
    /// Smallest required share of skin-tone pixels
    pub min_skin_ratio: f64,
    /// Laplacian variance below this is a blurred print
    pub min_texture: f64,
    /// Laplacian variance above this is a screen
    pub max_texture: f64,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            glare_value: 250,
            max_glare_ratio: 0.01,
            skin_cr: (133, 173),
            skin_cb: (77, 127),
            min_skin_ratio: 0.50,
            min_texture: 80.0,
            max_texture: 1200.0,
        }
    }
}

/// Run all three checks. `Err` carries the first failing check's reason,
/// in the order glare, skin, texture.
pub fn assess_crop(crop: &RgbImage, limits: &LivenessThresholds) -> Result<(), String> {
    let glare = check_glare(crop, limits);
    let skin = check_skin(crop, limits);
    let texture = check_texture(crop, limits);
    glare.and(skin).and(texture)
}

/// Share of near-saturated pixels (HSV V channel, i.e. max(R, G, B))
pub fn glare_ratio(crop: &RgbImage, glare_value: u8) -> f64 {
    ratio(crop, |[r, g, b]| r.max(g).max(b) > glare_value)
}

pub fn check_glare(crop: &RgbImage, limits: &LivenessThresholds) -> Result<(), String> {
    let glare = glare_ratio(crop, limits.glare_value);
    if glare > limits.max_glare_ratio {
        return Err(format!("glare: reflective surface ({:.3})", glare));
    }
    Ok(())
}

/// Share of pixels inside the skin chroma band
pub fn skin_ratio(crop: &RgbImage, limits: &LivenessThresholds) -> f64 {
    let (cr_lo, cr_hi) = limits.skin_cr;
    let (cb_lo, cb_hi) = limits.skin_cb;
    ratio(crop, |px| {
        let (cr, cb) = chroma(px);
        (cr_lo..=cr_hi).contains(&cr) && (cb_lo..=cb_hi).contains(&cb)
    })
}

pub fn check_skin(crop: &RgbImage, limits: &LivenessThresholds) -> Result<(), String> {
    let skin = skin_ratio(crop, limits);
    if skin < limits.min_skin_ratio {
        return Err(format!("skin spectrum: unnatural ({:.2})", skin));
    }
    Ok(())
}

/// Variance of the 4-neighbour Laplacian over the grayscale crop
pub fn laplacian_variance(crop: &RgbImage) -> f64 {
    let (w, h) = crop.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }

    let gray: Vec<f64> = crop.pixels().map(|p| luma(p.0)).collect();
    let at = |x: i64, y: i64| -> f64 {
        let x = reflect_101(x, w as i64);
        let y = reflect_101(y, h as i64);
        gray[(y * w as i64 + x) as usize]
    };

    let n = (w as usize * h as usize) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

pub fn check_texture(crop: &RgbImage, limits: &LivenessThresholds) -> Result<(), String> {
    let focus = laplacian_variance(crop);
    if focus < limits.min_texture {
        return Err(format!("texture: blurred print/photo ({:.0})", focus));
    }
    if focus > limits.max_texture {
        return Err(format!("texture: screen pixel grid ({:.0})", focus));
    }
    Ok(())
}

fn ratio(crop: &RgbImage, pred: impl Fn([u8; 3]) -> bool) -> f64 {
    let total = crop.width() as usize * crop.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let hits = crop.pixels().filter(|p| pred(p.0)).count();
    hits as f64 / total as f64
}

fn luma([r, g, b]: [u8; 3]) -> f64 {
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64).round()
}

/// (Cr, Cb) of an 8-bit RGB pixel
fn chroma(px: [u8; 3]) -> (u8, u8) {
    let [r, g, b] = px;
    let y = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
    let cr = (r as f64 - y) * 0.713 + 128.0;
    let cb = (b as f64 - y) * 0.564 + 128.0;
    (saturate(cr), saturate(cb))
}

fn saturate(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Mirror index without repeating the edge pixel: -1 -> 1, n -> n-2
fn reflect_101(i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;

    const SKIN: [u8; 3] = [200, 150, 120];

    /// Skin-toned crop with a fine checkerboard giving a mid-range
    /// Laplacian variance
    pub(crate) fn live_crop(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let d: i16 = if (x + y) % 2 == 0 { 3 } else { -3 };
            Rgb(SKIN.map(|c| (c as i16 + d) as u8))
        })
    }

    /// Uniform skin-toned crop: the flat texture of a print
    pub(crate) fn printed_crop(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb(SKIN))
    }

    #[test]
    fn test_live_crop_passes() {
        let limits = LivenessThresholds::default();
        let crop = live_crop(60, 60);
        let focus = laplacian_variance(&crop);
        assert!(focus > 80.0 && focus < 1200.0, "focus {}", focus);
        assert_eq!(assess_crop(&crop, &limits), Ok(()));
    }

    #[test]
    fn test_print_fails_texture() {
        let reason = assess_crop(&printed_crop(60, 60), &LivenessThresholds::default()).unwrap_err();
        assert!(reason.starts_with("texture"), "{}", reason);
    }

    #[test]
    fn test_screen_grid_fails_texture() {
        let crop = RgbImage::from_fn(40, 40, |x, y| {
            let d: i16 = if (x + y) % 2 == 0 { 12 } else { -12 };
            Rgb(SKIN.map(|c| (c as i16 + d) as u8))
        });
        let reason = check_texture(&crop, &LivenessThresholds::default()).unwrap_err();
        assert!(reason.contains("screen"), "{}", reason);
    }

    #[test]
    fn test_glare_reported_first() {
        let mut crop = printed_crop(10, 10);
        crop.put_pixel(0, 0, Rgb([255, 255, 255]));
        crop.put_pixel(1, 0, Rgb([255, 255, 255]));

        assert!((glare_ratio(&crop, 250) - 0.02).abs() < 1e-9);
        let reason = assess_crop(&crop, &LivenessThresholds::default()).unwrap_err();
        assert!(reason.starts_with("glare"), "{}", reason);
    }

    #[test]
    fn test_blue_screen_fails_skin() {
        let crop = RgbImage::from_fn(20, 20, |x, y| {
            let d: i16 = if (x + y) % 2 == 0 { 3 } else { -3 };
            Rgb([60, 90, (200 + d) as u8])
        });
        let limits = LivenessThresholds::default();
        assert!(check_glare(&crop, &limits).is_ok());
        let reason = assess_crop(&crop, &limits).unwrap_err();
        assert!(reason.starts_with("skin"), "{}", reason);
    }

    #[test]
    fn test_chroma_of_neutral_gray() {
        assert_eq!(chroma([128, 128, 128]), (128, 128));
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
        assert_eq!(reflect_101(-1, 1), 0);
    }
}
