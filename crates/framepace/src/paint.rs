//! Procedural pixel content.
//!
//! The pattern is three concentric zones around the center of the padded
//! interior, each shaded by a different linear function of position and time,
//! with a cross along both diagonals that keeps a zero top byte. Compositors
//! that read the X channel of XRGB8888 as alpha show the cross as transparent.
//!
//! All arithmetic is integer and wraps; `time` only shifts the shading phase.

/// Multiplier that spreads a scalar across the R, G and B channels.
const SHADE_STEP: u32 = 0x0080401;

/// Pixels within this distance of a diagonal keep a zero top byte.
const CROSS_HALF_WIDTH: i64 = 6;

/// Distance between the outer ring and the interior edge.
const OUTER_INSET: i64 = 8;

/// Width of the middle ring.
const RING_WIDTH: i64 = 32;

/// Squared radius thresholds separating the three zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Radii {
    pub inner_r2: i64,
    pub outer_r2: i64,
}

impl Radii {
    /// Thresholds for a `width × height` buffer with a `padding` border.
    ///
    /// Both radii are clamped at zero so `inner_r2 <= outer_r2` holds for
    /// windows too small to fit the ring.
    pub fn new(padding: u32, width: u32, height: u32) -> Self {
        let (half_w, half_h) = center(padding, width, height);
        let outer = (half_w.min(half_h) - OUTER_INSET).max(0);
        let inner = (outer - RING_WIDTH).max(0);
        Self {
            inner_r2: inner * inner,
            outer_r2: outer * outer,
        }
    }
}

fn center(padding: u32, width: u32, height: u32) -> (i64, i64) {
    let padding = i64::from(padding);
    let half_w = padding + (i64::from(width) - padding * 2) / 2;
    let half_h = padding + (i64::from(height) - padding * 2) / 2;
    (half_w, half_h)
}

/// Fill every pixel opaque white.
pub fn fill_opaque(pixels: &mut [u32]) {
    pixels.fill(0xffff_ffff);
}

/// Paint the interior `[padding, width-padding) × [padding, height-padding)`
/// of a row-major `width × height` buffer. Border pixels are not touched.
///
/// Rows missing from a short `pixels` slice are skipped.
pub fn paint_pixels(pixels: &mut [u32], padding: u32, width: u32, height: u32, time: u32) {
    if padding.saturating_mul(2) >= width.min(height) {
        return;
    }

    let radii = Radii::new(padding, width, height);
    let (half_w, half_h) = center(padding, width, height);
    let (pad, w, h) = (padding as usize, width as usize, height as usize);

    for (y, row) in pixels
        .chunks_exact_mut(w)
        .enumerate()
        .take(h - pad)
        .skip(pad)
    {
        let y = y as i64;
        let dy2 = (y - half_h) * (y - half_h);

        for (x, pixel) in row.iter_mut().enumerate().take(w - pad).skip(pad) {
            let x = x as i64;
            let r2 = (x - half_w) * (x - half_w) + dy2;
            *pixel = shade(x, y, r2, radii, i64::from(height), time);
        }
    }
}

#[inline]
fn shade(x: i64, y: i64, r2: i64, radii: Radii, height: i64, time: u32) -> u32 {
    let base = if r2 < radii.inner_r2 {
        ((r2 / 32) as u32).wrapping_add(time / 64)
    } else if r2 < radii.outer_r2 {
        (y as u32).wrapping_add(time / 32)
    } else {
        (x as u32).wrapping_add(time / 16)
    };

    let mut v = base.wrapping_mul(SHADE_STEP) & 0x00ff_ffff;

    if (x - y).abs() > CROSS_HALF_WIDTH && (x + y - height).abs() > CROSS_HALF_WIDTH {
        v |= 0xff00_0000;
    }

    v
}
