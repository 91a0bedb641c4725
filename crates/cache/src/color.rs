//! Display colour transform
//!
//! `Inverted` maps every colour channel `c` to `255 - c` and leaves alpha
//! alone. The transform is its own inverse, which lets a cached bitmap move
//! between modes without going back to the rasterizer.

use leaflet_engine::RgbaImage;

/// How rendered pages are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisplayMode {
    #[default]
    Normal,
    Inverted,
}

impl DisplayMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Normal => Self::Inverted,
            Self::Inverted => Self::Normal,
        }
    }

    pub fn is_inverted(self) -> bool {
        self == Self::Inverted
    }
}

/// Return a copy of `image` in display form for `mode`.
pub fn apply(image: &RgbaImage, mode: DisplayMode) -> RgbaImage {
    let mut out = image.clone();
    apply_in_place(&mut out, mode);
    out
}

/// Transform a freshly rasterized buffer into display form for `mode`.
pub fn apply_in_place(image: &mut RgbaImage, mode: DisplayMode) {
    if mode.is_inverted() {
        invert(image);
    }
}

/// Move a buffer that is in display form for `from` to display form for `to`.
pub fn convert(image: &mut RgbaImage, from: DisplayMode, to: DisplayMode) {
    if from != to {
        invert(image);
    }
}

fn invert(image: &mut RgbaImage) {
    for pixel in image.chunks_exact_mut(4) {
        pixel[0] = 255 - pixel[0];
        pixel[1] = 255 - pixel[1];
        pixel[2] = 255 - pixel[2];
    }
}
