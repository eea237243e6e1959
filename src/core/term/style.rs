//! Text attributes and styled spans
//!
//! The interpreter never keeps a screen grid; every piece of output is a
//! [`StyledSpan`] carrying the attributes that were active when it arrived.

use bitflags::bitflags;

/// A run of text rendered with one set of attributes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyledSpan {
    pub text: String,
    pub attrs: TextAttrs,
}

impl StyledSpan {
    pub fn new(text: impl Into<String>, attrs: TextAttrs) -> Self {
        Self {
            text: text.into(),
            attrs,
        }
    }

    /// Span with default attributes
    #[cfg(test)]
    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, TextAttrs::default())
    }

    /// Number of characters (not bytes) in the span
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Concatenate span text, dropping all attributes
#[cfg(test)]
pub fn plain_text(spans: &[StyledSpan]) -> String {
    spans.iter().map(|s| s.text.as_str()).collect()
}

/// Graphic rendition state
///
/// `Color::Default` means "inherit the view's default", so a freshly reset
/// value is indistinguishable from one that never saw an SGR sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl TextAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Color definition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Color {
    #[default]
    Default,
    /// Entry of the 256-color palette
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Color {
    /// Resolve to concrete RGB, `None` for the default color
    pub fn to_rgb(self) -> Option<(u8, u8, u8)> {
        match self {
            Color::Default => None,
            Color::Indexed(n) => Some(palette_rgb(n)),
            Color::Rgb(r, g, b) => Some((r, g, b)),
        }
    }

    /// Convert to crossterm color
    ///
    /// With `true_color` palette entries are sent as RGB, so they look the
    /// same whatever palette the host terminal is configured with.
    pub fn to_crossterm(self, true_color: bool) -> crossterm::style::Color {
        match (self, true_color) {
            (Color::Indexed(n), false) => crossterm::style::Color::AnsiValue(n),
            _ => match self.to_rgb() {
                Some((r, g, b)) => crossterm::style::Color::Rgb { r, g, b },
                None => crossterm::style::Color::Reset,
            },
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AttrFlags: u8 {
        const BOLD          = 0b0000_0001;
        const DIM           = 0b0000_0010;
        const ITALIC        = 0b0000_0100;
        const UNDERLINE     = 0b0000_1000;
        const INVERSE       = 0b0001_0000;
        const STRIKETHROUGH = 0b0010_0000;
    }
}

/// xterm's default values for the 16 standard colors
const STANDARD_PALETTE: [(u8, u8, u8); 16] = [
    (0, 0, 0),
    (205, 0, 0),
    (0, 205, 0),
    (205, 205, 0),
    (0, 0, 238),
    (205, 0, 205),
    (0, 205, 205),
    (229, 229, 229),
    (127, 127, 127),
    (255, 0, 0),
    (0, 255, 0),
    (255, 255, 0),
    (92, 92, 255),
    (255, 0, 255),
    (0, 255, 255),
    (255, 255, 255),
];

/// Channel levels of the 6x6x6 color cube
const CUBE_LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

/// Map a 256-color palette index to RGB
///
/// 0-15 are the standard colors, 16-231 the color cube, 232-255 a
/// 24-step grayscale ramp from 8 to 238.
pub fn palette_rgb(index: u8) -> (u8, u8, u8) {
    match index {
        0..=15 => STANDARD_PALETTE[index as usize],
        16..=231 => {
            let n = index - 16;
            let r = CUBE_LEVELS[(n / 36) as usize];
            let g = CUBE_LEVELS[((n / 6) % 6) as usize];
            let b = CUBE_LEVELS[(n % 6) as usize];
            (r, g, b)
        }
        232..=255 => {
            let level = 8 + (index - 232) * 10;
            (level, level, level)
        }
    }
}
