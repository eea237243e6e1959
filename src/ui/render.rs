//! Scrollback renderer using crossterm
//!
//! Writes styled spans to the host terminal incrementally: each call prints
//! only what was appended since the previous call, and repaints from the
//! top when the scrollback was cleared.

use std::io::{self, Write};

use crossterm::{
    cursor::MoveTo,
    queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};

use crate::core::scrollback::Scrollback;
use crate::core::term::{AttrFlags, StyledSpan, TextAttrs};

/// Tracks how much of one scrollback has been drawn
#[derive(Debug, Default)]
pub struct SpanRenderer {
    mark: u64,
    epoch: Option<u64>,
    crlf: bool,
    true_color: bool,
}

impl SpanRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `\r\n` for every newline, for hosts in raw mode
    pub fn with_crlf(mut self, crlf: bool) -> Self {
        self.crlf = crlf;
        self
    }

    /// Send palette colors as RGB, for hosts that support 24-bit color
    pub fn with_true_color(mut self, true_color: bool) -> Self {
        self.true_color = true_color;
        self
    }

    /// Forget what was drawn, so the next render repaints everything
    pub fn invalidate(&mut self) {
        self.epoch = None;
    }

    /// Draw whatever `scrollback` gained since the last call
    pub fn render<W: Write>(&mut self, out: &mut W, scrollback: &Scrollback) -> io::Result<()> {
        let spans = if self.epoch == Some(scrollback.epoch()) {
            scrollback.since(self.mark)
        } else {
            queue!(out, Clear(ClearType::All), MoveTo(0, 0))?;
            scrollback.spans().cloned().collect()
        };
        self.epoch = Some(scrollback.epoch());
        self.mark = scrollback.mark();

        write_spans(out, &spans, self.crlf, self.true_color)?;
        out.flush()
    }
}

/// Print spans with their attributes, resetting afterwards
pub fn write_spans<W: Write>(
    out: &mut W,
    spans: &[StyledSpan],
    crlf: bool,
    true_color: bool,
) -> io::Result<()> {
    for span in spans {
        let text = if crlf {
            span.text.replace('\n', "\r\n")
        } else {
            span.text.clone()
        };
        if span.attrs.is_default() {
            queue!(out, Print(text))?;
        } else {
            apply_attrs(out, &span.attrs, true_color)?;
            queue!(out, Print(text), ResetColor, SetAttribute(Attribute::Reset))?;
        }
    }
    Ok(())
}

fn apply_attrs<W: Write>(out: &mut W, attrs: &TextAttrs, true_color: bool) -> io::Result<()> {
    let styles = [
        (AttrFlags::BOLD, Attribute::Bold),
        (AttrFlags::DIM, Attribute::Dim),
        (AttrFlags::ITALIC, Attribute::Italic),
        (AttrFlags::UNDERLINE, Attribute::Underlined),
        (AttrFlags::INVERSE, Attribute::Reverse),
        (AttrFlags::STRIKETHROUGH, Attribute::CrossedOut),
    ];
    for (flag, attribute) in styles {
        if attrs.flags.contains(flag) {
            queue!(out, SetAttribute(attribute))?;
        }
    }

    let fg = attrs.fg.to_crossterm(true_color);
    if fg != crossterm::style::Color::Reset {
        queue!(out, SetForegroundColor(fg))?;
    }
    let bg = attrs.bg.to_crossterm(true_color);
    if bg != crossterm::style::Color::Reset {
        queue!(out, SetBackgroundColor(bg))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::style::Color;

    fn red(text: &str) -> StyledSpan {
        let attrs = TextAttrs {
            fg: Color::Indexed(1),
            ..TextAttrs::default()
        };
        StyledSpan::new(text, attrs)
    }

    fn rendered(renderer: &mut SpanRenderer, scrollback: &Scrollback) -> String {
        let mut out = Vec::new();
        renderer.render(&mut out, scrollback).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_plain_spans_print_verbatim() {
        let mut out = Vec::new();
        write_spans(&mut out, &[StyledSpan::plain("hello\n")], false, false).unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn test_crlf_translation() {
        let mut out = Vec::new();
        write_spans(&mut out, &[StyledSpan::plain("a\nb\n")], true, false).unwrap();
        assert_eq!(out, b"a\r\nb\r\n");
    }

    #[test]
    fn test_colored_span_is_wrapped_in_sgr() {
        let mut out = Vec::new();
        write_spans(&mut out, &[red("RED")], false, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("RED"));
        assert!(text.contains("\x1b[38;5;1m"));
        assert!(text.ends_with("\x1b[0m"));
    }

    #[test]
    fn test_true_color_host_gets_palette_rgb() {
        let mut out = Vec::new();
        write_spans(&mut out, &[red("RED")], false, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\x1b[38;2;205;0;0m"));
        assert!(!text.contains("38;5;"));
    }

    #[test]
    fn test_incremental_render() {
        let mut scrollback = Scrollback::new(1000);
        let mut renderer = SpanRenderer::new();

        scrollback.append("first\n");
        let initial = rendered(&mut renderer, &scrollback);
        assert!(initial.contains("first"));

        scrollback.append("second\n");
        assert_eq!(rendered(&mut renderer, &scrollback), "second\n");
        assert_eq!(rendered(&mut renderer, &scrollback), "");
    }

    #[test]
    fn test_clear_triggers_repaint() {
        let mut scrollback = Scrollback::new(1000);
        let mut renderer = SpanRenderer::new();
        scrollback.append("old\n");
        rendered(&mut renderer, &scrollback);

        scrollback.clear();
        scrollback.append("new\n");
        let text = rendered(&mut renderer, &scrollback);
        assert!(text.contains("\x1b[2J"));
        assert!(text.ends_with("new\n"));
        assert!(!text.contains("old"));
    }
}
