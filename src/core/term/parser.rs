//! Escape sequence interpreter
//!
//! Turns raw PTY output into [`StyledSpan`]s. Only SGR sequences change the
//! output; every other CSI, OSC or two-byte escape is recognized and dropped.
//! Carriage returns are normalized (`\r\n` and bare `\r` both become `\n`)
//! and bytes that are not valid UTF-8 become U+FFFD.
//!
//! All state that must survive a chunk boundary lives in
//! [`InterpreterState`], which the caller threads through every call.

use super::style::{AttrFlags, Color, StyledSpan, TextAttrs};

/// Upper bound on collected CSI parameters; extra ones are dropped
const MAX_PARAMS: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum EscapeState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    Csi,
    OscString,
    /// ESC received within OSC, waiting for backslash
    EscapeInOsc,
}

/// Interpreter state carried across chunks
#[derive(Clone, Debug, Default)]
pub struct InterpreterState {
    /// Attributes applied to the next printed text
    pub attrs: TextAttrs,
    escape: EscapeState,
    params: Vec<u16>,
    current_param: Option<u16>,
    private_marker: bool,
    intermediate: bool,
    /// Start of a UTF-8 sequence cut off by the end of the previous chunk
    utf8_tail: Vec<u8>,
    /// Previous byte was a CR that has already been emitted as `\n`
    after_cr: bool,
}

impl InterpreterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a partial escape sequence or UTF-8 sequence is buffered
    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.escape != EscapeState::Ground || !self.utf8_tail.is_empty()
    }
}

/// Interpret one chunk of raw output
pub fn interpret(raw: &[u8], state: &mut InterpreterState) -> Vec<StyledSpan> {
    let mut out = SpanWriter::default();
    let mut text = std::mem::take(&mut state.utf8_tail);

    for &byte in raw {
        match state.escape {
            EscapeState::Ground => {
                if byte == 0x1B {
                    out.push_bytes(&text, state.attrs);
                    text.clear();
                    state.enter_escape();
                } else {
                    state.ground(byte, &mut text);
                }
            }
            EscapeState::Escape => state.escape_byte(byte),
            EscapeState::EscapeIntermediate => match byte {
                0x20..=0x2F => {}
                0x1B => state.enter_escape(),
                _ => state.escape = EscapeState::Ground,
            },
            EscapeState::Csi => {
                // Attributes only change on the final byte, so text emitted
                // by embedded controls can share the pending buffer.
                if let Some(final_byte) = state.csi_byte(byte, &mut text) {
                    state.dispatch_csi(final_byte);
                }
            }
            EscapeState::OscString => match byte {
                0x07 => state.escape = EscapeState::Ground,
                0x1B => state.escape = EscapeState::EscapeInOsc,
                _ => {}
            },
            EscapeState::EscapeInOsc => {
                if byte == b'\\' {
                    state.escape = EscapeState::Ground;
                } else {
                    state.enter_escape();
                    state.escape_byte(byte);
                }
            }
        }
    }

    let complete = complete_prefix_len(&text);
    state.utf8_tail = text.split_off(complete);
    out.push_bytes(&text, state.attrs);
    out.finish()
}

/// Flush whatever is still buffered at end of stream
///
/// A truncated UTF-8 sequence becomes U+FFFD; an unterminated escape
/// sequence is dropped.
pub fn finish(state: &mut InterpreterState) -> Vec<StyledSpan> {
    let mut out = SpanWriter::default();
    let tail = std::mem::take(&mut state.utf8_tail);
    out.push_bytes(&tail, state.attrs);
    state.escape = EscapeState::Ground;
    state.params.clear();
    state.current_param = None;
    state.after_cr = false;
    out.finish()
}

impl InterpreterState {
    fn enter_escape(&mut self) {
        self.escape = EscapeState::Escape;
        self.params.clear();
        self.current_param = None;
        self.private_marker = false;
        self.intermediate = false;
        self.after_cr = false;
    }

    fn ground(&mut self, byte: u8, text: &mut Vec<u8>) {
        match byte {
            b'\r' => {
                text.push(b'\n');
                self.after_cr = true;
            }
            b'\n' => {
                if !std::mem::take(&mut self.after_cr) {
                    text.push(b'\n');
                }
            }
            _ => {
                self.after_cr = false;
                text.push(byte);
            }
        }
    }

    fn escape_byte(&mut self, byte: u8) {
        match byte {
            b'[' => self.escape = EscapeState::Csi,
            b']' => self.escape = EscapeState::OscString,
            0x1B => self.enter_escape(),
            0x20..=0x2F => self.escape = EscapeState::EscapeIntermediate,
            // Two-byte sequences (charset, keypad, save/restore cursor)
            _ => self.escape = EscapeState::Ground,
        }
    }

    /// Feed one byte of a CSI sequence, returning the final byte when done
    fn csi_byte(&mut self, byte: u8, text: &mut Vec<u8>) -> Option<u8> {
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
            }
            b';' | b':' => {
                let param = self.current_param.take().unwrap_or(0);
                self.push_param(param);
            }
            b'<' | b'=' | b'>' | b'?' => self.private_marker = true,
            0x20..=0x2F => self.intermediate = true,
            0x40..=0x7E => {
                if let Some(param) = self.current_param.take() {
                    self.push_param(param);
                }
                self.escape = EscapeState::Ground;
                return Some(byte);
            }
            0x1B => self.enter_escape(),
            // CAN / SUB abort the sequence
            0x18 | 0x1A => self.escape = EscapeState::Ground,
            b'\r' | b'\n' | b'\t' => self.ground(byte, text),
            _ => {}
        }
        None
    }

    fn push_param(&mut self, param: u16) {
        if self.params.len() < MAX_PARAMS {
            self.params.push(param);
        }
    }

    fn dispatch_csi(&mut self, final_byte: u8) {
        if final_byte == b'm' && !self.private_marker && !self.intermediate {
            apply_sgr(&self.params, &mut self.attrs);
        } else {
            // Cursor movement, erase, scroll and mode toggles have no
            // meaning in an append-only scrollback.
            tracing::trace!(
                "Discarded CSI: params={:?}, final={:?}",
                self.params,
                final_byte as char
            );
        }
    }
}

/// Apply a Select Graphic Rendition parameter list
pub fn apply_sgr(params: &[u16], attrs: &mut TextAttrs) {
    if params.is_empty() {
        attrs.reset();
        return;
    }

    let mut iter = params.iter().copied();

    while let Some(param) = iter.next() {
        match param {
            0 => attrs.reset(),
            1 => attrs.flags |= AttrFlags::BOLD,
            2 => attrs.flags |= AttrFlags::DIM,
            3 => attrs.flags |= AttrFlags::ITALIC,
            4 => attrs.flags |= AttrFlags::UNDERLINE,
            7 => attrs.flags |= AttrFlags::INVERSE,
            9 => attrs.flags |= AttrFlags::STRIKETHROUGH,

            22 => attrs.flags &= !(AttrFlags::BOLD | AttrFlags::DIM),
            23 => attrs.flags &= !AttrFlags::ITALIC,
            24 => attrs.flags &= !AttrFlags::UNDERLINE,
            27 => attrs.flags &= !AttrFlags::INVERSE,
            29 => attrs.flags &= !AttrFlags::STRIKETHROUGH,

            30..=37 => attrs.fg = Color::Indexed((param - 30) as u8),
            38 => {
                if let Some(color) = extended_color(&mut iter) {
                    attrs.fg = color;
                }
            }
            39 => attrs.fg = Color::Default,

            40..=47 => attrs.bg = Color::Indexed((param - 40) as u8),
            48 => {
                if let Some(color) = extended_color(&mut iter) {
                    attrs.bg = color;
                }
            }
            49 => attrs.bg = Color::Default,

            90..=97 => attrs.fg = Color::Indexed((param - 90 + 8) as u8),
            100..=107 => attrs.bg = Color::Indexed((param - 100 + 8) as u8),

            _ => {}
        }
    }
}

/// Parse the tail of `38;...` / `48;...`
fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match iter.next()? {
        5 => {
            let n = iter.next()?;
            Some(Color::Indexed(n.min(255) as u8))
        }
        2 => {
            let r = iter.next().unwrap_or(0).min(255) as u8;
            let g = iter.next().unwrap_or(0).min(255) as u8;
            let b = iter.next().unwrap_or(0).min(255) as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

/// Length of `bytes` without a trailing, possibly incomplete, UTF-8 sequence
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = if b & 0xE0 == 0xC0 {
            2
        } else if b & 0xF0 == 0xE0 {
            3
        } else if b & 0xF8 == 0xF0 {
            4
        } else {
            return len;
        };
        return if needed > back { len - back } else { len };
    }
    len
}

/// Accumulates spans, merging neighbours with identical attributes
#[derive(Default)]
struct SpanWriter {
    spans: Vec<StyledSpan>,
}

impl SpanWriter {
    fn push_bytes(&mut self, bytes: &[u8], attrs: TextAttrs) {
        if bytes.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(bytes);
        match self.spans.last_mut() {
            Some(last) if last.attrs == attrs => last.text.push_str(&text),
            _ => self.spans.push(StyledSpan::new(text, attrs)),
        }
    }

    fn finish(self) -> Vec<StyledSpan> {
        self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::style::plain_text;

    fn run(input: &[u8]) -> Vec<StyledSpan> {
        let mut state = InterpreterState::new();
        let mut spans = interpret(input, &mut state);
        spans.extend(finish(&mut state));
        spans
    }

    /// Join neighbours with equal attributes, so outputs that were chunked
    /// differently compare equal
    fn coalesce(spans: Vec<StyledSpan>) -> Vec<(String, TextAttrs)> {
        let mut out: Vec<(String, TextAttrs)> = Vec::new();
        for span in spans {
            match out.last_mut() {
                Some((text, attrs)) if *attrs == span.attrs => text.push_str(&span.text),
                _ => out.push((span.text, span.attrs)),
            }
        }
        out
    }

    #[test]
    fn test_plain_text_single_span() {
        let spans = run(b"hello world\nsecond line");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "hello world\nsecond line");
        assert!(spans[0].attrs.is_default());
    }

    #[test]
    fn test_red_then_reset() {
        let mut state = InterpreterState::new();
        let spans = interpret(b"\x1b[31mHELLO\x1b[0m", &mut state);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "HELLO");
        assert_eq!(spans[0].attrs.fg, Color::Indexed(1));

        let next = interpret(b"after", &mut state);
        assert_eq!(next.len(), 1);
        assert!(next[0].attrs.is_default());
    }

    #[test]
    fn test_attributes_persist_across_chunks() {
        let mut state = InterpreterState::new();
        let first = interpret(b"\x1b[1;32mgreen", &mut state);
        let second = interpret(b" still green", &mut state);
        assert_eq!(first[0].attrs, second[0].attrs);
        assert!(second[0].attrs.flags.contains(AttrFlags::BOLD));
        assert_eq!(second[0].attrs.fg, Color::Indexed(2));
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut state = InterpreterState::new();
        let first = interpret(b"a\x1b[3", &mut state);
        assert_eq!(plain_text(&first), "a");
        assert!(state.has_pending());

        let second = interpret(b"4mb", &mut state);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text, "b");
        assert_eq!(second[0].attrs.fg, Color::Indexed(4));
    }

    #[test]
    fn test_non_sgr_sequences_discarded() {
        let spans = run(b"\x1b[2J\x1b[H\x1b[?25lvisible\x1b[?25h\x1b[K\x1b[3A!");
        assert_eq!(plain_text(&spans), "visible!");
        assert!(spans.iter().all(|s| s.attrs.is_default()));
    }

    #[test]
    fn test_osc_title_discarded() {
        let spans = run(b"\x1b]0;my title\x07prompt\x1b]2;other\x1b\\done");
        assert_eq!(plain_text(&spans), "promptdone");
    }

    #[test]
    fn test_crlf_normalization() {
        assert_eq!(plain_text(&run(b"a\r\nb\rc\n")), "a\nb\nc\n");
        assert_eq!(plain_text(&run(b"x\r\r\ny")), "x\n\ny");
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut state = InterpreterState::new();
        let first = interpret(b"line\r", &mut state);
        let second = interpret(b"\nnext", &mut state);
        assert_eq!(plain_text(&first), "line\n");
        assert_eq!(plain_text(&second), "next");
    }

    #[test]
    fn test_indexed_colors() {
        let spans = run(b"\x1b[38;5;196mA\x1b[48;5;240mB\x1b[39;49mC");
        assert_eq!(spans[0].attrs.fg, Color::Indexed(196));
        assert_eq!(spans[1].attrs.bg, Color::Indexed(240));
        assert_eq!(spans[1].attrs.fg, Color::Indexed(196));
        assert!(spans[2].attrs.is_default());
    }

    #[test]
    fn test_bright_and_truecolor() {
        let spans = run(b"\x1b[91mA\x1b[38;2;10;20;30mB");
        assert_eq!(spans[0].attrs.fg, Color::Indexed(9));
        assert_eq!(spans[1].attrs.fg, Color::Rgb(10, 20, 30));
    }

    #[test]
    fn test_style_flags() {
        let spans = run(b"\x1b[1;3;4;9mX\x1b[22;23mY");
        let all = AttrFlags::BOLD | AttrFlags::ITALIC | AttrFlags::UNDERLINE | AttrFlags::STRIKETHROUGH;
        assert_eq!(spans[0].attrs.flags, all);
        assert_eq!(
            spans[1].attrs.flags,
            AttrFlags::UNDERLINE | AttrFlags::STRIKETHROUGH
        );
    }

    #[test]
    fn test_unknown_sgr_ignored() {
        let spans = run(b"\x1b[31;73mX");
        assert_eq!(spans[0].attrs.fg, Color::Indexed(1));
    }

    #[test]
    fn test_empty_sgr_resets() {
        let spans = run(b"\x1b[31mA\x1b[mB");
        assert!(spans[1].attrs.is_default());
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let spans = run(b"ok\xffok");
        assert_eq!(plain_text(&spans), "ok\u{FFFD}ok");
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let bytes = "héllo".as_bytes();
        let mut state = InterpreterState::new();
        let first = interpret(&bytes[..2], &mut state);
        let second = interpret(&bytes[2..], &mut state);
        assert_eq!(plain_text(&first), "h");
        assert_eq!(plain_text(&second), "éllo");
    }

    #[test]
    fn test_truncated_utf8_flushed_as_replacement() {
        let mut state = InterpreterState::new();
        let spans = interpret(b"a\xe2\x82", &mut state);
        assert_eq!(plain_text(&spans), "a");
        assert_eq!(plain_text(&finish(&mut state)), "\u{FFFD}");
    }

    #[test]
    fn test_round_trip_strips_controls() {
        let input = b"\x1b[1mbold\x1b[0m plain\r\n\x1b[32;40mcolored\x1b(B\x1b[0m end";
        assert_eq!(plain_text(&run(input)), "bold plain\ncolored end");
    }

    #[test]
    fn test_same_attrs_merge() {
        let spans = run(b"\x1b[31mA\x1b[31mB");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "AB");
    }

    #[test]
    fn test_chunk_split_anywhere_matches_whole() {
        let inputs: [&[u8]; 3] = [
            b"\x1b[31mred\x1b[0m\r\nplain \xc3\xa9\xe2\x82\xac\r\x1b]0;t\x07end",
            b"\x1b[38;2;1;2;3mrgb\xf0\x9f\x98\x80\x1b[0m\r\r\nbad\xff\xe2\x82\x1b[1mB\x1b]2;x\x1b\\!\r",
            b"a\x1b[?25l\x1b(B\x1b[4;9mu\r\n\xc3",
        ];
        for input in inputs {
            let whole = coalesce(run(input));

            for split in 0..=input.len() {
                let (a, b) = input.split_at(split);
                let mut state = InterpreterState::new();
                let mut spans = interpret(a, &mut state);
                spans.extend(interpret(b, &mut state));
                spans.extend(finish(&mut state));
                assert_eq!(coalesce(spans), whole, "split at byte {} of {:?}", split, input);
            }

            let mut state = InterpreterState::new();
            let mut spans = Vec::new();
            for byte in input.chunks(1) {
                spans.extend(interpret(byte, &mut state));
            }
            spans.extend(finish(&mut state));
            assert_eq!(coalesce(spans), whole, "byte at a time: {:?}", input);
        }
    }
}
