//! Bounded scrollback buffer
//!
//! Append-only store of styled text capped at a fixed number of characters.
//! When an append pushes the total over the cap, characters are dropped from
//! the front (trimming inside the oldest span if needed) until it fits.

use std::collections::VecDeque;

use super::term::{StyledSpan, TextAttrs};

/// Default scrollback capacity in characters
pub const DEFAULT_SCROLLBACK_LIMIT: usize = 50_000;

/// Same-attribute appends merge into one span up to this many characters
const MAX_SPAN_CHARS: usize = 4096;

/// A retained span and its length in characters
struct Entry {
    span: StyledSpan,
    chars: usize,
}

pub struct Scrollback {
    entries: VecDeque<Entry>,
    /// Current length in characters
    len: usize,
    cap: usize,
    /// Characters ever appended; readers use it as a cursor
    appended: u64,
    /// Bumped on every `clear`
    epoch: u64,
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_LIMIT)
    }
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            len: 0,
            cap,
            appended: 0,
            epoch: 0,
        }
    }

    /// Append plain text with default attributes
    pub fn append(&mut self, text: &str) {
        self.append_span(StyledSpan::new(text, TextAttrs::default()));
    }

    pub fn append_spans<I>(&mut self, spans: I)
    where
        I: IntoIterator<Item = StyledSpan>,
    {
        for span in spans {
            self.push(span);
        }
        self.evict();
    }

    pub fn append_span(&mut self, span: StyledSpan) {
        self.push(span);
        self.evict();
    }

    fn push(&mut self, span: StyledSpan) {
        let n = span.char_len();
        if n == 0 {
            return;
        }
        self.len += n;
        self.appended += n as u64;
        match self.entries.back_mut() {
            Some(last) if last.span.attrs == span.attrs && last.chars + n <= MAX_SPAN_CHARS => {
                last.span.text.push_str(&span.text);
                last.chars += n;
            }
            _ => self.entries.push_back(Entry { span, chars: n }),
        }
    }

    fn evict(&mut self) {
        while self.len > self.cap {
            let excess = self.len - self.cap;
            let Some(front) = self.entries.front_mut() else {
                break;
            };
            if front.chars <= excess {
                self.len -= front.chars;
                self.entries.pop_front();
            } else {
                let text = &mut front.span.text;
                let cut = text
                    .char_indices()
                    .nth(excess)
                    .map(|(i, _)| i)
                    .unwrap_or(text.len());
                text.drain(..cut);
                front.chars -= excess;
                self.len -= excess;
            }
        }
    }

    /// Plain text of the whole buffer
    pub fn contents(&self) -> String {
        self.entries.iter().map(|e| e.span.text.as_str()).collect()
    }

    pub fn spans(&self) -> impl Iterator<Item = &StyledSpan> {
        self.entries.iter().map(|e| &e.span)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
        self.epoch += 1;
    }

    /// Length in characters
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Cursor for [`Scrollback::since`]
    pub fn mark(&self) -> u64 {
        self.appended
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Spans appended after `mark`, limited to what is still retained
    pub fn since(&self, mark: u64) -> Vec<StyledSpan> {
        let count = self.appended.saturating_sub(mark);
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        self.tail(count)
    }

    /// The last `n` characters as spans
    pub fn tail(&self, n: usize) -> Vec<StyledSpan> {
        let mut remaining = n.min(self.len);
        let mut out = Vec::new();
        for entry in self.entries.iter().rev() {
            if remaining == 0 {
                break;
            }
            if entry.chars <= remaining {
                out.push(entry.span.clone());
                remaining -= entry.chars;
            } else {
                let skip = entry.chars - remaining;
                let text: String = entry.span.text.chars().skip(skip).collect();
                out.push(StyledSpan::new(text, entry.span.attrs));
                remaining = 0;
            }
        }
        out.reverse();
        out
    }

    /// Text after the final newline
    pub fn last_line(&self) -> String {
        let mut parts = Vec::new();
        for span in self.entries.iter().rev().map(|e| &e.span) {
            if let Some(pos) = span.text.rfind('\n') {
                parts.push(&span.text[pos + 1..]);
                break;
            }
            parts.push(span.text.as_str());
        }
        parts.iter().rev().copied().collect()
    }

    /// True when the buffer is empty or ends with a newline
    pub fn at_line_start(&self) -> bool {
        self.entries
            .back()
            .map_or(true, |e| e.span.text.ends_with('\n'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::style::Color;

    #[test]
    fn test_append_and_contents() {
        let mut sb = Scrollback::new(100);
        sb.append("hello ");
        sb.append("world");
        assert_eq!(sb.contents(), "hello world");
        assert_eq!(sb.len(), 11);
    }

    #[test]
    fn test_front_eviction_keeps_suffix() {
        let mut sb = Scrollback::new(10);
        let mut unbounded = String::new();
        for chunk in ["abcdef", "ghijkl", "mn", "opqrstuvwxyz", "12"] {
            sb.append(chunk);
            unbounded.push_str(chunk);
            assert!(sb.len() <= 10);
            assert!(unbounded.ends_with(&sb.contents()));
        }
        assert_eq!(sb.contents(), "stuvwxyz12");
    }

    #[test]
    fn test_eviction_counts_characters_not_bytes() {
        let mut sb = Scrollback::new(3);
        sb.append("äöüß");
        assert_eq!(sb.contents(), "öüß");
        assert_eq!(sb.len(), 3);
    }

    #[test]
    fn test_single_append_larger_than_cap() {
        let mut sb = Scrollback::new(4);
        sb.append("0123456789");
        assert_eq!(sb.contents(), "6789");
    }

    #[test]
    fn test_eviction_trims_inside_styled_span() {
        let red = TextAttrs {
            fg: Color::Indexed(1),
            ..TextAttrs::default()
        };
        let mut sb = Scrollback::new(5);
        sb.append_span(StyledSpan::new("abc", red));
        sb.append("defg");
        let spans: Vec<_> = sb.spans().cloned().collect();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].text, "c");
        assert_eq!(spans[0].attrs, red);
        assert_eq!(spans[1].text, "defg");
    }

    #[test]
    fn test_clear() {
        let mut sb = Scrollback::new(10);
        sb.append("abc");
        sb.clear();
        assert_eq!(sb.len(), 0);
        assert_eq!(sb.contents(), "");
        assert_eq!(sb.epoch(), 1);
    }

    #[test]
    fn test_since_mark() {
        let mut sb = Scrollback::new(100);
        sb.append("first ");
        let mark = sb.mark();
        sb.append("second");
        let spans = sb.since(mark);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "second");
    }

    #[test]
    fn test_last_line() {
        let mut sb = Scrollback::new(100);
        sb.append("one\ntwo\n[sudo] pass");
        sb.append("word for u:");
        assert_eq!(sb.last_line(), "[sudo] password for u:");
        assert!(!sb.at_line_start());
        sb.append("\n");
        assert_eq!(sb.last_line(), "");
        assert!(sb.at_line_start());
    }

    #[test]
    fn test_many_small_appends_stay_bounded() {
        let mut sb = Scrollback::new(10_000);
        let mut unbounded = String::new();
        for i in 0..30_000u32 {
            let c = char::from(b'a' + (i % 26) as u8);
            sb.append(c.encode_utf8(&mut [0; 4]));
            unbounded.push(c);
        }
        assert_eq!(sb.len(), 10_000);
        assert!(unbounded.ends_with(&sb.contents()));
        assert!(sb.spans().all(|s| s.char_len() <= MAX_SPAN_CHARS));
        assert!(sb.spans().count() >= 10_000 / MAX_SPAN_CHARS);
        let tail: String = sb.tail(3).iter().map(|s| s.text.as_str()).collect();
        assert_eq!(tail, &unbounded[unbounded.len() - 3..]);
    }
}
