//! Bounded output capture.
//!
//! A scheduled command can print without limit (`yes`, a runaway log loop).
//! Output is captured while it is produced, but only the first and last
//! halves of the byte budget are kept. Middle-omission is preferred over
//! head-only because the end of the output usually carries the final result
//! or error.

use std::collections::VecDeque;

/// Default per-stream capture budget (64 KiB).
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024;

/// Fixed-size capture buffer that keeps the head and the tail of a stream.
#[derive(Debug)]
pub struct CaptureBuffer {
    limit: usize,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    omitted: usize,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            head: Vec::new(),
            tail: VecDeque::new(),
            omitted: 0,
        }
    }

    fn head_cap(&self) -> usize {
        self.limit - self.limit / 2
    }

    fn tail_cap(&self) -> usize {
        self.limit / 2
    }

    /// Append a chunk, discarding bytes from the middle once over budget.
    pub fn push(&mut self, chunk: &[u8]) {
        let mut rest = chunk;

        let head_room = self.head_cap().saturating_sub(self.head.len());
        if head_room > 0 {
            let take = head_room.min(rest.len());
            self.head.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        if rest.is_empty() {
            return;
        }

        let tail_cap = self.tail_cap();
        if rest.len() >= tail_cap {
            // The chunk alone fills the tail: everything currently buffered drops out.
            self.omitted += self.tail.len() + (rest.len() - tail_cap);
            self.tail.clear();
            self.tail.extend(&rest[rest.len() - tail_cap..]);
            return;
        }

        self.tail.extend(rest);
        if self.tail.len() > tail_cap {
            let excess = self.tail.len() - tail_cap;
            self.tail.drain(..excess);
            self.omitted += excess;
        }
    }

    /// Number of bytes dropped from the middle so far.
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    pub fn is_truncated(&self) -> bool {
        self.omitted > 0
    }

    /// Render the captured bytes as text.
    ///
    /// ANSI escapes are removed when `strip_ansi` is set; invalid UTF-8 is
    /// replaced rather than rejected. A marker line records how much was
    /// dropped.
    pub fn render(&self, strip_ansi: bool) -> String {
        let decode = |bytes: &[u8]| -> String {
            if strip_ansi {
                String::from_utf8_lossy(&strip_ansi_escapes::strip(bytes)).into_owned()
            } else {
                String::from_utf8_lossy(bytes).into_owned()
            }
        };

        let tail: Vec<u8> = self.tail.iter().copied().collect();
        if self.omitted == 0 {
            let mut all = self.head.clone();
            all.extend_from_slice(&tail);
            return decode(&all);
        }

        format!(
            "{}\n\n... [OUTPUT TRUNCATED: {} bytes omitted] ...\n\n{}",
            decode(&self.head),
            self.omitted,
            decode(&tail)
        )
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(input: &[u8], limit: usize, chunk: usize) -> CaptureBuffer {
        let mut buf = CaptureBuffer::new(limit);
        for part in input.chunks(chunk.max(1)) {
            buf.push(part);
        }
        buf
    }

    #[test]
    fn short_input_returned_as_is() {
        let buf = capture(b"hello world", DEFAULT_MAX_BYTES, 4);
        assert!(!buf.is_truncated());
        assert_eq!(buf.render(false), "hello world");
    }

    #[test]
    fn exact_boundary_is_not_truncated() {
        let input = vec![b'x'; 1_000];
        let buf = capture(&input, 1_000, 7);
        assert!(!buf.is_truncated());
        assert_eq!(buf.render(false).len(), 1_000);
    }

    #[test]
    fn one_over_boundary_is_truncated() {
        let input = vec![b'a'; 1_001];
        let buf = capture(&input, 1_000, 64);
        assert_eq!(buf.omitted(), 1);
        assert!(buf.render(false).contains("1 bytes omitted"));
    }

    #[test]
    fn large_input_preserves_head_and_tail() {
        let mut input = vec![b'A'; 10_000];
        input.extend(vec![b'B'; 20_000]);
        input.extend(vec![b'C'; 10_000]);

        let buf = capture(&input, 1_000, 4096);
        let text = buf.render(false);

        assert!(text.contains("OUTPUT TRUNCATED"));
        assert!(text.starts_with('A'));
        assert!(text.ends_with('C'));
        assert_eq!(buf.omitted(), 39_000);
    }

    #[test]
    fn chunk_size_does_not_change_result() {
        let input: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
        let one = capture(&input, 300, 1).render(false);
        let big = capture(&input, 300, 5_000).render(false);
        let odd = capture(&input, 300, 97).render(false);
        assert_eq!(one, big);
        assert_eq!(one, odd);
    }

    #[test]
    fn ansi_escapes_are_stripped_on_request() {
        let buf = capture(b"\x1b[31mred\x1b[0m", 100, 3);
        assert_eq!(buf.render(true), "red");
        assert!(buf.render(false).contains("\x1b[31m"));
    }

    #[test]
    fn empty_input_returned_as_is() {
        let buf = CaptureBuffer::default();
        assert_eq!(buf.render(true), "");
    }
}
