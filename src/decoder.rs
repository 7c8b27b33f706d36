//! Incremental decoding of child process output.
//!
//! [`Utf8StreamDecoder`] turns arbitrarily chunked bytes into text without
//! splitting multi-byte sequences; [`LineDecoder`] builds on it to emit complete
//! lines, holding back an unterminated tail until more data or end of stream.

/// Incremental UTF-8 decoder that carries incomplete sequences across chunks.
///
/// Invalid sequences decode to U+FFFD, matching `String::from_utf8_lossy`.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `chunk` (plus any carried bytes) as forms complete characters.
    pub fn write(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut consumed = 0;

        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_up_to = consumed + err.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[consumed..valid_up_to])
                            .unwrap_or_default(),
                    );
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_up_to + bad;
                        }
                        None => {
                            // Incomplete sequence at the end; wait for the next chunk
                            consumed = valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush carried bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

fn is_terminator(c: char) -> bool {
    c == '\n' || c == '\r'
}

/// Splits a byte stream into lines on `\n`/`\r`, collapsing runs of terminators.
///
/// No line is emitted before its terminator (or [`LineDecoder::end`]) is seen,
/// so the produced sequence does not depend on how the stream was chunked.
#[derive(Debug, Default)]
pub struct LineDecoder {
    decoder: Utf8StreamDecoder,
    remaining: String,
    lines: Vec<String>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the lines it completed.
    pub fn write(&mut self, chunk: &[u8]) -> Vec<String> {
        let decoded = self.decoder.write(chunk);
        let value = if self.remaining.is_empty() {
            decoded
        } else {
            let mut v = std::mem::take(&mut self.remaining);
            v.push_str(&decoded);
            v
        };

        let completed = self.split(&value);
        self.lines.extend(completed.iter().cloned());
        completed
    }

    fn split(&mut self, value: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut start = value
            .char_indices()
            .find(|(_, c)| !is_terminator(*c))
            .map(|(i, _)| i)
            .unwrap_or(value.len());

        let base = start;
        let mut chars = value[base..].char_indices().map(move |(i, c)| (i + base, c));
        while let Some((idx, c)) = chars.next() {
            if !is_terminator(c) {
                continue;
            }
            result.push(value[start..idx].to_string());
            start = value.len();
            for (next_idx, next) in chars.by_ref() {
                if !is_terminator(next) {
                    start = next_idx;
                    break;
                }
            }
        }

        self.remaining = value[start..].to_string();
        result
    }

    /// Signal end of stream; flushes an unterminated tail as a final line.
    pub fn end(&mut self) -> Option<String> {
        let tail = self.decoder.finish();
        self.remaining.push_str(&tail);
        if self.remaining.is_empty() {
            return None;
        }
        let last = std::mem::take(&mut self.remaining);
        self.lines.push(last.clone());
        Some(last)
    }

    /// All lines completed so far.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_in_chunks(input: &[u8], size: usize) -> Vec<String> {
        let mut decoder = LineDecoder::new();
        for chunk in input.chunks(size) {
            decoder.write(chunk);
        }
        decoder.end();
        decoder.into_lines()
    }

    #[test]
    fn test_splits_on_newlines_and_collapses_runs() {
        let lines = decode_in_chunks(b"one\ntwo\r\n\r\nthree\n", 64);
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_leading_terminators_do_not_shift_offsets() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.write("\r\n\nné\nb".as_bytes()), vec!["né"]);
        assert_eq!(decoder.end(), Some("b".to_string()));
    }

    #[test]
    fn test_holds_unterminated_tail_until_end() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.write(b"[{\"filepath\""), Vec::<String>::new());
        assert_eq!(decoder.write(b": \"a.sql\"}]\npartial"), vec!["[{\"filepath\": \"a.sql\"}]"]);
        assert_eq!(decoder.end(), Some("partial".to_string()));
        assert_eq!(decoder.lines().len(), 2);
    }

    #[test]
    fn test_end_without_tail_emits_nothing() {
        let mut decoder = LineDecoder::new();
        decoder.write(b"done\n");
        assert_eq!(decoder.end(), None);
        assert_eq!(decoder.into_lines(), vec!["done"]);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let input = "[{\"filepath\": \"stdin\", \"violations\": []}]\r\n\
                     status text é ü\n\n[{\"filepath\": \"b.sql\"}]\rtrailing"
            .as_bytes();
        let expected = decode_in_chunks(input, input.len());
        assert_eq!(expected.len(), 4);
        for size in 1..input.len() {
            assert_eq!(decode_in_chunks(input, size), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_utf8_sequence_split_across_chunks() {
        let mut decoder = Utf8StreamDecoder::new();
        let bytes = "é".as_bytes();
        assert_eq!(decoder.write(&bytes[..1]), "");
        assert_eq!(decoder.write(&bytes[1..]), "é");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_invalid_bytes_become_replacement_chars() {
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.write(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_truncated_sequence_flushed_lossily() {
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.write(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
