use std::io::{self, BufRead};

/// Iterator over newline-terminated lines of a byte stream, tracking the
/// offset just past each line.
///
/// Lines are decoded lossily as UTF-8 and a trailing `\r` is removed. A final
/// line without a newline is only yielded when [`include_partial`] is set;
/// otherwise iteration stops in front of it and [`offset`] stays at the end of
/// the last complete line, so a later read from that offset picks the line up
/// once it has been terminated.
///
/// [`include_partial`]: LineReader::include_partial
/// [`offset`]: LineReader::offset
pub struct LineReader<R> {
    reader: R,
    pos: u64,
    include_partial: bool,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> LineReader<R> {
    /// `start` is the absolute offset `reader` is positioned at.
    pub fn new(reader: R, start: u64) -> Self {
        LineReader {
            reader,
            pos: start,
            include_partial: false,
            buf: Vec::new(),
            done: false,
        }
    }

    /// Also yield an unterminated final line. Used for files nobody writes to
    /// anymore.
    pub fn include_partial(mut self, include: bool) -> Self {
        self.include_partial = include;
        self
    }

    /// Offset just past the last line yielded.
    pub fn offset(&self) -> u64 {
        self.pos
    }
}

impl<R: BufRead> Iterator for LineReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        self.buf.clear();
        let n = match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                return None;
            }
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let line = match self.buf.strip_suffix(b"\n") {
            Some(line) => line,
            None if self.include_partial => {
                self.done = true;
                &self.buf[..]
            }
            None => {
                self.done = true;
                return None;
            }
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        self.pos += n as u64;
        Some(Ok(String::from_utf8_lossy(line).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &[u8], include_partial: bool) -> (Vec<String>, u64) {
        let mut reader = LineReader::new(Cursor::new(input), 0).include_partial(include_partial);
        let lines = reader.by_ref().collect::<io::Result<Vec<_>>>().unwrap();
        (lines, reader.offset())
    }

    #[test]
    fn complete_lines_advance_offset() {
        let (lines, offset) = collect(b"a\nbb\n", false);
        assert_eq!(lines, vec!["a", "bb"]);
        assert_eq!(offset, 5);
    }

    #[test]
    fn partial_tail_is_held_back() {
        let (lines, offset) = collect(b"a\nhalf", false);
        assert_eq!(lines, vec!["a"]);
        assert_eq!(offset, 2);
    }

    #[test]
    fn partial_tail_can_be_included() {
        let (lines, offset) = collect(b"a\nlast", true);
        assert_eq!(lines, vec!["a", "last"]);
        assert_eq!(offset, 6);
    }

    #[test]
    fn crlf_and_invalid_utf8() {
        let (lines, _) = collect(b"win\r\n\xffok\n\n", false);
        assert_eq!(lines, vec!["win".to_string(), "\u{fffd}ok".to_string(), String::new()]);
    }

    #[test]
    fn offset_is_absolute() {
        let mut reader = LineReader::new(Cursor::new(&b"xy\n"[..]), 100);
        assert_eq!(reader.next().unwrap().unwrap(), "xy");
        assert_eq!(reader.offset(), 103);
    }
}
