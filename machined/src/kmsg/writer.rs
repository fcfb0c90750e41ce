use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Longest record the kernel accepts without splitting (1024 minus header room).
pub const MAX_LINE_LENGTH: usize = 1024 - 48;

const ELLIPSIS: &[u8] = b"...\n";

/// Writes one kernel log record per line.
///
/// Input is split at newlines and every line becomes exactly one `write`,
/// so concurrent writers never interleave partial lines. Lines over
/// [`MAX_LINE_LENGTH`] are truncated and end in `...`.
#[derive(Debug)]
pub struct KmsgWriter<W: Write = File> {
    inner: W,
    prefix: Vec<u8>,
}

impl KmsgWriter<File> {
    /// Open `/dev/kmsg` (or another path) for appending.
    pub fn open(path: impl AsRef<Path>, prefix: &str) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self::new(file, prefix))
    }
}

impl<W: Write> KmsgWriter<W> {
    pub fn new(inner: W, prefix: &str) -> Self {
        let prefix = if prefix.is_empty() {
            Vec::new()
        } else {
            format!("{} ", prefix).into_bytes()
        };
        Self { inner, prefix }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_line(&mut self, content: &[u8]) -> io::Result<()> {
        let mut record = Vec::with_capacity(self.prefix.len() + content.len() + 1);
        record.extend_from_slice(&self.prefix);
        record.extend_from_slice(content);

        if record.len() + 1 > MAX_LINE_LENGTH {
            record.truncate(MAX_LINE_LENGTH - ELLIPSIS.len());
            record.extend_from_slice(ELLIPSIS);
        } else {
            record.push(b'\n');
        }

        self.inner.write_all(&record)
    }
}

impl<W: Write> Write for KmsgWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in buf.split_inclusive(|b| *b == b'\n') {
            let content = line.strip_suffix(b"\n").unwrap_or(line);
            if content.is_empty() {
                continue;
            }
            self.write_line(content)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every write call separately.
    #[derive(Default)]
    struct Writes(Vec<Vec<u8>>);

    impl Write for Writes {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_one_write_per_line() {
        let mut w = KmsgWriter::new(Writes::default(), "[machined]");
        w.write_all(b"first\nsecond\n").unwrap();

        let writes = w.into_inner().0;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"[machined] first\n");
        assert_eq!(writes[1], b"[machined] second\n");
    }

    #[test]
    fn test_unterminated_line_gets_newline() {
        let mut w = KmsgWriter::new(Writes::default(), "");
        w.write_all(b"no newline").unwrap();
        assert_eq!(w.into_inner().0, vec![b"no newline\n".to_vec()]);
    }

    #[test]
    fn test_long_line_truncated() {
        let mut w = KmsgWriter::new(Writes::default(), "");
        let long = vec![b'x'; 2000];
        w.write_all(&long).unwrap();

        let writes = w.into_inner().0;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), MAX_LINE_LENGTH);
        assert!(writes[0].ends_with(b"...\n"));
    }

    #[test]
    fn test_exact_fit_not_truncated() {
        let mut w = KmsgWriter::new(Writes::default(), "");
        let line = vec![b'y'; MAX_LINE_LENGTH - 1];
        w.write_all(&line).unwrap();
        let writes = w.into_inner().0;
        assert_eq!(writes[0].len(), MAX_LINE_LENGTH);
        assert!(writes[0].ends_with(b"y\n"));
    }
}
