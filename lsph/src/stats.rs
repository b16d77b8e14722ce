//! Collecting and reporting construction events.

use std::io::Write;

/// Trait for collecting (and summarizing or reporting) events during construction.
///
/// The pipeline reports each solved bucket from whichever thread solved it,
/// serialized under an internal lock.
pub trait BuildStatsCollector: Send {
    /// Called once per bucket: its index, number of keys, and the number of
    /// local seeds tried before the bucket's system became solvable.
    #[inline(always)] fn bucket(&mut self, _index: usize, _keys: usize, _attempts: u16) {}

    /// Called once at the end of the building process.
    #[inline(always)] fn end(&mut self) {}
}

/// Ignores all events and does nothing.
impl BuildStatsCollector for () {}

/// Reports events to the wrapped writer, one line per bucket.
pub struct BuildStatsPrinter<W: Write = std::io::Stdout>(pub W);

impl BuildStatsPrinter<std::io::Stdout> {
    /// Reports construction events to the standard output.
    pub fn stdout() -> Self { Self(std::io::stdout()) }
}

impl<W: Write + Send> BuildStatsCollector for BuildStatsPrinter<W> {
    fn bucket(&mut self, index: usize, keys: usize, attempts: u16) {
        let _ = writeln!(self.0, "bucket {}: {} keys, {} seed(s)", index, keys, attempts);
    }

    fn end(&mut self) {
        let _ = self.0.flush();
    }
}

/// Trait for collecting (and summarizing or reporting) events during lookups.
pub trait AccessStatsCollector {
    /// A lookup decoded a codeword of the given bit length.
    #[inline(always)] fn found_with_length(&mut self, _bits: u8) {}

    /// A lookup hit a window that does not start with a valid codeword
    /// (possible only for keys outside the input set).
    #[inline(always)] fn invalid_codeword(&mut self) {}
}

/// Ignores all events and does nothing.
impl AccessStatsCollector for () {}

/// Accumulates the total number of codeword bits decoded.
impl AccessStatsCollector for u64 {
    #[inline(always)] fn found_with_length(&mut self, bits: u8) { *self += bits as u64; }
}
