//! Streaming codecs for backup artifacts.
//!
//! The codec set is closed: `store`, `gzip` and `zstd`. Text from the
//! configuration layer is parsed once into [`CodecKind`]; nothing past that
//! boundary deals with codec names.

use crate::utils::errors::BackupError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// zstd level used for every artifact.
pub const ZSTD_LEVEL: i32 = 3;

/// gzip level (6 = balanced speed/ratio).
pub const GZIP_LEVEL: u32 = 6;

/// Whether the artifact wraps a tar container or a single raw stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Plain,
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecKind {
    /// Bytes are written as-is
    Store,
    Gzip,
    #[default]
    Zstd,
}

impl CodecKind {
    /// Names accepted by [`CodecKind::from_str`], in display order.
    pub const SUPPORTED: [&'static str; 3] = ["store", "gzip", "zstd"];

    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::Store => "store",
            CodecKind::Gzip => "gzip",
            CodecKind::Zstd => "zstd",
        }
    }

    /// File name suffix appended to artifacts produced with this codec.
    pub fn suffix(&self, layout: Layout) -> &'static str {
        match (self, layout) {
            (CodecKind::Store, Layout::Plain) => "",
            (CodecKind::Store, Layout::Container) => ".tar",
            (CodecKind::Gzip, Layout::Plain) => ".gz",
            (CodecKind::Gzip, Layout::Container) => ".tgz",
            (CodecKind::Zstd, Layout::Plain) => ".zst",
            (CodecKind::Zstd, Layout::Container) => ".tar.zst",
        }
    }

    /// Wrap `dest` in a streaming encoder.
    ///
    /// The returned writer must be closed with [`CodecWriter::finish`] so the
    /// codec trailer is written before `dest` is released.
    pub fn encoder<W: Write>(&self, dest: W) -> io::Result<CodecWriter<W>> {
        Ok(match self {
            CodecKind::Store => CodecWriter::Store(dest),
            CodecKind::Gzip => CodecWriter::Gzip(GzEncoder::new(dest, Compression::new(GZIP_LEVEL))),
            CodecKind::Zstd => CodecWriter::Zstd(zstd::Encoder::new(dest, ZSTD_LEVEL)?),
        })
    }

    /// Wrap `src` in the matching streaming decoder.
    pub fn decoder<'a, R: Read + 'a>(&self, src: R) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            CodecKind::Store => Box::new(src),
            CodecKind::Gzip => Box::new(GzDecoder::new(src)),
            CodecKind::Zstd => Box::new(zstd::Decoder::new(src)?),
        })
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = BackupError;

    /// Empty input selects zstd; `none` is kept as an alias of `store`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "zstd" => Ok(CodecKind::Zstd),
            "gzip" => Ok(CodecKind::Gzip),
            "store" | "none" => Ok(CodecKind::Store),
            other => Err(BackupError::Config(format!(
                "unsupported compression method '{}', supported methods: {}",
                other,
                CodecKind::SUPPORTED.join(", ")
            ))),
        }
    }
}

/// Encoder side of a codec, writing into `W`.
pub enum CodecWriter<W: Write> {
    Store(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> CodecWriter<W> {
    /// Flush the codec trailer and hand back the destination.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CodecWriter::Store(mut w) => {
                w.flush()?;
                Ok(w)
            }
            CodecWriter::Gzip(e) => e.finish(),
            CodecWriter::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CodecWriter::Store(w) => w.write(buf),
            CodecWriter::Gzip(e) => e.write(buf),
            CodecWriter::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CodecWriter::Store(w) => w.flush(),
            CodecWriter::Gzip(e) => e.flush(),
            CodecWriter::Zstd(e) => e.flush(),
        }
    }
}
