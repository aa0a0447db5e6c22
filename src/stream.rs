use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Default buffer capacity for single-file streams (64KB).
pub const DEFAULT_BUFFER_BYTES: usize = 64 * 1024;

/// Writes a length as an escaped item: base-128 groups, least significant
/// first, high bit set on every byte except the last.
pub fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> Result<()> {
    while value >= 0x80 {
        writer
            .write_u8((value as u8) | 0x80)
            .map_err(|e| Error::Encode("item length", e))?;
        value >>= 7;
    }
    writer
        .write_u8(value as u8)
        .map_err(|e| Error::Encode("item length", e))
}

/// Reads an escaped item length. Returns `None` on a clean end of stream,
/// an error if the stream ends between continuation bytes.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = match reader.read_u8() {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && shift == 0 => return Ok(None),
            Err(e) => return Err(Error::Decode("item length", e)),
        };
        if shift >= 63 && byte > 1 {
            return Err(Error::Decode(
                "item length",
                io::Error::new(io::ErrorKind::InvalidData, "varint exceeds 64 bits"),
            ));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

/// Reads one byte, mapping a clean end of stream to `None`.
pub fn read_byte_or_eof<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    match reader.read_u8() {
        Ok(byte) => Ok(Some(byte)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(Error::Decode("stream byte", e)),
    }
}

/// Buffered sequential reader over one input file. Tracks its absolute
/// position so merge passes can report how much of a block is consumed.
pub struct FileReader {
    path: PathBuf,
    reader: BufReader<File>,
    length: u64,
    position: u64,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_capacity(path, DEFAULT_BUFFER_BYTES)
    }

    pub fn with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::Open(path.clone(), e))?;
        let length = file.metadata().map_err(|e| Error::Open(path.clone(), e))?.len();
        Ok(Self {
            path,
            reader: BufReader::with_capacity(capacity, file),
            length,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }

    pub fn read_varint(&mut self) -> Result<Option<u64>> {
        read_varint(self)
    }

    /// Reads a varint-prefixed payload, enforcing the declared maximum.
    /// Returns `None` on a clean end of stream.
    pub fn read_item(&mut self, kind: &'static str, max: usize) -> Result<Option<Vec<u8>>> {
        let len = match self.read_varint()? {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        if len > max {
            return Err(Error::SchemaViolation { kind, len, max });
        }
        let mut payload = vec![0u8; len];
        self.fill(kind, &mut payload)?;
        Ok(Some(payload))
    }

    /// Reads exactly `buf.len()` bytes; a short stream is a decode error.
    pub fn fill(&mut self, field: &'static str, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).map_err(|e| Error::Decode(field, e))
    }

    /// Reads exactly `buf.len()` bytes, or returns `false` if the stream
    /// ended cleanly before the first byte. Ending mid-record is an error.
    pub fn try_fill(&mut self, field: &'static str, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .read(&mut buf[filled..])
                .map_err(|e| Error::Decode(field, e))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::Decode(
                    field,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "record truncated"),
                ));
            }
            filled += n;
        }
        Ok(true)
    }

    /// Fraction of the file consumed so far, in `[0, 1]`.
    pub fn fraction_consumed(&self) -> f64 {
        if self.length == 0 {
            return 1.0;
        }
        self.position as f64 / self.length as f64
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Buffered writer over one output file. `finish` must be called to flush;
/// dropping an unfinished writer discards buffered bytes.
pub struct FileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl FileWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_capacity(path, DEFAULT_BUFFER_BYTES)
    }

    pub fn with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::Open(path.clone(), e))?;
        Ok(Self {
            path,
            writer: BufWriter::with_capacity(capacity, file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        write_varint(self, value)
    }

    /// Writes a varint-prefixed payload.
    pub fn write_item(&mut self, payload: &[u8]) -> Result<()> {
        self.write_varint(payload.len() as u64)?;
        self.write_all(payload)
            .map_err(|e| Error::Encode("item payload", e))
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
