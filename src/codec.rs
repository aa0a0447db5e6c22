use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stream::{FileReader, FileWriter};

/// Numeric type of a job's aggregate scalar. The legacy spellings used by
/// the old pipeline's dispatch strings are accepted alongside the new ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericType {
    #[default]
    Int32,
    Int64,
    Float32,
}

impl NumericType {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "int" | "int32" => Ok(NumericType::Int32),
            "_int64" | "int64" => Ok(NumericType::Int64),
            "float" | "float32" => Ok(NumericType::Float32),
            _ => Err(Error::InvalidOperation(format!(
                "unknown numeric type: {}",
                name
            ))),
        }
    }

    /// Wire width in bytes.
    pub fn width(self) -> usize {
        match self {
            NumericType::Int32 | NumericType::Float32 => 4,
            NumericType::Int64 => 8,
        }
    }

    pub fn zero(self) -> Scalar {
        match self {
            NumericType::Int32 => Scalar::Int32(0),
            NumericType::Int64 => Scalar::Int64(0),
            NumericType::Float32 => Scalar::Float32(0.0),
        }
    }

    pub fn one(self) -> Scalar {
        match self {
            NumericType::Int32 => Scalar::Int32(1),
            NumericType::Int64 => Scalar::Int64(1),
            NumericType::Float32 => Scalar::Float32(1.0),
        }
    }

    /// Reads a scalar of this type. The scalar follows a decoded key, so a
    /// short stream here is always a truncation error, never end of input.
    pub fn read(self, input: &mut FileReader) -> Result<Scalar> {
        let scalar = match self {
            NumericType::Int32 => Scalar::Int32(
                input
                    .read_i32::<LittleEndian>()
                    .map_err(|e| Error::Decode("int32 scalar", e))?,
            ),
            NumericType::Int64 => Scalar::Int64(
                input
                    .read_i64::<LittleEndian>()
                    .map_err(|e| Error::Decode("int64 scalar", e))?,
            ),
            NumericType::Float32 => Scalar::Float32(
                input
                    .read_f32::<LittleEndian>()
                    .map_err(|e| Error::Decode("float32 scalar", e))?,
            ),
        };
        Ok(scalar)
    }
}

/// One aggregate value: a count or a weight sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int32(i32),
    Int64(i64),
    Float32(f32),
}

impl Scalar {
    pub fn kind(self) -> NumericType {
        match self {
            Scalar::Int32(_) => NumericType::Int32,
            Scalar::Int64(_) => NumericType::Int64,
            Scalar::Float32(_) => NumericType::Float32,
        }
    }

    /// Adds `other` into this scalar. Integer sums wrap, matching the
    /// arithmetic of blocks written by the old pipeline.
    pub fn accumulate(&mut self, other: Scalar) -> Result<()> {
        match (self, other) {
            (Scalar::Int32(a), Scalar::Int32(b)) => *a = a.wrapping_add(b),
            (Scalar::Int64(a), Scalar::Int64(b)) => *a = a.wrapping_add(b),
            (Scalar::Float32(a), Scalar::Float32(b)) => *a += b,
            _ => {
                return Err(Error::InvalidState(
                    "mixed scalar types in one aggregate".to_string(),
                ))
            }
        }
        Ok(())
    }

    pub fn write(self, output: &mut FileWriter) -> Result<()> {
        match self {
            Scalar::Int32(v) => output
                .write_i32::<LittleEndian>(v)
                .map_err(|e| Error::Encode("int32 scalar", e)),
            Scalar::Int64(v) => output
                .write_i64::<LittleEndian>(v)
                .map_err(|e| Error::Encode("int64 scalar", e)),
            Scalar::Float32(v) => output
                .write_f32::<LittleEndian>(v)
                .map_err(|e| Error::Encode("float32 scalar", e)),
        }
    }
}

// Bucket and mapped files use one internal layout regardless of codec:
// variable payloads carry escaped lengths, and a map record puts both
// lengths before both payloads. Readers below are shared by the reducer,
// grouper and restorer; the partitioner uses the writers.

pub fn write_key_record(output: &mut FileWriter, key: &[u8]) -> Result<()> {
    output.write_item(key)
}

pub fn read_key_record(input: &mut FileReader, max_key: usize) -> Result<Option<Vec<u8>>> {
    input.read_item("key", max_key)
}

pub fn write_weighted_record(output: &mut FileWriter, key: &[u8], weight: Scalar) -> Result<()> {
    output.write_item(key)?;
    weight.write(output)
}

pub fn read_weighted_record(
    input: &mut FileReader,
    max_key: usize,
    ty: NumericType,
) -> Result<Option<(Vec<u8>, Scalar)>> {
    match input.read_item("key", max_key)? {
        Some(key) => Ok(Some((key, ty.read(input)?))),
        None => Ok(None),
    }
}

pub fn write_map_record(output: &mut FileWriter, key: &[u8], value: &[u8]) -> Result<()> {
    output.write_varint(key.len() as u64)?;
    output.write_varint(value.len() as u64)?;
    output
        .write_all(key)
        .and_then(|_| output.write_all(value))
        .map_err(|e| Error::Encode("map record", e))
}

pub fn read_map_record(
    input: &mut FileReader,
    max_key: usize,
    max_value: usize,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let key_len = match input.read_varint()? {
        Some(len) => len as usize,
        None => return Ok(None),
    };
    let value_len = match input.read_varint()? {
        Some(len) => len as usize,
        None => {
            return Err(Error::Decode(
                "value length",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "map record truncated"),
            ))
        }
    };
    if key_len > max_key {
        return Err(Error::SchemaViolation {
            kind: "key",
            len: key_len,
            max: max_key,
        });
    }
    if value_len > max_value {
        return Err(Error::SchemaViolation {
            kind: "value",
            len: value_len,
            max: max_value,
        });
    }
    let mut key = vec![0u8; key_len];
    input.fill("key", &mut key)?;
    let mut value = vec![0u8; value_len];
    input.fill("value", &mut value)?;
    Ok(Some((key, value)))
}

/// Record layout bound to a job by name: how keys, maps and weights are
/// decoded from the job's input, how final outputs are encoded, and how two
/// fixed-size records compare. Bucket files between phases always use the
/// internal layout above; a codec only shapes the outer edges.
pub trait RecordCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Next key from the job input. `None` on a clean end of stream.
    fn read_key(&self, input: &mut FileReader, max_key: usize) -> Result<Option<Vec<u8>>> {
        read_key_record(input, max_key)
    }

    fn read_key_weight(
        &self,
        input: &mut FileReader,
        max_key: usize,
        ty: NumericType,
    ) -> Result<Option<(Vec<u8>, Scalar)>> {
        match self.read_key(input, max_key)? {
            Some(key) => Ok(Some((key, ty.read(input)?))),
            None => Ok(None),
        }
    }

    fn read_map(
        &self,
        input: &mut FileReader,
        max_key: usize,
        max_value: usize,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        read_map_record(input, max_key, max_value)
    }

    /// Final aggregate output, one call per unique key or per tagged record.
    fn write_aggregate(&self, output: &mut FileWriter, key: &[u8], value: Scalar) -> Result<()> {
        write_weighted_record(output, key, value)
    }

    /// Final grouped output, one call per (key, value) pair.
    fn write_set(&self, output: &mut FileWriter, key: &[u8], value: &[u8]) -> Result<()> {
        write_map_record(output, key, value)
    }

    /// Final restored output, one call per original record.
    fn write_map(&self, output: &mut FileWriter, key: &[u8], value: &[u8]) -> Result<()> {
        write_map_record(output, key, value)
    }

    /// Total order over fixed-size records for the comparator sort path.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Escaped-length records in, escaped-length records out.
pub struct BaseCodec;

impl RecordCodec for BaseCodec {
    fn name(&self) -> &'static str {
        "base"
    }
}

/// Raw fixed-width records: the declared maxima are exact sizes and no
/// lengths appear on the wire, in or out.
pub struct FixedCodec;

impl RecordCodec for FixedCodec {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn read_key(&self, input: &mut FileReader, max_key: usize) -> Result<Option<Vec<u8>>> {
        let mut key = vec![0u8; max_key];
        if !input.try_fill("key", &mut key)? {
            return Ok(None);
        }
        Ok(Some(key))
    }

    fn read_map(
        &self,
        input: &mut FileReader,
        max_key: usize,
        max_value: usize,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut key = vec![0u8; max_key];
        if !input.try_fill("key", &mut key)? {
            return Ok(None);
        }
        let mut value = vec![0u8; max_value];
        input.fill("value", &mut value)?;
        Ok(Some((key, value)))
    }

    fn write_aggregate(&self, output: &mut FileWriter, key: &[u8], value: Scalar) -> Result<()> {
        output
            .write_all(key)
            .map_err(|e| Error::Encode("key", e))?;
        value.write(output)
    }

    fn write_set(&self, output: &mut FileWriter, key: &[u8], value: &[u8]) -> Result<()> {
        output
            .write_all(key)
            .and_then(|_| output.write_all(value))
            .map_err(|e| Error::Encode("set record", e))
    }

    fn write_map(&self, output: &mut FileWriter, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_set(output, key, value)
    }
}

/// Fixed records whose trailing four bytes are a little-endian f32 weight;
/// orders by weight ascending, then by the leading bytes. Meant for the
/// comparator sort/merge path.
pub struct FloatTailCodec;

impl FloatTailCodec {
    fn tail_weight(record: &[u8]) -> f32 {
        LittleEndian::read_f32(&record[record.len() - 4..])
    }
}

impl RecordCodec for FloatTailCodec {
    fn name(&self) -> &'static str {
        "float_tail"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if a.len() < 4 || b.len() < 4 {
            return a.cmp(b);
        }
        Self::tail_weight(a)
            .total_cmp(&Self::tail_weight(b))
            .then_with(|| a[..a.len() - 4].cmp(&b[..b.len() - 4]))
    }
}

/// Named codec lookup, resolved once per worker invocation.
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn RecordCodec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry holding the codecs shipped with the engine.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(BaseCodec));
        registry.register(Arc::new(FixedCodec));
        registry.register(Arc::new(FloatTailCodec));
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn RecordCodec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RecordCodec>> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCodec(name.to_string()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_numeric_type_parse() {
        assert_eq!(NumericType::parse("int32").unwrap(), NumericType::Int32);
        assert_eq!(NumericType::parse("int").unwrap(), NumericType::Int32);
        assert_eq!(NumericType::parse("_int64").unwrap(), NumericType::Int64);
        assert_eq!(NumericType::parse("float").unwrap(), NumericType::Float32);
        assert!(NumericType::parse("double").is_err());
    }

    #[test]
    fn test_scalar_accumulate() {
        let mut count = NumericType::Int32.zero();
        count.accumulate(NumericType::Int32.one()).unwrap();
        count.accumulate(NumericType::Int32.one()).unwrap();
        assert_eq!(count, Scalar::Int32(2));

        let mut weight = Scalar::Float32(1.5);
        weight.accumulate(Scalar::Float32(2.5)).unwrap();
        assert_eq!(weight, Scalar::Float32(4.0));

        assert!(count.accumulate(Scalar::Int64(1)).is_err());
    }

    #[test]
    fn test_scalar_wire_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scalars");

        let mut writer = FileWriter::create(&path).unwrap();
        Scalar::Int32(-7).write(&mut writer).unwrap();
        Scalar::Int64(1 << 40).write(&mut writer).unwrap();
        Scalar::Float32(0.25).write(&mut writer).unwrap();
        writer.finish().unwrap();

        let mut reader = FileReader::open(&path).unwrap();
        assert_eq!(NumericType::Int32.read(&mut reader).unwrap(), Scalar::Int32(-7));
        assert_eq!(
            NumericType::Int64.read(&mut reader).unwrap(),
            Scalar::Int64(1 << 40)
        );
        assert_eq!(
            NumericType::Float32.read(&mut reader).unwrap(),
            Scalar::Float32(0.25)
        );
    }

    #[test]
    fn test_map_record_layout_lengths_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("maps");

        let mut writer = FileWriter::create(&path).unwrap();
        write_map_record(&mut writer, b"key", b"value").unwrap();
        writer.finish().unwrap();

        let raw = std::fs::read(&path).unwrap();
        // both escaped lengths precede both payloads
        assert_eq!(&raw[..2], &[3, 5]);
        assert_eq!(&raw[2..5], b"key");
        assert_eq!(&raw[5..], b"value");

        let mut reader = FileReader::open(&path).unwrap();
        let (key, value) = read_map_record(&mut reader, 8, 8).unwrap().unwrap();
        assert_eq!(key, b"key");
        assert_eq!(value, b"value");
        assert!(read_map_record(&mut reader, 8, 8).unwrap().is_none());
    }

    #[test]
    fn test_map_record_empty_value_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("maps");

        let mut writer = FileWriter::create(&path).unwrap();
        write_map_record(&mut writer, b"k", b"").unwrap();
        writer.finish().unwrap();

        let mut reader = FileReader::open(&path).unwrap();
        let (key, value) = read_map_record(&mut reader, 4, 4).unwrap().unwrap();
        assert_eq!(key, b"k");
        assert!(value.is_empty());
    }

    #[test]
    fn test_fixed_codec_reads_raw_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fixed");
        std::fs::write(&path, b"aabbcc").unwrap();

        let codec = FixedCodec;
        let mut reader = FileReader::open(&path).unwrap();
        assert_eq!(codec.read_key(&mut reader, 2).unwrap().unwrap(), b"aa");
        assert_eq!(codec.read_key(&mut reader, 2).unwrap().unwrap(), b"bb");
        assert_eq!(codec.read_key(&mut reader, 2).unwrap().unwrap(), b"cc");
        assert!(codec.read_key(&mut reader, 2).unwrap().is_none());
    }

    #[test]
    fn test_float_tail_orders_by_trailing_weight() {
        let codec = FloatTailCodec;
        let mut low = b"zz".to_vec();
        low.extend_from_slice(&1.0f32.to_le_bytes());
        let mut high = b"aa".to_vec();
        high.extend_from_slice(&2.0f32.to_le_bytes());

        assert_eq!(codec.compare(&low, &high), Ordering::Less);
        assert_eq!(codec.compare(&high, &low), Ordering::Greater);

        let mut tie = b"aa".to_vec();
        tie.extend_from_slice(&1.0f32.to_le_bytes());
        assert_eq!(codec.compare(&tie, &low), Ordering::Less);
    }

    #[test]
    fn test_registry_resolves_builtins() {
        let registry = CodecRegistry::builtin();
        assert_eq!(registry.resolve("base").unwrap().name(), "base");
        assert_eq!(registry.resolve("fixed").unwrap().name(), "fixed");
        assert_eq!(registry.resolve("float_tail").unwrap().name(), "float_tail");

        match registry.resolve("html_hits") {
            Err(Error::UnknownCodec(name)) => assert_eq!(name, "html_hits"),
            other => panic!("expected unknown codec, got {:?}", other.map(|c| c.name())),
        }
    }
}
