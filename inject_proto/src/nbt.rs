//! Named binary tag codec.
//!
//! Big-endian payloads, length-prefixed strings in Java's modified UTF-8, and
//! compounds that keep insertion order so encoded files are byte-stable.

use std::io::{self, Read, Write};

use thiserror::Error;

const MAX_DEPTH: usize = 512;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    End = 0,
    Byte = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    Float = 5,
    Double = 6,
    ByteArray = 7,
    String = 8,
    List = 9,
    Compound = 10,
    IntArray = 11,
    LongArray = 12,
}

impl TagKind {
    pub fn from_id(id: u8) -> Result<Self, NbtError> {
        Ok(match id {
            0 => TagKind::End,
            1 => TagKind::Byte,
            2 => TagKind::Short,
            3 => TagKind::Int,
            4 => TagKind::Long,
            5 => TagKind::Float,
            6 => TagKind::Double,
            7 => TagKind::ByteArray,
            8 => TagKind::String,
            9 => TagKind::List,
            10 => TagKind::Compound,
            11 => TagKind::IntArray,
            12 => TagKind::LongArray,
            other => return Err(NbtError::UnknownTag(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum NbtError {
    #[error("nbt io failed: {0}")]
    Io(#[from] io::Error),
    #[error("string of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),
    #[error("sequence of {0} elements exceeds the i32 length range")]
    LengthOverflow(usize),
    #[error("list mixes {expected:?} and {found:?} elements")]
    HeterogeneousList { expected: TagKind, found: TagKind },
    #[error("unknown tag id {0}")]
    UnknownTag(u8),
    #[error("root tag must be a compound, found {0:?}")]
    RootNotCompound(TagKind),
    #[error("negative sequence length {0}")]
    NegativeLength(i32),
    #[error("invalid modified utf-8 string")]
    InvalidString,
    #[error("tags nested deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<i8>),
    String(String),
    /// Homogeneous list; an empty list is written with element type `End`.
    List(Vec<Tag>),
    Compound(Compound),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
}

impl Tag {
    pub fn kind(&self) -> TagKind {
        match self {
            Tag::Byte(_) => TagKind::Byte,
            Tag::Short(_) => TagKind::Short,
            Tag::Int(_) => TagKind::Int,
            Tag::Long(_) => TagKind::Long,
            Tag::Float(_) => TagKind::Float,
            Tag::Double(_) => TagKind::Double,
            Tag::ByteArray(_) => TagKind::ByteArray,
            Tag::String(_) => TagKind::String,
            Tag::List(_) => TagKind::List,
            Tag::Compound(_) => TagKind::Compound,
            Tag::IntArray(_) => TagKind::IntArray,
            Tag::LongArray(_) => TagKind::LongArray,
        }
    }

    pub fn flag(value: bool) -> Tag {
        Tag::Byte(value as i8)
    }

    pub fn string(value: impl Into<String>) -> Tag {
        Tag::String(value.into())
    }

    pub fn int_list(values: &[i32]) -> Tag {
        Tag::List(values.iter().copied().map(Tag::Int).collect())
    }

    pub fn double_list(values: &[f64]) -> Tag {
        Tag::List(values.iter().copied().map(Tag::Double).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Tag::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Tag::Byte(value) => Some(*value as i64),
            Tag::Short(value) => Some(*value as i64),
            Tag::Int(value) => Some(*value as i64),
            Tag::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Tag::Float(value) => Some(*value as f64),
            Tag::Double(value) => Some(*value),
            _ => self.as_i64().map(|value| value as f64),
        }
    }

    pub fn as_list(&self) -> Option<&[Tag]> {
        match self {
            Tag::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_compound(&self) -> Option<&Compound> {
        match self {
            Tag::Compound(compound) => Some(compound),
            _ => None,
        }
    }
}

impl From<Compound> for Tag {
    fn from(value: Compound) -> Self {
        Tag::Compound(value)
    }
}

/// Ordered set of named tags.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Compound {
    entries: Vec<(String, Tag)>,
}

impl Compound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `name`, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, tag: Tag) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => *slot = tag,
            None => self.entries.push((name, tag)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, tag: Tag) -> Self {
        self.insert(name, tag);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, tag)| tag)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Tag::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Tag::as_i64)
    }

    pub fn get_list(&self, name: &str) -> Option<&[Tag]> {
        self.get(name).and_then(Tag::as_list)
    }

    pub fn get_compound(&self, name: &str) -> Option<&Compound> {
        self.get(name).and_then(Tag::as_compound)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tag)> {
        self.entries.iter().map(|(key, tag)| (key.as_str(), tag))
    }
}

/// Writes `root` as a named compound, the layout every structure file uses.
pub fn write_named<W: Write>(writer: &mut W, name: &str, root: &Compound) -> Result<(), NbtError> {
    writer.write_all(&[TagKind::Compound as u8])?;
    write_string(writer, name)?;
    write_compound(writer, root)
}

/// Reads a named root compound.
pub fn read_named<R: Read>(reader: &mut R) -> Result<(String, Compound), NbtError> {
    let kind = TagKind::from_id(read_u8(reader)?)?;
    if kind != TagKind::Compound {
        return Err(NbtError::RootNotCompound(kind));
    }
    let name = read_string(reader)?;
    let root = read_compound(reader, 0)?;
    Ok((name, root))
}

fn write_payload<W: Write>(writer: &mut W, tag: &Tag) -> Result<(), NbtError> {
    match tag {
        Tag::Byte(value) => writer.write_all(&value.to_be_bytes())?,
        Tag::Short(value) => writer.write_all(&value.to_be_bytes())?,
        Tag::Int(value) => writer.write_all(&value.to_be_bytes())?,
        Tag::Long(value) => writer.write_all(&value.to_be_bytes())?,
        Tag::Float(value) => writer.write_all(&value.to_be_bytes())?,
        Tag::Double(value) => writer.write_all(&value.to_be_bytes())?,
        Tag::ByteArray(values) => {
            write_length(writer, values.len())?;
            let bytes: Vec<u8> = values.iter().map(|value| *value as u8).collect();
            writer.write_all(&bytes)?;
        }
        Tag::String(value) => write_string(writer, value)?,
        Tag::List(items) => {
            let element = items.first().map(Tag::kind).unwrap_or(TagKind::End);
            if let Some(found) = items.iter().map(Tag::kind).find(|kind| *kind != element) {
                return Err(NbtError::HeterogeneousList {
                    expected: element,
                    found,
                });
            }
            writer.write_all(&[element as u8])?;
            write_length(writer, items.len())?;
            for item in items {
                write_payload(writer, item)?;
            }
        }
        Tag::Compound(compound) => write_compound(writer, compound)?,
        Tag::IntArray(values) => {
            write_length(writer, values.len())?;
            for value in values {
                writer.write_all(&value.to_be_bytes())?;
            }
        }
        Tag::LongArray(values) => {
            write_length(writer, values.len())?;
            for value in values {
                writer.write_all(&value.to_be_bytes())?;
            }
        }
    }
    Ok(())
}

fn write_compound<W: Write>(writer: &mut W, compound: &Compound) -> Result<(), NbtError> {
    for (name, tag) in compound.iter() {
        writer.write_all(&[tag.kind() as u8])?;
        write_string(writer, name)?;
        write_payload(writer, tag)?;
    }
    writer.write_all(&[TagKind::End as u8])?;
    Ok(())
}

fn write_length<W: Write>(writer: &mut W, len: usize) -> Result<(), NbtError> {
    let len = i32::try_from(len).map_err(|_| NbtError::LengthOverflow(len))?;
    writer.write_all(&len.to_be_bytes())?;
    Ok(())
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), NbtError> {
    let encoded = encode_modified_utf8(value);
    let len = u16::try_from(encoded.len()).map_err(|_| NbtError::StringTooLong(encoded.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&encoded)?;
    Ok(())
}

fn read_payload<R: Read>(reader: &mut R, kind: TagKind, depth: usize) -> Result<Tag, NbtError> {
    if depth > MAX_DEPTH {
        return Err(NbtError::TooDeep(MAX_DEPTH));
    }
    Ok(match kind {
        TagKind::End => return Err(NbtError::UnknownTag(0)),
        TagKind::Byte => Tag::Byte(i8::from_be_bytes(read_array(reader)?)),
        TagKind::Short => Tag::Short(i16::from_be_bytes(read_array(reader)?)),
        TagKind::Int => Tag::Int(i32::from_be_bytes(read_array(reader)?)),
        TagKind::Long => Tag::Long(i64::from_be_bytes(read_array(reader)?)),
        TagKind::Float => Tag::Float(f32::from_be_bytes(read_array(reader)?)),
        TagKind::Double => Tag::Double(f64::from_be_bytes(read_array(reader)?)),
        TagKind::ByteArray => {
            let len = read_length(reader)?;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            Tag::ByteArray(bytes.into_iter().map(|byte| byte as i8).collect())
        }
        TagKind::String => Tag::String(read_string(reader)?),
        TagKind::List => {
            let element = TagKind::from_id(read_u8(reader)?)?;
            let len = read_length(reader)?;
            if element == TagKind::End {
                Tag::List(Vec::new())
            } else {
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(read_payload(reader, element, depth + 1)?);
                }
                Tag::List(items)
            }
        }
        TagKind::Compound => Tag::Compound(read_compound(reader, depth + 1)?),
        TagKind::IntArray => {
            let len = read_length(reader)?;
            let mut values = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                values.push(i32::from_be_bytes(read_array(reader)?));
            }
            Tag::IntArray(values)
        }
        TagKind::LongArray => {
            let len = read_length(reader)?;
            let mut values = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                values.push(i64::from_be_bytes(read_array(reader)?));
            }
            Tag::LongArray(values)
        }
    })
}

fn read_compound<R: Read>(reader: &mut R, depth: usize) -> Result<Compound, NbtError> {
    let mut compound = Compound::new();
    loop {
        let kind = TagKind::from_id(read_u8(reader)?)?;
        if kind == TagKind::End {
            return Ok(compound);
        }
        let name = read_string(reader)?;
        let tag = read_payload(reader, kind, depth)?;
        compound.insert(name, tag);
    }
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, NbtError> {
    Ok(read_array::<R, 1>(reader)?[0])
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N], NbtError> {
    let mut buffer = [0u8; N];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

fn read_length<R: Read>(reader: &mut R) -> Result<usize, NbtError> {
    let len = i32::from_be_bytes(read_array(reader)?);
    usize::try_from(len).map_err(|_| NbtError::NegativeLength(len))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, NbtError> {
    let len = u16::from_be_bytes(read_array(reader)?) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    decode_modified_utf8(&bytes)
}

/// Java's modified UTF-8: NUL takes two bytes and supplementary characters are
/// written as two three-byte surrogate halves.
fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) as u8 & 0x1F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) as u8 & 0x0F));
                out.push(0x80 | ((unit >> 6) as u8 & 0x3F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
        }
    }
    out
}

fn decode_modified_utf8(bytes: &[u8]) -> Result<String, NbtError> {
    let continuation = |index: usize| -> Result<u16, NbtError> {
        match bytes.get(index) {
            Some(byte) if byte & 0xC0 == 0x80 => Ok((byte & 0x3F) as u16),
            _ => Err(NbtError::InvalidString),
        }
    };
    let mut units = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let lead = bytes[index];
        if lead & 0x80 == 0 {
            units.push(lead as u16);
            index += 1;
        } else if lead & 0xE0 == 0xC0 {
            units.push(((lead & 0x1F) as u16) << 6 | continuation(index + 1)?);
            index += 2;
        } else if lead & 0xF0 == 0xE0 {
            units.push(
                ((lead & 0x0F) as u16) << 12
                    | continuation(index + 1)? << 6
                    | continuation(index + 2)?,
            );
            index += 3;
        } else {
            return Err(NbtError::InvalidString);
        }
    }
    String::from_utf16(&units).map_err(|_| NbtError::InvalidString)
}
