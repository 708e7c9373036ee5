//! Minimal GGUF header reader.
//!
//! Reads only the metadata key/value section of a GGUF v2/v3 file. Scalar
//! and string values are collected into a JSON map; arrays (token tables and
//! the like) are skipped with correct framing so parsing can continue past
//! them. Tensor data is never touched.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF" little-endian

/// Sanity caps against corrupt headers.
const MAX_KEY_LEN: u64 = 64 * 1024;
const MAX_STRING_LEN: u64 = 1024 * 1024;
const MAX_KV_COUNT: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata: Map<String, Value>,
}

impl GgufHeader {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.metadata.get(key)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

pub fn read_gguf_header(path: &Path) -> Result<GgufHeader> {
    let file = File::open(path)
        .with_context(|| format!("failed to open model file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let magic = read_u32(&mut reader)?;
    if magic != GGUF_MAGIC {
        bail!("{} is not a GGUF file (bad magic)", path.display());
    }
    let version = read_u32(&mut reader)?;
    if !(2..=3).contains(&version) {
        bail!("unsupported GGUF version {} in {}", version, path.display());
    }

    let tensor_count = read_u64(&mut reader)?;
    let kv_count = read_u64(&mut reader)?;
    if kv_count > MAX_KV_COUNT {
        bail!("implausible metadata count {} in {}", kv_count, path.display());
    }

    let mut metadata = Map::new();
    for _ in 0..kv_count {
        let key = read_string(&mut reader, MAX_KEY_LEN)?;
        let value_type = read_u32(&mut reader)?;
        if let Some(value) = read_value(&mut reader, value_type)? {
            metadata.insert(key, value);
        }
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata,
    })
}

fn read_value(reader: &mut BufReader<File>, value_type: u32) -> Result<Option<Value>> {
    let value = match value_type {
        0 => Some(Value::from(read_bytes::<1>(reader)?[0])),
        1 => Some(Value::from(read_bytes::<1>(reader)?[0] as i8)),
        2 => Some(Value::from(u16::from_le_bytes(read_bytes(reader)?))),
        3 => Some(Value::from(i16::from_le_bytes(read_bytes(reader)?))),
        4 => Some(Value::from(u32::from_le_bytes(read_bytes(reader)?))),
        5 => Some(Value::from(i32::from_le_bytes(read_bytes(reader)?))),
        6 => Some(Value::from(f32::from_le_bytes(read_bytes(reader)?) as f64)),
        7 => Some(Value::from(read_bytes::<1>(reader)?[0] != 0)),
        8 => Some(Value::from(read_string(reader, MAX_STRING_LEN)?)),
        9 => {
            skip_array(reader)?;
            None
        }
        10 => Some(Value::from(u64::from_le_bytes(read_bytes(reader)?))),
        11 => Some(Value::from(i64::from_le_bytes(read_bytes(reader)?))),
        12 => Some(Value::from(f64::from_le_bytes(read_bytes(reader)?))),
        other => bail!("unknown GGUF metadata value type {}", other),
    };
    Ok(value)
}

/// Element byte width for fixed-size types; strings and nested arrays need
/// per-element reads.
fn fixed_width(value_type: u32) -> Option<u64> {
    match value_type {
        0 | 1 | 7 => Some(1),
        2 | 3 => Some(2),
        4 | 5 | 6 => Some(4),
        10 | 11 | 12 => Some(8),
        _ => None,
    }
}

fn skip_array(reader: &mut BufReader<File>) -> Result<()> {
    let elem_type = read_u32(reader)?;
    let count = read_u64(reader)?;

    if let Some(width) = fixed_width(elem_type) {
        let total = width
            .checked_mul(count)
            .context("array size overflow in GGUF header")?;
        reader.seek(SeekFrom::Current(total as i64))?;
        return Ok(());
    }

    match elem_type {
        8 => {
            for _ in 0..count {
                let len = read_u64(reader)?;
                if len > MAX_STRING_LEN {
                    bail!("implausible string length {} in GGUF array", len);
                }
                reader.seek(SeekFrom::Current(len as i64))?;
            }
            Ok(())
        }
        9 => {
            for _ in 0..count {
                skip_array(reader)?;
            }
            Ok(())
        }
        other => bail!("unknown GGUF array element type {}", other),
    }
}

fn read_bytes<const N: usize>(reader: &mut BufReader<File>) -> Result<[u8; N]> {
    let mut buffer = [0u8; N];
    reader
        .read_exact(&mut buffer)
        .context("truncated GGUF header")?;
    Ok(buffer)
}

fn read_u32(reader: &mut BufReader<File>) -> Result<u32> {
    Ok(u32::from_le_bytes(read_bytes(reader)?))
}

fn read_u64(reader: &mut BufReader<File>) -> Result<u64> {
    Ok(u64::from_le_bytes(read_bytes(reader)?))
}

fn read_string(reader: &mut BufReader<File>, limit: u64) -> Result<String> {
    let len = read_u64(reader)?;
    if len > limit {
        bail!("implausible string length {} in GGUF header", len);
    }
    let mut buffer = vec![0u8; len as usize];
    reader
        .read_exact(&mut buffer)
        .context("truncated GGUF string")?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// llama.cpp file type enum names, as written into `general.file_type`.
pub fn file_type_name(value: u64) -> String {
    let name = match value {
        0 => "ALL_F32",
        1 => "MOSTLY_F16",
        2 => "MOSTLY_Q4_0",
        3 => "MOSTLY_Q4_1",
        4 => "MOSTLY_Q4_1_SOME_F16",
        7 => "MOSTLY_Q8_0",
        8 => "MOSTLY_Q5_0",
        9 => "MOSTLY_Q5_1",
        10 => "MOSTLY_Q2_K",
        11 => "MOSTLY_Q3_K_S",
        12 => "MOSTLY_Q3_K_M",
        13 => "MOSTLY_Q3_K_L",
        14 => "MOSTLY_Q4_K_S",
        15 => "MOSTLY_Q4_K_M",
        16 => "MOSTLY_Q5_K_S",
        17 => "MOSTLY_Q5_K_M",
        18 => "MOSTLY_Q6_K",
        19 => "MOSTLY_IQ2_XXS",
        20 => "MOSTLY_IQ2_XS",
        21 => "MOSTLY_Q2_K_S",
        22 => "MOSTLY_IQ3_XS",
        23 => "MOSTLY_IQ3_XXS",
        24 => "MOSTLY_IQ1_S",
        25 => "MOSTLY_IQ4_NL",
        26 => "MOSTLY_IQ3_S",
        27 => "MOSTLY_IQ3_M",
        28 => "MOSTLY_IQ2_S",
        29 => "MOSTLY_IQ2_M",
        30 => "MOSTLY_IQ4_XS",
        31 => "MOSTLY_IQ1_M",
        32 => "MOSTLY_BF16",
        other => return format!("Type_{}", other),
    };
    name.to_string()
}
