//! Binary save format
//!
//! Saves are a flat sequence of little-endian primitives written in a fixed
//! order per object type, preceded by a small header:
//!
//! ```text
//!   [0..4]  Magic bytes "ORSV"
//!   [4..8]  Schema version (u32)
//!   [8..]   Payload
//! ```
//!
//! Strings use a 7-bit variable-length byte count followed by UTF-8 bytes.

use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec3};
use std::io::{Read, Write};

/// Magic bytes identifying a simulation save.
pub const MAGIC: [u8; 4] = *b"ORSV";

/// Current schema version. Bump whenever any object's field order changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Writes save primitives to any byte sink.
pub struct SaveWriter<W: Write> {
    inner: W,
}

impl<W: Write> SaveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.inner.write_all(&MAGIC)?;
        self.write_u32(SCHEMA_VERSION)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.inner.write_all(&[value])?;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Writes an optional index as an i32, using -1 for `None`.
    pub fn write_index(&mut self, value: Option<usize>) -> Result<()> {
        self.write_i32(value.map_or(-1, |v| v as i32))
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        let mut len = bytes.len();
        loop {
            let mut byte = (len & 0x7F) as u8;
            len >>= 7;
            if len != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte)?;
            if len == 0 {
                break;
            }
        }
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn write_vec3(&mut self, value: Vec3) -> Result<()> {
        self.write_f32(value.x)?;
        self.write_f32(value.y)?;
        self.write_f32(value.z)
    }

    /// Writes a matrix as 16 floats, row by row.
    pub fn write_mat4(&mut self, value: &Mat4) -> Result<()> {
        for v in value.transpose().to_cols_array() {
            self.write_f32(v)?;
        }
        Ok(())
    }
}

/// Reads save primitives back in the order they were written.
pub struct SaveReader<R: Read> {
    inner: R,
    version: u32,
}

impl<R: Read> SaveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            version: SCHEMA_VERSION,
        }
    }

    /// Schema version announced by the header, once read.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn read_header(&mut self) -> Result<u32> {
        let mut magic = [0u8; 4];
        self.inner
            .read_exact(&mut magic)
            .context("Save file is too short for a header")?;
        if magic != MAGIC {
            bail!("Not a simulation save: bad magic bytes {:?}", magic);
        }
        let version = self.read_u32()?;
        if version > SCHEMA_VERSION {
            bail!(
                "Save uses schema version {}, but this build only supports up to version {}",
                version,
                SCHEMA_VERSION
            );
        }
        self.version = version;
        Ok(version)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner
            .read_exact(&mut buf)
            .context("Unexpected end of save data")?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Reads an i32 index written by [`SaveWriter::write_index`].
    pub fn read_index(&mut self) -> Result<Option<usize>> {
        let v = self.read_i32()?;
        Ok(if v < 0 { None } else { Some(v as usize) })
    }

    pub fn read_string(&mut self) -> Result<String> {
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            len |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                bail!("Malformed string length in save data");
            }
        }
        let mut bytes = vec![0u8; len];
        self.inner
            .read_exact(&mut bytes)
            .context("Unexpected end of save data in string")?;
        String::from_utf8(bytes).context("Save string is not valid UTF-8")
    }

    pub fn read_vec3(&mut self) -> Result<Vec3> {
        let x = self.read_f32()?;
        let y = self.read_f32()?;
        let z = self.read_f32()?;
        Ok(Vec3::new(x, y, z))
    }

    pub fn read_mat4(&mut self) -> Result<Mat4> {
        let mut values = [0f32; 16];
        for v in values.iter_mut() {
            *v = self.read_f32()?;
        }
        Ok(Mat4::from_cols_array(&values).transpose())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_length_prefix_uses_seven_bit_encoding() {
        let mut w = SaveWriter::new(Vec::new());
        let long = "x".repeat(200);
        w.write_string(&long).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes[0], 0xC8);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(bytes.len(), 202);

        let mut r = SaveReader::new(bytes.as_slice());
        assert_eq!(r.read_string().unwrap(), long);
    }

    #[test]
    fn header_rejects_newer_versions() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&(SCHEMA_VERSION + 1).to_le_bytes());
        let mut r = SaveReader::new(bytes.as_slice());
        assert!(r.read_header().is_err());
    }

    #[test]
    fn header_rejects_foreign_files() {
        let bytes = b"MEGA\x01\x00\x00\x00".to_vec();
        let mut r = SaveReader::new(bytes.as_slice());
        assert!(r.read_header().is_err());
    }

    #[test]
    fn bools_are_single_bytes() {
        let mut w = SaveWriter::new(Vec::new());
        w.write_bool(true).unwrap();
        w.write_i32(-1).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes, vec![1, 0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
