//! The canonical length-prefixed serialiser shared by the whole parent
//! daemon protocol family: a little-endian `u64` integer primitive, and
//! byte strings padded to 8-byte boundaries, composed into settings maps
//! and path/string lists.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("string field is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(self.inner.read_u64::<LittleEndian>()?)
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_u64()? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        let padded = pad_len(len);
        if padded > len {
            let mut padding = [0u8; 8];
            self.inner.read_exact(&mut padding[..padded - len])?;
        }
        Ok(String::from_utf8(buf)?)
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>, Error> {
        let count = self.read_u64()?;
        (0..count).map(|_| self.read_string()).collect()
    }

    /// Reads the `(1, name, value)*` triples terminated by a `0` tag.
    pub fn read_settings(&mut self) -> Result<Vec<(String, String)>, Error> {
        let mut out = Vec::new();
        loop {
            let tag = self.read_u64()?;
            if tag == 0 {
                break;
            }
            let name = self.read_string()?;
            let value = self.read_string()?;
            out.push((name, value));
        }
        Ok(out)
    }

    /// Reads the `inputs` and `wantedOutputs` lists sent only after the
    /// hook has written its accept token.
    pub fn read_accepted_tail(&mut self) -> Result<(Vec<String>, Vec<String>), Error> {
        let inputs = self.read_string_list()?;
        let wanted_outputs = self.read_string_list()?;
        Ok((inputs, wanted_outputs))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub struct Writer<W> {
    inner: W,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), Error> {
        self.inner.write_u64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), Error> {
        let bytes = value.as_bytes();
        self.write_u64(bytes.len() as u64)?;
        self.inner.write_all(bytes)?;
        let padded = pad_len(bytes.len());
        if padded > bytes.len() {
            let padding = [0u8; 8];
            self.inner.write_all(&padding[..padded - bytes.len()])?;
        }
        Ok(())
    }

    pub fn write_string_list(&mut self, values: &[String]) -> Result<(), Error> {
        self.write_u64(values.len() as u64)?;
        for v in values {
            self.write_string(v)?;
        }
        Ok(())
    }

    pub fn write_settings(&mut self, settings: &[(String, String)]) -> Result<(), Error> {
        for (name, value) in settings {
            self.write_u64(1)?;
            self.write_string(name)?;
            self.write_string(value)?;
        }
        self.write_u64(0)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        Ok(self.inner.flush()?)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn pad_len(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips_with_padding() {
        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            w.write_string("hi").unwrap();
        }
        // 8 bytes length + 8 bytes padded payload ("hi" -> 8 bytes)
        assert_eq!(buf.len(), 16);
        let mut r = Reader::new(&buf[..]);
        assert_eq!(r.read_string().unwrap(), "hi");
    }

    #[test]
    fn settings_round_trip_and_terminate() {
        let mut buf = Vec::new();
        let settings = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        {
            let mut w = Writer::new(&mut buf);
            w.write_settings(&settings).unwrap();
        }
        let mut r = Reader::new(&buf[..]);
        assert_eq!(r.read_settings().unwrap(), settings);
    }

    #[test]
    fn string_list_round_trips() {
        let mut buf = Vec::new();
        let list = vec!["a".to_string(), "bbbbbbbbb".to_string()];
        {
            let mut w = Writer::new(&mut buf);
            w.write_string_list(&list).unwrap();
        }
        let mut r = Reader::new(&buf[..]);
        assert_eq!(r.read_string_list().unwrap(), list);
    }

    #[test]
    fn empty_string_has_no_payload_bytes() {
        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            w.write_string("").unwrap();
        }
        assert_eq!(buf.len(), 8);
    }
}
