//! Primitive encode/decode helpers shared by the message codec.

use crate::{Error, Result};

pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn bool(&mut self, v: bool) {
        self.u32(if v { 1 } else { 0 });
    }

    pub(crate) fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub(crate) fn opt_string(&mut self, s: &Option<String>) {
        self.string(s.as_deref().unwrap_or(""));
    }

    pub(crate) fn strings(&mut self, items: &[String]) {
        self.u32(items.len() as u32);
        for item in items {
            self.string(item);
        }
    }

    pub(crate) fn map(&mut self, items: &std::collections::HashMap<String, String>) {
        self.u32(items.len() as u32);
        for (k, v) in items {
            self.string(k);
            self.string(v);
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Truncated {
                need: self.pos + n,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        Ok(self.u32()? != 0)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
    }

    pub(crate) fn opt_string(&mut self) -> Result<Option<String>> {
        let s = self.string()?;
        Ok(if s.is_empty() { None } else { Some(s) })
    }

    pub(crate) fn strings(&mut self) -> Result<Vec<String>> {
        let count = self.u32()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.string()?);
        }
        Ok(out)
    }

    pub(crate) fn map(&mut self) -> Result<std::collections::HashMap<String, String>> {
        let count = self.u32()? as usize;
        let mut out = std::collections::HashMap::with_capacity(count);
        for _ in 0..count {
            let k = self.string()?;
            let v = self.string()?;
            out.insert(k, v);
        }
        Ok(out)
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::Malformed("trailing bytes in message body"));
        }
        Ok(())
    }
}
