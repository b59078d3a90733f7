//! Length-prefixed envelope framing and the primitive bit/byte serializer
//! used for every on-wire header and payload.
//!
//! Byte-aligned integers are little-endian; unaligned integers are packed
//! bitwise, LSB-first, into a rolling 64-bit accumulator that `align()`
//! flushes. Strings, byte buffers and arrays are 4-byte-length-prefixed
//! then raw. Unions are not supported and fail with [`CodecError::UnsupportedFeature`].

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("attempted to read past the end of the buffer")]
    EndOfBuffer,
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    ProtocolError { expected: u16, got: u16 },
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Accumulates bytes for one message payload, supporting both byte-aligned
/// and bit-packed unaligned writes.
#[derive(Debug, Default)]
pub struct Serializer {
    buf: Vec<u8>,
    acc: u64,
    acc_bits: u32,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flushes any pending unaligned bits, zero-padding the current byte.
    pub fn align(&mut self) {
        if self.acc_bits > 0 {
            let nbytes = (self.acc_bits as usize + 7) / 8;
            let bytes = self.acc.to_le_bytes();
            self.buf.extend_from_slice(&bytes[..nbytes]);
            self.acc = 0;
            self.acc_bits = 0;
        }
    }

    /// Packs `value`'s lowest `nbits` bits, LSB-first, into the rolling
    /// accumulator. Does not require alignment before or after.
    pub fn write_bits(&mut self, value: u64, nbits: u32) {
        debug_assert!(nbits <= 64);
        let masked = if nbits == 64 {
            value
        } else {
            value & ((1u64 << nbits) - 1)
        };
        self.acc |= masked << self.acc_bits;
        self.acc_bits += nbits;
        while self.acc_bits >= 8 {
            self.buf.push((self.acc & 0xff) as u8);
            self.acc >>= 8;
            self.acc_bits -= 8;
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.align();
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.align();
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.align();
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.align();
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_u8(v as u8);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_u16(v as u16);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.align();
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.align();
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }

    /// 32-bit LE length prefix then the raw bytes, aligned.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.align();
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Writes a length prefix then invokes `write_elem` once per element,
    /// aligning between elements.
    pub fn write_array<T>(&mut self, items: &[T], mut write_elem: impl FnMut(&mut Self, &T)) {
        self.write_u32(items.len() as u32);
        for item in items {
            self.align();
            write_elem(self, item);
        }
    }

    pub fn write_optional<T>(&mut self, value: &Option<T>, write_some: impl FnOnce(&mut Self, &T)) {
        match value {
            Some(v) => {
                self.write_bool(true);
                write_some(self, v);
            }
            None => self.write_bool(false),
        }
    }

    /// Unions are not part of the wire format; encoding one is an error.
    pub fn begin_union(&mut self) -> Result<()> {
        Err(CodecError::UnsupportedFeature("union"))
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.align();
        self.buf
    }
}

/// Mirrors [`Serializer`]'s layout for reading.
#[derive(Debug)]
pub struct Deserializer<'a> {
    buf: &'a [u8],
    pos: usize,
    acc: u64,
    acc_bits: u32,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            acc: 0,
            acc_bits: 0,
        }
    }

    pub fn align(&mut self) {
        self.acc = 0;
        self.acc_bits = 0;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::EndOfBuffer);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_bits(&mut self, nbits: u32) -> Result<u64> {
        while self.acc_bits < nbits {
            let byte = self.take(1)?[0] as u64;
            self.acc |= byte << self.acc_bits;
            self.acc_bits += 8;
        }
        let mask = if nbits == 64 {
            u64::MAX
        } else {
            (1u64 << nbits) - 1
        };
        let value = self.acc & mask;
        self.acc >>= nbits;
        self.acc_bits -= nbits;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.align();
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.align();
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align();
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.align();
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.align();
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.align();
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.align();
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::EndOfBuffer)
    }

    pub fn read_array<T>(&mut self, mut read_elem: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let len = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            self.align();
            out.push(read_elem(self)?);
        }
        Ok(out)
    }

    pub fn read_optional<T>(&mut self, read_some: impl FnOnce(&mut Self) -> Result<T>) -> Result<Option<T>> {
        if self.read_bool()? {
            Ok(Some(read_some(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn begin_union(&mut self) -> Result<()> {
        Err(CodecError::UnsupportedFeature("union"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Protocol major version every announcement and peer-message carries.
pub const PROTOCOL_VERSION: u16 = 1;

pub fn check_version(got: u16) -> Result<()> {
    if got != PROTOCOL_VERSION {
        return Err(CodecError::ProtocolError {
            expected: PROTOCOL_VERSION,
            got,
        });
    }
    Ok(())
}

/// Frames `body` as `uint32 length_le || body`.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Attempts to pull exactly one frame's body off the front of `buf`.
/// Returns `None` if `buf` does not yet contain a complete frame; does not
/// consume partial data.
pub fn try_unframe(buf: &[u8]) -> Result<Option<(&[u8], usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((&buf[4..4 + len], 4 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_aligned_primitives() {
        let mut s = Serializer::new();
        s.write_u8(0xab);
        s.write_u32(0xdead_beef);
        s.write_i64(-12345);
        s.write_f64(3.5);
        s.write_string("hello");
        s.write_bool(true);
        let bytes = s.into_bytes();

        let mut d = Deserializer::new(&bytes);
        assert_eq!(d.read_u8().unwrap(), 0xab);
        assert_eq!(d.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(d.read_i64().unwrap(), -12345);
        assert_eq!(d.read_f64().unwrap(), 3.5);
        assert_eq!(d.read_string().unwrap(), "hello");
        assert_eq!(d.read_bool().unwrap(), true);
        assert_eq!(d.remaining(), 0);
    }

    #[test]
    fn roundtrip_unaligned_mixed_widths() {
        let mut s = Serializer::new();
        s.write_bits(0b101, 3);
        s.write_bits(0xabc, 12);
        s.write_bits(1, 1);
        s.align();
        let bytes = s.into_bytes();

        let mut d = Deserializer::new(&bytes);
        assert_eq!(d.read_bits(3).unwrap(), 0b101);
        assert_eq!(d.read_bits(12).unwrap(), 0xabc);
        assert_eq!(d.read_bits(1).unwrap(), 1);
    }

    #[test]
    fn array_and_optional() {
        let mut s = Serializer::new();
        s.write_array(&[1u32, 2, 3], |s, v| s.write_u32(*v));
        s.write_optional(&Some(42u8), |s, v| s.write_u8(*v));
        s.write_optional(&None::<u8>, |s, v| s.write_u8(*v));
        let bytes = s.into_bytes();

        let mut d = Deserializer::new(&bytes);
        let arr = d.read_array(|d| d.read_u32()).unwrap();
        assert_eq!(arr, vec![1, 2, 3]);
        assert_eq!(d.read_optional(|d| d.read_u8()).unwrap(), Some(42));
        assert_eq!(d.read_optional(|d| d.read_u8()).unwrap(), None);
    }

    #[test]
    fn end_of_buffer_on_short_read() {
        let mut d = Deserializer::new(&[0x01]);
        assert_eq!(d.read_u32(), Err(CodecError::EndOfBuffer));
    }

    #[test]
    fn protocol_version_mismatch() {
        assert_eq!(
            check_version(99),
            Err(CodecError::ProtocolError {
                expected: PROTOCOL_VERSION,
                got: 99
            })
        );
    }

    #[test]
    fn frame_roundtrip_and_partial() {
        let framed = frame(b"hello");
        let (body, consumed) = try_unframe(&framed).unwrap().unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(consumed, framed.len());

        assert_eq!(try_unframe(&framed[..3]).unwrap(), None);
    }

    #[test]
    fn envelope_stream_yields_same_sequence() {
        let mut stream = Vec::new();
        let kinds: Vec<&[u8]> = vec![b"one", b"two", b"three"];
        for k in &kinds {
            stream.extend_from_slice(&frame(k));
        }
        let mut out = vec![];
        let mut rest: &[u8] = &stream;
        while let Some((body, consumed)) = try_unframe(rest).unwrap() {
            out.push(body.to_vec());
            rest = &rest[consumed..];
        }
        assert_eq!(out, kinds.iter().map(|k| k.to_vec()).collect::<Vec<_>>());
    }
}
