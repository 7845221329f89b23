//! [`Encode`]/[`Decode`] implementations for the wire scalars and strings.

use std::io::Write;

use anyhow::ensure;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Decode, Encode};

impl Encode for u8 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u8(*self)?)
    }
}

impl Decode for u8 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_u8()?)
    }
}

impl Encode for u16 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u16::<LittleEndian>(*self)?)
    }
}

impl Decode for u16 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_u16::<LittleEndian>()?)
    }
}

impl Encode for u32 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u32::<LittleEndian>(*self)?)
    }
}

impl Decode for u32 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_u32::<LittleEndian>()?)
    }
}

impl Encode for i32 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_i32::<LittleEndian>(*self)?)
    }
}

impl Decode for i32 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_i32::<LittleEndian>()?)
    }
}

impl Encode for bool {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u8(u8::from(*self))?)
    }
}

impl Decode for bool {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_u8()? != 0)
    }
}

impl Encode for str {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        ensure!(
            !self.as_bytes().contains(&0),
            "string contains an interior NUL byte"
        );
        w.write_all(self.as_bytes())?;
        Ok(w.write_u8(0)?)
    }
}

impl Encode for String {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.as_str().encode(w)
    }
}

/// Strings on both wires are NUL-terminated. A missing terminator at the end
/// of input is tolerated; the remaining bytes form the string.
impl Decode for String {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let end = r.iter().position(|&b| b == 0);
        let (raw, rest) = match end {
            Some(i) => (&r[..i], &r[i + 1..]),
            None => (*r, &[][..]),
        };
        let s = std::str::from_utf8(raw)?.to_owned();
        *r = rest;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_little_endian() {
        let mut buf = vec![];
        0x1234_u16.encode(&mut buf).unwrap();
        0x0102_0304_u32.encode(&mut buf).unwrap();
        (-2_i32).encode(&mut buf).unwrap();
        assert_eq!(
            buf,
            [0x34, 0x12, 0x04, 0x03, 0x02, 0x01, 0xFE, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn string_round_trip() {
        let mut buf = vec![];
        "caldavar".encode(&mut buf).unwrap();
        assert_eq!(buf.last(), Some(&0));

        let mut r = buf.as_slice();
        assert_eq!(String::decode(&mut r).unwrap(), "caldavar");
        assert!(r.is_empty());
    }

    #[test]
    fn string_without_terminator_consumes_rest() {
        let mut r: &[u8] = b"tail";
        assert_eq!(String::decode(&mut r).unwrap(), "tail");
        assert!(r.is_empty());
    }

    #[test]
    fn interior_nul_is_rejected() {
        let mut buf = vec![];
        assert!("a\0b".encode(&mut buf).is_err());
    }

    #[test]
    fn scalar_round_trip() {
        let mut rng = rand::thread_rng();
        let mut buf = vec![];

        for _ in 0..10_000 {
            let a: u16 = rand::Rng::gen(&mut rng);
            let b: u32 = rand::Rng::gen(&mut rng);
            let c: i32 = rand::Rng::gen(&mut rng);

            buf.clear();
            a.encode(&mut buf).unwrap();
            b.encode(&mut buf).unwrap();
            c.encode(&mut buf).unwrap();

            let mut r = buf.as_slice();
            assert_eq!(a, u16::decode(&mut r).unwrap());
            assert_eq!(b, u32::decode(&mut r).unwrap());
            assert_eq!(c, i32::decode(&mut r).unwrap());
            assert!(r.is_empty());
        }
    }
}
