//! Binary stream reader over an immutable, shared byte region.
//!
//! [`KaitaiStream`] is the single I/O primitive of the interpreter: typed
//! integer and float reads in both byte orders, sized/terminated/exhausting
//! byte reads, string decoding, bit-level reads in both bit orders, and
//! substreams that share the underlying storage while keeping independent
//! positions.
//!
//! # Core Types
//!
//! - [`KaitaiStream`]: the reader itself.
//! - [`SharedStream`]: `Rc<RefCell<KaitaiStream>>`, the form streams take
//!   when bound to parsed nodes as `_io`.
//! - [`BitOrder`]: bit-level endianness for `bN` reads.
//!
//! # Contracts
//!
//! - Any read that would exceed the logical length fails with
//!   `EndOfStream` carrying the position at which the short read began.
//! - Bit reads keep leftover bits in an accumulator across adjacent calls;
//!   every byte-level read (and [`KaitaiStream::align_to_byte`]) discards
//!   partial bits first. Switching bit order mid-run resets the
//!   accumulator.
//! - The stream never mutates its bytes; substreams share storage.

use crate::errors::{ContextWindow, Error, Result};
use std::cell::RefCell;
use std::rc::Rc;

/// Bit-level endianness of `bN` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitOrder {
    /// Most significant bit of each byte is consumed first.
    #[default]
    Be,
    /// Least significant bit of each byte is consumed first.
    Le,
}

/// A stream bound to a node tree, sharable as `_io`.
pub type SharedStream = Rc<RefCell<KaitaiStream>>;

pub struct KaitaiStream {
    data: Rc<[u8]>,
    /// Region bounds into `data`; substreams narrow these.
    start: usize,
    end: usize,
    /// Byte position relative to `start`. May sit past `end` after a seek;
    /// reads fail there.
    pos: usize,
    /// Bit accumulator; holds at most 7 leftover bits between bit reads.
    bits: u128,
    bits_left: u32,
    bit_order: Option<BitOrder>,
}

impl std::fmt::Debug for KaitaiStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KaitaiStream")
            .field("size", &self.size())
            .field("pos", &self.pos)
            .field("bits_left", &self.bits_left)
            .finish()
    }
}

impl KaitaiStream {
    pub fn new(data: Vec<u8>) -> Self {
        let data: Rc<[u8]> = data.into();
        let end = data.len();
        KaitaiStream {
            data,
            start: 0,
            end,
            pos: 0,
            bits: 0,
            bits_left: 0,
            bit_order: None,
        }
    }

    pub fn shared(data: Vec<u8>) -> SharedStream {
        Rc::new(RefCell::new(KaitaiStream::new(data)))
    }

    pub fn size(&self) -> u64 {
        (self.end - self.start) as u64
    }

    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.end - self.start && self.bits_left == 0
    }

    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.pos as u64)
    }

    /// Bits still pending in the accumulator.
    pub(crate) fn bits_pending(&self) -> u32 {
        self.bits_left
    }

    /// Moves the position. Seeking drops any pending bit accumulator.
    /// Positions past the end are permitted; reads there fail.
    pub fn seek(&mut self, p: u64) -> Result<()> {
        self.align_to_byte();
        self.pos = usize::try_from(p)
            .map_err(|_| Error::parse(format!("seek target {p} out of addressable range")))?;
        Ok(())
    }

    /// Drops any partially consumed byte from the bit accumulator.
    pub fn align_to_byte(&mut self) {
        self.bits = 0;
        self.bits_left = 0;
        self.bit_order = None;
    }

    /// A view over `[offset, offset + len)` of this stream's region, with
    /// position 0 and a fresh bit accumulator. Storage is shared.
    pub fn substream(&self, offset: u64, len: u64) -> Result<KaitaiStream> {
        let offset = offset as usize;
        let len = len as usize;
        if offset + len > self.end - self.start {
            return Err(self.eos_at((offset + len) as u64));
        }
        Ok(KaitaiStream {
            data: Rc::clone(&self.data),
            start: self.start + offset,
            end: self.start + offset + len,
            pos: 0,
            bits: 0,
            bits_left: 0,
            bit_order: None,
        })
    }

    fn region(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn eos_at(&self, pos: u64) -> Error {
        Error::eos(pos).with_context(self.context_window(pos))
    }

    /// Captures up to 32 bytes of this stream's region around `pos`.
    pub(crate) fn context_window(&self, pos: u64) -> ContextWindow {
        let region = self.region();
        let window_start = (pos as usize).saturating_sub(16).min(region.len());
        let window_end = (window_start + 32).min(region.len());
        ContextWindow {
            window_start: window_start as u64,
            bytes: region[window_start..window_end].to_vec(),
            fault: pos,
        }
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.pos + n > self.end - self.start {
            Err(self.eos_at(self.pos as u64))
        } else {
            Ok(())
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.align_to_byte();
        self.ensure(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.region()[self.pos..self.pos + N]);
        self.pos += N;
        Ok(buf)
    }

    // ---- unsigned integers ----

    pub fn read_u1(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_u2le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn read_u2be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    pub fn read_u4le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn read_u4be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn read_u8le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    pub fn read_u8be(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take()?))
    }

    // ---- signed integers (two's complement sign extension) ----

    pub fn read_s1(&mut self) -> Result<i8> {
        Ok(self.read_u1()? as i8)
    }

    pub fn read_s2le(&mut self) -> Result<i16> {
        Ok(self.read_u2le()? as i16)
    }

    pub fn read_s2be(&mut self) -> Result<i16> {
        Ok(self.read_u2be()? as i16)
    }

    pub fn read_s4le(&mut self) -> Result<i32> {
        Ok(self.read_u4le()? as i32)
    }

    pub fn read_s4be(&mut self) -> Result<i32> {
        Ok(self.read_u4be()? as i32)
    }

    pub fn read_s8le(&mut self) -> Result<i64> {
        Ok(self.read_u8le()? as i64)
    }

    pub fn read_s8be(&mut self) -> Result<i64> {
        Ok(self.read_u8be()? as i64)
    }

    // ---- IEEE-754 floats ----

    pub fn read_f4le(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    pub fn read_f4be(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.take()?))
    }

    pub fn read_f8le(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    pub fn read_f8be(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take()?))
    }

    // ---- byte reads ----

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.align_to_byte();
        self.ensure(n)?;
        let out = self.region()[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// Reads everything up to the end of the region.
    pub fn read_bytes_full(&mut self) -> Result<Vec<u8>> {
        let n = self.remaining() as usize;
        self.read_bytes(n)
    }

    /// Reads up to (and depending on flags, including) `term`.
    ///
    /// `include` keeps the terminator in the returned bytes; `consume`
    /// advances past it. With `consume` false the position stays on the
    /// terminator, so a subsequent one-byte read returns it, including
    /// when the terminator is the last byte of the region. If the
    /// terminator never appears, `eos_error` selects between failing and
    /// returning the remaining bytes.
    pub fn read_bytes_term(
        &mut self,
        term: u8,
        include: bool,
        consume: bool,
        eos_error: bool,
    ) -> Result<Vec<u8>> {
        self.align_to_byte();
        let begin = self.pos;
        if begin > self.end - self.start {
            return Err(self.eos_at(begin as u64));
        }
        let remaining = &self.region()[begin..];
        match remaining.iter().position(|b| *b == term) {
            Some(i) => {
                let value = remaining[..i + include as usize].to_vec();
                self.pos = begin + i + consume as usize;
                Ok(value)
            }
            None if eos_error => Err(self.eos_at(begin as u64)),
            None => {
                let value = remaining.to_vec();
                self.pos = self.end - self.start;
                Ok(value)
            }
        }
    }

    // ---- strings ----

    pub fn read_str(&mut self, n: usize, encoding: &str) -> Result<String> {
        let at = self.pos();
        let bytes = self.read_bytes(n)?;
        decode_bytes(&bytes, encoding).map_err(|e| e.or_pos(at))
    }

    pub fn read_strz(
        &mut self,
        encoding: &str,
        term: u8,
        include: bool,
        consume: bool,
        eos_error: bool,
    ) -> Result<String> {
        let at = self.pos();
        let bytes = self.read_bytes_term(term, include, consume, eos_error)?;
        decode_bytes(&bytes, encoding).map_err(|e| e.or_pos(at))
    }

    // ---- bit-level reads ----

    pub fn read_bits_int_be(&mut self, n: u32) -> Result<u64> {
        self.read_bits_int(n, BitOrder::Be)
    }

    pub fn read_bits_int_le(&mut self, n: u32) -> Result<u64> {
        self.read_bits_int(n, BitOrder::Le)
    }

    pub fn read_bits_int(&mut self, n: u32, order: BitOrder) -> Result<u64> {
        if !(1..=64).contains(&n) {
            return Err(Error::parse(format!(
                "bit read width must be 1..=64, got {n}"
            )));
        }
        // A run keeps one order; switching drops the pending bits.
        if self.bit_order != Some(order) {
            self.align_to_byte();
            self.bit_order = Some(order);
        }
        while self.bits_left < n {
            if self.pos >= self.end - self.start {
                return Err(self.eos_at(self.pos as u64));
            }
            let byte = self.region()[self.pos] as u128;
            self.pos += 1;
            match order {
                BitOrder::Be => self.bits = (self.bits << 8) | byte,
                BitOrder::Le => self.bits |= byte << self.bits_left,
            }
            self.bits_left += 8;
        }
        let mask = (1u128 << n) - 1;
        let value = match order {
            BitOrder::Be => {
                let shift = self.bits_left - n;
                let v = (self.bits >> shift) & mask;
                self.bits_left = shift;
                self.bits &= (1u128 << self.bits_left) - 1;
                v
            }
            BitOrder::Le => {
                let v = self.bits & mask;
                self.bits >>= n;
                self.bits_left -= n;
                v
            }
        };
        if self.bits_left == 0 {
            self.bit_order = None;
        }
        Ok(value as u64)
    }
}

/// Decodes `bytes` in the named encoding.
///
/// `ASCII` and `UTF-8` are validated strictly; every other label goes
/// through `encoding_rs`, failing on malformed sequences.
pub fn decode_bytes(bytes: &[u8], encoding: &str) -> Result<String> {
    let label = encoding.trim();
    if label.eq_ignore_ascii_case("ascii") || label.eq_ignore_ascii_case("us-ascii") {
        if let Some(i) = bytes.iter().position(|b| *b >= 0x80) {
            return Err(Error::parse_at(
                format!("byte 0x{:02x} is not valid ASCII", bytes[i]),
                i as u64,
            ));
        }
        return Ok(bytes.iter().map(|b| *b as char).collect());
    }
    if label.eq_ignore_ascii_case("utf-8") || label.eq_ignore_ascii_case("utf8") {
        return std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| Error::parse(format!("malformed UTF-8: {e}")));
    }
    let enc = encoding_rs::Encoding::for_label(label.as_bytes())
        .ok_or_else(|| Error::parse(format!("unknown encoding {label:?}")))?;
    let (decoded, had_errors) = enc.decode_without_bom_handling(bytes);
    if had_errors {
        return Err(Error::parse(format!("malformed {label} byte sequence")));
    }
    Ok(decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    mod integer_reads {
        use super::*;

        #[test]
        fn s1_sign_extends_every_byte() {
            for b in 0..=255u8 {
                let mut s = KaitaiStream::new(vec![b]);
                let expected = if b >= 128 { b as i64 - 256 } else { b as i64 };
                assert_eq!(s.read_s1().unwrap() as i64, expected, "byte {b:#x}");
            }
        }

        #[test]
        fn u4_both_endians() {
            let mut s = KaitaiStream::new(vec![0x01, 0x02, 0x03, 0x04, 0x01, 0x02, 0x03, 0x04]);
            assert_eq!(s.read_u4le().unwrap(), 0x04030201);
            assert_eq!(s.read_u4be().unwrap(), 0x01020304);
            assert!(s.is_eof());
        }

        #[test]
        fn u8_values_above_i64_range() {
            let mut s = KaitaiStream::new(vec![0xff; 8]);
            assert_eq!(s.read_u8be().unwrap(), u64::MAX);
        }

        #[test]
        fn fixed_width_reads_consume_exact_widths() {
            let mut s = KaitaiStream::new((0..15).collect());
            s.read_u1().unwrap();
            assert_eq!(s.pos(), 1);
            s.read_u2le().unwrap();
            assert_eq!(s.pos(), 3);
            s.read_u4be().unwrap();
            assert_eq!(s.pos(), 7);
            s.read_u8le().unwrap();
            assert_eq!(s.pos(), 15);
        }

        #[test]
        fn short_read_reports_start_position() {
            let mut s = KaitaiStream::new(vec![0x01, 0x02]);
            s.read_u1().unwrap();
            let err = s.read_u4le().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::EndOfStream);
            assert_eq!(err.pos(), Some(1));
        }
    }

    mod float_reads {
        use super::*;

        #[test]
        fn f4_round_values() {
            let mut s = KaitaiStream::new(1.5f32.to_le_bytes().to_vec());
            assert_eq!(s.read_f4le().unwrap(), 1.5);
        }

        #[test]
        fn f8_big_endian() {
            let mut s = KaitaiStream::new((-2.25f64).to_be_bytes().to_vec());
            assert_eq!(s.read_f8be().unwrap(), -2.25);
        }
    }

    mod byte_reads {
        use super::*;

        #[test]
        fn term_consume_and_include_flags() {
            let data = vec![b'a', b'b', 0, b'c'];

            let mut s = KaitaiStream::new(data.clone());
            assert_eq!(s.read_bytes_term(0, false, true, true).unwrap(), b"ab");
            assert_eq!(s.pos(), 3);

            let mut s = KaitaiStream::new(data.clone());
            assert_eq!(s.read_bytes_term(0, true, true, true).unwrap(), b"ab\0");
            assert_eq!(s.pos(), 3);

            let mut s = KaitaiStream::new(data);
            assert_eq!(s.read_bytes_term(0, false, false, true).unwrap(), b"ab");
            assert_eq!(s.pos(), 2, "terminator left unconsumed");
            assert_eq!(s.read_u1().unwrap(), 0);
        }

        #[test]
        fn term_missing_respects_eos_error() {
            let mut s = KaitaiStream::new(vec![1, 2, 3]);
            let err = s.read_bytes_term(0, false, true, true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::EndOfStream);
            assert_eq!(err.pos(), Some(0));

            let mut s = KaitaiStream::new(vec![1, 2, 3]);
            assert_eq!(s.read_bytes_term(0, false, true, false).unwrap(), [1, 2, 3]);
            assert!(s.is_eof());
        }

        #[test]
        fn full_reads_to_end() {
            let mut s = KaitaiStream::new(vec![9, 8, 7]);
            s.read_u1().unwrap();
            assert_eq!(s.read_bytes_full().unwrap(), [8, 7]);
            assert_eq!(s.read_bytes_full().unwrap(), Vec::<u8>::new());
        }
    }

    mod substreams {
        use super::*;

        #[test]
        fn substream_views_share_bytes() {
            let parent = KaitaiStream::new(vec![0, 1, 2, 3, 4, 5]);
            let mut sub = parent.substream(2, 3).unwrap();
            assert_eq!(sub.size(), 3);
            assert_eq!(sub.pos(), 0);
            assert_eq!(sub.read_bytes(3).unwrap(), [2, 3, 4]);
        }

        #[test]
        fn substream_positions_are_independent() {
            let mut parent = KaitaiStream::new(vec![0, 1, 2, 3]);
            let mut sub = parent.substream(1, 2).unwrap();
            sub.read_u1().unwrap();
            assert_eq!(parent.pos(), 0);
            parent.read_u1().unwrap();
            assert_eq!(sub.pos(), 1);
        }

        #[test]
        fn out_of_range_substream_fails() {
            let parent = KaitaiStream::new(vec![0, 1]);
            assert!(parent.substream(1, 4).is_err());
        }
    }

    mod bit_reads {
        use super::*;

        #[test]
        fn be_split_equals_joined() {
            // Property: reading a then b bits BE equals reading a+b and splitting.
            let data = vec![0b1011_0110, 0b0101_1100];
            for a in 1..=8u32 {
                let b = 10 - a;
                let mut joined = KaitaiStream::new(data.clone());
                let whole = joined.read_bits_int_be(a + b).unwrap();

                let mut split = KaitaiStream::new(data.clone());
                let hi = split.read_bits_int_be(a).unwrap();
                let lo = split.read_bits_int_be(b).unwrap();
                assert_eq!((hi << b) | lo, whole, "a={a} b={b}");
            }
        }

        #[test]
        fn le_split_equals_joined() {
            let data = vec![0b1011_0110, 0b0101_1100];
            for a in 1..=8u32 {
                let b = 10 - a;
                let mut joined = KaitaiStream::new(data.clone());
                let whole = joined.read_bits_int_le(a + b).unwrap();

                let mut split = KaitaiStream::new(data.clone());
                let lo = split.read_bits_int_le(a).unwrap();
                let hi = split.read_bits_int_le(b).unwrap();
                assert_eq!(lo | (hi << a), whole, "a={a} b={b}");
            }
        }

        #[test]
        fn byte_read_discards_partial_bits() {
            let mut s = KaitaiStream::new(vec![0xff, 0x42]);
            assert_eq!(s.read_bits_int_be(3).unwrap(), 0b111);
            // u1 aligns first, so it reads the next whole byte.
            assert_eq!(s.read_u1().unwrap(), 0x42);
        }

        #[test]
        fn order_switch_resets_accumulator() {
            let mut s = KaitaiStream::new(vec![0b1100_0001, 0b1000_0000]);
            assert_eq!(s.read_bits_int_be(2).unwrap(), 0b11);
            // Switching to LE drops the 6 pending bits and starts at byte 1.
            assert_eq!(s.read_bits_int_le(1).unwrap(), 0);
        }

        #[test]
        fn full_64_bit_read() {
            let mut s = KaitaiStream::new(vec![0xff; 8]);
            assert_eq!(s.read_bits_int_be(64).unwrap(), u64::MAX);
        }

        #[test]
        fn eof_inside_bit_run() {
            let mut s = KaitaiStream::new(vec![0xaa]);
            s.read_bits_int_be(8).unwrap();
            let err = s.read_bits_int_be(1).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::EndOfStream);
        }

        #[test]
        fn width_out_of_range_rejected() {
            let mut s = KaitaiStream::new(vec![0; 16]);
            assert!(s.read_bits_int_be(0).is_err());
            assert!(s.read_bits_int_be(65).is_err());
        }
    }

    mod positioning {
        use super::*;

        #[test]
        fn seek_and_eof() {
            let mut s = KaitaiStream::new(vec![1, 2, 3]);
            s.seek(3).unwrap();
            assert!(s.is_eof());
            s.seek(1).unwrap();
            assert!(!s.is_eof());
            assert_eq!(s.read_u1().unwrap(), 2);
        }

        #[test]
        fn pending_bits_defer_eof() {
            let mut s = KaitaiStream::new(vec![0b1010_0000]);
            s.read_bits_int_be(3).unwrap();
            assert!(!s.is_eof(), "5 bits still pending");
            s.read_bits_int_be(5).unwrap();
            assert!(s.is_eof());
        }
    }

    mod string_reads {
        use super::*;

        #[test]
        fn ascii_and_utf8() {
            let mut s = KaitaiStream::new(b"GIF89a".to_vec());
            assert_eq!(s.read_str(3, "ASCII").unwrap(), "GIF");
            assert_eq!(s.read_str(3, "UTF-8").unwrap(), "89a");
        }

        #[test]
        fn non_ascii_byte_rejected_as_ascii() {
            let mut s = KaitaiStream::new(vec![0xc3, 0xa9]);
            assert!(s.read_str(2, "ASCII").is_err());
        }

        #[test]
        fn utf16le_via_encoding_rs() {
            let mut s = KaitaiStream::new(vec![b'h', 0, b'i', 0]);
            assert_eq!(s.read_str(4, "UTF-16LE").unwrap(), "hi");
        }

        #[test]
        fn strz_reads_to_terminator() {
            let mut s = KaitaiStream::new(b"abc\0def".to_vec());
            assert_eq!(s.read_strz("UTF-8", 0, false, true, true).unwrap(), "abc");
            assert_eq!(s.pos(), 4);
        }

        #[test]
        fn unknown_encoding_is_parse_error() {
            let mut s = KaitaiStream::new(vec![0x41]);
            let err = s.read_str(1, "EBCDIC-NOPE").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse);
        }
    }
}
