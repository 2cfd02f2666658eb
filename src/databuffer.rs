//! The parameter-packing container (§3, §4.1).
//!
//! A [`DataBuffer`] owns two independent byte regions, input and output,
//! each prefixed by a fixed [`HEADER_SIZE`](crate::wire::HEADER_SIZE)
//! reservation for the wire header. Parameters are packed as a
//! forward-linked chain of records; `next` is a byte offset relative to the
//! start of the record it's read from, so the whole chain can be memcpy'd
//! as one blob (which is exactly what [`Region::set_data`] does on receipt
//! from a transport).

use crate::error::WireError;
use crate::wire::{align4, Header, ParamRecordHeader, HEADER_SIZE, PARAM_RECORD_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// One direction (input or output) of a [`DataBuffer`].
#[derive(Debug, Clone)]
pub struct Region {
    buf: Vec<u8>,
    data_size: usize,
    clean: bool,
    last_offset: Option<usize>,
}

struct Found {
    offset: usize,
    size: usize,
    is_last: bool,
}

impl Region {
    fn new(capacity: usize, clean: bool) -> Self {
        Region {
            buf: vec![0u8; capacity],
            data_size: 0,
            clean,
            last_offset: None,
        }
    }

    fn capacity_for_body(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    /// Total body capacity (buffer size minus the header reservation).
    pub fn capacity(&self) -> usize {
        self.capacity_for_body()
    }

    fn body(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..HEADER_SIZE + self.data_size]
    }

    /// The full packet currently held: header reservation plus used body.
    pub fn packet(&self) -> &[u8] {
        &self.buf[0..HEADER_SIZE + self.data_size]
    }

    pub fn packet_mut(&mut self) -> &mut [u8] {
        let end = HEADER_SIZE + self.data_size;
        &mut self.buf[0..end]
    }

    pub fn header_slice_mut(&mut self) -> &mut [u8] {
        &mut self.buf[0..HEADER_SIZE]
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn write_header(&mut self, header: &Header) {
        header.encode(self.header_slice_mut());
    }

    pub fn read_header(&self) -> Result<Header, WireError> {
        Header::decode(&self.buf[0..HEADER_SIZE])
    }

    /// Walks the chain locating `id`, if present.
    fn find(&self, id: u32) -> Result<Option<Found>, WireError> {
        let body = self.body();
        if body.is_empty() {
            return Ok(None);
        }
        let mut offset = 0usize;
        loop {
            if offset + PARAM_RECORD_HEADER_SIZE > body.len() {
                return Err(WireError::ChainOverrun);
            }
            let rec = ParamRecordHeader::decode(&body[offset..])?;
            let rec_size = rec.size as usize;
            let payload_end = offset + PARAM_RECORD_HEADER_SIZE + rec_size;
            if payload_end > body.len() {
                return Err(WireError::ChainOverrun);
            }
            let span = PARAM_RECORD_HEADER_SIZE + align4(rec_size);
            let is_last = rec.next == 0;
            if rec.id == id {
                return Ok(Some(Found {
                    offset,
                    size: rec_size,
                    is_last,
                }));
            }
            if is_last {
                return Ok(None);
            }
            if rec.next as usize != span {
                return Err(WireError::ChainOverrun);
            }
            offset += span;
        }
    }

    /// Implements the four-way branch of §4.1 `set`.
    pub fn set(&mut self, id: u32, bytes: Option<&[u8]>, size: usize) -> Result<(), WireError> {
        match self.find(id)? {
            None => self.append(id, bytes.unwrap_or(&[])),
            Some(found) => {
                if bytes.is_none() {
                    if !found.is_last || Some(found.offset) != self.last_offset {
                        return Err(WireError::SizeConflict(id));
                    }
                    self.resize_last(found.offset, found.size, size)
                } else if found.size == size {
                    self.overwrite(found.offset, bytes.unwrap())
                } else {
                    Err(WireError::SizeConflict(id))
                }
            }
        }
    }

    fn append(&mut self, id: u32, bytes: &[u8]) -> Result<(), WireError> {
        let size = bytes.len();
        let span = PARAM_RECORD_HEADER_SIZE + align4(size);
        if self.data_size + span > self.capacity_for_body() {
            return Err(WireError::OutOfRoom(span));
        }
        let prev_last = self.last_offset.filter(|_| self.data_size > 0);
        let new_offset = self.data_size;

        if let Some(prev_offset) = prev_last {
            let prev_span = new_offset - prev_offset;
            let prev_abs = HEADER_SIZE + prev_offset;
            self.buf[prev_abs + 8..prev_abs + 12].copy_from_slice(&(prev_span as u32).to_be_bytes());
        }

        let abs = HEADER_SIZE + new_offset;
        let rec = ParamRecordHeader {
            id,
            size: size as u32,
            next: 0,
        };
        rec.encode(&mut self.buf[abs..abs + PARAM_RECORD_HEADER_SIZE]);
        let payload_start = abs + PARAM_RECORD_HEADER_SIZE;
        self.buf[payload_start..payload_start + size].copy_from_slice(bytes);
        let pad = align4(size) - size;
        for b in &mut self.buf[payload_start + size..payload_start + size + pad] {
            *b = 0;
        }

        self.data_size += span;
        self.last_offset = Some(new_offset);
        Ok(())
    }

    fn resize_last(&mut self, offset: usize, old_size: usize, new_size: usize) -> Result<(), WireError> {
        let old_span = PARAM_RECORD_HEADER_SIZE + align4(old_size);
        let new_span = PARAM_RECORD_HEADER_SIZE + align4(new_size);
        let base_data_size = self.data_size - old_span;
        if base_data_size + new_span > self.capacity_for_body() {
            return Err(WireError::OutOfRoom(new_span));
        }
        let abs = HEADER_SIZE + offset;
        self.buf[abs + 4..abs + 8].copy_from_slice(&(new_size as u32).to_be_bytes());
        let payload_start = abs + PARAM_RECORD_HEADER_SIZE;
        if new_size > old_size {
            for b in &mut self.buf[payload_start + old_size..payload_start + new_size] {
                *b = 0;
            }
        } else if self.clean && new_size < old_size {
            for b in &mut self.buf[payload_start + new_size..payload_start + old_size] {
                *b = 0;
            }
        }
        let new_pad = align4(new_size) - new_size;
        for b in &mut self.buf[payload_start + new_size..payload_start + new_size + new_pad] {
            *b = 0;
        }
        self.data_size = base_data_size + new_span;
        Ok(())
    }

    fn overwrite(&mut self, offset: usize, bytes: &[u8]) -> Result<(), WireError> {
        let abs = HEADER_SIZE + offset + PARAM_RECORD_HEADER_SIZE;
        self.buf[abs..abs + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Result<Option<&[u8]>, WireError> {
        match self.find(id)? {
            None => Ok(None),
            Some(found) => {
                let start = HEADER_SIZE + found.offset + PARAM_RECORD_HEADER_SIZE;
                Ok(Some(&self.buf[start..start + found.size]))
            }
        }
    }

    /// Replaces the entire body with `bytes`, as done by a transport after
    /// receiving a packet off the wire.
    pub fn set_data(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if bytes.len() > self.capacity_for_body() {
            return Err(WireError::OutOfRoom(bytes.len()));
        }
        self.buf[HEADER_SIZE..HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
        if self.clean && bytes.len() < self.data_size {
            let old_end = HEADER_SIZE + self.data_size;
            for b in &mut self.buf[HEADER_SIZE + bytes.len()..old_end] {
                *b = 0;
            }
        }
        self.data_size = bytes.len();
        self.last_offset = None;
        Ok(())
    }

    /// Walks the record chain verifying the length invariants of §3.
    pub fn validate(&self) -> Result<(), WireError> {
        let body = self.body();
        if body.is_empty() {
            return Ok(());
        }
        let mut offset = 0usize;
        loop {
            if offset + PARAM_RECORD_HEADER_SIZE > body.len() {
                return Err(WireError::ChainOverrun);
            }
            let rec = ParamRecordHeader::decode(&body[offset..])?;
            let rec_size = rec.size as usize;
            let payload_end = offset + PARAM_RECORD_HEADER_SIZE + rec_size;
            if payload_end > body.len() {
                return Err(WireError::ChainOverrun);
            }
            let span = PARAM_RECORD_HEADER_SIZE + align4(rec_size);
            if rec.next == 0 {
                if offset + span != body.len() {
                    return Err(WireError::ChainOverrun);
                }
                return Ok(());
            }
            if rec.next as usize != span {
                return Err(WireError::ChainOverrun);
            }
            offset += span;
        }
    }

    pub fn clear(&mut self) {
        if self.clean {
            for b in &mut self.buf[HEADER_SIZE..HEADER_SIZE + self.data_size] {
                *b = 0;
            }
        }
        self.data_size = 0;
        self.last_offset = None;
    }
}

/// Both directions of one RPC exchange, sharing one capacity and `clean`
/// policy.
#[derive(Debug, Clone)]
pub struct DataBuffer {
    input: Region,
    output: Region,
}

impl DataBuffer {
    pub fn new(capacity: usize, clean: bool) -> Self {
        DataBuffer {
            input: Region::new(capacity, clean),
            output: Region::new(capacity, clean),
        }
    }

    pub fn region(&self, d: Direction) -> &Region {
        match d {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    pub fn region_mut(&mut self, d: Direction) -> &mut Region {
        match d {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    pub fn input(&self) -> &Region {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Region {
        &mut self.input
    }

    pub fn output(&self) -> &Region {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Region {
        &mut self.output
    }

    pub fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }

    pub fn set(&mut self, d: Direction, id: u32, bytes: &[u8]) -> Result<(), WireError> {
        self.region_mut(d).set(id, Some(bytes), bytes.len())
    }

    pub fn get(&self, d: Direction, id: u32) -> Result<Option<&[u8]>, WireError> {
        self.region(d).get(id)
    }

    pub fn set_u32(&mut self, d: Direction, id: u32, v: u32) -> Result<(), WireError> {
        self.set(d, id, &v.to_be_bytes())
    }
    pub fn get_u32(&self, d: Direction, id: u32) -> Result<Option<u32>, WireError> {
        Ok(self.get(d, id)?.and_then(|b| b.try_into().ok()).map(u32::from_be_bytes))
    }
    pub fn set_i32(&mut self, d: Direction, id: u32, v: i32) -> Result<(), WireError> {
        self.set(d, id, &v.to_be_bytes())
    }
    pub fn get_i32(&self, d: Direction, id: u32) -> Result<Option<i32>, WireError> {
        Ok(self.get(d, id)?.and_then(|b| b.try_into().ok()).map(i32::from_be_bytes))
    }
    pub fn set_u64(&mut self, d: Direction, id: u32, v: u64) -> Result<(), WireError> {
        self.set(d, id, &v.to_be_bytes())
    }
    pub fn get_u64(&self, d: Direction, id: u32) -> Result<Option<u64>, WireError> {
        Ok(self.get(d, id)?.and_then(|b| b.try_into().ok()).map(u64::from_be_bytes))
    }
    pub fn set_i64(&mut self, d: Direction, id: u32, v: i64) -> Result<(), WireError> {
        self.set(d, id, &v.to_be_bytes())
    }
    pub fn get_i64(&self, d: Direction, id: u32) -> Result<Option<i64>, WireError> {
        Ok(self.get(d, id)?.and_then(|b| b.try_into().ok()).map(i64::from_be_bytes))
    }
    pub fn set_f32(&mut self, d: Direction, id: u32, v: f32) -> Result<(), WireError> {
        self.set(d, id, &v.to_bits().to_be_bytes())
    }
    pub fn get_f32(&self, d: Direction, id: u32) -> Result<Option<f32>, WireError> {
        Ok(self
            .get(d, id)?
            .and_then(|b| b.try_into().ok())
            .map(|b| f32::from_bits(u32::from_be_bytes(b))))
    }
    pub fn set_f64(&mut self, d: Direction, id: u32, v: f64) -> Result<(), WireError> {
        self.set(d, id, &v.to_bits().to_be_bytes())
    }
    pub fn get_f64(&self, d: Direction, id: u32) -> Result<Option<f64>, WireError> {
        Ok(self
            .get(d, id)?
            .and_then(|b| b.try_into().ok())
            .map(|b| f64::from_bits(u64::from_be_bytes(b))))
    }
    pub fn set_string(&mut self, d: Direction, id: u32, v: &str) -> Result<(), WireError> {
        let mut bytes = Vec::with_capacity(v.len() + 1);
        bytes.extend_from_slice(v.as_bytes());
        bytes.push(0);
        self.set(d, id, &bytes)
    }
    pub fn get_string(&self, d: Direction, id: u32) -> Result<Option<String>, WireError> {
        match self.get(d, id)? {
            None => Ok(None),
            Some(bytes) => {
                if bytes.last() != Some(&0) {
                    return Err(WireError::UnterminatedString);
                }
                Ok(Some(String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HEADER_SIZE as HDR;

    fn buf(capacity: usize) -> DataBuffer {
        DataBuffer::new(HDR + capacity, true)
    }

    #[test]
    fn append_then_get_round_trips() {
        let mut b = buf(256);
        b.set(Direction::Output, 0x2000_0001, b"hello").unwrap();
        b.set(Direction::Output, 0x2000_0002, b"world!!").unwrap();
        assert_eq!(b.get(Direction::Output, 0x2000_0001).unwrap(), Some(&b"hello"[..]));
        assert_eq!(b.get(Direction::Output, 0x2000_0002).unwrap(), Some(&b"world!!"[..]));
        assert!(b.validate_output().is_ok());
    }

    impl DataBuffer {
        fn validate_output(&self) -> Result<(), WireError> {
            self.output.validate()
        }
    }

    #[test]
    fn set_data_then_get_round_trips() {
        let mut src = buf(256);
        src.set(Direction::Output, 5, b"abc").unwrap();
        src.set(Direction::Output, 6, b"de").unwrap();
        let packet = src.output().packet().to_vec();

        let mut dst = buf(256);
        dst.input_mut().set_data(&packet[HDR..]).unwrap();
        assert_eq!(dst.get(Direction::Input, 5).unwrap(), Some(&b"abc"[..]));
        assert_eq!(dst.get(Direction::Input, 6).unwrap(), Some(&b"de"[..]));
        assert!(dst.input().validate().is_ok());
    }

    #[test]
    fn overwrite_same_size_in_place() {
        let mut b = buf(256);
        b.set(Direction::Output, 1, b"AAAA").unwrap();
        b.set(Direction::Output, 2, b"BBBB").unwrap();
        b.set(Direction::Output, 1, b"zzzz").unwrap();
        assert_eq!(b.get(Direction::Output, 1).unwrap(), Some(&b"zzzz"[..]));
        assert_eq!(b.get(Direction::Output, 2).unwrap(), Some(&b"BBBB"[..]));
    }

    #[test]
    fn overwrite_different_size_fails() {
        let mut b = buf(256);
        b.set(Direction::Output, 1, b"AAAA").unwrap();
        b.set(Direction::Output, 2, b"BBBB").unwrap();
        let err = b.set(Direction::Output, 1, b"AAAAA").unwrap_err();
        assert!(matches!(err, WireError::SizeConflict(1)));
    }

    #[test]
    fn resize_last_record_in_place() {
        let mut b = buf(256);
        b.set(Direction::Output, 1, b"AA").unwrap();
        b.output_mut().set(1, None, 6).unwrap();
        assert_eq!(b.get(Direction::Output, 1).unwrap().unwrap().len(), 6);
    }

    #[test]
    fn clean_flag_zeroes_shrunk_bytes() {
        let mut b = buf(256);
        b.set(Direction::Output, 1, b"AAAAAA").unwrap();
        b.output_mut().set(1, None, 2).unwrap();
        let region = b.output();
        let packet = region.packet();
        // bytes belonging to the old, now-released tail must be zero.
        let tail_start = HDR + 12 + 4; // header + record hdr + new payload(2, padded to 4)
        assert!(packet[tail_start..tail_start + 2].iter().all(|&b| b == 0));
    }

    #[test]
    fn scalar_helpers_round_trip_big_endian() {
        let mut b = buf(256);
        b.set_u32(Direction::Output, 1, 0x1234_5678).unwrap();
        b.set_i32(Direction::Output, 2, -42).unwrap();
        b.set_u64(Direction::Output, 3, 0xDEAD_BEEF_CAFE_BABE).unwrap();
        b.set_i64(Direction::Output, 4, -1).unwrap();
        b.set_f32(Direction::Output, 5, 1.5f32).unwrap();
        b.set_f64(Direction::Output, 6, 1.23456f64 * 1.23456f64).unwrap();
        b.set_string(Direction::Output, 7, "hello").unwrap();

        assert_eq!(b.get_u32(Direction::Output, 1).unwrap(), Some(0x1234_5678));
        assert_eq!(b.get_i32(Direction::Output, 2).unwrap(), Some(-42));
        assert_eq!(b.get_u64(Direction::Output, 3).unwrap(), Some(0xDEAD_BEEF_CAFE_BABE));
        assert_eq!(b.get_i64(Direction::Output, 4).unwrap(), Some(-1));
        assert_eq!(b.get_f32(Direction::Output, 5).unwrap(), Some(1.5f32));
        assert_eq!(b.get_f64(Direction::Output, 6).unwrap(), Some(1.23456 * 1.23456));
        assert_eq!(b.get_string(Direction::Output, 7).unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn get_string_rejects_missing_terminator() {
        let mut b = buf(256);
        b.set(Direction::Output, 1, b"nonul").unwrap();
        let err = b.get_string(Direction::Output, 1).unwrap_err();
        assert!(matches!(err, WireError::UnterminatedString));
    }

    #[test]
    fn validate_fails_on_truncated_chain() {
        let mut b = buf(256);
        b.set(Direction::Output, 1, b"data").unwrap();
        // Lie about the payload size so it overruns the used region.
        let region = b.output_mut();
        let abs = HDR + 4;
        let packet = region.packet_mut();
        packet[abs..abs + 4].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(region.validate(), Err(WireError::ChainOverrun)));
    }

    #[test]
    fn out_of_room_is_reported() {
        let mut b = buf(16);
        let err = b.set(Direction::Output, 1, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, WireError::OutOfRoom(_)));
    }
}
