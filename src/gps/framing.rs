// src/gps/framing.rs
//! Split the raw serial byte stream into NMEA sentences, SiRF frames and
//! u-blox UBX frames

use tracing::trace;

/// Bytes retained between reads
pub const FRAMER_BUFFER_SIZE: usize = 8192;
/// Longest NMEA sentence accepted, without CR LF
pub const NMEA_MAX_LENGTH: usize = 82;
/// Longest SiRF payload accepted
pub const SIRF_MAX_PAYLOAD: usize = 1023;

const SIRF_START: [u8; 2] = [0xA0, 0xA2];
const SIRF_END: [u8; 2] = [0xB0, 0xB3];
/// Start sequence, length, checksum and end sequence
const SIRF_OVERHEAD: usize = 8;

/// Longest UBX payload accepted
pub const UBX_MAX_PAYLOAD: usize = 4096;

const UBX_SYNC: [u8; 2] = [0xB5, 0x62];
/// Sync chars, class, id, length and checksum
const UBX_OVERHEAD: usize = 8;

/// One message extracted from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sentence text without the trailing CR LF
    Nmea(String),
    /// Complete frame including start and end sequences
    Sirf(Vec<u8>),
    /// Complete UBX frame with a verified checksum; not decoded
    Ublox(Vec<u8>),
}

enum Scan {
    Found(Frame, usize),
    Incomplete,
    Junk,
}

/// Incremental stream framer
#[derive(Debug)]
pub struct MessageFramer {
    buf: Vec<u8>,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(FRAMER_BUFFER_SIZE),
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append received bytes and return every frame they complete
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let n = (FRAMER_BUFFER_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];

            self.drain_frames(&mut frames);

            if self.buf.len() == FRAMER_BUFFER_SIZE {
                trace!("Framer buffer full, dropping one byte");
                self.buf.drain(..1);
            }
            if data.is_empty() {
                break;
            }
        }
        frames
    }

    fn drain_frames(&mut self, frames: &mut Vec<Frame>) {
        let mut pos = 0;
        let mut skipped = 0;
        while pos < self.buf.len() {
            let rest = &self.buf[pos..];
            let scan = match rest[0] {
                b'$' => scan_nmea(rest),
                b if b == SIRF_START[0] => scan_sirf(rest),
                b if b == UBX_SYNC[0] => scan_ublox(rest),
                _ => Scan::Junk,
            };
            match scan {
                Scan::Found(frame, len) => {
                    frames.push(frame);
                    pos += len;
                }
                Scan::Incomplete => break,
                Scan::Junk => {
                    skipped += 1;
                    pos += 1;
                }
            }
        }
        if skipped > 0 {
            trace!("Skipped {} junk bytes", skipped);
        }
        self.buf.drain(..pos);
    }
}

fn scan_nmea(rest: &[u8]) -> Scan {
    for (i, &b) in rest.iter().enumerate().skip(1) {
        if b == b'\r' {
            return match rest.get(i + 1) {
                None => Scan::Incomplete,
                Some(b'\n') => {
                    let body = &rest[..i];
                    if !checksum_well_placed(body) {
                        return Scan::Junk;
                    }
                    match std::str::from_utf8(body) {
                        Ok(text) => Scan::Found(Frame::Nmea(text.to_owned()), i + 2),
                        Err(_) => Scan::Junk,
                    }
                }
                Some(_) => Scan::Junk,
            };
        }
        if i >= NMEA_MAX_LENGTH || !(0x20..=0x7E).contains(&b) {
            return Scan::Junk;
        }
    }
    Scan::Incomplete
}

/// `*hh`, when present, must end the sentence
fn checksum_well_placed(body: &[u8]) -> bool {
    match body.iter().position(|&c| c == b'*') {
        None => true,
        Some(p) => p + 3 == body.len() && body[p + 1..].iter().all(u8::is_ascii_hexdigit),
    }
}

fn scan_sirf(rest: &[u8]) -> Scan {
    if rest.len() < 2 {
        return Scan::Incomplete;
    }
    if rest[1] != SIRF_START[1] {
        return Scan::Junk;
    }
    if rest.len() < 4 {
        return Scan::Incomplete;
    }
    let payload_len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
    if payload_len == 0 || payload_len > SIRF_MAX_PAYLOAD {
        return Scan::Junk;
    }
    let total = payload_len + SIRF_OVERHEAD;
    if rest.len() < total {
        return Scan::Incomplete;
    }
    if rest[total - 2..total] != SIRF_END {
        return Scan::Junk;
    }
    Scan::Found(Frame::Sirf(rest[..total].to_vec()), total)
}

fn scan_ublox(rest: &[u8]) -> Scan {
    if rest.len() < 2 {
        return Scan::Incomplete;
    }
    if rest[1] != UBX_SYNC[1] {
        return Scan::Junk;
    }
    if rest.len() < 6 {
        return Scan::Incomplete;
    }
    let payload_len = usize::from(u16::from_le_bytes([rest[4], rest[5]]));
    if payload_len == 0 || payload_len > UBX_MAX_PAYLOAD {
        return Scan::Junk;
    }
    let total = payload_len + UBX_OVERHEAD;
    if rest.len() < total {
        return Scan::Incomplete;
    }
    if rest[total - 2..total] != ubx_checksum(&rest[2..total - 2]) {
        return Scan::Junk;
    }
    Scan::Found(Frame::Ublox(rest[..total].to_vec()), total)
}

/// 8-bit Fletcher checksum over class, id, length and payload
fn ubx_checksum(bytes: &[u8]) -> [u8; 2] {
    let mut ck_a = 0u8;
    let mut ck_b = 0u8;
    for &byte in bytes {
        ck_a = ck_a.wrapping_add(byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    [ck_a, ck_b]
}
