// src/gps/parser.rs
//! Combined NMEA/SiRF message parser feeding a fix listener

use super::data::Fix;
use super::framing::Frame;
use super::nmea::NmeaParser;
use super::sirf::SirfParser;
use tracing::trace;

/// Receives every fix (`Some`) and fix-loss signal (`None`) in order
pub trait FixListener {
    fn on_fix(&mut self, fix: Option<Fix>);
}

impl<F> FixListener for F
where
    F: FnMut(Option<Fix>),
{
    fn on_fix(&mut self, fix: Option<Fix>) {
        self(fix)
    }
}

/// Stateful decoder for both receiver protocols.
///
/// Fixes are delivered synchronously to the listener from within the
/// `put_*` call that closed the epoch.
pub struct MessageParser<L> {
    nmea: NmeaParser,
    sirf: SirfParser,
    listener: L,
}

impl<L: FixListener> MessageParser<L> {
    pub fn new(listener: L) -> Self {
        Self::with_nmea_parser(NmeaParser::new(), listener)
    }

    pub fn with_nmea_parser(nmea: NmeaParser, listener: L) -> Self {
        Self {
            nmea,
            sirf: SirfParser::new(),
            listener,
        }
    }

    /// Feed one NMEA sentence; returns whether it was recognized and well-formed
    pub fn put_nmea_message(&mut self, sentence: &str) -> bool {
        let recognized = self.nmea.put_message(sentence);
        for report in self.nmea.take_reports() {
            self.listener.on_fix(report);
        }
        recognized
    }

    /// Feed one SiRF frame located at `buf[offset..offset + length]`
    pub fn put_sirf_message(&mut self, buf: &[u8], offset: usize, length: usize) -> bool {
        let recognized = self.sirf.put_message(buf, offset, length);
        for report in self.sirf.take_reports() {
            self.listener.on_fix(report);
        }
        recognized
    }

    /// Feed one framed message. UBX frames are not decoded; a frame that
    /// passed its checksum counts as valid.
    pub fn put_frame(&mut self, frame: &Frame) -> bool {
        match frame {
            Frame::Nmea(sentence) => self.put_nmea_message(sentence),
            Frame::Sirf(bytes) => self.put_sirf_message(bytes, 0, bytes.len()),
            Frame::Ublox(bytes) => {
                if let [_, _, class, id, ..] = bytes.as_slice() {
                    trace!("UBX message 0x{:02x}:{:02x}", class, id);
                }
                true
            }
        }
    }

    /// No data arrived for a while: close the open NMEA epoch
    pub fn put_timeout(&mut self) {
        self.nmea.put_timeout();
        for report in self.nmea.take_reports() {
            self.listener.on_fix(report);
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }
}
