//! Raw data header (RDH): the fixed prefix of every packet in a superpage
//!
//! The core only reads RDHs; producing them is the front-end's job. The
//! header is a 64-byte record in host byte order, laid out by the DMA
//! engine at the start of each packet.

use std::ptr;

/// Size of one raw data header in bytes
pub const RDH_SIZE: usize = 64;

/// Raw data header, the fixed per-packet prefix.
///
/// Only the fields walked by the sub-timeframe formatter are meaningful
/// here; the tail is reserved detector payload description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawDataHeader {
    pub version: u8,
    pub header_size: u8,
    pub fee_id: u16,
    pub priority: u8,
    pub source_id: u8,
    pub reserved0: [u8; 2],
    /// Byte offset from this header to the next packet; 0 ends the page scan
    pub offset_next_packet: u16,
    pub memory_size: u16,
    pub link_id: u8,
    pub packet_counter: u8,
    pub cru_id: u16,
    pub bunch_crossing: u16,
    pub reserved1: [u8; 2],
    /// Orbit number of the heartbeat frame this packet belongs to
    pub heartbeat_orbit: u32,
    pub reserved2: [u8; 40],
}

impl Default for RawDataHeader {
    fn default() -> Self {
        Self {
            version: 6,
            header_size: RDH_SIZE as u8,
            fee_id: 0,
            priority: 0,
            source_id: 0,
            reserved0: [0; 2],
            offset_next_packet: 0,
            memory_size: RDH_SIZE as u16,
            link_id: 0,
            packet_counter: 0,
            cru_id: 0,
            bunch_crossing: 0,
            reserved1: [0; 2],
            heartbeat_orbit: 0,
            reserved2: [0; 40],
        }
    }
}

impl RawDataHeader {
    /// Read a header from the start of `buf`; `None` if fewer than
    /// [`RDH_SIZE`] bytes remain.
    pub fn read_from(buf: &[u8]) -> Option<RawDataHeader> {
        if buf.len() < RDH_SIZE {
            return None;
        }
        // unaligned read: packets land at arbitrary offsets in the page
        Some(unsafe { ptr::read_unaligned(buf.as_ptr() as *const RawDataHeader) })
    }

    /// Write this header to the start of `buf`; `false` if it does not fit.
    pub fn write_to(&self, buf: &mut [u8]) -> bool {
        if buf.len() < RDH_SIZE {
            return false;
        }
        unsafe { ptr::write_unaligned(buf.as_mut_ptr() as *mut RawDataHeader, *self) };
        true
    }
}

/// Walk the packet chain of one page's data region.
///
/// Visits `(offset, header)` for each packet. The scan for a page ends
/// when fewer than [`RDH_SIZE`] bytes remain before `data_size`, or after
/// visiting a packet with `offset_next_packet == 0`.
pub fn scan_packets(data: &[u8], data_size: usize, mut visit: impl FnMut(usize, &RawDataHeader)) {
    let end = data_size.min(data.len());
    let mut offset = 0usize;
    while offset + RDH_SIZE <= end {
        let Some(rdh) = RawDataHeader::read_from(&data[offset..]) else {
            break;
        };
        visit(offset, &rdh);
        if rdh.offset_next_packet == 0 {
            break;
        }
        offset += rdh.offset_next_packet as usize;
    }
}
