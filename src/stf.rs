//! Sub-timeframe header record and the ready-to-send message bundle

use std::ptr;

use crate::transport::MessagePart;

/// Size of the STF header wire record in bytes
pub const STF_HEADER_SIZE: usize = std::mem::size_of::<StfHeader>();

/// Fixed record identifying one sub-timeframe, sent as the first part
/// of an STF message. Fields are host byte order; cross-host peers
/// negotiate endianness out-of-band.
///
/// The explicit reserved fields keep the layout free of compiler
/// padding, so the wire bytes are fully determined by the field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct StfHeader {
    pub timeframe_id: u64,
    pub run_number: u32,
    pub system_id: u8,
    pub reserved0: u8,
    pub fee_id: u16,
    pub equipment_id: u16,
    pub link_id: u8,
    pub reserved1: u8,
    pub timeframe_orbit_first: u32,
    pub timeframe_orbit_last: u32,
    pub is_rdh_format: u8,
    /// Non-zero on the last STF message of the timeframe
    pub last_tf_message: u8,
    pub reserved: [u8; 10],
}

const _: () = assert!(STF_HEADER_SIZE == 40);

impl StfHeader {
    /// Read a header from the start of `buf`; `None` if it does not fit.
    pub fn read_from(buf: &[u8]) -> Option<StfHeader> {
        if buf.len() < STF_HEADER_SIZE {
            return None;
        }
        Some(unsafe { ptr::read_unaligned(buf.as_ptr() as *const StfHeader) })
    }

    /// Serialize into a fixed byte array.
    ///
    /// The layout has no compiler padding, so every output byte comes
    /// from a field value.
    pub fn to_bytes(&self) -> [u8; STF_HEADER_SIZE] {
        let mut buf = [0u8; STF_HEADER_SIZE];
        unsafe { ptr::write_unaligned(buf.as_mut_ptr() as *mut StfHeader, *self) };
        buf
    }
}

/// A formatted sub-timeframe ready for the sender lane.
///
/// `parts[0]` is the STF header (for the modes that carry one); every
/// part owns a hint clone keeping its backing page alive until the peer
/// releases it.
#[derive(Debug, Default)]
pub struct StfMessage {
    /// Transport parts, submitted as one atomic multi-part send
    pub parts: Vec<MessagePart>,
    /// Timeframe id of this STF (telemetry)
    pub timeframe_id: u64,
    /// Superpage payload bytes, STF header excluded
    pub data_size: u64,
    /// Payload bytes plus the STF header record
    pub total_size: u64,
    /// Memory bytes allocated for this STF (unused page tails included)
    pub memory_size: u64,
    /// Sum of part lengths as submitted to the transport
    pub wire_size: u64,
}
