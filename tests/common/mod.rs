//! Shared helpers for integration tests: pools and synthetic superpages

#![allow(dead_code)]

use std::sync::Arc;

use subframe::{PagePool, PageRef, PoolConfig, RawDataHeader, ReadoutStats, RDH_SIZE};

/// Pool over private counters
#[allow(dead_code)]
pub fn make_pool(name: &str, page_size: usize, pages: usize) -> (PagePool, Arc<ReadoutStats>) {
    let stats = Arc::new(ReadoutStats::new());
    let pool = make_pool_with(name, page_size, pages, Arc::clone(&stats));
    (pool, stats)
}

/// Pool sharing an existing counter set
pub fn make_pool_with(
    name: &str,
    page_size: usize,
    pages: usize,
    stats: Arc<ReadoutStats>,
) -> PagePool {
    let config = PoolConfig::new(name)
        .with_page_size(page_size)
        .with_page_count(pages);
    PagePool::new(config, stats).expect("pool")
}

/// Description of one synthetic superpage
pub struct PageSpec {
    pub timeframe_id: u64,
    pub link_id: u8,
    pub equipment_id: u16,
    pub end_of_timeframe: bool,
    /// `(heartbeat_orbit, total_packet_len)` per packet, in page order
    pub packets: Vec<(u32, u16)>,
}

impl Default for PageSpec {
    fn default() -> Self {
        Self {
            timeframe_id: 1,
            link_id: 0,
            equipment_id: 0,
            end_of_timeframe: false,
            packets: Vec::new(),
        }
    }
}

/// Acquire a page and fill it with an RDH packet chain per `spec`.
pub fn write_page(pool: &PagePool, spec: &PageSpec) -> PageRef {
    let page = pool.acquire().expect("equipment page");
    let mut offset = 0usize;
    for &(orbit, len) in &spec.packets {
        assert!(len as usize >= RDH_SIZE, "packet shorter than one RDH");
        let rdh = RawDataHeader {
            heartbeat_orbit: orbit,
            offset_next_packet: len,
            memory_size: len,
            link_id: spec.link_id,
            fee_id: spec.equipment_id,
            ..Default::default()
        };
        let mut buf = vec![0u8; len as usize];
        rdh.write_to(&mut buf);
        // deterministic payload so repack copies can be byte-checked
        for (i, b) in buf.iter_mut().enumerate().skip(RDH_SIZE) {
            *b = (orbit as u8) ^ (i as u8) ^ (offset as u8);
        }
        page.write_data(offset, &buf).expect("packet fits in page");
        offset += len as usize;
    }
    page.with_header_mut(|h| {
        h.data_size = offset as u32;
        h.timeframe_id = spec.timeframe_id;
        h.run_number = 1;
        h.link_id = spec.link_id;
        h.equipment_id = spec.equipment_id;
        h.is_rdh_format = 1;
        h.flag_end_of_timeframe = spec.end_of_timeframe as u8;
    });
    page
}

/// One-packet page: a whole heartbeat frame in one page
#[allow(dead_code)]
pub fn single_hbf_page(
    pool: &PagePool,
    timeframe_id: u64,
    orbit: u32,
    total_len: u16,
    end_of_timeframe: bool,
) -> PageRef {
    write_page(
        pool,
        &PageSpec {
            timeframe_id,
            end_of_timeframe,
            packets: vec![(orbit, total_len)],
            ..Default::default()
        },
    )
}
