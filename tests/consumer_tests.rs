//! Integration tests for the consumer facade (inline modes)

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{make_pool_with, single_hbf_page, write_page, PageSpec};
use subframe::{
    BankManager, Consumer, ConsumerConfig, DataBlockHeader, FormatMode, ReadoutStats, StfHeader,
    SubframeError, STF_HEADER_SIZE,
};

fn consumer_with(config: ConsumerConfig) -> (Consumer, Arc<ReadoutStats>) {
    let stats = Arc::new(ReadoutStats::new());
    let consumer =
        Consumer::with_parts(config, Arc::clone(&stats), Arc::new(BankManager::new())).unwrap();
    (consumer, stats)
}

#[test]
fn test_construction_rejects_bad_config() {
    // unparsable pool page size
    let cfg = ConsumerConfig::new("bad-size").with_pool("12q", 10);
    assert!(Consumer::new(cfg).is_err());

    // page equal to the reserved header area
    let cfg = ConsumerConfig::new("tiny-page").with_pool("128", 10);
    assert!(Consumer::new(cfg).is_err());

    // bad channel address
    let mut cfg = ConsumerConfig::new("bad-addr").with_pool("4k", 4);
    cfg.channel.address = "smtp://nowhere".to_string();
    assert!(Consumer::new(cfg).is_err());

    // zero pages
    let cfg = ConsumerConfig::new("no-pages").with_pool("4k", 0);
    assert!(Consumer::new(cfg).is_err());
}

#[test]
fn test_resource_precheck_blocks_oversized_region() {
    let mut cfg = ConsumerConfig::new("too-big").with_pool("4k", 4);
    cfg.unmanaged_memory_size = Some("1P".to_string());
    cfg.check_resources = "/tmp".to_string();
    let err = Consumer::new(cfg).unwrap_err();
    assert!(matches!(err, SubframeError::ResourceCheck { .. }));
}

#[cfg(target_os = "linux")]
#[test]
fn test_region_feeds_the_pool_through_a_bank() {
    let mut cfg = ConsumerConfig::new("banked").with_pool("4k", 8);
    cfg.unmanaged_memory_size = Some("1M".to_string());
    cfg.check_resources = "MemTotal".to_string();
    let (consumer, _stats) = consumer_with(cfg);

    let region = consumer.region().expect("region configured").clone();
    let page = consumer.pool().acquire().expect("pool page");
    assert!(region.contains(page.data_ptr()));
}

#[test]
fn test_single_hbf_inline_roundtrip() {
    let cfg = ConsumerConfig::new("inline").with_pool("4k", 8);
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 8192, 4, Arc::clone(&stats));

    let page = single_hbf_page(&equipment, 42, 7, 4096, true);
    consumer.push_data(vec![page]).unwrap();

    assert_eq!(consumer.counters().push_success(), 1);
    assert_eq!(consumer.counters().stf_sent(), 1);
    assert_eq!(consumer.counters().pages_input(), 1);

    let endpoint = consumer.endpoint();
    let batch = endpoint.recv().expect("one STF on the wire");
    assert_eq!(batch.len(), 2);
    let stf = StfHeader::read_from(batch[0].as_slice()).unwrap();
    assert_eq!(stf.timeframe_id, 42);
    assert_eq!(stf.last_tf_message, 1);
    assert_eq!(batch[1].len(), 4096);

    assert_eq!(stats.pages_pending.load(Ordering::Relaxed), 2);
    drop(batch);
    assert_eq!(stats.pages_pending.load(Ordering::Relaxed), 0);
    assert_eq!(
        stats.bytes_sent.load(Ordering::Relaxed),
        4096 + STF_HEADER_SIZE as u64
    );
    assert_eq!(stats.last_timeframe_id_sent.load(Ordering::Relaxed), 42);
}

#[test]
fn test_pool_exhaustion_drops_dataset() {
    // a single pool page: the header takes it, the repack cannot
    let cfg = ConsumerConfig::new("exhausted").with_pool("4k", 1);
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 8192, 4, Arc::clone(&stats));

    let a = write_page(
        &equipment,
        &PageSpec {
            timeframe_id: 8,
            packets: vec![(7, 1000)],
            ..Default::default()
        },
    );
    let b = write_page(
        &equipment,
        &PageSpec {
            timeframe_id: 8,
            end_of_timeframe: true,
            packets: vec![(7, 500), (8, 500)],
            ..Default::default()
        },
    );

    assert!(consumer.push_data(vec![a, b]).is_err());
    assert_eq!(consumer.counters().push_error(), 1);
    assert_eq!(consumer.endpoint().pending(), 0);
    assert_eq!(stats.pages_pending.load(Ordering::Relaxed), 0);
    // the header page went back to the pool
    assert_eq!(consumer.pool_stats().free, 1);
}

#[test]
fn test_raw_per_page_mode() {
    let cfg = ConsumerConfig::new("raw")
        .with_pool("4k", 4)
        .with_format_mode(FormatMode::RawPerPage);
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 4096, 4, Arc::clone(&stats));

    let pages: Vec<_> = (0..3)
        .map(|i| single_hbf_page(&equipment, 1, 10 + i, 512, i == 2))
        .collect();
    let sources: Vec<Vec<u8>> = pages.iter().map(|p| p.data()[..512].to_vec()).collect();
    consumer.push_data(pages).unwrap();

    // one single-part message per page, no STF header, input order
    let endpoint = consumer.endpoint();
    assert_eq!(endpoint.pending(), 3);
    for expected in &sources {
        let batch = endpoint.recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_slice(), &expected[..]);
    }
}

#[test]
fn test_datablock_per_page_mode() {
    let cfg = ConsumerConfig::new("datablock")
        .with_pool("4k", 4)
        .with_format_mode(FormatMode::DatablockPerPage);
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 4096, 4, Arc::clone(&stats));

    let page = single_hbf_page(&equipment, 6, 3, 256, true);
    consumer.push_data(vec![page]).unwrap();

    let batch = consumer.endpoint().recv().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].len(), std::mem::size_of::<DataBlockHeader>());
    assert_eq!(batch[1].len(), 256);
}

#[test]
fn test_stf_per_page_mode() {
    let cfg = ConsumerConfig::new("superpage")
        .with_pool("4k", 4)
        .with_format_mode(FormatMode::StfPerPage);
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 4096, 4, Arc::clone(&stats));

    let a = single_hbf_page(&equipment, 12, 1, 512, false);
    let b = single_hbf_page(&equipment, 12, 2, 768, true);
    consumer.push_data(vec![a, b]).unwrap();

    let batch = consumer.endpoint().recv().unwrap();
    assert_eq!(batch.len(), 3);
    let stf = StfHeader::read_from(batch[0].as_slice()).unwrap();
    assert_eq!(stf.timeframe_id, 12);
    assert_eq!(stf.last_tf_message, 1);
    assert_eq!(batch[1].len(), 512);
    assert_eq!(batch[2].len(), 768);
}

#[test]
fn test_non_rdh_data_falls_back_to_page_granularity() {
    let cfg = ConsumerConfig::new("non-rdh").with_pool("4k", 4);
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 4096, 4, Arc::clone(&stats));

    let page = equipment.acquire().unwrap();
    page.write_data(0, &[0x55; 300]).unwrap();
    page.with_header_mut(|h| {
        h.data_size = 300;
        h.timeframe_id = 77;
        h.is_rdh_format = 0;
        h.flag_end_of_timeframe = 1;
    });
    consumer.push_data(vec![page]).unwrap();

    let batch = consumer.endpoint().recv().unwrap();
    assert_eq!(batch.len(), 2);
    let stf = StfHeader::read_from(batch[0].as_slice()).unwrap();
    assert_eq!(stf.timeframe_id, 77);
    assert_eq!(stf.is_rdh_format, 0);
    assert_eq!(batch[1].len(), 300);
}

#[test]
fn test_disable_sending_drops_input() {
    let mut cfg = ConsumerConfig::new("perf").with_pool("4k", 4);
    cfg.disable_sending = true;
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 4096, 4, Arc::clone(&stats));

    let page = single_hbf_page(&equipment, 1, 1, 256, true);
    consumer.push_data(vec![page]).unwrap();
    assert_eq!(consumer.counters().push_success(), 1);
    assert_eq!(consumer.endpoint().pending(), 0);
}

#[test]
fn test_per_block_push_is_unsupported() {
    let cfg = ConsumerConfig::new("per-block").with_pool("4k", 4);
    let (consumer, _stats) = consumer_with(cfg);
    let page = consumer.pool().acquire().unwrap();
    assert!(matches!(
        consumer.push_block(page),
        Err(SubframeError::Unsupported { .. })
    ));
}

#[test]
fn test_peer_release_outlives_consumer() {
    let cfg = ConsumerConfig::new("late-release").with_pool("4k", 8);
    let (consumer, stats) = consumer_with(cfg);
    let equipment = make_pool_with("equipment", 8192, 4, Arc::clone(&stats));

    let page = single_hbf_page(&equipment, 9, 4, 1024, true);
    consumer.push_data(vec![page]).unwrap();

    let endpoint = consumer.endpoint();
    let batch = endpoint.recv().unwrap();
    drop(consumer);

    // in-flight messages were not cancelled; release still works
    assert_eq!(stats.pages_pending.load(Ordering::Relaxed), 2);
    drop(batch);
    assert_eq!(stats.pages_pending.load(Ordering::Relaxed), 0);
}

#[test]
fn test_empty_dataset_is_accepted_and_ignored() {
    let cfg = ConsumerConfig::new("empty").with_pool("4k", 4);
    let (consumer, _stats) = consumer_with(cfg);
    consumer.push_data(Vec::new()).unwrap();
    assert_eq!(consumer.endpoint().pending(), 0);
    assert_eq!(consumer.counters().push_error(), 0);
}
