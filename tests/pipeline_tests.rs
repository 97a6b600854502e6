//! Integration tests for the threaded worker pipeline

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{make_pool_with, single_hbf_page};
use subframe::{
    BankManager, ChannelEndpoint, Consumer, ConsumerConfig, ReadoutStats, StfHeader,
    SubframeError,
};

fn threaded_consumer(name: &str, threads: usize) -> (Consumer, Arc<ReadoutStats>) {
    let stats = Arc::new(ReadoutStats::new());
    let cfg = ConsumerConfig::new(name)
        .with_pool("4k", 32)
        .with_threads(threads);
    let consumer =
        Consumer::with_parts(cfg, Arc::clone(&stats), Arc::new(BankManager::new())).unwrap();
    (consumer, stats)
}

fn wait_for_batches(endpoint: &ChannelEndpoint, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while endpoint.pending() < count {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} batches, got {}",
            count,
            endpoint.pending()
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_timeframe_ordering_with_four_workers() {
    let (consumer, stats) = threaded_consumer("ordered", 4);
    let equipment = make_pool_with("equipment", 8192, 16, Arc::clone(&stats));

    for tf in 10..=15u64 {
        // vary the payload size so per-worker formatting cost differs
        let len = 512 + (tf % 3) as u16 * 1024;
        let page = single_hbf_page(&equipment, tf, tf as u32, len, true);
        consumer.push_data(vec![page]).unwrap();
    }

    let endpoint = consumer.endpoint();
    wait_for_batches(&endpoint, 6);

    // the wire sees timeframes in completion order, 10..=15
    for expected in 10..=15u64 {
        let batch = endpoint.recv().unwrap();
        let stf = StfHeader::read_from(batch[0].as_slice()).unwrap();
        assert_eq!(stf.timeframe_id, expected);
        assert_eq!(stf.last_tf_message, 1);
    }
}

#[test]
fn test_end_of_timeframe_flushes_immediately() {
    let (consumer, stats) = threaded_consumer("flush", 2);
    let equipment = make_pool_with("equipment", 8192, 8, Arc::clone(&stats));

    // a single timeframe: no later TF id will ever arrive, the end flag
    // alone must push it through
    let page = single_hbf_page(&equipment, 7, 1, 512, true);
    consumer.push_data(vec![page]).unwrap();

    let endpoint = consumer.endpoint();
    wait_for_batches(&endpoint, 1);
    let batch = endpoint.recv().unwrap();
    let stf = StfHeader::read_from(batch[0].as_slice()).unwrap();
    assert_eq!(stf.timeframe_id, 7);
}

#[test]
fn test_incomplete_timeframe_flushes_on_next_id() {
    let (consumer, stats) = threaded_consumer("next-id", 2);
    let equipment = make_pool_with("equipment", 8192, 8, Arc::clone(&stats));

    // TF 3 never sees its end flag; the arrival of TF 4 completes it
    let a = single_hbf_page(&equipment, 3, 1, 512, false);
    consumer.push_data(vec![a]).unwrap();
    assert_eq!(consumer.endpoint().pending(), 0);

    let b = single_hbf_page(&equipment, 4, 2, 512, true);
    consumer.push_data(vec![b]).unwrap();

    let endpoint = consumer.endpoint();
    wait_for_batches(&endpoint, 2);
    let first = endpoint.recv().unwrap();
    assert_eq!(StfHeader::read_from(first[0].as_slice()).unwrap().timeframe_id, 3);
    let second = endpoint.recv().unwrap();
    assert_eq!(StfHeader::read_from(second[0].as_slice()).unwrap().timeframe_id, 4);
}

#[test]
fn test_mixed_timeframe_dataset_is_dropped() {
    let (consumer, stats) = threaded_consumer("mixed", 2);
    let equipment = make_pool_with("equipment", 8192, 8, Arc::clone(&stats));

    let a = single_hbf_page(&equipment, 1, 1, 512, false);
    let b = single_hbf_page(&equipment, 2, 2, 512, true);
    let err = consumer.push_data(vec![a, b]).unwrap_err();
    assert!(matches!(err, SubframeError::StreamConsistency { .. }));
    assert_eq!(consumer.counters().push_error(), 1);
    assert_eq!(consumer.endpoint().pending(), 0);
}

#[test]
fn test_data_after_end_of_timeframe_is_rejected() {
    let (consumer, stats) = threaded_consumer("late-data", 2);
    let equipment = make_pool_with("equipment", 8192, 8, Arc::clone(&stats));

    let a = single_hbf_page(&equipment, 5, 1, 512, true);
    consumer.push_data(vec![a]).unwrap();

    // the timeframe was already flushed on its end flag
    let b = single_hbf_page(&equipment, 5, 2, 512, true);
    assert!(consumer.push_data(vec![b]).is_err());
    assert_eq!(consumer.counters().push_error(), 1);
}

#[test]
fn test_non_contiguous_timeframes_still_flow() {
    let (consumer, stats) = threaded_consumer("gaps", 2);
    let equipment = make_pool_with("equipment", 8192, 8, Arc::clone(&stats));

    for tf in [10u64, 12, 15] {
        let page = single_hbf_page(&equipment, tf, tf as u32, 512, true);
        consumer.push_data(vec![page]).unwrap();
    }

    let endpoint = consumer.endpoint();
    wait_for_batches(&endpoint, 3);
    for expected in [10u64, 12, 15] {
        let batch = endpoint.recv().unwrap();
        let stf = StfHeader::read_from(batch[0].as_slice()).unwrap();
        assert_eq!(stf.timeframe_id, expected);
    }
}

#[test]
fn test_shutdown_joins_lanes_and_releases_pages() {
    let (consumer, stats) = threaded_consumer("shutdown", 3);
    let equipment = make_pool_with("equipment", 8192, 16, Arc::clone(&stats));

    for tf in 1..=4u64 {
        let page = single_hbf_page(&equipment, tf, tf as u32, 512, true);
        consumer.push_data(vec![page]).unwrap();
    }
    let endpoint = consumer.endpoint();
    wait_for_batches(&endpoint, 4);
    drop(consumer);

    // draining the wire after shutdown releases everything
    while let Some(batch) = endpoint.recv() {
        drop(batch);
    }
    assert_eq!(
        stats
            .pages_pending
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}
