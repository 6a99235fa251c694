#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Barrier, Once};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stratum::types::page::PAGE_HDR_LEN;
use stratum::{EnvOptions, Environment, PageNumber, Result, StorageError, Transaction, TxId};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const READERS: usize = 4;
const WRITES: u64 = 200;
const PAGES: usize = 3;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stratum=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn counter(tx: &Transaction, page: PageNumber) -> Result<u64> {
    let image = tx.read_page(page)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[PAGE_HDR_LEN..PAGE_HDR_LEN + 8]);
    Ok(u64::from_be_bytes(bytes))
}

/// Every committed transaction writes its own id into all pages, so a
/// consistent snapshot sees one value everywhere.
fn check_snapshot(tx: &Transaction, pages: &[PageNumber]) -> Result<u64> {
    let first = counter(tx, pages[0])?;
    for page in &pages[1..] {
        let value = counter(tx, *page)?;
        if value != first {
            return Err(StorageError::CorruptionOwned(format!(
                "snapshot {} sees {first} and {value}",
                tx.snapshot()
            )));
        }
    }
    Ok(first)
}

#[test]
fn readers_see_consistent_snapshots_while_writer_and_flush_run() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let options = EnvOptions::default()
        .page_size(1024)
        .journal_file_pages(32)
        .flush_interval(Some(Duration::from_millis(2)));
    let env = Environment::open(dir.path(), options)?;

    let mut writer = env.begin_write()?;
    let mut pages = Vec::new();
    for _ in 0..PAGES {
        pages.push(writer.allocate_page(1)?.number());
    }
    let base = writer.commit()?;

    let done = AtomicBool::new(false);
    let observed = AtomicU64::new(0);
    let barrier = Barrier::new(READERS + 1);
    thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::new();
        for seed in 0..READERS as u64 {
            let (env, pages, done, observed, barrier) = (&env, &pages, &done, &observed, &barrier);
            handles.push(scope.spawn(move || -> Result<()> {
                let mut rng = StdRng::seed_from_u64(seed);
                barrier.wait();
                let mut last_seen = 0;
                while !done.load(Ordering::Acquire) {
                    let reader = env.begin_read()?;
                    let value = check_snapshot(&reader, pages)?;
                    assert!(value >= last_seen, "snapshots went backwards");
                    last_seen = value;
                    // Hold some snapshots across several commits.
                    if rng.gen_ratio(1, 8) {
                        thread::sleep(Duration::from_micros(rng.gen_range(100..2_000)));
                        assert_eq!(check_snapshot(&reader, pages)?, value);
                    }
                    observed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }));
        }

        barrier.wait();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..WRITES {
            let mut writer = env.begin_write()?;
            let tx_id = writer.tx_id().unwrap_or_default();
            for page in &pages {
                writer.modify_page(*page)?.payload_mut()[..8].copy_from_slice(&tx_id.0.to_be_bytes());
            }
            // Churn the allocator too.
            if rng.gen_bool(0.3) {
                let scratch = writer.allocate_page(rng.gen_range(1..4))?.number();
                writer.free_page(scratch)?;
            }
            writer.commit()?;
        }
        done.store(true, Ordering::Release);
        for handle in handles {
            handle.join().expect("reader thread panicked")?;
        }
        Ok(())
    })?;

    assert!(observed.load(Ordering::Relaxed) > 0);
    assert_eq!(env.last_tx(), TxId(base.0 + WRITES));
    assert_eq!(env.stats().active_transactions, 0);
    let reader = env.begin_read()?;
    assert_eq!(check_snapshot(&reader, &pages)?, base.0 + WRITES);
    drop(reader);
    env.close()?;

    let env = Environment::open(dir.path(), EnvOptions::default().page_size(1024))?;
    let reader = env.begin_read()?;
    assert_eq!(check_snapshot(&reader, &pages)?, base.0 + WRITES);
    Ok(())
}

#[test]
fn writers_are_serialized() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(
        EnvOptions::default()
            .page_size(1024)
            .flush_interval(Some(Duration::from_millis(1))),
    )?;
    let mut writer = env.begin_write()?;
    let page = writer.allocate_page(1)?.number();
    writer.commit()?;

    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let env = &env;
                scope.spawn(move || -> Result<()> {
                    for _ in 0..50 {
                        let mut writer = env.begin_write()?;
                        let current = counter(&writer, page)?;
                        writer.modify_page(page)?.payload_mut()[..8]
                            .copy_from_slice(&(current + 1).to_be_bytes());
                        writer.commit()?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread panicked")?;
        }
        Ok(())
    })?;

    assert_eq!(counter(&env.begin_read()?, page)?, 200);
    assert_eq!(env.last_tx(), TxId(201));
    Ok(())
}

#[test]
fn second_writer_times_out_while_the_slot_is_held() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(EnvOptions::default().page_size(1024).flush_interval(None))?;
    let writer = env.begin_write()?;
    assert!(env.stats().writer_active);
    assert!(env.begin_write_timeout(Duration::from_millis(20))?.is_none());
    // Readers never wait on the writer slot.
    assert_eq!(env.begin_read()?.snapshot(), TxId(0));
    drop(writer);

    assert!(!env.stats().writer_active);
    let writer = env.begin_write_timeout(Duration::from_millis(20))?;
    assert_eq!(writer.and_then(|tx| tx.tx_id()), Some(TxId(1)));
    Ok(())
}
