#![allow(missing_docs)]

use std::io::Cursor;
use std::sync::Once;

use stratum::primitives::wal::{decode_shipped_stream, encode_shipped_stream, ShippingReceiver};
use stratum::types::page::PAGE_HDR_LEN;
use stratum::{EnvOptions, Environment, PageNumber, Result, StorageError, TxId};
use tracing_subscriber::EnvFilter;

const PAGE_SIZE: u32 = 1024;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stratum=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn options() -> EnvOptions {
    EnvOptions::default()
        .page_size(PAGE_SIZE)
        .journal_file_pages(512)
        .flush_interval(None)
}

fn payload(env: &Environment, page: PageNumber) -> Result<Vec<u8>> {
    let image = env.begin_read()?.read_page(page)?;
    Ok(image[PAGE_HDR_LEN..PAGE_HDR_LEN + 16].to_vec())
}

/// Commits `rounds` transactions, each writing a fresh page, creating a
/// tree and freeing the page written by the previous round.
fn populate(env: &Environment, first: u8, rounds: u8) -> Result<Vec<PageNumber>> {
    let mut pages = Vec::new();
    for round in first..first + rounds {
        let mut writer = env.begin_write()?;
        let number = {
            let mut page = writer.allocate_page(1)?;
            page.payload_mut()[..16].fill(round + 1);
            page.number()
        };
        writer.create_tree(&format!("tree-{round}"))?;
        if let Some(previous) = pages.last().copied() {
            writer.free_page(previous)?;
        }
        writer.commit()?;
        pages.push(number);
    }
    Ok(pages)
}

#[test]
fn replica_reproduces_primary_state() -> Result<()> {
    init_tracing();
    let primary = Environment::open_in_memory(options())?;
    let replica = Environment::open_in_memory(options())?;
    let pages = populate(&primary, 0, 5)?;

    let shipped = primary.read_shipped(TxId(0), 0)?;
    assert_eq!(shipped.len(), 5);
    let mut wire = Vec::new();
    encode_shipped_stream(&mut wire, &shipped)?;
    let decoded = decode_shipped_stream(&mut Cursor::new(wire))?;
    assert_eq!(decoded, shipped);

    let mut receiver = ShippingReceiver::new(PAGE_SIZE, TxId(0), Some(0));
    for entry in &decoded {
        receiver.receive(entry)?;
    }
    let log = receiver.finish();
    assert_eq!(log.transactions.len(), 5);
    assert_eq!(replica.apply_shipped(&log)?, TxId(5));

    assert_eq!(replica.last_tx(), primary.last_tx());
    assert_eq!(replica.shipping_crc(), Some(primary.last_crc()));
    let last = *pages.last().unwrap_or(&PageNumber(0));
    assert_eq!(payload(&replica, last)?, payload(&primary, last)?);
    assert_eq!(replica.begin_read()?.trees(), primary.begin_read()?.trees());
    assert_eq!(replica.stats().next_page, primary.stats().next_page);
    assert_eq!(replica.all_pages().free_pages, primary.all_pages().free_pages);

    // The replica keeps going from the shipped state.
    populate(&primary, 5, 2)?;
    let more = primary.read_shipped(TxId(5), primary_crc_after(&shipped))?;
    let mut receiver = ShippingReceiver::new(PAGE_SIZE, TxId(5), replica.shipping_crc());
    for entry in &more {
        receiver.receive(entry)?;
    }
    assert_eq!(replica.apply_shipped(&receiver.finish())?, TxId(7));
    // Transaction 7 freed a page, so the flush stops right before it.
    assert_eq!(replica.flush()?, Some(TxId(6)));
    assert_eq!(replica.begin_read()?.trees().len(), 7);
    Ok(())
}

fn primary_crc_after(shipped: &[stratum::primitives::wal::ShippedTransaction]) -> u32 {
    shipped.last().map_or(0, |entry| entry.header.crc)
}

#[test]
fn corrupted_entry_is_rejected_and_stops_the_stream() -> Result<()> {
    init_tracing();
    let primary = Environment::open_in_memory(options())?;
    let replica = Environment::open_in_memory(options())?;
    let pages = populate(&primary, 0, 5)?;

    let mut shipped = primary.read_shipped(TxId(0), 0)?;
    let corrupt_at = 2;
    let victim = &mut shipped[corrupt_at].compressed;
    let middle = victim.len() / 2;
    victim[middle] ^= 0x5a;

    let mut receiver = ShippingReceiver::new(PAGE_SIZE, TxId(0), Some(0));
    for entry in &shipped[..corrupt_at] {
        receiver.receive(entry)?;
    }
    let err = receiver.receive(&shipped[corrupt_at]).unwrap_err();
    assert!(err.is_corruption(), "unexpected error {err}");
    // Everything after the rejected entry is refused too.
    assert!(receiver.receive(&shipped[corrupt_at + 1]).is_err());

    let log = receiver.finish();
    assert_eq!(log.transactions.len(), corrupt_at);
    assert_eq!(replica.apply_shipped(&log)?, TxId(corrupt_at as u64));
    // The primary has since reused that page; the replica still holds the
    // image written by the last accepted round.
    assert_eq!(
        payload(&replica, pages[corrupt_at - 1])?,
        vec![corrupt_at as u8; 16]
    );
    assert_eq!(replica.begin_read()?.trees().len(), corrupt_at);
    Ok(())
}

#[test]
fn broken_chain_is_rejected() -> Result<()> {
    init_tracing();
    let primary = Environment::open_in_memory(options())?;
    populate(&primary, 0, 3)?;
    let shipped = primary.read_shipped(TxId(0), 0)?;

    // Entry 2 presented without entry 1: its previous crc cannot match.
    let mut receiver = ShippingReceiver::new(PAGE_SIZE, TxId(0), Some(0));
    receiver.receive(&shipped[0])?;
    assert!(receiver.receive(&shipped[2]).is_err());
    assert_eq!(receiver.finish().transactions.len(), 1);

    // Asking the primary for a chain value it never produced fails.
    assert!(matches!(
        primary.read_shipped(TxId(1), 0xdead_beef),
        Err(StorageError::InvalidOwned(_))
    ));
    Ok(())
}

#[test]
fn rejected_entry_leaves_the_replica_writable() -> Result<()> {
    init_tracing();
    let primary = Environment::open_in_memory(options())?;
    let replica = Environment::open_in_memory(options())?;
    populate(&primary, 0, 2)?;
    let shipped = primary.read_shipped(TxId(0), 0)?;

    let mut receiver = ShippingReceiver::new(PAGE_SIZE, TxId(0), Some(0));
    for entry in &shipped {
        receiver.receive(entry)?;
    }
    // The entry passed every chain and payload check; its catalog header
    // disagrees with the catalog pages it carries.
    let mut log = receiver.finish();
    log.transactions[1].header.catalog.tree_count += 3;
    let err = replica.apply_shipped(&log).unwrap_err();
    assert!(err.is_corruption(), "unexpected error {err}");
    assert_eq!(replica.last_tx(), TxId(1));
    assert_eq!(replica.begin_read()?.trees().len(), 1);

    // Neither the journal nor the published state moved past the last
    // accepted transaction.
    let mut writer = replica.begin_write()?;
    assert_eq!(writer.tx_id(), Some(TxId(2)));
    drop(writer.allocate_page(1)?);
    drop(writer);

    // The accepted prefix advanced the replica's chain value, so the
    // stream resumes right after it.
    assert_eq!(replica.shipping_crc(), Some(shipped[0].header.crc));
    let mut receiver = ShippingReceiver::new(PAGE_SIZE, TxId(1), replica.shipping_crc());
    receiver.receive(&shipped[1])?;
    assert_eq!(replica.apply_shipped(&receiver.finish())?, TxId(2));
    assert_eq!(replica.begin_read()?.trees(), primary.begin_read()?.trees());
    Ok(())
}
