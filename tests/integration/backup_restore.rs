#![allow(missing_docs)]

use std::sync::Once;

use stratum::storage::backup::{BACKUP_MAGIC, INCREMENTAL_MAGIC};
use stratum::types::page::PAGE_HDR_LEN;
use stratum::{restore, EnvOptions, Environment, PageNumber, Result, StorageError, TxId};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

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
        .page_size(1024)
        .journal_file_pages(64)
        .flush_interval(None)
        .incremental_backup(true)
}

fn write_rounds(env: &Environment, rounds: std::ops::Range<u8>) -> Result<Vec<PageNumber>> {
    let mut pages = Vec::new();
    for round in rounds {
        let mut writer = env.begin_write()?;
        let count = 1 + u32::from(round % 3);
        let number = {
            let mut run = writer.allocate_page(count)?;
            run.payload_mut().fill(round);
            run.number()
        };
        writer.create_tree(&format!("t{round:02}"))?;
        writer.commit()?;
        pages.push(number);
    }
    Ok(pages)
}

fn image(env: &Environment, page: PageNumber) -> Result<Vec<u8>> {
    env.begin_read()?.read_page(page)
}

#[test]
fn full_backup_restores_committed_state() -> Result<()> {
    init_tracing();
    let source_dir = tempdir()?;
    let primary = Environment::open(source_dir.path(), options())?;
    let pages = write_rounds(&primary, 0..4)?;
    primary.flush()?;
    // Leave part of the history in the journal only.
    let more = write_rounds(&primary, 4..7)?;
    let mut writer = primary.begin_write()?;
    writer.free_page(pages[0])?;
    writer.commit()?;

    let mut stream = Vec::new();
    let summary = primary.backup(&mut stream)?;
    assert_eq!(summary.last_tx, primary.last_tx());
    assert_eq!(&stream[..8], &BACKUP_MAGIC);

    let target = tempdir()?;
    assert_eq!(restore(&mut stream.as_slice(), target.path())?, primary.last_tx());

    let restored = Environment::open(target.path(), options())?;
    assert_eq!(restored.last_tx(), primary.last_tx());
    assert_eq!(restored.begin_read()?.trees(), primary.begin_read()?.trees());
    for page in pages.iter().skip(1).chain(more.iter()) {
        assert_eq!(image(&restored, *page)?, image(&primary, *page)?);
    }
    let stats = restored.stats();
    assert_eq!(stats.next_page, primary.stats().next_page);
    // The page freed last is free right away in the copy.
    assert_eq!(stats.pending_free_pages, 0);
    assert!(restored.all_pages().free_pages.contains(&pages[0]));

    // The restored environment accepts new writes.
    let mut writer = restored.begin_write()?;
    writer.create_tree("after-restore")?;
    assert_eq!(writer.commit()?, primary.last_tx().next());
    Ok(())
}

#[test]
fn restore_refuses_existing_environment_and_truncated_streams() -> Result<()> {
    init_tracing();
    let primary = Environment::open_in_memory(options())?;
    write_rounds(&primary, 0..2)?;
    let mut stream = Vec::new();
    primary.backup(&mut stream)?;

    let occupied = tempdir()?;
    drop(Environment::open(occupied.path(), options())?);
    assert!(matches!(
        restore(&mut stream.as_slice(), occupied.path()),
        Err(StorageError::Invalid(_))
    ));

    let target = tempdir()?;
    let cut = &stream[..stream.len() - 100];
    let err = restore(&mut &cut[..], target.path()).unwrap_err();
    assert!(err.is_corruption(), "unexpected error {err}");

    let mut bad_magic = stream.clone();
    bad_magic[0] ^= 0xff;
    let err = restore(&mut bad_magic.as_slice(), tempdir()?.path()).unwrap_err();
    assert!(err.is_corruption());
    Ok(())
}

#[test]
fn incremental_backups_chain_onto_a_restored_copy() -> Result<()> {
    init_tracing();
    let primary = Environment::open_in_memory(options())?;
    write_rounds(&primary, 0..3)?;
    let mut full = Vec::new();
    primary.backup(&mut full)?;
    assert_eq!(primary.backup_bookmark().tx_id, TxId(3));

    let target = tempdir()?;
    restore(&mut full.as_slice(), target.path())?;
    let copy = Environment::open(target.path(), options())?;

    let pages = write_rounds(&primary, 3..6)?;
    let mut delta = Vec::new();
    let summary = primary.backup_incremental(&mut delta)?;
    assert_eq!(summary.last_tx, TxId(6));
    assert_eq!(&delta[..8], &INCREMENTAL_MAGIC);
    assert_eq!(primary.backup_bookmark().tx_id, TxId(6));

    assert_eq!(copy.apply_incremental(&mut delta.as_slice())?, TxId(6));
    for page in &pages {
        assert_eq!(image(&copy, *page)?, image(&primary, *page)?);
    }

    // Nothing new: an empty delta applies cleanly.
    let mut empty = Vec::new();
    assert_eq!(primary.backup_incremental(&mut empty)?.units, 0);
    assert_eq!(copy.apply_incremental(&mut empty.as_slice())?, TxId(6));

    // Replaying an old delta is refused.
    let err = copy.apply_incremental(&mut delta.as_slice()).unwrap_err();
    assert!(matches!(err, StorageError::InvalidOwned(_)));

    let pages = write_rounds(&primary, 6..8)?;
    let mut delta = Vec::new();
    primary.backup_incremental(&mut delta)?;
    assert_eq!(copy.apply_incremental(&mut delta.as_slice())?, TxId(8));
    assert_eq!(image(&copy, pages[1])?[PAGE_HDR_LEN], 7);
    assert_eq!(copy.begin_read()?.trees().len(), 8);
    Ok(())
}

#[test]
fn incremental_backup_requires_the_option() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(options().incremental_backup(false))?;
    write_rounds(&env, 0..1)?;
    let mut out = Vec::new();
    assert!(matches!(
        env.backup_incremental(&mut out),
        Err(StorageError::Invalid(_))
    ));
    assert!(out.is_empty());
    Ok(())
}
