#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use stratum::types::page::PAGE_HDR_LEN;
use stratum::{EnvOptions, Environment, PageNumber, Result, TxId};
use tempfile::tempdir;
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
        .journal_file_pages(256)
        .flush_interval(None)
}

fn journal_files(dir: &Path) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "journal") {
            let bytes = fs::read(&path)?;
            files.insert(path, bytes);
        }
    }
    Ok(files)
}

fn write_counter(env: &Environment, page: PageNumber, value: u64) -> Result<TxId> {
    let mut writer = env.begin_write()?;
    writer.modify_page(page)?.payload_mut()[..8].copy_from_slice(&value.to_be_bytes());
    writer.commit()
}

fn read_counter(env: &Environment, page: PageNumber) -> Result<u64> {
    let image = env.begin_read()?.read_page(page)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[PAGE_HDR_LEN..PAGE_HDR_LEN + 8]);
    Ok(u64::from_be_bytes(bytes))
}

#[test]
fn committed_transactions_survive_without_flush() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let page = {
        let env = Environment::open(dir.path(), options())?;
        let mut writer = env.begin_write()?;
        let page = writer.allocate_page(1)?.number();
        writer.commit()?;
        for value in 1..=5 {
            write_counter(&env, page, value)?;
        }
        assert_eq!(env.stats().unflushed_transactions, 6);
        // Simulated crash: no flush, no header update.
        std::mem::forget(env);
        page
    };

    let env = Environment::open(dir.path(), options())?;
    assert_eq!(env.last_tx(), TxId(6));
    assert_eq!(read_counter(&env, page)?, 5);
    assert_eq!(write_counter(&env, page, 6)?, TxId(7));
    env.close()?;

    let env = Environment::open(dir.path(), options())?;
    assert_eq!(env.last_tx(), TxId(7));
    assert_eq!(read_counter(&env, page)?, 6);
    Ok(())
}

#[test]
fn torn_tail_entry_is_discarded() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let committed = 4u64;
    let page = {
        let env = Environment::open(dir.path(), options())?;
        let mut writer = env.begin_write()?;
        let page = writer.allocate_page(1)?.number();
        writer.commit()?;
        for value in 1..committed {
            write_counter(&env, page, value)?;
        }
        let before = journal_files(dir.path())?;
        write_counter(&env, page, 99)?;
        let after = journal_files(dir.path())?;
        std::mem::forget(env);

        // Keep the header page of the last entry and zero its payload.
        let mut torn = 0;
        for (path, bytes) in &after {
            let old = before.get(path).cloned().unwrap_or_default();
            let Some(first_diff) = (0..bytes.len()).find(|&i| old.get(i) != Some(&bytes[i]))
            else {
                continue;
            };
            let header_start = first_diff / PAGE_SIZE as usize * PAGE_SIZE as usize;
            let mut damaged = bytes.clone();
            let payload_start = (header_start + PAGE_SIZE as usize).min(damaged.len());
            damaged[payload_start..].iter_mut().for_each(|b| *b = 0);
            fs::write(path, &damaged)?;
            torn += 1;
        }
        assert_eq!(torn, 1, "the last commit should touch exactly one journal file");
        page
    };

    let env = Environment::open(dir.path(), options())?;
    assert_eq!(env.last_tx(), TxId(committed));
    assert_eq!(read_counter(&env, page)?, committed - 1);

    // The discarded id is reused by the next commit.
    assert_eq!(write_counter(&env, page, 7)?, TxId(committed + 1));
    env.close()?;
    let env = Environment::open(dir.path(), options())?;
    assert_eq!(read_counter(&env, page)?, 7);
    Ok(())
}

#[test]
fn journal_rollover_spans_multiple_files() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let options = options().journal_file_pages(16);
    let page = {
        let env = Environment::open(dir.path(), options.clone())?;
        let mut writer = env.begin_write()?;
        let page = writer.allocate_page(1)?.number();
        writer.commit()?;
        // Large runs force split entries across files.
        for round in 0..6u8 {
            let mut writer = env.begin_write()?;
            writer.allocate_page(6)?.payload_mut()[0] = round;
            writer.modify_page(page)?.payload_mut()[..8]
                .copy_from_slice(&(round as u64).to_be_bytes());
            writer.commit()?;
        }
        assert!(journal_files(dir.path())?.len() > 1);
        std::mem::forget(env);
        page
    };

    let env = Environment::open(dir.path(), options)?;
    assert_eq!(env.last_tx(), TxId(7));
    assert_eq!(read_counter(&env, page)?, 5);
    assert_eq!(env.flush()?, Some(TxId(7)));
    assert_eq!(env.stats().unflushed_transactions, 0);
    Ok(())
}
