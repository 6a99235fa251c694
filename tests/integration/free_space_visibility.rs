#![allow(missing_docs)]

use std::sync::Once;

use stratum::types::page::PAGE_HDR_LEN;
use stratum::{EnvOptions, Environment, PageNumber, Result};
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
}

fn allocate_three(env: &Environment) -> Result<[PageNumber; 3]> {
    let mut writer = env.begin_write()?;
    let mut pages = [PageNumber(0); 3];
    for (idx, slot) in pages.iter_mut().enumerate() {
        let mut page = writer.allocate_page(1)?;
        page.payload_mut()[0] = idx as u8 + 1;
        *slot = page.number();
    }
    writer.commit()?;
    Ok(pages)
}

#[test]
fn freed_page_waits_for_older_reader() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(options())?;
    let [_a, b, _c] = allocate_three(&env)?;
    assert_eq!(env.stats().free_pages, 0);

    let t3 = env.begin_read()?;
    let mut t2 = env.begin_write()?;
    t2.free_page(b)?;
    t2.commit()?;
    assert_eq!(env.stats().free_pages, 0);
    assert_eq!(env.stats().pending_free_pages, 1);

    // The old reader still sees B.
    assert_eq!(t3.read_page(b)?[PAGE_HDR_LEN], 2);

    // A commit while the reader is open must not release B.
    env.begin_write()?.commit()?;
    assert_eq!(env.stats().free_pages, 0);

    drop(t3);
    assert_eq!(env.stats().free_pages, 0);
    env.begin_write()?.commit()?;
    assert_eq!(env.stats().free_pages, 1);
    assert_eq!(env.stats().pending_free_pages, 0);
    assert_eq!(env.all_pages().free_pages, vec![b]);

    let mut writer = env.begin_write()?;
    assert_eq!(writer.allocate_page(1)?.number(), b);
    writer.commit()?;
    assert_eq!(env.stats().free_pages, 0);
    Ok(())
}

#[test]
fn freed_page_is_released_by_next_commit_without_readers() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(options())?;
    let [a, _b, c] = allocate_three(&env)?;

    let mut writer = env.begin_write()?;
    writer.free_page(a)?;
    writer.free_page(c)?;
    writer.commit()?;
    assert_eq!(env.stats().pending_free_pages, 2);

    env.begin_write()?.commit()?;
    assert_eq!(env.stats().free_pages, 2);
    let mut free = env.all_pages().free_pages;
    free.sort();
    assert_eq!(free, vec![a, c]);
    Ok(())
}

#[test]
fn disposed_writer_keeps_committed_bitmap() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(options())?;
    let [a, b, _c] = allocate_three(&env)?;
    let mut writer = env.begin_write()?;
    writer.free_page(a)?;
    writer.free_page(b)?;
    writer.commit()?;
    env.begin_write()?.commit()?;
    assert_eq!(env.stats().free_pages, 2);

    // Dirty the buffer of the next transaction, then walk away from it.
    {
        let mut writer = env.begin_write()?;
        writer.allocate_page(1)?;
        writer.allocate_page(1)?;
        writer.allocate_page(1)?;
    }
    assert_eq!(env.stats().free_pages, 2);

    let mut writer = env.begin_write()?;
    let first = writer.allocate_page(1)?.number();
    let second = writer.allocate_page(1)?.number();
    let mut reused = vec![first, second];
    reused.sort();
    assert_eq!(reused, vec![a, b]);
    writer.commit()?;
    assert_eq!(env.stats().free_pages, 0);
    Ok(())
}

#[test]
fn dirty_buffer_is_rebuilt_after_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (freed, next_page) = {
        let env = Environment::open(dir.path(), options())?;
        let pages = allocate_three(&env)?;
        let mut writer = env.begin_write()?;
        writer.free_page(pages[0])?;
        writer.free_page(pages[2])?;
        writer.commit()?;
        env.begin_write()?.commit()?;

        let mut writer = env.begin_write()?;
        writer.allocate_page(2)?;
        writer.allocate_page(1)?;
        let next_page = env.stats().next_page;
        drop(writer);
        env.close()?;
        (vec![pages[0], pages[2]], next_page)
    };

    let env = Environment::open(dir.path(), options())?;
    let stats = env.stats();
    assert_eq!(stats.free_pages, 2);
    assert_eq!(stats.next_page, next_page);
    let mut free = env.all_pages().free_pages;
    free.sort();
    assert_eq!(free, freed);
    Ok(())
}
