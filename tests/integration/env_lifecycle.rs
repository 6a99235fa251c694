#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fs;
use std::sync::Once;
use std::time::Duration;

use stratum::primitives::pager::Synchronous;
use stratum::storage::DATA_FILE_NAME;
use stratum::types::page::PAGE_HDR_LEN;
use stratum::{EnvOptions, Environment, PageNumber, Result, StorageError, TreeHeader, TxId};
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
    EnvOptions::from_toml_str(
        r#"
        page_size = 2048
        journal_file_pages = 32
        synchronous = "normal"
        "#,
    )
    .expect("valid options")
    .flush_interval(None)
}

#[test]
fn create_reopen_and_grow() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (blob, root) = {
        let env = Environment::open(dir.path(), options())?;
        assert_eq!(env.path(), Some(dir.path()));
        assert_eq!(env.last_tx(), TxId(0));
        assert!(dir.path().join(DATA_FILE_NAME).exists());

        let mut writer = env.begin_write()?;
        let tree = writer.create_tree("accounts")?;
        let blob = {
            let mut run = writer.allocate_page(4)?;
            let payload = run.payload_mut();
            for (idx, byte) in payload.iter_mut().enumerate() {
                *byte = (idx % 251) as u8;
            }
            run.number()
        };
        writer.modify_page(tree.root_page)?.payload_mut()[..5].copy_from_slice(b"hello");
        writer.set_tree_header(
            "accounts",
            TreeHeader {
                entries: 1,
                overflow_pages: 4,
                ..tree
            },
        )?;
        assert_eq!(writer.commit()?, TxId(1));
        env.close()?;
        (blob, tree.root_page)
    };

    let env = Environment::open(dir.path(), options())?;
    assert_eq!(env.last_tx(), TxId(1));
    let reader = env.begin_read()?;
    let tree = reader.get_tree("accounts")?;
    assert_eq!(tree.root_page, root);
    assert_eq!(tree.entries, 1);
    assert_eq!(&reader.read_page(root)?[PAGE_HDR_LEN..PAGE_HDR_LEN + 5], b"hello");
    let run = reader.read_page(blob)?;
    assert_eq!(run.len(), 4 * 2048);
    assert!(run[PAGE_HDR_LEN..]
        .iter()
        .enumerate()
        .all(|(idx, byte)| *byte == (idx % 251) as u8));
    drop(reader);

    // Enough pages to force the data file and the bitmap to grow.
    let mut writer = env.begin_write()?;
    for _ in 0..200 {
        writer.allocate_page(1)?;
    }
    writer.commit()?;
    assert!(env.stats().next_page.0 >= 200);
    assert_eq!(env.flush()?, Some(TxId(2)));
    assert_eq!(env.stats().unflushed_transactions, 0);
    assert_eq!(env.all_pages().free_space_pages.len(), 1);
    Ok(())
}

#[test]
fn stats_and_inventory_account_for_every_page() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(options())?;
    let mut writer = env.begin_write()?;
    let mut pages = Vec::new();
    for idx in 0..6 {
        writer.create_tree(&format!("tree-{idx}"))?;
        pages.push(writer.allocate_page(1)?.number());
    }
    writer.commit()?;
    let mut writer = env.begin_write()?;
    writer.free_page(pages[0])?;
    writer.free_page(pages[1])?;
    writer.delete_tree("tree-5")?;
    writer.commit()?;
    let reader = env.begin_read()?;
    let mut writer = env.begin_write()?;
    writer.free_page(pages[2])?;
    writer.commit()?;

    let stats = env.stats();
    assert_eq!(stats.root_pages, 5);
    assert_eq!(stats.last_tx, TxId(3));
    assert_eq!(stats.active_transactions, 1);
    assert_eq!(stats.oldest_active, TxId(2));
    assert_eq!(stats.free_pages, 2);
    assert_eq!(stats.pending_free_pages, 1);

    let inventory = env.all_pages();
    assert_eq!(inventory.header_pages, vec![PageNumber(0), PageNumber(1)]);
    assert_eq!(
        stats.overhead_pages,
        (inventory.header_pages.len()
            + inventory.free_space_pages.len()
            + inventory.catalog_pages.len()) as u64
    );
    assert_eq!(inventory.trees.len(), 5);
    assert_eq!(inventory.pending_free, vec![pages[2]]);

    // No page is claimed twice.
    let mut seen = BTreeSet::new();
    let claimed = inventory
        .header_pages
        .iter()
        .chain(&inventory.free_space_pages)
        .chain(&inventory.catalog_pages)
        .chain(&inventory.free_pages)
        .chain(&inventory.pending_free);
    for page in claimed {
        assert!(seen.insert(*page), "page {page} claimed twice");
    }
    for (_, tree) in &inventory.trees {
        assert!(seen.insert(tree.root_page));
    }
    drop(reader);

    let readers = env.readers();
    assert_eq!(readers.active, 0);
    Ok(())
}

#[test]
fn background_flush_drains_the_journal() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let options = options().flush_interval(Some(Duration::from_millis(5)));
    let env = Environment::open(dir.path(), options)?;
    for _ in 0..10 {
        let mut writer = env.begin_write()?;
        writer.allocate_page(1)?;
        writer.commit()?;
    }
    let mut waited = 0;
    while env.stats().unflushed_transactions > 0 && waited < 400 {
        std::thread::sleep(Duration::from_millis(5));
        waited += 1;
    }
    assert_eq!(env.stats().unflushed_transactions, 0);
    Ok(())
}

#[test]
fn open_rejects_bad_options_and_orphaned_journals() -> Result<()> {
    init_tracing();
    assert!(EnvOptions::from_toml_str("page_size = 1000").is_err());
    let dir = tempdir()?;
    assert!(Environment::open(dir.path(), EnvOptions::default().journal_file_pages(1)).is_err());

    {
        let env = Environment::open(dir.path(), options().synchronous(Synchronous::Full))?;
        let mut writer = env.begin_write()?;
        writer.allocate_page(1)?;
        writer.commit()?;
        std::mem::forget(env);
    }
    fs::remove_file(dir.path().join(DATA_FILE_NAME))?;
    assert!(matches!(
        Environment::open(dir.path(), options()),
        Err(StorageError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn options_load_from_a_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("stratum.toml");
    fs::write(
        &path,
        "page_size = 4096\nflush_interval_ms = 50\nincremental_backup = true\n",
    )?;
    let options = EnvOptions::load(&path)?;
    assert_eq!(options.page_size, 4096);
    assert_eq!(options.flush_interval_ms, Some(50));
    assert!(options.incremental_backup);
    assert_eq!(options.synchronous, Synchronous::Full);
    Ok(())
}

fn assert_interior(writer: &mut stratum::Transaction, page: PageNumber, first: PageNumber) {
    let expected = format!("page {page} is inside the overflow run starting at {first}");
    let errors = [
        writer.read_page(page).map(drop).unwrap_err(),
        writer.modify_page(page).map(drop).unwrap_err(),
        writer.free_page(page).unwrap_err(),
    ];
    for err in errors {
        assert!(!err.is_corruption(), "interior page reported as corruption: {err}");
        match err {
            StorageError::InvalidOwned(message) => assert_eq!(message, expected),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

#[test]
fn interior_run_pages_are_rejected_as_misuse() -> Result<()> {
    init_tracing();
    let env = Environment::open_in_memory(options())?;
    let mut writer = env.begin_write()?;
    let flushed = writer.allocate_page(3)?.number();
    writer.commit()?;
    assert_eq!(env.flush()?, Some(TxId(1)));

    let mut writer = env.begin_write()?;
    let journaled = writer.allocate_page(4)?.number();
    writer.commit()?;

    let mut writer = env.begin_write()?;
    let staged = writer.allocate_page(2)?.number();
    assert_interior(&mut writer, staged.offset(1), staged);
    assert_interior(&mut writer, journaled.offset(2), journaled);
    assert_interior(&mut writer, flushed.offset(1), flushed);
    assert_interior(&mut writer, flushed.offset(2), flushed);

    // The run starts themselves are untouched by the rejected calls.
    assert_eq!(writer.read_page(flushed)?.len(), 3 * 2048);
    writer.free_page(journaled)?;
    writer.commit()?;
    let reader = env.begin_read()?;
    assert_eq!(reader.read_page(staged)?.len(), 2 * 2048);
    assert!(!reader.read_page(flushed.offset(1)).unwrap_err().is_corruption());
    Ok(())
}
