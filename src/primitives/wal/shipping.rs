use std::io::{ErrorKind, Read, Write};

use tracing::{debug, info, warn};

use super::header::{entry_crc, TransactionHeader, TX_HEADER_LEN};
use super::recovery::{parse_payload, RawSegment, SegmentWalker, Step};
use super::{Journal, JournalPage, TranslationTable};
use crate::primitives::io::{FileIo, MemoryIo};
use crate::types::{
    read_u32, read_u64, Checksum, Crc32Fast, JournalNumber, PageNumber, Result, StorageError, TxId,
};

/// One journal segment in replication form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShippedTransaction {
    /// Segment header as written to the journal.
    pub header: TransactionHeader,
    /// `header.crc` of the segment shipped before this one.
    pub previous_crc: u32,
    /// Running CRC of the compressed payload, seeded with `previous_crc`.
    pub crc: u32,
    /// Snappy-compressed data and freed-list pages.
    pub compressed: Vec<u8>,
}

impl ShippedTransaction {
    fn from_segment(segment: &RawSegment) -> Result<Self> {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&segment.payload)
            .map_err(|err| StorageError::InvalidOwned(format!("compress shipped payload: {err}")))?;
        let previous_crc = segment.header.previous_crc;
        Ok(Self {
            header: segment.header,
            previous_crc,
            crc: payload_crc(previous_crc, &compressed),
            compressed,
        })
    }

    /// Decompresses the payload, checking it against the header.
    pub fn payload(&self, page_size: usize) -> Result<Vec<u8>> {
        let payload = snap::raw::Decoder::new()
            .decompress_vec(&self.compressed)
            .map_err(|err| StorageError::CorruptionOwned(format!("shipped payload: {err}")))?;
        let expected = self.header.payload_pages(page_size) as usize * page_size;
        if payload.len() != expected {
            return Err(StorageError::Corruption("shipped payload length mismatch"));
        }
        Ok(payload)
    }
}

fn payload_crc(previous_crc: u32, compressed: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::with_initial(previous_crc);
    hasher.update(compressed);
    hasher.finalize()
}

impl Journal {
    /// Segments of every committed transaction after `after_tx`, in order.
    ///
    /// Fails when the files holding the start of that history were already
    /// retired, or when `previous_crc` does not match the chain.
    pub fn read_shipped(&self, after_tx: TxId, previous_crc: u32) -> Result<Vec<ShippedTransaction>> {
        let (files, cursor, last_tx) = {
            let state = self.state.read();
            (
                state.files_view.values().cloned().collect::<Vec<_>>(),
                state.cursor,
                state.last_tx,
            )
        };
        if after_tx >= last_tx {
            return Ok(Vec::new());
        }
        let page_size = self.page_size();
        let mut walker = SegmentWalker::new(files, page_size);
        let mut shipped: Vec<ShippedTransaction> = Vec::new();
        loop {
            let segment = match walker.next()? {
                Step::Segment(segment) => segment,
                Step::Invalid { .. } | Step::Done => break,
            };
            if segment.journal > cursor.journal
                || (segment.journal == cursor.journal && segment.position >= cursor.position)
            {
                break;
            }
            let header = segment.header;
            if header.tx_id <= after_tx || header.tx_id > last_tx {
                continue;
            }
            if shipped.is_empty() {
                if header.tx_id != after_tx.next() || header.segment != 0 {
                    break;
                }
                if header.previous_crc != previous_crc {
                    return Err(StorageError::InvalidOwned(format!(
                        "shipping chain mismatch after transaction {after_tx}"
                    )));
                }
            }
            if !segment.crc_ok {
                return Err(StorageError::CorruptionOwned(format!(
                    "journal entry for transaction {} fails its checksum",
                    header.tx_id
                )));
            }
            shipped.push(ShippedTransaction::from_segment(&segment)?);
        }
        match shipped.first() {
            Some(_) => {
                debug!(after_tx = after_tx.0, segments = shipped.len(), "journal.shipping.read");
                Ok(shipped)
            }
            None => Err(StorageError::InvalidOwned(format!(
                "journal history after transaction {after_tx} is not retained"
            ))),
        }
    }
}

/// A complete transaction accepted by a [`ShippingReceiver`].
#[derive(Clone, Debug)]
pub struct ReceivedTransaction {
    /// End segment header.
    pub header: TransactionHeader,
    /// Page images, located in the receiver's memory log.
    pub pages: Vec<(PageNumber, JournalPage)>,
    /// Pages the transaction freed.
    pub freed: Vec<PageNumber>,
}

/// Everything a receiver accepted.
pub struct ReceivedLog {
    /// Newest image of each received page.
    pub table: TranslationTable,
    /// Header of the last complete transaction.
    pub last_header: Option<TransactionHeader>,
    /// `header.crc` of the last accepted segment.
    pub last_crc: Option<u32>,
    /// Complete transactions, ascending.
    pub transactions: Vec<ReceivedTransaction>,
    page_size: usize,
    io: MemoryIo,
}

impl ReceivedLog {
    /// Reads an image referenced by the table or a received transaction.
    pub fn read_image(&self, slot: &JournalPage) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; slot.pages as usize * self.page_size];
        self.io
            .read_at(slot.position * self.page_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Newest received image of `page`.
    pub fn read_page(&self, page: PageNumber) -> Result<Option<Vec<u8>>> {
        self.table
            .get(&page)
            .map(|slot| self.read_image(slot))
            .transpose()
    }

    /// Last fully received transaction, or `None` when nothing new arrived.
    pub fn last_tx(&self) -> Option<TxId> {
        self.last_header.map(|header| header.tx_id)
    }
}

/// Validates shipped segments and lays them out in a memory-only log.
///
/// An entry is checked completely before anything is stored. The first
/// rejected entry stops the receiver; entries accepted before it stay.
pub struct ShippingReceiver {
    page_size: usize,
    last_tx: TxId,
    last_crc: Option<u32>,
    io: MemoryIo,
    next_position: u64,
    table: TranslationTable,
    pending: Vec<(TransactionHeader, Vec<(PageNumber, JournalPage)>, Vec<PageNumber>)>,
    transactions: Vec<ReceivedTransaction>,
    last_header: Option<TransactionHeader>,
    stopped: bool,
}

impl ShippingReceiver {
    /// Receiver continuing after `after_tx`. With `last_crc` set, the first
    /// new segment must chain from it.
    pub fn new(page_size: u32, after_tx: TxId, last_crc: Option<u32>) -> Self {
        Self {
            page_size: page_size as usize,
            last_tx: after_tx,
            last_crc,
            io: MemoryIo::new(),
            next_position: 0,
            table: TranslationTable::new(),
            pending: Vec::new(),
            transactions: Vec::new(),
            last_header: None,
            stopped: false,
        }
    }

    /// Last complete transaction accepted.
    pub fn last_tx(&self) -> TxId {
        self.last_tx
    }

    /// Validates and stores one segment.
    pub fn receive(&mut self, shipped: &ShippedTransaction) -> Result<()> {
        if self.stopped {
            return Err(StorageError::Invalid("shipping receiver stopped after a rejected entry"));
        }
        match self.accept(shipped) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stopped = true;
                warn!(tx_id = shipped.header.tx_id.0, error = %err, "shipping.entry.rejected");
                Err(err)
            }
        }
    }

    fn accept(&mut self, shipped: &ShippedTransaction) -> Result<()> {
        let header = shipped.header;
        if payload_crc(shipped.previous_crc, &shipped.compressed) != shipped.crc {
            return Err(StorageError::CorruptionOwned(format!(
                "shipped transaction {} fails its payload checksum",
                header.tx_id
            )));
        }
        if header.previous_crc != shipped.previous_crc
            || self.last_crc.is_some_and(|crc| crc != shipped.previous_crc)
        {
            return Err(StorageError::CorruptionOwned(format!(
                "shipped transaction {} breaks the checksum chain",
                header.tx_id
            )));
        }
        let payload = shipped.payload(self.page_size)?;
        let mut header_page = vec![0u8; self.page_size];
        header.encode(&mut header_page)?;
        if entry_crc(&header_page, &[&payload]) != header.crc {
            return Err(StorageError::CorruptionOwned(format!(
                "shipped transaction {} fails its entry checksum",
                header.tx_id
            )));
        }

        if header.tx_id <= self.last_tx && self.pending.is_empty() {
            self.last_crc = Some(header.crc);
            return Ok(());
        }
        let follows = match self.pending.first() {
            Some((first, _, _)) => {
                first.tx_id == header.tx_id && header.segment as usize == self.pending.len()
            }
            None => header.tx_id == self.last_tx.next() && header.segment == 0,
        };
        if !follows {
            return Err(StorageError::InvalidOwned(format!(
                "shipped transaction {} segment {} out of sequence after {}",
                header.tx_id, header.segment, self.last_tx
            )));
        }

        let segment = RawSegment {
            index: 0,
            journal: JournalNumber(0),
            position: self.next_position,
            header,
            payload,
            crc_ok: true,
        };
        let (pages, freed) = parse_payload(&segment, self.page_size)?;
        let base = self.next_position * self.page_size as u64;
        self.io.write_at(base, &header_page)?;
        self.io
            .write_at(base + self.page_size as u64, &segment.payload)?;
        self.next_position = segment.end_position(self.page_size);
        self.last_crc = Some(header.crc);
        self.pending.push((header, pages, freed));

        if header.is_end() {
            let mut all_pages = Vec::new();
            let mut all_freed = Vec::new();
            for (_, pages, freed) in self.pending.drain(..) {
                all_pages.extend(pages);
                all_freed.extend(freed);
            }
            for (page, slot) in &all_pages {
                self.table.insert(*page, *slot);
            }
            self.transactions.push(ReceivedTransaction {
                header,
                pages: all_pages,
                freed: all_freed,
            });
            self.last_tx = header.tx_id;
            self.last_header = Some(header);
            debug!(tx_id = header.tx_id.0, "shipping.entry.accepted");
        }
        Ok(())
    }

    /// Ends reception. Segments of an unfinished transaction are dropped.
    pub fn finish(self) -> ReceivedLog {
        if !self.pending.is_empty() {
            debug!(segments = self.pending.len(), "shipping.incomplete_tail");
        }
        info!(
            transactions = self.transactions.len(),
            pages = self.table.len(),
            "shipping.received"
        );
        ReceivedLog {
            table: self.table,
            last_header: self.last_header,
            last_crc: self.last_crc,
            transactions: self.transactions,
            page_size: self.page_size,
            io: self.io,
        }
    }
}

fn map_eof(err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::UnexpectedEof {
        StorageError::Corruption("shipped stream truncated")
    } else {
        StorageError::Io(err)
    }
}

/// Writes shipped segments as a length-prefixed stream.
pub fn encode_shipped_stream<W: Write>(out: &mut W, entries: &[ShippedTransaction]) -> Result<()> {
    out.write_all(&(entries.len() as u64).to_be_bytes())?;
    let mut header = [0u8; TX_HEADER_LEN];
    for entry in entries {
        entry.header.encode(&mut header)?;
        out.write_all(&header)?;
        out.write_all(&entry.previous_crc.to_be_bytes())?;
        out.write_all(&entry.crc.to_be_bytes())?;
        out.write_all(&(entry.compressed.len() as u32).to_be_bytes())?;
        out.write_all(&entry.compressed)?;
    }
    Ok(())
}

/// Reads a stream written by [`encode_shipped_stream`].
pub fn decode_shipped_stream<R: Read>(input: &mut R) -> Result<Vec<ShippedTransaction>> {
    let mut count = [0u8; 8];
    input.read_exact(&mut count).map_err(map_eof)?;
    let count = read_u64(&count, 0);
    let mut entries = Vec::new();
    let mut header = [0u8; TX_HEADER_LEN];
    let mut fixed = [0u8; 12];
    for _ in 0..count {
        input.read_exact(&mut header).map_err(map_eof)?;
        input.read_exact(&mut fixed).map_err(map_eof)?;
        // The length prefix is untrusted; buffer only what actually arrives.
        let len = read_u32(&fixed, 8) as u64;
        let mut compressed = Vec::new();
        input.by_ref().take(len).read_to_end(&mut compressed)?;
        if compressed.len() as u64 != len {
            return Err(StorageError::Corruption("shipped stream truncated"));
        }
        entries.push(ShippedTransaction {
            header: TransactionHeader::decode(&header)?,
            previous_crc: read_u32(&fixed, 0),
            crc: read_u32(&fixed, 4),
            compressed,
        });
    }
    Ok(entries)
}
