use std::sync::Arc;

use log::{debug, trace};

use super::{alloc, get_frame, release_frame, Session};
use crate::{
    claim::Claim,
    database::Database,
    error::DbError,
    page::{Page, PageType},
    types::{DbResult, Timestamp, Completion},
    utils::HandyRwLock,
    value::{LongRecordDescriptor, MAX_LONG_RECORD_CHAIN},
    volume::Volume,
};

/// Build the chain for an oversized value: pre-allocate every page,
/// fill them back to front (the head page is written last), and
/// journal each image before the caller touches the containing leaf.
/// The journal is forced before this returns, so a later `TX` envelope
/// referencing the descriptor can always be reconstructed from the
/// journal alone.
pub(crate) fn write_long_record(
    session: &mut Session,
    volume: &Arc<Volume>,
    value: &[u8],
    ts: Timestamp,
) -> DbResult<LongRecordDescriptor> {
    let _op = Database::enter_op();
    let capacity = Page::long_payload_capacity(volume.page_size());
    let pages = (value.len() + capacity - 1) / capacity;
    if pages == 0 || pages > MAX_LONG_RECORD_CHAIN {
        return Err(DbError::validation(&format!(
            "value of {} bytes needs {} chain pages (bound {})",
            value.len(),
            pages,
            MAX_LONG_RECORD_CHAIN
        )));
    }

    let mut chain = Vec::with_capacity(pages);
    for _ in 0..pages {
        chain.push(alloc::allocate_page(session, volume)?);
    }

    for index in (0..pages).rev() {
        let address = chain[index];
        let next = if index + 1 < pages { chain[index + 1] } else { 0 };
        let start = index * capacity;
        let end = (start + capacity).min(value.len());

        let frame = get_frame(session, volume, address, Claim::Exclusive, false)?;
        Database::write_page_on_checkpoint(&frame, ts)?;
        {
            let mut f = frame.wl();
            f.page.init_as(PageType::LongRecord, address);
            f.page.set_right_sibling(next);
            f.page.set_long_payload(&value[start..end]);
            f.page.set_timestamp(ts);

            let key = crate::types::PageKey::new(volume.handle(), address);
            Database::mut_journal().write_page(key, ts, f.page.bytes())?;
            f.mark_journaled(ts);
        }
        release_frame(session, &frame);
        trace!("long-record page {} holds bytes {}..{}", address, start, end);
    }

    Database::mut_journal().force()?;
    debug!(
        "long record of {} bytes written as a {}-page chain at {}",
        value.len(),
        pages,
        chain[0]
    );
    Ok(LongRecordDescriptor::new(
        value.len() as u32,
        chain[0],
        value,
    ))
}

/// Walk the chain forward, appending payload bytes until at least
/// `min_bytes` (or the whole record when `min_bytes` covers it) have
/// been gathered. Partial reads are permitted; a chain longer than the
/// bound, or one that ends early, is corruption.
pub(crate) fn read_long_record(
    session: &Session,
    volume: &Arc<Volume>,
    descriptor: &LongRecordDescriptor,
    min_bytes: usize,
) -> DbResult<Vec<u8>> {
    let total = descriptor.total_size as usize;
    let want = if min_bytes == 0 { total } else { min_bytes.min(total) };

    let mut out = Vec::with_capacity(want);
    let mut page = descriptor.head_page;
    let mut hops = 0;

    while out.len() < want {
        if page == 0 {
            return Err(volume.mark_corrupt(&format!(
                "long-record chain ended after {} of {} bytes",
                out.len(),
                total
            )));
        }
        hops += 1;
        if hops > MAX_LONG_RECORD_CHAIN {
            return Err(volume.mark_corrupt(&format!(
                "long-record chain exceeds {} pages",
                MAX_LONG_RECORD_CHAIN
            )));
        }
        volume.check_page_address(page)?;

        let frame = get_frame(session, volume, page, Claim::Shared, true)?;
        let next = {
            let f = frame.rl();
            if f.page.page_type()? != PageType::LongRecord {
                release_frame(session, &frame);
                return Err(volume.mark_corrupt(&format!(
                    "long-record chain reached a non-chain page at {}",
                    page
                )));
            }
            let payload = f.page.long_payload();
            let take = payload.len().min(total - out.len());
            out.extend_from_slice(&payload[..take]);
            f.page.right_sibling()
        };
        release_frame(session, &frame);
        page = next;
    }

    Ok(out)
}

/// Return a chain to the garbage list (failed leaf insert, removed or
/// replaced long value).
pub(crate) fn free_chain(
    session: &Session,
    volume: &Arc<Volume>,
    descriptor: &LongRecordDescriptor,
) -> Completion {
    let mut pages = Vec::new();
    let mut page = descriptor.head_page;

    while page != 0 {
        if pages.len() >= MAX_LONG_RECORD_CHAIN {
            return Err(volume.mark_corrupt(&format!(
                "long-record chain exceeds {} pages while freeing",
                MAX_LONG_RECORD_CHAIN
            )));
        }
        volume.check_page_address(page)?;
        let frame = get_frame(session, volume, page, Claim::Shared, true)?;
        let next = {
            let f = frame.rl();
            match f.page.page_type()? {
                PageType::LongRecord => f.page.right_sibling(),
                // already recycled; stop quietly
                _ => 0,
            }
        };
        release_frame(session, &frame);
        pages.push(page);
        page = next;
    }

    alloc::deallocate_pages(session, volume, &pages)?;
    debug!(
        "freed a {}-page long-record chain starting at {}",
        pages.len(),
        descriptor.head_page
    );
    Ok(())
}

/// Number of chain pages a value of `len` bytes occupies in a volume
/// with the given page size.
pub fn chain_length(len: usize, page_size: usize) -> usize {
    let capacity = Page::long_payload_capacity(page_size);
    (len + capacity - 1) / capacity
}
