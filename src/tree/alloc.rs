use std::sync::Arc;

use log::{debug, trace};

use super::{get_frame, release_frame, Session};
use crate::{
    claim::Claim,
    database::Database,
    page::PageType,
    types::{Completion, DbResult, PageAddress},
    utils::HandyRwLock,
    volume::Volume,
};

/// Claim a page for new content: the head of the garbage chain when
/// one is available, otherwise the tail of the volume (extending the
/// file as needed).
pub(crate) fn allocate_page(session: &Session, volume: &Arc<Volume>) -> DbResult<PageAddress> {
    {
        let _guard = volume.lock_garbage_chain();
        let head = volume.garbage_root();
        if head != 0 {
            volume.check_page_address(head)?;
            let frame = get_frame(session, volume, head, Claim::Exclusive, true)?;
            let result = (|| {
                let f = frame.rl();
                if f.page.page_type()? != PageType::Garbage {
                    return Err(volume.mark_corrupt(&format!(
                        "garbage chain head {} is a {:?} page",
                        head,
                        f.page.page_type()?
                    )));
                }
                Ok(f.page.right_sibling())
            })();
            match result {
                Ok(next) => {
                    volume.set_garbage_root(next);
                    release_frame(session, &frame);
                    trace!("page {} reused from the garbage chain", head);
                    return Ok(head);
                }
                Err(e) => {
                    release_frame(session, &frame);
                    return Err(e);
                }
            }
        }
    }

    volume.allocate_tail_page()
}

/// Return one page to the garbage chain: stamp it, link it in front of
/// the current head, and journal its new image.
pub(crate) fn deallocate_page(
    session: &Session,
    volume: &Arc<Volume>,
    page: PageAddress,
) -> Completion {
    volume.check_page_address(page)?;
    let ts = Database::allocate_timestamp();

    let _guard = volume.lock_garbage_chain();
    let head = volume.garbage_root();

    let frame = get_frame(session, volume, page, Claim::Exclusive, false)?;
    Database::write_page_on_checkpoint(&frame, ts)?;
    {
        let mut f = frame.wl();
        f.page.init_as(PageType::Garbage, page);
        f.page.set_right_sibling(head);
        f.mark_dirty(ts);
        f.bump_generation();
    }
    release_frame(session, &frame);

    volume.set_garbage_root(page);
    debug!("page {} linked onto the garbage chain", page);
    Ok(())
}

/// Return a batch of pages, preserving the order they were collected
/// in. Join operations use this for the span of physical pages between
/// the surviving left and right frames.
pub(crate) fn deallocate_pages(
    session: &Session,
    volume: &Arc<Volume>,
    pages: &[PageAddress],
) -> Completion {
    for page in pages {
        deallocate_page(session, volume, *page)?;
    }
    Ok(())
}

/// Number of pages currently linked on the garbage chain. Used by the
/// integrity checker and tests; bounded to catch cycles.
pub fn garbage_chain_length(session: &Session, volume: &Arc<Volume>) -> DbResult<usize> {
    let mut count = 0;
    let mut page = volume.garbage_root();
    let bound = volume.extended_page_count() as usize + 1;

    while page != 0 {
        volume.check_page_address(page)?;
        let frame = get_frame(session, volume, page, Claim::Shared, true)?;
        let next = {
            let f = frame.rl();
            if f.page.page_type()? != PageType::Garbage {
                release_frame(session, &frame);
                return Err(volume.mark_corrupt(&format!(
                    "garbage chain holds a non-garbage page at {}",
                    page
                )));
            }
            f.page.right_sibling()
        };
        release_frame(session, &frame);

        count += 1;
        if count > bound {
            return Err(volume.mark_corrupt("garbage chain does not terminate"));
        }
        page = next;
    }
    Ok(count)
}
