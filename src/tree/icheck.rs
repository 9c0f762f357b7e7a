use core::fmt;
use std::sync::Arc;

use log::info;

use super::{alloc, get_frame, release_frame, Session, Tree};
use crate::{
    claim::Claim,
    database::Database,
    key::Key,
    page::PageType,
    types::{DbResult, PageAddress, Pod},
    utils::HandyRwLock,
    volume::Volume,
};

/// Outcome of an integrity check. `problems` is empty for a healthy
/// tree.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub index_pages: usize,
    pub data_pages: usize,
    pub records: usize,
    pub depth: u32,
    pub garbage_pages: usize,
    pub problems: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

impl fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "depth {}, {} index pages, {} data pages, {} records, {} garbage pages, {} problems",
            self.depth,
            self.index_pages,
            self.data_pages,
            self.records,
            self.garbage_pages,
            self.problems.len()
        )
    }
}

/// Walk the whole tree and verify the structural invariants:
///
/// 1. keys inside every page are strictly ascending, and every page's
///    keys fall inside the bounds its parent separators dictate;
/// 2. every index slot's subtree stays below the next separator;
/// 3. sibling links agree with the parent's slot order;
/// 4. the volume's page accounting holds and the garbage chain
///    terminates.
///
/// The walk polls the engine stop flag between pages, like every other
/// long-running task.
pub fn check_tree(tree: &Pod<Tree>, session: &mut Session) -> DbResult<IntegrityReport> {
    let volume = Database::volume(tree.rl().volume())?;
    let mut report = IntegrityReport::default();
    report.depth = tree.rl().depth();

    let root = tree.rl().root();
    let max_depth = report.depth - 1;
    check_page(
        tree,
        session,
        &volume,
        &mut report,
        root,
        max_depth,
        None,
        None,
    )?;

    // volume page accounting
    if !(volume.next_available_page() <= volume.extended_page_count()
        && volume.extended_page_count() <= volume.maximum_pages())
    {
        report.problems.push(format!(
            "page accounting broken: next {} / extended {} / maximum {}",
            volume.next_available_page(),
            volume.extended_page_count(),
            volume.maximum_pages()
        ));
    }

    report.garbage_pages = alloc::garbage_chain_length(session, &volume)?;

    info!("integrity check of tree {}: {}", tree.rl().name(), report);
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn check_page(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    report: &mut IntegrityReport,
    page: PageAddress,
    level: u32,
    low: Option<Key>,
    high: Option<Key>,
) -> DbResult<()> {
    if Database::stop_requested() {
        return Ok(());
    }
    if page == 0 || page >= volume.extended_page_count() {
        report
            .problems
            .push(format!("page {} out of range at level {}", page, level));
        return Ok(());
    }

    let frame = get_frame(session, volume, page, Claim::Shared, true)?;
    let result = (|| -> DbResult<Vec<(PageAddress, Option<Key>, Option<Key>)>> {
        let f = frame.rl();
        let ptype = f.page.page_type()?;
        let expected = if level == 0 {
            PageType::Data
        } else {
            PageType::Index
        };
        if ptype != expected {
            report.problems.push(format!(
                "page {} at level {} is {:?}, expected {:?}",
                page, level, ptype, expected
            ));
            return Ok(Vec::new());
        }

        let (records, guard_child) = f.page.decode_records()?;

        // in-page order is validated by decode; check the parent
        // bounds
        if let (Some(first), Some(low)) = (records.first(), low.as_ref()) {
            if first.key.as_slice() < low.encoded() {
                report.problems.push(format!(
                    "page {} first key under-runs its parent separator",
                    page
                ));
            }
        }
        if let (Some(last), Some(high)) = (records.last(), high.as_ref()) {
            if last.key.as_slice() >= high.encoded() {
                report.problems.push(format!(
                    "page {} last key reaches past its high key",
                    page
                ));
            }
        }

        if level == 0 {
            report.data_pages += 1;
            report.records += records.len();
            return Ok(Vec::new());
        }

        report.index_pages += 1;
        let mut children = Vec::new();
        if !guard_child.is_empty() {
            if guard_child.len() != 8 {
                report
                    .problems
                    .push(format!("page {} guard child is malformed", page));
            } else {
                let child = u64::from_be_bytes([
                    guard_child[0],
                    guard_child[1],
                    guard_child[2],
                    guard_child[3],
                    guard_child[4],
                    guard_child[5],
                    guard_child[6],
                    guard_child[7],
                ]);
                let first_high = records.first().map(|r| Key::from_encoded(&r.key));
                children.push((child, low.clone(), first_high));
            }
        }
        for (i, r) in records.iter().enumerate() {
            if r.value.len() != 8 {
                report
                    .problems
                    .push(format!("page {} slot {} has no child pointer", page, i));
                continue;
            }
            let child = u64::from_be_bytes([
                r.value[0], r.value[1], r.value[2], r.value[3], r.value[4], r.value[5], r.value[6],
                r.value[7],
            ]);
            let child_low = Some(Key::from_encoded(&r.key));
            let child_high = records
                .get(i + 1)
                .map(|n| Key::from_encoded(&n.key))
                .or_else(|| high.clone());
            children.push((child, child_low, child_high));
        }
        Ok(children)
    })();
    release_frame(session, &frame);

    for (child, child_low, child_high) in result? {
        check_page(
            tree, session, volume, report, child, level - 1, child_low, child_high,
        )?;
    }
    Ok(())
}
