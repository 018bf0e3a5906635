//! Leaf page: slotted layout holding sorted `(key, value)` cells.
//!
//! Header: `{type: u8, numCells: u16, freeStart: u16, freeEnd: u16}`, followed by a
//! forward-growing array of 2-byte cell pointers starting at `DATA_START`, and a
//! backward-growing heap of record cells `{keyLen: u16, valLen: u16, key, val}` ending
//! at `PAGE_SIZE`. Cell pointers are kept sorted in key order; the record heap is not.

use crate::error::{Error, PageOp, Result};
use crate::page::{PageBuf, PageType, read_u16, write_u16};
use crate::PAGE_SIZE;

const TYPE_OFF: usize = 0;
const NUM_CELLS_OFF: usize = 1;
const FREE_START_OFF: usize = 3;
const FREE_END_OFF: usize = 5;
pub const DATA_START: usize = 7;

pub fn init(buf: &mut PageBuf) {
    buf.fill(0);
    buf[TYPE_OFF] = PageType::Leaf as u8;
    write_u16(buf, NUM_CELLS_OFF, 0);
    write_u16(buf, FREE_START_OFF, DATA_START as u16);
    write_u16(buf, FREE_END_OFF, PAGE_SIZE as u16);
}

pub fn num_cells(buf: &PageBuf) -> u16 {
    read_u16(buf, NUM_CELLS_OFF)
}

pub fn free_start(buf: &PageBuf) -> u16 {
    read_u16(buf, FREE_START_OFF)
}

pub fn free_end(buf: &PageBuf) -> u16 {
    read_u16(buf, FREE_END_OFF)
}

fn set_num_cells(buf: &mut PageBuf, n: u16) {
    write_u16(buf, NUM_CELLS_OFF, n);
}

fn set_free_start(buf: &mut PageBuf, v: u16) {
    write_u16(buf, FREE_START_OFF, v);
}

fn set_free_end(buf: &mut PageBuf, v: u16) {
    write_u16(buf, FREE_END_OFF, v);
}

pub fn cell_pointer(buf: &PageBuf, i: u16) -> u16 {
    let off = DATA_START + i as usize * 2;
    read_u16(buf, off)
}

fn set_cell_pointer(buf: &mut PageBuf, i: u16, ptr: u16) {
    let off = DATA_START + i as usize * 2;
    write_u16(buf, off, ptr);
}

/// "Space used" as defined in the data model: `freeStart + (P - freeEnd)`.
pub fn space_used(buf: &PageBuf) -> usize {
    free_start(buf) as usize + (PAGE_SIZE - free_end(buf) as usize)
}

/// Decodes the cell at a heap offset into its key slice.
pub fn read_key(buf: &PageBuf, offset: u16) -> &[u8] {
    let pos = offset as usize;
    let key_len = read_u16(buf, pos) as usize;
    &buf[pos + 4..pos + 4 + key_len]
}

/// Decodes the cell at a heap offset into `(key, value)` slices.
pub fn read_record(buf: &PageBuf, offset: u16) -> (&[u8], &[u8]) {
    let pos = offset as usize;
    let key_len = read_u16(buf, pos) as usize;
    let val_len = read_u16(buf, pos + 2) as usize;
    let key_start = pos + 4;
    let val_start = key_start + key_len;
    (
        &buf[key_start..key_start + key_len],
        &buf[val_start..val_start + val_len],
    )
}

/// Binary search over cell pointers; returns the first index whose key is `>= key`,
/// or `numCells` if every key is smaller.
pub fn find_insert_index(buf: &PageBuf, key: &[u8]) -> u16 {
    let n = num_cells(buf);
    let (mut lo, mut hi) = (0u16, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let mid_key = read_key(buf, cell_pointer(buf, mid));
        if mid_key < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// The page's first key in sorted order. Used as the routing key duplicated into the
/// parent on a leaf split, and as the boundary key during borrow rebalancing.
pub fn min_key(buf: &PageBuf) -> &[u8] {
    read_key(buf, cell_pointer(buf, 0))
}

fn write_record(buf: &mut PageBuf, key: &[u8], val: &[u8]) -> Option<u16> {
    let record_len = 4 + key.len() + val.len();
    let new_free_start = free_start(buf) as usize + 2;
    let new_free_end = (free_end(buf) as usize).checked_sub(record_len)?;
    if new_free_start > new_free_end {
        return None;
    }

    let off = new_free_end;
    write_u16(buf, off, key.len() as u16);
    write_u16(buf, off + 2, val.len() as u16);
    buf[off + 4..off + 4 + key.len()].copy_from_slice(key);
    buf[off + 4 + key.len()..off + 4 + key.len() + val.len()].copy_from_slice(val);
    set_free_end(buf, off as u16);
    Some(off as u16)
}

fn insert_cell_pointer(buf: &mut PageBuf, idx: u16, ptr: u16) {
    let n = num_cells(buf);
    let mut j = n;
    while j > idx {
        let p = cell_pointer(buf, j - 1);
        set_cell_pointer(buf, j, p);
        j -= 1;
    }
    set_cell_pointer(buf, idx, ptr);
    set_num_cells(buf, n + 1);
    set_free_start(buf, (DATA_START + (n as usize + 1) * 2) as u16);
}

/// Inserts `(key, val)`. Rejects duplicates with [`Error::KeyExists`]; reports an
/// out-of-space condition as [`PageOp::Full`] without mutating the page.
pub fn insert(buf: &mut PageBuf, key: &[u8], val: &[u8]) -> Result<PageOp> {
    let idx = find_insert_index(buf, key);
    if idx < num_cells(buf) {
        let existing = read_key(buf, cell_pointer(buf, idx));
        if existing == key {
            return Err(Error::KeyExists);
        }
    }

    let before = *buf;
    match write_record(buf, key, val) {
        Some(off) => {
            insert_cell_pointer(buf, idx, off);
            Ok(PageOp::Done)
        }
        None => {
            *buf = before;
            Ok(PageOp::Full)
        }
    }
}

/// Removes the cell pointer for `key` (left-shifting the tail); the record body is
/// left in the heap until the next [`compact`]. Fails with [`Error::KeyNotFound`] if
/// `key` is absent.
pub fn delete(buf: &mut PageBuf, key: &[u8]) -> Result<()> {
    let idx = find_insert_index(buf, key);
    let n = num_cells(buf);
    if idx >= n || read_key(buf, cell_pointer(buf, idx)) != key {
        return Err(Error::KeyNotFound);
    }

    for j in idx..n - 1 {
        let p = cell_pointer(buf, j + 1);
        set_cell_pointer(buf, j, p);
    }
    set_num_cells(buf, n - 1);
    set_free_start(buf, (DATA_START + (n as usize - 1) * 2) as u16);
    Ok(())
}

/// Rebuilds the record heap in key order, reclaiming holes left by overwritten or
/// deleted cells.
pub fn compact(buf: &mut PageBuf) {
    let n = num_cells(buf);
    let records: Vec<(Vec<u8>, Vec<u8>)> = (0..n)
        .map(|i| {
            let (k, v) = read_record(buf, cell_pointer(buf, i));
            (k.to_vec(), v.to_vec())
        })
        .collect();

    set_free_end(buf, PAGE_SIZE as u16);
    for (i, (k, v)) in records.iter().enumerate() {
        let off = write_record(buf, k, v).expect("compact must not grow page contents");
        set_cell_pointer(buf, i as u16, off);
    }
}

/// All `(key, value)` pairs in sorted order. Used by the split path to redistribute
/// records between the original page and a freshly allocated right page.
pub fn all_records(buf: &PageBuf) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..num_cells(buf))
        .map(|i| {
            let (k, v) = read_record(buf, cell_pointer(buf, i));
            (k.to_vec(), v.to_vec())
        })
        .collect()
}

/// Rebuilds the page from scratch with exactly these records, already in sorted order.
/// Used after a split to re-populate both halves.
pub fn rebuild(buf: &mut PageBuf, records: &[(Vec<u8>, Vec<u8>)]) {
    init(buf);
    for (i, (k, v)) in records.iter().enumerate() {
        let off = write_record(buf, k, v).expect("rebuild must fit: caller pre-split records");
        insert_cell_pointer_fast(buf, i as u16, off);
    }
}

/// Like [`insert_cell_pointer`] but assumes pointers are appended in already-sorted
/// order (no shifting needed); used by [`rebuild`].
fn insert_cell_pointer_fast(buf: &mut PageBuf, idx: u16, ptr: u16) {
    set_cell_pointer(buf, idx, ptr);
    set_num_cells(buf, idx + 1);
    set_free_start(buf, (DATA_START + (idx as usize + 1) * 2) as u16);
}
