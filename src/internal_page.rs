//! Internal page: slotted layout holding separator keys and child pointers.
//!
//! Header: `{type: u8, numKeys: u16, freeStart: u16, freeEnd: u16, rightmostChild: u32}`,
//! followed by a fixed-size child-pointer array of `MAX_CHILDREN` u32 slots, then a
//! forward-growing array of 2-byte key pointers, then a backward-growing heap of
//! separator-key cells `{keyLen: u16, keyBytes}`. A node with K keys has K+1 children:
//! `children[0..K-1]` (the fixed array) plus `rightmostChild`.

use crate::error::{PageOp, Result};
use crate::page::{PageBuf, PageId, PageType, read_u16, read_u32, write_u16, write_u32};
use crate::{MAX_CHILDREN, PAGE_SIZE};

const TYPE_OFF: usize = 0;
const NUM_KEYS_OFF: usize = 1;
const FREE_START_OFF: usize = 3;
const FREE_END_OFF: usize = 5;
const RIGHTMOST_CHILD_OFF: usize = 7;
const CHILD_ARRAY_OFF: usize = 11;
pub const DATA_START: usize = CHILD_ARRAY_OFF + MAX_CHILDREN * 4;

pub fn init(buf: &mut PageBuf, rightmost_child: PageId) {
    buf.fill(0);
    buf[TYPE_OFF] = PageType::Internal as u8;
    write_u16(buf, NUM_KEYS_OFF, 0);
    write_u16(buf, FREE_START_OFF, DATA_START as u16);
    write_u16(buf, FREE_END_OFF, PAGE_SIZE as u16);
    write_u32(buf, RIGHTMOST_CHILD_OFF, rightmost_child.get());
}

pub fn num_keys(buf: &PageBuf) -> u16 {
    read_u16(buf, NUM_KEYS_OFF)
}

pub fn free_start(buf: &PageBuf) -> u16 {
    read_u16(buf, FREE_START_OFF)
}

pub fn free_end(buf: &PageBuf) -> u16 {
    read_u16(buf, FREE_END_OFF)
}

fn set_num_keys(buf: &mut PageBuf, n: u16) {
    write_u16(buf, NUM_KEYS_OFF, n);
}

fn set_free_start(buf: &mut PageBuf, v: u16) {
    write_u16(buf, FREE_START_OFF, v);
}

fn set_free_end(buf: &mut PageBuf, v: u16) {
    write_u16(buf, FREE_END_OFF, v);
}

pub fn rightmost_child(buf: &PageBuf) -> PageId {
    PageId::new(read_u32(buf, RIGHTMOST_CHILD_OFF))
}

fn set_rightmost_child(buf: &mut PageBuf, id: PageId) {
    write_u32(buf, RIGHTMOST_CHILD_OFF, id.get());
}

pub fn child_at(buf: &PageBuf, i: u16) -> PageId {
    PageId::new(read_u32(buf, CHILD_ARRAY_OFF + i as usize * 4))
}

fn set_child_at(buf: &mut PageBuf, i: u16, id: PageId) {
    write_u32(buf, CHILD_ARRAY_OFF + i as usize * 4, id.get());
}

pub fn key_pointer(buf: &PageBuf, i: u16) -> u16 {
    read_u16(buf, DATA_START + i as usize * 2)
}

fn set_key_pointer(buf: &mut PageBuf, i: u16, ptr: u16) {
    write_u16(buf, DATA_START + i as usize * 2, ptr);
}

pub fn space_used(buf: &PageBuf) -> usize {
    free_start(buf) as usize + (PAGE_SIZE - free_end(buf) as usize)
}

pub fn read_key(buf: &PageBuf, offset: u16) -> &[u8] {
    let pos = offset as usize;
    let key_len = read_u16(buf, pos) as usize;
    &buf[pos + 2..pos + 2 + key_len]
}

pub fn key_at(buf: &PageBuf, i: u16) -> &[u8] {
    read_key(buf, key_pointer(buf, i))
}

/// The full logical children list, `children[0..=numKeys]` (the fixed array plus the
/// rightmost-child field), in one contiguous vector.
fn children_vec(buf: &PageBuf) -> Vec<PageId> {
    let n = num_keys(buf);
    let mut v: Vec<PageId> = (0..n).map(|i| child_at(buf, i)).collect();
    v.push(rightmost_child(buf));
    v
}

/// Writes back a logical children list of length `numKeys + 1`: all but the last
/// entry go into the fixed child array, the last becomes the rightmost child.
fn set_children(buf: &mut PageBuf, children: &[PageId]) {
    let (head, tail) = children.split_at(children.len() - 1);
    for (i, id) in head.iter().enumerate() {
        set_child_at(buf, i as u16, *id);
    }
    set_rightmost_child(buf, tail[0]);
}

/// Binary search over separators; returns the first index whose key is `> key`, or
/// `numKeys` if none is. Ties go right: `children[i]` holds keys strictly less than
/// `keys[i]`; descend into `children[i+1]`/rightmost when `key >= keys[i]`.
pub fn find_insert_index(buf: &PageBuf, key: &[u8]) -> u16 {
    let n = num_keys(buf);
    let (mut lo, mut hi) = (0u16, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key_at(buf, mid) > key {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

/// Locates the child slot referencing `child_id`. Checks the rightmost-child field
/// first, then the fixed child array. Re-derived on every use rather than memoized,
/// since a sibling's merge or borrow can change a parent's layout between descent and
/// the point a caller needs this index again.
pub fn find_child_index(buf: &PageBuf, child_id: PageId) -> Option<u16> {
    let n = num_keys(buf);
    if rightmost_child(buf) == child_id {
        return Some(n);
    }
    (0..n).find(|&i| child_at(buf, i) == child_id)
}

fn write_key_cell(buf: &mut PageBuf, key: &[u8]) -> Option<u16> {
    let cell_len = 2 + key.len();
    let new_free_start = free_start(buf) as usize + 2;
    let new_free_end = (free_end(buf) as usize).checked_sub(cell_len)?;
    if new_free_start > new_free_end {
        return None;
    }
    let off = new_free_end;
    write_u16(buf, off, key.len() as u16);
    buf[off + 2..off + 2 + key.len()].copy_from_slice(key);
    set_free_end(buf, off as u16);
    Some(off as u16)
}

fn insert_key_pointer(buf: &mut PageBuf, idx: u16, ptr: u16) {
    let n = num_keys(buf);
    let mut j = n;
    while j > idx {
        let p = key_pointer(buf, j - 1);
        set_key_pointer(buf, j, p);
        j -= 1;
    }
    set_key_pointer(buf, idx, ptr);
    set_num_keys(buf, n + 1);
    set_free_start(buf, (DATA_START + (n as usize + 1) * 2) as u16);
}

/// Inserts a separator key routing to `new_child`, which becomes the child
/// immediately to the right of the new key. Reports [`PageOp::Full`] without
/// mutating the page when either the fixed child-array budget (`MAX_CHILDREN`) or
/// the heap's byte budget would be exceeded.
pub fn insert_separator(buf: &mut PageBuf, key: &[u8], new_child: PageId) -> Result<PageOp> {
    let n = num_keys(buf) as usize;
    if n + 2 > MAX_CHILDREN {
        return Ok(PageOp::Full);
    }

    let idx = find_insert_index(buf, key);
    let before = *buf;

    let Some(off) = write_key_cell(buf, key) else {
        *buf = before;
        return Ok(PageOp::Full);
    };
    insert_key_pointer(buf, idx, off);

    let mut children = children_vec(buf);
    children.insert(idx as usize + 1, new_child);
    set_children(buf, &children);

    Ok(PageOp::Done)
}

/// Overwrites the separator at `idx` with `key` and compacts the heap.
pub fn replace_key(buf: &mut PageBuf, idx: u16, key: &[u8]) {
    let mut keys: Vec<Vec<u8>> = (0..num_keys(buf)).map(|i| key_at(buf, i).to_vec()).collect();
    keys[idx as usize] = key.to_vec();
    rewrite_keys(buf, &keys);
}

/// Removes the separator at `idx`, left-shifting the key-pointer array.
pub fn delete_key(buf: &mut PageBuf, idx: u16) {
    let mut keys: Vec<Vec<u8>> = (0..num_keys(buf)).map(|i| key_at(buf, i).to_vec()).collect();
    keys.remove(idx as usize);
    rewrite_keys(buf, &keys);
}

/// Removes the child pointer at `idx` (0-indexed into the logical `children[0..=K]`
/// list, so `idx == numKeys` targets the rightmost child), left-shifting the rest.
pub fn delete_child(buf: &mut PageBuf, idx: u16) {
    let mut children = children_vec(buf);
    children.remove(idx as usize);
    set_children(buf, &children);
}

fn rewrite_keys(buf: &mut PageBuf, keys: &[Vec<u8>]) {
    set_free_end(buf, PAGE_SIZE as u16);
    for (i, key) in keys.iter().enumerate() {
        let off = write_key_cell(buf, key).expect("rewrite must not grow heap contents");
        set_key_pointer(buf, i as u16, off);
    }
    set_num_keys(buf, keys.len() as u16);
    set_free_start(buf, (DATA_START + keys.len() * 2) as u16);
}

/// All separator keys, in order.
pub fn all_keys(buf: &PageBuf) -> Vec<Vec<u8>> {
    (0..num_keys(buf)).map(|i| key_at(buf, i).to_vec()).collect()
}

/// All children, `children[0..=numKeys]`, in order.
pub fn all_children(buf: &PageBuf) -> Vec<PageId> {
    children_vec(buf)
}

/// Rebuilds the page from scratch with an explicit `(keys, children)` pair, where
/// `children.len() == keys.len() + 1`. Used after an internal split to re-populate
/// both halves and by merge to rebuild the surviving page.
pub fn rebuild(buf: &mut PageBuf, keys: &[Vec<u8>], children: &[PageId]) {
    debug_assert_eq!(children.len(), keys.len() + 1);
    init(buf, *children.last().unwrap());
    for (i, key) in keys.iter().enumerate() {
        let off = write_key_cell(buf, key).expect("rebuild must fit: caller pre-split keys");
        set_key_pointer(buf, i as u16, off);
    }
    set_num_keys(buf, keys.len() as u16);
    set_free_start(buf, (DATA_START + keys.len() * 2) as u16);
    for (i, id) in children[..children.len() - 1].iter().enumerate() {
        set_child_at(buf, i as u16, *id);
    }
}
