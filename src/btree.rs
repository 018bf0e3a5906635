//! The B+tree itself: navigation, insertion with propagating splits, and deletion with
//! borrow/merge rebalancing. There is exactly one tree per store, rooted at whatever
//! page `pager.root()` names — unlike a catalog of independently-rooted trees, a
//! single embedded store has no need for a `BTree` handle separate from the pager, so
//! every operation here is a free function taking `&Pager`/`&mut Pager` directly.
//!
//! Split propagation climbs the parent chain with an explicit loop, not recursion: the
//! descent stack collected on the way down is popped one level at a time on the way
//! back up. Delete rebalancing re-derives each node's index in its parent on every
//! level (`internal_page::find_child_index`) rather than remembering the index found
//! during descent, since a sibling's own merge can shift that parent's layout between
//! the moment a level is visited going down and the moment it's revisited coming up.
use crate::error::PageOp;
use crate::page::{self, PageBuf, PageId, PageType};
use crate::pager::Pager;
use crate::{Error, MAX_CHILDREN, MAX_KEY_LEN, MAX_VALUE_LEN, PAGE_SIZE, Result};
use crate::{internal_page, leaf_page};

/// Looks up `key`. `Ok(None)` means the key isn't present; this never happens as a
/// side effect of an error.
pub fn search(pager: &Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::KeyTooLarge(key.len(), MAX_KEY_LEN));
    }

    let path = descend_to_leaf(pager, key)?;
    let leaf_id = *path.last().unwrap();
    let buf = pager.read_page(leaf_id)?;
    let idx = leaf_page::find_insert_index(&buf, key);
    if idx < leaf_page::num_cells(&buf) {
        let cell_key = leaf_page::read_key(&buf, leaf_page::cell_pointer(&buf, idx));
        if cell_key == key {
            let (_, v) = leaf_page::read_record(&buf, leaf_page::cell_pointer(&buf, idx));
            return Ok(Some(v.to_vec()));
        }
    }
    Ok(None)
}

/// Inserts `(key, val)`. Rejects a key already present with [`Error::KeyExists`]
/// without touching the tree.
pub fn insert(pager: &mut Pager, key: &[u8], val: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::KeyTooLarge(key.len(), MAX_KEY_LEN));
    }
    if val.len() > MAX_VALUE_LEN {
        return Err(Error::ValueTooLarge(val.len(), MAX_VALUE_LEN));
    }
    pager.with_transaction(|pager| insert_inner(pager, key, val))
}

/// Deletes `key`. [`Error::KeyNotFound`] if it isn't present.
pub fn delete(pager: &mut Pager, key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::KeyTooLarge(key.len(), MAX_KEY_LEN));
    }
    pager.with_transaction(|pager| delete_inner(pager, key))
}

/// Collects the path from the root down to the leaf that would hold `key`, root first.
fn descend_to_leaf(pager: &Pager, key: &[u8]) -> Result<Vec<PageId>> {
    let mut path = vec![pager.root()];
    loop {
        let id = *path.last().unwrap();
        let buf = pager.read_page(id)?;
        match PageType::from_tag(page::type_tag(&buf)) {
            Some(PageType::Leaf) => return Ok(path),
            Some(PageType::Internal) => {
                let idx = internal_page::find_insert_index(&buf, key);
                let child = if idx < internal_page::num_keys(&buf) {
                    internal_page::child_at(&buf, idx)
                } else {
                    internal_page::rightmost_child(&buf)
                };
                path.push(child);
            }
            _ => return Err(Error::CorruptFile("unexpected page type while descending")),
        }
    }
}

fn insert_inner(pager: &mut Pager, key: &[u8], val: &[u8]) -> Result<()> {
    let path = descend_to_leaf(pager, key)?;
    let leaf_id = *path.last().unwrap();
    let mut leaf_buf = pager.read_page(leaf_id)?;

    if let PageOp::Done = leaf_page::insert(&mut leaf_buf, key, val)? {
        pager.write_page(leaf_id, &leaf_buf)?;
        return Ok(());
    }

    let mut records = leaf_page::all_records(&leaf_buf);
    let pos = records.partition_point(|(k, _)| k.as_slice() < key);
    records.insert(pos, (key.to_vec(), val.to_vec()));

    let mid = records.len() / 2;
    let right_records = records.split_off(mid);

    let right_id = pager.allocate_page()?;
    let mut right_buf = [0u8; PAGE_SIZE];
    leaf_page::rebuild(&mut right_buf, &right_records);
    let mut left_buf = [0u8; PAGE_SIZE];
    leaf_page::rebuild(&mut left_buf, &records);

    pager.write_page(leaf_id, &left_buf)?;
    pager.write_page(right_id, &right_buf)?;

    let mut sep_key = leaf_page::min_key(&right_buf).to_vec();
    let mut new_child = right_id;
    let mut current_left = leaf_id;

    let mut ancestors = path;
    ancestors.pop();

    while let Some(parent_id) = ancestors.pop() {
        let mut parent_buf = pager.read_page(parent_id)?;
        if let PageOp::Done = internal_page::insert_separator(&mut parent_buf, &sep_key, new_child)?
        {
            pager.write_page(parent_id, &parent_buf)?;
            return Ok(());
        }

        let idx = internal_page::find_insert_index(&parent_buf, &sep_key) as usize;
        let mut keys = internal_page::all_keys(&parent_buf);
        let mut children = internal_page::all_children(&parent_buf);
        keys.insert(idx, sep_key.clone());
        children.insert(idx + 1, new_child);

        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid + 1);
        let promoted = keys.pop().expect("mid key present after insert");
        let left_keys = keys;
        let right_children = children.split_off(mid + 1);
        let left_children = children;

        let right_internal_id = pager.allocate_page()?;
        let mut right_internal_buf = [0u8; PAGE_SIZE];
        internal_page::rebuild(&mut right_internal_buf, &right_keys, &right_children);
        let mut left_internal_buf = [0u8; PAGE_SIZE];
        internal_page::rebuild(&mut left_internal_buf, &left_keys, &left_children);

        pager.write_page(parent_id, &left_internal_buf)?;
        pager.write_page(right_internal_id, &right_internal_buf)?;

        sep_key = promoted;
        new_child = right_internal_id;
        current_left = parent_id;
    }

    let new_root_id = pager.allocate_page()?;
    let mut new_root_buf = [0u8; PAGE_SIZE];
    internal_page::rebuild(&mut new_root_buf, &[sep_key], &[current_left, new_child]);
    pager.write_page(new_root_id, &new_root_buf)?;
    pager.set_root(new_root_id);
    Ok(())
}

fn delete_inner(pager: &mut Pager, key: &[u8]) -> Result<()> {
    let path = descend_to_leaf(pager, key)?;
    let leaf_id = *path.last().unwrap();
    let mut leaf_buf = pager.read_page(leaf_id)?;

    leaf_page::delete(&mut leaf_buf, key)?;
    leaf_page::compact(&mut leaf_buf);
    pager.write_page(leaf_id, &leaf_buf)?;

    if path.len() == 1 {
        return Ok(());
    }

    if is_half_full(leaf_page::space_used(&leaf_buf)) {
        return Ok(());
    }

    rebalance(pager, &path)
}

fn is_half_full(space_used: usize) -> bool {
    space_used * 2 >= PAGE_SIZE
}

enum RebalanceOutcome {
    Borrowed,
    Merged,
}

/// Walks up from the underfull leaf at `path`'s tail, borrowing from or merging with a
/// sibling at each level that still needs it, and shrinking the root if it ends up
/// with no keys left.
fn rebalance(pager: &mut Pager, path: &[PageId]) -> Result<()> {
    let mut level = path.len() - 1;

    loop {
        if level == 0 {
            return shrink_root_if_needed(pager, path[0]);
        }

        let node_id = path[level];
        let parent_id = path[level - 1];
        let mut parent_buf = pager.read_page(parent_id)?;
        let child_idx = internal_page::find_child_index(&parent_buf, node_id)
            .ok_or(Error::PageOverflow)?;
        let children = internal_page::all_children(&parent_buf);

        let node_buf = pager.read_page(node_id)?;
        let is_leaf = page::type_tag(&node_buf) == PageType::Leaf as u8;

        let outcome = if child_idx > 0 {
            let left_id = children[child_idx as usize - 1];
            let sep_idx = child_idx - 1;
            rebalance_pair(pager, &mut parent_buf, sep_idx, left_id, node_id, is_leaf)?
        } else {
            let right_id = children[child_idx as usize + 1];
            let sep_idx = child_idx;
            rebalance_pair(pager, &mut parent_buf, sep_idx, node_id, right_id, is_leaf)?
        };

        pager.write_page(parent_id, &parent_buf)?;

        match outcome {
            RebalanceOutcome::Borrowed => return Ok(()),
            RebalanceOutcome::Merged => {
                if level - 1 == 0 {
                    return shrink_root_if_needed(pager, path[0]);
                }
                if is_half_full(internal_page::space_used(&parent_buf)) {
                    return Ok(());
                }
                level -= 1;
            }
        }
    }
}

/// Redistributes records/keys evenly between `left_id` and `right_id` if they'd still
/// fit each on its own page, otherwise merges them onto `left_id` and frees `right_id`.
/// `sep_idx` is the index, in `parent_buf`, of the separator key between the two.
fn rebalance_pair(
    pager: &mut Pager,
    parent_buf: &mut PageBuf,
    sep_idx: u16,
    left_id: PageId,
    right_id: PageId,
    is_leaf: bool,
) -> Result<RebalanceOutcome> {
    if is_leaf {
        leaf_rebalance_pair(pager, parent_buf, sep_idx, left_id, right_id)
    } else {
        internal_rebalance_pair(pager, parent_buf, sep_idx, left_id, right_id)
    }
}

fn leaf_rebalance_pair(
    pager: &mut Pager,
    parent_buf: &mut PageBuf,
    sep_idx: u16,
    left_id: PageId,
    right_id: PageId,
) -> Result<RebalanceOutcome> {
    let left_buf = pager.read_page(left_id)?;
    let right_buf = pager.read_page(right_id)?;

    let mut combined = leaf_page::all_records(&left_buf);
    combined.extend(leaf_page::all_records(&right_buf));

    let combined_bytes: usize = combined
        .iter()
        .map(|(k, v)| 2 + 4 + k.len() + v.len())
        .sum();

    if leaf_page::DATA_START + combined_bytes <= PAGE_SIZE {
        let mut merged = [0u8; PAGE_SIZE];
        leaf_page::rebuild(&mut merged, &combined);
        pager.write_page(left_id, &merged)?;
        pager.free_page(right_id)?;
        internal_page::delete_key(parent_buf, sep_idx);
        internal_page::delete_child(parent_buf, sep_idx + 1);
        return Ok(RebalanceOutcome::Merged);
    }

    let mid = combined.len() / 2;
    let (new_left, new_right) = combined.split_at(mid);

    let mut left_buf2 = [0u8; PAGE_SIZE];
    leaf_page::rebuild(&mut left_buf2, new_left);
    let mut right_buf2 = [0u8; PAGE_SIZE];
    leaf_page::rebuild(&mut right_buf2, new_right);

    pager.write_page(left_id, &left_buf2)?;
    pager.write_page(right_id, &right_buf2)?;

    let new_sep = leaf_page::min_key(&right_buf2).to_vec();
    internal_page::replace_key(parent_buf, sep_idx, &new_sep);
    Ok(RebalanceOutcome::Borrowed)
}

fn internal_rebalance_pair(
    pager: &mut Pager,
    parent_buf: &mut PageBuf,
    sep_idx: u16,
    left_id: PageId,
    right_id: PageId,
) -> Result<RebalanceOutcome> {
    let left_buf = pager.read_page(left_id)?;
    let right_buf = pager.read_page(right_id)?;
    let parent_sep = internal_page::key_at(parent_buf, sep_idx).to_vec();

    let mut combined_keys = internal_page::all_keys(&left_buf);
    combined_keys.push(parent_sep);
    combined_keys.extend(internal_page::all_keys(&right_buf));

    let mut combined_children = internal_page::all_children(&left_buf);
    combined_children.extend(internal_page::all_children(&right_buf));

    let combined_bytes: usize = combined_keys.iter().map(|k| 2 + k.len()).sum();

    if internal_page::DATA_START + combined_bytes <= PAGE_SIZE
        && combined_children.len() <= MAX_CHILDREN
    {
        let mut merged = [0u8; PAGE_SIZE];
        internal_page::rebuild(&mut merged, &combined_keys, &combined_children);
        pager.write_page(left_id, &merged)?;
        pager.free_page(right_id)?;
        internal_page::delete_key(parent_buf, sep_idx);
        internal_page::delete_child(parent_buf, sep_idx + 1);
        return Ok(RebalanceOutcome::Merged);
    }

    let mid = combined_keys.len() / 2;
    let new_sep = combined_keys[mid].clone();
    let left_keys = combined_keys[..mid].to_vec();
    let right_keys = combined_keys[mid + 1..].to_vec();
    let left_children = combined_children[..=mid].to_vec();
    let right_children = combined_children[mid + 1..].to_vec();

    let mut left_buf2 = [0u8; PAGE_SIZE];
    internal_page::rebuild(&mut left_buf2, &left_keys, &left_children);
    let mut right_buf2 = [0u8; PAGE_SIZE];
    internal_page::rebuild(&mut right_buf2, &right_keys, &right_children);

    pager.write_page(left_id, &left_buf2)?;
    pager.write_page(right_id, &right_buf2)?;
    internal_page::replace_key(parent_buf, sep_idx, &new_sep);
    Ok(RebalanceOutcome::Borrowed)
}

fn shrink_root_if_needed(pager: &mut Pager, root_id: PageId) -> Result<()> {
    let buf = pager.read_page(root_id)?;
    if page::type_tag(&buf) != PageType::Internal as u8 {
        return Ok(());
    }
    if internal_page::num_keys(&buf) == 0 {
        let only_child = internal_page::rightmost_child(&buf);
        pager.set_root(only_child);
        pager.free_page(root_id)?;
    }
    Ok(())
}
