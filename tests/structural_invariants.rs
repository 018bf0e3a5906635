//! Whole-tree walker verifying the structural invariants from the data model: every
//! non-root page stays at least half full, every leaf sits at the same depth,
//! separators are strictly ascending with correctly bounded subtrees, and every
//! allocated page is either reachable from the root or on the free list — never both,
//! never neither.

use gostore::page::{self, PageId, PageType};
use gostore::pager::Pager;
use gostore::{internal_page, leaf_page, PAGE_SIZE};
use std::collections::HashSet;
use tempfile::tempdir;

struct Walk {
    leaf_depths: Vec<u32>,
    reachable: HashSet<u32>,
}

/// Key bound for a subtree: `lo` is exclusive, `hi` is exclusive (`None` = unbounded).
fn walk(pager: &Pager, id: PageId, depth: u32, lo: Option<&[u8]>, hi: Option<&[u8]>, out: &mut Walk) {
    assert!(
        out.reachable.insert(id.get()),
        "page {id} reachable via more than one path"
    );

    let buf = pager.read_page(id).unwrap();
    match PageType::from_tag(page::type_tag(&buf)).unwrap() {
        PageType::Leaf => {
            out.leaf_depths.push(depth);
            let mut prev: Option<Vec<u8>> = None;
            for (k, _) in leaf_page::all_records(&buf) {
                if let Some(p) = &prev {
                    assert!(p.as_slice() < k.as_slice(), "leaf keys not strictly ascending");
                }
                if let Some(lo) = lo {
                    assert!(k.as_slice() >= lo, "leaf key below its subtree's lower bound");
                }
                if let Some(hi) = hi {
                    assert!(k.as_slice() < hi, "leaf key at/above its subtree's upper bound");
                }
                prev = Some(k);
            }
        }
        PageType::Internal => {
            let keys = internal_page::all_keys(&buf);
            let children = internal_page::all_children(&buf);
            for w in keys.windows(2) {
                assert!(w[0] < w[1], "separators not strictly ascending");
            }
            if let (Some(lo), Some(first)) = (lo, keys.first()) {
                assert!(first.as_slice() > lo, "first separator at/below subtree's lower bound");
            }
            if let (Some(hi), Some(last)) = (hi, keys.last()) {
                assert!(last.as_slice() < hi, "last separator at/above subtree's upper bound");
            }

            for (i, &child) in children.iter().enumerate() {
                let child_lo = if i == 0 { lo } else { Some(keys[i - 1].as_slice()) };
                let child_hi = if i == keys.len() { hi } else { Some(keys[i].as_slice()) };
                walk(pager, child, depth + 1, child_lo, child_hi, out);
            }
        }
        other => panic!("unexpected page type {other:?} reached while walking"),
    }
}

fn free_list_ids(pager: &Pager) -> HashSet<u32> {
    let mut ids = HashSet::new();
    let mut cur = pager.free_head();
    while let Some(id) = cur {
        assert!(ids.insert(id.get()), "free list contains a cycle");
        let buf = pager.read_page(id).unwrap();
        let next = page::read_u32(&buf, 1);
        cur = (next != gostore::NO_PAGE).then(|| PageId::new(next));
    }
    ids
}

fn assert_tree_is_well_formed(pager: &Pager) {
    let root = pager.root();
    let root_buf = pager.read_page(root).unwrap();
    let root_is_leaf = page::type_tag(&root_buf) == PageType::Leaf as u8;

    let mut out = Walk {
        leaf_depths: Vec::new(),
        reachable: HashSet::new(),
    };
    walk(pager, root, 0, None, None, &mut out);

    let first_depth = out.leaf_depths[0];
    assert!(
        out.leaf_depths.iter().all(|&d| d == first_depth),
        "leaves at unequal depths: {:?}",
        out.leaf_depths
    );

    for &id in &out.reachable {
        if id == root.get() {
            continue;
        }
        let buf = pager.read_page(PageId::new(id)).unwrap();
        let used = match PageType::from_tag(page::type_tag(&buf)).unwrap() {
            PageType::Leaf => leaf_page::space_used(&buf),
            PageType::Internal => internal_page::space_used(&buf),
            other => panic!("unexpected page type {other:?} among reachable pages"),
        };
        assert!(used * 2 >= PAGE_SIZE, "non-root page {id} is under half full");
    }
    // the root is either a leaf or an internal page with at least one separator (>=2
    // children); an internal root with zero keys should have been shrunk away.
    if !root_is_leaf {
        assert!(internal_page::num_keys(&root_buf) >= 1);
    }

    let free = free_list_ids(pager);
    let overlap: Vec<u32> = free.intersection(&out.reachable).copied().collect();
    assert!(overlap.is_empty(), "pages {overlap:?} are both reachable and free");

    let all_ids: HashSet<u32> = (1..pager.num_pages()).collect();
    let accounted: HashSet<u32> = out.reachable.union(&free).copied().collect();
    assert_eq!(
        all_ids, accounted,
        "every page beyond the meta page must be reachable or free, exactly once"
    );
}

#[test]
fn fresh_store_is_a_single_well_formed_leaf() {
    let dir = tempdir().unwrap();
    let pager = Pager::open(dir.path().join("a.db")).unwrap();
    assert_tree_is_well_formed(&pager);
}

#[test]
fn well_formed_after_many_ascending_inserts() {
    let dir = tempdir().unwrap();
    let mut pager = Pager::open(dir.path().join("a.db")).unwrap();
    for i in 0..3_000u32 {
        let key = format!("{i:08}");
        gostore::btree::insert(&mut pager, key.as_bytes(), b"x").unwrap();
    }
    assert_tree_is_well_formed(&pager);
}

#[test]
fn well_formed_after_interleaved_insert_and_delete() {
    let dir = tempdir().unwrap();
    let mut pager = Pager::open(dir.path().join("a.db")).unwrap();
    for i in 0..2_000u32 {
        let key = format!("{i:08}");
        gostore::btree::insert(&mut pager, key.as_bytes(), b"x").unwrap();
    }
    for i in (0..2_000u32).step_by(3) {
        let key = format!("{i:08}");
        gostore::btree::delete(&mut pager, key.as_bytes()).unwrap();
    }
    assert_tree_is_well_formed(&pager);
}

#[test]
fn well_formed_after_full_drain_back_to_empty() {
    let dir = tempdir().unwrap();
    let mut pager = Pager::open(dir.path().join("a.db")).unwrap();
    for i in 0..1_000u32 {
        let key = format!("{i:08}");
        gostore::btree::insert(&mut pager, key.as_bytes(), b"x").unwrap();
    }
    for i in 0..1_000u32 {
        let key = format!("{i:08}");
        gostore::btree::delete(&mut pager, key.as_bytes()).unwrap();
    }
    assert_tree_is_well_formed(&pager);
}
