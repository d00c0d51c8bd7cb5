use crate::ir::def::*;
use crate::ir::Region;
use rustc_hash::{FxHashMap, FxHashSet};

// Dominator tree over the in-region CFG, kept as an immediate-dominator map.
// The linearizer repairs it incrementally while it rewires edges; `verify`
// recomputes from scratch and compares.
#[derive(Debug, Clone)]
pub struct DomTree {
    entry: BlockId,
    idom: FxHashMap<BlockId, BlockId>,
}

impl DomTree {
    pub fn compute(fn_ir: &FnIR, region: &Region) -> Self {
        let reachable = reachable_in_region(fn_ir, region);
        let doms = dominator_sets(fn_ir, region, &reachable);

        // Derive immediate dominators: the strict dominator that no other
        // strict dominator is dominated by.
        let mut idom = FxHashMap::default();
        for &b in &reachable {
            if b == region.entry {
                continue;
            }
            let set = match doms.get(&b) {
                Some(s) => s,
                None => continue,
            };
            let candidates: Vec<BlockId> = set.iter().copied().filter(|&x| x != b).collect();

            let mut chosen: Option<BlockId> = None;
            for &c in &candidates {
                let mut dominated_by_other = false;
                for &d in &candidates {
                    if d == c {
                        continue;
                    }
                    if let Some(d_set) = doms.get(&d) {
                        if d_set.contains(&c) {
                            dominated_by_other = true;
                            break;
                        }
                    }
                }
                if !dominated_by_other {
                    chosen = Some(c);
                    break;
                }
            }

            if let Some(c) = chosen {
                idom.insert(b, c);
            }
        }

        Self {
            entry: region.entry,
            idom,
        }
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        if b == self.entry {
            return None;
        }
        self.idom.get(&b).copied()
    }

    pub fn set_idom(&mut self, b: BlockId, dom: BlockId) {
        debug_assert!(b != self.entry, "entry has no immediate dominator");
        self.idom.insert(b, dom);
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut cur = b;
        let mut guard = 0usize;
        while let Some(d) = self.idom(cur) {
            if d == a {
                return true;
            }
            cur = d;
            guard += 1;
            if guard > self.idom.len() + 1 {
                break;
            }
        }
        false
    }

    fn depth(&self, b: BlockId) -> usize {
        let mut d = 0usize;
        let mut cur = b;
        let mut guard = 0usize;
        while let Some(next) = self.idom(cur) {
            d += 1;
            cur = next;
            guard += 1;
            if guard > self.idom.len() + 1 {
                break;
            }
        }
        d
    }

    // Nearest common dominator of @a and @b.
    pub fn ncd(&self, a: BlockId, b: BlockId) -> BlockId {
        let mut x = a;
        let mut y = b;
        let mut dx = self.depth(x);
        let mut dy = self.depth(y);
        while dx > dy {
            x = self.idom(x).expect("walked past the region entry");
            dx -= 1;
        }
        while dy > dx {
            y = self.idom(y).expect("walked past the region entry");
            dy -= 1;
        }
        while x != y {
            x = self.idom(x).expect("walked past the region entry");
            y = self.idom(y).expect("walked past the region entry");
        }
        x
    }

    // Recompute from the current CFG and compare against the maintained map.
    pub fn verify(&self, fn_ir: &FnIR, region: &Region) -> Result<(), String> {
        let fresh = Self::compute(fn_ir, region);
        for (&b, &d) in &fresh.idom {
            let have = self.idom(b);
            if have != Some(d) {
                return Err(format!(
                    "idom of {} is {:?}, expected bb{}",
                    fn_ir.block_name(b),
                    have.map(|x| fn_ir.block_name(x)),
                    d
                ));
            }
        }
        Ok(())
    }
}

fn reachable_in_region(fn_ir: &FnIR, region: &Region) -> FxHashSet<BlockId> {
    let mut reachable = FxHashSet::default();
    let mut queue = vec![region.entry];
    reachable.insert(region.entry);

    let mut head = 0;
    while head < queue.len() {
        let bid = queue[head];
        head += 1;
        for succ in fn_ir.successors(bid) {
            if region.contains(succ) && reachable.insert(succ) {
                queue.push(succ);
            }
        }
    }
    reachable
}

// Naive iterative dominator sets:
// Dom(n) = {n} U Inter(Dom(p) for p in preds(n))
fn dominator_sets(
    fn_ir: &FnIR,
    region: &Region,
    reachable: &FxHashSet<BlockId>,
) -> FxHashMap<BlockId, FxHashSet<BlockId>> {
    let mut doms: FxHashMap<BlockId, FxHashSet<BlockId>> = FxHashMap::default();

    doms.insert(region.entry, std::iter::once(region.entry).collect());
    for &b in reachable {
        if b != region.entry {
            doms.insert(b, reachable.clone());
        }
    }

    let mut preds: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
    for &b in reachable {
        for succ in fn_ir.successors(b) {
            if reachable.contains(&succ) {
                preds.entry(succ).or_default().push(b);
            }
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &bb in reachable {
            if bb == region.entry {
                continue;
            }

            let bb_preds = match preds.get(&bb) {
                Some(p) if !p.is_empty() => p,
                _ => continue,
            };

            let mut new_dom: Option<FxHashSet<BlockId>> = None;
            for &p in bb_preds {
                if let Some(p_dom) = doms.get(&p) {
                    match new_dom {
                        None => new_dom = Some(p_dom.clone()),
                        Some(ref mut set) => set.retain(|x| p_dom.contains(x)),
                    }
                }
            }

            if let Some(mut set) = new_dom {
                set.insert(bb);
                if set != *doms.get(&bb).unwrap() {
                    doms.insert(bb, set);
                    changed = true;
                }
            }
        }
    }

    doms
}
