//! Cell arena and registry lists.
//!
//! Every GC cell lives in a slab; the three registry lists (live /
//! tentatively-unreachable / pending-free) are intrusive doubly-linked
//! lists threaded through the cell headers, so splicing a cell between
//! lists is O(1) and iteration follows allocation order.

use crate::object::{CellData, GcCell, GcHeader, ListTag};
use crate::value::CellId;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CellList {
    pub first: Option<CellId>,
    pub last: Option<CellId>,
    pub len: usize,
}

impl CellList {
    fn new() -> Self {
        Self {
            first: None,
            last: None,
            len: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

pub(crate) struct Registry {
    slots: Vec<Option<GcCell>>,
    free: Vec<u32>,
    live: CellList,
    tentative: CellList,
    pending_free: CellList,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: CellList::new(),
            tentative: CellList::new(),
            pending_free: CellList::new(),
        }
    }

    /// Store a new cell. The cell starts detached; the caller links it onto
    /// a list (registration) separately.
    pub(crate) fn insert(&mut self, data: CellData) -> CellId {
        let cell = GcCell {
            header: GcHeader::new(data.kind()),
            data,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(cell);
            CellId(idx)
        } else {
            self.slots.push(Some(cell));
            CellId((self.slots.len() - 1) as u32)
        }
    }

    /// Drop a cell's storage. The cell must already be unlinked.
    pub(crate) fn remove(&mut self, id: CellId) -> GcCell {
        let cell = match self.slots[id.index()].take() {
            Some(c) => c,
            None => panic!("removing dead cell {:?}", id),
        };
        debug_assert_eq!(cell.header.list, ListTag::Detached);
        self.free.push(id.0);
        cell
    }

    pub(crate) fn contains(&self, id: CellId) -> bool {
        self.slots
            .get(id.index())
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn cell(&self, id: CellId) -> &GcCell {
        match self.slots[id.index()].as_ref() {
            Some(c) => c,
            None => panic!("dead cell {:?}", id),
        }
    }

    pub(crate) fn cell_mut(&mut self, id: CellId) -> &mut GcCell {
        match self.slots[id.index()].as_mut() {
            Some(c) => c,
            None => panic!("dead cell {:?}", id),
        }
    }

    pub(crate) fn list(&self, tag: ListTag) -> &CellList {
        match tag {
            ListTag::Live => &self.live,
            ListTag::Tentative => &self.tentative,
            ListTag::PendingFree => &self.pending_free,
            ListTag::Detached => panic!("detached cells are not on a list"),
        }
    }

    fn list_mut(&mut self, tag: ListTag) -> &mut CellList {
        match tag {
            ListTag::Live => &mut self.live,
            ListTag::Tentative => &mut self.tentative,
            ListTag::PendingFree => &mut self.pending_free,
            ListTag::Detached => panic!("detached cells are not on a list"),
        }
    }

    pub(crate) fn push_back(&mut self, tag: ListTag, id: CellId) {
        let old_last = self.list(tag).last;
        {
            let h = &mut self.cell_mut(id).header;
            debug_assert_eq!(h.list, ListTag::Detached);
            h.list = tag;
            h.prev = old_last;
            h.next = None;
        }
        if let Some(prev) = old_last {
            self.cell_mut(prev).header.next = Some(id);
        }
        let list = self.list_mut(tag);
        if list.first.is_none() {
            list.first = Some(id);
        }
        list.last = Some(id);
        list.len += 1;
    }

    pub(crate) fn push_front(&mut self, tag: ListTag, id: CellId) {
        let old_first = self.list(tag).first;
        {
            let h = &mut self.cell_mut(id).header;
            debug_assert_eq!(h.list, ListTag::Detached);
            h.list = tag;
            h.prev = None;
            h.next = old_first;
        }
        if let Some(next) = old_first {
            self.cell_mut(next).header.prev = Some(id);
        }
        let list = self.list_mut(tag);
        if list.last.is_none() {
            list.last = Some(id);
        }
        list.first = Some(id);
        list.len += 1;
    }

    /// Splice a cell out of whichever list owns it. No-op for detached
    /// cells; never frees.
    pub(crate) fn unlink(&mut self, id: CellId) {
        let (tag, prev, next) = {
            let h = &self.cell(id).header;
            (h.list, h.prev, h.next)
        };
        if tag == ListTag::Detached {
            return;
        }
        match prev {
            Some(p) => self.cell_mut(p).header.next = next,
            None => self.list_mut(tag).first = next,
        }
        match next {
            Some(n) => self.cell_mut(n).header.prev = prev,
            None => self.list_mut(tag).last = prev,
        }
        {
            let h = &mut self.cell_mut(id).header;
            h.list = ListTag::Detached;
            h.prev = None;
            h.next = None;
        }
        self.list_mut(tag).len -= 1;
    }

    pub(crate) fn first(&self, tag: ListTag) -> Option<CellId> {
        self.list(tag).first
    }

    pub(crate) fn next(&self, id: CellId) -> Option<CellId> {
        self.cell(id).header.next
    }

    pub(crate) fn len(&self, tag: ListTag) -> usize {
        self.list(tag).len
    }

    /// Read-only walk of one list, in allocation order.
    pub(crate) fn iter(&self, tag: ListTag) -> ListIter<'_> {
        ListIter {
            registry: self,
            cur: self.list(tag).first,
        }
    }

    /// Tear out every remaining cell, for runtime shutdown.
    pub(crate) fn drain_cells(&mut self) -> Vec<GcCell> {
        let mut out = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Some(mut cell) = slot.take() {
                cell.header.list = ListTag::Detached;
                out.push(cell);
            }
        }
        self.live = CellList::new();
        self.tentative = CellList::new();
        self.pending_free = CellList::new();
        self.free.clear();
        out
    }
}

pub(crate) struct ListIter<'a> {
    registry: &'a Registry,
    cur: Option<CellId>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = CellId;

    fn next(&mut self) -> Option<CellId> {
        let id = self.cur?;
        self.cur = self.registry.cell(id).header.next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::VarRef;
    use crate::value::Value;

    fn var_ref_cell() -> CellData {
        CellData::VarRef(VarRef {
            value: Value::Undefined,
            detached: true,
        })
    }

    #[test]
    fn push_back_preserves_order() {
        let mut r = Registry::new();
        let a = r.insert(var_ref_cell());
        let b = r.insert(var_ref_cell());
        let c = r.insert(var_ref_cell());
        r.push_back(ListTag::Live, a);
        r.push_back(ListTag::Live, b);
        r.push_back(ListTag::Live, c);
        let order: Vec<_> = r.iter(ListTag::Live).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(r.len(ListTag::Live), 3);
    }

    #[test]
    fn unlink_middle_and_splice_to_other_list() {
        let mut r = Registry::new();
        let a = r.insert(var_ref_cell());
        let b = r.insert(var_ref_cell());
        let c = r.insert(var_ref_cell());
        for id in [a, b, c] {
            r.push_back(ListTag::Live, id);
        }
        r.unlink(b);
        r.push_back(ListTag::Tentative, b);
        assert_eq!(r.iter(ListTag::Live).collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(r.iter(ListTag::Tentative).collect::<Vec<_>>(), vec![b]);
        assert_eq!(r.len(ListTag::Live), 2);
        assert_eq!(r.len(ListTag::Tentative), 1);
    }

    #[test]
    fn push_front_orders_like_a_stack() {
        let mut r = Registry::new();
        let a = r.insert(var_ref_cell());
        let b = r.insert(var_ref_cell());
        r.push_front(ListTag::PendingFree, a);
        r.push_front(ListTag::PendingFree, b);
        assert_eq!(
            r.iter(ListTag::PendingFree).collect::<Vec<_>>(),
            vec![b, a]
        );
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut r = Registry::new();
        let a = r.insert(var_ref_cell());
        r.remove(a);
        let b = r.insert(var_ref_cell());
        assert_eq!(a, b);
        assert!(r.contains(b));
    }
}
