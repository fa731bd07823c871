//! Cycle collector.
//!
//! Synchronous trial-deletion collection in three phases over the live
//! list: speculatively decrement every child refcount, rescue everything
//! still externally anchored, then destroy what remains. Reference counts
//! of doomed cells are restored before destruction so finalizers observe
//! accurate counts.

use crate::object::{CellKind, ListTag};
use crate::runtime::{GcPhase, RuntimeState, debug_flags};
use crate::trace;
use crate::value::CellId;

impl RuntimeState {
    /// Run a full collection. Returns the number of object and bytecode
    /// cells reclaimed by the cycle sweep.
    pub(crate) fn run_gc(&mut self) -> usize {
        if self.phase != GcPhase::Idle {
            return 0;
        }
        self.collections += 1;

        // decrement the refcount of the children of each cell; mark = 1
        // after this pass
        self.gc_decref();

        // keep the cells with a non-zero refcount and their children
        self.gc_scan();

        // free the cells in a cycle
        let collected = self.gc_free_cycles();
        self.collected_total += collected;
        collected
    }

    fn gc_decref_child(&mut self, id: CellId) {
        let (ref_count, mark) = {
            let h = &mut self.cell_mut(id).header;
            debug_assert!(h.ref_count > 0);
            h.ref_count -= 1;
            (h.ref_count, h.mark)
        };
        if ref_count == 0 && mark == 1 {
            self.registry.unlink(id);
            self.registry.push_back(ListTag::Tentative, id);
        }
    }

    fn gc_decref(&mut self) {
        debug_assert!(self.registry.list(ListTag::Tentative).is_empty());
        let mut children = Vec::new();
        let mut cur = self.registry.first(ListTag::Live);
        while let Some(id) = cur {
            let next = self.registry.next(id);
            debug_assert_eq!(self.cell(id).header.mark, 0);
            trace::collect_children(self, id, &mut children);
            for i in 0..children.len() {
                self.gc_decref_child(children[i]);
            }
            self.cell_mut(id).header.mark = 1;
            if self.cell(id).header.ref_count == 0 {
                self.registry.unlink(id);
                self.registry.push_back(ListTag::Tentative, id);
            }
            cur = next;
        }
    }

    fn gc_scan_incref_child(&mut self, id: CellId) {
        let ref_count = {
            let h = &mut self.cell_mut(id).header;
            h.ref_count += 1;
            h.ref_count
        };
        if ref_count == 1 {
            // ref_count was 0: the cell is reachable after all; move it
            // back to the live list and reset the mark for the next GC
            self.registry.unlink(id);
            self.registry.push_back(ListTag::Live, id);
            self.cell_mut(id).header.mark = 0;
        }
    }

    fn gc_scan_incref_child2(&mut self, id: CellId) {
        self.cell_mut(id).header.ref_count += 1;
    }

    fn gc_scan(&mut self) {
        let mut children = Vec::new();

        // keep the cells with a refcount > 0 and their children; rescued
        // cells are appended to the live list and scanned in turn
        let mut cur = self.registry.first(ListTag::Live);
        while let Some(id) = cur {
            debug_assert!(self.cell(id).header.ref_count > 0);
            self.cell_mut(id).header.mark = 0;
            trace::collect_children(self, id, &mut children);
            for i in 0..children.len() {
                self.gc_scan_incref_child(children[i]);
            }
            cur = self.registry.next(id);
        }

        // restore the refcount of the cells to be deleted, without
        // rescuing anything
        let mut cur = self.registry.first(ListTag::Tentative);
        while let Some(id) = cur {
            trace::collect_children(self, id, &mut children);
            for i in 0..children.len() {
                self.gc_scan_incref_child2(children[i]);
            }
            cur = self.registry.next(id);
        }
    }

    fn gc_free_cycles(&mut self) -> usize {
        self.phase = GcPhase::RemoveCycles;
        let mut collected = 0;
        let mut header_done = false;

        loop {
            let id = match self.registry.first(ListTag::Tentative) {
                Some(id) => id,
                None => break,
            };
            // only the cells associated with language values need their
            // destructor here; the rest are reclaimed when the cell that
            // references them is destroyed
            match self.cell(id).header.kind {
                CellKind::Object | CellKind::FunctionBytecode => {
                    if self.debug_flags & debug_flags::DUMP_GC_FREE != 0 {
                        if !header_done {
                            eprintln!("freeing cycles:");
                            header_done = true;
                        }
                        eprintln!("  {:?} {:?}", self.cell(id).header.kind, id);
                    }
                    collected += 1;
                    self.free_gc_object(id);
                }
                _ => {
                    self.registry.unlink(id);
                    self.registry.push_back(ListTag::PendingFree, id);
                }
            }
        }
        self.phase = GcPhase::Idle;

        // sweep the zombies staged while cycles were being removed
        while let Some(id) = self.registry.first(ListTag::PendingFree) {
            debug_assert!(matches!(
                self.cell(id).header.kind,
                CellKind::Object | CellKind::FunctionBytecode
            ));
            self.registry.unlink(id);
            self.free_cell_storage(id);
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use crate::object::ListTag;
    use crate::runtime::{GcPhase, Runtime};
    use crate::value::{Atom, Value};

    fn baseline(rt: &Runtime) -> usize {
        rt.live_cell_count()
    }

    /// After run_gc the collector is idle, the working lists are empty
    /// and every live cell is unmarked.
    #[test]
    fn gc_leaves_clean_state() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let a = ctx.new_object().unwrap();
        let b = ctx.new_object().unwrap();
        ctx.set_property(a, ctx.atom("next").unwrap(), b).unwrap();
        rt.run_gc();
        let state = rt.state.read();
        assert_eq!(state.phase, GcPhase::Idle);
        assert!(state.registry.list(ListTag::Tentative).is_empty());
        assert!(state.registry.list(ListTag::PendingFree).is_empty());
        for id in state.registry.iter(ListTag::Live) {
            assert_eq!(state.cell(id).header.mark, 0);
        }
        drop(state);
        rt.release_value(a);
    }

    /// A self-cycle survives refcounting but one collection reclaims it.
    #[test]
    fn self_cycle_is_collected() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let base = baseline(&rt);

        let a = ctx.new_object().unwrap();
        rt.retain_value(a);
        ctx.set_property(a, ctx.atom("self").unwrap(), a).unwrap();
        rt.release_value(a);

        // the external reference is gone but the cycle holds it at 1
        assert_eq!(rt.ref_count(a), Some(1));
        assert!(rt.live_cell_count() > base);

        let collected = rt.run_gc();
        assert!(collected >= 1);
        assert_eq!(rt.live_cell_count(), base);
    }

    /// An emitter whose listener closure captures it through a var-ref;
    /// dropping both external references leaves a two-cell cycle.
    #[test]
    fn closure_retaining_emitter_is_collected() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let base = baseline(&rt);

        let emitter = ctx.new_object().unwrap();
        let events = ctx.new_map().unwrap();
        rt.retain_value(events);
        ctx.set_property(emitter, ctx.atom("events").unwrap(), events)
            .unwrap();

        // listener = closure capturing `emitter` via a detached var-ref
        rt.retain_value(emitter);
        let captured = ctx.new_var_ref(emitter).unwrap();
        let bytecode = ctx
            .new_function_bytecode("listener", Vec::new(), vec![0x01, 0x02], None)
            .unwrap();
        ctx.set_closure_vars(bytecode, &["emitter"]).unwrap();
        let listener = ctx.new_closure(bytecode, &[captured]).unwrap();
        rt.release_cell(captured);
        rt.release_value(bytecode);

        // events["click"] -> [listener]
        let list = ctx.new_array().unwrap();
        let click = rt.new_string("click").unwrap();
        ctx.array_push(list, listener).unwrap();
        ctx.map_set(events, click, list).unwrap();
        rt.release_value(events);

        // drop the external references; the cycle keeps both alive
        rt.release_value(emitter);
        assert_eq!(rt.ref_count(emitter), Some(1));
        assert_eq!(rt.ref_count(listener), Some(1));

        rt.run_gc();
        assert_eq!(rt.live_cell_count(), base);
    }

    /// Same graph as the emitter test, but the listener stays externally
    /// anchored, so the scan pass must restore every count.
    #[test]
    fn anchored_listener_survives_gc() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();

        let emitter = ctx.new_object().unwrap();
        rt.retain_value(emitter);
        let captured = ctx.new_var_ref(emitter).unwrap();
        let bytecode = ctx
            .new_function_bytecode("listener", Vec::new(), vec![0x01], None)
            .unwrap();
        let listener = ctx.new_closure(bytecode, &[captured]).unwrap();
        rt.release_cell(captured);
        rt.release_value(bytecode);
        ctx.set_property(emitter, ctx.atom("listener").unwrap(), listener)
            .unwrap();
        rt.retain_value(listener);
        rt.release_value(emitter);

        let emitter_refs = rt.ref_count(emitter);
        let listener_refs = rt.ref_count(listener);

        rt.run_gc();

        assert_eq!(rt.ref_count(emitter), emitter_refs);
        assert_eq!(rt.ref_count(listener), listener_refs);
        assert!(rt.is_live_object(listener));

        rt.release_value(listener);
        rt.run_gc();
        assert!(!rt.is_live_object(listener));
    }

    /// A longer closed cycle dies in exactly one collection.
    #[test]
    fn three_cell_ring_is_collected_at_once() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let base = baseline(&rt);

        let next = ctx.atom("next").unwrap();
        let a = ctx.new_object().unwrap();
        let b = ctx.new_object().unwrap();
        let c = ctx.new_object().unwrap();
        rt.retain_value(b);
        ctx.set_property(a, next, b).unwrap();
        rt.retain_value(c);
        ctx.set_property(b, next, c).unwrap();
        rt.retain_value(a);
        ctx.set_property(c, next, a).unwrap();
        rt.release_value(a);
        rt.release_value(b);
        rt.release_value(c);

        assert!(rt.live_cell_count() > base);
        rt.run_gc();
        assert_eq!(rt.live_cell_count(), base);
        // a second collection finds nothing
        assert_eq!(rt.run_gc(), 0);
    }

    /// After a collection the refcount of every survivor equals the
    /// number of references found by an independent trace from the heap.
    #[test]
    fn refcounts_match_traced_references() {
        use std::collections::HashMap;

        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let a = ctx.new_object().unwrap();
        let b = ctx.new_object().unwrap();
        rt.retain_value(b);
        ctx.set_property(a, ctx.atom("left").unwrap(), b).unwrap();
        rt.retain_value(b);
        ctx.set_property(a, ctx.atom("right").unwrap(), b).unwrap();
        ctx.set_property(ctx.global(), ctx.atom("a").unwrap(), a)
            .unwrap();
        rt.release_value(b);
        rt.run_gc();

        let state = rt.state.read();
        let mut traced: HashMap<crate::value::CellId, u32> = HashMap::new();
        for id in state.registry.iter(ListTag::Live) {
            crate::trace::mark_children(&state, id, &mut |child| {
                *traced.entry(child).or_insert(0) += 1;
            });
        }
        for id in state.registry.iter(ListTag::Live) {
            let external = traced.get(&id).copied().unwrap_or(0);
            // the remaining references are roots held by the embedder
            assert!(
                state.cell(id).header.ref_count >= external,
                "cell {:?} has fewer refs than traced edges",
                id
            );
        }
        // b is referenced exactly twice from the heap and has no root
        if let Value::Object(bid) = b {
            assert_eq!(traced.get(&bid).copied(), Some(2));
            assert_eq!(state.cell(bid).header.ref_count, 2);
        }
    }

    /// Releasing an acyclic graph must reclaim it without the collector
    /// running.
    #[test]
    fn acyclic_graph_needs_no_gc() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let base = baseline(&rt);
        let collections_before = rt.stats().collections;

        let root = ctx.new_object().unwrap();
        let child = ctx.new_object().unwrap();
        let leaf = ctx.new_object().unwrap();
        ctx.set_property(child, ctx.atom("leaf").unwrap(), leaf)
            .unwrap();
        ctx.set_property(root, ctx.atom("child").unwrap(), child)
            .unwrap();

        rt.release_value(root);
        assert_eq!(rt.live_cell_count(), base);
        assert_eq!(rt.stats().collections, collections_before);
    }

    /// A closed realm is one big cycle (native functions hold their realm,
    /// the realm holds them back); a single collection reclaims it whole.
    #[test]
    fn closing_a_context_reclaims_the_realm() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        assert!(rt.live_cell_count() > 0);

        ctx.close();
        assert!(rt.live_cell_count() > 0);
        rt.run_gc();
        assert_eq!(rt.live_cell_count(), 0);
    }

    #[test]
    fn atom_constants_resolve() {
        let rt = Runtime::new();
        let state = rt.state.read();
        assert_eq!(state.atom_str(Atom::ARRAY), "Array");
        assert_eq!(state.atom_str(Atom::PROXY), "Proxy");
    }
}
