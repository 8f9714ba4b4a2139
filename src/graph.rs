//! Taint propagation over the async-resource graph.

use crate::node::{Node, NodeFlags};

/// ORs `flag` into `root` (if neither `mask` nor `flag` is already present),
/// then recurses into both `executionTargets` and `triggerTargets`.
///
/// The guard checks `mask | flag`, not just `mask`: a node already carrying
/// `flag` must stop recursion too, or a cycle of nodes that `mask` alone
/// doesn't consider finished (e.g. two pending promises mutually triggering
/// each other) recurses forever. Testing *before* recursing, rather than
/// after, is what makes this safe on such cycles.
pub(crate) fn taint(root: &Node, mask: NodeFlags, flag: NodeFlags) {
    if root.flags().intersects(mask | flag) {
        return;
    }
    root.insert_flags(flag);
    for child in root.execution_targets() {
        taint(&child, mask, flag);
    }
    for child in root.trigger_targets() {
        taint(&child, mask, flag);
    }
}

/// Policy: when a fiber's cancellation signal fires, taint from the fiber's
/// root with mask `FINALIZED` and flag `ABORTED` — any node not already
/// finished inherits `ABORTED`; finished nodes are skipped and do not
/// propagate further.
pub(crate) fn abort_fiber(root: &Node) {
    taint(root, NodeFlags::finalized_mask(), NodeFlags::ABORTED);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ResourceType;

    fn child_of(parent: &Node, fiber_id: u64) -> Node {
        let n = Node::new_child(ResourceType::Promise, None, fiber_id);
        n.set_execution_origin(parent);
        parent.link_execution_child(&n);
        n.set_trigger_origin(parent);
        parent.link_trigger_child(&n);
        n
    }

    #[test]
    fn taint_propagates_through_execution_and_trigger_edges() {
        let root = Node::new_root(1);
        let a = child_of(&root, 1);
        let b = child_of(&a, 1);

        abort_fiber(&root);

        assert!(root.flags().contains(NodeFlags::ABORTED));
        assert!(a.flags().contains(NodeFlags::ABORTED));
        assert!(b.flags().contains(NodeFlags::ABORTED));
    }

    #[test]
    fn taint_skips_already_finalized_nodes_and_their_descendants() {
        let root = Node::new_root(1);
        let finished = child_of(&root, 1);
        finished.insert_flags(NodeFlags::RESOLVED);
        let grandchild = child_of(&finished, 1);

        abort_fiber(&root);

        assert!(root.flags().contains(NodeFlags::ABORTED));
        assert!(!finished.flags().contains(NodeFlags::ABORTED));
        assert!(!grandchild.flags().contains(NodeFlags::ABORTED));
    }

    #[test]
    fn taint_terminates_on_a_trigger_cycle() {
        let root = Node::new_root(1);
        let a = child_of(&root, 1);
        let b = child_of(&root, 1);
        // Force a cycle: a triggers b, b triggers a.
        a.link_trigger_child(&b);
        b.set_trigger_origin(&a);
        b.link_trigger_child(&a);
        a.set_trigger_origin(&b);

        abort_fiber(&root);

        assert!(a.flags().contains(NodeFlags::ABORTED));
        assert!(b.flags().contains(NodeFlags::ABORTED));
    }
}
