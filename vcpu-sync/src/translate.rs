use vm_memory::GuestAddress;

use crate::{PhysicalMap, PAGE_SIZE};

/// Number of entries in one page table node.
pub const ENTRIES_PER_NODE: usize = PAGE_SIZE / std::mem::size_of::<u64>();

/// One page of page table entries, as built by the host.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTableNode {
    pub entries: [u64; ENTRIES_PER_NODE],
}

impl PageTableNode {
    pub const fn new() -> Self {
        Self {
            entries: [0; ENTRIES_PER_NODE],
        }
    }
}

impl Default for PageTableNode {
    fn default() -> Self {
        Self::new()
    }
}

/// What the page table builder needs to install a node into the guest.
pub trait PhysicalTranslator {
    /// Guest physical address of `node`. Never fails: a node outside guest
    /// memory terminates the process.
    fn translate_to_physical(&self, node: &PageTableNode) -> GuestAddress;
}

/// [`PhysicalTranslator`] over a [`PhysicalMap`].
#[derive(Clone, Copy, Debug)]
pub struct NodeTranslator<M> {
    map: M,
}

impl<M: PhysicalMap> NodeTranslator<M> {
    pub fn new(map: M) -> Self {
        Self { map }
    }
}

impl<M: PhysicalMap> PhysicalTranslator for NodeTranslator<M> {
    fn translate_to_physical(&self, node: &PageTableNode) -> GuestAddress {
        let virt = node as *const PageTableNode as usize;
        // A node is a single aligned page, so it is either fully backed by
        // one region or not at all.
        match self.map.resolve(virt) {
            Some(resolved) if resolved.length >= PAGE_SIZE => resolved.physical,
            _ => crate::fatal!(
                "unable to translate page table node at {:#x} to physical address",
                virt
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PhysicalRegion, PhysicalRegions};

    #[test]
    fn test_node_layout() {
        assert_eq!(std::mem::size_of::<PageTableNode>(), PAGE_SIZE);
        assert_eq!(std::mem::align_of::<PageTableNode>(), PAGE_SIZE);
    }

    #[test]
    fn test_translate_nodes() {
        let nodes = vec![PageTableNode::new(); 4];
        let base = nodes.as_ptr() as usize;
        let map = PhysicalRegions::new(vec![PhysicalRegion::new(
            base,
            GuestAddress(0x20_0000),
            nodes.len() * PAGE_SIZE,
        )])
        .unwrap();

        let translator = NodeTranslator::new(&map);
        for (i, node) in nodes.iter().enumerate() {
            assert_eq!(
                translator.translate_to_physical(node),
                GuestAddress(0x20_0000 + (i * PAGE_SIZE) as u64)
            );
        }
    }
}
