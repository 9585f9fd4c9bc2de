use crate::backend::NodeRef;

/// Operand id to graph node binding, built once per operand.
///
/// Model inputs that cannot become graph parameters (zero-sized or
/// dimensionless) are marked invalid instead of bound.
#[derive(Debug, Clone)]
pub struct NodeTable {
    nodes: Vec<Option<NodeRef>>,
    invalid: Vec<bool>,
}

impl NodeTable {
    pub fn new(operand_count: usize) -> Self {
        Self {
            nodes: vec![None; operand_count],
            invalid: vec![false; operand_count],
        }
    }

    pub fn get(&self, id: u32) -> Option<NodeRef> {
        self.nodes.get(id as usize).copied().flatten()
    }

    pub fn set(&mut self, id: u32, node: NodeRef) {
        if let Some(slot) = self.nodes.get_mut(id as usize) {
            *slot = Some(node);
        }
    }

    pub fn mark_invalid(&mut self, id: u32) {
        if let Some(flag) = self.invalid.get_mut(id as usize) {
            *flag = true;
        }
    }

    pub fn is_invalid(&self, id: u32) -> bool {
        self.invalid.get(id as usize).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_invalidate() {
        let mut table = NodeTable::new(3);
        table.set(1, NodeRef::new(7));
        table.mark_invalid(2);
        assert_eq!(table.get(1), Some(NodeRef::new(7)));
        assert_eq!(table.get(0), None);
        assert!(table.is_invalid(2));
        assert!(!table.is_invalid(1));
        assert_eq!(table.get(99), None);
    }
}
