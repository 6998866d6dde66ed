use std::sync::Arc;

use waypoint_registry::ServiceInstance;

/// Yields one node per attempt for a single call.
///
/// The first pass walks the candidates in the order chosen by the selection
/// strategy, so no node repeats until every candidate has been handed out.
/// After that the generator keeps cycling over the same candidates in the
/// order the registry listed them.
#[derive(Clone, Debug)]
pub struct NodeGenerator {
    nodes: Arc<[ServiceInstance]>,
    wrap_order: Arc<[usize]>,
    cursor: usize,
}

impl NodeGenerator {
    /// Build a generator from `(registry position, instance)` pairs already in
    /// strategy order.
    pub(crate) fn from_ranked(ranked: Vec<(usize, ServiceInstance)>) -> Self {
        let mut wrap_order: Vec<usize> = (0..ranked.len()).collect();
        wrap_order.sort_by_key(|&i| ranked[i].0);

        Self {
            nodes: ranked.into_iter().map(|(_, node)| node).collect(),
            wrap_order: wrap_order.into(),
            cursor: 0,
        }
    }

    /// Generator over fixed instances, handed out in the given order.
    pub fn from_instances(instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        Self::from_ranked(instances.into_iter().enumerate().collect())
    }

    /// Number of distinct candidates.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether there are no candidates at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether every candidate has been handed out at least once.
    pub fn exhausted(&self) -> bool {
        self.cursor >= self.nodes.len()
    }
}

impl Iterator for NodeGenerator {
    type Item = ServiceInstance;

    /// Never returns `None` unless the generator is empty.
    fn next(&mut self) -> Option<Self::Item> {
        let len = self.nodes.len();
        if len == 0 {
            return None;
        }

        let index = if self.cursor < len {
            self.cursor
        } else {
            self.wrap_order[(self.cursor - len) % len]
        };
        self.cursor += 1;

        Some(self.nodes[index].clone())
    }
}
