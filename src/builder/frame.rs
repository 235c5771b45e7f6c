use smallvec::SmallVec;

use crate::alg::node::AlgNode;

/// Table aliases under which one field can be referenced.
pub(crate) type Aliases = SmallVec<[String; 2]>;

/// One entry of the builder stack: an immutable node plus the aliases of its fields.
#[derive(Clone, Debug)]
pub(crate) struct Frame {
    pub(crate) node: AlgNode,
    pub(crate) aliases: Vec<Aliases>,
}

impl Frame {
    pub(crate) fn new(node: AlgNode, alias: Option<&str>) -> Self {
        let aliases = (0..node.field_count())
            .map(|_| alias.map(|a| Aliases::from_iter([a.to_string()])).unwrap_or_default())
            .collect();
        Self { node, aliases }
    }

    pub(crate) fn with_aliases(node: AlgNode, aliases: Vec<Aliases>) -> Self {
        debug_assert_eq!(node.field_count(), aliases.len());
        Self { node, aliases }
    }

    /// Same aliases over a replacement node with the same field count.
    pub(crate) fn replaced(&self, node: AlgNode) -> Self {
        Self {
            node,
            aliases: self.aliases.clone(),
        }
    }

    pub(crate) fn has_alias(&self, ordinal: usize, alias: &str) -> bool {
        self.aliases
            .get(ordinal)
            .map(|set| set.iter().any(|a| a == alias))
            .unwrap_or(false)
    }
}
