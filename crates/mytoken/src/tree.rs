//! Token hierarchy listings.

use mytoken_core::{MytokenResult, TokenHash};
use mytoken_store::{NodeFilter, NodeRecord, Transaction};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenTree {
    pub token: NodeRecord,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TokenTree>,
}

impl TokenTree {
    /// Number of nodes in this tree, root included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TokenTree::node_count).sum::<usize>()
    }

    pub fn find(&self, id: &TokenHash) -> Option<&TokenTree> {
        if self.token.id == *id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}

fn attach(token: NodeRecord, pool: &mut Vec<NodeRecord>) -> TokenTree {
    let (children, rest): (Vec<NodeRecord>, Vec<NodeRecord>) = std::mem::take(pool)
        .into_iter()
        .partition(|n| n.parent_id.as_ref() == Some(&token.id));
    *pool = rest;
    let children = children
        .into_iter()
        .map(|child| attach(child, pool))
        .collect();
    TokenTree { token, children }
}

/// Build trees from a flat node list. Roots are nodes without a parent or
/// whose parent is themselves; nodes whose parent is not in the list are
/// dropped.
pub fn reconstruct_tree(nodes: Vec<NodeRecord>) -> Vec<TokenTree> {
    let (roots, mut pool): (Vec<NodeRecord>, Vec<NodeRecord>) =
        nodes.into_iter().partition(NodeRecord::is_root);
    roots
        .into_iter()
        .map(|root| attach(root, &mut pool))
        .collect()
}

/// All trees owned by one upstream identity.
pub fn token_tree<T: Transaction>(
    tx: &mut T,
    subject: &str,
    issuer: &str,
) -> MytokenResult<Vec<TokenTree>> {
    let nodes = tx.list_nodes(&NodeFilter::Owner {
        subject: subject.to_string(),
        issuer: issuer.to_string(),
    })?;
    Ok(reconstruct_tree(nodes))
}

/// The tree below (and including) `id`.
pub fn subtree<T: Transaction>(tx: &mut T, id: &TokenHash) -> MytokenResult<Option<TokenTree>> {
    let Some(node) = tx.get_node(id)? else {
        return Ok(None);
    };
    let mut pool: Vec<NodeRecord> = tx
        .list_nodes(&NodeFilter::Root(node.root_id.clone()))?
        .into_iter()
        .filter(|n| n.id != *id)
        .collect();
    Ok(Some(attach(node, &mut pool)))
}
