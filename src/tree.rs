use std::collections::HashMap;
use std::rc::Rc;

use anyhow::anyhow;

use crate::catalog::Catalog;
use crate::checksum::sizes_agree;
use crate::types::ChecksumSet;

const ROOT: usize = 0;
/// Upper bound on traversal passes triggered by rechecks.
pub const MAX_PASSES: usize = 8;

#[derive(Debug, Clone)]
struct TreeNode {
    name: String,
    /// Explicitly requested, as opposed to present only as an ancestor.
    check: bool,
    checked: bool,
    rechecked: bool,
    children: Vec<usize>,
}

impl TreeNode {
    fn new(name: &str, check: bool) -> Self {
        TreeNode {
            name: name.to_string(),
            check,
            checked: false,
            rechecked: false,
            children: Vec::new(),
        }
    }
}

/// What the visitor sees of one node during traversal.
#[derive(Debug)]
pub struct Frame<'a, H> {
    pub name: &'a str,
    /// Whether this node should be verified and fixed on this visit.
    pub process: bool,
    pub parent: Option<&'a Rc<H>>,
    pub grandparent: Option<&'a Rc<H>>,
}

/// The visitor's answer for one node.
#[derive(Debug)]
pub struct Visit<H> {
    /// Opened handle passed down to children as their lineage.
    pub handle: Option<Rc<H>>,
    pub checked: bool,
    /// Games to verify again.
    pub rechecks: Vec<String>,
    /// Content moved to the needed pool; games expecting it are rechecked.
    pub needed: Vec<(Option<u64>, ChecksumSet)>,
}

impl<H> Visit<H> {
    pub fn skip(handle: Option<Rc<H>>) -> Self {
        Visit {
            handle,
            checked: false,
            rechecks: Vec::new(),
            needed: Vec::new(),
        }
    }
}

/// Requested games arranged under their parents and grandparents.
#[derive(Debug, Clone)]
pub struct GameTree {
    nodes: Vec<TreeNode>,
    by_name: HashMap<String, usize>,
}

impl Default for GameTree {
    fn default() -> Self {
        GameTree::new()
    }
}

impl GameTree {
    pub fn new() -> Self {
        GameTree {
            nodes: vec![TreeNode::new("", false)],
            by_name: HashMap::new(),
        }
    }

    /// Adds `name` below its grandparent and parent, creating ancestor
    /// nodes as needed. Inserting the same game twice changes nothing.
    pub fn insert(&mut self, catalog: &dyn Catalog, name: &str) -> anyhow::Result<()> {
        let game = catalog
            .find_game(name)?
            .ok_or_else(|| anyhow!("game not found in catalog: {name}"))?;
        let mut at = ROOT;
        if let Some(grandparent) = &game.grandparent {
            at = self.add_child(at, grandparent, false);
        }
        if let Some(parent) = &game.parent {
            at = self.add_child(at, parent, false);
        }
        self.add_child(at, &game.name, true);
        Ok(())
    }

    fn add_child(&mut self, parent: usize, name: &str, check: bool) -> usize {
        let children = &self.nodes[parent].children;
        match children.binary_search_by(|child| self.nodes[*child].name.as_str().cmp(name)) {
            Ok(pos) => {
                let idx = children[pos];
                if check {
                    self.nodes[idx].check = true;
                }
                idx
            }
            Err(pos) => {
                let idx = self.nodes.len();
                self.nodes.push(TreeNode::new(name, check));
                self.nodes[parent].children.insert(pos, idx);
                self.by_name.entry(name.to_string()).or_insert(idx);
                idx
            }
        }
    }

    /// Marks `name` for another verification pass. Returns whether the
    /// node is one that gets processed.
    pub fn recheck(&mut self, name: &str) -> bool {
        let Some(&idx) = self.by_name.get(name) else {
            return false;
        };
        let node = &mut self.nodes[idx];
        node.checked = false;
        node.rechecked = true;
        node.check
    }

    /// Rechecks every game that expects the given content in its own container.
    pub fn recheck_games_needing(
        &mut self,
        catalog: &dyn Catalog,
        size: Option<u64>,
        checksums: &ChecksumSet,
    ) -> anyhow::Result<Vec<String>> {
        let mut rechecked = Vec::new();
        for location in catalog.find_locations(size, checksums)? {
            if location.inherited {
                continue;
            }
            let Some(game) = catalog.find_game(&location.game)? else {
                continue;
            };
            let Some(file) = game.files.get(location.index) else {
                continue;
            };
            if sizes_agree(file.size, size)
                && self.recheck(&game.name)
                && !rechecked.contains(&game.name)
            {
                rechecked.push(game.name);
            }
        }
        Ok(rechecked)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn is_checked(&self, name: &str) -> Option<bool> {
        self.by_name.get(name).map(|idx| self.nodes[*idx].checked)
    }

    /// Number of nodes that were explicitly requested.
    pub fn requested(&self) -> usize {
        self.nodes.iter().filter(|node| node.check).count()
    }

    /// Children of `name` (or of the root for `None`), in order.
    pub fn children(&self, name: Option<&str>) -> Vec<&str> {
        let idx = match name {
            None => ROOT,
            Some(name) => match self.by_name.get(name) {
                Some(idx) => *idx,
                None => return Vec::new(),
            },
        };
        self.nodes[idx]
            .children
            .iter()
            .map(|child| self.nodes[*child].name.as_str())
            .collect()
    }

    /// Depth-first walk, parents before children, repeated while rechecked
    /// nodes remain and at most [`MAX_PASSES`] times. Each node's handle
    /// lives until its subtree is done. Returns the number of passes.
    pub fn traverse<H, F>(&mut self, catalog: &dyn Catalog, mut visit: F) -> anyhow::Result<usize>
    where
        F: FnMut(&Frame<'_, H>) -> anyhow::Result<Visit<H>>,
    {
        let mut passes = 0;
        loop {
            passes += 1;
            let first = passes == 1;
            for child in self.nodes[ROOT].children.clone() {
                if first || self.subtree_pending(child) {
                    self.visit_node(catalog, child, None, None, first, &mut visit)?;
                }
            }
            let pending = self.nodes.iter().any(|node| Self::is_pending(node));
            if !pending || passes >= MAX_PASSES {
                return Ok(passes);
            }
        }
    }

    fn is_pending(node: &TreeNode) -> bool {
        node.check && node.rechecked && !node.checked
    }

    fn subtree_pending(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        Self::is_pending(node)
            || node
                .children
                .iter()
                .any(|child| self.subtree_pending(*child))
    }

    fn visit_node<H, F>(
        &mut self,
        catalog: &dyn Catalog,
        idx: usize,
        parent: Option<&Rc<H>>,
        grandparent: Option<&Rc<H>>,
        first: bool,
        visit: &mut F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(&Frame<'_, H>) -> anyhow::Result<Visit<H>>,
    {
        let node = &self.nodes[idx];
        let process = node.check && !node.checked && (first || node.rechecked);
        let name = node.name.clone();
        if process {
            self.nodes[idx].rechecked = false;
        }

        let outcome = visit(&Frame {
            name: &name,
            process,
            parent,
            grandparent,
        })?;
        if process && outcome.checked {
            self.nodes[idx].checked = true;
        }
        for other in &outcome.rechecks {
            self.recheck(other);
        }
        for (size, checksums) in &outcome.needed {
            self.recheck_games_needing(catalog, *size, checksums)?;
        }

        let handle = outcome.handle;
        for child in self.nodes[idx].children.clone() {
            if first || self.subtree_pending(child) {
                self.visit_node(catalog, child, handle.as_ref(), parent, first, visit)?;
            }
        }
        Ok(())
    }
}
