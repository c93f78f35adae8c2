//! The build graph: a DAG of artifacts, identified by `(cache_key, name)`.
//!
//! The wire form (produced by the `morph calculate-build-graph` helper,
//! `spec.md` §1/§6) is a nested JSON tree in which the same artifact can
//! appear more than once — once per path that depends on it — and a
//! single `cache_key` (one chunk source) can legitimately back more than
//! one *distinct* named artifact, per `spec.md` §4's chunk-coalescing
//! scenario: building one chunk source produces several named outputs,
//! all confirmed built together. Naively deserializing the wire tree into
//! owned, recursive structs either duplicates re-occurring nodes (losing
//! the "same artifact" identity the controller's readiness logic depends
//! on) or requires `Rc`/`RefCell` cycles. `spec.md` §9 recommends the
//! arena-plus-index strategy used here instead: parse into a flat
//! `Vec<ArtifactNode>` deduplicated by `(cache_key, name)` — collapsing
//! only genuine re-occurrences of the very same artifact, never distinct
//! same-source artifacts — and represent dependency edges as indices into
//! that vector.

use std::cell::Cell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Chunk,
    Stratum,
    System,
}

impl ArtifactKind {
    fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Chunk => "chunk",
            ArtifactKind::Stratum => "stratum",
            ArtifactKind::System => "system",
        }
    }
}

/// Build state of a single artifact within one controller's lifetime.
/// Not part of the wire form (`spec.md` §3): it is attached by the
/// controller after deserializing the graph and only ever moves forward
/// `Unbuilt -> Building -> Built` (`spec.md` §8's monotonicity invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Unbuilt,
    Building,
    Built,
}

#[derive(Debug)]
pub struct ArtifactNode {
    pub name: String,
    pub cache_key: String,
    pub kind: ArtifactKind,
    pub arch: String,
    pub source_name: String,
    pub dependencies: Vec<NodeId>,
    pub state: Cell<ArtifactState>,
}

impl ArtifactNode {
    pub fn basename(&self) -> String {
        format!("{}.{}.{}", self.cache_key, self.kind.as_str(), self.name)
    }
}

/// The wire-format shape: a nested tree, dependencies embedded inline.
/// Deserialized into an `ArtifactGraph`; re-expanded from one when the
/// controller needs to hand a subtree to a worker (`spec.md` §6,
/// "Serialized artifact").
#[derive(Debug, Serialize, Deserialize)]
struct WireArtifact {
    name: String,
    cache_key: String,
    kind: ArtifactKind,
    arch: String,
    source_name: String,
    #[serde(default)]
    dependencies: Vec<WireArtifact>,
}

#[derive(Debug)]
pub struct ArtifactGraph {
    nodes: Vec<ArtifactNode>,
    by_identity: HashMap<(String, String), NodeId>,
    root: NodeId,
}

impl ArtifactGraph {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let wire: WireArtifact = serde_json::from_str(s)?;
        Self::from_wire(wire)
    }

    fn from_wire(root: WireArtifact) -> Result<Self> {
        let mut nodes = Vec::new();
        let mut by_identity = HashMap::new();
        let root_id = Self::intern(&mut nodes, &mut by_identity, root);
        Ok(ArtifactGraph {
            nodes,
            by_identity,
            root: root_id,
        })
    }

    /// Recursively interns `wire` and its dependencies, reusing the node
    /// id for any `(cache_key, name)` pair already seen so that a genuine
    /// re-occurrence of the same artifact (a diamond dependency) collapses
    /// to one node in the arena. Two wire nodes sharing a `cache_key` but
    /// with different `name`s are distinct artifacts — one chunk source
    /// producing several named outputs — and each gets its own node.
    fn intern(
        nodes: &mut Vec<ArtifactNode>,
        by_identity: &mut HashMap<(String, String), NodeId>,
        wire: WireArtifact,
    ) -> NodeId {
        let identity = (wire.cache_key.clone(), wire.name.clone());
        if let Some(&id) = by_identity.get(&identity) {
            return id;
        }
        let dep_ids: Vec<NodeId> = wire
            .dependencies
            .into_iter()
            .map(|d| Self::intern(nodes, by_identity, d))
            .collect();
        let id = nodes.len();
        nodes.push(ArtifactNode {
            name: wire.name,
            cache_key: wire.cache_key,
            kind: wire.kind,
            arch: wire.arch,
            source_name: wire.source_name,
            dependencies: dep_ids,
            state: Cell::new(ArtifactState::Unbuilt),
        });
        by_identity.insert(identity, id);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &ArtifactNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node sharing `cache_key`, in arena order. A `cache_key` with
    /// more than one entry here is the chunk-coalescing case of
    /// `spec.md` §4: distinct named artifacts produced by one worker
    /// invocation, which the controller marks `Building`/`Built` together
    /// instead of dispatching (or cache-confirming) one at a time.
    pub fn nodes_with_cache_key(&self, cache_key: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.cache_key == cache_key)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn find_by_basename(&self, basename: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.basename() == basename)
    }

    /// All node ids, dependency-first (depth-first, a node is yielded
    /// only after every dependency has been), matching the original
    /// `Artifact.walk()` order.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut done = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        self.walk_from(self.root, &mut done, &mut order);
        order
    }

    fn walk_from(&self, id: NodeId, done: &mut [bool], order: &mut Vec<NodeId>) {
        if done[id] {
            return;
        }
        done[id] = true;
        for &dep in &self.nodes[id].dependencies {
            self.walk_from(dep, done, order);
        }
        order.push(id);
    }

    pub fn is_ready_to_build(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        node.state.get() == ArtifactState::Unbuilt
            && node
                .dependencies
                .iter()
                .all(|&d| self.nodes[d].state.get() == ArtifactState::Built)
    }

    pub fn mark(&self, id: NodeId, state: ArtifactState) {
        self.nodes[id].state.set(state);
    }

    pub fn is_built(&self, id: NodeId) -> bool {
        self.nodes[id].state.get() == ArtifactState::Built
    }

    /// Re-expands the subtree rooted at `id` into the nested wire form,
    /// used for the worker `exec-request`'s `stdin_contents`
    /// (`spec.md` §6).
    pub fn serialize_subtree(&self, id: NodeId) -> Result<String> {
        let wire = self.to_wire(id);
        serde_json::to_string(&wire).map_err(CoreError::from)
    }

    fn to_wire(&self, id: NodeId) -> WireArtifact {
        let node = &self.nodes[id];
        WireArtifact {
            name: node.name.clone(),
            cache_key: node.cache_key.clone(),
            kind: node.kind,
            arch: node.arch.clone(),
            source_name: node.source_name.clone(),
            dependencies: node.dependencies.iter().map(|&d| self.to_wire(d)).collect(),
        }
    }
}
