//! Shared, I/O-free types for the distbuild coordination core: the wire
//! message schema, the artifact dependency graph, identifier minting and
//! the outgoing/incoming id correlation table.

pub mod artifact;
pub mod error;
pub mod idgen;
pub mod message;
pub mod route_map;

pub use artifact::{ArtifactGraph, ArtifactKind, ArtifactState, NodeId};
pub use error::CoreError;
pub use idgen::IdGen;
pub use message::{BuildStep, Message};
pub use route_map::RouteMap;
