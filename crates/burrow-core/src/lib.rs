//! # burrow-core
//!
//! Core library for out-of-process access to a running game.
//!
//! This crate provides:
//! - Versioned memory layout descriptions (offset trees, vtable
//!   registries, domain name tables)
//! - A factory resolving layout documents with base inheritance and
//!   rebasing
//! - A shared-memory protocol link to the server embedded in the
//!   target, with cooperative suspend/resume and typed memory access
//! - procfs introspection of the target process

pub mod error;
pub mod factory;
pub mod layout;
pub mod link;
pub mod memory;

pub use error::{Error, Result};
pub use factory::{Element, VersionInfoFactory};
pub use layout::{
    ClassDescriptor, ClassRegistry, DomainTables, Level, OffsetGroup, OsKind, TraitBands,
    TypeChild, VersionInfo,
};
pub use link::{
    Command, LinkConfig, LivenessProbe, MemRange, ProcessLink, Segment, SpinConfig,
    PROTOCOL_VERSION, SHM_BODY, SHM_MAX_CLIENTS,
};
pub use memory::{read_class_name, ReadMemory, CSTRING_CAP};
