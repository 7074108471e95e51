mod classes;
mod group;
mod tables;
mod version_info;

pub use classes::{ClassDescriptor, ClassRegistry, TypeChild};
pub use group::OffsetGroup;
pub(crate) use group::parse_hex_i32;
pub use tables::{DomainTables, Level, TraitBands};
pub use version_info::{OsKind, VersionInfo};
