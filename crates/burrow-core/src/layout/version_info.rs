//! One identified build of the target binary: its symbolic layout facts,
//! class registry, and domain name tables.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use strum::{Display, EnumString};

use crate::error::{Error, Result};
use crate::layout::classes::ClassRegistry;
use crate::layout::group::{parse_hex_u32, OffsetGroup};
use crate::layout::tables::DomainTables;
use crate::memory::ReadMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OsKind {
    Windows,
    Linux,
    Apple,
}

impl OsKind {
    /// Default image base recorded layouts for this OS are relative to.
    /// Only windows and linux targets have one.
    pub fn default_base(self) -> Result<u32> {
        match self {
            OsKind::Windows => Ok(0x400000),
            OsKind::Linux => Ok(0),
            other => Err(Error::UnknownOs(other.to_string())),
        }
    }
}

/// A complete layout description for one build.
///
/// `Clone` produces a fully independent deep copy: the class registry is
/// exclusively owned, so mutating a copy never touches the original. The
/// factory relies on this to hand out safely-mutable copies of its cached
/// resolutions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VersionInfo {
    name: String,
    os: Option<OsKind>,
    /// Image base every recorded address and vtable is relative to.
    base: u32,
    md5: Option<String>,
    pe_timestamp: Option<u32>,
    root: OffsetGroup,
    classes: ClassRegistry,
    tables: DomainTables,
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    pub fn os(&self) -> Option<OsKind> {
        self.os
    }

    pub fn set_os(&mut self, text: &str) -> Result<()> {
        let os = OsKind::from_str(text).map_err(|_| Error::UnknownOs(text.to_owned()))?;
        self.os = Some(os);
        Ok(())
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn set_base(&mut self, base: u32) {
        self.base = base;
    }

    pub fn md5(&self) -> Option<&str> {
        self.md5.as_deref()
    }

    pub fn set_md5(&mut self, hash: &str) {
        self.md5 = Some(hash.to_lowercase());
    }

    pub fn pe_timestamp(&self) -> Option<u32> {
        self.pe_timestamp
    }

    pub fn set_pe_timestamp_hex(&mut self, text: &str) -> Result<()> {
        self.pe_timestamp = Some(parse_hex_u32("PETimeStamp", text)?);
        Ok(())
    }

    // rebasing

    /// Recompute every recorded address against `new_base` and remember it.
    pub fn rebase_addresses(&mut self, new_base: u32) {
        let delta = new_base.wrapping_sub(self.base) as i32;
        self.root.rebase_addresses(delta);
        self.base = new_base;
    }

    /// Shift every recorded vtable by `delta`. The base is untouched;
    /// vtable deltas are caller-supplied.
    pub fn rebase_vtables(&mut self, delta: i32) {
        self.classes.rebase_vtables(delta);
    }

    /// Rebase addresses and vtables with one delta computation.
    pub fn rebase_all(&mut self, new_base: u32) {
        let delta = new_base.wrapping_sub(self.base) as i32;
        self.root.rebase_addresses(delta);
        self.classes.rebase_vtables(delta);
        self.base = new_base;
    }

    // offset tree access, forwarded to the root group

    pub fn root(&self) -> &OffsetGroup {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut OffsetGroup {
        &mut self.root
    }

    pub fn address(&self, name: &str) -> Result<u32> {
        self.root.address(name)
    }

    pub fn offset(&self, name: &str) -> Result<i32> {
        self.root.offset(name)
    }

    pub fn hexvalue(&self, name: &str) -> Result<u32> {
        self.root.hexvalue(name)
    }

    pub fn string(&self, name: &str) -> Result<String> {
        self.root.string(name)
    }

    pub fn group(&self, name: &str) -> Result<&OffsetGroup> {
        self.root.group(name)
    }

    pub fn create_group(&mut self, name: &str) -> &mut OffsetGroup {
        self.root.create_group(name)
    }

    // class registry

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut ClassRegistry {
        &mut self.classes
    }

    /// Dynamic class ID of the object at `addr` in the attached target.
    pub fn resolve_object_class<R: ReadMemory>(&mut self, reader: &mut R, addr: u32) -> Result<i32> {
        self.classes.resolve_object_class(reader, addr)
    }

    // domain tables

    pub fn tables(&self) -> &DomainTables {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut DomainTables {
        &mut self.tables
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Version name=\"{}\"", self.name)?;
        if let Some(os) = self.os {
            write!(f, " os=\"{os}\"")?;
        }
        writeln!(f, " base=\"{:#x}\">", self.base)?;
        if let Some(md5) = &self.md5 {
            writeln!(f, "  <MD5 value=\"{md5}\" />")?;
        }
        if let Some(pe) = self.pe_timestamp {
            writeln!(f, "  <PETimeStamp value=\"{pe:#x}\" />")?;
        }
        writeln!(f, "<Offsets>")?;
        write!(f, "{}", self.root)?;
        writeln!(f, "</Offsets>")?;
        writeln!(f, "</Version>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_parsing_and_default_bases() {
        let mut vi = VersionInfo::new();
        vi.set_os("windows").unwrap();
        assert_eq!(vi.os().unwrap().default_base().unwrap(), 0x400000);
        vi.set_os("linux").unwrap();
        assert_eq!(vi.os().unwrap().default_base().unwrap(), 0);
        vi.set_os("apple").unwrap();
        assert!(vi.os().unwrap().default_base().is_err());
        assert!(matches!(vi.set_os("beos"), Err(Error::UnknownOs(_))));
    }

    #[test]
    fn test_rebase_round_trip_restores_addresses() {
        let mut vi = VersionInfo::new();
        vi.set_base(0x400000);
        vi.root_mut().set_address("creatures", "0x400abc").unwrap();
        vi.create_group("Maps").set_address("map_data", "0x401000").unwrap();

        vi.rebase_addresses(0x800000);
        assert_eq!(vi.address("creatures").unwrap(), 0x800abc);
        assert_eq!(vi.base(), 0x800000);

        vi.rebase_addresses(0x400000);
        assert_eq!(vi.address("creatures").unwrap(), 0x400abc);
        assert_eq!(vi.group("Maps").unwrap().address("map_data").unwrap(), 0x401000);
        assert_eq!(vi.base(), 0x400000);
    }

    #[test]
    fn test_rebase_all_shares_one_delta() {
        let mut vi = VersionInfo::new();
        vi.set_base(0);
        vi.root_mut().set_address("a", "0x100").unwrap();
        vi.classes_mut().declare_class("building", 0x5000, 0);
        vi.rebase_all(0x10);
        assert_eq!(vi.address("a").unwrap(), 0x110);
        assert_eq!(vi.classes().vtable_of("building"), Some(0x5010));
        assert_eq!(vi.base(), 0x10);
    }

    #[test]
    fn test_copy_independence_across_all_parts() {
        let mut original = VersionInfo::new();
        original.set_name("v1");
        original.root_mut().set_offset("x", "1").unwrap();
        original.classes_mut().declare_class("building", 0x100, 0);
        original.tables_mut().set_profession(0, "miner");

        let mut copy = original.clone();
        copy.root_mut().set_offset("x", "5").unwrap();
        copy.classes_mut().declare_class("building", 0x999, 0);
        copy.classes_mut().declare_class("brand_new", 0x200, 0);
        copy.tables_mut().set_profession(0, "mason");

        assert_eq!(original.offset("x").unwrap(), 1);
        assert_eq!(original.classes().vtable_of("building"), Some(0x100));
        assert_eq!(original.classes().class_id_of("brand_new"), None);
        assert_eq!(original.tables().profession(0).unwrap(), "miner");

        assert_eq!(copy.offset("x").unwrap(), 5);
        assert_eq!(copy.classes().vtable_of("building"), Some(0x999));
    }

    #[test]
    fn test_md5_is_normalized() {
        let mut vi = VersionInfo::new();
        vi.set_md5("AbCd1234");
        assert_eq!(vi.md5(), Some("abcd1234"));
    }

    #[test]
    fn test_serializes_to_json() {
        let mut vi = VersionInfo::new();
        vi.set_name("v0.1");
        vi.set_os("linux").unwrap();
        vi.create_group("Maps").set_address("map_data", "0x1000").unwrap();

        let json = serde_json::to_value(&vi).unwrap();
        assert_eq!(json["name"], "v0.1");
        assert_eq!(json["root"]["groups"]["Maps"]["addresses"]["map_data"], 0x1000);
    }
}
