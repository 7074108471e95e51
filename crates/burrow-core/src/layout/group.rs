//! Hierarchical store of named layout facts.
//!
//! A group owns four maps of typed bindings plus named child groups.
//! Every binding is either *declared* (the name is known, e.g. from a
//! base version's skeleton pass) or *set* to a concrete value. Lookups
//! never invent defaults: an absent name and a declared-but-unset name
//! are both hard errors, with distinct variants.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Parse a hex literal, `0x` prefix optional.
pub(crate) fn parse_hex_u32(name: &str, text: &str) -> Result<u32> {
    let t = text.trim();
    let digits = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).unwrap_or(t);
    u32::from_str_radix(digits, 16).map_err(|_| Error::BadHexValue {
        name: name.to_owned(),
        value: text.to_owned(),
    })
}

/// Signed variant for offsets; accepts a leading minus.
pub(crate) fn parse_hex_i32(name: &str, text: &str) -> Result<i32> {
    let t = text.trim();
    let (neg, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let magnitude = parse_hex_u32(name, t)? as i64;
    let value = if neg { -magnitude } else { magnitude };
    i32::try_from(value).map_err(|_| Error::BadHexValue {
        name: name.to_owned(),
        value: text.to_owned(),
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OffsetGroup {
    #[serde(skip)]
    path: String,
    addresses: BTreeMap<String, Option<u32>>,
    offsets: BTreeMap<String, Option<i32>>,
    hexvalues: BTreeMap<String, Option<u32>>,
    strings: BTreeMap<String, Option<String>>,
    groups: BTreeMap<String, OffsetGroup>,
}

impl OffsetGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slash-joined path of this group, ending in `/`. Empty for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn full_key(&self, name: &str) -> String {
        format!("{}{}", self.path, name)
    }

    // declaration pass: install the name without a value

    pub fn create_address(&mut self, name: &str) {
        self.addresses.entry(name.to_owned()).or_insert(None);
    }

    pub fn create_offset(&mut self, name: &str) {
        self.offsets.entry(name.to_owned()).or_insert(None);
    }

    pub fn create_hexvalue(&mut self, name: &str) {
        self.hexvalues.entry(name.to_owned()).or_insert(None);
    }

    pub fn create_string(&mut self, name: &str) {
        self.strings.entry(name.to_owned()).or_insert(None);
    }

    // value pass: parse and store, last write wins

    pub fn set_address(&mut self, name: &str, text: &str) -> Result<()> {
        let value = parse_hex_u32(&self.full_key(name), text)?;
        self.addresses.insert(name.to_owned(), Some(value));
        Ok(())
    }

    pub fn set_offset(&mut self, name: &str, text: &str) -> Result<()> {
        let value = parse_hex_i32(&self.full_key(name), text)?;
        self.offsets.insert(name.to_owned(), Some(value));
        Ok(())
    }

    pub fn set_hexvalue(&mut self, name: &str, text: &str) -> Result<()> {
        let value = parse_hex_u32(&self.full_key(name), text)?;
        self.hexvalues.insert(name.to_owned(), Some(value));
        Ok(())
    }

    pub fn set_string(&mut self, name: &str, text: &str) -> Result<()> {
        self.strings.insert(name.to_owned(), Some(text.to_owned()));
        Ok(())
    }

    fn fetch<T: Clone>(
        &self,
        map: &BTreeMap<String, Option<T>>,
        kind: &'static str,
        name: &str,
    ) -> Result<T> {
        match map.get(name) {
            Some(Some(v)) => Ok(v.clone()),
            Some(None) => Err(Error::UnsetDefinition {
                kind,
                name: self.full_key(name),
            }),
            None => Err(Error::MissingDefinition {
                kind,
                name: self.full_key(name),
            }),
        }
    }

    pub fn address(&self, name: &str) -> Result<u32> {
        self.fetch(&self.addresses, "address", name)
    }

    pub fn offset(&self, name: &str) -> Result<i32> {
        self.fetch(&self.offsets, "offset", name)
    }

    pub fn hexvalue(&self, name: &str) -> Result<u32> {
        self.fetch(&self.hexvalues, "hexvalue", name)
    }

    pub fn string(&self, name: &str) -> Result<String> {
        self.fetch(&self.strings, "string", name)
    }

    /// Non-failing lookups for callers to whom absence is ordinary.
    pub fn try_address(&self, name: &str) -> Option<u32> {
        self.addresses.get(name).copied().flatten()
    }

    pub fn try_offset(&self, name: &str) -> Option<i32> {
        self.offsets.get(name).copied().flatten()
    }

    pub fn try_hexvalue(&self, name: &str) -> Option<u32> {
        self.hexvalues.get(name).copied().flatten()
    }

    pub fn try_string(&self, name: &str) -> Option<&str> {
        self.strings.get(name).and_then(|v| v.as_deref())
    }

    /// Child group, created on first use. First-pass intent.
    pub fn create_group(&mut self, name: &str) -> &mut OffsetGroup {
        let path = format!("{}{}/", self.path, name);
        self.groups
            .entry(name.to_owned())
            .or_insert_with(|| OffsetGroup {
                path,
                ..OffsetGroup::default()
            })
    }

    /// Child group that must already exist. Later-pass intent.
    pub fn group(&self, name: &str) -> Result<&OffsetGroup> {
        self.groups.get(name).ok_or_else(|| Error::MissingDefinition {
            kind: "group",
            name: self.full_key(name),
        })
    }

    pub fn group_mut(&mut self, name: &str) -> Result<&mut OffsetGroup> {
        let key = self.full_key(name);
        self.groups.get_mut(name).ok_or(Error::MissingDefinition {
            kind: "group",
            name: key,
        })
    }

    /// Descend (creating along the way) to the group at `path`.
    pub(crate) fn group_mut_by_path(&mut self, path: &[String]) -> &mut OffsetGroup {
        let mut cur = self;
        for name in path {
            cur = cur.create_group(name);
        }
        cur
    }

    /// Shift every set address in this group and all children by `delta`.
    pub fn rebase_addresses(&mut self, delta: i32) {
        for value in self.addresses.values_mut() {
            if let Some(v) = value {
                *v = v.wrapping_add(delta as u32);
            }
        }
        for group in self.groups.values_mut() {
            group.rebase_addresses(delta);
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "    ".repeat(depth);
        for (name, value) in &self.addresses {
            match value {
                Some(v) => writeln!(f, "{pad}<address name=\"{name}\" value=\"{v:#x}\" />")?,
                None => writeln!(f, "{pad}<address name=\"{name}\" /> NOT SET")?,
            }
        }
        for (name, value) in &self.offsets {
            match value {
                Some(v) => writeln!(f, "{pad}<offset name=\"{name}\" value=\"{v:#x}\" />")?,
                None => writeln!(f, "{pad}<offset name=\"{name}\" /> NOT SET")?,
            }
        }
        for (name, value) in &self.hexvalues {
            match value {
                Some(v) => writeln!(f, "{pad}<hexvalue name=\"{name}\" value=\"{v:#x}\" />")?,
                None => writeln!(f, "{pad}<hexvalue name=\"{name}\" /> NOT SET")?,
            }
        }
        for (name, value) in &self.strings {
            match value {
                Some(v) => writeln!(f, "{pad}<string name=\"{name}\" value=\"{v}\" />")?,
                None => writeln!(f, "{pad}<string name=\"{name}\" /> NOT SET")?,
            }
        }
        for (name, group) in &self.groups {
            writeln!(f, "{pad}<group name=\"{name}\">")?;
            group.fmt_indented(f, depth + 1)?;
            writeln!(f, "{pad}</group>")?;
        }
        Ok(())
    }
}

impl fmt::Display for OffsetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}
