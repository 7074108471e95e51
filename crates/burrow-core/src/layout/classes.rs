//! Polymorphic class registry: vtable values to numeric class IDs.
//!
//! IDs are assigned sequentially and never reused for the life of a
//! registry. `classnames[id]` always recovers the name of the class or
//! multiclass child that owns `id`. The registry is small (tens to low
//! hundreds of entries), so linear name scans are fine.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::group::parse_hex_u32;
use crate::memory::{self, ReadMemory};

/// A concrete subtype of a multiclass, selected by a discriminator value.
#[derive(Debug, Clone, Serialize)]
pub struct TypeChild {
    pub name: String,
    /// Globally unique class ID of this child.
    pub assign: u32,
    /// Discriminator value that selects this child.
    pub kind: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassDescriptor {
    pub name: String,
    /// This class's own ID.
    pub assign: u32,
    /// Recorded vtable pointer value, 0 when unknown for this build.
    pub vtable: u32,
    /// Nonzero marks a multiclass: byte offset of the discriminator
    /// field from the object base.
    pub type_offset: u32,
    pub children: Vec<TypeChild>,
}

impl ClassDescriptor {
    pub fn is_multiclass(&self) -> bool {
        self.type_offset != 0
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ClassRegistry {
    classes: Vec<ClassDescriptor>,
    /// Parallel ID -> name lookup covering classes and children.
    classnames: Vec<String>,
    /// Next ID to assign. Strictly increasing, never reused.
    class_index: u32,
    /// Runtime vtable -> class cache. Deliberately not cloned: recorded
    /// vtables shift under rebasing and the cache is cheap to rebuild.
    #[serde(skip)]
    vtable_cache: HashMap<u32, usize>,
}

impl Clone for ClassRegistry {
    fn clone(&self) -> Self {
        Self {
            classes: self.classes.clone(),
            classnames: self.classnames.clone(),
            class_index: self.class_index,
            vtable_cache: HashMap::new(),
        }
    }
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class, idempotently by name.
    ///
    /// Re-declaring updates the vtable and type offset only with nonzero
    /// values, so a partial later declaration never clobbers known facts.
    /// Returns the index of the descriptor in [`Self::classes`].
    pub fn declare_class(&mut self, name: &str, vtable: u32, type_offset: u32) -> usize {
        for (i, cls) in self.classes.iter_mut().enumerate() {
            if cls.name == name {
                if vtable != 0 {
                    cls.vtable = vtable;
                }
                if type_offset != 0 {
                    cls.type_offset = type_offset;
                }
                return i;
            }
        }
        let assign = self.class_index;
        self.class_index += 1;
        self.classnames.push(name.to_owned());
        self.classes.push(ClassDescriptor {
            name: name.to_owned(),
            assign,
            vtable,
            type_offset,
            children: Vec::new(),
        });
        self.classes.len() - 1
    }

    /// Register a multiclass child, idempotently by name within the parent.
    /// `kind_text` is the hex discriminator value from the description.
    pub fn declare_class_child(&mut self, parent: usize, name: &str, kind_text: &str) -> Result<()> {
        let kind =
            u16::try_from(parse_hex_u32(name, kind_text)?).map_err(|_| Error::BadHexValue {
                name: name.to_owned(),
                value: kind_text.to_owned(),
            })?;
        let children = &mut self.classes[parent].children;
        for child in children.iter_mut() {
            if child.name == name {
                child.kind = kind;
                return Ok(());
            }
        }
        let assign = self.class_index;
        self.class_index += 1;
        self.classnames.push(name.to_owned());
        self.classes[parent].children.push(TypeChild {
            name: name.to_owned(),
            assign,
            kind,
        });
        Ok(())
    }

    /// Resolve the dynamic class ID of the object at `addr` in the target.
    ///
    /// Reads the vtable pointer from the object's first four bytes. On a
    /// cache miss the dynamic type name is read from the live target and
    /// the matching descriptor is registered or found. For a multiclass
    /// the discriminator field selects a child; an unmatched discriminator
    /// falls back to the parent's own ID rather than failing.
    pub fn resolve_object_class<R: ReadMemory>(&mut self, reader: &mut R, addr: u32) -> Result<i32> {
        let vtable = reader.read_u32(addr)?;
        let idx = match self.vtable_cache.get(&vtable) {
            Some(&i) => i,
            None => {
                let name = memory::read_class_name(reader, vtable)?;
                debug!(vtable = format_args!("{vtable:#x}"), name, "caching class for vtable");
                let i = self.declare_class(&name, vtable, 0);
                self.vtable_cache.insert(vtable, i);
                i
            }
        };
        let cls = &self.classes[idx];
        if !cls.is_multiclass() {
            return Ok(cls.assign as i32);
        }
        let kind = reader.read_u16(addr.wrapping_add(cls.type_offset))?;
        for child in &cls.children {
            if child.kind == kind {
                return Ok(child.assign as i32);
            }
        }
        // Unmatched discriminator: degrade to the parent's own ID.
        Ok(cls.assign as i32)
    }

    pub fn vtable_of(&self, name: &str) -> Option<u32> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.vtable)
    }

    pub fn class_id_of(&self, name: &str) -> Option<i32> {
        self.classnames
            .iter()
            .position(|n| n == name)
            .map(|i| i as i32)
    }

    pub fn class_name_of(&self, id: i32) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.classnames.get(i))
            .map(String::as_str)
    }

    pub fn classes(&self) -> &[ClassDescriptor] {
        &self.classes
    }

    /// The flat ID -> name table, one entry per assigned ID.
    pub fn classnames(&self) -> &[String] {
        &self.classnames
    }

    /// Register a class from a description's hex strings.
    pub fn declare_class_from_text(
        &mut self,
        name: &str,
        vtable_text: Option<&str>,
        type_offset_text: Option<&str>,
    ) -> Result<usize> {
        let vtable = match vtable_text {
            Some(t) => parse_hex_u32(name, t)?,
            None => 0,
        };
        let type_offset = match type_offset_text {
            Some(t) => parse_hex_u32(name, t)?,
            None => 0,
        };
        Ok(self.declare_class(name, vtable, type_offset))
    }

    /// Shift every recorded vtable by `delta`.
    pub fn rebase_vtables(&mut self, delta: i32) {
        for cls in &mut self.classes {
            cls.vtable = cls.vtable.wrapping_add(delta as u32);
        }
        self.vtable_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mock::MockMemory;

    #[test]
    fn test_declare_is_idempotent_nonzero_wins() {
        let mut reg = ClassRegistry::new();
        let i = reg.declare_class("building", 0xdead, 0);
        // zero vtable on re-declaration leaves the known value alone
        let j = reg.declare_class("building", 0, 0);
        assert_eq!(i, j);
        assert_eq!(reg.classes()[i].vtable, 0xdead);
        // a new nonzero value updates it
        reg.declare_class("building", 0xbeef, 0);
        assert_eq!(reg.classes()[i].vtable, 0xbeef);
    }

    #[test]
    fn test_ids_are_dense_and_names_recoverable() {
        let mut reg = ClassRegistry::new();
        let parent = reg.declare_class("workshop", 0x100, 0x8);
        reg.declare_class_child(parent, "workshop_dyer", "a").unwrap();
        reg.declare_class("stockpile", 0x200, 0);
        reg.declare_class_child(parent, "workshop_mason", "b").unwrap();

        let names = ["workshop", "workshop_dyer", "stockpile", "workshop_mason"];
        assert_eq!(reg.classnames().len(), names.len());
        for (id, name) in names.iter().enumerate() {
            assert_eq!(reg.class_name_of(id as i32), Some(*name));
            assert_eq!(reg.class_id_of(name), Some(id as i32));
        }
    }

    fn mocked_object(mem: &mut MockMemory, addr: u32, vtable: u32, name: &str) {
        mem.put_u32(addr, vtable);
        mem.put_u32(vtable - crate::memory::TYPEINFO_BEFORE_VTABLE, vtable + 0x100);
        mem.put_u32(vtable + 0x100 + crate::memory::TYPEINFO_NAME_OFFSET, vtable + 0x200);
        mem.put_cstring(vtable + 0x200, name);
    }

    #[test]
    fn test_resolve_simple_class_and_cache() {
        let mut reg = ClassRegistry::new();
        let mut mem = MockMemory::new();
        mocked_object(&mut mem, 0x5000, 0x1000, "8building");

        let id = reg.resolve_object_class(&mut mem, 0x5000).unwrap();
        assert_eq!(reg.class_name_of(id), Some("building"));

        // second resolution hits the vtable cache, no typeinfo walk needed
        let mut bare = MockMemory::new();
        bare.put_u32(0x6000, 0x1000);
        let again = reg.resolve_object_class(&mut bare, 0x6000).unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn test_multiclass_discriminator_selects_child() {
        let mut reg = ClassRegistry::new();
        let parent = reg.declare_class("workshop", 0x1000, 0x20);
        reg.declare_class_child(parent, "workshop_dyer", "10").unwrap();
        reg.declare_class_child(parent, "workshop_mason", "20").unwrap();
        // resolve goes through the cache path set up by name
        let mut mem = MockMemory::new();
        mocked_object(&mut mem, 0x5000, 0x1000, "8workshop");
        mem.put_u16(0x5000 + 0x20, 0x20);

        let id = reg.resolve_object_class(&mut mem, 0x5000).unwrap();
        assert_eq!(reg.class_name_of(id), Some("workshop_mason"));
    }

    #[test]
    fn test_discriminator_wider_than_u16_is_rejected() {
        let mut reg = ClassRegistry::new();
        let parent = reg.declare_class("workshop", 0x1000, 0x20);
        assert!(matches!(
            reg.declare_class_child(parent, "workshop_dyer", "10000"),
            Err(Error::BadHexValue { .. })
        ));
    }

    #[test]
    fn test_multiclass_fallback_returns_parent_id() {
        let mut reg = ClassRegistry::new();
        let parent = reg.declare_class("workshop", 0x1000, 0x20);
        reg.declare_class_child(parent, "child_a", "10").unwrap();
        reg.declare_class_child(parent, "child_b", "20").unwrap();
        let parent_id = reg.classes()[parent].assign as i32;

        let mut mem = MockMemory::new();
        mocked_object(&mut mem, 0x5000, 0x1000, "8workshop");
        mem.put_u16(0x5000 + 0x20, 0x30); // matches no child

        let id = reg.resolve_object_class(&mut mem, 0x5000).unwrap();
        assert_eq!(id, parent_id);
    }

    #[test]
    fn test_clone_drops_runtime_cache_but_keeps_classes() {
        let mut reg = ClassRegistry::new();
        let mut mem = MockMemory::new();
        mocked_object(&mut mem, 0x5000, 0x1000, "8building");
        reg.resolve_object_class(&mut mem, 0x5000).unwrap();
        assert!(!reg.vtable_cache.is_empty());

        let copy = reg.clone();
        assert!(copy.vtable_cache.is_empty());
        assert_eq!(copy.classnames(), reg.classnames());
    }

    #[test]
    fn test_rebase_vtables_shifts_all() {
        let mut reg = ClassRegistry::new();
        reg.declare_class("a", 0x1000, 0);
        reg.declare_class("b", 0x2000, 0);
        reg.rebase_vtables(0x10);
        assert_eq!(reg.vtable_of("a"), Some(0x1010));
        assert_eq!(reg.vtable_of("b"), Some(0x2010));
        reg.rebase_vtables(-0x10);
        assert_eq!(reg.vtable_of("a"), Some(0x1000));
    }
}
