//! Builds `VersionInfo` instances from a layout description document.
//!
//! The document declares `Base` blocks (shared skeletons) and `Version`
//! blocks (concrete builds, optionally inheriting a base plus a rebase
//! delta). Entries are resolved lazily and memoized; referencing a cached
//! entry always hands out an independent deep copy, never a shared
//! pointer into the cache.

mod document;

pub use document::Element;

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::layout::{OffsetGroup, VersionInfo};

/// Expected root element of a layout description document.
pub const ROOT_ELEMENT: &str = "MemoryLayouts";

#[derive(Debug)]
struct Entry {
    name: String,
    element: Element,
    resolved: Option<VersionInfo>,
    /// Currently-resolving marker; a re-entry means the inheritance
    /// graph has a cycle.
    resolving: bool,
}

#[derive(Debug, Default)]
pub struct VersionInfoFactory {
    names: HashMap<String, usize>,
    entries: Vec<Entry>,
    /// Indices of top-level `Version` entries in declaration order.
    version_order: Vec<usize>,
}

impl VersionInfoFactory {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parse and fully resolve a description document.
    ///
    /// All `Base` and `Version` blocks are registered first so forward
    /// and backward base references both work, then every `Version` is
    /// resolved in declaration order (bases on demand).
    pub fn from_str(text: &str) -> Result<Self> {
        let root = document::parse(text)?;
        if root.name != ROOT_ELEMENT {
            return Err(Error::BadDocumentRoot {
                expected: ROOT_ELEMENT.to_owned(),
                found: root.name,
            });
        }

        let mut factory = VersionInfoFactory::default();
        for child in &root.children {
            if child.name != "Base" && child.name != "Version" {
                continue;
            }
            let name = child.attr("name").ok_or(Error::UnderspecifiedEntry {
                list: "version",
                detail: format!("<{}> without a name attribute", child.name),
            })?;
            let idx = factory.entries.len();
            factory.entries.push(Entry {
                name: name.to_owned(),
                element: child.clone(),
                resolved: None,
                resolving: false,
            });
            // later blocks with the same name shadow earlier ones
            factory.names.insert(name.to_owned(), idx);
            if child.name == "Version" {
                factory.version_order.push(idx);
            }
        }

        for idx in factory.version_order.clone() {
            factory.resolve_index(idx)?;
        }
        info!(
            versions = factory.version_order.len(),
            "resolved layout descriptions"
        );
        Ok(factory)
    }

    /// Independent copy of a resolved entry, resolving it first if needed.
    pub fn resolve(&mut self, name: &str) -> Result<VersionInfo> {
        let idx = *self
            .names
            .get(name)
            .ok_or_else(|| Error::UnknownVersion(name.to_owned()))?;
        self.resolve_index(idx)
    }

    /// All resolved top-level versions, in declaration order.
    pub fn versions(&self) -> impl Iterator<Item = &VersionInfo> {
        self.version_order
            .iter()
            .filter_map(|&idx| self.entries[idx].resolved.as_ref())
    }

    /// Find the version whose recorded MD5 matches the given hash.
    pub fn identify(&self, md5: &str) -> Option<&VersionInfo> {
        let needle = md5.to_lowercase();
        self.versions().find(|v| v.md5() == Some(needle.as_str()))
    }

    fn resolve_index(&mut self, idx: usize) -> Result<VersionInfo> {
        if let Some(vi) = &self.entries[idx].resolved {
            return Ok(vi.clone());
        }
        if self.entries[idx].resolving {
            return Err(Error::InheritanceCycle(self.entries[idx].name.clone()));
        }
        self.entries[idx].resolving = true;
        let element = self.entries[idx].element.clone();
        let outcome = self.build(&element);
        self.entries[idx].resolving = false;
        let vi = outcome?;
        debug!(version = %vi.name(), "resolved layout description");
        self.entries[idx].resolved = Some(vi.clone());
        Ok(vi)
    }

    fn build(&mut self, element: &Element) -> Result<VersionInfo> {
        let name = element.attr("name").expect("checked at registration");
        let inherited = element.attr("base").is_some();

        let mut vi = match element.attr("base") {
            Some(base) => {
                let base_idx = *self
                    .names
                    .get(base)
                    .ok_or_else(|| Error::UnknownVersion(base.to_owned()))?;
                self.resolve_index(base_idx)?
            }
            None => VersionInfo::new(),
        };
        vi.set_name(name);
        if let Some(os) = element.attr("os") {
            vi.set_os(os)?;
        }

        // Shift inherited addresses by the recorded base plus the delta,
        // before this version's own overrides land.
        if let Some(rebase) = element.attr("rebase") {
            let delta = crate::layout::parse_hex_i32("rebase", rebase)?;
            let target = vi.base().wrapping_add(delta as u32);
            vi.rebase_addresses(target);
        }

        // Default image base per OS; the rebase above already used the
        // base the inherited addresses were recorded against.
        if element.attr("os").is_some() {
            let os = vi.os().expect("just set");
            vi.set_base(os.default_base()?);
        }

        if let Some(vtable) = element.first_child("VTable") {
            parse_vtable(vtable, &mut vi)?;
        }

        if let Some(offsets) = element.first_child("Offsets") {
            if !inherited {
                walk_offsets(offsets, vi.root_mut(), true)?;
            }
            walk_offsets(offsets, vi.root_mut(), false)?;
        }

        if let Some(md5) = element.first_child("MD5") {
            let value = md5.attr("value").ok_or(Error::UnderspecifiedEntry {
                list: "MD5",
                detail: format!("no value attribute in {name}"),
            })?;
            vi.set_md5(value);
        }
        if let Some(pe) = element.first_child("PETimeStamp") {
            let value = pe.attr("value").ok_or(Error::UnderspecifiedEntry {
                list: "PETimeStamp",
                detail: format!("no value attribute in {name}"),
            })?;
            vi.set_pe_timestamp_hex(value)?;
        }

        parse_lists(element, &mut vi)?;
        Ok(vi)
    }
}

fn required<'a>(
    element: &'a Element,
    attr: &str,
    list: &'static str,
) -> Result<&'a str> {
    element.attr(attr).ok_or_else(|| Error::UnderspecifiedEntry {
        list,
        detail: format!(
            "<{}> missing required attribute {attr:?}",
            element.name
        ),
    })
}

fn parse_dec(list: &'static str, text: &str) -> Result<u32> {
    text.trim()
        .parse()
        .map_err(|_| Error::UnderspecifiedEntry {
            list,
            detail: format!("bad numeric id {text:?}"),
        })
}

fn parse_vtable(vtable: &Element, vi: &mut VersionInfo) -> Result<()> {
    if let Some(rebase) = vtable.attr("rebase") {
        let delta = crate::layout::parse_hex_i32("rebase", rebase)?;
        vi.rebase_vtables(delta);
    }
    for entry in &vtable.children {
        match entry.name.as_str() {
            "class" => {
                let name = required(entry, "name", "VTable")?;
                vi.classes_mut()
                    .declare_class_from_text(name, entry.attr("vtable"), None)?;
            }
            "multiclass" => {
                let name = required(entry, "name", "VTable")?;
                let parent = vi.classes_mut().declare_class_from_text(
                    name,
                    entry.attr("vtable"),
                    entry.attr("typeoffset"),
                )?;
                for sub in entry.children_named("class") {
                    let child_name = required(sub, "name", "VTable")?;
                    let kind = required(sub, "type", "VTable")?;
                    vi.classes_mut().declare_class_child(parent, child_name, kind)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Walk an `Offsets` subtree. Iterative depth-first with an explicit
/// frame stack so walk depth never depends on call-stack depth.
///
/// The first (`initial`) pass declares names only, building the skeleton;
/// the second pass applies `value` attributes. Running just the second
/// pass over an inherited tree is how incremental override works: only
/// present elements overwrite, absent ones keep the inherited value.
fn walk_offsets(offsets: &Element, root: &mut OffsetGroup, initial: bool) -> Result<()> {
    let mut frames: Vec<(&Element, usize, Vec<String>)> = vec![(offsets, 0, Vec::new())];
    while let Some(top) = frames.last_mut() {
        let (elem, cursor) = (top.0, top.1);
        if cursor >= elem.children.len() {
            frames.pop();
            continue;
        }
        top.1 += 1;
        let path = top.2.clone();
        let child = &elem.children[cursor];
        match child.name.as_str() {
            "group" => {
                let name = required(child, "name", "Offsets")?;
                let mut sub_path = path;
                sub_path.push(name.to_owned());
                if initial {
                    root.group_mut_by_path(&sub_path);
                }
                frames.push((child, 0, sub_path));
            }
            kind @ ("address" | "offset" | "hexvalue" | "string") => {
                let name = required(child, "name", "Offsets")?;
                let group = root.group_mut_by_path(&path);
                if initial {
                    match kind {
                        "address" => group.create_address(name),
                        "offset" => group.create_offset(name),
                        "hexvalue" => group.create_hexvalue(name),
                        _ => group.create_string(name),
                    }
                } else if let Some(value) = child.attr("value") {
                    match kind {
                        "address" => group.set_address(name, value)?,
                        "offset" => group.set_offset(name, value)?,
                        "hexvalue" => group.set_hexvalue(name, value)?,
                        _ => group.set_string(name, value)?,
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_lists(element: &Element, vi: &mut VersionInfo) -> Result<()> {
    for group in element.children_named("Professions") {
        for item in group.children_named("Profession") {
            let id = parse_dec("Professions", required(item, "id", "Professions")?)?;
            vi.tables_mut()
                .set_profession(id, required(item, "name", "Professions")?);
        }
    }
    for group in element.children_named("Jobs") {
        for item in group.children_named("Job") {
            let id = parse_dec("Jobs", required(item, "id", "Jobs")?)?;
            vi.tables_mut().set_job(id, required(item, "name", "Jobs")?);
        }
    }
    for group in element.children_named("Skills") {
        for item in group.children_named("Skill") {
            let id = parse_dec("Skills", required(item, "id", "Skills")?)?;
            vi.tables_mut().set_skill(id, required(item, "name", "Skills")?);
        }
    }
    for group in element.children_named("Moods") {
        for item in group.children_named("Mood") {
            let id = parse_dec("Moods", required(item, "id", "Moods")?)?;
            vi.tables_mut().set_mood(id, required(item, "name", "Moods")?);
        }
    }
    for group in element.children_named("Labors") {
        for item in group.children_named("Labor") {
            let id = parse_dec("Labors", required(item, "id", "Labors")?)?;
            vi.tables_mut().set_labor(id, required(item, "name", "Labors")?);
        }
    }
    for group in element.children_named("Levels") {
        for item in group.children_named("Level") {
            let id = parse_dec("Levels", required(item, "id", "Levels")?)?;
            let xp = parse_dec("Levels", required(item, "xpNxtLvl", "Levels")?)?;
            vi.tables_mut()
                .set_level(id, required(item, "name", "Levels")?, xp);
        }
    }
    for group in element.children_named("Traits") {
        for item in group.children_named("Trait") {
            let id = parse_dec("Traits", required(item, "id", "Traits")?)?;
            let name = required(item, "name", "Traits")?;
            let mut levels: [String; 6] = Default::default();
            for (i, slot) in levels.iter_mut().enumerate() {
                let key = format!("level_{i}");
                *slot = item
                    .attr(&key)
                    .ok_or_else(|| Error::UnderspecifiedEntry {
                        list: "Traits",
                        detail: format!("trait {name:?} missing {key}"),
                    })?
                    .to_owned();
            }
            vi.tables_mut().set_trait(id, name, levels);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_plus_rebase_inheritance() {
        // linux base 0; derived version shifts inherited addresses by 0x10
        let mut factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Base name="B1" os="linux">
                   <Offsets>
                     <group name="G">
                       <address name="foo" value="0x1000" />
                     </group>
                   </Offsets>
                 </Base>
                 <Version name="V1" os="linux" base="B1" rebase="0x10" />
               </MemoryLayouts>"#,
        )
        .unwrap();
        let v1 = factory.resolve("V1").unwrap();
        assert_eq!(v1.group("G").unwrap().address("foo").unwrap(), 0x1010);
        assert_eq!(v1.base(), 0);
    }

    #[test]
    fn test_override_pass_preserves_unset_fields() {
        let mut factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Base name="B" os="linux">
                   <Offsets>
                     <offset name="a" value="1" />
                     <offset name="b" value="2" />
                   </Offsets>
                 </Base>
                 <Version name="V" os="linux" base="B">
                   <Offsets>
                     <offset name="a" value="9" />
                   </Offsets>
                 </Version>
               </MemoryLayouts>"#,
        )
        .unwrap();
        let v = factory.resolve("V").unwrap();
        assert_eq!(v.offset("a").unwrap(), 9);
        assert_eq!(v.offset("b").unwrap(), 2);
    }

    #[test]
    fn test_cached_base_is_copied_not_shared() {
        let mut factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Base name="B" os="linux">
                   <Offsets><offset name="x" value="1" /></Offsets>
                 </Base>
                 <Version name="V1" os="linux" base="B">
                   <Offsets><offset name="x" value="5" /></Offsets>
                 </Version>
                 <Version name="V2" os="linux" base="B" />
               </MemoryLayouts>"#,
        )
        .unwrap();
        assert_eq!(factory.resolve("V1").unwrap().offset("x").unwrap(), 5);
        assert_eq!(factory.resolve("V2").unwrap().offset("x").unwrap(), 1);
        assert_eq!(factory.resolve("B").unwrap().offset("x").unwrap(), 1);
    }

    #[test]
    fn test_forward_base_reference_resolves_on_demand() {
        let mut factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Version name="V" os="linux" base="LateBase" />
                 <Base name="LateBase" os="linux">
                   <Offsets><address name="foo" value="0x40" /></Offsets>
                 </Base>
               </MemoryLayouts>"#,
        )
        .unwrap();
        assert_eq!(factory.resolve("V").unwrap().address("foo").unwrap(), 0x40);
    }

    #[test]
    fn test_inheritance_cycle_fails_fast() {
        let err = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Base name="A" base="B" />
                 <Base name="B" base="A" />
                 <Version name="V" os="linux" base="A" />
               </MemoryLayouts>"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InheritanceCycle(_)));
    }

    #[test]
    fn test_bad_root_element() {
        let err = VersionInfoFactory::from_str("<SomethingElse />").unwrap_err();
        match err {
            Error::BadDocumentRoot { expected, found } => {
                assert_eq!(expected, ROOT_ELEMENT);
                assert_eq!(found, "SomethingElse");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_os_fails_resolution() {
        let err = VersionInfoFactory::from_str(
            r#"<MemoryLayouts><Version name="V" os="beos" /></MemoryLayouts>"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownOs(_)));
    }

    #[test]
    fn test_windows_default_base() {
        let mut factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts><Version name="W" os="windows" /></MemoryLayouts>"#,
        )
        .unwrap();
        assert_eq!(factory.resolve("W").unwrap().base(), 0x400000);
    }

    #[test]
    fn test_underspecified_list_entry_fails_whole_parse() {
        let err = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Version name="V" os="linux">
                   <Professions>
                     <Profession id="0" />
                   </Professions>
                 </Version>
               </MemoryLayouts>"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::UnderspecifiedEntry { list: "Professions", .. }
        ));
    }

    #[test]
    fn test_vtable_and_multiclass_parsing() {
        let mut factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Version name="V" os="linux">
                   <VTable>
                     <class name="building" vtable="0x1000" />
                     <multiclass name="workshop" vtable="0x2000" typeoffset="0x20">
                       <class name="workshop_dyer" type="10" />
                       <class name="workshop_mason" type="20" />
                     </multiclass>
                   </VTable>
                 </Version>
               </MemoryLayouts>"#,
        )
        .unwrap();
        let v = factory.resolve("V").unwrap();
        assert_eq!(v.classes().vtable_of("building"), Some(0x1000));
        assert_eq!(v.classes().class_id_of("workshop_mason"), Some(3));
        assert_eq!(v.classes().classnames().len(), 4);
    }

    #[test]
    fn test_identify_by_md5() {
        let factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Version name="V1" os="linux"><MD5 value="aabb" /></Version>
                 <Version name="V2" os="linux"><MD5 value="ccdd" /></Version>
               </MemoryLayouts>"#,
        )
        .unwrap();
        assert_eq!(factory.identify("CCDD").unwrap().name(), "V2");
        assert!(factory.identify("0000").is_none());
    }

    #[test]
    fn test_domain_lists_parse() {
        let mut factory = VersionInfoFactory::from_str(
            r#"<MemoryLayouts>
                 <Version name="V" os="linux">
                   <Professions><Profession id="0" name="miner" /></Professions>
                   <Levels><Level id="1" name="Novice" xpNxtLvl="500" /></Levels>
                   <Traits>
                     <Trait id="0" name="ANXIETY" level_0="a" level_1="b"
                            level_2="c" level_3="d" level_4="e" level_5="f" />
                   </Traits>
                 </Version>
               </MemoryLayouts>"#,
        )
        .unwrap();
        let v = factory.resolve("V").unwrap();
        assert_eq!(v.tables().profession(0).unwrap(), "miner");
        assert_eq!(v.tables().level_info(1).unwrap().xp_next_level, 500);
        assert_eq!(v.tables().trait_band(0, 95).unwrap(), "f");
    }
}
