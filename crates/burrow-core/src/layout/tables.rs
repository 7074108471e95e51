//! Per-build domain name tables: professions, jobs, skills, traits,
//! labors, experience levels, moods. Small integer-keyed lookup tables
//! populated from the version description, grown on demand.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize)]
pub struct Level {
    pub level: u32,
    pub name: String,
    pub xp_next_level: u32,
}

/// Six severity-band names plus the trait's own name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraitBands {
    pub name: String,
    pub levels: [String; 6],
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainTables {
    professions: Vec<String>,
    jobs: Vec<String>,
    skills: Vec<String>,
    moods: Vec<String>,
    traits: Vec<TraitBands>,
    labors: BTreeMap<u32, String>,
    levels: Vec<Level>,
}

fn grow_set(vec: &mut Vec<String>, id: u32, name: &str) {
    let id = id as usize;
    if vec.len() <= id {
        vec.resize(id + 1, String::new());
    }
    vec[id] = name.to_owned();
}

fn indexed<'a>(vec: &'a [String], kind: &'static str, id: u32) -> Result<&'a str> {
    vec.get(id as usize)
        .map(String::as_str)
        .ok_or(Error::MissingDefinition {
            kind,
            name: id.to_string(),
        })
}

impl DomainTables {
    pub fn set_profession(&mut self, id: u32, name: &str) {
        grow_set(&mut self.professions, id, name);
    }

    pub fn set_job(&mut self, id: u32, name: &str) {
        grow_set(&mut self.jobs, id, name);
    }

    pub fn set_skill(&mut self, id: u32, name: &str) {
        grow_set(&mut self.skills, id, name);
    }

    pub fn set_mood(&mut self, id: u32, name: &str) {
        grow_set(&mut self.moods, id, name);
    }

    pub fn set_labor(&mut self, id: u32, name: &str) {
        self.labors.insert(id, name.to_owned());
    }

    pub fn set_level(&mut self, id: u32, name: &str, xp_next_level: u32) {
        let idx = id as usize;
        if self.levels.len() <= idx {
            self.levels.resize_with(idx + 1, Level::default);
        }
        self.levels[idx] = Level {
            level: id,
            name: name.to_owned(),
            xp_next_level,
        };
    }

    pub fn set_trait(&mut self, id: u32, name: &str, levels: [String; 6]) {
        let idx = id as usize;
        if self.traits.len() <= idx {
            self.traits.resize_with(idx + 1, TraitBands::default);
        }
        self.traits[idx] = TraitBands {
            name: name.to_owned(),
            levels,
        };
    }

    pub fn profession(&self, id: u32) -> Result<&str> {
        indexed(&self.professions, "profession", id)
    }

    pub fn job(&self, id: u32) -> Result<&str> {
        indexed(&self.jobs, "job", id)
    }

    pub fn skill(&self, id: u32) -> Result<&str> {
        indexed(&self.skills, "skill", id)
    }

    pub fn mood(&self, id: u32) -> Result<&str> {
        indexed(&self.moods, "mood", id)
    }

    pub fn labor(&self, id: u32) -> Result<&str> {
        self.labors
            .get(&id)
            .map(String::as_str)
            .ok_or(Error::MissingDefinition {
                kind: "labor",
                name: id.to_string(),
            })
    }

    pub fn level_info(&self, level: u32) -> Result<&Level> {
        self.levels.get(level as usize).ok_or(Error::MissingDefinition {
            kind: "level",
            name: level.to_string(),
        })
    }

    pub fn trait_name(&self, id: u32) -> Result<&str> {
        self.traits
            .get(id as usize)
            .map(|t| t.name.as_str())
            .ok_or(Error::MissingDefinition {
                kind: "trait",
                name: id.to_string(),
            })
    }

    /// Band name for a 0-100 trait value. Values strictly within 10 of
    /// the neutral midpoint map to the empty string; otherwise the
    /// thresholds are 91/76/61/25/10 from the top band down.
    pub fn trait_band(&self, id: u32, value: u32) -> Result<&str> {
        let bands = self.traits.get(id as usize).ok_or(Error::MissingDefinition {
            kind: "trait",
            name: id.to_string(),
        })?;
        if value.abs_diff(50) < 10 {
            return Ok("");
        }
        let band = match value {
            v if v >= 91 => 5,
            v if v >= 76 => 4,
            v if v >= 61 => 3,
            v if v >= 25 => 2,
            v if v >= 10 => 1,
            _ => 0,
        };
        Ok(&bands.levels[band])
    }

    pub fn all_traits(&self) -> &[TraitBands] {
        &self.traits
    }

    pub fn all_labors(&self) -> &BTreeMap<u32, String> {
        &self.labors
    }
}
