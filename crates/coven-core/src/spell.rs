//! Spell sources and naming.
//!
//! A spell is a text template producing an agent prompt. Grimoire agent
//! steps reference spells either by library name or with an inline body.

use std::path::Path;

/// How an agent step references its spell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpellSource {
    /// Resolve against the spell library.
    Named(String),
    /// The step carries the template body itself.
    Inline(String),
}

impl SpellSource {
    /// Classify a grimoire `spell` value.
    ///
    /// A value containing a newline or a template tag is an inline body;
    /// anything else is a library name.
    pub fn classify(raw: &str) -> Self {
        if raw.contains('\n') || raw.contains("{{") {
            Self::Inline(raw.to_string())
        } else {
            Self::Named(raw.trim().to_string())
        }
    }
}

/// A named spell with its template body.
#[derive(Debug, Clone)]
pub struct Spell {
    pub name: String,
    pub body: String,
}

impl Spell {
    /// Derive the spell name from its file path (stem of `<name>.md`).
    pub fn from_file_contents(path: &Path, body: String) -> Option<Self> {
        let name = path.file_stem()?.to_str()?.to_string();
        if name.is_empty() {
            return None;
        }
        Some(Self { name, body })
    }
}
