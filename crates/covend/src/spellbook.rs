//! Grimoire and spell library.
//!
//! Built-in definitions are embedded in the binary; user files under
//! `.coven/grimoires/*.yaml` and `.coven/spells/*.md` are loaded on top
//! and override built-ins of the same name. The library also owns
//! `grimoire-mapping.json` and implements the grimoire resolution order
//! for beads: `grimoire:<name>` label, then the by-type mapping, then the
//! configured default, then the built-in `implement-bead`.

use coven_core::template::SpellLookup;
use coven_core::{Bead, Grimoire, GrimoireError, Spell};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Fallback grimoire when nothing else selects one.
pub const FALLBACK_GRIMOIRE: &str = "implement-bead";

/// Embedded built-in definitions.
const BUILTIN_GRIMOIRES: &[(&str, &str)] = &[
    (
        "implement-bead",
        include_str!("../builtin/grimoires/implement-bead.yaml"),
    ),
    ("test-fix", include_str!("../builtin/grimoires/test-fix.yaml")),
];

const BUILTIN_SPELLS: &[(&str, &str)] = &[
    (
        "implement-bead",
        include_str!("../builtin/spells/implement-bead.md"),
    ),
    ("fix-tests", include_str!("../builtin/spells/fix-tests.md")),
    (
        "review-changes",
        include_str!("../builtin/spells/review-changes.md"),
    ),
];

#[derive(Debug, Error)]
pub enum SpellbookError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Grimoire(#[from] GrimoireError),
    #[error("grimoire mapping is malformed: {0}")]
    Mapping(#[from] serde_json::Error),
    #[error("grimoire not found: {0}")]
    GrimoireNotFound(String),
}

pub type Result<T> = std::result::Result<T, SpellbookError>;

/// Contents of `grimoire-mapping.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrimoireMapping {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub by_type: BTreeMap<String, String>,
}

/// The loaded library of grimoires and spells.
#[derive(Debug)]
pub struct Spellbook {
    grimoires: HashMap<String, Grimoire>,
    spells: HashMap<String, String>,
    mapping: GrimoireMapping,
}

impl Spellbook {
    /// Load built-ins plus user definitions from `.coven/`.
    pub fn load(coven_dir: &Path) -> Result<Self> {
        let mut grimoires = HashMap::new();
        for (name, yaml) in BUILTIN_GRIMOIRES {
            let grimoire = Grimoire::from_yaml(yaml)?;
            grimoires.insert((*name).to_string(), grimoire);
        }

        let mut spells = HashMap::new();
        for (name, body) in BUILTIN_SPELLS {
            spells.insert((*name).to_string(), (*body).to_string());
        }

        // User grimoires override built-ins of the same name. A bad user
        // file is skipped with a warning rather than failing startup.
        let grimoire_dir = coven_dir.join("grimoires");
        if grimoire_dir.is_dir() {
            for path in sorted_files(&grimoire_dir, "yaml")? {
                let text = std::fs::read_to_string(&path)?;
                match Grimoire::from_yaml(&text) {
                    Ok(grimoire) => {
                        debug!(name = %grimoire.name, path = %path.display(), "user grimoire loaded");
                        grimoires.insert(grimoire.name.clone(), grimoire);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping invalid user grimoire");
                    }
                }
            }
        }

        let spell_dir = coven_dir.join("spells");
        if spell_dir.is_dir() {
            for path in sorted_files(&spell_dir, "md")? {
                let body = std::fs::read_to_string(&path)?;
                if let Some(spell) = Spell::from_file_contents(&path, body) {
                    debug!(name = %spell.name, path = %path.display(), "user spell loaded");
                    spells.insert(spell.name, spell.body);
                }
            }
        }

        let mapping_path = coven_dir.join("grimoire-mapping.json");
        let mapping = if mapping_path.exists() {
            let text = std::fs::read_to_string(&mapping_path)?;
            serde_json::from_str(&text)?
        } else {
            GrimoireMapping::default()
        };

        Ok(Self {
            grimoires,
            spells,
            mapping,
        })
    }

    /// Library without any user directory (built-ins only).
    pub fn builtin_only() -> Result<Self> {
        Self::load(Path::new("/nonexistent-coven-dir"))
    }

    pub fn grimoire(&self, name: &str) -> Option<&Grimoire> {
        self.grimoires.get(name)
    }

    pub fn spell(&self, name: &str) -> Option<&str> {
        self.spells.get(name).map(String::as_str)
    }

    pub fn grimoire_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.grimoires.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn mapping(&self) -> &GrimoireMapping {
        &self.mapping
    }

    /// Resolve which grimoire applies to a bead.
    ///
    /// Order: `grimoire:<name>` label, `by_type` mapping, mapping default
    /// (or `config_default` when the mapping has none), then the built-in
    /// fallback. A name selected by any rule but missing from the library
    /// is an error; the scheduler must not launch.
    pub fn resolve_for_bead(&self, bead: &Bead, config_default: &str) -> Result<&Grimoire> {
        let selected = bead
            .grimoire_label()
            .map(String::from)
            .or_else(|| self.mapping.by_type.get(&bead.bead_type).cloned())
            .or_else(|| self.mapping.default.clone())
            .or_else(|| {
                if config_default.is_empty() {
                    None
                } else {
                    Some(config_default.to_string())
                }
            })
            .unwrap_or_else(|| FALLBACK_GRIMOIRE.to_string());

        self.grimoires
            .get(&selected)
            .ok_or(SpellbookError::GrimoireNotFound(selected))
    }
}

impl SpellLookup for Spellbook {
    fn spell_body(&self, name: &str) -> Option<String> {
        self.spells.get(name).cloned()
    }
}

fn sorted_files(dir: &Path, extension: &str) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(extension))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coven_core::BeadStatus;
    use tempfile::TempDir;

    fn bead(bead_type: &str, labels: &[&str]) -> Bead {
        Bead {
            id: "cv-1".to_string(),
            title: "t".to_string(),
            body: String::new(),
            bead_type: bead_type.to_string(),
            priority: 0,
            labels: labels.iter().map(|l| (*l).to_string()).collect(),
            status: BeadStatus::Open,
        }
    }

    #[test]
    fn builtins_are_available() {
        let book = Spellbook::builtin_only().unwrap();
        assert!(book.grimoire("implement-bead").is_some());
        assert!(book.grimoire("test-fix").is_some());
        assert!(book.spell("fix-tests").is_some());
        assert_eq!(
            book.grimoire_names(),
            vec!["implement-bead", "test-fix"]
        );
    }

    #[test]
    fn user_grimoire_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let grimoire_dir = dir.path().join("grimoires");
        std::fs::create_dir_all(&grimoire_dir).unwrap();
        std::fs::write(
            grimoire_dir.join("test-fix.yaml"),
            "name: test-fix\ndescription: user version\nsteps:\n  - name: only\n    type: script\n    command: true\n",
        )
        .unwrap();

        let book = Spellbook::load(dir.path()).unwrap();
        let grimoire = book.grimoire("test-fix").unwrap();
        assert_eq!(grimoire.description.as_deref(), Some("user version"));
        assert_eq!(grimoire.steps.len(), 1);
    }

    #[test]
    fn invalid_user_grimoire_is_skipped() {
        let dir = TempDir::new().unwrap();
        let grimoire_dir = dir.path().join("grimoires");
        std::fs::create_dir_all(&grimoire_dir).unwrap();
        std::fs::write(grimoire_dir.join("broken.yaml"), "name: broken\nsteps: []\n").unwrap();

        let book = Spellbook::load(dir.path()).unwrap();
        assert!(book.grimoire("broken").is_none());
        // Built-ins still load.
        assert!(book.grimoire("implement-bead").is_some());
    }

    #[test]
    fn user_spell_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let spell_dir = dir.path().join("spells");
        std::fs::create_dir_all(&spell_dir).unwrap();
        std::fs::write(spell_dir.join("fix-tests.md"), "custom spell body").unwrap();

        let book = Spellbook::load(dir.path()).unwrap();
        assert_eq!(book.spell("fix-tests"), Some("custom spell body"));
        assert_eq!(
            book.spell_body("fix-tests"),
            Some("custom spell body".to_string())
        );
    }

    #[test]
    fn label_wins_resolution() {
        let book = Spellbook::builtin_only().unwrap();
        let g = book
            .resolve_for_bead(&bead("feature", &["grimoire:test-fix"]), "")
            .unwrap();
        assert_eq!(g.name, "test-fix");
    }

    #[test]
    fn by_type_mapping_applies() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("grimoire-mapping.json"),
            r#"{"by_type": {"bug": "test-fix"}}"#,
        )
        .unwrap();
        let book = Spellbook::load(dir.path()).unwrap();

        let g = book.resolve_for_bead(&bead("bug", &[]), "").unwrap();
        assert_eq!(g.name, "test-fix");
        // Other types fall through to the built-in default.
        let g = book.resolve_for_bead(&bead("feature", &[]), "").unwrap();
        assert_eq!(g.name, "implement-bead");
    }

    #[test]
    fn mapping_default_beats_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("grimoire-mapping.json"),
            r#"{"default": "test-fix"}"#,
        )
        .unwrap();
        let book = Spellbook::load(dir.path()).unwrap();
        let g = book.resolve_for_bead(&bead("feature", &[]), "").unwrap();
        assert_eq!(g.name, "test-fix");
    }

    #[test]
    fn config_default_applies_when_mapping_silent() {
        let book = Spellbook::builtin_only().unwrap();
        let g = book.resolve_for_bead(&bead("feature", &[]), "test-fix").unwrap();
        assert_eq!(g.name, "test-fix");
    }

    #[test]
    fn missing_named_grimoire_is_an_error() {
        let book = Spellbook::builtin_only().unwrap();
        let err = book
            .resolve_for_bead(&bead("feature", &["grimoire:ghost"]), "")
            .unwrap_err();
        assert!(matches!(err, SpellbookError::GrimoireNotFound(name) if name == "ghost"));
    }

    #[test]
    fn malformed_mapping_fails_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("grimoire-mapping.json"), "{broken").unwrap();
        let err = Spellbook::load(dir.path()).unwrap_err();
        assert!(matches!(err, SpellbookError::Mapping(_)));
    }
}
