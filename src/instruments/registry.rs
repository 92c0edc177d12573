//! Instrument registry: loads and validates the versioned catalogue.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use super::model::{CategoryBand, InstrumentDefinition, Prompt, ScaleOption, ScoringRule};
use crate::error::RegistryError;

/// Catalogue compiled into the binary.
const BUILTIN_CATALOGUE: &str = include_str!("../../instruments/catalogue.json");

// ── Catalogue file format ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CatalogueFile {
    version: u32,
    instruments: Vec<InstrumentEntry>,
}

#[derive(Debug, Deserialize)]
struct InstrumentEntry {
    id: String,
    name: String,
    keywords: Vec<String>,
    #[serde(default)]
    bulk_intake: bool,
    #[serde(default)]
    preamble: String,
    #[serde(default)]
    scale: Vec<ScaleOption>,
    prompts: Vec<PromptEntry>,
    #[serde(default)]
    scoring: ScoringRule,
    bands: Vec<CategoryBand>,
}

/// A prompt is either plain text (scale values as domain) or carries its own domain.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptEntry {
    Text(String),
    Detailed {
        text: String,
        answer_domain: Vec<u32>,
    },
}

// ── Registry ────────────────────────────────────────────────────────────

/// Immutable set of instruments, indexed by id and by command keyword.
#[derive(Debug)]
pub struct InstrumentRegistry {
    version: u32,
    instruments: Vec<Arc<InstrumentDefinition>>,
    by_id: HashMap<String, usize>,
    by_keyword: HashMap<String, usize>,
}

impl InstrumentRegistry {
    /// The catalogue shipped with the binary.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_json(BUILTIN_CATALOGUE)
    }

    /// Load an operator-supplied catalogue file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)?;
        let registry = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            version = registry.version,
            instruments = registry.instruments.len(),
            "Instrument catalogue loaded"
        );
        Ok(registry)
    }

    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        let file: CatalogueFile =
            serde_json::from_str(raw).map_err(|e| RegistryError::Parse(e.to_string()))?;

        let mut registry = Self {
            version: file.version,
            instruments: Vec::with_capacity(file.instruments.len()),
            by_id: HashMap::new(),
            by_keyword: HashMap::new(),
        };

        for entry in file.instruments {
            let definition = build_definition(entry)?;
            let slot = registry.instruments.len();

            if registry.by_id.insert(definition.id.clone(), slot).is_some() {
                return Err(RegistryError::DuplicateId(definition.id));
            }
            for keyword in &definition.keywords {
                if let Some(&other) = registry.by_keyword.get(keyword) {
                    return Err(RegistryError::DuplicateKeyword {
                        keyword: keyword.clone(),
                        first: registry.instruments[other].id.clone(),
                        second: definition.id.clone(),
                    });
                }
                registry.by_keyword.insert(keyword.clone(), slot);
            }
            registry.instruments.push(Arc::new(definition));
        }

        Ok(registry)
    }

    /// Catalogue version as declared in the file.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, id: &str) -> Option<Arc<InstrumentDefinition>> {
        self.by_id.get(id).map(|&i| Arc::clone(&self.instruments[i]))
    }

    /// Match a message against the command keywords (trimmed, case-insensitive).
    pub fn match_command(&self, text: &str) -> Option<Arc<InstrumentDefinition>> {
        let needle = text.trim().to_lowercase();
        self.by_keyword
            .get(&needle)
            .map(|&i| Arc::clone(&self.instruments[i]))
    }

    /// Primary keyword of every instrument, in catalogue order.
    pub fn primary_keywords(&self) -> Vec<&str> {
        self.instruments
            .iter()
            .filter_map(|i| i.keywords.first().map(String::as_str))
            .collect()
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Arc<InstrumentDefinition>> {
        self.instruments.iter()
    }
}

fn build_definition(entry: InstrumentEntry) -> Result<InstrumentDefinition, RegistryError> {
    let invalid = |reason: &str| RegistryError::Invalid {
        instrument: entry.id.clone(),
        reason: reason.to_string(),
    };

    if entry.id.trim().is_empty() {
        return Err(invalid("id is empty"));
    }
    if entry.prompts.is_empty() {
        return Err(invalid("at least one prompt is required"));
    }
    if entry.keywords.is_empty() {
        return Err(invalid("at least one keyword is required"));
    }

    let mut keywords = Vec::with_capacity(entry.keywords.len());
    for keyword in &entry.keywords {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() || keyword.chars().any(char::is_whitespace) {
            return Err(invalid("keywords must be non-empty single words"));
        }
        keywords.push(keyword);
    }

    let scale_domain: BTreeSet<u32> = entry.scale.iter().map(|o| o.value).collect();
    let mut prompts = Vec::with_capacity(entry.prompts.len());
    for (index, prompt) in entry.prompts.iter().enumerate() {
        let (text, answer_domain) = match prompt {
            PromptEntry::Text(text) => (text.clone(), scale_domain.clone()),
            PromptEntry::Detailed {
                text,
                answer_domain,
            } => (text.clone(), answer_domain.iter().copied().collect()),
        };
        if answer_domain.is_empty() {
            return Err(invalid(&format!(
                "prompt {} has an empty answer domain",
                index + 1
            )));
        }
        prompts.push(Prompt {
            index,
            text,
            answer_domain,
        });
    }

    validate_bands(&entry.bands).map_err(|reason| invalid(&reason))?;

    Ok(InstrumentDefinition {
        id: entry.id,
        name: entry.name,
        keywords,
        bulk_intake: entry.bulk_intake,
        preamble: entry.preamble,
        scale: entry.scale,
        prompts,
        scoring: entry.scoring,
        bands: entry.bands,
    })
}

fn validate_bands(bands: &[CategoryBand]) -> Result<(), String> {
    let Some((last, bounded)) = bands.split_last() else {
        return Err("at least one category band is required".into());
    };
    if last.max_score_inclusive.is_some() {
        return Err("the last category band must be unbounded".into());
    }

    let mut previous: Option<u32> = None;
    for band in bounded {
        let Some(max) = band.max_score_inclusive else {
            return Err(format!("band {} is unbounded but not last", band.label));
        };
        if previous.is_some_and(|p| max <= p) {
            return Err(format!("band {} is not in ascending order", band.label));
        }
        previous = Some(max);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPWISE: &str = r#"{
        "version": 3,
        "instruments": [{
            "id": "mood3",
            "name": "Mood check",
            "keywords": ["Mood"],
            "scale": [{"value": 0, "label": "No"}, {"value": 1, "label": "Yes"}],
            "prompts": ["Low mood?", {"text": "Sleep hours (0-2)?", "answer_domain": [0, 1, 2]}],
            "bands": [{"max_score": 1, "label": "low"}, {"label": "high"}]
        }]
    }"#;

    #[test]
    fn builtin_catalogue_contains_gad7() {
        let registry = InstrumentRegistry::builtin().unwrap();
        let gad7 = registry.get("gad7").unwrap();
        assert_eq!(gad7.len(), 7);
        assert!(gad7.bulk_intake);
        assert_eq!(
            gad7.common_domain().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(gad7.bands.len(), 4);
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn command_match_is_trimmed_and_case_insensitive() {
        let registry = InstrumentRegistry::builtin().unwrap();
        assert_eq!(registry.match_command("  GAD7 \n").unwrap().id, "gad7");
        assert_eq!(registry.match_command("Gad-7").unwrap().id, "gad7");
        assert!(registry.match_command("gad 7").is_none());
        assert!(registry.match_command("hello").is_none());
    }

    #[test]
    fn per_prompt_domain_overrides_scale() {
        let registry = InstrumentRegistry::from_json(STEPWISE).unwrap();
        let mood = registry.get("mood3").unwrap();
        assert!(!mood.bulk_intake);
        assert!(mood.prompt(0).unwrap().accepts(1));
        assert!(!mood.prompt(0).unwrap().accepts(2));
        assert!(mood.prompt(1).unwrap().accepts(2));
        assert!(mood.common_domain().is_none());
        assert_eq!(mood.keywords, vec!["mood".to_string()]);
    }

    #[test]
    fn rejects_bounded_last_band() {
        let raw = STEPWISE.replace(r#"{"label": "high"}"#, r#"{"max_score": 9, "label": "high"}"#);
        let err = InstrumentRegistry::from_json(&raw).unwrap_err();
        assert!(matches!(err, RegistryError::Invalid { .. }));
    }

    #[test]
    fn rejects_descending_bands() {
        let raw = STEPWISE.replace(
            r#"[{"max_score": 1, "label": "low"}, {"label": "high"}]"#,
            r#"[{"max_score": 5, "label": "a"}, {"max_score": 3, "label": "b"}, {"label": "c"}]"#,
        );
        let err = InstrumentRegistry::from_json(&raw).unwrap_err();
        assert!(matches!(err, RegistryError::Invalid { .. }));
    }

    #[test]
    fn rejects_empty_prompts() {
        let raw = STEPWISE.replace(
            r#"["Low mood?", {"text": "Sleep hours (0-2)?", "answer_domain": [0, 1, 2]}]"#,
            "[]",
        );
        assert!(InstrumentRegistry::from_json(&raw).is_err());
    }

    #[test]
    fn rejects_keyword_collision() {
        let raw = r#"{
            "version": 1,
            "instruments": [
                {"id": "a", "name": "A", "keywords": ["check"], "scale": [{"value": 0, "label": "x"}],
                 "prompts": ["q"], "bands": [{"label": "all"}]},
                {"id": "b", "name": "B", "keywords": ["CHECK"], "scale": [{"value": 0, "label": "x"}],
                 "prompts": ["q"], "bands": [{"label": "all"}]}
            ]
        }"#;
        let err = InstrumentRegistry::from_json(raw).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKeyword { ref keyword, .. } if keyword == "check"));
    }

    #[test]
    fn rejects_unparseable_catalogue() {
        assert!(matches!(
            InstrumentRegistry::from_json("{not json"),
            Err(RegistryError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalogue.json");
        std::fs::write(&path, STEPWISE).unwrap();
        let registry = InstrumentRegistry::load(&path).unwrap();
        assert_eq!(registry.version(), 3);
        assert_eq!(registry.primary_keywords(), vec!["mood"]);
    }
}
