//! Page-type rule table.
//!
//! Every page type is a named list of positive rules (with priorities), veto
//! rules and required rules. The table is plain data; [`PatternSet::evaluate`]
//! is the single engine that interprets it, so adding a page type never
//! needs new code.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::PatternError;
use crate::normalize::{fold_marks, is_folded_mark};

const BUILTIN_TABLE: &str = include_str!("../data/page_patterns.json");

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageType(pub String);

impl PageType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extraction step identifier such as `step_3_1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub const UNMAPPED: &'static str = "unmapped";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unmapped() -> Self {
        Self(Self::UNMAPPED.to_string())
    }

    pub fn is_unmapped(&self) -> bool {
        self.0 == Self::UNMAPPED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleDef {
    pub pattern: String,
    #[serde(default)]
    pub negative: bool,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageTypeDef {
    pub name: PageType,
    #[serde(default)]
    pub step: Option<StepId>,
    #[serde(default)]
    pub additional_steps: Vec<StepId>,
    #[serde(default)]
    pub can_continue: bool,
    /// All of these must match or the type is eliminated.
    #[serde(default)]
    pub required: Vec<String>,
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternTableDef {
    #[serde(default)]
    pub version: String,
    pub max_priority: u32,
    #[serde(default)]
    pub continuation_patterns: Vec<String>,
    pub page_types: Vec<PageTypeDef>,
}

#[derive(Debug, Clone)]
struct PositiveRule {
    regex: Regex,
    priority: u32,
}

/// Result of running one page type's rules over a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Vetoed,
    MissingRequired,
    NoMatch,
    /// Priority of the highest-priority positive rule that matched.
    Matched { priority: u32 },
}

/// Compiled rules for one page type.
#[derive(Debug, Clone)]
pub struct PatternSet {
    pub page_type: PageType,
    /// Position in the table, used as the final tie-breaker.
    pub order: usize,
    pub step: Option<StepId>,
    pub additional_steps: Vec<StepId>,
    pub can_continue: bool,
    // priority-descending, table order kept for equal priorities
    positives: Vec<PositiveRule>,
    negatives: Vec<Regex>,
    required: Vec<Regex>,
}

impl PatternSet {
    /// Vetoes are checked first and win regardless of positive matches.
    pub fn evaluate(&self, text: &str) -> RuleOutcome {
        if self.negatives.iter().any(|re| re.is_match(text)) {
            return RuleOutcome::Vetoed;
        }
        if !self.required.iter().all(|re| re.is_match(text)) {
            return RuleOutcome::MissingRequired;
        }
        self.positives
            .iter()
            .find(|rule| rule.regex.is_match(text))
            .map_or(RuleOutcome::NoMatch, |rule| RuleOutcome::Matched {
                priority: rule.priority,
            })
    }

    /// Primary step followed by the additional ones.
    pub fn steps(&self) -> impl Iterator<Item = &StepId> {
        self.step.iter().chain(self.additional_steps.iter())
    }
}

/// Immutable, compiled page-type table. Built once and shared.
#[derive(Debug, Clone)]
pub struct PatternTable {
    pub version: String,
    pub max_priority: u32,
    sets: IndexMap<PageType, PatternSet>,
    continuation: Vec<Regex>,
}

/// A mark directly under `?`, `*`, `+` or `{n}` would leave the quantifier on
/// the preceding character once folded.
fn has_quantified_mark(pattern: &str) -> bool {
    pattern
        .chars()
        .zip(pattern.chars().skip(1))
        .any(|(c, next)| is_folded_mark(c) && matches!(next, '?' | '*' | '+' | '{'))
}

fn compile(page_type: &PageType, pattern: &str) -> Result<Regex, PatternError> {
    if has_quantified_mark(pattern) {
        return Err(PatternError::QuantifiedMark {
            page_type: page_type.to_string(),
            pattern: pattern.to_string(),
        });
    }
    // Fold marks exactly as page text is folded so both spellings meet.
    RegexBuilder::new(&fold_marks(pattern))
        .case_insensitive(true)
        .build()
        .map_err(|source| PatternError::Regex {
            page_type: page_type.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}

impl PatternTable {
    /// Table shipped with the crate.
    pub fn builtin() -> Result<Self, PatternError> {
        Self::from_json(BUILTIN_TABLE)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PatternError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PatternError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(json: &str) -> Result<Self, PatternError> {
        let def: PatternTableDef = serde_json::from_str(json)?;
        Self::compile(def)
    }

    pub fn compile(def: PatternTableDef) -> Result<Self, PatternError> {
        if def.page_types.is_empty() {
            return Err(PatternError::Empty);
        }
        if def.max_priority == 0 {
            return Err(PatternError::MaxPriority);
        }

        let marker = PageType::new("continuation");
        let continuation = def
            .continuation_patterns
            .iter()
            .map(|p| compile(&marker, p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut sets = IndexMap::with_capacity(def.page_types.len());
        for (order, type_def) in def.page_types.into_iter().enumerate() {
            let name = type_def.name.clone();
            if sets.contains_key(&name) {
                return Err(PatternError::Duplicate {
                    page_type: name.to_string(),
                });
            }

            let mut positives = Vec::new();
            let mut negatives = Vec::new();
            for rule in &type_def.rules {
                let regex = compile(&name, &rule.pattern)?;
                if rule.negative {
                    negatives.push(regex);
                } else {
                    positives.push(PositiveRule {
                        regex,
                        priority: rule.priority,
                    });
                }
            }
            if positives.is_empty() {
                return Err(PatternError::NoPositive {
                    page_type: name.to_string(),
                });
            }
            // stable: equal priorities keep their written order
            positives.sort_by(|a, b| b.priority.cmp(&a.priority));

            let required = type_def
                .required
                .iter()
                .map(|p| compile(&name, p))
                .collect::<Result<Vec<_>, _>>()?;

            sets.insert(
                name.clone(),
                PatternSet {
                    page_type: name,
                    order,
                    step: type_def.step,
                    additional_steps: type_def.additional_steps,
                    can_continue: type_def.can_continue,
                    positives,
                    negatives,
                    required,
                },
            );
        }

        Ok(Self {
            version: def.version,
            max_priority: def.max_priority,
            sets,
            continuation,
        })
    }

    pub fn get(&self, page_type: &PageType) -> Option<&PatternSet> {
        self.sets.get(page_type)
    }

    /// Page types in table order.
    pub fn iter(&self) -> impl Iterator<Item = &PatternSet> {
        self.sets.values()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Map a matched priority onto [0, 1].
    pub fn confidence(&self, priority: u32) -> f64 {
        (priority as f64 / self.max_priority as f64).clamp(0.0, 1.0)
    }

    /// Whether the (normalized) header text carries a "continued" marker.
    pub fn is_continuation(&self, header: &str) -> bool {
        self.continuation.iter().any(|re| re.is_match(header))
    }

    /// Every step any page type can produce.
    pub fn known_steps(&self) -> BTreeSet<StepId> {
        self.sets
            .values()
            .flat_map(|set| set.steps().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[test]
    fn builtin_table_compiles() {
        let table = PatternTable::builtin().unwrap();
        assert!(table.len() >= 22);
        assert!(table.known_steps().contains(&StepId::new("step_3_1")));
    }

    #[test]
    fn folded_pattern_matches_both_spellings() {
        let table = PatternTable::builtin().unwrap();
        let personal = table.get(&PageType::new("personal_info")).unwrap();
        for text in ["ข้อมูลส่วนบุคคล", "ขอมูลสวนบุคคล"] {
            assert!(matches!(
                personal.evaluate(&normalize(text)),
                RuleOutcome::Matched { .. }
            ));
        }
    }

    #[test]
    fn duplicate_type_is_rejected() {
        let json = r#"{"max_priority": 5, "page_types": [
            {"name": "a", "rules": [{"pattern": "x", "priority": 1}]},
            {"name": "a", "rules": [{"pattern": "y", "priority": 1}]}
        ]}"#;
        assert!(matches!(
            PatternTable::from_json(json),
            Err(PatternError::Duplicate { .. })
        ));
    }

    #[test]
    fn invalid_regex_names_the_type() {
        let json = r#"{"max_priority": 5, "page_types": [
            {"name": "broken", "rules": [{"pattern": "(", "priority": 1}]}
        ]}"#;
        match PatternTable::from_json(json) {
            Err(PatternError::Regex { page_type, .. }) => assert_eq!(page_type, "broken"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn quantified_tone_mark_is_rejected() {
        // folding would turn this into `ข?อมูล`, an optional consonant
        let json = r#"{"max_priority": 5, "page_types": [
            {"name": "info", "rules": [{"pattern": "ข้?อมูล", "priority": 1}]}
        ]}"#;
        match PatternTable::from_json(json) {
            Err(PatternError::QuantifiedMark { page_type, .. }) => assert_eq!(page_type, "info"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn marks_outside_quantifiers_still_fold() {
        assert!(!has_quantified_mark("ข้อมูล(ส่วน)?บุคคล"));
        assert!(has_quantified_mark("ส่+วน"));
    }
}
