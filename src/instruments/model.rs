//! Instrument definition types.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::scoring::{self, Assessment};

/// One labelled point on an instrument's response scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleOption {
    pub value: u32,
    pub label: String,
}

/// A single question of an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// 0-based position within the instrument.
    pub index: usize,
    pub text: String,
    /// Accepted answer values for this step.
    pub answer_domain: BTreeSet<u32>,
}

impl Prompt {
    pub fn accepts(&self, value: u32) -> bool {
        self.answer_domain.contains(&value)
    }
}

/// How a completed answer vector is reduced to a total score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringRule {
    /// Sum of all answers.
    #[default]
    Sum,
}

/// A score band. Bands are checked in ascending order; the first whose bound
/// is >= the total wins. The last band has no bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBand {
    #[serde(default, rename = "max_score", skip_serializing_if = "Option::is_none")]
    pub max_score_inclusive: Option<u32>,
    pub label: String,
    #[serde(default)]
    pub interpretation: String,
}

impl CategoryBand {
    pub fn contains(&self, total: u32) -> bool {
        self.max_score_inclusive.is_none_or(|max| total <= max)
    }
}

/// An immutable, validated questionnaire definition.
///
/// Only built through [`InstrumentRegistry`](super::InstrumentRegistry), which
/// guarantees at least one prompt, non-empty answer domains, and a band table
/// that ends in an unbounded band.
#[derive(Debug, Clone)]
pub struct InstrumentDefinition {
    pub id: String,
    pub name: String,
    /// Lowercased command words that start this instrument.
    pub keywords: Vec<String>,
    /// Whether all answers may be sent in one message.
    pub bulk_intake: bool,
    pub preamble: String,
    pub scale: Vec<ScaleOption>,
    pub prompts: Vec<Prompt>,
    pub scoring: ScoringRule,
    pub bands: Vec<CategoryBand>,
}

impl InstrumentDefinition {
    /// Number of prompts.
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn prompt(&self, index: usize) -> Option<&Prompt> {
        self.prompts.get(index)
    }

    /// Answer domain shared by every prompt, if the instrument is homogeneous.
    pub fn common_domain(&self) -> Option<&BTreeSet<u32>> {
        let first = &self.prompts.first()?.answer_domain;
        self.prompts
            .iter()
            .all(|p| &p.answer_domain == first)
            .then_some(first)
    }

    /// Score and categorize a complete answer vector.
    pub fn assess(&self, answers: &[u32]) -> Assessment {
        scoring::assess(self.scoring, &self.bands, answers)
    }
}
