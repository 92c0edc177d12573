//! Instrument registry: questionnaire definitions, scoring, and categorization.
//!
//! Instruments are data: the catalogue is a versioned JSON document loaded at
//! startup. New questionnaires are added by adding catalogue entries.

pub mod model;
pub mod registry;
pub mod scoring;

pub use model::{CategoryBand, InstrumentDefinition, Prompt, ScaleOption, ScoringRule};
pub use registry::InstrumentRegistry;
pub use scoring::{Assessment, categorize, total_score};
