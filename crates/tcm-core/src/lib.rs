//! Core domain model and provenance types for TCM.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CRATE_NAME: &str = "tcm-core";

/// Coarse trust tier attached to an upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceReliability {
    VeryHigh,
    High,
    Medium,
    Low,
}

/// Kind of trade restriction an alert describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestrictionType {
    Tariff,
    Ban,
    Quota,
    License,
    Sanction,
    Embargo,
    Restriction,
}

impl RestrictionType {
    pub fn label(&self) -> &'static str {
        match self {
            RestrictionType::Tariff => "tariff",
            RestrictionType::Ban => "ban",
            RestrictionType::Quota => "quota",
            RestrictionType::License => "license",
            RestrictionType::Sanction => "sanction",
            RestrictionType::Embargo => "embargo",
            RestrictionType::Restriction => "restriction",
        }
    }
}

impl fmt::Display for RestrictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a cycle's article pool came from live providers or the built-in
/// fallback dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProvenance {
    Live,
    Simulated,
}

impl DataProvenance {
    pub fn label(&self) -> &'static str {
        match self {
            DataProvenance::Live => "live",
            DataProvenance::Simulated => "simulated",
        }
    }
}

/// Normalized handoff contract from source adapters into the extraction
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArticle {
    pub title: String,
    pub description: Option<String>,
    pub body: Option<String>,
    /// Absent when the provider omits a publish date; the synthesizer falls
    /// back to capture time.
    pub published_at: Option<DateTime<Utc>>,
    pub source_name: String,
    pub url: String,
    pub source_reliability: SourceReliability,
}

impl RawArticle {
    /// Concatenated searchable text the field extractors scan.
    pub fn full_text(&self) -> String {
        let mut text = self.title.clone();
        if let Some(description) = &self.description {
            text.push(' ');
            text.push_str(description);
        }
        if let Some(body) = &self.body {
            text.push(' ');
            text.push_str(body);
        }
        text
    }
}

/// Structured trade-restriction record synthesized from one article.
///
/// Serialized with camelCase keys: this shape is both the downstream wire
/// contract and the on-disk alert-log format, so the rename is load-bearing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceAlert {
    pub alert_id: String,
    pub summary: String,
    pub product: String,
    pub restriction_type: RestrictionType,
    pub from_countries: Vec<String>,
    pub to_countries: Vec<String>,
    pub tariff_rate: Option<String>,
    pub effective_date: Option<String>,
    pub date_published: DateTime<Utc>,
    pub source: String,
    pub title: String,
    pub link: String,
    pub confidence: u8,
    /// Stamped when the alert is accepted into the log, distinct from
    /// synthesis time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}
