//! Coordination rule model
//!
//! A rule says: when `source_field_path` of a `source_doc_type` document
//! changes, write a transformed value into `target_field_path` of every
//! `target_doc_type` document of the same opportunity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::RuleId;
use crate::error::{Error, Result};

/// Closed set of document types known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    TechnicalVolume,
    PricingVolume,
    CoverLetter,
    ExecutiveSummary,
    ManagementVolume,
    PastPerformance,
    ComplianceMatrix,
}

impl DocType {
    pub const ALL: [Self; 7] = [
        Self::TechnicalVolume,
        Self::PricingVolume,
        Self::CoverLetter,
        Self::ExecutiveSummary,
        Self::ManagementVolume,
        Self::PastPerformance,
        Self::ComplianceMatrix,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TechnicalVolume => "technical_volume",
            Self::PricingVolume => "pricing_volume",
            Self::CoverLetter => "cover_letter",
            Self::ExecutiveSummary => "executive_summary",
            Self::ManagementVolume => "management_volume",
            Self::PastPerformance => "past_performance",
            Self::ComplianceMatrix => "compliance_matrix",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|doc_type| doc_type.as_str() == wanted)
            .ok_or_else(|| Error::validation(format!("unknown document type '{wanted}'")))
    }
}

/// Function class applied when cascading a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    Copy,
    Format,
    Aggregate,
    Reference,
}

impl TransformType {
    pub const ALL: [Self; 4] = [Self::Copy, Self::Format, Self::Aggregate, Self::Reference];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Format => "format",
            Self::Aggregate => "aggregate",
            Self::Reference => "reference",
        }
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|transform| transform.as_str() == wanted)
            .ok_or_else(|| Error::validation(format!("unknown transform type '{wanted}'")))
    }
}

/// A stored coordination rule. Never hard-deleted; `is_active = false` is the delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationRule {
    pub id: RuleId,
    pub organization_id: String,
    pub source_doc_type: DocType,
    pub source_field_path: String,
    pub target_doc_type: DocType,
    pub target_field_path: String,
    pub transform_type: TransformType,
    pub is_active: bool,
    pub description: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl CoordinationRule {
    pub fn is_self_loop(&self) -> bool {
        self.source_doc_type == self.target_doc_type
            && self.source_field_path == self.target_field_path
    }
}

/// Untrusted input for `create_rule`; doc and transform types arrive as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    pub organization_id: String,
    pub source_doc_type: String,
    pub source_field_path: String,
    pub target_doc_type: String,
    pub target_field_path: String,
    pub transform_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewRule {
    /// Validate the input and build an active rule stamped at `now`.
    pub fn into_rule(self, now: i64) -> Result<CoordinationRule> {
        let organization_id = self.organization_id.trim().to_string();
        if organization_id.is_empty() {
            return Err(Error::validation("organization id must not be empty"));
        }

        let rule = CoordinationRule {
            id: RuleId::new(),
            organization_id,
            source_doc_type: self.source_doc_type.parse()?,
            source_field_path: normalize_field_path(&self.source_field_path, "source")?,
            target_doc_type: self.target_doc_type.parse()?,
            target_field_path: normalize_field_path(&self.target_field_path, "target")?,
            transform_type: self.transform_type.parse()?,
            is_active: true,
            description: crate::util::normalize_text_option(self.description),
            created_at: now,
            updated_at: now,
        };

        if rule.is_self_loop() {
            return Err(Error::validation(format!(
                "rule may not target its own source ({}.{})",
                rule.source_doc_type, rule.source_field_path
            )));
        }
        Ok(rule)
    }
}

/// Partial update for `update_rule`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleUpdate {
    pub source_doc_type: Option<String>,
    pub source_field_path: Option<String>,
    pub target_doc_type: Option<String>,
    pub target_field_path: Option<String>,
    pub transform_type: Option<String>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
}

impl RuleUpdate {
    pub const fn is_empty(&self) -> bool {
        self.source_doc_type.is_none()
            && self.source_field_path.is_none()
            && self.target_doc_type.is_none()
            && self.target_field_path.is_none()
            && self.transform_type.is_none()
            && self.is_active.is_none()
            && self.description.is_none()
    }

    /// Apply onto `rule`, returning the names of the fields that were supplied.
    pub fn apply_to(self, rule: &mut CoordinationRule, now: i64) -> Result<Vec<&'static str>> {
        let mut changed = Vec::new();

        if let Some(value) = self.source_doc_type {
            rule.source_doc_type = value.parse()?;
            changed.push("source_doc_type");
        }
        if let Some(value) = self.source_field_path {
            rule.source_field_path = normalize_field_path(&value, "source")?;
            changed.push("source_field_path");
        }
        if let Some(value) = self.target_doc_type {
            rule.target_doc_type = value.parse()?;
            changed.push("target_doc_type");
        }
        if let Some(value) = self.target_field_path {
            rule.target_field_path = normalize_field_path(&value, "target")?;
            changed.push("target_field_path");
        }
        if let Some(value) = self.transform_type {
            rule.transform_type = value.parse()?;
            changed.push("transform_type");
        }
        if let Some(value) = self.is_active {
            rule.is_active = value;
            changed.push("is_active");
        }
        if let Some(value) = self.description {
            rule.description = crate::util::normalize_text_option(Some(value));
            changed.push("description");
        }

        if rule.is_self_loop() {
            return Err(Error::validation(format!(
                "rule may not target its own source ({}.{})",
                rule.source_doc_type, rule.source_field_path
            )));
        }

        rule.updated_at = now;
        Ok(changed)
    }
}

/// Trim a dotted field path and reject empty paths or empty segments.
pub fn normalize_field_path(raw: &str, side: &str) -> Result<String> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(Error::validation(format!("{side} field path must not be empty")));
    }
    if path.split('.').any(|segment| segment.trim().is_empty()) {
        return Err(Error::validation(format!(
            "{side} field path '{path}' contains an empty segment"
        )));
    }
    Ok(path.to_string())
}
