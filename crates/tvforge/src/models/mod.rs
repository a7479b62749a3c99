//! Domain models shared across the pipeline.
//!
//! A [`Proxy`] is the tenant configuration a pipeline run assembles artifacts
//! for: its stream/EPG sources, its filter assignments, and its numbering and
//! logo-caching preferences. Channels and programs are the records flowing
//! through the stages. The condition-tree types are the compiled form of
//! filter expressions produced by [`crate::expression_parser`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant configuration consumed by one pipeline run. Immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sources: Vec<ProxySource>,
    #[serde(default)]
    pub epg_sources: Vec<EpgSourceRef>,
    #[serde(default)]
    pub filters: Vec<ProxyFilter>,
    /// Output directory override; empty means the configured default.
    #[serde(default)]
    pub output_path: Option<String>,
    /// First channel number to assign; 0 is treated as 1.
    #[serde(default)]
    pub starting_channel_number: u32,
    /// Numbering strategy; `None` means the stage default.
    #[serde(default)]
    pub numbering_mode: Option<NumberingMode>,
    /// Band width for group numbering; 0 means the stage default.
    #[serde(default)]
    pub group_numbering_size: u32,
    #[serde(default)]
    pub cache_channel_logos: bool,
    #[serde(default)]
    pub cache_program_logos: bool,
}

/// Stream source attached to a proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySource {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

/// EPG source attached to a proxy. `enabled` is tri-state: absent means enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgSourceRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub priority: i32,
}

/// Assignment of a filter to a proxy, carrying per-proxy ordering and an
/// activation flag. `filter` may be absent when the referenced filter was
/// deleted out from under the assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyFilter {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub filter: Option<Filter>,
}

/// A reusable filter definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: String,
    pub name: String,
    pub is_enabled: bool,
    pub source_type: FilterSourceType,
    pub action: FilterAction,
    pub expression: String,
}

/// What kind of records a filter selects over. Stored values outside the
/// known set deserialize to `Unknown` and are skipped at filter load time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(from = "String", into = "String")]
#[strum(serialize_all = "lowercase")]
pub enum FilterSourceType {
    Stream,
    Epg,
    Unknown,
}

impl From<String> for FilterSourceType {
    fn from(value: String) -> Self {
        value.parse().unwrap_or(FilterSourceType::Unknown)
    }
}

impl From<FilterSourceType> for String {
    fn from(value: FilterSourceType) -> Self {
        value.to_string()
    }
}

/// Whether matching records are added to or removed from the output. Stored
/// values outside the known set deserialize to `Unknown` and are skipped at
/// filter load time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(from = "String", into = "String")]
#[strum(serialize_all = "lowercase")]
pub enum FilterAction {
    Include,
    Exclude,
    Unknown,
}

impl From<String> for FilterAction {
    fn from(value: String) -> Self {
        value.parse().unwrap_or(FilterAction::Unknown)
    }
}

impl From<FilterAction> for String {
    fn from(value: FilterAction) -> Self {
        value.to_string()
    }
}

/// Channel numbering strategy. Stored values outside the known set
/// deserialize to `Unknown`, which the numbering stage treats as sequential.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(from = "String", into = "String")]
#[strum(serialize_all = "lowercase")]
pub enum NumberingMode {
    Sequential,
    Preserve,
    Group,
    Unknown,
}

impl From<String> for NumberingMode {
    fn from(value: String) -> Self {
        value.parse().unwrap_or(NumberingMode::Unknown)
    }
}

impl From<NumberingMode> for String {
    fn from(value: NumberingMode) -> Self {
        value.to_string()
    }
}

/// An IPTV channel entry as it flows through the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub tvg_id: Option<String>,
    #[serde(default)]
    pub tvg_name: Option<String>,
    pub channel_name: String,
    #[serde(default)]
    pub tvg_logo: Option<String>,
    #[serde(default)]
    pub group_title: Option<String>,
    pub stream_url: String,
    /// Assigned channel number; 0 means unassigned.
    #[serde(default)]
    pub channel_number: u32,
}

/// A scheduled EPG program, associated to a channel by TVG id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgProgram {
    pub channel_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

/// Comparison operators available in filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "matches")]
    Matches,
    #[serde(rename = "equals")]
    Equals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "not_matches")]
    NotMatches,
    #[serde(rename = "not_equals")]
    NotEquals,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "not_starts_with")]
    NotStartsWith,
    #[serde(rename = "not_ends_with")]
    NotEndsWith,
    #[serde(rename = "greater_than")]
    GreaterThan,
    #[serde(rename = "less_than")]
    LessThan,
    #[serde(rename = "greater_than_or_equal")]
    GreaterThanOrEqual,
    #[serde(rename = "less_than_or_equal")]
    LessThanOrEqual,
}

impl std::fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FilterOperator::Matches => "matches",
            FilterOperator::Equals => "equals",
            FilterOperator::Contains => "contains",
            FilterOperator::StartsWith => "starts_with",
            FilterOperator::EndsWith => "ends_with",
            FilterOperator::NotMatches => "not_matches",
            FilterOperator::NotEquals => "not_equals",
            FilterOperator::NotContains => "not_contains",
            FilterOperator::NotStartsWith => "not_starts_with",
            FilterOperator::NotEndsWith => "not_ends_with",
            FilterOperator::GreaterThan => "greater_than",
            FilterOperator::LessThan => "less_than",
            FilterOperator::GreaterThanOrEqual => "greater_than_or_equal",
            FilterOperator::LessThanOrEqual => "less_than_or_equal",
        };
        write!(f, "{s}")
    }
}

impl FilterOperator {
    /// The negated counterpart, used when the `not` modifier is applied.
    pub fn negated(self) -> Option<FilterOperator> {
        match self {
            FilterOperator::Matches => Some(FilterOperator::NotMatches),
            FilterOperator::Equals => Some(FilterOperator::NotEquals),
            FilterOperator::Contains => Some(FilterOperator::NotContains),
            FilterOperator::StartsWith => Some(FilterOperator::NotStartsWith),
            FilterOperator::EndsWith => Some(FilterOperator::NotEndsWith),
            _ => None,
        }
    }
}

/// Logical combinators for condition groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOperator {
    #[serde(rename = "and")]
    And,
    #[serde(rename = "or")]
    Or,
}

impl std::fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalOperator::And => write!(f, "and"),
            LogicalOperator::Or => write!(f, "or"),
        }
    }
}

/// Node of a compiled filter expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConditionNode {
    #[serde(rename = "condition")]
    Condition {
        field: String,
        operator: FilterOperator,
        value: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    #[serde(rename = "group")]
    Group {
        operator: LogicalOperator,
        children: Vec<ConditionNode>,
    },
}

/// A complete compiled filter expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionTree {
    pub root: ConditionNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_source_type_round_trips() {
        assert_eq!(
            serde_json::from_str::<FilterSourceType>("\"stream\"").unwrap(),
            FilterSourceType::Stream
        );
        assert_eq!(
            serde_json::from_str::<FilterSourceType>("\"epg\"").unwrap(),
            FilterSourceType::Epg
        );
        assert_eq!(
            serde_json::from_str::<FilterSourceType>("\"bogus\"").unwrap(),
            FilterSourceType::Unknown
        );
    }

    #[test]
    fn numbering_mode_parses_from_config_strings() {
        use std::str::FromStr;
        assert_eq!(NumberingMode::from_str("preserve").unwrap(), NumberingMode::Preserve);
        assert_eq!(NumberingMode::from_str("group").unwrap(), NumberingMode::Group);
        assert!(NumberingMode::from_str("").is_err());
    }

    #[test]
    fn numbering_mode_deserializes_unknown_strings_to_unknown() {
        assert_eq!(
            serde_json::from_str::<NumberingMode>("\"sequential\"").unwrap(),
            NumberingMode::Sequential
        );
        assert_eq!(
            serde_json::from_str::<NumberingMode>("\"alphabetical\"").unwrap(),
            NumberingMode::Unknown
        );
        assert_eq!(
            serde_json::to_string(&NumberingMode::Preserve).unwrap(),
            "\"preserve\""
        );
    }

    #[test]
    fn condition_tree_serializes_with_tagged_nodes() {
        let tree = ConditionTree {
            root: ConditionNode::Condition {
                field: "channel_name".to_string(),
                operator: FilterOperator::Contains,
                value: "Sports".to_string(),
                case_sensitive: false,
            },
        };
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["root"]["type"], "condition");
        assert_eq!(json["root"]["operator"], "contains");
    }
}
