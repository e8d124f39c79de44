//! Core domain model for CityCatalyst action prioritization and import mapping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod gpc;
pub mod import_mapping;

pub const CRATE_NAME: &str = "catalyst-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown {kind} value: {value:?}")]
    UnknownValue { kind: &'static str, value: String },
    #[error("language code must not be empty")]
    EmptyLanguage,
    #[error("at least one language is required")]
    NoLanguages,
}

/// Lifecycle of a prioritization unit: `TO_DO -> PENDING -> {SUCCESS | FAILURE}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankingStatus {
    ToDo,
    Pending,
    Success,
    Failure,
}

impl RankingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RankingStatus::ToDo => "TO_DO",
            RankingStatus::Pending => "PENDING",
            RankingStatus::Success => "SUCCESS",
            RankingStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for RankingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankingStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TO_DO" => Ok(RankingStatus::ToDo),
            "PENDING" => Ok(RankingStatus::Pending),
            "SUCCESS" => Ok(RankingStatus::Success),
            "FAILURE" => Ok(RankingStatus::Failure),
            other => Err(ParseError::UnknownValue {
                kind: "ranking status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Mitigation,
    Adaptation,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Mitigation => "mitigation",
            ActionType::Adaptation => "adaptation",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mitigation" => Ok(ActionType::Mitigation),
            "adaptation" => Ok(ActionType::Adaptation),
            _ => Err(ParseError::UnknownValue {
                kind: "action type",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryType {
    GpcBasic,
    GpcBasicPlus,
}

impl InventoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            InventoryType::GpcBasic => "gpc_basic",
            InventoryType::GpcBasicPlus => "gpc_basic_plus",
        }
    }
}

impl fmt::Display for InventoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InventoryType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpc_basic" => Ok(InventoryType::GpcBasic),
            "gpc_basic_plus" => Ok(InventoryType::GpcBasicPlus),
            other => Err(ParseError::UnknownValue {
                kind: "inventory type",
                value: other.to_string(),
            }),
        }
    }
}

/// Lower-cased ISO-639-1 language code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Language(String);

impl Language {
    pub fn new(code: &str) -> Result<Self, ParseError> {
        let code = code.trim().to_ascii_lowercase();
        if code.is_empty() {
            return Err(ParseError::EmptyLanguage);
        }
        Ok(Self(code))
    }

    pub fn english() -> Self {
        Self("en".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Language {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Language::new(&value)
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.0
    }
}

/// Sorted, de-duplicated language set; never empty.
pub fn normalize_languages<I, S>(codes: I) -> Result<Vec<Language>, ParseError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut langs = codes
        .into_iter()
        .map(|c| Language::new(c.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    langs.sort();
    langs.dedup();
    if langs.is_empty() {
        return Err(ParseError::NoLanguages);
    }
    Ok(langs)
}

/// One (inventory, action type, language set) unit of prioritization work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ranking {
    pub id: Uuid,
    pub project_id: Uuid,
    pub inventory_id: Uuid,
    pub locode: String,
    pub action_type: ActionType,
    pub langs: Vec<Language>,
    pub job_id: Option<String>,
    pub status: RankingStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRanking {
    pub project_id: Uuid,
    pub inventory_id: Uuid,
    pub locode: String,
    pub action_type: ActionType,
    pub langs: Vec<Language>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedAction {
    pub id: Uuid,
    pub ranking_id: Uuid,
    pub action_id: String,
    pub rank: u32,
    pub explanation: String,
    pub lang: Language,
    pub action_type: ActionType,
    pub is_selected: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRankedAction {
    pub action_id: String,
    pub rank: u32,
    pub explanation: String,
    pub lang: Language,
    pub action_type: ActionType,
}

/// A city of a project together with its inventory for a given year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityInventory {
    pub city_id: Uuid,
    pub city_name: String,
    pub locode: String,
    pub inventory_id: Uuid,
    pub year: i32,
    pub inventory_type: InventoryType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRecord {
    pub id: Uuid,
    pub city_id: Uuid,
    pub project_id: Uuid,
    pub locode: String,
    pub year: i32,
    pub inventory_type: InventoryType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectorEmission {
    /// Roman numeral of the GPC sector (`I`..`V`).
    pub sector: String,
    pub co2eq: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip_through_store_encoding() {
        for status in [
            RankingStatus::ToDo,
            RankingStatus::Pending,
            RankingStatus::Success,
            RankingStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<RankingStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<RankingStatus>().is_err());
    }

    #[test]
    fn status_serializes_as_upper_snake_case() {
        let json = serde_json::to_string(&RankingStatus::ToDo).unwrap();
        assert_eq!(json, "\"TO_DO\"");
    }

    #[test]
    fn action_type_parsing_is_case_insensitive() {
        assert_eq!("Mitigation".parse::<ActionType>().unwrap(), ActionType::Mitigation);
        assert_eq!(" adaptation ".parse::<ActionType>().unwrap(), ActionType::Adaptation);
        assert!("resilience".parse::<ActionType>().is_err());
    }

    #[test]
    fn languages_are_normalized_sorted_and_deduplicated() {
        let langs = normalize_languages(["es", "EN", "en"]).unwrap();
        assert_eq!(langs, vec![Language::english(), Language::new("es").unwrap()]);
        assert_eq!(normalize_languages(Vec::<String>::new()), Err(ParseError::NoLanguages));
        assert_eq!(normalize_languages(["  "]), Err(ParseError::EmptyLanguage));
    }

    #[test]
    fn language_deserialization_rejects_empty_codes() {
        assert!(serde_json::from_str::<Language>("\"\"").is_err());
        let lang: Language = serde_json::from_str("\"PT\"").unwrap();
        assert_eq!(lang.as_str(), "pt");
    }
}
