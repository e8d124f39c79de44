//! Client for the HIAP (high-impact action prioritization) service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use catalyst_core::{ActionType, Language, SectorEmission};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::global_api::CityContext;
use crate::{endpoint, parse_base_url, AdapterError, HttpClient, HttpClientConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityEmissions {
    pub stationary_energy_emissions: f64,
    pub transportation_emissions: f64,
    pub waste_emissions: f64,
    pub ippu_emissions: f64,
    pub afolu_emissions: f64,
}

impl CityEmissions {
    pub fn from_sectors(sectors: &[SectorEmission]) -> Self {
        let mut out = Self::default();
        for sector in sectors {
            match sector.sector.as_str() {
                "I" => out.stationary_energy_emissions += sector.co2eq,
                "II" => out.transportation_emissions += sector.co2eq,
                "III" => out.waste_emissions += sector.co2eq,
                "IV" => out.ippu_emissions += sector.co2eq,
                "V" => out.afolu_emissions += sector.co2eq,
                _ => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityData {
    pub city_context_data: CityContext,
    pub city_emissions_data: CityEmissions,
}

impl CityData {
    pub fn locode(&self) -> &str {
        &self.city_context_data.locode
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityRequest {
    pub city_data: CityData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPrioritizationRequest {
    pub request_data: Vec<CityRequest>,
    pub language: Vec<Language>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskResponse {
    task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Explanation text, either per language or a single untranslated string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Explanation {
    ByLanguage(BTreeMap<String, String>),
    Plain(String),
}

impl Default for Explanation {
    fn default() -> Self {
        Explanation::ByLanguage(BTreeMap::new())
    }
}

impl Explanation {
    /// Text for `lang`, falling back to English and then to nothing.
    pub fn text_for(&self, lang: &Language) -> &str {
        match self {
            Explanation::Plain(text) => text,
            Explanation::ByLanguage(map) => map
                .get(lang.as_str())
                .or_else(|| map.get(Language::english().as_str()))
                .map(String::as_str)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedItem {
    pub action_id: String,
    pub rank: u32,
    #[serde(default)]
    pub explanation: Explanation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritizationMetadata {
    pub locode: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityPrioritization {
    pub metadata: PrioritizationMetadata,
    #[serde(default)]
    pub ranked_actions_mitigation: Vec<RankedItem>,
    #[serde(default)]
    pub ranked_actions_adaptation: Vec<RankedItem>,
}

impl CityPrioritization {
    pub fn ranked(&self, action_type: ActionType) -> &[RankedItem] {
        match action_type {
            ActionType::Mitigation => &self.ranked_actions_mitigation,
            ActionType::Adaptation => &self.ranked_actions_adaptation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPrioritizationResult {
    #[serde(default)]
    pub prioritizer_response_list: Vec<CityPrioritization>,
}

impl BulkPrioritizationResult {
    /// Entry for exactly `locode`; no case folding or trimming.
    pub fn for_locode(&self, locode: &str) -> Option<&CityPrioritization> {
        self.prioritizer_response_list
            .iter()
            .find(|entry| entry.metadata.locode == locode)
    }
}

#[async_trait]
pub trait PrioritizerApi: Send + Sync {
    /// Start a bulk prioritization job and return its task id.
    async fn start_bulk(&self, request: &BulkPrioritizationRequest) -> Result<String, AdapterError>;

    async fn check_progress(&self, task_id: &str) -> Result<TaskProgress, AdapterError>;

    async fn bulk_result(&self, task_id: &str) -> Result<BulkPrioritizationResult, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct HiapClient {
    http: HttpClient,
    base_url: Url,
}

impl HiapClient {
    pub fn new(base_url: &str, api_key: Option<&str>, mut config: HttpClientConfig) -> Result<Self, AdapterError> {
        if let Some(key) = api_key {
            config.default_headers.push(("x-api-key".to_string(), key.to_string()));
        }
        Ok(Self {
            http: HttpClient::new(config)?,
            base_url: parse_base_url(base_url)?,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        let mut all = vec!["prioritizer", "v1"];
        all.extend_from_slice(segments);
        endpoint(&self.base_url, &all)
    }
}

#[async_trait]
impl PrioritizerApi for HiapClient {
    async fn start_bulk(&self, request: &BulkPrioritizationRequest) -> Result<String, AdapterError> {
        let url = self.url(&["start_prioritization_bulk"])?;
        let resp: StartTaskResponse = self.http.post_json(url, request).await?;
        if resp.task_id.trim().is_empty() {
            return Err(AdapterError::Upstream("prioritizer returned an empty task id".into()));
        }
        info!(
            task_id = %resp.task_id,
            cities = request.request_data.len(),
            "started bulk prioritization"
        );
        Ok(resp.task_id)
    }

    async fn check_progress(&self, task_id: &str) -> Result<TaskProgress, AdapterError> {
        let url = self.url(&["check_prioritization_progress", task_id])?;
        self.http.get_json(url).await
    }

    async fn bulk_result(&self, task_id: &str) -> Result<BulkPrioritizationResult, AdapterError> {
        let url = self.url(&["get_prioritization_bulk", task_id])?;
        self.http.get_json(url).await
    }
}
