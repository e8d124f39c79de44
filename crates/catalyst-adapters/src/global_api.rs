//! Global API city context (population, area, biome) keyed by locode.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{endpoint, parse_base_url, AdapterError, HttpClient, HttpClientConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityContext {
    #[serde(default)]
    pub locode: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default, alias = "population")]
    pub population_size: Option<u64>,
    #[serde(default)]
    pub population_density: Option<f64>,
    #[serde(default, alias = "area")]
    pub area_km2: Option<f64>,
    #[serde(default)]
    pub elevation: Option<f64>,
    #[serde(default)]
    pub biome: Option<String>,
}

#[async_trait]
pub trait CityContextSource: Send + Sync {
    async fn city_context(&self, locode: &str) -> Result<CityContext, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct GlobalApiClient {
    http: HttpClient,
    base_url: Url,
}

impl GlobalApiClient {
    pub fn new(base_url: &str, config: HttpClientConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            http: HttpClient::new(config)?,
            base_url: parse_base_url(base_url)?,
        })
    }
}

#[async_trait]
impl CityContextSource for GlobalApiClient {
    async fn city_context(&self, locode: &str) -> Result<CityContext, AdapterError> {
        let url = endpoint(&self.base_url, &["api", "v0", "city_context", "city", locode])?;
        let mut context: CityContext = self.http.get_json(url).await?;
        if context.locode.is_empty() {
            context.locode = locode.to_string();
        }
        if context.locode != locode {
            return Err(AdapterError::Upstream(format!(
                "city context for {locode} came back as {}",
                context.locode
            )));
        }
        if context.population_density.is_none() {
            if let (Some(population), Some(area)) = (context.population_size, context.area_km2) {
                if area > 0.0 {
                    context.population_density = Some(population as f64 / area);
                }
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{fast_config, spawn_server};

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn server() -> String {
        let app = Router::new().route(
            "/api/v0/city_context/city/{locode}",
            get(|Path(locode): Path<String>| async move {
                match locode.as_str() {
                    "BR SAO" => Ok(Json(json!({
                        "locode": "BR SAO",
                        "name": "São Paulo",
                        "population": 1000,
                        "area": 4.0,
                        "biome": "tropical"
                    }))),
                    "AR BUE" => Ok(Json(json!({ "locode": "AR COR" }))),
                    "CL SCL" => Ok(Json(json!({ "population": 500, "biome": "mediterranean" }))),
                    _ => Err(StatusCode::NOT_FOUND),
                }
            }),
        );
        spawn_server(app).await
    }

    #[tokio::test]
    async fn fetches_context_and_derives_density() {
        let client = GlobalApiClient::new(&server().await, fast_config()).unwrap();
        let context = client.city_context("BR SAO").await.unwrap();
        assert_eq!(context.population_size, Some(1000));
        assert_eq!(context.area_km2, Some(4.0));
        assert_eq!(context.population_density, Some(250.0));
        assert_eq!(context.biome.as_deref(), Some("tropical"));
    }

    #[tokio::test]
    async fn unknown_city_is_an_http_error() {
        let client = GlobalApiClient::new(&server().await, fast_config()).unwrap();
        let err = client.city_context("XX XXX").await.unwrap_err();
        assert!(matches!(err, AdapterError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn context_for_another_locode_is_rejected() {
        let client = GlobalApiClient::new(&server().await, fast_config()).unwrap();
        let err = client.city_context("AR BUE").await.unwrap_err();
        assert!(err.to_string().contains("AR COR"));
    }

    #[tokio::test]
    async fn response_without_locode_takes_the_requested_one() {
        let client = GlobalApiClient::new(&server().await, fast_config()).unwrap();
        let context = client.city_context("CL SCL").await.unwrap();
        assert_eq!(context.locode, "CL SCL");
        assert_eq!(context.population_size, Some(500));
        assert_eq!(context.population_density, None);
    }
}
