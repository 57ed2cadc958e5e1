//! Pôle emploi referential contract and its HTTP, fixture and in-memory gateways.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use immersion_core::{GeoPosition, ReferentialAgencyRecord};
use immersion_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "immersion-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching referential: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid referential payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Source of the full current referential snapshot. No pagination, no incremental fetch.
#[async_trait]
pub trait ReferentialGateway: Send + Sync {
    async fn get_agencies(&self) -> Result<Vec<ReferentialAgencyRecord>, AdapterError>;
}

/// Agency row as published by the Pôle emploi "référentiel des agences" API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeReferentialAgency {
    pub code: String,
    pub code_safir: String,
    #[serde(default)]
    pub libelle: String,
    pub libelle_etendu: String,
    #[serde(rename = "type", default)]
    pub agency_type: String,
    #[serde(default)]
    pub type_accueil: String,
    #[serde(rename = "codeRegionINSEE", default)]
    pub code_region_insee: String,
    #[serde(rename = "dispositifADEDA", default)]
    pub dispositif_adeda: bool,
    #[serde(default)]
    pub contact: Option<PeReferentialContact>,
    pub siret: String,
    pub adresse_principale: PeReferentialAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeReferentialContact {
    #[serde(default)]
    pub telephone_public: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeReferentialAddress {
    #[serde(default)]
    pub ligne4: String,
    #[serde(default)]
    pub ligne5: String,
    #[serde(default)]
    pub ligne6: String,
    pub gps_lon: f64,
    pub gps_lat: f64,
    #[serde(default)]
    pub commune_implantation: String,
    #[serde(default)]
    pub bureau_distributeur: String,
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl PeReferentialAgency {
    /// Shapes the raw row for matching. A blank contact email counts as missing.
    pub fn to_record(&self) -> ReferentialAgencyRecord {
        let address = &self.adresse_principale;
        ReferentialAgencyRecord {
            code: self.code.clone(),
            code_safir: self.code_safir.clone(),
            display_name: self.libelle_etendu.clone(),
            contact_email: self
                .contact
                .as_ref()
                .and_then(|c| c.email.as_deref())
                .and_then(text_or_none),
            siret: self.siret.clone(),
            address_lines: vec![
                address.ligne4.clone(),
                address.ligne5.clone(),
                address.ligne6.clone(),
            ],
            position: GeoPosition::new(address.gps_lat, address.gps_lon),
        }
    }
}

pub fn parse_referential_payload(bytes: &[u8]) -> Result<Vec<ReferentialAgencyRecord>, AdapterError> {
    let raw: Vec<PeReferentialAgency> = serde_json::from_slice(bytes)?;
    Ok(raw.iter().map(PeReferentialAgency::to_record).collect())
}

pub fn load_referential_fixture(path: impl AsRef<Path>) -> Result<Vec<ReferentialAgencyRecord>, AdapterError> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_referential_payload(&data)
}

/// Reads the referential from the live API.
#[derive(Debug)]
pub struct HttpPeReferentialGateway {
    http: HttpFetcher,
    url: String,
}

impl HttpPeReferentialGateway {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReferentialGateway for HttpPeReferentialGateway {
    async fn get_agencies(&self) -> Result<Vec<ReferentialAgencyRecord>, AdapterError> {
        let response = self.http.fetch_bytes(&self.url).await?;
        let records = parse_referential_payload(&response.body)?;
        info!(
            url = %response.final_url,
            bytes = response.body.len(),
            records = records.len(),
            "fetched pole emploi referential"
        );
        Ok(records)
    }
}

/// Reads a captured referential payload from disk.
#[derive(Debug, Clone)]
pub struct FixturePeReferentialGateway {
    path: PathBuf,
}

impl FixturePeReferentialGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReferentialGateway for FixturePeReferentialGateway {
    async fn get_agencies(&self) -> Result<Vec<ReferentialAgencyRecord>, AdapterError> {
        let records = load_referential_fixture(&self.path)?;
        info!(
            path = %self.path.display(),
            records = records.len(),
            "loaded pole emploi referential fixture"
        );
        Ok(records)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryReferentialGateway {
    records: Vec<ReferentialAgencyRecord>,
}

impl InMemoryReferentialGateway {
    pub fn new(records: Vec<ReferentialAgencyRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl ReferentialGateway for InMemoryReferentialGateway {
    async fn get_agencies(&self) -> Result<Vec<ReferentialAgencyRecord>, AdapterError> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/pe-referential/sample.json")
    }

    #[tokio::test]
    async fn fixture_gateway_maps_molsheim_record() {
        let gateway = FixturePeReferentialGateway::new(fixture_path());
        let records = gateway.get_agencies().await.expect("fixture records");
        assert_eq!(records.len(), 4);

        let molsheim = &records[0];
        assert_eq!(molsheim.code, "GES0024");
        assert_eq!(molsheim.code_safir, "67040");
        assert_eq!(molsheim.display_name, "Agence Pôle emploi MOLSHEIM");
        assert_eq!(molsheim.contact_email.as_deref(), Some("molsheim@pole-emploi.fr"));
        assert_eq!(molsheim.siret, "13000548120984");
        assert_eq!(molsheim.position, GeoPosition::new(48.532571, 7.511));
        assert_eq!(molsheim.address(), "16 b RUE Gaston Romazzotti, 67120 MOLSHEIM");
    }

    #[tokio::test]
    async fn missing_contact_or_blank_email_becomes_none() {
        let records = FixturePeReferentialGateway::new(fixture_path())
            .get_agencies()
            .await
            .expect("fixture records");
        let without_email = records
            .iter()
            .filter(|r| r.contact_email.is_none())
            .map(|r| r.code.as_str())
            .collect::<Vec<_>>();
        assert_eq!(without_email, vec!["GES0046", "IDF0112", "BRE0031"]);
    }

    #[test]
    fn malformed_payload_is_a_payload_error() {
        let err = parse_referential_payload(br#"[{"code": "X"}]"#).expect_err("should fail");
        assert!(matches!(err, AdapterError::Payload(_)));
    }

    #[test]
    fn missing_fixture_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.json");
        let err = load_referential_fixture(&path).expect_err("should fail");
        assert!(err.to_string().contains("absent.json"));
    }

    #[tokio::test]
    async fn in_memory_gateway_returns_its_snapshot() {
        let records = load_referential_fixture(fixture_path()).expect("fixture");
        let gateway = InMemoryReferentialGateway::new(records.clone());
        assert_eq!(gateway.get_agencies().await.expect("records"), records);
    }
}
