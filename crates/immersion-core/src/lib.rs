//! Core domain model for the Pôle emploi agency referential sync.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "immersion-core";

const EARTH_RADIUS_KM: f64 = 6371.0;

/// WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPosition {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle (haversine) distance in kilometres.
    pub fn distance_km(&self, other: &GeoPosition) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Closed set of agency kinds. Only `PoleEmploi` agencies are touched by the referential sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgencyKind {
    #[serde(rename = "pole-emploi")]
    PoleEmploi,
    #[serde(rename = "mission-locale")]
    MissionLocale,
    #[serde(rename = "cap-emploi")]
    CapEmploi,
    #[serde(rename = "conseil-departemental")]
    ConseilDepartemental,
    #[serde(rename = "prepa-apprentissage")]
    PrepaApprentissage,
    #[serde(rename = "structure-IAE")]
    StructureIae,
    #[serde(rename = "immersion-facile")]
    ImmersionFacile,
    #[serde(rename = "autre")]
    Autre,
}

impl AgencyKind {
    pub const ALL: [AgencyKind; 8] = [
        AgencyKind::PoleEmploi,
        AgencyKind::MissionLocale,
        AgencyKind::CapEmploi,
        AgencyKind::ConseilDepartemental,
        AgencyKind::PrepaApprentissage,
        AgencyKind::StructureIae,
        AgencyKind::ImmersionFacile,
        AgencyKind::Autre,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgencyKind::PoleEmploi => "pole-emploi",
            AgencyKind::MissionLocale => "mission-locale",
            AgencyKind::CapEmploi => "cap-emploi",
            AgencyKind::ConseilDepartemental => "conseil-departemental",
            AgencyKind::PrepaApprentissage => "prepa-apprentissage",
            AgencyKind::StructureIae => "structure-IAE",
            AgencyKind::ImmersionFacile => "immersion-facile",
            AgencyKind::Autre => "autre",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for AgencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review state of an agency. `FromApiPe` marks rows created by the referential sync
/// that no human has looked at yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgencyStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "needsReview")]
    NeedsReview,
    #[serde(rename = "from-api-PE")]
    FromApiPe,
}

impl AgencyStatus {
    pub const ALL: [AgencyStatus; 4] = [
        AgencyStatus::Active,
        AgencyStatus::Closed,
        AgencyStatus::NeedsReview,
        AgencyStatus::FromApiPe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgencyStatus::Active => "active",
            AgencyStatus::Closed => "closed",
            AgencyStatus::NeedsReview => "needsReview",
            AgencyStatus::FromApiPe => "from-api-PE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// Statuses returned by `get_all_active`-style reads.
    pub fn is_active(&self) -> bool {
        matches!(self, AgencyStatus::Active | AgencyStatus::FromApiPe)
    }
}

impl fmt::Display for AgencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted agency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agency {
    pub id: Uuid,
    pub name: String,
    pub counsellor_emails: Vec<String>,
    pub validator_emails: Vec<String>,
    pub admin_emails: Vec<String>,
    pub address: String,
    pub position: GeoPosition,
    pub signature: String,
    pub questionnaire_url: String,
    pub agency_siret: Option<String>,
    pub external_code: Option<String>,
    pub kind: AgencyKind,
    pub status: AgencyStatus,
}

impl Agency {
    pub fn is_pole_emploi(&self) -> bool {
        self.kind == AgencyKind::PoleEmploi
    }

    pub fn has_email(&self, email: &str) -> bool {
        self.counsellor_emails.iter().any(|e| e == email)
            || self.validator_emails.iter().any(|e| e == email)
    }
}

/// One agency row of the third-party Pôle emploi referential, already shaped for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferentialAgencyRecord {
    pub code: String,
    pub code_safir: String,
    pub display_name: String,
    pub contact_email: Option<String>,
    pub siret: String,
    pub address_lines: Vec<String>,
    pub position: GeoPosition,
}

impl ReferentialAgencyRecord {
    pub fn address(&self) -> String {
        normalize_address(self.address_lines.as_slice())
    }
}

/// Joins the non-blank address lines with `", "`. Blank lines leave no empty segment behind.
pub fn normalize_address<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .map(|line| line.as_ref().trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgencyEmails {
    pub counsellor_emails: Vec<String>,
    pub validator_emails: Vec<String>,
}

/// Appends `new_email` to the validator list unless it is absent or already known
/// as a counsellor or validator email. Inputs are never modified.
pub fn merge_validator_email(
    counsellor_emails: &[String],
    validator_emails: &[String],
    new_email: Option<&str>,
) -> AgencyEmails {
    let mut merged = AgencyEmails {
        counsellor_emails: counsellor_emails.to_vec(),
        validator_emails: validator_emails.to_vec(),
    };
    let Some(email) = new_email else {
        return merged;
    };
    let already_known = counsellor_emails.iter().any(|e| e == email)
        || validator_emails.iter().any(|e| e == email);
    if !already_known {
        merged.validator_emails.push(email.to_string());
    }
    merged
}

/// Signature used in outgoing correspondence for referential-created agencies.
pub fn pole_emploi_signature(display_name: &str) -> String {
    format!("L'équipe de l'{display_name}")
}
