//! PostgreSQL/PostGIS agency store.
//!
//! Expects an `agencies` table shaped as:
//!
//! ```sql
//! CREATE TABLE agencies (
//!     id                uuid PRIMARY KEY,
//!     name              text NOT NULL,
//!     counsellor_emails jsonb NOT NULL DEFAULT '[]',
//!     validator_emails  jsonb NOT NULL DEFAULT '[]',
//!     admin_emails      jsonb NOT NULL DEFAULT '[]',
//!     address           text NOT NULL,
//!     position          geography(Point, 4326) NOT NULL,
//!     email_signature   text NOT NULL,
//!     questionnaire_url text NOT NULL,
//!     agency_siret      text,
//!     code              text,
//!     kind              text NOT NULL,
//!     status            text NOT NULL,
//!     created_at        timestamptz NOT NULL DEFAULT NOW(),
//!     updated_at        timestamptz NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! `created_at` is left to its default on insert. `updated_at` is bumped on every update.

use anyhow::Context;
use async_trait::async_trait;
use immersion_core::{Agency, AgencyKind, AgencyStatus, GeoPosition};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::{AgencyRepository, RepositoryError};

const AGENCY_COLUMNS: &str = r#"
    id, name, counsellor_emails, validator_emails, admin_emails, address,
    ST_Y(position::geometry) AS lat, ST_X(position::geometry) AS lon,
    email_signature, questionnaire_url, agency_siret, code, kind, status
"#;

#[derive(Debug, Clone)]
pub struct PgAgencyRepository {
    pool: PgPool,
}

impl PgAgencyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to agency database")?;
        Ok(Self::new(pool))
    }
}

fn agency_from_row(row: &PgRow) -> Result<Agency, RepositoryError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let Json(counsellor_emails): Json<Vec<String>> = row.try_get("counsellor_emails")?;
    let Json(validator_emails): Json<Vec<String>> = row.try_get("validator_emails")?;
    let Json(admin_emails): Json<Vec<String>> = row.try_get("admin_emails")?;

    Ok(Agency {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        counsellor_emails,
        validator_emails,
        admin_emails,
        address: row.try_get("address")?,
        position: GeoPosition::new(row.try_get("lat")?, row.try_get("lon")?),
        signature: row.try_get("email_signature")?,
        questionnaire_url: row.try_get("questionnaire_url")?,
        agency_siret: row.try_get("agency_siret")?,
        external_code: row.try_get("code")?,
        kind: AgencyKind::parse(&kind)
            .ok_or_else(|| RepositoryError::InvalidRow(format!("unknown agency kind {kind}")))?,
        status: AgencyStatus::parse(&status)
            .ok_or_else(|| RepositoryError::InvalidRow(format!("unknown agency status {status}")))?,
    })
}

fn agencies_from_rows(rows: &[PgRow]) -> Result<Vec<Agency>, RepositoryError> {
    rows.iter().map(agency_from_row).collect()
}

#[async_trait]
impl AgencyRepository for PgAgencyRepository {
    async fn get_all_active(&self) -> Result<Vec<Agency>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENCY_COLUMNS} FROM agencies WHERE status IN ($1, $2) ORDER BY name"
        ))
        .bind(AgencyStatus::Active.as_str())
        .bind(AgencyStatus::FromApiPe.as_str())
        .fetch_all(&self.pool)
        .await?;
        agencies_from_rows(&rows)
    }

    async fn get_nearby(
        &self,
        position: GeoPosition,
        radius_km: f64,
    ) -> Result<Vec<Agency>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {AGENCY_COLUMNS}
              FROM agencies
             WHERE ST_DWithin(position, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, $3 * 1000)
             ORDER BY ST_Distance(position, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography)
            "#
        ))
        .bind(position.lon)
        .bind(position.lat)
        .bind(radius_km)
        .fetch_all(&self.pool)
        .await?;
        agencies_from_rows(&rows)
    }

    async fn get_agency_where_email_matches(
        &self,
        email: &str,
    ) -> Result<Option<Agency>, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {AGENCY_COLUMNS}
              FROM agencies
             WHERE validator_emails @> jsonb_build_array($1::text)
                OR counsellor_emails @> jsonb_build_array($1::text)
             ORDER BY (kind = $2) DESC, created_at, id
             LIMIT 1
            "#
        ))
        .bind(email)
        .bind(AgencyKind::PoleEmploi.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agency_from_row).transpose()
    }

    async fn insert(&self, agency: Agency) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agencies (
                id, name, counsellor_emails, validator_emails, admin_emails, address, position,
                email_signature, questionnaire_url, agency_siret, code, kind, status
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, ST_SetSRID(ST_MakePoint($7, $8), 4326)::geography,
                $9, $10, $11, $12, $13, $14
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(agency.id)
        .bind(&agency.name)
        .bind(Json(&agency.counsellor_emails))
        .bind(Json(&agency.validator_emails))
        .bind(Json(&agency.admin_emails))
        .bind(&agency.address)
        .bind(agency.position.lon)
        .bind(agency.position.lat)
        .bind(&agency.signature)
        .bind(&agency.questionnaire_url)
        .bind(&agency.agency_siret)
        .bind(&agency.external_code)
        .bind(agency.kind.as_str())
        .bind(agency.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists(agency.id));
        }
        Ok(())
    }

    async fn update(&self, agency: Agency) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE agencies
               SET name = $2,
                   counsellor_emails = $3,
                   validator_emails = $4,
                   admin_emails = $5,
                   address = $6,
                   position = ST_SetSRID(ST_MakePoint($7, $8), 4326)::geography,
                   email_signature = $9,
                   questionnaire_url = $10,
                   agency_siret = $11,
                   code = $12,
                   kind = $13,
                   status = $14,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(agency.id)
        .bind(&agency.name)
        .bind(Json(&agency.counsellor_emails))
        .bind(Json(&agency.validator_emails))
        .bind(Json(&agency.admin_emails))
        .bind(&agency.address)
        .bind(agency.position.lon)
        .bind(agency.position.lat)
        .bind(&agency.signature)
        .bind(&agency.questionnaire_url)
        .bind(&agency.agency_siret)
        .bind(&agency.external_code)
        .bind(agency.kind.as_str())
        .bind(agency.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(agency.id));
        }
        Ok(())
    }
}
