//! Agency store contract, its in-memory and Postgres implementations, and the HTTP
//! transport used to reach the referential.

use async_trait::async_trait;
use immersion_core::{Agency, GeoPosition};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod http;
mod pg;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use pg::PgAgencyRepository;

pub const CRATE_NAME: &str = "immersion-storage";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("agency {0} already exists")]
    AlreadyExists(Uuid),
    #[error("agency {0} not found")]
    NotFound(Uuid),
    #[error("invalid agency row: {0}")]
    InvalidRow(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Read/write access to the mutable agency store.
///
/// `get_nearby` does not filter by kind, and neither does `get_agency_where_email_matches`:
/// both see every agency in the store. The radius is expressed in kilometres and the
/// boundary is inclusive.
///
/// When several agencies hold the same email, `get_agency_where_email_matches` returns a
/// `pole-emploi` one if there is any, so a same-email agency of another kind never hides it.
#[async_trait]
pub trait AgencyRepository: Send + Sync {
    async fn get_all_active(&self) -> Result<Vec<Agency>, RepositoryError>;

    async fn get_nearby(
        &self,
        position: GeoPosition,
        radius_km: f64,
    ) -> Result<Vec<Agency>, RepositoryError>;

    async fn get_agency_where_email_matches(
        &self,
        email: &str,
    ) -> Result<Option<Agency>, RepositoryError>;

    async fn insert(&self, agency: Agency) -> Result<(), RepositoryError>;

    async fn update(&self, agency: Agency) -> Result<(), RepositoryError>;
}

/// Insertion-ordered store kept in process memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryAgencyRepository {
    agencies: Mutex<Vec<Agency>>,
}

impl InMemoryAgencyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agencies(agencies: Vec<Agency>) -> Self {
        Self {
            agencies: Mutex::new(agencies),
        }
    }

    pub async fn snapshot(&self) -> Vec<Agency> {
        self.agencies.lock().await.clone()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Option<Agency> {
        self.agencies
            .lock()
            .await
            .iter()
            .find(|agency| agency.id == id)
            .cloned()
    }
}

#[async_trait]
impl AgencyRepository for InMemoryAgencyRepository {
    async fn get_all_active(&self) -> Result<Vec<Agency>, RepositoryError> {
        Ok(self
            .agencies
            .lock()
            .await
            .iter()
            .filter(|agency| agency.status.is_active())
            .cloned()
            .collect())
    }

    async fn get_nearby(
        &self,
        position: GeoPosition,
        radius_km: f64,
    ) -> Result<Vec<Agency>, RepositoryError> {
        let agencies = self.agencies.lock().await;
        let mut nearby = agencies
            .iter()
            .map(|agency| (agency.position.distance_km(&position), agency))
            .filter(|(distance, _)| *distance <= radius_km)
            .collect::<Vec<_>>();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(nearby.into_iter().map(|(_, agency)| agency.clone()).collect())
    }

    async fn get_agency_where_email_matches(
        &self,
        email: &str,
    ) -> Result<Option<Agency>, RepositoryError> {
        let agencies = self.agencies.lock().await;
        let mut matching = agencies.iter().filter(|agency| agency.has_email(email));
        let first = matching.next();
        let preferred = first
            .filter(|agency| agency.is_pole_emploi())
            .or_else(|| matching.find(|agency| agency.is_pole_emploi()))
            .or(first);
        Ok(preferred.cloned())
    }

    async fn insert(&self, agency: Agency) -> Result<(), RepositoryError> {
        let mut agencies = self.agencies.lock().await;
        if agencies.iter().any(|existing| existing.id == agency.id) {
            return Err(RepositoryError::AlreadyExists(agency.id));
        }
        agencies.push(agency);
        Ok(())
    }

    async fn update(&self, agency: Agency) -> Result<(), RepositoryError> {
        let mut agencies = self.agencies.lock().await;
        let slot = agencies
            .iter_mut()
            .find(|existing| existing.id == agency.id)
            .ok_or(RepositoryError::NotFound(agency.id))?;
        *slot = agency;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use immersion_core::{AgencyKind, AgencyStatus};

    fn agency(id: u128, email: &str, position: GeoPosition, kind: AgencyKind) -> Agency {
        Agency {
            id: Uuid::from_u128(id),
            name: format!("agency {id}"),
            counsellor_emails: vec![],
            validator_emails: vec![email.to_string()],
            admin_emails: vec![],
            address: String::new(),
            position,
            signature: String::new(),
            questionnaire_url: String::new(),
            agency_siret: None,
            external_code: None,
            kind,
            status: AgencyStatus::Active,
        }
    }

    #[tokio::test]
    async fn nearby_is_inclusive_sorted_and_kind_agnostic() {
        let origin = GeoPosition::new(48.532571, 7.511);
        let far = GeoPosition::new(48.9, 7.9);
        let repo = InMemoryAgencyRepository::with_agencies(vec![
            agency(1, "a@mail.com", GeoPosition::new(48.532571324, 7.51213), AgencyKind::PoleEmploi),
            agency(2, "b@mail.com", origin, AgencyKind::MissionLocale),
            agency(3, "c@mail.com", far, AgencyKind::PoleEmploi),
        ]);

        let nearby = repo.get_nearby(origin, 0.2).await.expect("nearby");
        let ids = nearby.iter().map(|a| a.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![Uuid::from_u128(2), Uuid::from_u128(1)]);

        let exact = repo.get_nearby(origin, 0.0).await.expect("nearby at zero radius");
        assert_eq!(exact.len(), 1);
    }

    #[tokio::test]
    async fn email_match_searches_both_lists() {
        let mut counsellor_only = agency(1, "v@mail.com", GeoPosition::new(0.0, 0.0), AgencyKind::PoleEmploi);
        counsellor_only.counsellor_emails = vec!["c@mail.com".to_string()];
        let repo = InMemoryAgencyRepository::with_agencies(vec![counsellor_only]);

        assert!(repo.get_agency_where_email_matches("c@mail.com").await.expect("lookup").is_some());
        assert!(repo.get_agency_where_email_matches("v@mail.com").await.expect("lookup").is_some());
        assert!(repo.get_agency_where_email_matches("V@mail.com").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn email_match_prefers_pole_emploi_over_earlier_agencies_of_other_kinds() {
        let shared = "molsheim@pole-emploi.fr";
        let repo = InMemoryAgencyRepository::with_agencies(vec![
            agency(1, shared, GeoPosition::new(45.0, 3.0), AgencyKind::MissionLocale),
            agency(2, shared, GeoPosition::new(46.0, 4.0), AgencyKind::PoleEmploi),
        ]);

        let matched = repo
            .get_agency_where_email_matches(shared)
            .await
            .expect("lookup")
            .expect("match");
        assert_eq!(matched.id, Uuid::from_u128(2));

        let other_kind_only = InMemoryAgencyRepository::with_agencies(vec![agency(
            3,
            shared,
            GeoPosition::new(45.0, 3.0),
            AgencyKind::CapEmploi,
        )]);
        let matched = other_kind_only
            .get_agency_where_email_matches(shared)
            .await
            .expect("lookup")
            .expect("match");
        assert_eq!(matched.kind, AgencyKind::CapEmploi);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids_and_update_requires_existing() {
        let repo = InMemoryAgencyRepository::new();
        let first = agency(7, "x@mail.com", GeoPosition::new(1.0, 1.0), AgencyKind::PoleEmploi);
        repo.insert(first.clone()).await.expect("first insert");
        assert!(matches!(
            repo.insert(first.clone()).await,
            Err(RepositoryError::AlreadyExists(_))
        ));

        let mut renamed = first.clone();
        renamed.name = "renamed".to_string();
        repo.update(renamed).await.expect("update");
        assert_eq!(repo.get_by_id(first.id).await.expect("stored").name, "renamed");

        let missing = agency(8, "y@mail.com", GeoPosition::new(1.0, 1.0), AgencyKind::PoleEmploi);
        assert!(matches!(repo.update(missing).await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn all_active_excludes_closed_agencies() {
        let mut closed = agency(1, "a@mail.com", GeoPosition::new(0.0, 0.0), AgencyKind::PoleEmploi);
        closed.status = AgencyStatus::Closed;
        let mut from_api = agency(2, "b@mail.com", GeoPosition::new(0.0, 0.0), AgencyKind::PoleEmploi);
        from_api.status = AgencyStatus::FromApiPe;
        let repo = InMemoryAgencyRepository::with_agencies(vec![closed, from_api]);

        let active = repo.get_all_active().await.expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, Uuid::from_u128(2));
    }
}
