//! Reconciliation engine: configuration, payload mapping, the catalogue
//! snapshot, the sync cycle, and the daemon scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ocm_clients::{
    build_http_client, HttpClientConfig, MarketClient, Marketplace, PortalClient, ProviderPortal,
    SourceClient, SourcePlatform, TokenProvider,
};
use ocm_core::{
    generated_abbreviation, provider_key, BillingType, CatalogueResource, CategoryEntry, Customer,
    MainContact, OfferParameter, OfferPayload, Offering, ParameterKind, ParameterValueType, Plan,
    Provider, ProviderLocation, ProviderPayload, PublicContact, RangeConfig, ResourcePayload,
    ScientificDomainEntry,
};

pub const CRATE_NAME: &str = "ocm-sync";

/// Classification codes attached to created resources. The source platform
/// carries no real classification data, so these are explicit configurable
/// defaults rather than hidden constants.
#[derive(Debug, Clone)]
pub struct TaxonomyDefaults {
    pub scientific_domain: String,
    pub scientific_subdomain: String,
    pub category: String,
    pub subcategory: String,
    pub target_users: Vec<String>,
    pub access_modes: Vec<String>,
    pub access_types: Vec<String>,
    pub geographical_availabilities: Vec<String>,
    pub language_availabilities: Vec<String>,
    pub tags: Vec<String>,
    pub trl: String,
    pub order_type: String,
    pub legal_status: String,
}

impl Default for TaxonomyDefaults {
    fn default() -> Self {
        Self {
            scientific_domain: "scientific_domain-generic".to_string(),
            scientific_subdomain: "scientific_subdomain-generic-generic".to_string(),
            category: "category-aggregators_and_integrators-aggregators_and_integrators"
                .to_string(),
            subcategory:
                "subcategory-aggregators_and_integrators-aggregators_and_integrators-applications"
                    .to_string(),
            target_users: vec!["target_user-researchers".to_string()],
            access_modes: vec!["access_mode-other".to_string()],
            access_types: vec![
                "access_type-remote".to_string(),
                "access_type-virtual".to_string(),
            ],
            geographical_availabilities: vec!["EO".to_string(), "WW".to_string()],
            language_availabilities: vec!["en".to_string()],
            tags: vec![
                "data-access".to_string(),
                "remote-access".to_string(),
                "collaboration".to_string(),
            ],
            trl: "trl-9".to_string(),
            order_type: "order_type-order_required".to_string(),
            legal_status: "provider_legal_status-public_legal_entity".to_string(),
        }
    }
}

impl TaxonomyDefaults {
    fn from_env() -> Self {
        let mut defaults = Self::default();
        if let Some(value) = optional("DEFAULT_SCIENTIFIC_DOMAIN") {
            defaults.scientific_domain = value;
        }
        if let Some(value) = optional("DEFAULT_SCIENTIFIC_SUBDOMAIN") {
            defaults.scientific_subdomain = value;
        }
        if let Some(value) = optional("DEFAULT_CATEGORY") {
            defaults.category = value;
        }
        if let Some(value) = optional("DEFAULT_SUBCATEGORY") {
            defaults.subcategory = value;
        }
        if let Some(value) = optional("DEFAULT_TARGET_USERS") {
            defaults.target_users = value.split(',').map(|user| user.trim().to_string()).collect();
        }
        defaults
    }
}

/// Immutable process configuration, read from the environment once at
/// startup and passed into every constructor.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_api_url: String,
    pub source_api_token: String,
    /// Optional scope: when set, only this customer's offerings are listed.
    pub target_customer_uuid: Option<Uuid>,
    pub portal_base_url: String,
    pub marketplace_base_url: String,
    pub marketplace_token: String,
    pub refresh_token_url: String,
    pub refresh_token: String,
    pub client_id: String,
    pub catalogue_id: String,
    /// Public site of the source platform; used for landing pages and the
    /// fallback logo.
    pub public_site_url: String,
    pub support_email: String,
    pub primary_oms_id: u32,
    pub sync_interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub taxonomy: TaxonomyDefaults,
}

impl SyncConfig {
    /// Read the full configuration from the environment. A missing required
    /// variable is a startup error.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            source_api_url: required("SOURCE_API_URL")?,
            source_api_token: required("SOURCE_API_TOKEN")?,
            target_customer_uuid: optional("TARGET_CUSTOMER_UUID")
                .map(|value| value.parse())
                .transpose()
                .context("parsing TARGET_CUSTOMER_UUID")?,
            portal_base_url: required("PROVIDER_PORTAL_URL")?,
            marketplace_base_url: required("MARKETPLACE_URL")?,
            marketplace_token: required("MARKETPLACE_TOKEN")?,
            refresh_token_url: required("REFRESH_TOKEN_URL")?,
            refresh_token: required("REFRESH_TOKEN")?,
            client_id: required("CLIENT_ID")?,
            catalogue_id: required("CATALOGUE_ID")?,
            public_site_url: required("PUBLIC_SITE_URL")?,
            support_email: optional("SUPPORT_EMAIL")
                .unwrap_or_else(|| "support@example.org".to_string()),
            primary_oms_id: optional("PRIMARY_OMS_ID")
                .map(|value| value.parse())
                .transpose()
                .context("parsing PRIMARY_OMS_ID")?
                .unwrap_or(2),
            sync_interval: Duration::from_secs(
                optional("SYNC_INTERVAL_SECS")
                    .map(|value| value.parse())
                    .transpose()
                    .context("parsing SYNC_INTERVAL_SECS")?
                    .unwrap_or(600),
            ),
            http_timeout: Duration::from_secs(
                optional("HTTP_TIMEOUT_SECS")
                    .map(|value| value.parse())
                    .transpose()
                    .context("parsing HTTP_TIMEOUT_SECS")?
                    .unwrap_or(20),
            ),
            user_agent: optional("USER_AGENT").unwrap_or_else(|| "ocm-sync/0.1".to_string()),
            taxonomy: TaxonomyDefaults::from_env(),
        })
    }
}

fn required(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("mandatory variable {name} is missing or empty"),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Bound normalization for offer parameters: absent bounds become 0, and
/// components measured in MB (`storage`, `ram`) are converted to GB.
pub fn normalize_limit(value: Option<i64>, component_type: &str) -> i64 {
    match value {
        None => 0,
        Some(value) if matches!(component_type, "storage" | "ram") => value / 1024,
        Some(value) => value,
    }
}

/// Pure translation of source records into destination payloads. Every
/// defaulting and fallback rule lives here.
#[derive(Debug, Clone)]
pub struct PayloadMapper {
    catalogue_id: String,
    public_site_url: String,
    support_email: String,
    primary_oms_id: u32,
    taxonomy: TaxonomyDefaults,
}

impl PayloadMapper {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            catalogue_id: config.catalogue_id.clone(),
            public_site_url: config.public_site_url.trim_end_matches('/').to_string(),
            support_email: config.support_email.clone(),
            primary_oms_id: config.primary_oms_id,
            taxonomy: config.taxonomy.clone(),
        }
    }

    fn landing_page(&self, offering_uuid: Uuid) -> String {
        format!(
            "{}/marketplace-public-offering/{offering_uuid}/",
            self.public_site_url
        )
    }

    fn fallback_logo(&self) -> String {
        format!("{}/images/login_logo.png", self.public_site_url)
    }

    /// Split a one-line postal address into (city, street). Customer records
    /// store "City Street and number"; both halves fall back to "unknown".
    fn split_address(address: &str) -> (String, String) {
        let mut parts = address.trim().splitn(2, char::is_whitespace);
        match (parts.next().filter(|city| !city.is_empty()), parts.next()) {
            (Some(city), Some(street)) => (city.to_string(), street.trim().to_string()),
            (Some(city), None) => (city.to_string(), "unknown".to_string()),
            _ => ("unknown".to_string(), "unknown".to_string()),
        }
    }

    /// Provider record for a customer. `users` must be the list fetched from
    /// the destination (empty on first creation): the portal owns provider
    /// user approval state, so it is replayed verbatim, never fabricated.
    /// Returns `None` when no abbreviation can be derived for the customer.
    pub fn provider_payload(
        &self,
        customer: &Customer,
        description: Option<&str>,
        users: Vec<JsonValue>,
        existing_id: Option<&str>,
    ) -> Option<ProviderPayload> {
        let abbreviation = customer
            .abbreviation
            .as_deref()
            .map(str::trim)
            .filter(|abbreviation| !abbreviation.is_empty())
            .map(str::to_owned)
            .or_else(|| generated_abbreviation(&customer.name))?;

        let (city, street) = Self::split_address(&customer.address);
        let country = customer
            .country
            .clone()
            .filter(|country| !country.is_empty())
            .unwrap_or_else(|| "OT".to_string());
        let description = description.map(str::to_owned).unwrap_or_else(|| {
            format!("{} provider in the partner catalogue", customer.name)
        });

        Some(ProviderPayload {
            id: existing_id.map(str::to_owned),
            abbreviation,
            name: customer.name.clone(),
            website: customer
                .homepage
                .clone()
                .filter(|homepage| !homepage.is_empty())
                .unwrap_or_else(|| self.public_site_url.clone()),
            legal_entity: true,
            legal_status: self.taxonomy.legal_status.clone(),
            description,
            logo: customer
                .image
                .clone()
                .filter(|image| !image.is_empty())
                .unwrap_or_else(|| self.fallback_logo()),
            location: ProviderLocation {
                street_name_and_number: street,
                postal_code: customer
                    .postal
                    .clone()
                    .filter(|postal| !postal.is_empty())
                    .unwrap_or_else(|| "00000".to_string()),
                city,
                country: country.clone(),
            },
            participating_countries: vec![country],
            catalogue_id: self.catalogue_id.clone(),
            users,
            main_contact: MainContact {
                first_name: "-".to_string(),
                last_name: "-".to_string(),
                email: self.support_email.clone(),
            },
            public_contacts: vec![PublicContact {
                email: customer
                    .email
                    .clone()
                    .filter(|email| !email.is_empty())
                    .unwrap_or_else(|| self.support_email.clone()),
                ..Default::default()
            }],
            affiliations: customer
                .division
                .clone()
                .filter(|division| !division.is_empty())
                .map(|division| vec![division]),
        })
    }

    /// Resource record for an offering, deterministic in the offering and
    /// provider id. Classification fields come from the configured taxonomy
    /// defaults.
    pub fn resource_payload(
        &self,
        offering: &Offering,
        provider_id: &str,
        existing_id: Option<&str>,
    ) -> ResourcePayload {
        let landing = self.landing_page(offering.uuid);
        let support_email = offering
            .support_email()
            .map(str::to_owned)
            .unwrap_or_else(|| self.support_email.clone());

        ResourcePayload {
            id: existing_id.map(str::to_owned),
            abbreviation: generated_abbreviation(&offering.name)
                .unwrap_or_else(|| offering.name.clone()),
            access_modes: self.taxonomy.access_modes.clone(),
            access_types: self.taxonomy.access_types.clone(),
            access_policy: None,
            catalogue_id: self.catalogue_id.clone(),
            categories: vec![CategoryEntry {
                category: self.taxonomy.category.clone(),
                subcategory: self.taxonomy.subcategory.clone(),
            }],
            certifications: vec![],
            change_log: vec![],
            description: if offering.description.is_empty() {
                "N/A".to_string()
            } else {
                offering.description.clone()
            },
            funding_body: vec![],
            funding_programs: vec![],
            geographical_availabilities: self.taxonomy.geographical_availabilities.clone(),
            grant_project_names: vec![],
            helpdesk_email: support_email.clone(),
            helpdesk_page: String::new(),
            language_availabilities: self.taxonomy.language_availabilities.clone(),
            last_update: None,
            life_cycle_status: None,
            logo: offering
                .thumbnail
                .clone()
                .filter(|thumbnail| !thumbnail.is_empty())
                .unwrap_or_else(|| self.fallback_logo()),
            main_contact: MainContact {
                first_name: "-".to_string(),
                last_name: "-".to_string(),
                email: self.support_email.clone(),
            },
            maintenance: None,
            multimedia: vec![],
            name: offering.name.clone(),
            open_source_technologies: vec![],
            order: landing.clone(),
            order_type: self.taxonomy.order_type.clone(),
            payment_model: None,
            pricing: None,
            privacy_policy: offering
                .privacy_policy_link
                .clone()
                .filter(|link| !link.is_empty())
                .unwrap_or_else(|| landing.clone()),
            public_contacts: vec![PublicContact {
                email: support_email.clone(),
                phone: Some(String::new()),
                ..Default::default()
            }],
            related_platforms: vec![],
            related_resources: vec![],
            required_resources: vec![],
            resource_geographic_locations: vec![],
            resource_level: None,
            resource_organisation: provider_id.to_owned(),
            resource_providers: vec![provider_id.to_owned()],
            scientific_domains: vec![ScientificDomainEntry {
                scientific_domain: self.taxonomy.scientific_domain.clone(),
                scientific_subdomain: self.taxonomy.scientific_subdomain.clone(),
            }],
            security_contact_email: support_email,
            standards: vec![],
            status_monitoring: None,
            tagline: offering.name.to_lowercase(),
            tags: self.taxonomy.tags.clone(),
            target_users: self.taxonomy.target_users.clone(),
            terms_of_use: offering
                .terms_of_service_link
                .clone()
                .filter(|link| !link.is_empty())
                .unwrap_or_else(|| landing.clone()),
            training_information: None,
            trl: self.taxonomy.trl.clone(),
            use_cases: vec![],
            user_manual: String::new(),
            version: None,
            webpage: landing,
        }
    }

    /// Ordering parameters for one offer: a fixed leading name input, then
    /// one numeric range per `limit`/`usage` component. Other billing types
    /// have no order-time numeric range to render and are omitted.
    pub fn offer_parameters(&self, offering: &Offering, plan: &Plan) -> Vec<OfferParameter> {
        let mut parameters = vec![OfferParameter {
            id: "name".to_string(),
            label: "Name".to_string(),
            description: "Name will be visible in accounting".to_string(),
            kind: ParameterKind::Input,
            value_type: ParameterValueType::String,
            unit: String::new(),
            config: None,
        }];

        for component in &offering.components {
            let (id_prefix, fallback_scope) = match component.billing_type {
                BillingType::Limit => ("limit", plan.name.as_str()),
                BillingType::Usage => ("attributes", offering.name.as_str()),
                _ => continue,
            };
            parameters.push(OfferParameter {
                id: format!("{id_prefix} {}", component.component_type),
                label: component.name.clone(),
                description: if component.description.is_empty() {
                    format!("Amount of {} in {}.", component.name, fallback_scope)
                } else {
                    component.description.clone()
                },
                kind: ParameterKind::Range,
                value_type: ParameterValueType::Integer,
                unit: component.measured_unit.clone(),
                config: Some(RangeConfig {
                    minimum: normalize_limit(component.min_value, &component.component_type),
                    maximum: normalize_limit(component.max_value, &component.component_type),
                    exclusive_minimum: false,
                    exclusive_maximum: false,
                }),
            });
        }

        parameters
    }

    pub fn offer_payload(&self, offering: &Offering, plan: &Plan) -> OfferPayload {
        OfferPayload {
            name: plan.name.clone(),
            description: if plan.description.is_empty() {
                "N/A".to_string()
            } else {
                plan.description.clone()
            },
            order_type: "order_required".to_string(),
            primary_oms_id: self.primary_oms_id,
            oms_params: serde_json::json!({}),
            order_url: self.public_site_url.clone(),
            internal: true,
            parameters: self.offer_parameters(offering, plan),
        }
    }
}

/// Name-to-id view of the destination catalogue, fetched once per cycle.
///
/// Cross-system matching is exact name equality inside this snapshot; there
/// is no persisted identifier correlation, so a source-side rename is
/// indistinguishable from "does not exist yet". The lookup is kept behind
/// this type so a real correlation key can replace it without touching the
/// reconciler's control flow.
#[derive(Debug, Clone, Default)]
pub struct CatalogueSnapshot {
    by_name: BTreeMap<String, String>,
}

impl CatalogueSnapshot {
    pub fn new(resources: Vec<CatalogueResource>) -> Self {
        let by_name = resources
            .into_iter()
            .map(|resource| (resource.name, resource.id))
            .collect();
        Self { by_name }
    }

    pub fn resolve_by_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub offerings_seen: usize,
    pub customers_synced: usize,
    pub customers_skipped: usize,
    pub customers_failed: usize,
    pub resources_created: usize,
    pub resources_updated: usize,
    pub resources_retired: usize,
    pub offers_created: usize,
    pub offers_skipped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    resources_created: usize,
    resources_updated: usize,
    resources_retired: usize,
    offers_created: usize,
    offers_skipped: usize,
}

impl Tally {
    fn absorb(&mut self, other: Tally) {
        self.resources_created += other.resources_created;
        self.resources_updated += other.resources_updated;
        self.resources_retired += other.resources_retired;
        self.offers_created += other.offers_created;
        self.offers_skipped += other.offers_skipped;
    }
}

/// Orchestrates one full sync cycle against the source platform and the two
/// destination APIs. Customer groups are processed independently: a failure
/// in one customer never prevents processing of the others.
pub struct Reconciler<S, P, M> {
    source: S,
    portal: P,
    market: M,
    mapper: PayloadMapper,
    customer_scope: Option<Uuid>,
}

impl<S, P, M> Reconciler<S, P, M>
where
    S: SourcePlatform,
    P: ProviderPortal,
    M: Marketplace,
{
    pub fn new(
        source: S,
        portal: P,
        market: M,
        mapper: PayloadMapper,
        customer_scope: Option<Uuid>,
    ) -> Self {
        Self {
            source,
            portal,
            market,
            mapper,
            customer_scope,
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let offerings = self
            .source
            .list_sync_enabled_offerings(self.customer_scope)
            .await
            .context("listing sync-enabled offerings")?;
        let offerings_seen = offerings.len();

        let mut tally = Tally::default();
        let mut customers_synced = 0usize;
        let mut customers_skipped = 0usize;
        let mut customers_failed = 0usize;

        if offerings.is_empty() {
            info!("no offerings are ready for catalogue sync");
        } else {
            let mut groups: BTreeMap<Uuid, Vec<Offering>> = BTreeMap::new();
            for offering in offerings {
                groups.entry(offering.customer_uuid).or_default().push(offering);
            }

            // One snapshot per cycle. Without it name matching is impossible
            // and every publishable offering would be re-created as a
            // duplicate, so a failed fetch aborts the cycle before any write.
            let snapshot = CatalogueSnapshot::new(
                self.portal
                    .catalogue_resources()
                    .await
                    .context("fetching catalogue snapshot")?,
            );
            info!(
                run_id = %run_id,
                customers = groups.len(),
                resources = snapshot.len(),
                "starting reconciliation"
            );

            for (customer_uuid, group) in &groups {
                match self.sync_customer(*customer_uuid, group, &snapshot).await {
                    Ok(Some(customer_tally)) => {
                        customers_synced += 1;
                        tally.absorb(customer_tally);
                    }
                    Ok(None) => customers_skipped += 1,
                    Err(err) => {
                        customers_failed += 1;
                        error!(
                            customer = %customer_uuid,
                            error = %format!("{err:#}"),
                            "customer skipped after error"
                        );
                    }
                }
            }
        }

        Ok(CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            offerings_seen,
            customers_synced,
            customers_skipped,
            customers_failed,
            resources_created: tally.resources_created,
            resources_updated: tally.resources_updated,
            resources_retired: tally.resources_retired,
            offers_created: tally.offers_created,
            offers_skipped: tally.offers_skipped,
        })
    }

    async fn sync_customer(
        &self,
        customer_uuid: Uuid,
        offerings: &[Offering],
        snapshot: &CatalogueSnapshot,
    ) -> Result<Option<Tally>> {
        let customer = self
            .source
            .customer(customer_uuid)
            .await
            .context("fetching customer record")?;

        let Some(provider) = self.sync_provider(&customer).await? else {
            return Ok(None);
        };

        info!(
            customer = %customer.name,
            provider = %provider.id,
            offerings = offerings.len(),
            "syncing offerings of provider"
        );

        let mut tally = Tally::default();
        for offering in offerings {
            info!(
                offering = %offering.name,
                state = ?offering.state,
                "syncing offering"
            );
            if offering.state.is_publishable() {
                let resource = self
                    .sync_resource(offering, &provider.id, snapshot, &mut tally)
                    .await?;
                self.sync_offers(&resource.id, offering, &mut tally).await?;
            } else {
                self.retire_offering(offering, snapshot, &mut tally).await?;
            }
        }
        Ok(Some(tally))
    }

    /// Resolve the destination provider for a customer: create it when the
    /// portal has none, otherwise update it while replaying the portal's own
    /// `users` list. Returns `None` when no provider key can be derived.
    async fn sync_provider(&self, customer: &Customer) -> Result<Option<Provider>> {
        let Some(key) = provider_key(customer) else {
            error!(
                customer = %customer.name,
                "cannot derive a provider key, skipping customer"
            );
            return Ok(None);
        };

        let description = self
            .source
            .service_provider_description(customer.uuid)
            .await
            .context("fetching service provider description")?;

        match self.portal.provider(&key).await? {
            None => {
                let payload = self
                    .mapper
                    .provider_payload(customer, description.as_deref(), vec![], None)
                    .context("building provider payload")?;
                let created = self
                    .portal
                    .create_provider(&payload)
                    .await
                    .context("creating provider")?;
                info!(provider = %created.id, "provider created");
                Ok(Some(created))
            }
            Some(existing) => {
                let payload = self
                    .mapper
                    .provider_payload(
                        customer,
                        description.as_deref(),
                        existing.users.clone(),
                        Some(&existing.id),
                    )
                    .context("building provider payload")?;
                let updated = self.portal.update_provider(&payload).await?;
                Ok(Some(updated.unwrap_or(existing)))
            }
        }
    }

    /// Update the resource when the snapshot resolves the offering's name,
    /// create it otherwise. Updates are best-effort; creation is not.
    async fn sync_resource(
        &self,
        offering: &Offering,
        provider_id: &str,
        snapshot: &CatalogueSnapshot,
        tally: &mut Tally,
    ) -> Result<CatalogueResource> {
        match snapshot.resolve_by_name(&offering.name) {
            Some(resource_id) => {
                debug!(resource = resource_id, "resource already in catalogue, updating");
                let existing = self
                    .portal
                    .resource(resource_id)
                    .await
                    .context("fetching existing resource")?;
                let payload = self
                    .mapper
                    .resource_payload(offering, provider_id, Some(resource_id));
                let updated = self.portal.update_resource(&payload).await?;
                tally.resources_updated += 1;
                Ok(updated.unwrap_or(existing))
            }
            None => {
                info!(resource = %offering.name, "resource missing from catalogue, creating");
                let payload = self.mapper.resource_payload(offering, provider_id, None);
                let created = self
                    .portal
                    .create_resource(&payload)
                    .await
                    .context("creating resource")?;
                tally.resources_created += 1;
                Ok(created)
            }
        }
    }

    /// Withdraw a retired offering: deactivate its marketplace offers, then
    /// delete the portal resource. An already-absent resource is a no-op,
    /// not an error.
    async fn retire_offering(
        &self,
        offering: &Offering,
        snapshot: &CatalogueSnapshot,
        tally: &mut Tally,
    ) -> Result<()> {
        let Some(resource_id) = snapshot.resolve_by_name(&offering.name) else {
            info!(
                offering = %offering.name,
                "retired offering has no catalogue resource, nothing to do"
            );
            return Ok(());
        };

        self.deactivate_offers(resource_id).await;
        self.portal.delete_resource(resource_id).await?;
        tally.resources_retired += 1;
        Ok(())
    }

    /// Best-effort deactivation of every offer attached to a retiring
    /// resource.
    async fn deactivate_offers(&self, resource_id: &str) {
        let offers = match self.market.offers(resource_id).await {
            Ok(offers) => offers,
            Err(err) => {
                warn!(
                    resource = resource_id,
                    error = %err,
                    "unable to list offers for deactivation"
                );
                return;
            }
        };

        for offer in offers {
            match self.market.deactivate_offer(resource_id, offer.id).await {
                Ok(()) => info!(resource = resource_id, offer = offer.id, "offer deactivated"),
                Err(err) => warn!(
                    resource = resource_id,
                    offer = offer.id,
                    error = %err,
                    "unable to deactivate offer"
                ),
            }
        }
    }

    /// Create one offer per plan that has no offer of the same name yet.
    /// Offers are never updated once created.
    async fn sync_offers(
        &self,
        resource_id: &str,
        offering: &Offering,
        tally: &mut Tally,
    ) -> Result<()> {
        let existing: BTreeSet<String> = self
            .market
            .offers(resource_id)
            .await
            .context("listing existing offers")?
            .into_iter()
            .map(|offer| offer.name)
            .collect();

        for plan in &offering.plans {
            if existing.contains(&plan.name) {
                info!(plan = %plan.name, "offer with the same name already exists, skipping");
                tally.offers_skipped += 1;
                continue;
            }

            let payload = self.mapper.offer_payload(offering, plan);
            if self.market.create_offer(resource_id, &payload).await?.is_some() {
                tally.offers_created += 1;
            }
        }
        Ok(())
    }
}

/// Build a reconciler wired to the real REST clients.
pub fn build_reconciler(
    config: &SyncConfig,
) -> Result<Reconciler<SourceClient, PortalClient, MarketClient>> {
    let http = build_http_client(&HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;

    let source = SourceClient::new(
        http.clone(),
        config.source_api_url.clone(),
        config.source_api_token.clone(),
    );
    let tokens = TokenProvider::new(
        http.clone(),
        config.refresh_token_url.clone(),
        config.refresh_token.clone(),
        config.client_id.clone(),
    );
    let portal = PortalClient::new(
        http.clone(),
        config.portal_base_url.clone(),
        config.catalogue_id.clone(),
        tokens,
    );
    let market = MarketClient::new(
        http,
        config.marketplace_base_url.clone(),
        config.marketplace_token.clone(),
    );

    Ok(Reconciler::new(
        source,
        portal,
        market,
        PayloadMapper::new(config),
        config.target_customer_uuid,
    ))
}

/// One sync cycle with configuration read from the environment.
pub async fn run_sync_once_from_env() -> Result<CycleSummary> {
    let config = SyncConfig::from_env()?;
    build_reconciler(&config)?.run_cycle().await
}

/// The daemon loop with configuration read from the environment.
pub async fn run_daemon_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let reconciler = build_reconciler(&config)?;
    info!(
        interval_secs = config.sync_interval.as_secs(),
        "starting catalogue sync daemon"
    );
    let mut scheduler = Scheduler::new(FixedDelay::new(config.sync_interval));
    scheduler.run(|| reconciler.run_cycle()).await;
    Ok(())
}

/// Paces the daemon loop between cycles. Implementations return `false` to
/// stop the loop; the production trigger sleeps a fixed delay and always
/// continues.
#[async_trait]
pub trait Trigger: Send {
    async fn next(&mut self) -> bool;
}

/// Fixed-delay pacing between cycles.
#[derive(Debug)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Trigger for FixedDelay {
    async fn next(&mut self) -> bool {
        tokio::time::sleep(self.delay).await;
        true
    }
}

/// Runs cycles until the trigger stops, with catch-log-continue containment:
/// a failed cycle is logged and retried after the next trigger, never
/// propagated. The daemon must not exit on a transient remote failure.
pub struct Scheduler<T> {
    trigger: T,
}

impl<T: Trigger> Scheduler<T> {
    pub fn new(trigger: T) -> Self {
        Self { trigger }
    }

    pub async fn run<F, Fut>(&mut self, mut cycle: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CycleSummary>>,
    {
        loop {
            match cycle().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    offerings = summary.offerings_seen,
                    customers_synced = summary.customers_synced,
                    customers_failed = summary.customers_failed,
                    resources_created = summary.resources_created,
                    resources_updated = summary.resources_updated,
                    resources_retired = summary.resources_retired,
                    offers_created = summary.offers_created,
                    "sync cycle finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "sync cycle failed"),
            }

            if !self.trigger.next().await {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use ocm_clients::ClientError;
    use ocm_core::{BillingType, Component, Offer, OfferingState};

    fn test_config() -> SyncConfig {
        SyncConfig {
            source_api_url: "https://source.example.org/api".to_string(),
            source_api_token: "source-token".to_string(),
            target_customer_uuid: None,
            portal_base_url: "https://portal.example.org/api".to_string(),
            marketplace_base_url: "https://market.example.org".to_string(),
            marketplace_token: "market-token".to_string(),
            refresh_token_url: "https://aai.example.org/token".to_string(),
            refresh_token: "refresh".to_string(),
            client_id: "ocm".to_string(),
            catalogue_id: "partner".to_string(),
            public_site_url: "https://share.example.org".to_string(),
            support_email: "support@example.org".to_string(),
            primary_oms_id: 2,
            sync_interval: Duration::from_secs(600),
            http_timeout: Duration::from_secs(20),
            user_agent: "ocm-sync/test".to_string(),
            taxonomy: TaxonomyDefaults::default(),
        }
    }

    fn mapper() -> PayloadMapper {
        PayloadMapper::new(&test_config())
    }

    fn mk_component(
        component_type: &str,
        billing_type: BillingType,
        min_value: Option<i64>,
        max_value: Option<i64>,
    ) -> Component {
        Component {
            component_type: component_type.to_string(),
            name: component_type.to_uppercase(),
            description: String::new(),
            billing_type,
            measured_unit: "units".to_string(),
            min_value,
            max_value,
        }
    }

    fn mk_offering(name: &str, customer_uuid: Uuid, state: OfferingState) -> Offering {
        Offering {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            customer_uuid,
            customer_name: "Example Research Org".to_string(),
            state,
            description: "Managed compute".to_string(),
            thumbnail: None,
            terms_of_service_link: None,
            privacy_policy_link: None,
            attributes: BTreeMap::new(),
            plans: vec![Plan {
                name: "Standard".to_string(),
                description: "Standard plan".to_string(),
            }],
            components: vec![
                mk_component("cpu", BillingType::Limit, Some(1), Some(64)),
                mk_component("storage", BillingType::Limit, Some(2048), Some(8192)),
                mk_component("gpu_hours", BillingType::Usage, None, Some(100)),
                mk_component("support", BillingType::Fixed, None, None),
            ],
        }
    }

    fn mk_customer(uuid: Uuid, name: &str) -> Customer {
        Customer {
            uuid,
            name: name.to_string(),
            abbreviation: None,
            address: "Tartu Ülikooli 18".to_string(),
            postal: Some("51005".to_string()),
            country: Some("EE".to_string()),
            homepage: Some("https://example.org".to_string()),
            image: None,
            email: Some("info@example.org".to_string()),
            phone_number: None,
            division: None,
            domain: None,
            owners: vec![],
        }
    }

    #[derive(Default)]
    struct FakeSource {
        offerings: Vec<Offering>,
        customers: Vec<Customer>,
        broken_customers: Vec<Uuid>,
    }

    #[async_trait]
    impl SourcePlatform for FakeSource {
        async fn list_sync_enabled_offerings(
            &self,
            _customer_scope: Option<Uuid>,
        ) -> Result<Vec<Offering>, ClientError> {
            Ok(self.offerings.clone())
        }

        async fn customer(&self, uuid: Uuid) -> Result<Customer, ClientError> {
            if self.broken_customers.contains(&uuid) {
                return Err(ClientError::Status {
                    status: 500,
                    url: "https://source.example.org/api/customers/".to_string(),
                    body: "malformed record".to_string(),
                });
            }
            self.customers
                .iter()
                .find(|customer| customer.uuid == uuid)
                .cloned()
                .ok_or(ClientError::Status {
                    status: 404,
                    url: "https://source.example.org/api/customers/".to_string(),
                    body: String::new(),
                })
        }

        async fn service_provider_description(
            &self,
            _customer_uuid: Uuid,
        ) -> Result<Option<String>, ClientError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakePortal {
        snapshot: Vec<CatalogueResource>,
        snapshot_fails: bool,
        updates_rejected: bool,
        providers: Mutex<BTreeMap<String, Provider>>,
        created_providers: Mutex<Vec<ProviderPayload>>,
        updated_providers: Mutex<Vec<ProviderPayload>>,
        created_resources: Mutex<Vec<ResourcePayload>>,
        updated_resources: Mutex<Vec<ResourcePayload>>,
        deleted_resources: Mutex<Vec<String>>,
    }

    impl FakePortal {
        fn with_snapshot(resources: Vec<CatalogueResource>) -> Self {
            Self {
                snapshot: resources,
                ..Self::default()
            }
        }

        fn write_count(&self) -> usize {
            self.created_providers.lock().unwrap().len()
                + self.updated_providers.lock().unwrap().len()
                + self.created_resources.lock().unwrap().len()
                + self.updated_resources.lock().unwrap().len()
                + self.deleted_resources.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProviderPortal for FakePortal {
        async fn catalogue_resources(&self) -> Result<Vec<CatalogueResource>, ClientError> {
            if self.snapshot_fails {
                return Err(ClientError::Status {
                    status: 502,
                    url: "https://portal.example.org/api/service/byCatalogue".to_string(),
                    body: "bad gateway".to_string(),
                });
            }
            Ok(self.snapshot.clone())
        }

        async fn provider(&self, key: &str) -> Result<Option<Provider>, ClientError> {
            Ok(self.providers.lock().unwrap().get(key).cloned())
        }

        async fn create_provider(
            &self,
            payload: &ProviderPayload,
        ) -> Result<Provider, ClientError> {
            let provider = Provider {
                id: payload.abbreviation.to_lowercase(),
                name: payload.name.clone(),
                users: vec![],
            };
            self.created_providers.lock().unwrap().push(payload.clone());
            self.providers
                .lock()
                .unwrap()
                .insert(provider.id.clone(), provider.clone());
            Ok(provider)
        }

        async fn update_provider(
            &self,
            payload: &ProviderPayload,
        ) -> Result<Option<Provider>, ClientError> {
            self.updated_providers.lock().unwrap().push(payload.clone());
            if self.updates_rejected {
                return Ok(None);
            }
            Ok(Some(Provider {
                id: payload.id.clone().unwrap_or_default(),
                name: payload.name.clone(),
                users: payload.users.clone(),
            }))
        }

        async fn resource(&self, id: &str) -> Result<CatalogueResource, ClientError> {
            Ok(CatalogueResource {
                id: id.to_string(),
                name: self
                    .snapshot
                    .iter()
                    .find(|resource| resource.id == id)
                    .map(|resource| resource.name.clone())
                    .unwrap_or_default(),
            })
        }

        async fn create_resource(
            &self,
            payload: &ResourcePayload,
        ) -> Result<CatalogueResource, ClientError> {
            self.created_resources.lock().unwrap().push(payload.clone());
            Ok(CatalogueResource {
                id: format!("partner.{}", payload.abbreviation.to_lowercase()),
                name: payload.name.clone(),
            })
        }

        async fn update_resource(
            &self,
            payload: &ResourcePayload,
        ) -> Result<Option<CatalogueResource>, ClientError> {
            self.updated_resources.lock().unwrap().push(payload.clone());
            if self.updates_rejected {
                return Ok(None);
            }
            Ok(Some(CatalogueResource {
                id: payload.id.clone().unwrap_or_default(),
                name: payload.name.clone(),
            }))
        }

        async fn delete_resource(
            &self,
            id: &str,
        ) -> Result<Option<CatalogueResource>, ClientError> {
            self.deleted_resources.lock().unwrap().push(id.to_string());
            Ok(Some(CatalogueResource {
                id: id.to_string(),
                name: String::new(),
            }))
        }
    }

    #[derive(Default)]
    struct FakeMarket {
        offers: Mutex<BTreeMap<String, Vec<Offer>>>,
        created: Mutex<Vec<(String, OfferPayload)>>,
        deactivated: Mutex<Vec<(String, i64)>>,
        next_id: AtomicUsize,
    }

    impl FakeMarket {
        fn with_offers(resource_id: &str, names: &[&str]) -> Self {
            let market = Self::default();
            let offers = names
                .iter()
                .enumerate()
                .map(|(index, name)| Offer {
                    id: index as i64 + 1,
                    name: name.to_string(),
                })
                .collect();
            market
                .offers
                .lock()
                .unwrap()
                .insert(resource_id.to_string(), offers);
            market
        }
    }

    #[async_trait]
    impl Marketplace for FakeMarket {
        async fn offers(&self, resource_id: &str) -> Result<Vec<Offer>, ClientError> {
            Ok(self
                .offers
                .lock()
                .unwrap()
                .get(resource_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn create_offer(
            &self,
            resource_id: &str,
            payload: &OfferPayload,
        ) -> Result<Option<Offer>, ClientError> {
            let offer = Offer {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 100,
                name: payload.name.clone(),
            };
            self.offers
                .lock()
                .unwrap()
                .entry(resource_id.to_string())
                .or_default()
                .push(offer.clone());
            self.created
                .lock()
                .unwrap()
                .push((resource_id.to_string(), payload.clone()));
            Ok(Some(offer))
        }

        async fn deactivate_offer(
            &self,
            resource_id: &str,
            offer_id: i64,
        ) -> Result<(), ClientError> {
            self.deactivated
                .lock()
                .unwrap()
                .push((resource_id.to_string(), offer_id));
            Ok(())
        }
    }

    fn mk_reconciler(
        source: FakeSource,
        portal: FakePortal,
        market: FakeMarket,
    ) -> Reconciler<FakeSource, FakePortal, FakeMarket> {
        Reconciler::new(source, portal, market, mapper(), None)
    }

    #[tokio::test]
    async fn publishable_offering_creates_provider_resource_and_offer() {
        let customer_uuid = Uuid::new_v4();
        let source = FakeSource {
            offerings: vec![mk_offering("Compute Cloud", customer_uuid, OfferingState::Active)],
            customers: vec![mk_customer(customer_uuid, "Example Research Org")],
            broken_customers: vec![],
        };
        let reconciler = mk_reconciler(source, FakePortal::default(), FakeMarket::default());

        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.customers_synced, 1);
        assert_eq!(summary.resources_created, 1);
        assert_eq!(summary.offers_created, 1);

        let created_providers = reconciler.portal.created_providers.lock().unwrap();
        assert_eq!(created_providers.len(), 1);
        assert_eq!(created_providers[0].abbreviation, "ERO");
        assert!(created_providers[0].users.is_empty());

        let created_resources = reconciler.portal.created_resources.lock().unwrap();
        assert_eq!(created_resources.len(), 1);
        assert_eq!(created_resources[0].name, "Compute Cloud");
        assert_eq!(created_resources[0].resource_organisation, "ero");
        assert_eq!(created_resources[0].catalogue_id, "partner");

        let created_offers = reconciler.market.created.lock().unwrap();
        assert_eq!(created_offers.len(), 1);
        let (_, offer) = &created_offers[0];
        assert_eq!(offer.name, "Standard");
        assert_eq!(offer.parameters[0].id, "name");
        assert_eq!(offer.parameters[0].kind, ParameterKind::Input);
    }

    #[tokio::test]
    async fn second_cycle_performs_updates_and_skips_existing_offers() {
        let customer_uuid = Uuid::new_v4();
        let resource_id = "partner.cc";
        let source = FakeSource {
            offerings: vec![mk_offering("Compute Cloud", customer_uuid, OfferingState::Active)],
            customers: vec![mk_customer(customer_uuid, "Example Research Org")],
            broken_customers: vec![],
        };
        let portal = FakePortal::with_snapshot(vec![CatalogueResource {
            id: resource_id.to_string(),
            name: "Compute Cloud".to_string(),
        }]);
        portal.providers.lock().unwrap().insert(
            "ero".to_string(),
            Provider {
                id: "ero".to_string(),
                name: "Example Research Org".to_string(),
                users: vec![serde_json::json!({"email": "owner@example.org"})],
            },
        );
        let market = FakeMarket::with_offers(resource_id, &["Standard"]);
        let reconciler = mk_reconciler(source, portal, market);

        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.resources_created, 0);
        assert_eq!(summary.resources_updated, 1);
        assert_eq!(summary.offers_created, 0);
        assert_eq!(summary.offers_skipped, 1);
        assert!(reconciler.portal.created_resources.lock().unwrap().is_empty());
        assert!(reconciler.market.created.lock().unwrap().is_empty());

        let updated = reconciler.portal.updated_resources.lock().unwrap();
        assert_eq!(updated[0].id.as_deref(), Some(resource_id));
    }

    #[tokio::test]
    async fn provider_users_are_replayed_on_update() {
        let customer_uuid = Uuid::new_v4();
        let users = vec![
            serde_json::json!({"email": "owner@example.org", "name": "Own", "surname": "Er"}),
            serde_json::json!({"email": "second@example.org"}),
        ];
        let source = FakeSource {
            offerings: vec![mk_offering("Compute Cloud", customer_uuid, OfferingState::Active)],
            customers: vec![mk_customer(customer_uuid, "Example Research Org")],
            broken_customers: vec![],
        };
        let portal = FakePortal::default();
        portal.providers.lock().unwrap().insert(
            "ero".to_string(),
            Provider {
                id: "ero".to_string(),
                name: "Example Research Org".to_string(),
                users: users.clone(),
            },
        );
        let reconciler = mk_reconciler(source, portal, FakeMarket::default());

        reconciler.run_cycle().await.expect("cycle");

        let updated = reconciler.portal.updated_providers.lock().unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].users, users);
        assert_eq!(updated[0].id.as_deref(), Some("ero"));
    }

    #[tokio::test]
    async fn rejected_updates_fall_back_to_fetched_records() {
        let customer_uuid = Uuid::new_v4();
        let resource_id = "partner.cc";
        let source = FakeSource {
            offerings: vec![mk_offering("Compute Cloud", customer_uuid, OfferingState::Active)],
            customers: vec![mk_customer(customer_uuid, "Example Research Org")],
            broken_customers: vec![],
        };
        let portal = FakePortal {
            updates_rejected: true,
            ..FakePortal::with_snapshot(vec![CatalogueResource {
                id: resource_id.to_string(),
                name: "Compute Cloud".to_string(),
            }])
        };
        portal.providers.lock().unwrap().insert(
            "ero".to_string(),
            Provider {
                id: "ero".to_string(),
                name: "Example Research Org".to_string(),
                users: vec![],
            },
        );
        let reconciler = mk_reconciler(source, portal, FakeMarket::default());

        // The portal answered "no changes" on both updates; the cycle keeps
        // the previously fetched records and still reconciles the offers.
        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.customers_synced, 1);
        assert_eq!(summary.resources_updated, 1);
        assert_eq!(summary.offers_created, 1);

        let created = reconciler.market.created.lock().unwrap();
        assert_eq!(created[0].0, resource_id);
    }

    #[tokio::test]
    async fn retired_offering_without_resource_is_a_noop() {
        let customer_uuid = Uuid::new_v4();
        let source = FakeSource {
            offerings: vec![mk_offering("Gone Service", customer_uuid, OfferingState::Archived)],
            customers: vec![mk_customer(customer_uuid, "Example Research Org")],
            broken_customers: vec![],
        };
        let reconciler = mk_reconciler(source, FakePortal::default(), FakeMarket::default());

        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.resources_retired, 0);
        assert!(reconciler.portal.created_resources.lock().unwrap().is_empty());
        assert!(reconciler.portal.deleted_resources.lock().unwrap().is_empty());
        assert!(reconciler.market.deactivated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retired_offering_with_resource_is_deleted_and_offers_deactivated() {
        let customer_uuid = Uuid::new_v4();
        let resource_id = "partner.gone";
        let source = FakeSource {
            offerings: vec![mk_offering("Gone Service", customer_uuid, OfferingState::Draft)],
            customers: vec![mk_customer(customer_uuid, "Example Research Org")],
            broken_customers: vec![],
        };
        let portal = FakePortal::with_snapshot(vec![CatalogueResource {
            id: resource_id.to_string(),
            name: "Gone Service".to_string(),
        }]);
        let market = FakeMarket::with_offers(resource_id, &["Standard", "Premium"]);
        let reconciler = mk_reconciler(source, portal, market);

        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.resources_retired, 1);
        assert_eq!(
            *reconciler.portal.deleted_resources.lock().unwrap(),
            vec![resource_id.to_string()]
        );
        let deactivated = reconciler.market.deactivated.lock().unwrap();
        assert_eq!(deactivated.len(), 2);
        assert!(deactivated.iter().all(|(resource, _)| resource == resource_id));
    }

    #[tokio::test]
    async fn snapshot_failure_aborts_cycle_before_any_write() {
        let customer_uuid = Uuid::new_v4();
        let source = FakeSource {
            offerings: vec![mk_offering("Compute Cloud", customer_uuid, OfferingState::Active)],
            customers: vec![mk_customer(customer_uuid, "Example Research Org")],
            broken_customers: vec![],
        };
        let portal = FakePortal {
            snapshot_fails: true,
            ..FakePortal::default()
        };
        let reconciler = mk_reconciler(source, portal, FakeMarket::default());

        let error = reconciler.run_cycle().await.expect_err("cycle must abort");
        assert!(format!("{error:#}").contains("catalogue snapshot"));
        assert_eq!(reconciler.portal.write_count(), 0);
        assert!(reconciler.market.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn customer_failure_does_not_block_other_customers() {
        let broken_uuid = Uuid::new_v4();
        let healthy_uuid = Uuid::new_v4();
        let source = FakeSource {
            offerings: vec![
                mk_offering("Broken Service", broken_uuid, OfferingState::Active),
                mk_offering("Healthy Service", healthy_uuid, OfferingState::Active),
            ],
            customers: vec![mk_customer(healthy_uuid, "Healthy Org")],
            broken_customers: vec![broken_uuid],
        };
        let reconciler = mk_reconciler(source, FakePortal::default(), FakeMarket::default());

        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.customers_failed, 1);
        assert_eq!(summary.customers_synced, 1);
        assert_eq!(summary.resources_created, 1);
        assert_eq!(summary.offers_created, 1);

        let created = reconciler.portal.created_resources.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "Healthy Service");
    }

    #[tokio::test]
    async fn unusable_provider_key_skips_customer() {
        let customer_uuid = Uuid::new_v4();
        let mut customer = mk_customer(customer_uuid, "--");
        customer.name = "-- --".to_string();
        let source = FakeSource {
            offerings: vec![mk_offering("Compute Cloud", customer_uuid, OfferingState::Active)],
            customers: vec![customer],
            broken_customers: vec![],
        };
        let reconciler = mk_reconciler(source, FakePortal::default(), FakeMarket::default());

        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.customers_skipped, 1);
        assert_eq!(summary.customers_failed, 0);
        assert_eq!(reconciler.portal.write_count(), 0);
    }

    #[tokio::test]
    async fn empty_listing_is_not_an_error() {
        let reconciler = mk_reconciler(
            FakeSource::default(),
            FakePortal::default(),
            FakeMarket::default(),
        );
        let summary = reconciler.run_cycle().await.expect("cycle");
        assert_eq!(summary.offerings_seen, 0);
        assert_eq!(summary.customers_synced, 0);
    }

    #[test]
    fn storage_and_ram_bounds_are_scaled_to_coarser_unit() {
        assert_eq!(normalize_limit(Some(2048), "storage"), 2);
        assert_eq!(normalize_limit(Some(8192), "storage"), 8);
        assert_eq!(normalize_limit(Some(4096), "ram"), 4);
        assert_eq!(normalize_limit(Some(64), "cpu"), 64);
        assert_eq!(normalize_limit(None, "storage"), 0);
        assert_eq!(normalize_limit(None, "cpu"), 0);
    }

    #[test]
    fn offer_parameters_follow_component_billing_types() {
        let offering = mk_offering("Compute Cloud", Uuid::new_v4(), OfferingState::Active);
        let plan = offering.plans[0].clone();
        let parameters = mapper().offer_parameters(&offering, &plan);

        // name input + cpu + storage (limit) + gpu_hours (usage); fixed omitted
        assert_eq!(parameters.len(), 4);
        assert_eq!(parameters[0].id, "name");
        assert_eq!(parameters[1].id, "limit cpu");
        assert_eq!(parameters[2].id, "limit storage");
        assert_eq!(parameters[3].id, "attributes gpu_hours");
        assert!(parameters.iter().all(|parameter| parameter.id != "support"));

        let storage = parameters[2].config.expect("range config");
        assert_eq!(storage.minimum, 2);
        assert_eq!(storage.maximum, 8);

        let usage = parameters[3].config.expect("range config");
        assert_eq!(usage.minimum, 0);
        assert_eq!(usage.maximum, 100);
    }

    #[test]
    fn resource_payload_is_deterministic_and_applies_fallbacks() {
        let mut offering = mk_offering("Compute Cloud", Uuid::new_v4(), OfferingState::Active);
        offering.terms_of_service_link = Some("https://example.org/terms".to_string());

        let first = mapper().resource_payload(&offering, "ero", None);
        let second = mapper().resource_payload(&offering, "ero", None);
        assert_eq!(first, second);

        assert_eq!(first.name, "Compute Cloud");
        assert_eq!(first.tagline, "compute cloud");
        assert_eq!(first.terms_of_use, "https://example.org/terms");
        assert_eq!(
            first.logo,
            "https://share.example.org/images/login_logo.png"
        );
        assert_eq!(
            first.webpage,
            format!(
                "https://share.example.org/marketplace-public-offering/{}/",
                offering.uuid
            )
        );
        // no privacy link on the offering: fall back to the landing page
        assert_eq!(first.privacy_policy, first.webpage);
        assert_eq!(first.scientific_domains[0].scientific_domain, "scientific_domain-generic");
        assert_eq!(first.helpdesk_email, "support@example.org");
    }

    #[test]
    fn provider_payload_splits_address_and_defaults_location() {
        let customer = mk_customer(Uuid::new_v4(), "Example Research Org");
        let payload = mapper()
            .provider_payload(&customer, Some("Compute provider"), vec![], None)
            .expect("payload");
        assert_eq!(payload.location.city, "Tartu");
        assert_eq!(payload.location.street_name_and_number, "Ülikooli 18");
        assert_eq!(payload.location.postal_code, "51005");
        assert_eq!(payload.description, "Compute provider");

        let mut bare = mk_customer(Uuid::new_v4(), "Bare Org");
        bare.address = String::new();
        bare.postal = None;
        bare.country = None;
        bare.email = None;
        let payload = mapper()
            .provider_payload(&bare, None, vec![], None)
            .expect("payload");
        assert_eq!(payload.location.city, "unknown");
        assert_eq!(payload.location.street_name_and_number, "unknown");
        assert_eq!(payload.location.postal_code, "00000");
        assert_eq!(payload.location.country, "OT");
        assert_eq!(payload.public_contacts[0].email, "support@example.org");
        assert_eq!(payload.description, "Bare Org provider in the partner catalogue");
    }

    struct CountedTrigger {
        remaining: usize,
    }

    #[async_trait]
    impl Trigger for CountedTrigger {
        async fn next(&mut self) -> bool {
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            true
        }
    }

    fn mk_summary() -> CycleSummary {
        CycleSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            offerings_seen: 0,
            customers_synced: 0,
            customers_skipped: 0,
            customers_failed: 0,
            resources_created: 0,
            resources_updated: 0,
            resources_retired: 0,
            offers_created: 0,
            offers_skipped: 0,
        }
    }

    #[tokio::test]
    async fn scheduler_continues_after_failed_cycles() {
        let calls = AtomicUsize::new(0);
        let mut scheduler = Scheduler::new(CountedTrigger { remaining: 2 });

        scheduler
            .run(|| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        anyhow::bail!("remote end fell over");
                    }
                    Ok(mk_summary())
                }
            })
            .await;

        // initial cycle + one per trigger firing
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_required_variable_fails_startup() {
        env::remove_var("OCM_TEST_REQUIRED_VAR");
        assert!(required("OCM_TEST_REQUIRED_VAR").is_err());
        env::set_var("OCM_TEST_REQUIRED_VAR", "  ");
        assert!(required("OCM_TEST_REQUIRED_VAR").is_err());
        env::set_var("OCM_TEST_REQUIRED_VAR", "value");
        assert_eq!(required("OCM_TEST_REQUIRED_VAR").unwrap(), "value");
        env::remove_var("OCM_TEST_REQUIRED_VAR");
    }

    #[test]
    fn snapshot_resolves_by_exact_name_only() {
        let snapshot = CatalogueSnapshot::new(vec![
            CatalogueResource {
                id: "partner.cc".to_string(),
                name: "Compute Cloud".to_string(),
            },
            CatalogueResource {
                id: "partner.store".to_string(),
                name: "Object Store".to_string(),
            },
        ]);
        assert_eq!(snapshot.resolve_by_name("Compute Cloud"), Some("partner.cc"));
        assert_eq!(snapshot.resolve_by_name("compute cloud"), None);
        assert_eq!(snapshot.resolve_by_name("Renamed Cloud"), None);
        assert_eq!(snapshot.len(), 2);
    }
}
