//! Core domain model for OCM: source-platform records and destination
//! catalogue records/payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ocm-core";

/// Custom attribute operators use to attach a support contact to an offering.
pub const SUPPORT_EMAIL_ATTRIBUTE: &str = "vpc_Support_email";

/// Lifecycle state of a source offering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferingState {
    Active,
    Paused,
    Archived,
    Draft,
}

impl OfferingState {
    /// Active and Paused offerings are mirrored into the destination catalogue.
    pub fn is_publishable(self) -> bool {
        matches!(self, OfferingState::Active | OfferingState::Paused)
    }

    /// Archived and Draft offerings are withdrawn from the destination catalogue.
    pub fn is_retired(self) -> bool {
        matches!(self, OfferingState::Archived | OfferingState::Draft)
    }
}

/// Billing dimension of an offering component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingType {
    Limit,
    Usage,
    Fixed,
    #[serde(other)]
    Other,
}

/// A named pricing tier within an offering. Maps 1:1 to a destination offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A billable dimension of an offering (e.g. CPU, storage). Maps to one
/// offer parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub billing_type: BillingType,
    #[serde(default)]
    pub measured_unit: String,
    #[serde(default)]
    pub min_value: Option<i64>,
    #[serde(default)]
    pub max_value: Option<i64>,
}

/// A sellable service defined on the source platform. Read-only to OCM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    pub uuid: Uuid,
    pub name: String,
    pub customer_uuid: Uuid,
    #[serde(default)]
    pub customer_name: String,
    pub state: OfferingState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub terms_of_service_link: Option<String>,
    #[serde(default)]
    pub privacy_policy_link: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Offering {
    pub fn support_email(&self) -> Option<&str> {
        self.attributes
            .get(SUPPORT_EMAIL_ATTRIBUTE)
            .and_then(JsonValue::as_str)
            .filter(|email| !email.is_empty())
    }
}

/// Owner contact of a source customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerOwner {
    pub full_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Source-platform organization record. Seeds a destination provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub postal: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub division: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub owners: Vec<CustomerOwner>,
}

/// Derive the destination provider identifier for a customer.
///
/// The destination has no foreign key back to the source customer; the
/// lower-cased abbreviation is the de facto natural key. Returns `None`
/// when no usable key can be derived (the caller skips the customer).
pub fn provider_key(customer: &Customer) -> Option<String> {
    customer
        .abbreviation
        .as_deref()
        .map(str::trim)
        .filter(|abbreviation| !abbreviation.is_empty())
        .map(str::to_owned)
        .or_else(|| generated_abbreviation(&customer.name))
        .map(|abbreviation| abbreviation.to_lowercase())
}

/// Generate an abbreviation from an organization name: the first letter of
/// every whitespace-delimited word, upper-cased. Single-word names are
/// upper-cased whole.
pub fn generated_abbreviation(name: &str) -> Option<String> {
    let words: Vec<&str> = name.split_whitespace().collect();
    match words.as_slice() {
        [] => None,
        [word] => Some(word.to_uppercase()),
        words => {
            let initials: String = words
                .iter()
                .filter_map(|word| word.chars().next())
                .filter(|first| first.is_alphanumeric())
                .flat_map(char::to_uppercase)
                .collect();
            (!initials.is_empty()).then_some(initials)
        }
    }
}

/// Provider record as returned by the destination provider portal.
///
/// Only the fields the reconciler relies on are modelled. `users` is the
/// destination-owned approval state: it is replayed verbatim on update and
/// never fabricated locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub users: Vec<JsonValue>,
}

/// Destination resource as listed in the catalogue snapshot and echoed back
/// by the provider portal on create/read/delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueResource {
    pub id: String,
    pub name: String,
}

/// Destination marketplace offer. The name doubles as the matching key
/// against source plan names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub name: String,
}

/// Named main contact block shared by provider and resource payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainContact {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

/// Public contact block of a resource or provider payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicContact {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organisation: Option<String>,
    pub phone: Option<String>,
    pub position: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLocation {
    pub street_name_and_number: String,
    pub postal_code: String,
    pub city: String,
    pub country: String,
}

/// Full provider record sent to the provider portal on create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub abbreviation: String,
    pub name: String,
    pub website: String,
    pub legal_entity: bool,
    pub legal_status: String,
    pub description: String,
    pub logo: String,
    pub location: ProviderLocation,
    pub participating_countries: Vec<String>,
    pub catalogue_id: String,
    pub users: Vec<JsonValue>,
    pub main_contact: MainContact,
    pub public_contacts: Vec<PublicContact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliations: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub category: String,
    pub subcategory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScientificDomainEntry {
    pub scientific_domain: String,
    pub scientific_subdomain: String,
}

/// Full resource record sent to the provider portal on create/update.
///
/// The portal rejects partial documents, so every field it knows about is
/// present even when permanently empty for mirrored resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub abbreviation: String,
    pub access_modes: Vec<String>,
    pub access_types: Vec<String>,
    pub access_policy: Option<String>,
    pub catalogue_id: String,
    pub categories: Vec<CategoryEntry>,
    pub certifications: Vec<String>,
    pub change_log: Vec<String>,
    pub description: String,
    pub funding_body: Vec<String>,
    pub funding_programs: Vec<String>,
    pub geographical_availabilities: Vec<String>,
    pub grant_project_names: Vec<String>,
    pub helpdesk_email: String,
    pub helpdesk_page: String,
    pub language_availabilities: Vec<String>,
    pub last_update: Option<String>,
    pub life_cycle_status: Option<String>,
    pub logo: String,
    pub main_contact: MainContact,
    pub maintenance: Option<String>,
    pub multimedia: Vec<String>,
    pub name: String,
    pub open_source_technologies: Vec<String>,
    pub order: String,
    pub order_type: String,
    pub payment_model: Option<String>,
    pub pricing: Option<String>,
    pub privacy_policy: String,
    pub public_contacts: Vec<PublicContact>,
    pub related_platforms: Vec<String>,
    pub related_resources: Vec<String>,
    pub required_resources: Vec<String>,
    pub resource_geographic_locations: Vec<String>,
    pub resource_level: Option<String>,
    pub resource_organisation: String,
    pub resource_providers: Vec<String>,
    pub scientific_domains: Vec<ScientificDomainEntry>,
    pub security_contact_email: String,
    pub standards: Vec<String>,
    pub status_monitoring: Option<String>,
    pub tagline: String,
    pub tags: Vec<String>,
    pub target_users: Vec<String>,
    pub terms_of_use: String,
    pub training_information: Option<String>,
    pub trl: String,
    pub use_cases: Vec<String>,
    pub user_manual: String,
    pub version: Option<String>,
    pub webpage: String,
}

/// Ordering widget rendered by the marketplace for one offer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    Input,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterValueType {
    String,
    Integer,
}

/// Numeric bounds of a range parameter. The marketplace uses JSON-schema
/// style camelCase keys inside `config` while the rest of the offer payload
/// is snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeConfig {
    pub minimum: i64,
    pub maximum: i64,
    pub exclusive_minimum: bool,
    pub exclusive_maximum: bool,
}

/// One ordering parameter of a marketplace offer, derived from an offering
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferParameter {
    pub id: String,
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    pub value_type: ParameterValueType,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RangeConfig>,
}

/// Marketplace offer record sent on creation. One per source plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub name: String,
    pub description: String,
    pub order_type: String,
    pub primary_oms_id: u32,
    pub oms_params: JsonValue,
    pub order_url: String,
    pub internal: bool,
    pub parameters: Vec<OfferParameter>,
}
