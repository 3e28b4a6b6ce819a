//! Provider variant registry.
//!
//! Every provider maps to a static descriptor listing the fields an applicant may
//! edit, the provider-specific keys accepted in `additional_content`, the documents
//! required on submission, and the validation rules run before `send_application`.
//! Adding a provider means adding a descriptor; the state machine is untouched.

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

use super::domain::{DocumentType, Enrollment, Field, Provider};
use super::state_machine::{Edge, DEFAULT_EDGES};

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Collected submission failures, one per offending field check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|error| error.field.as_str())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields().any(|candidate| candidate == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|error| format!("{}: {}", error.field, error.message))
            .collect();
        f.write_str(&rendered.join("; "))
    }
}

/// Pure predicate over an enrollment, pushing one error per failed check.
pub type ValidationRule = fn(&Enrollment, &mut Vec<FieldError>);

/// Identifier rejected by the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data provider '{0}'")]
pub struct UnknownProvider(pub String);

/// Static profile of a provider.
pub struct VariantDescriptor {
    pub provider: Provider,
    pub label: &'static str,
    pub edges: &'static [Edge],
    pub applicant_fields: &'static [Field],
    pub additional_keys: &'static [&'static str],
    pub required_documents: &'static [DocumentType],
    pub rules: &'static [ValidationRule],
}

impl fmt::Debug for VariantDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariantDescriptor")
            .field("provider", &self.provider)
            .field("label", &self.label)
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl VariantDescriptor {
    /// Run every submission check, collecting all failures.
    pub fn validate_submission(&self, enrollment: &Enrollment) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        for rule in self.rules {
            rule(enrollment, &mut errors);
        }

        for document_type in self.required_documents {
            if !enrollment.has_document(*document_type) {
                errors.push(FieldError::new(
                    "documents",
                    format!(
                        "a '{}' document must be attached before submitting",
                        document_type.label()
                    ),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

/// Resolve a provider identifier. Identifiers outside the allow-list never fall back
/// to a default variant.
pub fn variant_for(provider_id: &str) -> Result<&'static VariantDescriptor, UnknownProvider> {
    Provider::parse(provider_id)
        .map(variant)
        .ok_or_else(|| UnknownProvider(provider_id.to_string()))
}

pub fn variant(provider: Provider) -> &'static VariantDescriptor {
    match provider {
        Provider::ApiParticulier => &API_PARTICULIER,
        Provider::ApiEntreprise => &API_ENTREPRISE,
        Provider::Franceconnect => &FRANCECONNECT,
        Provider::ApiDroitsCnam => &API_DROITS_CNAM,
        Provider::Dgfip => &DGFIP,
        Provider::AidantsConnect => &AIDANTS_CONNECT,
    }
}

const BASE_FIELDS: &[Field] = &[
    Field::Title,
    Field::Description,
    Field::LegalBasisTitle,
    Field::LegalBasisUrl,
    Field::Siret,
    Field::LegalName,
    Field::Scopes,
    Field::DataRecipients,
    Field::DataRetentionPeriod,
    Field::DataRetentionComment,
    Field::CguApproved,
    Field::AdditionalContent,
    Field::Contacts,
    Field::Documents,
];

const BASE_RULES: &[ValidationRule] = &[
    require_title,
    require_description,
    require_organization,
    require_legal_basis,
    require_cgu,
    require_retention_period,
    require_technical_contact,
];

static API_PARTICULIER: VariantDescriptor = VariantDescriptor {
    provider: Provider::ApiParticulier,
    label: "API Particulier",
    edges: DEFAULT_EDGES,
    applicant_fields: BASE_FIELDS,
    additional_keys: &[],
    required_documents: &[],
    rules: BASE_RULES,
};

static API_ENTREPRISE: VariantDescriptor = VariantDescriptor {
    provider: Provider::ApiEntreprise,
    label: "API Entreprise",
    edges: DEFAULT_EDGES,
    applicant_fields: BASE_FIELDS,
    additional_keys: &[],
    required_documents: &[],
    rules: BASE_RULES,
};

static FRANCECONNECT: VariantDescriptor = VariantDescriptor {
    provider: Provider::Franceconnect,
    label: "FranceConnect",
    edges: DEFAULT_EDGES,
    applicant_fields: BASE_FIELDS,
    additional_keys: &["has_alternative_authentication_methods"],
    required_documents: &[],
    rules: BASE_RULES,
};

static API_DROITS_CNAM: VariantDescriptor = VariantDescriptor {
    provider: Provider::ApiDroitsCnam,
    label: "API Droits CNAM",
    edges: DEFAULT_EDGES,
    applicant_fields: BASE_FIELDS,
    additional_keys: &[],
    required_documents: &[],
    rules: BASE_RULES,
};

static DGFIP: VariantDescriptor = VariantDescriptor {
    provider: Provider::Dgfip,
    label: "API Impôt particulier",
    edges: DEFAULT_EDGES,
    applicant_fields: BASE_FIELDS,
    additional_keys: &[
        "production_ips",
        "recette_fonctionnelle",
        "autorite_homologation_nom",
        "autorite_homologation_fonction",
        "date_homologation",
        "date_fin_homologation",
        "nombre_demandes_annuelle",
        "pic_demandes_par_seconde",
        "nombre_demandes_mensuelles",
    ],
    required_documents: &[],
    rules: &[
        require_title,
        require_description,
        require_organization,
        require_legal_basis,
        require_cgu,
        require_retention_period,
        require_technical_contact,
        require_production_ips,
        require_functional_acceptance,
        require_homologation,
    ],
};

static AIDANTS_CONNECT: VariantDescriptor = VariantDescriptor {
    provider: Provider::AidantsConnect,
    label: "Aidants Connect",
    edges: DEFAULT_EDGES,
    applicant_fields: BASE_FIELDS,
    additional_keys: &[
        "organization_type",
        "organization_address",
        "organization_postal_code",
        "participation_reseau",
        "utilisation_identifiants_usagers",
        "adresse_mail_professionnelle",
        "has_professional_contact_only",
    ],
    required_documents: &[DocumentType::ListeAidants],
    rules: &[
        require_legal_representative,
        require_description,
        require_organization,
        require_structure_details,
        require_aidants_answers,
        require_cgu,
        require_professional_contacts_only,
    ],
};

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |text| text.trim().is_empty())
}

fn additional_present(enrollment: &Enrollment, key: &str) -> bool {
    match enrollment.additional(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Bool(flag)) => *flag,
        Some(_) => true,
    }
}

fn additional_date(enrollment: &Enrollment, key: &str) -> Option<NaiveDate> {
    enrollment
        .additional(key)
        .and_then(Value::as_str)
        .and_then(|raw| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok())
}

fn require_title(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if is_blank(enrollment.content.title.as_deref()) {
        errors.push(FieldError::new("title", "the title of the service must be filled in"));
    }
}

fn require_description(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if is_blank(enrollment.content.description.as_deref()) {
        errors.push(FieldError::new(
            "description",
            "the description of the service must be filled in",
        ));
    }
}

fn require_organization(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if is_blank(enrollment.siret.as_deref()) || is_blank(enrollment.legal_name.as_deref()) {
        errors.push(FieldError::new(
            "siret",
            "a valid organization SIRET must be provided",
        ));
    }
}

fn require_legal_basis(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if is_blank(enrollment.content.legal_basis_title.as_deref()) {
        errors.push(FieldError::new(
            "legal_basis_title",
            "the legal basis of the processing must be filled in",
        ));
    }
}

fn require_cgu(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if !enrollment.content.cgu_approved {
        errors.push(FieldError::new(
            "cgu_approved",
            "the terms of use must be accepted",
        ));
    }
}

fn require_retention_period(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if enrollment.content.data_retention_period.is_none() {
        errors.push(FieldError::new(
            "data_retention_period",
            "the data retention period must be filled in",
        ));
    }
}

fn require_contact(
    enrollment: &Enrollment,
    heading: &str,
    label: &str,
    errors: &mut Vec<FieldError>,
) {
    let has_email = enrollment
        .contact_with_heading(heading)
        .is_some_and(|contact| !is_blank(contact.email.as_deref()));
    if !has_email {
        errors.push(FieldError::new(
            "contacts",
            format!("the email of the {label} must be filled in"),
        ));
    }
}

fn require_technical_contact(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    require_contact(enrollment, "technique", "technical contact", errors);
}

fn require_production_ips(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if !additional_present(enrollment, "production_ips") {
        errors.push(FieldError::new(
            "production_ips",
            "the production IP addresses must be filled in",
        ));
    }
}

fn require_functional_acceptance(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if enrollment.additional("recette_fonctionnelle") != Some(&Value::Bool(true)) {
        errors.push(FieldError::new(
            "recette_fonctionnelle",
            "a functional acceptance test must be attested",
        ));
    }
}

fn require_homologation(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    for (key, label) in [
        ("autorite_homologation_nom", "homologation authority name"),
        ("autorite_homologation_fonction", "homologation authority function"),
    ] {
        if !additional_present(enrollment, key) {
            errors.push(FieldError::new(key, format!("the {label} must be filled in")));
        }
    }

    let start = additional_date(enrollment, "date_homologation");
    let end = additional_date(enrollment, "date_fin_homologation");
    match (start, end) {
        (Some(start), Some(end)) if end <= start => errors.push(FieldError::new(
            "date_fin_homologation",
            "the homologation end date must follow its start date",
        )),
        (Some(_), Some(_)) => {}
        (start, end) => {
            if start.is_none() {
                errors.push(FieldError::new(
                    "date_homologation",
                    "the homologation date must be a YYYY-MM-DD date",
                ));
            }
            if end.is_none() {
                errors.push(FieldError::new(
                    "date_fin_homologation",
                    "the homologation end date must be a YYYY-MM-DD date",
                ));
            }
        }
    }
}

fn require_legal_representative(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    require_contact(enrollment, "metier", "legal representative", errors);
}

fn require_structure_details(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    for (key, label) in [
        ("organization_type", "structure type"),
        ("organization_address", "structure address"),
        ("organization_postal_code", "structure postal code"),
    ] {
        if !additional_present(enrollment, key) {
            errors.push(FieldError::new(key, format!("the {label} must be filled in")));
        }
    }
}

fn require_aidants_answers(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    for (key, question) in [
        (
            "participation_reseau",
            "whether the structure takes part in a regional or local network",
        ),
        (
            "utilisation_identifiants_usagers",
            "whether aidants carry out procedures on behalf of users",
        ),
        (
            "adresse_mail_professionnelle",
            "whether every aidant has an individual professional email",
        ),
    ] {
        if !matches!(enrollment.additional(key), Some(Value::Bool(_))) {
            errors.push(FieldError::new(key, format!("please state {question}")));
        }
    }
}

fn require_professional_contacts_only(enrollment: &Enrollment, errors: &mut Vec<FieldError>) {
    if !additional_present(enrollment, "has_professional_contact_only") {
        errors.push(FieldError::new(
            "has_professional_contact_only",
            "the list of aidants must only contain professional aidants",
        ));
    }
}
