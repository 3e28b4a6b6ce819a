use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{EventLog, EventName, FieldDiff};

/// Identifier wrapper for enrollment requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnrollmentId(pub u64);

impl fmt::Display for EnrollmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub u64);

/// Data provider whose API access is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    ApiParticulier,
    ApiEntreprise,
    Franceconnect,
    ApiDroitsCnam,
    Dgfip,
    AidantsConnect,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::ApiParticulier,
        Provider::ApiEntreprise,
        Provider::Franceconnect,
        Provider::ApiDroitsCnam,
        Provider::Dgfip,
        Provider::AidantsConnect,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Provider::ApiParticulier => "api_particulier",
            Provider::ApiEntreprise => "api_entreprise",
            Provider::Franceconnect => "franceconnect",
            Provider::ApiDroitsCnam => "api_droits_cnam",
            Provider::Dgfip => "dgfip",
            Provider::AidantsConnect => "aidants_connect",
        }
    }

    /// Parses a provider identifier against the closed allow-list.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str() == normalized)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow states an enrollment moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// Being written by the applicant, never submitted.
    Draft,
    /// Returned to the applicant for changes.
    Pending,
    /// Submitted and held by the provider's reviewers.
    UnderReview,
    Validated,
    Refused,
    Archived,
}

impl EnrollmentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            EnrollmentStatus::Draft => "draft",
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::UnderReview => "under_review",
            EnrollmentStatus::Validated => "validated",
            EnrollmentStatus::Refused => "refused",
            EnrollmentStatus::Archived => "archived",
        }
    }
}

/// Reference to a user, carrying the address notifications are sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub email: String,
}

/// Role-tagged person attached to the request (technical contact, legal representative...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub heading: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// RGPD contact block: the data controller or the data protection officer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgpdContact {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl RgpdContact {
    pub fn email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    LegalBasis,
    ListeAidants,
    ExpressionBesoinSpecifique,
    Other,
}

impl DocumentType {
    pub const fn label(self) -> &'static str {
        match self {
            DocumentType::LegalBasis => "legal_basis",
            DocumentType::ListeAidants => "liste_aidants",
            DocumentType::ExpressionBesoinSpecifique => "expression_besoin_specifique",
            DocumentType::Other => "other",
        }
    }
}

/// Attachment metadata; the file itself lives in external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "type")]
    pub document_type: DocumentType,
    pub filename: String,
    pub storage_key: String,
}

/// Applicant-authored description of the data processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentContent {
    pub title: Option<String>,
    pub description: Option<String>,
    pub legal_basis_title: Option<String>,
    pub legal_basis_url: Option<String>,
    pub scopes: BTreeMap<String, bool>,
    pub data_recipients: Option<String>,
    pub data_retention_period: Option<u32>,
    pub data_retention_comment: Option<String>,
    pub cgu_approved: bool,
    /// Provider-specific answers keyed by the variant's accepted keys.
    pub additional_content: BTreeMap<String, Value>,
}

/// Fields a caller can be allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Description,
    LegalBasisTitle,
    LegalBasisUrl,
    Siret,
    LegalName,
    Scopes,
    DataRecipients,
    DataRetentionPeriod,
    DataRetentionComment,
    CguApproved,
    AdditionalContent,
    Contacts,
    Documents,
    ResponsableTraitement,
    Dpo,
    Owner,
}

impl Field {
    pub const fn name(self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Description => "description",
            Field::LegalBasisTitle => "legal_basis_title",
            Field::LegalBasisUrl => "legal_basis_url",
            Field::Siret => "siret",
            Field::LegalName => "legal_name",
            Field::Scopes => "scopes",
            Field::DataRecipients => "data_recipients",
            Field::DataRetentionPeriod => "data_retention_period",
            Field::DataRetentionComment => "data_retention_comment",
            Field::CguApproved => "cgu_approved",
            Field::AdditionalContent => "additional_content",
            Field::Contacts => "contacts",
            Field::Documents => "documents",
            Field::ResponsableTraitement => "responsable_traitement",
            Field::Dpo => "dpo",
            Field::Owner => "owner",
        }
    }
}

/// The enrollment record. `status`, `events` and `revision` are only moved by the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub provider: Provider,
    status: EnrollmentStatus,
    pub owner: UserRef,
    pub organization_id: OrganizationId,
    pub siret: Option<String>,
    pub legal_name: Option<String>,
    pub previous_enrollment_id: Option<EnrollmentId>,
    pub copied_from_enrollment_id: Option<EnrollmentId>,
    pub content: EnrollmentContent,
    pub responsable_traitement: RgpdContact,
    pub dpo: RgpdContact,
    pub contacts: Vec<Contact>,
    pub documents: Vec<Document>,
    events: EventLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    revision: u64,
}

impl Enrollment {
    /// Fresh record in the initial state, owned by `owner`.
    pub fn draft(
        id: EnrollmentId,
        provider: Provider,
        owner: UserRef,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            provider,
            status: EnrollmentStatus::Draft,
            owner,
            organization_id,
            siret: None,
            legal_name: None,
            previous_enrollment_id: None,
            copied_from_enrollment_id: None,
            content: EnrollmentContent::default(),
            responsable_traitement: RgpdContact::default(),
            dpo: RgpdContact::default(),
            contacts: Vec::new(),
            documents: Vec::new(),
            events: EventLog::default(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Copy of this enrollment's content for a new owner, reset to draft.
    /// Documents and history stay with the source.
    pub fn duplicate(&self, id: EnrollmentId, owner: UserRef, now: DateTime<Utc>) -> Self {
        Self {
            copied_from_enrollment_id: Some(self.id),
            siret: self.siret.clone(),
            legal_name: self.legal_name.clone(),
            content: self.content.clone(),
            responsable_traitement: self.responsable_traitement.clone(),
            dpo: self.dpo.clone(),
            contacts: self.contacts.clone(),
            ..Self::draft(id, self.provider, owner, self.organization_id, now)
        }
    }

    pub fn status(&self) -> EnrollmentStatus {
        self.status
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Called by storage once a write has been accepted.
    pub(crate) fn bump_revision(&mut self) {
        self.revision += 1;
    }

    pub(crate) fn advance_to(&mut self, status: EnrollmentStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub(crate) fn record_event(
        &mut self,
        name: EventName,
        actor: Option<UserId>,
        comment: Option<String>,
        diff: Option<FieldDiff>,
        now: DateTime<Utc>,
    ) -> super::events::EnrollmentEvent {
        self.events.record(name, actor, comment, diff, now)
    }

    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner.id == user
    }

    /// Whether `email` appears among the contacts, including the RGPD blocks.
    pub fn has_contact_email(&self, email: &str) -> bool {
        let matches = |candidate: Option<&str>| {
            candidate.is_some_and(|value| value.trim().eq_ignore_ascii_case(email.trim()))
        };

        self.contacts
            .iter()
            .any(|contact| matches(contact.email.as_deref()))
            || matches(self.responsable_traitement.email())
            || matches(self.dpo.email())
    }

    pub fn contact_with_heading(&self, heading: &str) -> Option<&Contact> {
        self.contacts
            .iter()
            .find(|contact| contact.heading.eq_ignore_ascii_case(heading))
    }

    pub fn has_document(&self, document_type: DocumentType) -> bool {
        self.documents
            .iter()
            .any(|document| document.document_type == document_type)
    }

    pub fn additional(&self, key: &str) -> Option<&Value> {
        self.content.additional_content.get(key)
    }

    /// JSON rendering of a single field, used for audit diffs.
    pub fn field_value(&self, field: Field) -> Value {
        let rendered = match field {
            Field::Title => serde_json::to_value(&self.content.title),
            Field::Description => serde_json::to_value(&self.content.description),
            Field::LegalBasisTitle => serde_json::to_value(&self.content.legal_basis_title),
            Field::LegalBasisUrl => serde_json::to_value(&self.content.legal_basis_url),
            Field::Siret => serde_json::to_value(&self.siret),
            Field::LegalName => serde_json::to_value(&self.legal_name),
            Field::Scopes => serde_json::to_value(&self.content.scopes),
            Field::DataRecipients => serde_json::to_value(&self.content.data_recipients),
            Field::DataRetentionPeriod => serde_json::to_value(self.content.data_retention_period),
            Field::DataRetentionComment => {
                serde_json::to_value(&self.content.data_retention_comment)
            }
            Field::CguApproved => serde_json::to_value(self.content.cgu_approved),
            Field::AdditionalContent => serde_json::to_value(&self.content.additional_content),
            Field::Contacts => serde_json::to_value(&self.contacts),
            Field::Documents => serde_json::to_value(&self.documents),
            Field::ResponsableTraitement => serde_json::to_value(&self.responsable_traitement),
            Field::Dpo => serde_json::to_value(&self.dpo),
            Field::Owner => serde_json::to_value(&self.owner),
        };
        rendered.unwrap_or(Value::Null)
    }
}

/// Partial update sent by a caller. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub legal_basis_title: Option<String>,
    pub legal_basis_url: Option<String>,
    pub siret: Option<String>,
    pub legal_name: Option<String>,
    pub scopes: Option<BTreeMap<String, bool>>,
    pub data_recipients: Option<String>,
    pub data_retention_period: Option<u32>,
    pub data_retention_comment: Option<String>,
    pub cgu_approved: Option<bool>,
    pub additional_content: Option<BTreeMap<String, Value>>,
    pub contacts: Option<Vec<Contact>>,
    pub documents: Option<Vec<Document>>,
    pub responsable_traitement: Option<RgpdContact>,
    pub dpo: Option<RgpdContact>,
}

impl EnrollmentPatch {
    /// Fields carried by this patch.
    pub fn fields(&self) -> BTreeSet<Field> {
        let present = [
            (Field::Title, self.title.is_some()),
            (Field::Description, self.description.is_some()),
            (Field::LegalBasisTitle, self.legal_basis_title.is_some()),
            (Field::LegalBasisUrl, self.legal_basis_url.is_some()),
            (Field::Siret, self.siret.is_some()),
            (Field::LegalName, self.legal_name.is_some()),
            (Field::Scopes, self.scopes.is_some()),
            (Field::DataRecipients, self.data_recipients.is_some()),
            (Field::DataRetentionPeriod, self.data_retention_period.is_some()),
            (Field::DataRetentionComment, self.data_retention_comment.is_some()),
            (Field::CguApproved, self.cgu_approved.is_some()),
            (Field::AdditionalContent, self.additional_content.is_some()),
            (Field::Contacts, self.contacts.is_some()),
            (Field::Documents, self.documents.is_some()),
            (Field::ResponsableTraitement, self.responsable_traitement.is_some()),
            (Field::Dpo, self.dpo.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(field, is_present)| is_present.then_some(field))
            .collect()
    }

    /// Drop every field outside `allowed`.
    pub fn clip(mut self, allowed: &BTreeSet<Field>) -> Self {
        for field in self.fields() {
            if allowed.contains(&field) {
                continue;
            }
            match field {
                Field::Title => self.title = None,
                Field::Description => self.description = None,
                Field::LegalBasisTitle => self.legal_basis_title = None,
                Field::LegalBasisUrl => self.legal_basis_url = None,
                Field::Siret => self.siret = None,
                Field::LegalName => self.legal_name = None,
                Field::Scopes => self.scopes = None,
                Field::DataRecipients => self.data_recipients = None,
                Field::DataRetentionPeriod => self.data_retention_period = None,
                Field::DataRetentionComment => self.data_retention_comment = None,
                Field::CguApproved => self.cgu_approved = None,
                Field::AdditionalContent => self.additional_content = None,
                Field::Contacts => self.contacts = None,
                Field::Documents => self.documents = None,
                Field::ResponsableTraitement => self.responsable_traitement = None,
                Field::Dpo => self.dpo = None,
                Field::Owner => {}
            }
        }
        self
    }

    /// Write the patch into `enrollment`. Additional content is merged key by key,
    /// keeping only the keys in `accepted_keys`.
    pub fn apply_to(self, enrollment: &mut Enrollment, accepted_keys: &[&str]) {
        let content = &mut enrollment.content;
        if let Some(value) = self.title {
            content.title = Some(value);
        }
        if let Some(value) = self.description {
            content.description = Some(value);
        }
        if let Some(value) = self.legal_basis_title {
            content.legal_basis_title = Some(value);
        }
        if let Some(value) = self.legal_basis_url {
            content.legal_basis_url = Some(value);
        }
        if let Some(value) = self.scopes {
            content.scopes = value;
        }
        if let Some(value) = self.data_recipients {
            content.data_recipients = Some(value);
        }
        if let Some(value) = self.data_retention_period {
            content.data_retention_period = Some(value);
        }
        if let Some(value) = self.data_retention_comment {
            content.data_retention_comment = Some(value);
        }
        if let Some(value) = self.cgu_approved {
            content.cgu_approved = value;
        }
        if let Some(values) = self.additional_content {
            for (key, value) in values {
                if accepted_keys.contains(&key.as_str()) {
                    content.additional_content.insert(key, value);
                }
            }
        }
        if let Some(value) = self.siret {
            enrollment.siret = Some(value);
        }
        if let Some(value) = self.legal_name {
            enrollment.legal_name = Some(value);
        }
        if let Some(value) = self.contacts {
            enrollment.contacts = value;
        }
        if let Some(value) = self.documents {
            enrollment.documents = value;
        }
        if let Some(value) = self.responsable_traitement {
            enrollment.responsable_traitement = value;
        }
        if let Some(value) = self.dpo {
            enrollment.dpo = value;
        }
    }
}

/// Permission a user holds, resolved by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "provider", rename_all = "snake_case")]
pub enum Capability {
    /// May represent an organization when requesting access to the provider.
    Applicant(Provider),
    /// Instructs the provider's enrollments.
    Administrator(Provider),
}

/// Authenticated caller, passed explicitly to every workflow operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub email: String,
    pub capabilities: BTreeSet<Capability>,
    /// Memberships claimed by the current session; re-checked on submission.
    pub organization_ids: Vec<OrganizationId>,
    pub email_verified: bool,
}

impl Actor {
    pub fn new(user_id: UserId, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
            capabilities: BTreeSet::new(),
            organization_ids: Vec::new(),
            email_verified: true,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_organization(mut self, organization_id: OrganizationId) -> Self {
        self.organization_ids.push(organization_id);
        self
    }

    pub fn is_admin_of(&self, provider: Provider) -> bool {
        self.capabilities
            .contains(&Capability::Administrator(provider))
    }

    pub fn can_apply_for(&self, provider: Provider) -> bool {
        self.capabilities.contains(&Capability::Applicant(provider))
    }

    pub fn as_user_ref(&self) -> UserRef {
        UserRef {
            id: self.user_id,
            email: self.email.clone(),
        }
    }
}
