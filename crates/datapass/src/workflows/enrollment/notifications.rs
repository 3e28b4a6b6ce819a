use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::domain::{Enrollment, EnrollmentId, Provider, RgpdContact};
use super::variants::variant;

/// Who a notification is addressed to. Administrator addresses are resolved by the
/// mail collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    Email(String),
    ProviderAdministrators(Provider),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    CreateApplication,
    SendApplication,
    NotifyApplicationSent,
    ReviewApplication,
    ValidateApplication,
    RefuseApplication,
    RgpdContact,
    UpdateContacts,
    OwnerChanged,
}

impl NotificationTemplate {
    pub const fn label(self) -> &'static str {
        match self {
            NotificationTemplate::CreateApplication => "create_application",
            NotificationTemplate::SendApplication => "send_application",
            NotificationTemplate::NotifyApplicationSent => "notify_application_sent",
            NotificationTemplate::ReviewApplication => "review_application",
            NotificationTemplate::ValidateApplication => "validate_application",
            NotificationTemplate::RefuseApplication => "refuse_application",
            NotificationTemplate::RgpdContact => "rgpd_contact",
            NotificationTemplate::UpdateContacts => "update_contacts",
            NotificationTemplate::OwnerChanged => "owner_changed",
        }
    }
}

/// Templated email to send. Produced by the workflow, delivered by someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub to: Recipient,
    pub provider: Provider,
    pub enrollment_id: EnrollmentId,
    pub template: NotificationTemplate,
    pub extra_params: BTreeMap<String, String>,
}

/// Which RGPD block a notification concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgpdRole {
    ResponsableTraitement,
    Dpo,
}

impl RgpdRole {
    pub const ALL: [RgpdRole; 2] = [RgpdRole::ResponsableTraitement, RgpdRole::Dpo];

    pub const fn label(self) -> &'static str {
        match self {
            RgpdRole::ResponsableTraitement => "responsable de traitement",
            RgpdRole::Dpo => "délégué à la protection des données",
        }
    }

    pub fn contact(self, enrollment: &Enrollment) -> &RgpdContact {
        match self {
            RgpdRole::ResponsableTraitement => &enrollment.responsable_traitement,
            RgpdRole::Dpo => &enrollment.dpo,
        }
    }
}

/// Builds notification intents with the parameters every template expects.
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    front_host: String,
}

impl NotificationBuilder {
    pub fn new(front_host: impl Into<String>) -> Self {
        Self {
            front_host: front_host.into(),
        }
    }

    /// Front-end page of the enrollment, e.g. `https://datapass.example/api-particulier/42`.
    pub fn enrollment_url(&self, enrollment: &Enrollment) -> String {
        format!(
            "{}/{}/{}",
            self.front_host.trim_end_matches('/'),
            enrollment.provider.as_str().replace('_', "-"),
            enrollment.id
        )
    }

    fn params(&self, enrollment: &Enrollment) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert(
            "target_api_label".to_string(),
            variant(enrollment.provider).label.to_string(),
        );
        params.insert("url".to_string(), self.enrollment_url(enrollment));
        if let Some(title) = &enrollment.content.title {
            params.insert("intitule".to_string(), title.clone());
        }
        if let Some(legal_name) = &enrollment.legal_name {
            params.insert("nom_raison_sociale".to_string(), legal_name.clone());
        }
        params
    }

    fn intent(
        &self,
        enrollment: &Enrollment,
        to: Recipient,
        template: NotificationTemplate,
        extra_params: BTreeMap<String, String>,
    ) -> NotificationIntent {
        NotificationIntent {
            to,
            provider: enrollment.provider,
            enrollment_id: enrollment.id,
            template,
            extra_params,
        }
    }

    pub fn to_owner(
        &self,
        enrollment: &Enrollment,
        template: NotificationTemplate,
        comment: Option<&str>,
    ) -> NotificationIntent {
        let mut params = self.params(enrollment);
        if let Some(comment) = comment {
            params.insert("message".to_string(), comment.to_string());
        }
        self.intent(
            enrollment,
            Recipient::Email(enrollment.owner.email.clone()),
            template,
            params,
        )
    }

    pub fn to_administrators(
        &self,
        enrollment: &Enrollment,
        template: NotificationTemplate,
        applicant_email: &str,
    ) -> NotificationIntent {
        let mut params = self.params(enrollment);
        params.insert("applicant_email".to_string(), applicant_email.to_string());
        self.intent(
            enrollment,
            Recipient::ProviderAdministrators(enrollment.provider),
            template,
            params,
        )
    }

    /// Notice to an RGPD contact that they were designated. `None` when the block has
    /// no email.
    pub fn rgpd_contact(
        &self,
        enrollment: &Enrollment,
        role: RgpdRole,
    ) -> Option<NotificationIntent> {
        let contact = role.contact(enrollment);
        let email = contact.email()?;

        let mut params = self.params(enrollment);
        params.insert("rgpd_role".to_string(), role.label().to_string());
        params.insert("owner_email".to_string(), enrollment.owner.email.clone());
        if let Some(label) = &contact.label {
            params.insert("contact_label".to_string(), label.clone());
        }

        Some(self.intent(
            enrollment,
            Recipient::Email(email.to_string()),
            NotificationTemplate::RgpdContact,
            params,
        ))
    }
}

/// Outbound hook to the templated-email collaborator.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, intent: NotificationIntent) -> Result<(), NotificationError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Hand every intent to `dispatcher`. Failures are logged and dropped; a transition
/// never depends on delivery.
pub fn dispatch_all<N>(dispatcher: &N, intents: &[NotificationIntent])
where
    N: NotificationDispatcher + ?Sized,
{
    for intent in intents {
        match dispatcher.dispatch(intent.clone()) {
            Ok(()) => debug!(
                enrollment_id = %intent.enrollment_id,
                template = intent.template.label(),
                "notification queued"
            ),
            Err(err) => warn!(
                enrollment_id = %intent.enrollment_id,
                template = intent.template.label(),
                error = %err,
                "notification dispatch failed"
            ),
        }
    }
}
