use datapass::config::WorkflowConfig;
use datapass::workflows::enrollment::{
    EnrollmentService, InMemoryEnrollmentRepository, NotificationDispatcher, NotificationError,
    NotificationIntent, Recipient, SessionClaimsVerifier,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) type ApiEnrollmentService =
    EnrollmentService<InMemoryEnrollmentRepository, LogDispatcher, SessionClaimsVerifier>;

/// Stand-in for the mailer: logs every intent and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LogDispatcher;

impl NotificationDispatcher for LogDispatcher {
    fn dispatch(&self, intent: NotificationIntent) -> Result<(), NotificationError> {
        info!(
            enrollment_id = %intent.enrollment_id,
            template = intent.template.label(),
            to = %describe_recipient(&intent.to),
            "notification handed to mailer"
        );
        Ok(())
    }
}

pub(crate) fn describe_recipient(recipient: &Recipient) -> String {
    match recipient {
        Recipient::Email(email) => email.clone(),
        Recipient::ProviderAdministrators(provider) => format!("{provider} administrators"),
    }
}

pub(crate) fn build_enrollment_service(config: WorkflowConfig) -> Arc<ApiEnrollmentService> {
    Arc::new(EnrollmentService::new(
        Arc::new(InMemoryEnrollmentRepository::default()),
        Arc::new(LogDispatcher),
        Arc::new(SessionClaimsVerifier),
        config,
    ))
}
