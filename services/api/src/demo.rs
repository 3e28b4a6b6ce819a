use crate::infra::{build_enrollment_service, describe_recipient, ApiEnrollmentService};
use clap::Args;
use datapass::config::WorkflowConfig;
use datapass::error::AppError;
use datapass::workflows::enrollment::{
    variant_for, Actor, Capability, Contact, Enrollment, EnrollmentError, EnrollmentId,
    EnrollmentPatch, NewEnrollment, NotificationIntent, OrganizationId, RgpdContact,
    RgpdContactsUpdate, TransitionPayload, UserId,
};

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Provider the demo enrollment targets.
    #[arg(long, default_value = "api_particulier")]
    pub(crate) provider: String,
    /// Refuse the enrollment instead of validating it.
    #[arg(long)]
    pub(crate) refuse: bool,
    /// Front-end base URL used in notification links.
    #[arg(long)]
    pub(crate) front_host: Option<String>,
    /// Print the final record as JSON.
    #[arg(long)]
    pub(crate) json: bool,
}

const DEMO_ORGANIZATION: OrganizationId = OrganizationId(1);

/// Walks one enrollment through the whole lifecycle in-process and prints each step.
pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let provider = variant_for(&args.provider)
        .map_err(EnrollmentError::from)?
        .provider;

    let mut config = WorkflowConfig::default();
    if let Some(front_host) = args.front_host {
        config.front_host = front_host;
    }
    let service = build_enrollment_service(config);

    let applicant = Actor::new(UserId(1), "demandeur@commune-exemple.fr")
        .with_capability(Capability::Applicant(provider))
        .with_organization(DEMO_ORGANIZATION);
    let instructor = Actor::new(UserId(2), "instruction@datapass.example")
        .with_capability(Capability::Administrator(provider));

    println!("DataPass enrollment demo ({provider})");

    let created = service.create_enrollment(
        &applicant,
        NewEnrollment {
            provider: provider.as_str().to_string(),
            organization_id: DEMO_ORGANIZATION,
            previous_enrollment_id: None,
            fields: demo_patch(),
        },
    )?;
    let id = created.snapshot.enrollment.id;
    let mut notifications = created.notifications;
    print_status(&service, &applicant, id, "created")?;

    match step(&service, &applicant, id, "send_application", None).await {
        Ok(intents) => notifications.extend(intents),
        Err(err) => {
            println!("  Submission rejected: {err}");
            println!("  The demo form does not satisfy the {provider} rules; stopping here.");
            return Ok(());
        }
    }
    print_status(&service, &applicant, id, "submitted")?;

    notifications.extend(
        step(
            &service,
            &instructor,
            id,
            "review_application",
            Some("Merci de préciser le responsable de traitement"),
        )
        .await?,
    );
    print_status(&service, &applicant, id, "returned for changes")?;

    let contacts = service.update_rgpd_contact(
        &applicant,
        id,
        RgpdContactsUpdate {
            responsable_traitement: Some(RgpdContact {
                label: Some("Maire".to_string()),
                email: Some("maire@commune-exemple.fr".to_string()),
                phone_number: None,
            }),
            dpo: None,
        },
    )?;
    notifications.extend(contacts.notifications);
    notifications.extend(step(&service, &applicant, id, "send_application", None).await?);
    print_status(&service, &applicant, id, "resubmitted")?;

    if args.refuse {
        notifications.extend(
            step(
                &service,
                &instructor,
                id,
                "refuse_application",
                Some("Base légale insuffisante"),
            )
            .await?,
        );
        print_status(&service, &applicant, id, "refused")?;
    } else {
        notifications.extend(step(&service, &instructor, id, "validate_application", None).await?);
        print_status(&service, &applicant, id, "validated")?;
    }

    notifications.extend(step(&service, &applicant, id, "archive", None).await?);
    let archived = print_status(&service, &applicant, id, "archived")?;

    println!("\nHistory");
    for event in archived.events().iter() {
        let comment = event
            .comment
            .as_deref()
            .map(|comment| format!(" ({comment})"))
            .unwrap_or_default();
        println!(
            "  #{} {} by {}{}",
            event.id,
            event.name.label(),
            event
                .user_id
                .map(|user| user.to_string())
                .unwrap_or_else(|| "system".to_string()),
            comment
        );
    }

    println!("\nNotifications");
    for intent in &notifications {
        println!(
            "  {:<24} -> {}",
            intent.template.label(),
            describe_recipient(&intent.to)
        );
    }

    if args.json {
        match serde_json::to_string_pretty(&archived) {
            Ok(json) => println!("\nFinal record:\n{json}"),
            Err(err) => println!("\nFinal record unavailable: {err}"),
        }
    }

    Ok(())
}

async fn step(
    service: &ApiEnrollmentService,
    actor: &Actor,
    id: EnrollmentId,
    event: &str,
    comment: Option<&str>,
) -> Result<Vec<NotificationIntent>, EnrollmentError> {
    let payload = TransitionPayload {
        comment: comment.map(str::to_string),
    };
    service
        .trigger_transition(actor, id, event, payload)
        .await
        .map(|outcome| outcome.notifications)
}

fn print_status(
    service: &ApiEnrollmentService,
    actor: &Actor,
    id: EnrollmentId,
    label: &str,
) -> Result<Enrollment, EnrollmentError> {
    let snapshot = service.get_enrollment(actor, id)?;
    let allowed: Vec<&str> = snapshot
        .acl
        .entries()
        .filter_map(|(name, allowed)| allowed.then_some(name))
        .collect();
    println!(
        "  {:<22} status={:<13} applicant may: {}",
        label,
        snapshot.enrollment.status().label(),
        if allowed.is_empty() {
            "nothing".to_string()
        } else {
            allowed.join(", ")
        }
    );
    Ok(snapshot.enrollment)
}

fn demo_patch() -> EnrollmentPatch {
    EnrollmentPatch {
        title: Some("Tarification sociale des services périscolaires".to_string()),
        description: Some("Calcul du quotient familial sans pièce justificative".to_string()),
        legal_basis_title: Some("Délibération du conseil municipal".to_string()),
        siret: Some("21000000000018".to_string()),
        legal_name: Some("Commune Exemple".to_string()),
        data_retention_period: Some(12),
        cgu_approved: Some(true),
        contacts: Some(vec![Contact {
            heading: "technique".to_string(),
            name: Some("Service informatique".to_string()),
            email: Some("informatique@commune-exemple.fr".to_string()),
            phone_number: None,
        }]),
        ..EnrollmentPatch::default()
    }
}
