//! Incident reporting.
//!
//! Components hold an [`IncidentSender`] and report faults through it. Every
//! incident is logged when reported; when mail is configured, the
//! [`IncidentReporter`] task batches incidents that arrive close together
//! and mails them to the contact list. Mail failures are only logged.

pub mod mail;

use chrono::{DateTime, Utc};
use mail::{MailMessage, Notifier};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Maximum number of queued incidents before new ones are dropped (still logged)
const INCIDENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Expected recovery step, e.g. a scheduled restart
    Notice,
    /// Non-fatal fault: crash, failed backup, failed sync
    Warning,
    /// The server ignored the termination signal and was killed
    ForcedKill,
    /// Automatic recovery stopped; operator action required
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Notice => "notice",
            Severity::Warning => "warning",
            Severity::ForcedKill => "forced kill",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Incident {
    pub severity: Severity,
    pub cause: String,
    pub time: DateTime<Utc>,
}

impl Incident {
    pub fn new(severity: Severity, cause: impl Into<String>) -> Self {
        Self {
            severity,
            cause: cause.into(),
            time: Utc::now(),
        }
    }
}

/// Create the incident channel shared by all components
pub fn channel() -> (IncidentSender, mpsc::Receiver<Incident>) {
    let (tx, rx) = mpsc::channel(INCIDENT_QUEUE_CAPACITY);
    (IncidentSender { tx }, rx)
}

/// Cloneable handle used by components to raise incidents
#[derive(Clone)]
pub struct IncidentSender {
    tx: mpsc::Sender<Incident>,
}

impl IncidentSender {
    pub fn report(&self, severity: Severity, cause: impl Into<String>) {
        self.send(Incident::new(severity, cause));
    }

    pub fn send(&self, incident: Incident) {
        match incident.severity {
            Severity::Notice => info!(severity = %incident.severity, "{}", incident.cause),
            Severity::Warning => warn!(severity = %incident.severity, "{}", incident.cause),
            Severity::ForcedKill | Severity::Fatal => {
                error!(severity = %incident.severity, "{}", incident.cause)
            }
        }

        match self.tx.try_send(incident) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Incident queue full, incident was only logged");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Incident reporter stopped, incident was only logged");
            }
        }
    }
}

/// Consumes incidents and mails them in batches
pub struct IncidentReporter<N: Notifier> {
    rx: mpsc::Receiver<Incident>,
    notifier: Option<N>,
    server_name: String,
    host: String,
    batch_window: Duration,
}

impl<N: Notifier> IncidentReporter<N> {
    pub fn new(
        rx: mpsc::Receiver<Incident>,
        notifier: Option<N>,
        server_name: String,
        batch_window: Duration,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            rx,
            notifier,
            server_name,
            host,
            batch_window,
        }
    }

    /// Run until every [`IncidentSender`] has been dropped
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let Some(notifier) = &self.notifier else {
                continue;
            };

            let mut batch = vec![first];
            let window = tokio::time::sleep(self.batch_window);
            tokio::pin!(window);

            loop {
                tokio::select! {
                    _ = &mut window => break,
                    next = self.rx.recv() => match next {
                        Some(incident) => batch.push(incident),
                        None => break,
                    },
                }
            }

            let message = compose(&self.server_name, &self.host, &batch);
            match notifier.send(&message).await {
                Ok(()) => info!("Mailed incident report ({} incident(s))", batch.len()),
                Err(e) => error!("Failed to mail incident report: {}", e),
            }
        }

        debug!("Incident reporter stopped");
    }
}

/// Build the mail for a batch of incidents
pub fn compose(server_name: &str, host: &str, incidents: &[Incident]) -> MailMessage {
    let fatal = incidents.iter().any(|i| i.severity == Severity::Fatal);

    let subject = if fatal {
        format!("[{}] FATAL: automatic recovery halted", server_name)
    } else {
        format!("[{}] {} incident(s)", server_name, incidents.len())
    };

    let mut body = format!("Incident report for {} on {}\n\n", server_name, host);
    for incident in incidents {
        body.push_str(&format!(
            "{} [{}] {}\n",
            incident.time.to_rfc3339(),
            incident.severity,
            incident.cause
        ));
    }
    if fatal {
        body.push_str("\nThe server is no longer restarted automatically. Operator intervention is required.\n");
    }

    MailMessage { subject, body }
}

/// Mail sent once at startup to prove the SMTP settings work
pub fn startup_message(server_name: &str) -> MailMessage {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    MailMessage {
        subject: format!("[{}] server manager started", server_name),
        body: format!(
            "The server manager for {} started on {} at {}.\nIncidents will be reported to this address.\n",
            server_name,
            host,
            Utc::now().to_rfc3339()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::{ManagerError, Result};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<MailMessage>>>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        async fn send(&self, message: &MailMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            if self.fail {
                Err(ManagerError::Mail("relay refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_incidents_in_window_share_one_mail() {
        let (sender, rx) = channel();
        let notifier = RecordingNotifier::default();
        let reporter = IncidentReporter::new(
            rx,
            Some(notifier.clone()),
            "Survival".into(),
            Duration::from_millis(200),
        );

        sender.report(Severity::Warning, "server crashed");
        sender.report(Severity::Notice, "restarting in 10s");
        sender.report(Severity::Warning, "backup failed");
        drop(sender);

        reporter.run().await;

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[Survival] 3 incident(s)");
        assert!(sent[0].body.contains("[warning] server crashed"));
        assert!(sent[0].body.contains("[notice] restarting in 10s"));
    }

    #[tokio::test]
    async fn test_mail_failure_is_not_reported_again() {
        let (sender, rx) = channel();
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let reporter = IncidentReporter::new(
            rx,
            Some(notifier.clone()),
            "Survival".into(),
            Duration::from_millis(10),
        );

        sender.report(Severity::Warning, "sync failed");
        drop(sender);

        reporter.run().await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_without_mail_incidents_are_drained() {
        let (sender, rx) = channel();
        let reporter: IncidentReporter<RecordingNotifier> =
            IncidentReporter::new(rx, None, "Survival".into(), Duration::from_millis(10));

        sender.report(Severity::Fatal, "too many restarts");
        drop(sender);

        tokio::time::timeout(Duration::from_secs(1), reporter.run())
            .await
            .expect("reporter exits once senders are gone");
    }

    #[test]
    fn test_fatal_subject() {
        let incidents = vec![
            Incident::new(Severity::Warning, "server crashed"),
            Incident::new(Severity::Fatal, "restart limit reached"),
        ];
        let message = compose("Survival", "host-1", &incidents);
        assert_eq!(message.subject, "[Survival] FATAL: automatic recovery halted");
        assert!(message.body.contains("on host-1"));
        assert!(message.body.contains("Operator intervention is required"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Fatal > Severity::ForcedKill);
        assert!(Severity::Warning > Severity::Notice);
        assert_eq!(Severity::ForcedKill.to_string(), "forced kill");
    }
}
