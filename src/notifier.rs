use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{error, info};

use crate::analysis::AnalysisSummary;
use crate::config::{EmailSettings, RunConfig};
use crate::scraper::FlightRecord;

const SUMMARY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Build(#[from] lettre::error::Error),
}

/// A plain-text email, optionally with one file attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

pub fn price_alert(run: &RunConfig, flight: &FlightRecord) -> OutgoingEmail {
    OutgoingEmail {
        subject: format!(
            "[Important] Flight price alert! Fare below ¥{}",
            run.price_threshold
        ),
        body: format!(
            "Hello!\n\n\
             A fare on your watched route dropped below ¥{}.\n\n\
             Flight: {}\n\
             Route: {} -> {}\n\
             Time: {} - {}\n\
             Current price: ¥{}\n\n\
             Head over to Fliggy soon!\n",
            run.price_threshold,
            flight.flight_number,
            run.route.departure_city,
            run.route.arrival_city,
            flight.departure_time,
            flight.arrival_time,
            flight.price,
        ),
        attachment: None,
    }
}

pub fn error_report(message: &str) -> OutgoingEmail {
    OutgoingEmail {
        subject: "[Warning] Flight price tracker failure".into(),
        body: format!(
            "Hello!\n\n\
             The flight price tracker hit an error while running.\n\n\
             Error:\n{message}\n\n\
             Please check the log file on the server and fix the problem.\n"
        ),
        attachment: None,
    }
}

pub fn daily_summary(summary: &AnalysisSummary) -> OutgoingEmail {
    OutgoingEmail {
        subject: format!("Daily flight price report - lowest: ¥{}", summary.min_price),
        body: format!(
            "Hello!\n\n\
             Here is today's flight price report.\n\n\
             --- Summary ---\n\
             Lowest price seen: ¥{}\n\
             Flight details:\n  \
               - Flight: {}\n  \
               - Departs: {} from {}\n  \
               - Arrives: {} at {}\n\
             Recorded at: {}\n\n\
             The attached chart shows the full price trend.\n",
            summary.min_price,
            summary.flight_number,
            summary.departure_time,
            summary.departure_port,
            summary.arrival_time,
            summary.arrival_port,
            summary.captured_at.format(SUMMARY_TIME_FORMAT),
        ),
        attachment: Some(summary.chart_path.clone()),
    }
}

/// Delivers one email to one recipient.
pub trait Mailer {
    async fn send(&self, to: &str, email: &OutgoingEmail) -> Result<(), NotifyError>;
}

/// Submits mail to an SMTP relay over implicit TLS.
pub struct SmtpMailer {
    settings: EmailSettings,
}

impl SmtpMailer {
    pub const fn new(settings: EmailSettings) -> Self {
        Self { settings }
    }

    pub fn compose(&self, to: &str, email: &OutgoingEmail) -> Result<Message, NotifyError> {
        let builder = Message::builder()
            .from(self.settings.sender_email.parse()?)
            .to(to.parse()?)
            .subject(email.subject.clone());
        let text = SinglePart::plain(email.body.clone());

        let message = match email.attachment.as_deref().and_then(read_attachment) {
            Some(attachment) => builder.multipart(
                MultiPart::mixed()
                    .singlepart(text)
                    .singlepart(attachment),
            )?,
            None => builder.singlepart(text)?,
        };
        Ok(message)
    }
}

/// A missing or unreadable attachment is logged and left out.
fn read_attachment(path: &Path) -> Option<SinglePart> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            error!("Failed to attach {}: {e}", path.display());
            return None;
        }
    };
    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        _ => "application/octet-stream",
    };
    let content_type = match ContentType::parse(mime) {
        Ok(content_type) => content_type,
        Err(e) => {
            error!("Failed to attach {}: {e}", path.display());
            return None;
        }
    };
    let filename = path
        .file_name()
        .map_or_else(|| "attachment".into(), |n| n.to_string_lossy().into_owned());
    Some(Attachment::new(filename).body(content, content_type))
}

impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, email: &OutgoingEmail) -> Result<(), NotifyError> {
        let message = self.compose(to, email)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.settings.smtp_server)?
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.sender_email.clone(),
                self.settings.password.clone(),
            ))
            .build();
        transport.send(message).await?;
        Ok(())
    }
}

/// Best-effort notifications to the configured recipient.
pub struct Notifier<M> {
    mailer: M,
    recipient: RefCell<String>,
}

impl<M: Mailer> Notifier<M> {
    pub fn new(mailer: M, recipient: impl Into<String>) -> Self {
        Self {
            mailer,
            recipient: RefCell::new(recipient.into()),
        }
    }

    pub fn set_recipient(&self, recipient: String) {
        if *self.recipient.borrow() != recipient {
            info!("Alert recipient changed to {recipient}");
        }
        *self.recipient.borrow_mut() = recipient;
    }

    #[cfg(test)]
    pub const fn mailer(&self) -> &M {
        &self.mailer
    }

    pub async fn price_alert(&self, run: &RunConfig, flight: &FlightRecord) -> bool {
        self.deliver(price_alert(run, flight)).await
    }

    pub async fn error_report(&self, message: &str) -> bool {
        self.deliver(error_report(message)).await
    }

    pub async fn daily_summary(&self, summary: &AnalysisSummary) -> bool {
        self.deliver(daily_summary(summary)).await
    }

    async fn deliver(&self, email: OutgoingEmail) -> bool {
        let recipient = self.recipient.borrow().clone();
        match self.mailer.send(&recipient, &email).await {
            Ok(()) => {
                info!("Email \"{}\" sent to {recipient}", email.subject);
                true
            }
            Err(e) => {
                error!("Failed to send \"{}\" to {recipient}: {e}", email.subject);
                false
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::cell::RefCell;

    use super::{Mailer, NotifyError, OutgoingEmail};

    /// Keeps every email instead of sending it; can be told to fail.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: RefCell<Vec<(String, OutgoingEmail)>>,
        pub fail: bool,
    }

    impl RecordingMailer {
        pub fn subjects(&self) -> Vec<String> {
            self.sent.borrow().iter().map(|(_, e)| e.subject.clone()).collect()
        }
    }

    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, email: &OutgoingEmail) -> Result<(), NotifyError> {
            if self.fail {
                let bad: Result<lettre::Address, _> = "not-an-address".parse();
                return Err(bad.unwrap_err().into());
            }
            self.sent.borrow_mut().push((to.to_string(), email.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::testing::RecordingMailer;
    use super::*;
    use crate::config::Route;

    fn run() -> RunConfig {
        RunConfig {
            route: Route {
                departure_city: "北京".into(),
                arrival_city: "上海".into(),
                departure_date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            },
            price_threshold: 800,
            locked_flight: None,
        }
    }

    fn flight() -> FlightRecord {
        FlightRecord {
            flight_number: "CA1234".into(),
            departure_time: "07:30".into(),
            arrival_time: "09:45".into(),
            departure_port: "首都国际机场T3".into(),
            arrival_port: "虹桥国际机场T2".into(),
            price: 750,
            source_website: "Fliggy".into(),
        }
    }

    fn summary(chart: PathBuf) -> AnalysisSummary {
        AnalysisSummary {
            min_price: 760,
            flight_number: "CA1234".into(),
            departure_time: "07:30".into(),
            arrival_time: "09:45".into(),
            departure_port: "首都国际机场T3".into(),
            arrival_port: "虹桥国际机场T2".into(),
            captured_at: NaiveDate::from_ymd_opt(2025, 7, 13)
                .unwrap()
                .and_hms_opt(6, 1, 0)
                .unwrap(),
            chart_path: chart,
        }
    }

    fn mailer() -> SmtpMailer {
        SmtpMailer::new(EmailSettings {
            sender_email: "tracker@example.com".into(),
            smtp_server: "smtp.example.com".into(),
            port: 465,
            password: "secret".into(),
        })
    }

    #[test]
    fn price_alert_names_route_and_price() {
        let email = price_alert(&run(), &flight());

        assert_eq!(email.subject, "[Important] Flight price alert! Fare below ¥800");
        assert!(email.body.contains("Flight: CA1234"));
        assert!(email.body.contains("Route: 北京 -> 上海"));
        assert!(email.body.contains("Time: 07:30 - 09:45"));
        assert!(email.body.contains("Current price: ¥750"));
        assert_eq!(email.attachment, None);
    }

    #[test]
    fn error_report_carries_message() {
        let email = error_report("no visible city suggestion for `上海`");

        assert_eq!(email.subject, "[Warning] Flight price tracker failure");
        assert!(email.body.contains("no visible city suggestion for `上海`"));
    }

    #[test]
    fn daily_summary_attaches_chart() {
        let email = daily_summary(&summary("trend.png".into()));

        assert_eq!(email.subject, "Daily flight price report - lowest: ¥760");
        assert!(email.body.contains("Departs: 07:30 from 首都国际机场T3"));
        assert!(email.body.contains("Recorded at: 2025-07-13 06:01"));
        assert_eq!(email.attachment, Some(PathBuf::from("trend.png")));
    }

    #[test]
    fn compose_attaches_readable_file() {
        let dir = TempDir::new().unwrap();
        let chart = dir.path().join("trend.png");
        fs::write(&chart, b"\x89PNG\r\n\x1a\n").unwrap();

        let message = mailer()
            .compose("me@example.com", &daily_summary(&summary(chart)))
            .unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();

        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("trend.png"));
        assert!(raw.contains("image/png"));
    }

    #[test]
    fn compose_without_readable_attachment_still_builds() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone.png");

        let message = mailer()
            .compose("me@example.com", &daily_summary(&summary(missing)))
            .unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();

        assert!(!raw.contains("multipart/mixed"));
        assert!(raw.contains("To: me@example.com"));
    }

    #[test]
    fn compose_rejects_bad_recipient() {
        let result = mailer().compose("not-an-email", &error_report("boom"));
        assert!(matches!(result, Err(NotifyError::Address(_))));
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let notifier = Notifier::new(
            RecordingMailer {
                fail: true,
                ..RecordingMailer::default()
            },
            "me@example.com",
        );

        assert!(!notifier.error_report("boom").await);
        assert!(notifier.mailer().sent.borrow().is_empty());
    }

    #[tokio::test]
    async fn notifier_sends_to_recipient() {
        let notifier = Notifier::new(RecordingMailer::default(), "me@example.com");

        assert!(notifier.price_alert(&run(), &flight()).await);

        let sent = notifier.mailer().sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "me@example.com");
    }

    #[tokio::test]
    async fn changed_recipient_applies_to_next_email() {
        let notifier = Notifier::new(RecordingMailer::default(), "me@example.com");
        notifier.error_report("first").await;

        notifier.set_recipient("ops@example.com".into());
        notifier.error_report("second").await;

        let recipients: Vec<_> = notifier
            .mailer()
            .sent
            .borrow()
            .iter()
            .map(|(to, _)| to.clone())
            .collect();
        assert_eq!(recipients, ["me@example.com", "ops@example.com"]);
    }
}
