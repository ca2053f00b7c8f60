//! Email service for issue and return notifications

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox, Message, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Address, SmtpTransport, Transport,
};

use super::notifier::Notifier;
use crate::{
    config::EmailConfig,
    error::{AppError, AppResult},
    models::MemberContact,
};

#[derive(Clone)]
pub struct EmailService {
    config: EmailConfig,
}

/// Minimal escaping for values interpolated into HTML bodies
fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn html_body(accent: &str, heading: &str, paragraphs: &[String]) -> String {
    let content: String = paragraphs.iter().map(|p| format!("<p>{}</p>", p)).collect();
    format!(
        r#"<html><body style="font-family: Arial, sans-serif; padding: 20px;">
<h2 style="color: {accent};">{heading}</h2>
{content}
<hr style="border: none; border-top: 1px solid #e5e7eb;">
<p style="color: #6b7280; font-size: 14px;">Thank you,<br/>Library Circulation Desk</p>
</body></html>"#,
        accent = accent,
        heading = heading,
        content = content
    )
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn issued_message(
        contact: &MemberContact,
        book_title: &str,
        issued_at: DateTime<Utc>,
    ) -> (String, String) {
        let date = issued_at.format("%Y-%m-%d");
        let text = format!(
            "Hello {name},\n\n\
             Your book \"{title}\" has been successfully issued.\n\n\
             Issue date: {date}\n\n\
             Please return the book on time.\n",
            name = contact.name,
            title = book_title,
            date = date
        );
        let html = html_body(
            "#2563eb",
            "Book Issued Successfully",
            &[
                format!("Hello <strong>{}</strong>,", escape_html(&contact.name)),
                format!(
                    "Your book \"<strong>{}</strong>\" has been successfully issued.",
                    escape_html(book_title)
                ),
                format!("<strong>Issue date:</strong> {}", date),
                "Please return the book on time.".to_string(),
            ],
        );
        (text, html)
    }

    fn returned_message(
        contact: &MemberContact,
        book_title: &str,
        returned_at: DateTime<Utc>,
    ) -> (String, String) {
        let date = returned_at.format("%Y-%m-%d");
        let text = format!(
            "Hello {name},\n\n\
             The book \"{title}\" has been successfully returned.\n\n\
             Return date: {date}\n\n\
             Thank you for using our library services.\n",
            name = contact.name,
            title = book_title,
            date = date
        );
        let html = html_body(
            "#16a34a",
            "Book Returned Successfully",
            &[
                format!("Hello <strong>{}</strong>,", escape_html(&contact.name)),
                format!(
                    "The book \"<strong>{}</strong>\" has been successfully returned.",
                    escape_html(book_title)
                ),
                format!("<strong>Return date:</strong> {}", date),
                "Thank you for using our library services.".to_string(),
            ],
        );
        (text, html)
    }

    fn build_message(
        &self,
        to: &MemberContact,
        subject: &str,
        text: String,
        html: String,
    ) -> AppResult<Message> {
        let from_address: Address = self
            .config
            .smtp_from
            .parse()
            .map_err(|e| AppError::Internal(format!("Invalid from address: {}", e)))?;
        let from_mailbox = Mailbox::new(self.config.smtp_from_name.clone(), from_address);

        let to_address: Address = to
            .email
            .parse()
            .map_err(|e| AppError::Internal(format!("Invalid to address: {}", e)))?;
        let to_mailbox = Mailbox::new(Some(to.name.clone()), to_address);

        Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html),
                    ),
            )
            .map_err(|e| AppError::Internal(format!("Failed to build email: {}", e)))
    }

    fn mailer(&self) -> AppResult<SmtpTransport> {
        let mailer_builder = if self.config.smtp_use_tls {
            SmtpTransport::starttls_relay(&self.config.smtp_host)
                .map_err(|e| AppError::Internal(format!("Failed to create SMTP transport: {}", e)))?
        } else {
            SmtpTransport::builder_dangerous(&self.config.smtp_host)
        }
        .port(self.config.smtp_port);

        let mailer_builder = if let (Some(username), Some(password)) = (
            &self.config.smtp_username,
            self.config.normalized_password(),
        ) {
            mailer_builder.credentials(Credentials::new(username.clone(), password))
        } else {
            mailer_builder
        };

        Ok(mailer_builder.build())
    }

    async fn send_email(
        &self,
        to: &MemberContact,
        subject: &str,
        text: String,
        html: String,
    ) -> AppResult<()> {
        let email = self.build_message(to, subject, text, html)?;
        let mailer = self.mailer()?;

        // SmtpTransport is blocking
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::Internal(format!("Email task failed: {}", e)))?
            .map_err(|e| AppError::Internal(format!("Failed to send email: {}", e)))?;

        tracing::info!(to = %to.email, subject, "Email sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailService {
    async fn notify_issued(
        &self,
        contact: &MemberContact,
        book_title: &str,
        issued_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let (text, html) = Self::issued_message(contact, book_title, issued_at);
        self.send_email(contact, "Book Issued Successfully", text, html).await
    }

    async fn notify_returned(
        &self,
        contact: &MemberContact,
        book_title: &str,
        returned_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let (text, html) = Self::returned_message(contact, book_title, returned_at);
        self.send_email(contact, "Book Returned Successfully", text, html).await
    }
}
