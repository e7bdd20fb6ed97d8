//! Fire-and-forget email notifications for key creation and retrieval.
//!
//! Delivery runs on a detached blocking task so a slow mail agent can
//! never hold up a key grant. Send failures are logged and dropped.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::sysconfig::Sysconfig;

pub const CONF_MAIL_AGENT_AND_PORT: &str = "MAIL_AGENT_AND_PORT";
pub const CONF_MAIL_AGENT_USERNAME: &str = "MAIL_AGENT_USERNAME";
pub const CONF_MAIL_AGENT_PASSWORD: &str = "MAIL_AGENT_PASSWORD";
pub const CONF_MAIL_FROM_ADDR: &str = "MAIL_FROM_ADDR";
pub const CONF_MAIL_RECIPIENTS: &str = "MAIL_RECIPIENTS";
pub const CONF_MAIL_CREATION_SUBJ: &str = "MAIL_CREATION_SUBJ";
pub const CONF_MAIL_CREATION_TEXT: &str = "MAIL_CREATION_TEXT";
pub const CONF_MAIL_RETRIEVAL_SUBJ: &str = "MAIL_RETRIEVAL_SUBJ";
pub const CONF_MAIL_RETRIEVAL_TEXT: &str = "MAIL_RETRIEVAL_TEXT";

const DEFAULT_CREATION_SUBJ: &str = "A new encryption key has been created";
const DEFAULT_RETRIEVAL_SUBJ: &str = "An encryption key has been retrieved";

#[derive(Debug, Clone, Default)]
pub struct Mailer {
    /// `host:port` of the mail agent; notifications are off while unset.
    agent: Option<String>,
    username: Option<String>,
    password: Option<String>,
    from: Option<String>,
    recipients: Vec<String>,
    creation_subject: String,
    creation_text: String,
    retrieval_subject: String,
    retrieval_text: String,
}

impl Mailer {
    pub fn from_sysconfig(conf: &Sysconfig) -> Self {
        Mailer {
            agent: conf.get(CONF_MAIL_AGENT_AND_PORT).map(str::to_string),
            username: conf.get(CONF_MAIL_AGENT_USERNAME).map(str::to_string),
            password: conf.get(CONF_MAIL_AGENT_PASSWORD).map(str::to_string),
            from: conf.get(CONF_MAIL_FROM_ADDR).map(str::to_string),
            recipients: conf.get_list(CONF_MAIL_RECIPIENTS),
            creation_subject: conf.get_string(CONF_MAIL_CREATION_SUBJ, DEFAULT_CREATION_SUBJ),
            creation_text: conf.get_string(CONF_MAIL_CREATION_TEXT, ""),
            retrieval_subject: conf.get_string(CONF_MAIL_RETRIEVAL_SUBJ, DEFAULT_RETRIEVAL_SUBJ),
            retrieval_text: conf.get_string(CONF_MAIL_RETRIEVAL_TEXT, ""),
        }
    }

    /// Distinguishes "operator never asked for mail" from "asked but
    /// incomplete". Either way the daemon serves keys without mail.
    pub fn validate(&self) -> Result<(), String> {
        let Some(agent) = &self.agent else {
            return Err("mail agent is not configured".into());
        };
        if !agent.contains(':') {
            return Err(format!("mail agent \"{agent}\" is not host:port"));
        }
        if self.from.is_none() {
            return Err("mail FROM address is not configured".into());
        }
        if self.recipients.is_empty() {
            return Err("mail recipient list is empty".into());
        }
        Ok(())
    }

    pub fn agent_description(&self) -> String {
        format!(
            "from {} to {:?} via {}",
            self.from.as_deref().unwrap_or("?"),
            self.recipients,
            self.agent.as_deref().unwrap_or("?")
        )
    }

    /// Notify about a freshly created key. Returns immediately.
    pub fn notify_creation(&self, uuid: &str, mount_point: &str) {
        let body = format!(
            "{}\n\nUUID: {uuid}\nMount point: {mount_point}\n",
            self.creation_text
        );
        self.send_detached(self.creation_subject.clone(), body);
    }

    /// Notify about a key grant. Returns immediately.
    pub fn notify_retrieval(&self, uuids: &[String], ip: &str, hostname: &str) {
        if uuids.is_empty() {
            return;
        }
        let body = format!(
            "{}\n\nRetrieved by: {ip} ({hostname})\nUUIDs: {}\n",
            self.retrieval_text,
            uuids.join(" ")
        );
        self.send_detached(self.retrieval_subject.clone(), body);
    }

    fn send_detached(&self, subject: String, body: String) {
        if self.validate().is_err() {
            return;
        }
        let mailer = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = mailer.send_blocking(&subject, &body) {
                tracing::warn!(error = %e, "notification mail failed");
            }
        });
    }

    fn send_blocking(&self, subject: &str, body: &str) -> Result<(), String> {
        let agent = self.agent.as_deref().ok_or("mail agent unset")?;
        let (host, port) = agent.split_once(':').ok_or("mail agent is not host:port")?;
        let port: u16 = port.parse().map_err(|_| "mail agent port is not a number")?;

        let from: Mailbox = self
            .from
            .as_deref()
            .ok_or("mail FROM unset")?
            .parse()
            .map_err(|e| format!("bad FROM address: {e}"))?;
        let mut builder = Message::builder().from(from).subject(subject);
        for recipient in &self.recipients {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| format!("bad recipient {recipient}: {e}"))?;
            builder = builder.to(to);
        }
        let message = builder
            .body(body.to_string())
            .map_err(|e| format!("building message: {e}"))?;

        let mut transport = SmtpTransport::builder_dangerous(host).port(port);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            transport =
                transport.credentials(Credentials::new(username.clone(), password.clone()));
        }
        transport
            .build()
            .send(&message)
            .map(|_| ())
            .map_err(|e| format!("sending via {agent}: {e}"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
