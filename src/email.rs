use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use mailparse::{addrparse_header, parse_mail, MailAddr, MailHeaderMap, ParsedMail};
use regex::Regex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::RawEmail;

const MAILBOX: &str = "INBOX";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl EmailConfig {
    pub fn gmail(username: &str, app_password: &str) -> Self {
        Self {
            server: "imap.gmail.com".to_string(),
            port: 993,
            username: username.to_string(),
            password: app_password.trim().to_string(),
        }
    }
}

/// One message as it came off the wire.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub seq: u32,
    pub raw: Vec<u8>,
    pub internal_date: Option<DateTime<Utc>>,
}

type TlsTcpStream = native_tls::TlsStream<TcpStream>;

/// An authenticated, read-only view of the inbox.
pub struct MailFetcher<T: Read + Write = TlsTcpStream> {
    session: imap::Session<T>,
}

impl MailFetcher {
    pub fn connect(config: &EmailConfig) -> Result<Self> {
        let tls = native_tls::TlsConnector::builder().build()?;

        let addr = (config.server.as_str(), config.port);
        let tcp = TcpStream::connect(addr).context("Failed to connect to IMAP server")?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;
        tcp.set_write_timeout(Some(Duration::from_secs(30)))?;
        let tls_stream = tls
            .connect(&config.server, tcp)
            .context("TLS handshake with IMAP server failed")?;

        let client = imap::Client::new(tls_stream);
        let mut session = client
            .login(&config.username, &config.password)
            .map_err(|e| anyhow!("Login failed: {}", e.0))?;

        // EXAMINE keeps the mailbox read-only
        session
            .examine(MAILBOX)
            .with_context(|| format!("Failed to open {}", MAILBOX))?;

        Ok(Self { session })
    }
}

impl<T: Read + Write> MailFetcher<T> {
    /// Sequence numbers of messages received in the last `days` days, oldest first.
    pub fn search_recent(&mut self, days: i64) -> Result<Vec<u32>> {
        let since_date = Utc::now() - chrono::Duration::days(days);
        let query = format!("SINCE {}", since_date.format("%d-%b-%Y"));

        let mut ids: Vec<u32> = self
            .session
            .search(&query)
            .with_context(|| format!("IMAP search failed: {}", query))?
            .into_iter()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Fetches each id in turn and hands it downstream. Blocking; run it off
    /// the async runtime. Dropping `tx` on return closes the channel.
    pub fn stream(
        mut self,
        ids: Vec<u32>,
        tx: mpsc::Sender<FetchedMessage>,
        cancel: CancellationToken,
    ) -> Result<usize> {
        let result = self.stream_inner(&ids, &tx, &cancel);
        drop(tx);
        self.logout();
        result
    }

    /// Ends the session. Failures are only logged; nothing is left to flush.
    pub fn logout(mut self) {
        if let Err(e) = self.session.logout() {
            tracing::debug!(error = %e, "IMAP logout failed");
        }
    }

    fn stream_inner(
        &mut self,
        ids: &[u32],
        tx: &mpsc::Sender<FetchedMessage>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut sent = 0;
        for &seq in ids {
            if cancel.is_cancelled() {
                tracing::info!("Fetch cancelled");
                break;
            }

            let messages = self
                .session
                .fetch(seq.to_string(), "(INTERNALDATE BODY.PEEK[])")
                .with_context(|| format!("Failed to fetch message {}", seq))?;

            for message in messages.iter() {
                let Some(body) = message.body() else {
                    tracing::debug!(seq, "message has no body section, skipping");
                    continue;
                };
                let fetched = FetchedMessage {
                    seq,
                    raw: body.to_vec(),
                    internal_date: message.internal_date().map(|d| d.with_timezone(&Utc)),
                };
                if tx.blocking_send(fetched).is_err() {
                    // downstream is gone
                    return Ok(sent);
                }
                sent += 1;
            }
        }
        Ok(sent)
    }
}

// --- Envelope ---

#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub mailbox: String,
    pub host: String,
}

impl Address {
    fn from_addr(addr: &str) -> Self {
        match addr.rsplit_once('@') {
            Some((mailbox, host)) => Self {
                mailbox: mailbox.to_string(),
                host: host.to_string(),
            },
            None => Self {
                mailbox: addr.to_string(),
                host: String::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub subject: String,
    pub from: Vec<Address>,
    pub date: DateTime<Utc>,
}

impl Envelope {
    /// `None` when the message carries none of the envelope headers.
    fn from_parsed(parsed: &ParsedMail, internal_date: Option<DateTime<Utc>>) -> Option<Self> {
        let headers = &parsed.headers;
        let subject = headers.get_first_value("Subject");
        let from_header = headers.get_first_header("From");
        let date_header = headers.get_first_value("Date");

        if subject.is_none() && from_header.is_none() && date_header.is_none() {
            return None;
        }

        let from = from_header
            .and_then(|h| addrparse_header(h).ok())
            .map(|list| {
                list.iter()
                    .flat_map(|addr| match addr {
                        MailAddr::Single(info) => vec![Address::from_addr(&info.addr)],
                        MailAddr::Group(group) => group
                            .addrs
                            .iter()
                            .map(|info| Address::from_addr(&info.addr))
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let date = date_header
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or(internal_date)
            .unwrap_or_else(|| {
                tracing::warn!("message has no usable date, using now");
                Utc::now()
            });

        Some(Self {
            subject: subject.unwrap_or_default(),
            from,
            date,
        })
    }

    pub fn sender_email(&self) -> String {
        match self.from.first() {
            Some(from) => format!("{}@{}", from.mailbox, from.host),
            None => {
                tracing::warn!(subject = %self.subject, "no sender info in email");
                String::new()
            }
        }
    }
}

// --- Triage ---

const JOB_SUBJECT_KEYWORDS: &[&str] = &[
    "applied",
    "application",
    "thanks for applying",
    "thanks from",
    "follow-up",
    "update",
    "recruiting",
    "thank you for applying",
];

pub fn is_job_email(subject: &str) -> bool {
    let subject = subject.to_lowercase();
    JOB_SUBJECT_KEYWORDS
        .iter()
        .any(|keyword| subject.contains(keyword))
}

/// Turns a fetched message into a `RawEmail` if its subject looks like job
/// correspondence. Unparseable or envelope-less messages are skipped.
pub fn triage(message: &FetchedMessage) -> Option<RawEmail> {
    let parsed = match parse_mail(&message.raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(seq = message.seq, error = %e, "unparseable message, skipping");
            return None;
        }
    };

    let Some(envelope) = Envelope::from_parsed(&parsed, message.internal_date) else {
        tracing::debug!(seq = message.seq, "message has no envelope, skipping");
        return None;
    };

    if !is_job_email(&envelope.subject) {
        return None;
    }

    let body = get_body_text(&parsed);
    let sender_email = envelope.sender_email();
    tracing::debug!(sender = %sender_email, subject = %envelope.subject, "job email matched");

    Some(RawEmail {
        subject: envelope.subject,
        body,
        sender_email,
        date: envelope.date,
    })
}

// --- Body text ---

static HTML_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

pub fn strip_html_tags(html: &str) -> String {
    let text = HTML_TAG_RE.replace_all(html, "");
    text.replace("&nbsp;", " ").trim().to_string()
}

/// First `text/plain` part, else the stripped first `text/html` part, else "".
pub fn get_body_text(parsed: &ParsedMail) -> String {
    let mut html_body: Option<String> = None;

    for part in parsed.parts() {
        let mime_type = part.ctype.mimetype.to_lowercase();
        let is_plain = mime_type.starts_with("text/plain");
        let is_html = mime_type.starts_with("text/html");
        if !is_plain && !(is_html && html_body.is_none()) {
            continue;
        }

        let body = match part.get_body() {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(mime_type = %mime_type, error = %e, "failed to decode part");
                continue;
            }
        };

        if is_plain {
            return body;
        }
        html_body = Some(body);
    }

    match html_body {
        Some(html) => {
            tracing::debug!("no text/plain part, using HTML fallback");
            strip_html_tags(&html)
        }
        None => {
            tracing::warn!("no text/plain or text/html body found");
            String::new()
        }
    }
}
