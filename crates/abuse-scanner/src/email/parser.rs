//! Email body parser.
//!
//! Lifts skylinks and categorical tags out of mixed-format abuse mail. The
//! extraction regexes are heuristic and deliberately kept as-is; they are
//! tuned against a corpus of real provider reports with their obfuscation
//! habits (`hxxps`, `[.]`, whitespace-split URLs).

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use mail_parser::decoders::html::html_to_text;
use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use regex::Regex;
use sea_orm::DatabaseConnection;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::db::entities::email::{self, AbuseReporter, ParseResult, DEFAULT_TAG};
use crate::db::{email_repo, LockClient, LockError, RESOURCE_EMAILS};
use crate::error::{compose_unlock, Result};
use crate::worker::{spawn_ticker, WorkerHandle};

use super::error::EmailError;

/// Frequency with which the parser looks for emails to be parsed.
const PARSE_FREQUENCY: Duration = Duration::from_secs(25);

// Skylinks come in two forms: 46 characters of url-safe base64 and 55
// characters of base32. For each form there is a URL-context regex and a
// prefix-context regex that tolerates the usual obfuscations.
static EXTRACT_SKYLINK_64: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".+?://.+?\..+?/([a-zA-Z0-9-_]{46})").unwrap());
static EXTRACT_SKYLINK_64_2: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(http.+|hxxp.+|\..+|://.+|^)([a-zA-Z0-9-_]{46})(\?.*)?$").unwrap());
static EXTRACT_SKYLINK_32: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i).+?://.*?([a-z0-9]{55})").unwrap());
static EXTRACT_SKYLINK_32_2: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(http.+|hxxp.+|\..+|://.+|^)([a-z0-9]{55})(\?.*)?$").unwrap()
});

static VALIDATE_SKYLINK_64: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z0-9-_]{46})$").unwrap());
static VALIDATE_SKYLINK_32: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([a-z0-9]{55})$").unwrap());

// matches all whitespace
static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static TAG_PHISHING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[Pp]hishing").unwrap());
static TAG_MALWARE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[Mm]alware").unwrap());
static TAG_INFRINGING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[Ii]nfringing").unwrap());
static TAG_COPYRIGHT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[Cc]opyright").unwrap());
static TAG_TERROR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[Tt]error").unwrap());
static TAG_ISLAMIC_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[Ii]slamic [Ss]tate").unwrap());
static TAG_CHILD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[Cc]hild").unwrap());
static TAG_CSAM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"CSAM|csam").unwrap());

/// Periodically scans for unparsed emails and parses them into abuse
/// reports.
pub struct Parser {
    db: DatabaseConnection,
    locks: LockClient,
    server_domain: String,
    sponsor: String,
}

impl Parser {
    pub fn new(
        db: DatabaseConnection,
        locks: LockClient,
        server_domain: String,
        sponsor: String,
    ) -> Self {
        Self {
            db,
            locks,
            server_domain,
            sponsor,
        }
    }

    /// Starts the parse unit.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> WorkerHandle {
        spawn_ticker("parser", PARSE_FREQUENCY, shutdown, move || {
            let parser = Arc::clone(&self);
            async move { parser.parse_messages().await }
        })
    }

    /// One tick: parse every email that has not been parsed yet.
    pub async fn parse_messages(&self) {
        let to_parse = match email_repo::find_unparsed(&self.db).await {
            Ok(emails) => emails,
            Err(err) => {
                error!("Failed fetching unparsed emails, error {}", err);
                return;
            }
        };

        if to_parse.is_empty() {
            debug!("Found 0 unparsed messages");
            return;
        }
        info!("Found {} unparsed messages", to_parse.len());

        for email in to_parse {
            let uid = email.uid.clone();
            if let Err(err) = self.parse_email(email).await {
                error!("Failed to parse email {}, error {}", uid, err);
            }
        }
    }

    /// Parses a single email under its lock.
    pub async fn parse_email(&self, email: email::Model) -> Result<()> {
        let lock = match self.locks.acquire(RESOURCE_EMAILS, &email.uid).await {
            Ok(lock) => lock,
            Err(LockError::Busy) => {
                debug!("email {} is locked, skipping", email.uid);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let res = self.parse_email_locked(&email).await;
        compose_unlock(res, lock.release().await)
    }

    async fn parse_email_locked(&self, email: &email::Model) -> Result<()> {
        // re-check under the lock, another host may have won the record
        let current = match email_repo::find_one(&self.db, &email.uid).await? {
            Some(current) => current,
            None => return Ok(()),
        };
        if current.parsed {
            return Ok(());
        }

        let report = self.build_report(&current)?;
        email_repo::mark_parsed(&self.db, current, report, &self.server_domain).await?;
        Ok(())
    }

    /// Parses the email body into an abuse report carrying the reporter, the
    /// sponsor, the tags and the skylinks.
    pub fn build_report(&self, email: &email::Model) -> std::result::Result<ParseResult, EmailError> {
        if email.body.is_empty() {
            return Err(EmailError::EmptyBody);
        }

        let (skylinks, tags) = parse_body(&email.body)?;

        Ok(ParseResult {
            skylinks,
            reporter: AbuseReporter {
                name: String::new(),
                email: email.sender().to_string(),
                other_contact: String::new(),
            },
            sponsor: self.sponsor.clone(),
            tags,
        })
    }
}

/// Parses raw message bytes into `(skylinks, tags)`. Multipart messages are
/// walked part by part; only parts with an accepted media type are scanned
/// and `text/html` parts are reduced to their text content first. When no
/// tag matches, the default tag is emitted.
pub fn parse_body(raw: &[u8]) -> std::result::Result<(Vec<String>, Vec<String>), EmailError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| EmailError::Mime("could not parse message".to_string()))?;

    let mut skylinks = Vec::new();
    let mut tags = Vec::new();
    collect_from_message(&message, &mut skylinks, &mut tags);

    if tags.is_empty() {
        tags.push(DEFAULT_TAG.to_string());
    }

    Ok((dedupe(skylinks), dedupe(tags)))
}

fn collect_from_message(message: &Message, skylinks: &mut Vec<String>, tags: &mut Vec<String>) {
    for part in &message.parts {
        let text: Cow<str> = match &part.body {
            PartType::Text(text) => Cow::Borrowed(text.as_ref()),
            PartType::Html(html) => Cow::Owned(html_to_text(html.as_ref())),
            PartType::Binary(data) | PartType::InlineBinary(data) => {
                if !should_parse_media_type(part) {
                    continue;
                }
                String::from_utf8_lossy(data.as_ref())
            }
            PartType::Message(nested) => {
                collect_from_message(nested, skylinks, tags);
                continue;
            }
            PartType::Multipart(_) => continue,
        };

        skylinks.extend(extract_skylinks(&text));
        tags.extend(extract_tags(&text));
    }
}

/// Returns true for the media types we scan besides the textual parts:
/// `application/*` and `message/*`. Image and other binary attachments are
/// not searched.
fn should_parse_media_type(part: &mail_parser::MessagePart) -> bool {
    part.content_type().is_some_and(|ct| {
        let ctype = ct.ctype().to_ascii_lowercase();
        ctype.starts_with("application") || ctype.starts_with("message")
    })
}

/// Extracts all skylinks from the given text.
///
/// Every line is scanned twice, once as-is and once with all whitespace
/// removed, because providers habitually break URLs apart to defuse them.
/// Regex matches are candidates only; each one must pass the anchored
/// validation regex and load as a structurally valid [`crate::skylink::Skylink`]
/// before it counts. Output is deduplicated, in canonical form, in
/// first-seen order.
pub fn extract_skylinks(input: &str) -> Vec<String> {
    let mut maybe_skylinks = Vec::new();

    for line in input.lines() {
        let stripped = SPACE.replace_all(line, "");
        for line in [line, stripped.as_ref()] {
            let candidates = EXTRACT_SKYLINK_64
                .captures_iter(line)
                .chain(EXTRACT_SKYLINK_64_2.captures_iter(line))
                .chain(EXTRACT_SKYLINK_32.captures_iter(line))
                .chain(EXTRACT_SKYLINK_32_2.captures_iter(line));
            for caps in candidates {
                for group in caps.iter().flatten() {
                    let candidate = group.as_str();
                    if VALIDATE_SKYLINK_64.is_match(candidate)
                        || VALIDATE_SKYLINK_32.is_match(candidate)
                    {
                        maybe_skylinks.push(candidate.to_string());
                    }
                }
            }
        }
    }

    // canonicalize the candidates, dropping everything that does not load
    let mut skylinks = Vec::new();
    for candidate in maybe_skylinks {
        if let Ok(skylink) = crate::skylink::Skylink::load(&candidate) {
            skylinks.push(skylink.to_string());
        }
    }

    dedupe(skylinks)
}

/// Extracts the set of categorical tags from the given text.
pub fn extract_tags(input: &str) -> Vec<String> {
    let mut tags = Vec::new();
    if TAG_PHISHING.is_match(input) {
        tags.push("phishing".to_string());
    }
    if TAG_MALWARE.is_match(input) {
        tags.push("malware".to_string());
    }
    if TAG_INFRINGING.is_match(input) || TAG_COPYRIGHT.is_match(input) {
        tags.push("copyright".to_string());
    }
    if TAG_TERROR.is_match(input) || TAG_ISLAMIC_STATE.is_match(input) {
        tags.push("terrorism".to_string());
    }
    if TAG_CHILD.is_match(input) || TAG_CSAM.is_match(input) {
        tags.push("csam".to_string());
    }
    tags
}

/// Deduplicates the input, preserving first-seen order.
fn dedupe(input: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    input.into_iter().filter(|v| seen.insert(v.clone())).collect()
}
