//! Abuse email entity.
//!
//! One row per mailbox message, keyed by the composite id
//! `<mailbox>-<uidvalidity>-<uid>`. The row is created by the fetcher and
//! then advanced through the stage flags `parsed -> blocked -> (reported) ->
//! finalized`, each stage stamping who did the work and when.

use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

/// Block outcome recorded when a skylink was blocked successfully.
pub const STATUS_BLOCKED: &str = "BLOCKED";

/// Tag used when no category matched the email body.
pub const DEFAULT_TAG: &str = "abusive";

/// Tag that routes an email into the NCMEC reporter.
pub const TAG_CSAM: &str = "csam";

// Notice appended to every summary reply.
const LEGAL_NOTICE: &str = "
Please note that no content is stored on our servers, but rather on a decentralised network of hosts.
Therefore we are not to be held accountable for any potential abusive content it might contain.
We will, however, do everything in our power to block access from said content when it gets reported.

Thank you for your report.
";

/// Abuse email entity model.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "emails")]
pub struct Model {
    /// Composite id `<mailbox>-<uidvalidity>-<uid>`. Stable for as long as
    /// the mailbox keeps its uidvalidity; a uidvalidity change re-admits the
    /// message under a new id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub uid: String,

    /// The server-assigned numeric uid within the mailbox.
    pub uid_raw: i64,

    /// Raw message bytes, capped to an 8 MiB prefix at admission.
    pub body: Vec<u8>,

    pub subject: String,
    pub message_id: String,
    pub from_address: String,
    pub reply_to: String,
    pub to_address: String,

    /// True for self-originated or bodyless messages; those rows are
    /// persisted with every flag forced terminal so they never re-enter the
    /// pipeline.
    pub skip: bool,

    pub inserted_by: String,
    pub inserted_at: DateTimeUtc,

    pub parsed: bool,
    pub parsed_at: Option<DateTimeUtc>,
    pub parsed_by: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub parse_result: Option<ParseResult>,

    pub blocked: bool,
    pub blocked_at: Option<DateTimeUtc>,
    pub blocked_by: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub block_result: Option<BlockResult>,

    pub finalized: bool,
    pub finalized_at: Option<DateTimeUtc>,
    pub finalized_by: Option<String>,

    pub reported: bool,
    pub reported_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Result of parsing an email body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct ParseResult {
    /// Extracted skylinks, deduplicated and in canonical form.
    pub skylinks: Vec<String>,
    pub reporter: AbuseReporter,
    pub sponsor: String,
    pub tags: Vec<String>,
}

impl ParseResult {
    /// Returns true if the parse result carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Contact information of the reporting party, forwarded to the blocker API.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct AbuseReporter {
    pub name: String,
    pub email: String,
    pub other_contact: String,
}

/// Ordered per-skylink block outcomes; same length as the skylinks in the
/// parse result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct BlockResult(pub Vec<String>);

impl Model {
    /// True when the parse result carries the csam tag.
    pub fn is_csam(&self) -> bool {
        self.parse_result
            .as_ref()
            .is_some_and(|pr| pr.has_tag(TAG_CSAM))
    }

    /// The address the automated reply goes to, Reply-To when present.
    pub fn sender(&self) -> &str {
        if self.reply_to.is_empty() {
            &self.from_address
        } else {
            &self.reply_to
        }
    }

    /// True when the email was handled without a hitch: at least one skylink
    /// was found and every single one was blocked.
    pub fn is_success(&self) -> bool {
        if !self.parsed || !self.blocked {
            return false;
        }
        let (blocked, not_blocked) = self.block_split();
        !blocked.is_empty() && not_blocked.is_empty()
    }

    /// Splits the skylinks into the ones that were blocked and the ones that
    /// were not, based on the recorded block outcomes.
    pub fn block_split(&self) -> (Vec<&str>, Vec<&str>) {
        let skylinks = self
            .parse_result
            .as_ref()
            .map(|pr| pr.skylinks.as_slice())
            .unwrap_or_default();
        let outcomes = self
            .block_result
            .as_ref()
            .map(|br| br.0.as_slice())
            .unwrap_or_default();

        let mut blocked = Vec::new();
        let mut not_blocked = Vec::new();
        for (skylink, outcome) in skylinks.iter().zip(outcomes) {
            if outcome == STATUS_BLOCKED {
                blocked.push(skylink.as_str());
            } else {
                not_blocked.push(skylink.as_str());
            }
        }
        (blocked, not_blocked)
    }

    /// Renders the summary reply for this email. Three cases: no recognizable
    /// links, all links blocked, or a mix of blocked and unblocked links.
    pub fn summary(&self) -> String {
        let (blocked, not_blocked) = self.block_split();

        if blocked.is_empty() && not_blocked.is_empty() {
            return format!(
                "\nHello,\n\nwe have processed your report but were unable to find any valid links.\nPlease verify the link is not corrupted as we need it in order to prevent access to it from our portals.\n{}",
                LEGAL_NOTICE
            );
        }

        let mut out = String::from("Hello,\n\n");
        if !blocked.is_empty() {
            let blocked_at = self
                .blocked_at
                .map(|at| at.format("%a %b %e %H:%M:%S %Y").to_string())
                .unwrap_or_default();
            out.push_str(&format!(
                "the following links were identified and blocked on all of our servers as of {}\n\n",
                blocked_at
            ));
            for skylink in &blocked {
                out.push_str(&format!("- {}\n", skylink));
            }
        }
        if !not_blocked.is_empty() {
            out.push_str("\nthe following links could not be blocked:\n\n");
            for skylink in &not_blocked {
                out.push_str(&format!("- {}\n", skylink));
            }
        }
        out.push_str(LEGAL_NOTICE);
        out
    }
}
