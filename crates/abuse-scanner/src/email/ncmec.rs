//! NCMEC reporting client.
//!
//! Wraps the three endpoints of the authority's idempotent two-call API:
//! `/status` (reachability probe), `/submit` (open a report, returns the
//! authority-assigned report id) and `/finish` (complete the submission).
//! Credentials select between the production and the test API; a debug
//! client can never reach production.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::require_env;
use crate::error::ConfigError;

/// Base URI of NCMEC's production API.
const NCMEC_BASE_URI: &str = "https://report.cybertip.org/ispws";

/// Base URI of NCMEC's test API.
const NCMEC_TEST_BASE_URI: &str = "https://exttest.cybertip.org/ispws";

/// Custom status code NCMEC uses when everything is ok.
pub const NCMEC_STATUS_OK: u64 = 0;

/// Custom status code NCMEC uses when report validation fails.
pub const NCMEC_STATUS_VALIDATION_FAILED: u64 = 4100;

/// Incident type filed for every report.
pub const NCMEC_INCIDENT_TYPE: &str =
    "Child Pornography (possession, manufacture, and distribution)";

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SCHEMA_LOCATION: &str = "https://report.cybertip.org/ispws/xsd";

/// Errors raised by the NCMEC client.
#[derive(Error, Debug)]
pub enum NcmecError {
    #[error("NCMEC request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode NCMEC response: {0}")]
    Xml(String),

    #[error("unexpected response code {0}")]
    ResponseCode(u64),
}

/// Credentials required to authenticate with NCMEC's API.
#[derive(Clone)]
pub struct NcmecCredentials {
    pub username: String,
    pub password: SecretString,

    /// When set, reports go to NCMEC's test API instead of production.
    pub debug: bool,
}

impl NcmecCredentials {
    /// Loads the credentials from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let debug = require_env("NCMEC_DEBUG")?
            .parse::<bool>()
            .map_err(|_| ConfigError::InvalidBool("NCMEC_DEBUG".to_string()))?;
        Ok(Self {
            username: require_env("NCMEC_USERNAME")?,
            password: SecretString::from(require_env("NCMEC_PASSWORD")?),
            debug,
        })
    }
}

/// Identity of the reporting party, loaded from the environment so it stays
/// configurable per deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcmecReporter {
    #[serde(rename = "reportingPerson")]
    pub reporting_person: NcmecPerson,
}

impl NcmecReporter {
    /// Loads the reporter identity from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            reporting_person: NcmecPerson {
                first_name: require_env("NCMEC_REPORTER_FIRSTNAME")?,
                last_name: require_env("NCMEC_REPORTER_LASTNAME")?,
                email: require_env("NCMEC_REPORTER_EMAIL")?,
            },
        })
    }
}

/// A person in the report schema.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcmecPerson {
    #[serde(rename = "firstName", default)]
    pub first_name: String,
    #[serde(rename = "lastName", default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
}

/// The incident report expected by NCMEC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "report")]
pub struct Report {
    #[serde(rename = "@xmlns:xsi")]
    pub xsi: String,
    #[serde(rename = "@xsi:noNamespaceSchemaLocation")]
    pub no_namespace_schema_location: String,

    #[serde(rename = "incidentSummary")]
    pub incident_summary: IncidentSummary,
    #[serde(rename = "internetDetails")]
    pub internet_details: InternetDetails,
    pub reporter: NcmecReporter,

    /// Absent for anonymous uploads.
    #[serde(rename = "personOrUserReported", skip_serializing_if = "Option::is_none")]
    pub uploader: Option<ReportedPerson>,
}

impl Report {
    /// Stamps the schema attributes NCMEC requires on the root element.
    pub fn with_schema_attributes(mut self) -> Self {
        self.xsi = XSI_NAMESPACE.to_string();
        self.no_namespace_schema_location = SCHEMA_LOCATION.to_string();
        self
    }

    /// Serializes the report to its XML payload.
    pub fn to_xml(&self) -> Result<String, NcmecError> {
        quick_xml::se::to_string(self).map_err(|e| NcmecError::Xml(e.to_string()))
    }

    /// Parses a report back from its XML payload.
    pub fn from_xml(xml: &str) -> Result<Self, NcmecError> {
        quick_xml::de::from_str(xml).map_err(|e: quick_xml::DeError| NcmecError::Xml(e.to_string()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentSummary {
    #[serde(rename = "incidentType")]
    pub incident_type: String,
    #[serde(rename = "incidentDateTime")]
    pub incident_date_time: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternetDetails {
    #[serde(rename = "webPageIncident")]
    pub web_page_incident: WebPageIncident,
}

/// The urls at which abusive content was found. The content is hosted by
/// third parties reachable through the portal, hence the attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebPageIncident {
    #[serde(rename = "@thirdPartyHostedContent")]
    pub third_party_hosted_content: bool,
    #[serde(default)]
    pub url: Vec<String>,
}

/// The reported uploader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedPerson {
    #[serde(rename = "personOrUserReportedPerson")]
    pub user_reported: NcmecPerson,
    #[serde(rename = "ipCaptureEvent", default)]
    pub ip_capture_event: Vec<IpCaptureEvent>,
    #[serde(rename = "additionalInfo", default)]
    pub additional_info: String,
}

/// An upload event for which an IP address is on file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpCaptureEvent {
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "eventName")]
    pub event_name: String,
    #[serde(rename = "dateTime")]
    pub date: String,
}

/// Response returned when opening a report (and by the status probe).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    #[serde(default)]
    pub response_code: u64,
    #[serde(default)]
    pub response_description: String,
    #[serde(default)]
    pub report_id: u64,
}

/// Response returned when finishing a report.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDoneResponse {
    #[serde(default)]
    pub response_code: u64,
    #[serde(default)]
    pub report_id: u64,
}

/// Seam for the authority API so tests can substitute a mock.
#[async_trait]
pub trait AuthorityApi: Send + Sync {
    /// Probes whether the authority is reachable and willing.
    async fn status(&self) -> Result<ReportResponse, NcmecError>;

    /// Phase A: opens a report by submitting the serialized XML payload.
    async fn open_report(&self, xml: &str) -> Result<ReportResponse, NcmecError>;

    /// Phase B: completes the submission for the given report id.
    async fn finish_report(&self, report_id: u64) -> Result<ReportDoneResponse, NcmecError>;
}

/// Decodes an XML response body into the given response type.
fn decode_response<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, NcmecError> {
    quick_xml::de::from_str(body).map_err(|e: quick_xml::DeError| NcmecError::Xml(e.to_string()))
}

/// HTTP client for NCMEC's API.
pub struct NcmecClient {
    authorization: String,
    base_uri: &'static str,
    client: reqwest::Client,
}

impl NcmecClient {
    /// Creates a client for the API selected by the credentials. Debug
    /// credentials yield a client that is wired to the test API only.
    pub fn new(credentials: &NcmecCredentials, client: reqwest::Client) -> Self {
        let base_uri = if credentials.debug {
            NCMEC_TEST_BASE_URI
        } else {
            NCMEC_BASE_URI
        };
        let token = BASE64_STANDARD.encode(format!(
            "{}:{}",
            credentials.username,
            credentials.password.expose_secret()
        ));
        Self {
            authorization: format!("Basic {}", token),
            base_uri,
            client,
        }
    }

    /// Returns the base URI this client is wired to.
    pub fn base_uri(&self) -> &str {
        self.base_uri
    }
}

#[async_trait]
impl AuthorityApi for NcmecClient {
    async fn status(&self) -> Result<ReportResponse, NcmecError> {
        let res = self
            .client
            .get(format!("{}/status", self.base_uri))
            .header(AUTHORIZATION, &self.authorization)
            .send()
            .await?;
        let body = res.text().await?;
        decode_response(&body)
    }

    async fn open_report(&self, xml: &str) -> Result<ReportResponse, NcmecError> {
        let body = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", xml);
        let res = self
            .client
            .post(format!("{}/submit", self.base_uri))
            .header(AUTHORIZATION, &self.authorization)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;
        let body = res.text().await?;
        decode_response(&body)
    }

    async fn finish_report(&self, report_id: u64) -> Result<ReportDoneResponse, NcmecError> {
        let res = self
            .client
            .post(format!("{}/finish", self.base_uri))
            .header(AUTHORIZATION, &self.authorization)
            .form(&[("id", report_id.to_string())])
            .send()
            .await?;
        let body = res.text().await?;
        decode_response(&body)
    }
}
