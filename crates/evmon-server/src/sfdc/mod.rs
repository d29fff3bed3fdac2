//! Remote system client
//!
//! Holds one lazily established session and exposes the three calls the
//! ingestion jobs need: log file queries, raw log downloads and the session
//! itself for the push channel.

use async_trait::async_trait;
use evmon_common::types::EventLogFile;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::SfdcConfig;

mod login;

pub use login::AuthMechanism;

/// Request timeout for query and download calls
const REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum SfdcError {
    #[error("Unknown auth mechanism '{0}'")]
    UnknownAuthMechanism(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Session expired or was revoked")]
    SessionExpired,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl SfdcError {
    /// Credentials were rejected or the session is no longer valid
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SfdcError::Authentication(_) | SfdcError::SessionExpired | SfdcError::UnknownAuthMechanism(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SfdcError>;

/// An authenticated session
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    /// Scheme, host and port of the instance serving this session
    pub instance_url: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

/// The calls polling jobs and pipeline steps make against the remote system
#[async_trait]
pub trait EventLogApi: Send + Sync {
    /// Establish a session unless one already exists
    async fn ensure_authenticated(&self) -> Result<()>;

    /// Run a SOQL query and return every record across all result pages
    async fn query(&self, soql: &str) -> Result<Vec<Map<String, Value>>>;

    /// Download the raw content of a log file
    async fn fetch_log_file(&self, file: &EventLogFile) -> Result<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    total_size: u64,
    done: bool,
    #[serde(default)]
    records: Vec<Map<String, Value>>,
    next_records_url: Option<String>,
}

pub struct SfdcClient {
    http: Client,
    config: SfdcConfig,
    session: Mutex<Option<Session>>,
}

impl SfdcClient {
    pub fn new(config: SfdcConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(format!("{}/{}", config.client_name, env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SfdcConfig {
        &self.config
    }

    /// The current session, logging in first if there is none
    pub async fn session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let session = login::login(&self.http, &self.config).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached session so the next call logs in again
    pub async fn invalidate_session(&self) {
        if self.session.lock().await.take().is_some() {
            tracing::warn!("Remote session invalidated");
        }
    }

    pub fn data_url(&self, session: &Session, path: &str) -> String {
        format!("{}/services/data/v{}{}", session.instance_url, self.config.api_version, path)
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Response> {
        let session = self.session().await?;

        let response = self
            .http
            .get(url)
            .bearer_auth(&session.access_token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_session().await;
            return Err(SfdcError::SessionExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SfdcError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn get_page(&self, url: &str, query: &[(&str, &str)]) -> Result<QueryPage> {
        let response = self.get(url, query).await?;
        response
            .json()
            .await
            .map_err(|e| SfdcError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl EventLogApi for SfdcClient {
    async fn ensure_authenticated(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn query(&self, soql: &str) -> Result<Vec<Map<String, Value>>> {
        let session = self.session().await?;
        let url = self.data_url(&session, "/query");

        let mut page = self.get_page(&url, &[("q", soql)]).await?;
        let total = page.total_size;
        let mut records = std::mem::take(&mut page.records);

        while !page.done {
            let Some(next) = page.next_records_url.take() else {
                return Err(SfdcError::MalformedResponse(
                    "query page is not done but has no nextRecordsUrl".into(),
                ));
            };
            let url = format!("{}{}", session.instance_url, next);
            page = self.get_page(&url, &[]).await?;
            records.append(&mut page.records);
        }

        tracing::debug!(total, fetched = records.len(), "Query completed");

        Ok(records)
    }

    async fn fetch_log_file(&self, file: &EventLogFile) -> Result<String> {
        let session = self.session().await?;
        let url = format!("{}{}", session.instance_url, file.log_file);

        let content = self.get(&url, &[]).await?.text().await?;

        tracing::debug!(
            id = %file.id,
            event_type = %file.event_type,
            bytes = content.len(),
            "Downloaded log file"
        );

        Ok(content)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn login_body(server: &MockServer) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>
    <loginResponse>
      <result>
        <serverUrl>{}/services/Soap/u/47.0/00D000000000001</serverUrl>
        <sessionId>SESSION</sessionId>
      </result>
    </loginResponse>
  </soapenv:Body>
</soapenv:Envelope>"#,
            server.uri()
        )
    }

    async fn mount_login(server: &MockServer, times: u64) {
        Mock::given(method("POST"))
            .and(path("/services/Soap/u/47.0"))
            .and(body_string_contains("<username>monitor@example.com</username>"))
            .and(body_string_contains("<password>secretTOKEN</password>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(login_body(server)))
            .expect(times)
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> SfdcClient {
        SfdcClient::new(SfdcConfig {
            username: "monitor@example.com".into(),
            password: "secret".into(),
            security_token: "TOKEN".into(),
            login_url: Some(server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    fn descriptor(log_file: &str) -> EventLogFile {
        EventLogFile::from_record(
            json!({
                "Id": "0AT1",
                "EventType": "API",
                "LogFile": log_file,
                "LogFileFieldNames": "EVENT_TYPE",
                "LogFileFieldTypes": "String"
            })
            .as_object()
            .unwrap()
            .clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_once_per_session() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;

        let client = client(&server);
        client.ensure_authenticated().await.unwrap();
        let session = client.session().await.unwrap();

        assert_eq!(session.access_token, "SESSION");
        assert_eq!(session.instance_url, server.uri());
    }

    #[tokio::test]
    async fn test_login_fault_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/Soap/u/47.0"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"><soapenv:Body><soapenv:Fault><faultcode>INVALID_LOGIN</faultcode><faultstring>INVALID_LOGIN: bad password</faultstring></soapenv:Fault></soapenv:Body></soapenv:Envelope>"#,
            ))
            .mount(&server)
            .await;

        let err = client(&server).ensure_authenticated().await.unwrap_err();
        assert!(err.is_auth_failure());
        assert!(err.to_string().contains("INVALID_LOGIN: bad password"));
    }

    #[tokio::test]
    async fn test_unknown_auth_mechanism() {
        let client = SfdcClient::new(SfdcConfig {
            auth: "oauth2".into(),
            ..Default::default()
        })
        .unwrap();

        let err = client.ensure_authenticated().await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown auth mechanism 'oauth2'");
    }

    #[tokio::test]
    async fn test_query_follows_pagination() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/services/data/v47.0/query"))
            .and(query_param("q", "select Id from EventLogFile"))
            .and(header("authorization", "Bearer SESSION"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 2,
                "done": false,
                "nextRecordsUrl": "/services/data/v47.0/query/01g-2000",
                "records": [{ "attributes": { "type": "EventLogFile" }, "Id": "0AT1" }]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/services/data/v47.0/query/01g-2000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 2,
                "done": true,
                "records": [{ "attributes": { "type": "EventLogFile" }, "Id": "0AT2" }]
            })))
            .mount(&server)
            .await;

        let records = client(&server).query("select Id from EventLogFile").await.unwrap();

        let ids: Vec<_> = records.iter().map(|r| r["Id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["0AT1", "0AT2"]);
    }

    #[tokio::test]
    async fn test_fetch_log_file() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;

        let log_path = "/services/data/v47.0/sobjects/EventLogFile/0AT1/LogFile";
        Mock::given(method("GET"))
            .and(path(log_path))
            .and(header("authorization", "Bearer SESSION"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("\"EVENT_TYPE\"\n\"API\"\n"),
            )
            .mount(&server)
            .await;

        let content = client(&server).fetch_log_file(&descriptor(log_path)).await.unwrap();
        assert_eq!(content, "\"EVENT_TYPE\"\n\"API\"\n");
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates_session() {
        let server = MockServer::start().await;
        mount_login(&server, 2).await;

        Mock::given(method("GET"))
            .and(path("/services/data/v47.0/query"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!([
                { "errorCode": "INVALID_SESSION_ID", "message": "Session expired or invalid" }
            ])))
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client.query("select Id from EventLogFile").await.unwrap_err();
        assert!(matches!(err, SfdcError::SessionExpired));

        // Next call logs in again
        client.ensure_authenticated().await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_carries_status() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/services/data/v47.0/query"))
            .respond_with(ResponseTemplate::new(400).set_body_string("MALFORMED_QUERY"))
            .mount(&server)
            .await;

        let err = client(&server).query("select").await.unwrap_err();
        match err {
            SfdcError::Api { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "MALFORMED_QUERY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
