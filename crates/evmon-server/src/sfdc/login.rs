// SOAP username/password login

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use std::str::FromStr;
use url::Url;

use super::{Result, Session, SfdcError};
use crate::config::SfdcConfig;

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const PARTNER_NS: &str = "urn:partner.soap.sforce.com";

/// Supported ways of establishing a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// Username plus password and security token
    UserPass,
}

impl FromStr for AuthMechanism {
    type Err = SfdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "userpass" => Ok(AuthMechanism::UserPass),
            other => Err(SfdcError::UnknownAuthMechanism(other.to_string())),
        }
    }
}

pub(super) fn soap_endpoint(config: &SfdcConfig) -> String {
    format!(
        "{}/services/Soap/u/{}",
        config.login_url().trim_end_matches('/'),
        config.api_version
    )
}

pub(super) fn login_envelope(username: &str, password: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<se:Envelope xmlns:se="{SOAP_ENVELOPE_NS}">
  <se:Header/>
  <se:Body>
    <login xmlns="{PARTNER_NS}">
      <username>{}</username>
      <password>{}</password>
    </login>
  </se:Body>
</se:Envelope>"#,
        quick_xml::escape::escape(username),
        quick_xml::escape::escape(password),
    )
}

pub(super) async fn login(http: &Client, config: &SfdcConfig) -> Result<Session> {
    match AuthMechanism::from_str(&config.auth)? {
        AuthMechanism::UserPass => userpass_login(http, config).await,
    }
}

async fn userpass_login(http: &Client, config: &SfdcConfig) -> Result<Session> {
    let endpoint = soap_endpoint(config);
    let password = format!("{}{}", config.password, config.security_token);

    tracing::info!(
        username = %config.username,
        endpoint = %endpoint,
        "Logging in to remote system"
    );

    let response = http
        .post(&endpoint)
        .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .header("SOAPAction", "login")
        .body(login_envelope(&config.username, &password))
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    let fields = parse_login_response(&body)?;

    if let Some(fault) = fields.fault {
        return Err(SfdcError::Authentication(fault));
    }
    if !status.is_success() {
        return Err(SfdcError::Authentication(format!("login returned {}", status)));
    }

    let access_token = fields
        .session_id
        .ok_or_else(|| SfdcError::MalformedResponse("login response has no sessionId".into()))?;
    let server_url = fields
        .server_url
        .ok_or_else(|| SfdcError::MalformedResponse("login response has no serverUrl".into()))?;

    let instance_url = Url::parse(&server_url)?.origin().ascii_serialization();

    tracing::info!(instance_url = %instance_url, "Remote session established");

    Ok(Session {
        access_token,
        instance_url,
    })
}

#[derive(Debug, Default)]
pub(super) struct LoginFields {
    pub session_id: Option<String>,
    pub server_url: Option<String>,
    pub fault: Option<String>,
}

/// Pull `sessionId`, `serverUrl` and any `faultstring` out of a SOAP response
pub(super) fn parse_login_response(xml: &str) -> Result<LoginFields> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = LoginFields::default();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| SfdcError::MalformedResponse(e.to_string()))?
                    .into_owned();
                match current.as_deref() {
                    Some("sessionId") => fields.session_id = Some(value),
                    Some("serverUrl") => fields.server_url = Some(value),
                    Some("faultstring") => fields.fault = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(SfdcError::MalformedResponse(e.to_string())),
        }
    }

    Ok(fields)
}
