//! Access-log line parsing.
//!
//! Lines emitted by the edge logging endpoint look like
//!
//! ```text
//! <134>2021-01-07T20:54:56Z cache-iad2120 linehaul[411617]: 2@download|Thu, 07 Jan 2021 20:54:56 GMT|US|/packages/.../requests-2.25.1-py2.py3-none-any.whl|TLSv1.2|ECDHE-RSA-AES128-GCM-SHA256|requests|2.25.1|bdist_wheel|pip/20.1.1 {"installer":{"name":"pip","version":"20.1.1"}}
//! ```
//!
//! The syslog header and the `<n>@` format marker are optional.

use crate::events::{Details, Download, Event, File, Installer, SimpleRequest};
use chrono::{DateTime, Utc};
use thiserror::Error;

const FIELD_COUNT: usize = 10;
const NULL_FIELD: &str = "(null)";

/// Installers identified by the leading `name/version` token of a user agent
const KNOWN_INSTALLERS: &[&str] = &[
    "pip",
    "bandersnatch",
    "setuptools",
    "Python-urllib",
    "requests",
    "uv",
    "poetry",
    "pdm",
    "conda",
    "Bazel",
    "devpi",
    "z3c.pypimirror",
    "Artifactory",
    "Nexus",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("expected {FIELD_COUNT} fields, found {0}")]
    FieldCount(usize),

    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("malformed user agent details: {0}")]
    UserAgent(String),
}

/// Turns one log line (without its line terminator) into an event.
///
/// `Ok(None)` means the line is well-formed but not something we load.
#[cfg_attr(test, mockall::automock)]
pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> Result<Option<Event>, ParseError>;
}

/// Parser for the pipe-delimited edge access-log format
#[derive(Debug, Clone, Copy, Default)]
pub struct FastlyLineParser;

impl LineParser for FastlyLineParser {
    fn parse(&self, line: &str) -> Result<Option<Event>, ParseError> {
        let body = strip_format_marker(strip_syslog_header(line));

        let fields: Vec<&str> = body.splitn(FIELD_COUNT, '|').collect();
        if fields.len() != FIELD_COUNT {
            return Err(ParseError::FieldCount(fields.len()));
        }

        let kind = fields[0].trim();
        if kind != "simple" && kind != "download" {
            return Ok(None);
        }

        let timestamp = parse_timestamp(fields[1])?;
        let country_code = optional(fields[2]).map(str::to_string);
        let url = optional(fields[3]).ok_or(ParseError::MissingField("url"))?;
        let tls_protocol = optional(fields[4]).map(str::to_string);
        let tls_cipher = optional(fields[5]).map(str::to_string);
        let project = optional(fields[6]);

        let Some(details) = parse_user_agent(fields[9])? else {
            return Ok(None);
        };

        let event = if kind == "simple" {
            let project = simple_project(url)
                .or(project)
                .ok_or(ParseError::MissingField("project"))?;
            Event::Simple(SimpleRequest {
                timestamp,
                url: url.to_string(),
                project: project.to_string(),
                tls_protocol,
                tls_cipher,
                country_code,
                details: Some(details),
            })
        } else {
            let project = project.ok_or(ParseError::MissingField("project"))?;
            let version = optional(fields[7]).ok_or(ParseError::MissingField("version"))?;
            let package_type =
                optional(fields[8]).ok_or(ParseError::MissingField("package_type"))?;
            let filename = filename(url).ok_or(ParseError::MissingField("filename"))?;
            Event::Download(Download {
                timestamp,
                url: url.to_string(),
                project: project.to_string(),
                file: File {
                    filename: filename.to_string(),
                    project: project.to_string(),
                    version: version.to_string(),
                    package_type: package_type.to_string(),
                },
                tls_protocol,
                tls_cipher,
                country_code,
                details: Some(details),
            })
        };

        Ok(Some(event))
    }
}

/// Drop a leading `<pri>... tag[pid]: ` header. The header never contains a
/// field separator, so a `]: ` after the first `|` belongs to the payload.
fn strip_syslog_header(line: &str) -> &str {
    match line.split_once("]: ") {
        Some((header, rest)) if header.starts_with('<') && !header.contains('|') => rest,
        _ => line,
    }
}

fn strip_format_marker(body: &str) -> &str {
    match body.split_once('@') {
        Some((marker, rest)) if !marker.is_empty() && marker.bytes().all(|b| b.is_ascii_digit()) => {
            rest
        }
        _ => body,
    }
}

fn optional(field: &str) -> Option<&str> {
    let field = field.trim();
    if field.is_empty() || field == NULL_FIELD {
        None
    } else {
        Some(field)
    }
}

fn parse_timestamp(field: &str) -> Result<DateTime<Utc>, ParseError> {
    let field = field.trim();
    DateTime::parse_from_rfc2822(field)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ParseError::Timestamp(field.to_string()))
}

/// Project named by a `/simple/<project>/` index URL
fn simple_project(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let rest = path.strip_prefix("/simple/")?;
    let project = rest.split('/').next()?;
    (!project.is_empty()).then_some(project)
}

fn filename(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

/// Extract client details from a user agent.
///
/// `Ok(None)` for absent or unrecognized agents.
fn parse_user_agent(field: &str) -> Result<Option<Details>, ParseError> {
    let Some(agent) = optional(field) else {
        return Ok(None);
    };

    let (product, rest) = match agent.split_once(' ') {
        Some((product, rest)) => (product, rest.trim_start()),
        None => (agent, ""),
    };

    if rest.starts_with('{') {
        let details: Details =
            serde_json::from_str(rest).map_err(|e| ParseError::UserAgent(e.to_string()))?;
        return Ok(Some(details));
    }

    let (name, version) = match product.split_once('/') {
        Some((name, version)) => (name, optional(version)),
        None => (product, None),
    };

    let name = if name == "Mozilla" {
        "Browser"
    } else if KNOWN_INSTALLERS.contains(&name) {
        name
    } else {
        return Ok(None);
    };

    Ok(Some(Details {
        installer: Some(Installer {
            name: Some(name.to_string()),
            version: if name == "Browser" {
                None
            } else {
                version.map(str::to_string)
            },
        }),
        ..Default::default()
    }))
}
