//! Detection templates
//!
//! A [`RawTemplate`] is an id plus YAML source text. Jobs load raw templates
//! once per entry and ask the per-entry [`cache::TemplateCache`] for the
//! parsed form only when a template is about to run.

pub mod cache;
pub mod loader;
pub mod matcher;
pub mod parser;

use crate::network::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use cache::TemplateCache;
pub use loader::{DirectorySource, FnSource, TemplateSource};
pub use matcher::{Condition, MatchOutcome, Matcher, MatcherKind, MatcherSet, Part, Response};
pub use parser::parse_template;

/// Unparsed template: identifier and verbatim source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTemplate {
    pub id: String,
    pub original: String,
}

impl RawTemplate {
    pub fn new(id: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            original: original.into(),
        }
    }
}

/// Descriptive metadata, copied into findings untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub author: String,
    pub severity: String,
    pub description: String,
    pub reference: Vec<String>,
    pub classification: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

/// One payload written to a TCP connection
#[derive(Debug, Clone, PartialEq)]
pub enum TcpPayload {
    /// Decoded at parse time
    Bytes(Vec<u8>),
    /// Text with placeholders, expanded per target
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpInput {
    pub payload: TcpPayload,
    /// Bytes to read right after this input is written
    pub read: Option<usize>,
}

/// A `tcp` (or `network`) request block
#[derive(Debug, Clone)]
pub struct TcpRequest {
    pub inputs: Vec<TcpInput>,
    /// Ports from `port` and from `host:port` entries, sorted
    pub ports: Vec<u16>,
    /// Host entries that could be used (plain, not `tls://`)
    pub plain_hosts: usize,
    /// `tls://` host entries, which are not supported
    pub tls_hosts: usize,
    pub read_size: usize,
    pub matchers: MatcherSet,
}

/// An `http` (or `requests`) block
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub paths: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub redirects: bool,
    pub max_redirects: usize,
    pub max_size: usize,
    pub port: Option<u16>,
    pub matchers: MatcherSet,
}

/// A template ready to run
#[derive(Debug, Clone)]
pub struct ParsedTemplate {
    pub id: String,
    pub info: TemplateInfo,
    pub tcp: Vec<TcpRequest>,
    pub http: Vec<HttpRequest>,
}

impl ParsedTemplate {
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::new();
        if !self.tcp.is_empty() {
            protocols.push(Protocol::Tcp);
        }
        if !self.http.is_empty() {
            protocols.push(Protocol::Http);
        }
        protocols
    }
}
