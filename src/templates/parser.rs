//! YAML template parsing and validation

use super::matcher::{Condition, Matcher, MatcherKind, MatcherSet, Part};
use super::{HttpRequest, ParsedTemplate, RawTemplate, TcpInput, TcpPayload, TcpRequest, TemplateInfo};
use crate::error::TemplateParseError;
use regex::RegexBuilder;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Bytes read from a TCP response when `read-size` is absent
pub const DEFAULT_READ_SIZE: usize = 1024;

/// Cap on an HTTP body when `max-size` is absent
pub const DEFAULT_MAX_BODY: usize = 1024 * 1024;

const DEFAULT_MAX_REDIRECTS: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(value) => vec![value],
            StringOrList::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct TemplateDoc {
    id: Option<String>,
    #[serde(default)]
    info: InfoDoc,
    #[serde(default, alias = "network")]
    tcp: Vec<TcpDoc>,
    #[serde(default, alias = "requests")]
    http: Vec<HttpDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct InfoDoc {
    name: Option<String>,
    author: Option<String>,
    severity: Option<String>,
    description: Option<String>,
    reference: Option<StringOrList>,
    classification: Option<BTreeMap<String, serde_yaml::Value>>,
    metadata: Option<BTreeMap<String, serde_yaml::Value>>,
    tags: Option<StringOrList>,
}

#[derive(Debug, Deserialize)]
struct InputDoc {
    data: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    read: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TcpDoc {
    #[serde(default)]
    inputs: Vec<InputDoc>,
    host: Option<StringOrList>,
    port: Option<PortValue>,
    #[serde(rename = "read-size")]
    read_size: Option<usize>,
    #[serde(rename = "matchers-condition")]
    matchers_condition: Option<String>,
    #[serde(default)]
    matchers: Vec<MatcherDoc>,
}

#[derive(Debug, Deserialize)]
struct HttpDoc {
    method: Option<String>,
    path: Option<StringOrList>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    body: Option<String>,
    #[serde(default)]
    redirects: bool,
    #[serde(rename = "max-redirects")]
    max_redirects: Option<usize>,
    #[serde(rename = "max-size")]
    max_size: Option<usize>,
    port: Option<PortValue>,
    #[serde(rename = "matchers-condition")]
    matchers_condition: Option<String>,
    #[serde(default)]
    matchers: Vec<MatcherDoc>,
}

#[derive(Debug, Deserialize)]
struct MatcherDoc {
    #[serde(rename = "type")]
    kind: String,
    part: Option<String>,
    name: Option<String>,
    #[serde(default)]
    words: Vec<String>,
    #[serde(default)]
    regex: Vec<String>,
    #[serde(default)]
    binary: Vec<String>,
    #[serde(default)]
    status: Vec<u16>,
    #[serde(default)]
    size: Vec<usize>,
    condition: Option<String>,
    #[serde(default)]
    negative: bool,
    #[serde(default, rename = "case-insensitive")]
    case_insensitive: bool,
}

/// Parse and validate a raw template.
///
/// The returned template carries the raw id even when the document's own
/// `id` differs.
pub fn parse_template(raw: &RawTemplate) -> Result<ParsedTemplate, TemplateParseError> {
    let fail = |cause: String| TemplateParseError::new(raw.id.clone(), cause);

    let doc: TemplateDoc = serde_yaml::from_str(&raw.original).map_err(|e| fail(format!("invalid YAML: {}", e)))?;

    match doc.id.as_deref().map(str::trim) {
        None | Some("") => return Err(fail("missing template id".to_string())),
        Some(id) if id != raw.id => {
            log::debug!("template id '{}' differs from source id '{}'", id, raw.id);
        }
        Some(_) => {}
    }

    if doc.tcp.is_empty() && doc.http.is_empty() {
        return Err(fail("no supported protocol block (tcp or http)".to_string()));
    }

    let tcp = doc
        .tcp
        .into_iter()
        .enumerate()
        .map(|(i, block)| parse_tcp(block).map_err(|e| fail(format!("tcp[{}]: {}", i, e))))
        .collect::<Result<Vec<_>, _>>()?;

    let http = doc
        .http
        .into_iter()
        .enumerate()
        .map(|(i, block)| parse_http(block).map_err(|e| fail(format!("http[{}]: {}", i, e))))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedTemplate {
        id: raw.id.clone(),
        info: parse_info(doc.info),
        tcp,
        http,
    })
}

fn parse_info(info: InfoDoc) -> TemplateInfo {
    TemplateInfo {
        name: info.name.unwrap_or_default(),
        author: info.author.unwrap_or_default(),
        severity: info.severity.unwrap_or_default(),
        description: info.description.map(|d| d.trim().to_string()).unwrap_or_default(),
        reference: info.reference.map(StringOrList::into_vec).unwrap_or_default(),
        classification: stringify_map(info.classification),
        metadata: stringify_map(info.metadata),
        tags: info
            .tags
            .map(StringOrList::into_vec)
            .unwrap_or_default()
            .iter()
            .flat_map(|tags| tags.split(','))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

fn stringify_map(map: Option<BTreeMap<String, serde_yaml::Value>>) -> BTreeMap<String, String> {
    map.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Null => String::new(),
                other => serde_json::to_string(&other).unwrap_or_default(),
            };
            (key, text)
        })
        .collect()
}

fn parse_tcp(block: TcpDoc) -> Result<TcpRequest, String> {
    if block.inputs.is_empty() {
        return Err("no inputs".to_string());
    }

    let inputs = block
        .inputs
        .into_iter()
        .map(|input| {
            let payload = match input.kind.as_deref().map(str::to_lowercase).as_deref() {
                Some("hex") => TcpPayload::Bytes(
                    hex::decode(input.data.trim()).map_err(|e| format!("bad hex input: {}", e))?,
                ),
                None | Some("text") => TcpPayload::Text(input.data),
                Some(other) => return Err(format!("unknown input type '{}'", other)),
            };
            Ok(TcpInput {
                payload,
                read: input.read,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    let mut ports: BTreeSet<u16> = parse_port_value(block.port)?.into_iter().collect();
    let mut plain_hosts = 0;
    let mut tls_hosts = 0;
    for host in block.host.map(StringOrList::into_vec).unwrap_or_default() {
        let host = host.trim();
        if host.starts_with("tls://") {
            tls_hosts += 1;
            continue;
        }
        plain_hosts += 1;
        if let Some(port) = explicit_port(host) {
            ports.insert(port);
        }
    }

    Ok(TcpRequest {
        inputs,
        ports: ports.into_iter().collect(),
        plain_hosts,
        tls_hosts,
        read_size: block.read_size.unwrap_or(DEFAULT_READ_SIZE),
        matchers: parse_matcher_set(block.matchers_condition, block.matchers)?,
    })
}

/// `{{Hostname}}:5432` or `{{Host}}:5432` carry a fixed port
fn explicit_port(host: &str) -> Option<u16> {
    let (_, port) = host.rsplit_once(':')?;
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    port.parse().ok().filter(|p| *p != 0)
}

fn parse_http(block: HttpDoc) -> Result<HttpRequest, String> {
    let paths = block.path.map(StringOrList::into_vec).unwrap_or_default();
    if paths.is_empty() {
        return Err("no path".to_string());
    }

    let port = match parse_port_value(block.port)?.as_slice() {
        [] => None,
        [port] => Some(*port),
        _ => return Err("http blocks take a single port".to_string()),
    };

    let method = block.method.unwrap_or_else(|| "GET".to_string()).trim().to_uppercase();
    if reqwest::Method::from_bytes(method.as_bytes()).is_err() {
        return Err(format!("invalid method '{}'", method));
    }

    Ok(HttpRequest {
        method,
        paths,
        headers: block.headers,
        body: block.body,
        redirects: block.redirects,
        max_redirects: block.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
        max_size: block.max_size.unwrap_or(DEFAULT_MAX_BODY),
        port,
        matchers: parse_matcher_set(block.matchers_condition, block.matchers)?,
    })
}

fn parse_port_value(value: Option<PortValue>) -> Result<Vec<u16>, String> {
    let text = match value {
        None => return Ok(Vec::new()),
        Some(PortValue::Number(n)) => n.to_string(),
        Some(PortValue::Text(text)) => text,
    };

    text.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("invalid port '{}'", p)),
            Ok(port) => Ok(port),
        })
        .collect()
}

fn parse_matcher_set(condition: Option<String>, matchers: Vec<MatcherDoc>) -> Result<MatcherSet, String> {
    if matchers.is_empty() {
        return Err("no matchers".to_string());
    }

    Ok(MatcherSet {
        condition: parse_condition(condition)?,
        matchers: matchers.into_iter().map(parse_matcher).collect::<Result<_, _>>()?,
    })
}

fn parse_condition(condition: Option<String>) -> Result<Condition, String> {
    condition.map(|c| c.parse::<Condition>()).transpose().map(Option::unwrap_or_default)
}

fn parse_matcher(doc: MatcherDoc) -> Result<Matcher, String> {
    let kind = match doc.kind.trim().to_lowercase().as_str() {
        "word" => MatcherKind::Word(non_empty("words", doc.words)?),
        "regex" => MatcherKind::Regex(
            non_empty("regex", doc.regex)?
                .iter()
                .map(|pattern| {
                    RegexBuilder::new(pattern)
                        .case_insensitive(doc.case_insensitive)
                        .build()
                        .map_err(|e| format!("bad regex '{}': {}", pattern, e))
                })
                .collect::<Result<_, _>>()?,
        ),
        "binary" => MatcherKind::Binary(
            non_empty("binary", doc.binary)?
                .iter()
                .map(|value| hex::decode(value.trim()).map_err(|e| format!("bad hex '{}': {}", value, e)))
                .collect::<Result<_, _>>()?,
        ),
        "status" => MatcherKind::Status(non_empty("status", doc.status)?),
        "size" => MatcherKind::Size(non_empty("size", doc.size)?),
        other => return Err(format!("unknown matcher type '{}'", other)),
    };

    Ok(Matcher {
        name: doc.name,
        kind,
        part: doc.part.map(|p| p.parse::<Part>()).transpose()?.unwrap_or_default(),
        condition: parse_condition(doc.condition)?,
        negative: doc.negative,
        case_insensitive: doc.case_insensitive,
    })
}

fn non_empty<T>(field: &str, values: Vec<T>) -> Result<Vec<T>, String> {
    if values.is_empty() {
        Err(format!("matcher has no {}", field))
    } else {
        Ok(values)
    }
}
