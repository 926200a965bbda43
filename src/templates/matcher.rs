//! Matcher evaluation against protocol responses

use regex::Regex;
use std::borrow::Cow;
use std::str::FromStr;

/// How values (inside a matcher) or matchers (inside a block) combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    And,
    #[default]
    Or,
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "and" => Ok(Condition::And),
            "or" => Ok(Condition::Or),
            other => Err(format!("unknown condition '{}'", other)),
        }
    }
}

/// Which slice of the response a matcher looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Part {
    #[default]
    Body,
    Header,
    /// Status line, headers and body
    All,
}

impl FromStr for Part {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "body" | "data" => Ok(Part::Body),
            "header" | "headers" => Ok(Part::Header),
            "all" | "raw" | "response" => Ok(Part::All),
            other => Err(format!("unknown part '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MatcherKind {
    Word(Vec<String>),
    Regex(Vec<Regex>),
    Binary(Vec<Vec<u8>>),
    Status(Vec<u16>),
    Size(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: Option<String>,
    pub kind: MatcherKind,
    pub part: Part,
    pub condition: Condition,
    pub negative: bool,
    pub case_insensitive: bool,
}

/// A response as seen by matchers.
///
/// TCP responses only carry a body.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: Option<u16>,
    pub status_line: String,
    pub headers: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn from_bytes(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    fn part(&self, part: Part) -> Cow<'_, [u8]> {
        match part {
            Part::Body => Cow::Borrowed(&self.body),
            Part::Header => Cow::Borrowed(self.headers.as_bytes()),
            Part::All if self.headers.is_empty() && self.status_line.is_empty() => Cow::Borrowed(&self.body),
            Part::All => {
                let mut all = Vec::with_capacity(self.status_line.len() + self.headers.len() + self.body.len() + 4);
                all.extend_from_slice(self.status_line.as_bytes());
                all.extend_from_slice(b"\r\n");
                all.extend_from_slice(self.headers.as_bytes());
                all.extend_from_slice(b"\r\n");
                all.extend_from_slice(&self.body);
                Cow::Owned(all)
            }
        }
    }
}

/// Result of evaluating a matcher or a block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Values that matched, from positive matchers only
    pub evidence: Vec<String>,
}

impl Matcher {
    /// Evaluate the matcher, with `negative` already applied
    pub fn evaluate(&self, response: &Response) -> MatchOutcome {
        let data = response.part(self.part);
        let (matched, evidence) = self.evaluate_values(&data, response);

        if self.negative {
            MatchOutcome {
                matched: !matched,
                evidence: Vec::new(),
            }
        } else {
            MatchOutcome { matched, evidence }
        }
    }

    fn evaluate_values(&self, data: &[u8], response: &Response) -> (bool, Vec<String>) {
        match &self.kind {
            MatcherKind::Word(words) => {
                let text = String::from_utf8_lossy(data);
                let haystack = if self.case_insensitive {
                    Cow::Owned(text.to_lowercase())
                } else {
                    text
                };
                self.combine(words.iter().map(|word| {
                    let found = if self.case_insensitive {
                        haystack.contains(&word.to_lowercase())
                    } else {
                        haystack.contains(word.as_str())
                    };
                    found.then(|| word.clone())
                }))
            }
            MatcherKind::Regex(patterns) => {
                let text = String::from_utf8_lossy(data);
                self.combine(
                    patterns
                        .iter()
                        .map(|pattern| pattern.find(&text).map(|m| m.as_str().to_string())),
                )
            }
            MatcherKind::Binary(needles) => self.combine(
                needles
                    .iter()
                    .map(|needle| contains_bytes(data, needle).then(|| hex::encode(needle))),
            ),
            MatcherKind::Status(codes) => {
                let status = response.status;
                self.combine(
                    codes
                        .iter()
                        .map(|code| (status == Some(*code)).then(|| code.to_string())),
                )
            }
            MatcherKind::Size(sizes) => self.combine(
                sizes
                    .iter()
                    .map(|size| (data.len() == *size).then(|| size.to_string())),
            ),
        }
    }

    fn combine(&self, hits: impl Iterator<Item = Option<String>>) -> (bool, Vec<String>) {
        let mut evidence = Vec::new();
        let mut all = true;
        for hit in hits {
            match hit {
                Some(value) => evidence.push(value),
                None => all = false,
            }
        }

        let matched = match self.condition {
            Condition::And => all,
            Condition::Or => !evidence.is_empty(),
        };
        if !matched {
            evidence.clear();
        }
        (matched, evidence)
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// Matchers of one request block
#[derive(Debug, Clone, Default)]
pub struct MatcherSet {
    pub condition: Condition,
    pub matchers: Vec<Matcher>,
}

impl MatcherSet {
    pub fn evaluate(&self, response: &Response) -> MatchOutcome {
        let mut evidence = Vec::new();
        let mut any = false;

        for matcher in &self.matchers {
            let outcome = matcher.evaluate(response);
            if outcome.matched {
                any = true;
                evidence.extend(outcome.evidence);
            } else if self.condition == Condition::And {
                return MatchOutcome::default();
            }
        }

        let matched = match self.condition {
            Condition::And => !self.matchers.is_empty(),
            Condition::Or => any,
        };
        if matched {
            MatchOutcome { matched, evidence }
        } else {
            MatchOutcome::default()
        }
    }
}
