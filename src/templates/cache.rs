//! Parsed-template cache, one per entry

use super::{parse_template, ParsedTemplate, RawTemplate};
use crate::error::TemplateParseError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type CachedParse = Result<Arc<ParsedTemplate>, TemplateParseError>;

/// Memoizes parse results by template id, failures included, so a
/// template is parsed at most once per entry however many jobs use it.
#[derive(Debug, Default)]
pub struct TemplateCache {
    entries: Mutex<HashMap<String, CachedParse>>,
    parses: AtomicUsize,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_parse(&self, raw: &RawTemplate) -> CachedParse {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = entries.get(&raw.id) {
            return cached.clone();
        }

        self.parses.fetch_add(1, Ordering::Relaxed);
        let parsed = parse_template(raw).map(Arc::new);
        if let Err(e) = &parsed {
            log::warn!("{}", e);
        }
        entries.insert(raw.id.clone(), parsed.clone());
        parsed
    }

    /// How many times the parser actually ran
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
