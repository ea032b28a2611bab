//! Attribute extraction, type coercion and validation.
//!
//! Parsed documents are kept inside synchronous functions; nothing in this
//! module holds an `Html` across an await point.

use crate::error::{MiningError, Result};
use crate::types::{AttributeSpec, DataType, ExtractMethod, ExtractionStrategy, ValidationRules};
use chrono::{DateTime, NaiveDate};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    /// The value was found but is not acceptable. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The page could not be processed.
    #[error("extraction failed: {0}")]
    Parse(String),
}

/// A fetched page handed to extractors.
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    pub url: &'a str,
    pub body: &'a str,
}

/// User-supplied extraction routine, addressed by `custom:<id>` selectors.
pub trait CustomExtractor: Send + Sync {
    fn id(&self) -> &str;

    /// Return the raw text of the attribute, or `None` if absent.
    fn extract(&self, page: Page<'_>) -> std::result::Result<Option<String>, ExtractError>;
}

/// Dispatch table for [`CustomExtractor`]s.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn CustomExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extractor: Arc<dyn CustomExtractor>) {
        self.extractors.insert(extractor.id().to_string(), extractor);
    }

    pub fn with(mut self, extractor: Arc<dyn CustomExtractor>) -> Self {
        self.register(extractor);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn CustomExtractor>> {
        self.extractors.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.extractors.keys().map(String::as_str)
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("extractors", &self.extractors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone)]
enum Strategy {
    Css(String),
    AutoDetect,
    Custom(Arc<dyn CustomExtractor>),
}

/// An [`AttributeSpec`] checked and prepared for repeated extraction.
#[derive(Clone)]
pub struct CompiledAttribute {
    spec: AttributeSpec,
    strategy: Strategy,
    pattern: Option<Regex>,
}

impl fmt::Debug for CompiledAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledAttribute")
            .field("name", &self.spec.name)
            .field("strategy", &self.spec.strategy())
            .finish()
    }
}

impl CompiledAttribute {
    /// Validate `spec` and resolve its strategy. Fails fast on malformed specs.
    pub fn compile(spec: &AttributeSpec, registry: &ExtractorRegistry) -> Result<Self> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(MiningError::invalid_attribute("", "name must not be empty"));
        }
        if !is_version(&spec.schema_version) {
            return Err(MiningError::invalid_attribute(
                name,
                format!("schema_version '{}' is not a dotted version", spec.schema_version),
            ));
        }

        let strategy = match spec.strategy() {
            ExtractionStrategy::CssSelector(css) => {
                Selector::parse(&css).map_err(|e| {
                    MiningError::invalid_attribute(name, format!("bad selector '{css}': {e}"))
                })?;
                Strategy::Css(css)
            }
            ExtractionStrategy::AutoDetect => Strategy::AutoDetect,
            ExtractionStrategy::CustomFunction(id) => {
                let extractor = registry.get(&id).ok_or_else(|| {
                    MiningError::invalid_attribute(
                        name,
                        format!("no custom extractor registered as '{id}'"),
                    )
                })?;
                Strategy::Custom(extractor)
            }
        };

        if let ExtractMethod::Attr(attr) = &spec.method {
            if attr.trim().is_empty() {
                return Err(MiningError::invalid_attribute(
                    name,
                    "attr method needs an attribute name",
                ));
            }
        }

        let rules = &spec.validation;
        if let (Some(min), Some(max)) = (rules.min_length, rules.max_length) {
            if min > max {
                return Err(MiningError::invalid_attribute(name, "min_length exceeds max_length"));
            }
        }
        if let (Some(min), Some(max)) = (rules.min, rules.max) {
            if min > max {
                return Err(MiningError::invalid_attribute(name, "min exceeds max"));
            }
        }
        let pattern = rules
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| MiningError::invalid_attribute(name, format!("bad pattern: {e}")))?;

        Ok(Self {
            spec: spec.clone(),
            strategy,
            pattern,
        })
    }

    pub fn spec(&self) -> &AttributeSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Extract, coerce and validate the attribute from a page.
    pub fn extract(&self, page: Page<'_>) -> std::result::Result<Value, ExtractError> {
        let raw = match &self.strategy {
            Strategy::Custom(extractor) => extractor.extract(page)?.map(Raw::Text),
            Strategy::Css(css) => {
                let document = Html::parse_document(page.body);
                select_raw(&document, css, &self.spec.method)?
            }
            Strategy::AutoDetect => {
                let document = Html::parse_document(page.body);
                match &self.spec.method {
                    ExtractMethod::Text => auto_detect(&document, &self.spec.name).map(Raw::Text),
                    method => {
                        let css = auto_selector(&self.spec.name);
                        select_raw(&document, &css, method)?
                    }
                }
            }
        };

        self.finish(raw, page.url)
    }

    fn finish(&self, raw: Option<Raw>, page_url: &str) -> std::result::Result<Value, ExtractError> {
        let rules = &self.spec.validation;
        let raw = match raw {
            Some(Raw::Text(text)) if text.trim().is_empty() => None,
            other => other,
        };

        let Some(raw) = raw else {
            if rules.required {
                return Err(ExtractError::Validation(format!(
                    "required attribute '{}' is missing",
                    self.spec.name
                )));
            }
            return Ok(Value::Null);
        };

        let value = match raw {
            Raw::Count(n) => Value::from(n as u64),
            Raw::Text(text) => {
                let text = text.trim();
                check_text(text, rules, self.pattern.as_ref())?;
                coerce(text, self.spec.data_type, page_url)?
            }
        };

        check_range(&value, rules)?;
        Ok(value)
    }
}

enum Raw {
    Text(String),
    Count(usize),
}

fn is_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .split('.')
            .all(|part| {
                !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
}

fn parse_selector(css: &str) -> std::result::Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Parse(format!("bad selector '{css}': {e}")))
}

fn collapse_text(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn select_raw(
    document: &Html,
    css: &str,
    method: &ExtractMethod,
) -> std::result::Result<Option<Raw>, ExtractError> {
    let selector = parse_selector(css)?;
    let mut matches = document.select(&selector);
    Ok(match method {
        ExtractMethod::Count => Some(Raw::Count(matches.count())),
        ExtractMethod::Text => matches.next().map(|el| Raw::Text(collapse_text(el))),
        ExtractMethod::Attr(attr) => matches
            .next()
            .and_then(|el| el.value().attr(attr))
            .map(|v| Raw::Text(v.to_string())),
    })
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    document
        .select(&selector)
        .map(collapse_text)
        .find(|text| !text.is_empty())
}

fn first_attr(document: &Html, css: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Selector used by auto-detected attributes with a non-text method.
fn auto_selector(name: &str) -> String {
    match name {
        "title" => "title".to_string(),
        "h1" => "h1".to_string(),
        "body" => "body".to_string(),
        "canonical" => "link[rel=\"canonical\"]".to_string(),
        "lang" => "html".to_string(),
        "description" | "metaDescription" => "meta[name=\"description\"]".to_string(),
        n if n.starts_with("og:") => format!("meta[property=\"{}\"]", quoted(n)),
        n => format!("meta[name=\"{}\"]", quoted(n)),
    }
}

fn auto_detect(document: &Html, name: &str) -> Option<String> {
    match name {
        "title" => first_text(document, "title").or_else(|| first_text(document, "h1")),
        "h1" => first_text(document, "h1"),
        "body" => first_text(document, "body"),
        "description" | "metaDescription" => {
            first_attr(document, "meta[name=\"description\"]", "content")
        }
        "canonical" => first_attr(document, "link[rel=\"canonical\"]", "href"),
        "lang" => first_attr(document, "html", "lang"),
        n if n.starts_with("og:") || n.starts_with("twitter:") => {
            let q = quoted(n);
            first_attr(document, &format!("meta[property=\"{q}\"]"), "content")
                .or_else(|| first_attr(document, &format!("meta[name=\"{q}\"]"), "content"))
        }
        n => {
            let q = quoted(n);
            first_attr(document, &format!("meta[name=\"{q}\"]"), "content")
                .or_else(|| first_text(document, &format!("[itemprop=\"{q}\"]")))
        }
    }
}

fn check_text(
    text: &str,
    rules: &ValidationRules,
    pattern: Option<&Regex>,
) -> std::result::Result<(), ExtractError> {
    let len = text.chars().count();
    if let Some(min) = rules.min_length {
        if len < min {
            return Err(ExtractError::Validation(format!("length {len} below minimum {min}")));
        }
    }
    if let Some(max) = rules.max_length {
        if len > max {
            return Err(ExtractError::Validation(format!("length {len} above maximum {max}")));
        }
    }
    if let Some(pattern) = pattern {
        if !pattern.is_match(text) {
            return Err(ExtractError::Validation(format!(
                "value does not match pattern '{}'",
                pattern.as_str()
            )));
        }
    }
    Ok(())
}

fn check_range(value: &Value, rules: &ValidationRules) -> std::result::Result<(), ExtractError> {
    let Some(n) = value.as_f64() else {
        return Ok(());
    };
    if let Some(min) = rules.min {
        if n < min {
            return Err(ExtractError::Validation(format!("{n} below minimum {min}")));
        }
    }
    if let Some(max) = rules.max {
        if n > max {
            return Err(ExtractError::Validation(format!("{n} above maximum {max}")));
        }
    }
    Ok(())
}

fn coerce(
    text: &str,
    data_type: DataType,
    page_url: &str,
) -> std::result::Result<Value, ExtractError> {
    match data_type {
        DataType::Text => Ok(Value::String(text.to_string())),
        DataType::Number => {
            let cleaned: String = text
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            cleaned
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ExtractError::Validation(format!("'{text}' is not a number")))
        }
        DataType::Date => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Ok(Value::String(dt.to_rfc3339()));
            }
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .map_err(|_| ExtractError::Validation(format!("'{text}' is not a date")))
        }
        DataType::Url | DataType::Image => {
            let base = Url::parse(page_url)
                .map_err(|e| ExtractError::Parse(format!("bad page url: {e}")))?;
            base.join(text)
                .map(|u| Value::String(u.to_string()))
                .map_err(|_| ExtractError::Validation(format!("'{text}' is not a url")))
        }
        DataType::Json => serde_json::from_str(text)
            .map_err(|e| ExtractError::Validation(format!("invalid json: {e}"))),
    }
}

/// Absolute http(s) links of a page, fragments removed, in document order.
pub fn extract_links(body: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let document = Html::parse_document(body);
    let mut seen = HashSet::new();
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|mut u| {
            u.set_fragment(None);
            u.to_string()
        })
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Canonical form used for deduplication (`http://a.test` -> `http://a.test/`).
pub fn normalize_url(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.set_fragment(None);
    Some(parsed.to_string())
}
