//! Turn a raw service response into validated [`ExtractedRecord`]s.
//!
//! Vision models return "almost JSON": fenced in markdown, wrapped in prose,
//! items missing fields, identifiers like `"№ 5"` or `"unknown"`, text full of
//! OCR debris. This stage is deterministic and owns every repair:
//!
//! 1. [`parse_response`]: strip fences, cut the outermost `{…}`, check shape
//! 2. [`RecordNormalizer::normalize`]: validate each item, clean its text,
//!    synthesize a key when the service gave none, echo unknown fields into
//!    provenance
//! 3. cross-check the declared item count against what survived
//!
//! A malformed item is dropped with a [`NormalizationError`]; it never fails
//! the unit.

use crate::config::FieldMap;
use crate::error::NormalizationError;
use crate::output::ExtractedRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Provenance key holding the identifier exactly as the service sent it.
pub const PROVENANCE_RAW_KEY: &str = "normalizer.raw_key";
/// Provenance key flagging that text cleaning changed the string.
pub const PROVENANCE_TEXT_CLEANED: &str = "normalizer.text_cleaned";

/// Counters accumulated across every unit a normalizer has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerStats {
    /// Records produced.
    pub total_processed: u64,
    pub unknown_keys_generated: u64,
    /// Records whose text was changed by cleaning.
    pub cleanups_performed: u64,
    /// Items rejected.
    pub validation_errors: u64,
}

/// Result of normalizing one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub records: Vec<ExtractedRecord>,
    pub errors: Vec<NormalizationError>,
    /// Non-fatal findings about the response as a whole.
    pub warnings: Vec<String>,
}

/// Validates and cleans raw items. One instance per session.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    fields: FieldMap,
    max_text_len: usize,
    unknown_counter: u64,
    stats: NormalizerStats,
}

impl RecordNormalizer {
    pub fn new(fields: FieldMap, max_text_len: usize) -> Self {
        Self {
            fields,
            max_text_len,
            unknown_counter: 0,
            stats: NormalizerStats::default(),
        }
    }

    /// Continue synthesized keys after `last_issued`, so a resumed session
    /// never hands out an `unknown-N` it already used.
    pub fn with_unknown_counter(mut self, last_issued: u64) -> Self {
        self.unknown_counter = last_issued;
        self
    }

    /// Highest `N` issued as `unknown-N` so far.
    pub fn unknown_counter(&self) -> u64 {
        self.unknown_counter
    }

    pub fn stats(&self) -> NormalizerStats {
        self.stats
    }

    /// Zero the statistics. The synthesized-key counter is left alone.
    pub fn reset_stats(&mut self) {
        self.stats = NormalizerStats::default();
    }

    /// Normalize every item of `raw` for unit `unit_index`.
    pub fn normalize(&mut self, raw: &Value, unit_index: usize) -> Normalized {
        let mut out = Normalized::default();

        let items = match raw.get(&self.fields.items).and_then(Value::as_array) {
            Some(items) => items,
            None => {
                out.warnings
                    .push(format!("response has no '{}' array", self.fields.items));
                return out;
            }
        };

        let info = raw.get(&self.fields.info).and_then(Value::as_object);
        let info_provenance = info
            .map(|info| self.info_provenance(info))
            .unwrap_or_default();

        for (item_index, item) in items.iter().enumerate() {
            match self.normalize_item(item, item_index, unit_index, &info_provenance) {
                Ok(record) => {
                    self.stats.total_processed += 1;
                    out.records.push(record);
                }
                Err(e) => {
                    self.stats.validation_errors += 1;
                    warn!(unit = unit_index, item = item_index, error = %e, "item rejected");
                    out.errors.push(e);
                }
            }
        }

        if let Some(expected) = info
            .and_then(|info| info.get(&self.fields.expected_count))
            .and_then(as_count)
        {
            if expected != out.records.len() as u64 {
                out.warnings.push(format!(
                    "expected {} items but extracted {}",
                    expected,
                    out.records.len()
                ));
            }
        }

        debug!(
            unit = unit_index,
            records = out.records.len(),
            rejected = out.errors.len(),
            "response normalized"
        );
        out
    }

    fn normalize_item(
        &mut self,
        item: &Value,
        item_index: usize,
        unit_index: usize,
        info_provenance: &BTreeMap<String, Value>,
    ) -> Result<ExtractedRecord, NormalizationError> {
        let obj = item
            .as_object()
            .ok_or(NormalizationError::NotAnObject { item: item_index })?;

        for field in [&self.fields.key, &self.fields.text, &self.fields.visual] {
            if !obj.contains_key(field.as_str()) {
                return Err(NormalizationError::MissingField {
                    item: item_index,
                    field: field.clone(),
                });
            }
        }

        let raw_text = match &obj[self.fields.text.as_str()] {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Null => String::new(),
            other => {
                return Err(NormalizationError::InvalidField {
                    item: item_index,
                    field: self.fields.text.clone(),
                    detail: format!("expected a string, got {}", json_type(other)),
                })
            }
        };
        let text = clean_text(&raw_text);
        if text.is_empty() {
            return Err(NormalizationError::EmptyText { item: item_index });
        }
        let len = text.chars().count();
        if len > self.max_text_len {
            return Err(NormalizationError::TextTooLong {
                item: item_index,
                len,
                max: self.max_text_len,
            });
        }

        let has_visual = parse_flag(&obj[self.fields.visual.as_str()]).ok_or_else(|| {
            NormalizationError::InvalidField {
                item: item_index,
                field: self.fields.visual.clone(),
                detail: format!("cannot read {} as a boolean", obj[self.fields.visual.as_str()]),
            }
        })?;

        let confidence = obj
            .get(self.fields.confidence.as_str())
            .and_then(parse_confidence);

        let raw_key = match &obj[self.fields.key.as_str()] {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let record_key = match clean_key(&raw_key) {
            Some(key) => key,
            None => self.synthesize_key(),
        };

        let cleaned = text != raw_text;
        if cleaned {
            self.stats.cleanups_performed += 1;
        }

        let mut provenance: BTreeMap<String, Value> = obj
            .iter()
            .filter(|(k, _)| !self.is_known_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        provenance.extend(info_provenance.iter().map(|(k, v)| (k.clone(), v.clone())));
        provenance.insert(PROVENANCE_RAW_KEY.into(), Value::String(raw_key));
        provenance.insert(PROVENANCE_TEXT_CLEANED.into(), Value::Bool(cleaned));

        Ok(ExtractedRecord {
            unit_index,
            record_key,
            text,
            has_visual,
            confidence,
            provenance,
        })
    }

    fn synthesize_key(&mut self) -> String {
        self.unknown_counter += 1;
        self.stats.unknown_keys_generated += 1;
        format!("unknown-{}", self.unknown_counter)
    }

    fn is_known_field(&self, name: &str) -> bool {
        name == self.fields.key
            || name == self.fields.text
            || name == self.fields.visual
            || name == self.fields.confidence
    }

    fn info_provenance(&self, info: &Map<String, Value>) -> BTreeMap<String, Value> {
        info.iter()
            .filter(|(k, _)| **k != self.fields.expected_count)
            .map(|(k, v)| (format!("{}.{}", self.fields.info, k), v.clone()))
            .collect()
    }
}

// ── Text cleaning ────────────────────────────────────────────────────────

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static RE_BULLETS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[•·▪▫■□▲△]").unwrap());

static RE_PIPES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\|+").unwrap());

static RE_UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").unwrap());

static RE_OPERATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*([+\-×÷=<>≤≥])\s*").unwrap());

static RE_LEADING_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\w№]+").unwrap());

static RE_TRAILING_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w?.!]+$").unwrap());

static RE_KEY_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\-.№]").unwrap());

/// Minus look-alikes OCR and models emit in place of `-`.
const MINUS_VARIANTS: [char; 4] = ['−', '–', '－', '﹣'];

/// Clean one item's text.
///
/// In order: trim, collapse whitespace, drop bullet glyphs, turn pipe and
/// underscore runs into spaces, canonicalise minus signs, space out
/// arithmetic and comparison operators, strip leading junk and trailing
/// punctuation other than `?`, `.` and `!`.
pub fn clean_text(raw: &str) -> String {
    let text = RE_WHITESPACE.replace_all(raw.trim(), " ");
    let text = RE_BULLETS.replace_all(&text, "");
    let text = RE_PIPES.replace_all(&text, " ");
    let text = RE_UNDERSCORES.replace_all(&text, " ");
    let text: String = text
        .chars()
        .map(|c| if MINUS_VARIANTS.contains(&c) { '-' } else { c })
        .collect();
    let text = RE_OPERATORS.replace_all(&text, " $1 ");
    let text = RE_LEADING_JUNK.replace(&text, "");
    let text = RE_TRAILING_JUNK.replace(&text, "");
    RE_WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Clean a service-supplied identifier; `None` means "synthesize one".
fn clean_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || ["unknown", "null", "none"]
            .iter()
            .any(|placeholder| trimmed.eq_ignore_ascii_case(placeholder))
    {
        return None;
    }
    let cleaned = RE_KEY_JUNK.replace_all(trimmed, "");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.into_owned())
    }
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Null => Some(false),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_confidence(value: &Value) -> Option<f64> {
    let score = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (0.0..=1.0).contains(&score).then_some(score)
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Response parsing ─────────────────────────────────────────────────────

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n?(.*?)\n?\s*```$").unwrap());

/// Extract the JSON object from a model reply.
///
/// Accepts a bare object, a ```` ```json ```` fenced block, or an object
/// surrounded by prose. The object must contain the `fields.items` array.
pub fn parse_response(content: &str, fields: &FieldMap) -> Result<Value, String> {
    let trimmed = content.trim();
    let unfenced = RE_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let start = unfenced
        .find('{')
        .ok_or_else(|| "no JSON object in response".to_string())?;
    let end = unfenced
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| "unterminated JSON object in response".to_string())?;

    let value: Value = serde_json::from_str(&unfenced[start..=end])
        .map_err(|e| format!("invalid JSON: {e}"))?;

    match value.get(&fields.items) {
        Some(Value::Array(_)) => Ok(value),
        Some(_) => Err(format!("'{}' is not an array", fields.items)),
        None => Err(format!("response has no '{}' field", fields.items)),
    }
}
