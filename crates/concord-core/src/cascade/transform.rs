//! Value transforms applied when a rule cascades.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::models::{CoordinationRule, DocumentRecord, TransformType};

const AMOUNT_KEYS: [&str; 4] = ["amount", "total", "value", "price"];
const CURRENCY_HINTS: [&str; 7] = ["value", "amount", "price", "cost", "total", "budget", "fee"];
const PERCENT_HINTS: [&str; 3] = ["percent", "rate", "margin"];
/// Largest integer an f64 holds exactly.
const MAX_EXACT: f64 = 9_007_199_254_740_992.0;

/// Presentation chosen for a `format` rule, inferred from the target field name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Currency,
    Percent,
    Date,
    Number,
}

impl FormatKind {
    pub fn for_field(field_path: &str) -> Self {
        let name = field_path
            .rsplit('.')
            .next()
            .unwrap_or(field_path)
            .to_ascii_lowercase();

        if name.contains("date") {
            Self::Date
        } else if PERCENT_HINTS.iter().any(|hint| name.contains(hint)) {
            Self::Percent
        } else if CURRENCY_HINTS.iter().any(|hint| name.contains(hint)) {
            Self::Currency
        } else {
            Self::Number
        }
    }
}

/// Compute the value a rule writes into its targets.
pub fn apply(rule: &CoordinationRule, value: &Value, trigger: &DocumentRecord) -> Result<Value> {
    match rule.transform_type {
        TransformType::Copy => Ok(value.clone()),
        TransformType::Format => format_value(FormatKind::for_field(&rule.target_field_path), value),
        TransformType::Aggregate => aggregate(value),
        TransformType::Reference => Ok(json!({
            "kind": "reference",
            "doc_type": rule.source_doc_type,
            "field_path": rule.source_field_path,
            "document_id": trigger.id,
            "value": value,
        })),
    }
}

/// Pretty-print a value. Strings that are not numbers pass through trimmed
/// unless the kind needs a number or a date.
pub fn format_value(kind: FormatKind, value: &Value) -> Result<Value> {
    if let Value::String(text) = value {
        if kind == FormatKind::Date {
            return format_date(text).map(Value::String);
        }
        return match parse_number(value) {
            Some(number) => Ok(Value::String(format_number(kind, number))),
            None if kind == FormatKind::Number => Ok(Value::String(text.trim().to_string())),
            None => Err(Error::validation(format!(
                "cannot format '{}' as {}",
                text.trim(),
                kind_name(kind)
            ))),
        };
    }

    match (kind, value) {
        (FormatKind::Date, _) => Err(Error::validation(format!(
            "cannot format {value} as a date"
        ))),
        (_, Value::Number(_)) => parse_number(value)
            .map(|number| Value::String(format_number(kind, number)))
            .ok_or_else(|| Error::validation(format!("cannot format {value}"))),
        (FormatKind::Number, _) => Ok(value.clone()),
        _ => Err(Error::validation(format!(
            "cannot format {value} as {}",
            kind_name(kind)
        ))),
    }
}

/// Sum a collection. A scalar counts as a one-element collection.
pub fn aggregate(value: &Value) -> Result<Value> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut sum = 0.0;
    for (index, item) in items.iter().enumerate() {
        let amount = item_amount(item).ok_or_else(|| {
            Error::validation(format!("aggregate item {index} is not numeric: {item}"))
        })?;
        sum += amount;
    }

    Ok(number_value((sum * 10_000.0).round() / 10_000.0))
}

fn item_amount(item: &Value) -> Option<f64> {
    match item {
        Value::Object(map) => AMOUNT_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(parse_number)),
        other => parse_number(other),
    }
}

/// Numbers, or strings such as `"$4,500,000"`, `"12.5%"`, `" 1 200 "`.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let trimmed = text.trim();
            let (negative, body) = match trimmed.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, trimmed),
            };
            let cleaned: String = body
                .trim_start_matches('$')
                .trim_end_matches('%')
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
                return None;
            }
            let parsed = cleaned.parse::<f64>().ok()?;
            parsed
                .is_finite()
                .then_some(if negative { -parsed } else { parsed })
        }
        _ => None,
    }
}

fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < MAX_EXACT {
        Value::from(number as i64)
    } else {
        Value::from(number)
    }
}

fn format_number(kind: FormatKind, number: f64) -> String {
    match kind {
        FormatKind::Currency => format_currency(number),
        FormatKind::Percent => format!("{}%", trimmed_decimal(number, 2)),
        FormatKind::Number | FormatKind::Date => grouped_decimal(number),
    }
}

/// `$5,000,000`, `$1,234.50`, `-$20`
fn format_currency(number: f64) -> String {
    let cents = (number.abs() * 100.0).round();
    let sign = if number < 0.0 && cents > 0.0 { "-" } else { "" };
    let whole = group_thousands(&format!("{:.0}", (cents / 100.0).trunc()));
    let fraction = (cents % 100.0) as u32;
    if fraction == 0 {
        format!("{sign}${whole}")
    } else {
        format!("{sign}${whole}.{fraction:02}")
    }
}

fn grouped_decimal(number: f64) -> String {
    let text = trimmed_decimal(number.abs(), 2);
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let sign = if number < 0.0 && text != "0" { "-" } else { "" };
    if fraction.is_empty() {
        format!("{sign}{}", group_thousands(whole))
    } else {
        format!("{sign}{}.{fraction}", group_thousands(whole))
    }
}

fn trimmed_decimal(number: f64, places: usize) -> String {
    let text = format!("{number:.places$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn group_thousands(digits: &str) -> String {
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

/// `2025-03-07` (or an RFC 3339 timestamp) -> `March 7, 2025`
fn format_date(text: &str) -> Result<String> {
    let trimmed = text.trim();
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|timestamp| timestamp.date_naive())
        })
        .ok_or_else(|| Error::validation(format!("cannot format '{trimmed}' as a date")))?;
    Ok(date.format("%B %-d, %Y").to_string())
}

const fn kind_name(kind: FormatKind) -> &'static str {
    match kind {
        FormatKind::Currency => "currency",
        FormatKind::Percent => "a percentage",
        FormatKind::Date => "a date",
        FormatKind::Number => "a number",
    }
}
