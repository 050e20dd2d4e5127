//! Raw portal rows to typed intermediate records.
//!
//! Two row shapes are understood:
//!
//! ```text
//! 2024-03-01 14:32:10 | Jane Doe | card ...1234 | $12.50 | V3
//! 11/26/2025, 9:32 PM | EMV-TAP (0420) | Wash Bay | $3.75
//! ```
//!
//! The first is the normalised five-cell form, the second the portal's own
//! four-cell listing row. Detail lines attached to a row (`Wash Bay\t(bay 5)\t$3.75`,
//! `W2 | $5.00`, `Transaction ID: 123`) supply line items and the transaction id.

use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ParseError, ParseReason};
use crate::money::Money;
use crate::portal::RawRecord;

static ISO_DATETIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<date>\d{4}-\d{2}-\d{2})[ T]+(?P<time>\S+)$").unwrap());
static PORTAL_DATETIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<date>\d{1,2}/\d{1,2}/\d{4}),?\s+(?P<time>\d{1,2}:\d{2}(?::\d{2})?)\s*(?P<ampm>[AaPp][Mm])$")
        .unwrap()
});
static ISO_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{2}:\d{2}:\d{2}$").unwrap());
static TRAILING_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\D*$").unwrap());
static NAME_WITH_DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<name>.*?)\s*\((?P<digits>[^)]*)\)\s*$").unwrap());
static TYPE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<token>[A-Za-z]+)\s*(?P<station>\d+)?$").unwrap());
static DETAIL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)^\s*(?P<label>vac(?:uum)?|wash\s+bay|[vw])",
        r"\W*(?:vacuum|bay)?\s*(?P<station>\d+)",
        r"(?:[^\d$-]*(?P<amount>-?\$?-?[\d,]+(?:\.\d+)?))?"
    ))
    .unwrap()
});

const CANONICAL_FIELDS: [&str; 5] = [
    "purchase_datetime",
    "cardholder_name",
    "cardholder_last4",
    "total_amount",
    "purchase_type",
];

/// One line item found in a row's detail lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    /// `"V"` or `"W"`.
    pub token: String,
    pub station: u32,
    pub amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub transaction_id: i64,
    pub purchase_date: NaiveDate,
    pub purchase_time: NaiveTime,
    pub cardholder_name: String,
    /// Always four ASCII digits.
    pub cardholder_last4: String,
    pub total_amount: Money,
    /// Raw type token, upper-cased: `"V"` or `"W"`.
    pub type_token: String,
    pub station: Option<u32>,
    pub line_items: Vec<LineItem>,
}

pub fn parse(raw: &RawRecord) -> Result<ParsedRecord, ParseError> {
    parse_fields(raw).map_err(|reason| ParseError {
        reason,
        raw: raw.audit_text(),
    })
}

fn parse_fields(raw: &RawRecord) -> Result<ParsedRecord, ParseReason> {
    let fields: Vec<&str> = raw.fragment.split('|').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(ParseReason::MissingField(CANONICAL_FIELDS[fields.len()]));
    }

    let transaction_id = match raw.transaction_id() {
        Some(id) => id.parse::<i64>().map_err(|_| ParseReason::MalformedTransactionId(id))?,
        None => return Err(ParseReason::MissingField("transaction_id")),
    };

    let (purchase_date, purchase_time) = parse_datetime(fields[0])?;

    let (cardholder_name, cardholder_last4, amount, token, station) = if fields.len() == 4 {
        let (name, last4) = parse_cardholder_cell(fields[1])?;
        let token = token_for_label(fields[2])?;
        (name, last4, fields[3], token, None)
    } else {
        let name = required(fields[1], "cardholder_name")?.to_string();
        let last4 = parse_card_cell(fields[2])?;
        let (token, station) = parse_type_token(fields[4])?;
        (name, last4, fields[3], token, station)
    };

    let total_amount = parse_amount(required(amount, "total_amount")?)?;
    let line_items = raw
        .details
        .iter()
        .filter_map(|line| parse_detail_line(line).transpose())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedRecord {
        transaction_id,
        purchase_date,
        purchase_time,
        cardholder_name,
        cardholder_last4,
        total_amount,
        type_token: token,
        station,
        line_items,
    })
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ParseReason> {
    if value.is_empty() {
        Err(ParseReason::MissingField(field))
    } else {
        Ok(value)
    }
}

fn parse_datetime(value: &str) -> Result<(NaiveDate, NaiveTime), ParseReason> {
    let value = required(value, "purchase_datetime")?;

    if let Some(caps) = ISO_DATETIME.captures(value) {
        let date = NaiveDate::parse_from_str(&caps["date"], "%Y-%m-%d").map_err(|_| ParseReason::MalformedDate)?;
        let time = &caps["time"];
        if !ISO_TIME.is_match(time) {
            return Err(ParseReason::MalformedTime);
        }
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S").map_err(|_| ParseReason::MalformedTime)?;
        return Ok((date, time));
    }

    if let Some(caps) = PORTAL_DATETIME.captures(value) {
        let date = NaiveDate::parse_from_str(&caps["date"], "%m/%d/%Y").map_err(|_| ParseReason::MalformedDate)?;
        let clock = format!("{} {}", &caps["time"], caps["ampm"].to_ascii_uppercase());
        let format = if caps["time"].matches(':').count() == 2 {
            "%I:%M:%S %p"
        } else {
            "%I:%M %p"
        };
        let time = NaiveTime::parse_from_str(&clock, format).map_err(|_| ParseReason::MalformedTime)?;
        return Ok((date, time));
    }

    Err(ParseReason::MalformedDate)
}

fn pad_last4(digits: &str) -> Result<String, ParseReason> {
    if digits.is_empty() {
        return Err(ParseReason::MissingField("cardholder_last4"));
    }
    if digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseReason::MalformedCard);
    }
    Ok(format!("{digits:0>4}"))
}

// "card ...1234", "****07", "1234"
fn parse_card_cell(value: &str) -> Result<String, ParseReason> {
    let value = required(value, "cardholder_last4")?;
    let caps = TRAILING_DIGITS
        .captures(value)
        .ok_or(ParseReason::MissingField("cardholder_last4"))?;
    pad_last4(&caps[1])
}

// "EMV-TAP (0420)"
fn parse_cardholder_cell(value: &str) -> Result<(String, String), ParseReason> {
    let value = required(value, "cardholder_name")?;
    let caps = NAME_WITH_DIGITS
        .captures(value)
        .ok_or(ParseReason::MissingField("cardholder_last4"))?;
    let name = required(&caps["name"], "cardholder_name")?.to_string();
    let last4 = pad_last4(caps["digits"].trim())?;
    Ok((name, last4))
}

fn parse_amount(value: &str) -> Result<Money, ParseReason> {
    Money::parse(value).map_err(|_| ParseReason::MalformedAmount)
}

fn known_token(token: &str) -> Option<&'static str> {
    match token.to_ascii_uppercase().as_str() {
        "V" => Some("V"),
        "W" => Some("W"),
        _ => None,
    }
}

fn parse_type_token(value: &str) -> Result<(String, Option<u32>), ParseReason> {
    let value = required(value, "purchase_type")?;
    let unknown = || ParseReason::UnknownTypeToken(value.to_string());
    let caps = TYPE_TOKEN.captures(value).ok_or_else(unknown)?;
    let token = known_token(&caps["token"]).ok_or_else(unknown)?;
    let station = match caps.name("station") {
        Some(m) => Some(m.as_str().parse::<u32>().map_err(|_| unknown())?),
        None => None,
    };
    Ok((token.to_string(), station))
}

fn token_for_label(label: &str) -> Result<String, ParseReason> {
    let label = required(label, "purchase_type")?;
    let normalized = label.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
    match normalized.as_str() {
        "vac" | "vacuum" => Ok("V".to_string()),
        "wash bay" | "wash" | "bay" => Ok("W".to_string()),
        _ => Err(ParseReason::UnknownTypeToken(label.to_string())),
    }
}

/// `Ok(None)` for lines that are not line items (transaction id, headers).
fn parse_detail_line(line: &str) -> Result<Option<LineItem>, ParseReason> {
    let Some(caps) = DETAIL_LINE.captures(line) else {
        return Ok(None);
    };
    let label = caps["label"].to_ascii_lowercase();
    let token = if label.starts_with('v') { "V" } else { "W" };
    let station = caps["station"]
        .parse::<u32>()
        .map_err(|_| ParseReason::UnknownTypeToken(line.trim().to_string()))?;
    let amount = caps.name("amount").map(|m| parse_amount(m.as_str())).transpose()?;
    Ok(Some(LineItem {
        token: token.to_string(),
        station,
        amount,
    }))
}
