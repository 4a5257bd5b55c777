//! Core inventory domain model and metadata mapping for the Quartzy → eLabFTW sync.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "q2e-core";

/// Extra field label carrying the Quartzy identifier; the only join key between both systems.
pub const LINK_FIELD: &str = "Quartzy ID";

/// Quartzy does not expose a price currency, so every price is tagged with this unit.
pub const DEFAULT_PRICE_UNIT: &str = "€";
pub const PRICE_UNITS: [&str; 2] = ["€", "$"];

/// Truthiness of a source value: null, `""`, `0`, `false` and empty
/// containers count as "no data".
pub fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

/// Quartzy identifier as a join key. Numeric identifiers are keyed by their decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn from_json(value: &JsonValue) -> Option<Self> {
        if is_falsy(value) {
            return None;
        }
        match value {
            JsonValue::String(s) => Self::new(s.as_str()),
            JsonValue::Number(n) => Self::new(n.to_string()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NamedRef {
    #[serde(deserialize_with = "de_present")]
    pub name: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Owner {
    #[serde(deserialize_with = "de_scalar_text")]
    pub first_name: Option<String>,
    #[serde(deserialize_with = "de_scalar_text")]
    pub last_name: Option<String>,
    #[serde(deserialize_with = "de_present")]
    pub email: Option<JsonValue>,
}

/// One Quartzy inventory item as served by `GET /inventory-items`.
///
/// Attributes that end up in the metadata keep their raw JSON value: `None` when
/// the key is absent, `Some(Null)` when it is explicitly null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceRecord {
    #[serde(deserialize_with = "de_present")]
    pub id: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub name: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub vendor: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub catalog_number: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub quantity: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub unit_size: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub price: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub app_url: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub url: Option<JsonValue>,
    #[serde(rename = "type")]
    pub item_type: Option<NamedRef>,
    pub added_by: Option<Owner>,
    pub location: Option<NamedRef>,
    pub sublocation: Option<NamedRef>,
    #[serde(deserialize_with = "de_present")]
    pub cas_number: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub lot_number: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub serial_number: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub technical_details: Option<JsonValue>,
    #[serde(deserialize_with = "de_present")]
    pub expiration_date: Option<JsonValue>,
    #[serde(deserialize_with = "de_scalar_text")]
    pub auto_reminder: Option<String>,
}

impl SourceRecord {
    pub fn external_id(&self) -> Option<ExternalId> {
        self.id.as_ref().and_then(ExternalId::from_json)
    }

    /// Category label (`type.name`), if any.
    pub fn category(&self) -> Option<&str> {
        self.item_type
            .as_ref()
            .and_then(|t| t.name.as_ref())
            .and_then(JsonValue::as_str)
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_ref()
            .and_then(JsonValue::as_str)
            .unwrap_or("Unnamed")
    }

    pub fn owner_name(&self) -> String {
        let owner = self.added_by.as_ref();
        let first = owner.and_then(|o| o.first_name.as_deref()).unwrap_or_default();
        let last = owner.and_then(|o| o.last_name.as_deref()).unwrap_or_default();
        format!("{first} {last}").trim().to_string()
    }

    pub fn technical_details_text(&self) -> Option<String> {
        truthy_text(self.technical_details.as_ref())
    }

    pub fn expiration_text(&self) -> Option<String> {
        truthy_text(self.expiration_date.as_ref())
    }
}

fn truthy_text(value: Option<&JsonValue>) -> Option<String> {
    value.filter(|v| !is_falsy(v)).and_then(scalar_text)
}

/// Value as served, `""` when the key is absent.
fn or_blank(value: Option<&JsonValue>) -> JsonValue {
    value
        .cloned()
        .unwrap_or_else(|| JsonValue::String(String::new()))
}

fn ref_name(named: Option<&NamedRef>) -> JsonValue {
    or_blank(named.and_then(|n| n.name.as_ref()))
}

/// Keeps an explicit `null` as `Some(Null)`; only an absent key yields `None`.
fn de_present<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}

fn de_scalar_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_text))
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

/// Quartzy `auto_reminder` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoReminder {
    OneWeek,
    TwoWeeks,
    OneMonth,
}

impl AutoReminder {
    /// Returns `None` for absent, `none` (any case) and unrecognized tokens.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "1WEEK" => Some(Self::OneWeek),
            "2WEEK" => Some(Self::TwoWeeks),
            "1MONTH" => Some(Self::OneMonth),
            _ => None,
        }
    }

    pub fn before(self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Self::OneWeek => date.checked_sub_days(Days::new(7)),
            Self::TwoWeeks => date.checked_sub_days(Days::new(14)),
            Self::OneMonth => date.checked_sub_months(Months::new(1)),
        }
    }
}

/// Reminder date derived from an ISO expiration date and an auto-reminder token.
///
/// Month subtraction is calendar aware and clamps to the end of the shorter
/// month (`2025-03-31` minus one month is `2025-02-28`).
pub fn compute_reminder_date(
    expiration_date: Option<&str>,
    auto_reminder: Option<&str>,
) -> Option<NaiveDate> {
    let policy = AutoReminder::parse(auto_reminder?)?;
    let expiration = NaiveDate::parse_from_str(expiration_date?, "%Y-%m-%d").ok()?;
    policy.before(expiration)
}

/// One typed eLabFTW extra field, serialized as `{"type": ..., "value": ..., ...}`.
///
/// Values other than dates are kept as raw JSON so numbers and structured prices
/// round-trip with the shape the source served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExtraField {
    Text {
        value: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Number {
        value: JsonValue,
        unit: JsonValue,
        units: Vec<JsonValue>,
    },
    Url {
        value: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Email {
        value: JsonValue,
    },
    Date {
        value: NaiveDate,
    },
}

impl ExtraField {
    pub fn text(value: impl Into<JsonValue>) -> Self {
        Self::Text {
            value: value.into(),
            description: None,
        }
    }

    pub fn url(value: impl Into<JsonValue>) -> Self {
        Self::Url {
            value: value.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, text: &str) -> Self {
        match &mut self {
            Self::Text { description, .. } | Self::Url { description, .. } => {
                *description = Some(text.to_string());
            }
            Self::Number { .. } | Self::Email { .. } | Self::Date { .. } => {}
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { value, .. }
            | Self::Number { value, .. }
            | Self::Url { value, .. }
            | Self::Email { value } => is_falsy(value),
            Self::Date { .. } => false,
        }
    }
}

/// The metadata blob eLabFTW stores per item. Only `extra_fields` is written by the sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub extra_fields: BTreeMap<String, ExtraField>,
}

impl Metadata {
    pub fn get(&self, label: &str) -> Option<&ExtraField> {
        self.extra_fields.get(label)
    }

    pub fn to_json_value(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// True when `existing` (as stored by the destination) does not match this blob
    /// once both sides are put in canonical key order.
    pub fn differs_from(&self, existing: Option<&JsonValue>) -> Result<bool, serde_json::Error> {
        let new = canonical_json(&self.to_json_value()?)?;
        let old = canonical_json(existing.unwrap_or(&JsonValue::Null))?;
        Ok(new != old)
    }
}

/// Recursively sorts object keys.
pub fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = JsonMap::new();
            for (key, value) in entries {
                sorted.insert(key.clone(), canonicalize(value));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_json(value: &JsonValue) -> Result<String, serde_json::Error> {
    serde_json::to_string(&canonicalize(value))
}

/// Decodes a destination metadata attribute, which eLabFTW serves either as a
/// JSON-encoded string or as an embedded object. `Ok(None)` means "no metadata".
pub fn parse_metadata_blob(raw: &JsonValue) -> Result<Option<JsonValue>, serde_json::Error> {
    match raw {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) if s.trim().is_empty() => Ok(None),
        JsonValue::String(s) => serde_json::from_str::<JsonValue>(s).map(|v| match v {
            JsonValue::Null => None,
            other => Some(other),
        }),
        other => Ok(Some(other.clone())),
    }
}

/// Reads the Quartzy identifier back out of a decoded metadata blob.
pub fn linked_identifier(metadata: &JsonValue) -> Option<ExternalId> {
    metadata
        .get("extra_fields")
        .and_then(|fields| fields.get(LINK_FIELD))
        .and_then(|field| field.get("value"))
        .and_then(ExternalId::from_json)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("missing Quartzy ID for item '{name}'")]
    MissingIdentifier { name: String },
    #[error("empty metadata for item '{name}'")]
    EmptyMetadata { name: String },
}

/// Maps one Quartzy record to the eLabFTW extra fields. Empty/falsy fields are dropped.
pub fn build_metadata(record: &SourceRecord) -> Result<Metadata, MappingError> {
    let Some(qid) = record
        .id
        .as_ref()
        .filter(|id| ExternalId::from_json(id).is_some())
    else {
        return Err(MappingError::MissingIdentifier {
            name: record.display_name().to_string(),
        });
    };

    let unit_size = or_blank(record.unit_size.as_ref());
    let expiration = record.expiration_text();

    let mut candidates: Vec<(&str, ExtraField)> = vec![
        (LINK_FIELD, ExtraField::text(qid.clone())),
        ("Name", ExtraField::text(or_blank(record.name.as_ref()))),
        ("Vendor", ExtraField::text(or_blank(record.vendor.as_ref()))),
        (
            "Catalog Number",
            ExtraField::text(or_blank(record.catalog_number.as_ref())),
        ),
        (
            "Quantity",
            ExtraField::Number {
                value: or_blank(record.quantity.as_ref()),
                unit: unit_size.clone(),
                units: vec![unit_size],
            },
        ),
        (
            "Price",
            ExtraField::Number {
                value: or_blank(record.price.as_ref()),
                unit: DEFAULT_PRICE_UNIT.into(),
                units: PRICE_UNITS.iter().map(|u| JsonValue::from(*u)).collect(),
            },
        ),
        ("Open in Quartzy", ExtraField::url(or_blank(record.app_url.as_ref()))),
        (
            "Public URL",
            ExtraField::url(or_blank(record.url.as_ref())).with_description("Origin URL of the item"),
        ),
        ("Owner", ExtraField::text(record.owner_name())),
        (
            "Owner Contact",
            ExtraField::Email {
                value: or_blank(record.added_by.as_ref().and_then(|o| o.email.as_ref())),
            },
        ),
        ("Cas Number", ExtraField::text(or_blank(record.cas_number.as_ref()))),
        ("Lot Number", ExtraField::text(or_blank(record.lot_number.as_ref()))),
        (
            "Serial Number",
            ExtraField::text(or_blank(record.serial_number.as_ref())),
        ),
        ("Location", ExtraField::text(ref_name(record.location.as_ref()))),
        ("Sub-location", ExtraField::text(ref_name(record.sublocation.as_ref()))),
        (
            "Technical details",
            ExtraField::text(or_blank(record.technical_details.as_ref())),
        ),
        (
            "Expiration Date",
            ExtraField::text(or_blank(record.expiration_date.as_ref())),
        ),
    ];

    if let Some(reminder) =
        compute_reminder_date(expiration.as_deref(), record.auto_reminder.as_deref())
    {
        candidates.push(("Reminder Date", ExtraField::Date { value: reminder }));
    }

    let extra_fields: BTreeMap<String, ExtraField> = candidates
        .into_iter()
        .filter(|(_, field)| !field.is_empty())
        .map(|(label, field)| (label.to_string(), field))
        .collect();

    if extra_fields.is_empty() {
        return Err(MappingError::EmptyMetadata {
            name: record.display_name().to_string(),
        });
    }

    Ok(Metadata { extra_fields })
}

/// Item body built from the technical details: HTML-escaped, newlines turned into `<br>`.
pub fn technical_details_html(details: Option<&str>) -> String {
    match details {
        Some(text) if !text.is_empty() => {
            let escaped = escape_html(text).replace('\n', "<br>");
            format!("<h1>Technical details</h1>\n<p>{escaped}</p>")
        }
        _ => String::new(),
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}
