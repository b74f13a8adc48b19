//! Header extraction: turns delivery properties into the string-valued
//! header map handed to runners.

use std::collections::HashMap;

use chrono::DateTime;
use lapin::types::{AMQPValue, FieldArray};
use lapin::BasicProperties;

/// Builds the handler-facing headers for one delivery.
///
/// The well-known properties are always present, empty when absent.
/// Scalar user headers are copied through coerced to strings; the
/// broker's `x-death` history is summarized as `Message-Deaths`.
pub(crate) fn extract_headers(properties: &BasicProperties) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    headers.insert(
        "Content-Type".to_string(),
        properties
            .content_type()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    );
    headers.insert(
        "Content-Encoding".to_string(),
        properties
            .content_encoding()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    );
    headers.insert(
        "Correlation-Id".to_string(),
        properties
            .correlation_id()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    );
    headers.insert(
        "Message-Id".to_string(),
        properties
            .message_id()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    );

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let Some(value) = scalar_to_string(value) {
                headers.insert(key.to_string(), value);
            }
        }

        if let Some(AMQPValue::FieldArray(deaths)) = table.inner().get("x-death") {
            if let Some(count) = message_deaths(deaths) {
                headers.insert("Message-Deaths".to_string(), count.to_string());
            }
        }
    }

    headers
}

/// Sums the `count` of every dead-letter event that was not an
/// expiry. An empty history yields no header at all.
fn message_deaths(deaths: &FieldArray) -> Option<i64> {
    let entries = deaths.as_slice();
    if entries.is_empty() {
        return None;
    }

    let mut total = 0;
    for entry in entries {
        let AMQPValue::FieldTable(death) = entry else {
            continue;
        };
        let expired = matches!(
            death.inner().get("reason"),
            Some(AMQPValue::LongString(reason)) if reason.as_bytes() == b"expired"
        );
        if expired {
            continue;
        }
        if let Some(count) = death.inner().get("count").and_then(as_i64) {
            total += count;
        }
    }
    Some(total)
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    use AMQPValue::*;
    match value {
        ShortShortInt(v) => Some(i64::from(*v)),
        ShortShortUInt(v) => Some(i64::from(*v)),
        ShortInt(v) => Some(i64::from(*v)),
        ShortUInt(v) => Some(i64::from(*v)),
        LongInt(v) => Some(i64::from(*v)),
        LongUInt(v) => Some(i64::from(*v)),
        LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Coerces one scalar header value to its string form: integers and
/// floats in decimal, booleans as `true`/`false`, byte sequences as
/// UTF-8 and timestamps as RFC 1123 GMT. Compound values are skipped.
fn scalar_to_string(value: &AMQPValue) -> Option<String> {
    use AMQPValue::*;
    match value {
        Boolean(v) => Some(v.to_string()),
        ShortShortInt(v) => Some(v.to_string()),
        ShortShortUInt(v) => Some(v.to_string()),
        ShortInt(v) => Some(v.to_string()),
        ShortUInt(v) => Some(v.to_string()),
        LongInt(v) => Some(v.to_string()),
        LongUInt(v) => Some(v.to_string()),
        LongLongInt(v) => Some(v.to_string()),
        Float(v) => Some(v.to_string()),
        Double(v) => Some(v.to_string()),
        ShortString(v) => Some(v.to_string()),
        LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        ByteArray(v) => Some(String::from_utf8_lossy(v.as_slice()).into_owned()),
        Timestamp(v) => rfc1123(*v),
        _ => None,
    }
}

fn rfc1123(timestamp: u64) -> Option<String> {
    let seconds = i64::try_from(timestamp).ok()?;
    let time = DateTime::from_timestamp(seconds, 0)?;
    Some(time.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldTable, ShortString};

    fn death(reason: &str, count: i64) -> AMQPValue {
        let mut table = FieldTable::default();
        table.insert("reason".into(), AMQPValue::LongString(reason.into()));
        table.insert("count".into(), AMQPValue::LongLongInt(count));
        table.insert("queue".into(), AMQPValue::LongString("upload".into()));
        AMQPValue::FieldTable(table)
    }

    fn with_headers(table: FieldTable) -> BasicProperties {
        BasicProperties::default().with_headers(table)
    }

    #[test]
    fn well_known_properties_are_synthesized() {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_correlation_id(ShortString::from("abc-123"));

        let headers = extract_headers(&properties);
        assert_eq!(headers["Content-Type"], "application/json");
        assert_eq!(headers["Correlation-Id"], "abc-123");
        // Absent properties are present but empty.
        assert_eq!(headers["Content-Encoding"], "");
        assert_eq!(headers["Message-Id"], "");
    }

    #[test]
    fn scalar_user_headers_are_coerced_to_strings() {
        let mut table = FieldTable::default();
        table.insert("retries".into(), AMQPValue::LongInt(7));
        table.insert("ratio".into(), AMQPValue::Double(0.5));
        table.insert("flag".into(), AMQPValue::Boolean(true));
        table.insert("raw".into(), AMQPValue::LongString("plain".into()));
        table.insert(
            "sent-at".into(),
            AMQPValue::Timestamp(1_700_000_000),
        );

        let headers = extract_headers(&with_headers(table));
        assert_eq!(headers["retries"], "7");
        assert_eq!(headers["ratio"], "0.5");
        assert_eq!(headers["flag"], "true");
        assert_eq!(headers["raw"], "plain");
        assert_eq!(headers["sent-at"], "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn deaths_are_summed_excluding_expiries() {
        let mut deaths = FieldArray::default();
        deaths.push(death("expired", 4));
        deaths.push(death("rejected", 1));
        deaths.push(death("rejected", 5));

        let mut table = FieldTable::default();
        table.insert("x-death".into(), AMQPValue::FieldArray(deaths));

        let headers = extract_headers(&with_headers(table));
        assert_eq!(headers["Message-Deaths"], "6");
    }

    #[test]
    fn an_empty_death_history_yields_no_header() {
        let mut table = FieldTable::default();
        table.insert("x-death".into(), AMQPValue::FieldArray(FieldArray::default()));

        let headers = extract_headers(&with_headers(table));
        assert!(!headers.contains_key("Message-Deaths"));
    }

    #[test]
    fn a_malformed_death_history_is_ignored() {
        let mut table = FieldTable::default();
        table.insert("x-death".into(), AMQPValue::LongString("nonsense".into()));

        let headers = extract_headers(&with_headers(table));
        assert!(!headers.contains_key("Message-Deaths"));
        // The malformed value is a string, so the scalar pass copies it.
        assert_eq!(headers["x-death"], "nonsense");
    }
}
