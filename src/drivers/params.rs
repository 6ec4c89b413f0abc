//! Driver parameter decoding.
//!
//! Parameters arrive as a string map and reach the driver's config as raw
//! text. Non-string fields opt into parsing with `from_text`, so a key such
//! as `"1e3"` stays exactly as written in a `String` field.

use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::drivers::DriverError;

/// Decode `params` into `C`, naming `driver` in any error.
pub fn decode<C: DeserializeOwned>(
    driver: &str,
    params: &HashMap<String, String>,
) -> Result<C, DriverError> {
    let object: Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    serde_json::from_value(Value::Object(object)).map_err(|e| DriverError::InvalidParams {
        driver: driver.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a number or boolean from its text form.
pub fn from_text<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let text = match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => return Err(D::Error::custom(format!("expected a scalar, got {}", other))),
    };
    text.trim()
        .parse()
        .map_err(|e| D::Error::custom(format!("{:?}: {}", text, e)))
}

/// Accept a string, number or boolean as a `String`.
pub fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!("expected a string, got {}", other))),
    }
}

/// Accept `"a, b"` or the JSON array text `["a", "b"]` as a list of strings.
pub fn comma_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let items = match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim_start().starts_with('[') => {
            let values: Vec<Value> = serde_json::from_str(&s).map_err(D::Error::custom)?;
            values
                .into_iter()
                .map(|value| match value {
                    Value::String(s) => Ok(s),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(D::Error::custom(format!("expected a list item, got {}", other))),
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        Value::String(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
        Value::Null => Vec::new(),
        other => return Err(D::Error::custom(format!("expected a list, got {}", other))),
    };
    Ok(items.into_iter().filter(|s| !s.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "from_text")]
        enabled: bool,
        #[serde(default, deserialize_with = "from_text")]
        period_ms: u64,
        #[serde(deserialize_with = "lenient_string")]
        name: String,
        #[serde(default, deserialize_with = "comma_list")]
        keys: Vec<String>,
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_parses_typed_fields() {
        let s: Sample = decode(
            "sample",
            &params(&[
                ("enabled", "true"),
                ("period_ms", " 2500 "),
                ("name", "1234"),
                ("keys", "a, b,,c"),
            ]),
        )
        .unwrap();
        assert!(s.enabled);
        assert_eq!(s.period_ms, 2500);
        assert_eq!(s.name, "1234");
        assert_eq!(s.keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_numeric_looking_strings_are_kept_verbatim() {
        let long = "12345678901234567890123";
        let s: Sample = decode(
            "sample",
            &params(&[("name", "1e3"), ("keys", &format!("1e3, {long}, 007, true"))]),
        )
        .unwrap();
        assert_eq!(s.name, "1e3");
        assert_eq!(s.keys, vec!["1e3", long, "007", "true"]);
    }

    #[test]
    fn test_decode_accepts_json_array() {
        let s: Sample = decode("sample", &params(&[("name", "x"), ("keys", "[\"k1\", \"1e3\", 2]")])).unwrap();
        assert_eq!(s.keys, vec!["k1", "1e3", "2"]);
        assert!(!s.enabled);
    }

    #[test]
    fn test_decode_error_names_driver() {
        let err = decode::<Sample>("sample", &params(&[("name", "x"), ("period_ms", "soon")])).unwrap_err();
        match err {
            DriverError::InvalidParams { driver, reason } => {
                assert_eq!(driver, "sample");
                assert!(reason.contains("soon"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field() {
        assert!(decode::<Sample>("sample", &HashMap::new()).is_err());
    }
}
