//! Loosely validated access to request fields.
//!
//! Fields are taken straight from the decoded MessagePack map. A documented
//! field with the wrong type is a hard error; it is never defaulted.

use rmpv::Value;

/// A request field was missing or had the wrong type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {field} to be {expected}")]
pub struct FieldError {
    pub field: String,
    pub expected: &'static str,
}

impl FieldError {
    pub fn new(field: impl Into<String>, expected: &'static str) -> Self {
        Self {
            field: field.into(),
            expected,
        }
    }
}

/// The key/value pairs of one request map.
#[derive(Debug, Clone, Default)]
pub struct Fields(Vec<(Value, Value)>);

impl Fields {
    pub fn new(entries: Vec<(Value, Value)>) -> Self {
        Self(entries)
    }

    /// Value for `key`; nil counts as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
            .filter(|v| !v.is_nil())
    }

    pub fn str(&self, key: &str) -> Result<&str, FieldError> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| FieldError::new(key, "a string"))
    }

    pub fn opt_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, FieldError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => raw_bytes(value)
                .map(|b| Some(b.to_vec()))
                .ok_or_else(|| FieldError::new(key, "a string")),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool, FieldError> {
        self.get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| FieldError::new(key, "a boolean"))
    }

    /// Map entries of `key`. An empty array is an empty map, which is how
    /// PHP clients pack `[]`.
    fn map_entries(&self, key: &str) -> Result<&[(Value, Value)], FieldError> {
        match self.get(key) {
            Some(Value::Map(entries)) => Ok(entries.as_slice()),
            Some(Value::Array(items)) if items.is_empty() => Ok(&[][..]),
            _ => Err(FieldError::new(key, "an object")),
        }
    }

    /// A map of string to string, in wire order.
    pub fn string_map(&self, key: &str) -> Result<Vec<(String, String)>, FieldError> {
        let entries = self.map_entries(key)?;

        entries
            .iter()
            .map(|(k, v)| {
                let k = k
                    .as_str()
                    .ok_or_else(|| FieldError::new(format!("{key} key"), "a string"))?;
                let v = v
                    .as_str()
                    .ok_or_else(|| FieldError::new(format!("{key}.{k}"), "a string"))?;
                Ok((k.to_string(), v.to_string()))
            })
            .collect()
    }

    pub fn string_list(&self, key: &str) -> Result<Vec<String>, FieldError> {
        let items = self
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| FieldError::new(key, "an array"))?;

        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| FieldError::new(format!("{key} entries"), "strings"))
            })
            .collect()
    }

    /// Arbitrary JSON-compatible value; absent becomes null.
    pub fn json(&self, key: &str) -> Result<serde_json::Value, FieldError> {
        match self.get(key) {
            None => Ok(serde_json::Value::Null),
            Some(value) => to_json(value).map_err(|_| FieldError::new(key, "JSON-compatible")),
        }
    }

    /// JSON object; absent becomes empty.
    pub fn json_object(
        &self,
        key: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, FieldError> {
        match self.json(key)? {
            serde_json::Value::Null => Ok(serde_json::Map::new()),
            serde_json::Value::Array(items) if items.is_empty() => Ok(serde_json::Map::new()),
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(FieldError::new(key, "an object")),
        }
    }

    /// Upload map of `name → {t: content type, v: raw value}`.
    pub fn files(&self, key: &str) -> Result<Vec<(String, String, Vec<u8>)>, FieldError> {
        if self.get(key).is_none() {
            return Ok(Vec::new());
        }
        let entries = self.map_entries(key)?;

        let mut files = Vec::with_capacity(entries.len());
        for (name, file) in entries {
            let name = name
                .as_str()
                .ok_or_else(|| FieldError::new(format!("{key} key"), "a string"))?;
            let file = Fields::new(
                file.as_map()
                    .cloned()
                    .ok_or_else(|| FieldError::new(format!("{key}.{name}"), "an object"))?,
            );
            let content_type = file
                .str("t")
                .map_err(|_| FieldError::new(format!("{key}.{name}.t"), "a string"))?;
            let data = file
                .get("v")
                .and_then(raw_bytes)
                .ok_or_else(|| FieldError::new(format!("{key}.{name}.v"), "a string or binary"))?;
            files.push((name.to_string(), content_type.to_string(), data.to_vec()));
        }
        Ok(files)
    }
}

/// Bytes of a string (valid UTF-8 or not) or binary value.
fn raw_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::String(s) => Some(s.as_bytes()),
        Value::Binary(b) => Some(b),
        _ => None,
    }
}

/// The MessagePack value has no JSON equivalent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value cannot be represented as JSON: {0}")]
pub struct NotJson(&'static str);

pub fn to_json(value: &Value) -> Result<serde_json::Value, NotJson> {
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => {
            if let Some(n) = i.as_u64() {
                serde_json::Value::from(n)
            } else if let Some(n) = i.as_i64() {
                serde_json::Value::from(n)
            } else {
                return Err(NotJson("integer out of range"));
            }
        }
        Value::F32(f) => float_to_json(f64::from(*f))?,
        Value::F64(f) => float_to_json(*f)?,
        Value::String(s) => serde_json::Value::String(
            s.as_str().ok_or(NotJson("string is not UTF-8"))?.to_string(),
        ),
        Value::Binary(_) => return Err(NotJson("binary")),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<Result<_, _>>()?)
        }
        Value::Map(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let k = k.as_str().ok_or(NotJson("map key is not a string"))?;
                map.insert(k.to_string(), to_json(v)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Ext(..) => return Err(NotJson("extension type")),
    })
}

fn float_to_json(f: f64) -> Result<serde_json::Value, NotJson> {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .ok_or(NotJson("non-finite float"))
}

pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::from(k.as_str()), from_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(entries: Vec<(&str, Value)>) -> Fields {
        Fields::new(
            entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        )
    }

    #[test]
    fn wrong_primitive_type_is_an_error() {
        let f = fields(vec![("un", Value::from(5u64)), ("r", Value::from("yes"))]);
        assert_eq!(f.str("un").unwrap_err().to_string(), "expected un to be a string");
        assert_eq!(f.bool("r").unwrap_err().to_string(), "expected r to be a boolean");
        assert_eq!(f.str("pw").unwrap_err().to_string(), "expected pw to be a string");
    }

    #[test]
    fn nil_counts_as_absent() {
        let f = fields(vec![("se", Value::Nil), ("q", Value::Nil)]);
        assert_eq!(f.opt_bytes("se").unwrap(), None);
        assert!(f.json_object("q").unwrap().is_empty());
    }

    #[test]
    fn string_map_rejects_non_string_values() {
        let f = fields(vec![(
            "co",
            Value::Map(vec![
                (Value::from("a"), Value::from("1")),
                (Value::from("b"), Value::from(2u64)),
            ]),
        )]);
        assert_eq!(
            f.string_map("co").unwrap_err().to_string(),
            "expected co.b to be a string"
        );
    }

    #[test]
    fn empty_array_counts_as_empty_map() {
        let f = fields(vec![
            ("co", Value::Array(vec![])),
            ("q", Value::Array(vec![])),
            ("f", Value::Array(vec![])),
        ]);
        assert!(f.string_map("co").unwrap().is_empty());
        assert!(f.json_object("q").unwrap().is_empty());
        assert!(f.files("f").unwrap().is_empty());

        let f = fields(vec![("co", Value::Array(vec![Value::from("a=1")]))]);
        assert_eq!(
            f.string_map("co").unwrap_err().to_string(),
            "expected co to be an object"
        );
    }

    #[test]
    fn files_flatten_in_order() {
        let f = fields(vec![(
            "f",
            Value::Map(vec![
                (
                    Value::from("picture"),
                    Value::Map(vec![
                        (Value::from("t"), Value::from("image/png")),
                        (Value::from("v"), Value::Binary(vec![0x89, 0x50])),
                    ]),
                ),
                (
                    Value::from("notes"),
                    Value::Map(vec![
                        (Value::from("t"), Value::from("text/plain")),
                        (Value::from("v"), Value::from("hi")),
                    ]),
                ),
            ]),
        )]);

        let files = f.files("f").unwrap();
        assert_eq!(
            files,
            vec![
                ("picture".to_string(), "image/png".to_string(), vec![0x89, 0x50]),
                ("notes".to_string(), "text/plain".to_string(), b"hi".to_vec()),
            ]
        );
    }

    #[test]
    fn json_conversion_preserves_structure() {
        let original = json!({
            "fields": ["id", "name"],
            "limit": 20,
            "offset": -1,
            "ratio": 0.5,
            "filter": {"enabled": true, "note": null}
        });
        let packed = from_json(&original);
        assert_eq!(to_json(&packed).unwrap(), original);
    }

    #[test]
    fn binary_is_not_json() {
        assert!(to_json(&Value::Binary(vec![1, 2])).is_err());
        let f = fields(vec![("b", Value::Binary(vec![1]))]);
        assert_eq!(
            f.json("b").unwrap_err().to_string(),
            "expected b to be JSON-compatible"
        );
    }
}
