//! Structured response extraction: free-form model text → validated JSON.
//!
//! Models wrap JSON in code fences, prefix it with chatter, or drift from the
//! requested shape. [`extract`] strips fences, locates the outermost JSON
//! payload, parses it, and validates it against a [`Schema`]. Failures come
//! back as one of two distinct kinds:
//!
//! * [`MalformedResponse::Parse`]: nothing parsable was found.
//! * [`MalformedResponse::SchemaViolation`]: JSON was found but a field is
//!   missing or has the wrong type/range. Carries the field path.
//!
//! Extraction never invents values. Optional fields that are absent (or
//! `null`) stay absent; defaults are applied later by the typed model.

use crate::error::MalformedResponse;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Expected type of one schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    /// A string with at least one non-whitespace character.
    NonEmptyString,
    Bool,
    Integer,
    UnsignedInteger,
    Number,
    /// A number in `[0, 1]`.
    UnitInterval,
    /// A number strictly greater than the bound.
    GreaterThan(f64),
    /// One of a fixed set of strings (case-insensitive).
    OneOf(&'static [&'static str]),
    StringList,
    /// Object whose values are numbers or number-like strings (`"52 mm"`).
    NumberMap,
    Object,
    Any,
}

#[derive(Debug, Clone)]
struct Field {
    name: &'static str,
    ty: FieldType,
    required: bool,
}

/// Declarative description of an expected JSON object.
#[derive(Debug, Clone)]
pub struct Schema {
    name: &'static str,
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
        }
    }

    pub fn required(mut self, name: &'static str, ty: FieldType) -> Self {
        self.fields.push(Field {
            name,
            ty,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &'static str, ty: FieldType) -> Self {
        self.fields.push(Field {
            name,
            ty,
            required: false,
        });
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Validate a parsed value against the schema.
    pub fn validate(&self, value: &Value) -> Result<(), MalformedResponse> {
        let obj = value.as_object().ok_or_else(|| MalformedResponse::SchemaViolation {
            field: "$".into(),
            reason: format!("expected a {} object, found {}", self.name, type_name(value)),
        })?;

        for field in &self.fields {
            match obj.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(MalformedResponse::SchemaViolation {
                        field: field.name.into(),
                        reason: "required field is missing".into(),
                    });
                }
                None | Some(Value::Null) => {}
                Some(v) => check_type(field.name, &field.ty, v)?,
            }
        }
        Ok(())
    }

    /// Rewrite case-insensitive [`FieldType::OneOf`] matches to the listed
    /// spelling so typed deserialisation sees the exact name.
    fn canonicalize(&self, value: &mut Value) {
        let Some(obj) = value.as_object_mut() else {
            return;
        };
        for field in &self.fields {
            let FieldType::OneOf(allowed) = field.ty else {
                continue;
            };
            if let Some(slot) = obj.get_mut(field.name) {
                let canonical = slot
                    .as_str()
                    .and_then(|s| allowed.iter().find(|a| a.eq_ignore_ascii_case(s)));
                if let Some(name) = canonical {
                    *slot = Value::String((*name).to_string());
                }
            }
        }
    }
}

fn check_type(path: &str, ty: &FieldType, v: &Value) -> Result<(), MalformedResponse> {
    let violation = |reason: String| MalformedResponse::SchemaViolation {
        field: path.to_string(),
        reason,
    };

    match ty {
        FieldType::Any => Ok(()),
        FieldType::String => v
            .as_str()
            .map(|_| ())
            .ok_or_else(|| violation(format!("expected string, found {}", type_name(v)))),
        FieldType::NonEmptyString => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(()),
            Some(_) => Err(violation("must not be empty".into())),
            None => Err(violation(format!("expected string, found {}", type_name(v)))),
        },
        FieldType::Bool => v
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| violation(format!("expected boolean, found {}", type_name(v)))),
        FieldType::Integer => v
            .as_i64()
            .map(|_| ())
            .ok_or_else(|| violation(format!("expected integer, found {}", v))),
        FieldType::UnsignedInteger => v
            .as_u64()
            .map(|_| ())
            .ok_or_else(|| violation(format!("expected non-negative integer, found {}", v))),
        FieldType::Number => v
            .as_f64()
            .map(|_| ())
            .ok_or_else(|| violation(format!("expected number, found {}", type_name(v)))),
        FieldType::UnitInterval => match v.as_f64() {
            Some(n) if (0.0..=1.0).contains(&n) => Ok(()),
            Some(n) => Err(violation(format!("{} is outside [0, 1]", n))),
            None => Err(violation(format!("expected number, found {}", type_name(v)))),
        },
        FieldType::GreaterThan(bound) => match v.as_f64() {
            Some(n) if n > *bound => Ok(()),
            Some(n) => Err(violation(format!("{} must be greater than {}", n, bound))),
            None => Err(violation(format!("expected number, found {}", type_name(v)))),
        },
        FieldType::OneOf(allowed) => match v.as_str() {
            Some(s) if allowed.iter().any(|a| a.eq_ignore_ascii_case(s)) => Ok(()),
            Some(s) => Err(violation(format!(
                "'{}' is not one of [{}]",
                s,
                allowed.join(", ")
            ))),
            None => Err(violation(format!("expected string, found {}", type_name(v)))),
        },
        FieldType::StringList => {
            let items = v
                .as_array()
                .ok_or_else(|| violation(format!("expected array, found {}", type_name(v))))?;
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    return Err(MalformedResponse::SchemaViolation {
                        field: format!("{}[{}]", path, i),
                        reason: format!("expected string, found {}", type_name(item)),
                    });
                }
            }
            Ok(())
        }
        FieldType::NumberMap => {
            let map = v
                .as_object()
                .ok_or_else(|| violation(format!("expected object, found {}", type_name(v))))?;
            for (k, item) in map {
                if number_like(item).is_none() {
                    return Err(MalformedResponse::SchemaViolation {
                        field: format!("{}.{}", path, k),
                        reason: format!("expected a number, found {}", item),
                    });
                }
            }
            Ok(())
        }
        FieldType::Object => v
            .as_object()
            .map(|_| ())
            .ok_or_else(|| violation(format!("expected object, found {}", type_name(v)))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

static RE_LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*(?:mm|millimet(?:er|re)s?)?\s*$").unwrap());

/// A JSON number, or a string holding one with an optional `mm` unit.
pub fn number_like(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => RE_LEADING_NUMBER
            .captures(s)
            .and_then(|c| c[1].parse::<f64>().ok()),
        _ => None,
    }
}

// ── Locating the payload ─────────────────────────────────────────────────

static RE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[A-Za-z0-9_+-]*").unwrap());

/// Remove every code-fence marker (```` ``` ```` or ```` ```json ````).
pub fn strip_fences(text: &str) -> String {
    RE_FENCE.replace_all(text, "").into_owned()
}

/// Slice from the first `{` to the last `}`. Every schema describes an
/// object, so a `[` only starts the payload when the text has no `{` at all.
fn locate_payload(text: &str) -> Option<&str> {
    let start = text.find('{').or_else(|| text.find('['))?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse model output into a JSON value that satisfies `schema`.
pub fn extract(raw: &str, schema: &Schema) -> Result<Value, MalformedResponse> {
    let cleaned = strip_fences(raw);
    let candidate = locate_payload(&cleaned).ok_or_else(|| MalformedResponse::Parse {
        detail: format!("no JSON payload found in {} chars of output", raw.len()),
    })?;

    let mut value: Value = serde_json::from_str(candidate).map_err(|e| MalformedResponse::Parse {
        detail: format!("invalid JSON: {}", e),
    })?;

    schema.validate(&value)?;
    schema.canonicalize(&mut value);
    Ok(value)
}

/// [`extract`] followed by typed deserialisation.
///
/// Type mismatches the schema did not express surface as schema violations.
pub fn extract_as<T: DeserializeOwned>(raw: &str, schema: &Schema) -> Result<T, MalformedResponse> {
    let value = extract(raw, schema)?;
    let value = drop_nulls(value);
    serde_json::from_value(value).map_err(|e| MalformedResponse::SchemaViolation {
        field: schema.name().to_string(),
        reason: e.to_string(),
    })
}

/// Optional fields given as `null` are treated as absent so serde defaults apply.
fn drop_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new("Sample")
            .required("prompt", FieldType::NonEmptyString)
            .optional("seed", FieldType::UnsignedInteger)
            .optional("mode", FieldType::OneOf(&["fuse", "concat"]))
    }

    #[test]
    fn extracts_from_fenced_output() {
        let raw = "Here is the config:\n```json\n{\"prompt\": \"glasses\", \"mode\": \"concat\"}\n```\nDone.";
        let v = extract(raw, &schema()).unwrap();
        assert_eq!(v["prompt"], "glasses");
    }

    #[test]
    fn no_json_is_parse_error() {
        let err = extract("I cannot help with that.", &schema()).unwrap_err();
        assert!(matches!(err, MalformedResponse::Parse { .. }));
    }

    #[test]
    fn broken_json_is_parse_error() {
        let err = extract("{\"prompt\": \"glasses\",", &schema()).unwrap_err();
        assert!(matches!(err, MalformedResponse::Parse { .. }));
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let err = extract("{\"seed\": 3}", &schema()).unwrap_err();
        match err {
            MalformedResponse::SchemaViolation { field, .. } => assert_eq!(field, "prompt"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_enum_value_is_schema_violation() {
        let err = extract("{\"prompt\": \"x\", \"mode\": \"blend\"}", &schema()).unwrap_err();
        assert!(matches!(err, MalformedResponse::SchemaViolation { ref field, .. } if field == "mode"));
    }

    #[test]
    fn top_level_array_is_schema_violation() {
        let err = extract("[1, 2]", &schema()).unwrap_err();
        assert!(matches!(err, MalformedResponse::SchemaViolation { ref field, .. } if field == "$"));
    }

    #[test]
    fn null_optional_is_absent_not_invented() {
        #[derive(Deserialize)]
        struct Sample {
            prompt: String,
            #[serde(default)]
            seed: Option<u64>,
        }
        let s: Sample = extract_as("{\"prompt\": \"x\", \"seed\": null}", &schema()).unwrap();
        assert_eq!(s.prompt, "x");
        assert_eq!(s.seed, None);
    }

    #[test]
    fn number_map_accepts_unit_strings() {
        assert_eq!(number_like(&json!("52 mm")), Some(52.0));
        assert_eq!(number_like(&json!(18)), Some(18.0));
        assert_eq!(number_like(&json!("wide")), None);

        let s = Schema::new("M").required("m", FieldType::NumberMap);
        let err = s.validate(&json!({"m": {"lens_width": "wide"}})).unwrap_err();
        assert!(matches!(err, MalformedResponse::SchemaViolation { ref field, .. } if field == "m.lens_width"));
    }

    #[test]
    fn bracketed_prose_before_object_is_skipped() {
        let raw = "Config [v2] below:\n{\"prompt\": \"glasses\", \"mode\": \"fuse\"}";
        let v = extract(raw, &schema()).unwrap();
        assert_eq!(v["prompt"], "glasses");
        assert_eq!(v["mode"], "fuse");
    }

    #[test]
    fn one_of_values_take_the_listed_spelling() {
        let v = extract("{\"prompt\": \"x\", \"mode\": \"Concat\"}", &schema()).unwrap();
        assert_eq!(v["mode"], "concat");
    }

    #[test]
    fn unit_interval_bounds() {
        let s = Schema::new("P").optional("roughness", FieldType::UnitInterval);
        assert!(s.validate(&json!({"roughness": 0.4})).is_ok());
        assert!(s.validate(&json!({"roughness": 1.5})).is_err());
    }
}
