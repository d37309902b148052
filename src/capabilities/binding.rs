//! Parameter binding tables and structural argument coercion.
//!
//! Every capability declares an ordered list of [`ParamBinding`]s when it is
//! registered. At call time [`bind_arguments`] walks that table once, pulls
//! each logical name out of the incoming JSON parameters, falls back to the
//! declared default, and runs the value through [`coerce`]. Handlers receive
//! the result as [`BoundArgs`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{CapabilityError, ErrorCode};

// ---------------------------------------------------------------------------
// Binding table
// ---------------------------------------------------------------------------

/// The declared type of a capability parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    /// A closed set of string values. Matching is exact first, then
    /// case-insensitive; the canonical spelling is what the handler sees.
    Enum { name: String, variants: Vec<String> },
    Array,
    Object,
    /// No coercion; the raw JSON value is passed through.
    Any,
}

impl ParamKind {
    pub fn enumeration<I, S>(name: impl Into<String>, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum {
            name: name.into(),
            variants: variants.into_iter().map(Into::into).collect(),
        }
    }

    /// JSON Schema `type` keyword for this kind, if it has one.
    pub fn json_type(&self) -> Option<&'static str> {
        match self {
            Self::String | Self::Enum { .. } => Some("string"),
            Self::Integer => Some("integer"),
            Self::Number => Some("number"),
            Self::Boolean => Some("boolean"),
            Self::Array => Some("array"),
            Self::Object => Some("object"),
            Self::Any => None,
        }
    }
}

/// One row of a capability's parameter binding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBinding {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    /// Textual default, parsed with [`parse_default_value`] when the
    /// argument is absent.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl ParamBinding {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// JSON Schema fragment describing this parameter.
    pub fn schema(&self) -> Value {
        let mut prop = Map::new();
        if let Some(t) = self.kind.json_type() {
            prop.insert("type".into(), Value::String(t.to_string()));
        }
        if !self.description.is_empty() {
            prop.insert("description".into(), Value::String(self.description.clone()));
        }
        if let ParamKind::Enum { variants, .. } = &self.kind {
            prop.insert(
                "enum".into(),
                Value::Array(variants.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(default) = &self.default {
            prop.insert("default".into(), parse_default_value(default));
        }
        Value::Object(prop)
    }
}

/// Build an object schema from a binding table.
pub fn schema_from_bindings(bindings: &[ParamBinding]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for binding in bindings {
        properties.insert(binding.name.clone(), binding.schema());
        if binding.required {
            required.push(Value::String(binding.name.clone()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ---------------------------------------------------------------------------
// Bound arguments
// ---------------------------------------------------------------------------

/// Arguments after binding and coercion, keyed by logical name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    values: Map<String, Value>,
}

impl BoundArgs {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// The value bound to `name`, treating JSON `null` as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Like [`str`](Self::str) but reports a missing argument as
    /// `PARAMETER_REQUIRED`.
    pub fn require_str(&self, name: &str) -> Result<&str, CapabilityError> {
        self.str(name).ok_or_else(|| {
            CapabilityError::new(
                ErrorCode::ParameterRequired,
                format!("Required parameter '{}' is missing", name),
            )
        })
    }

    /// Reconstruct a structured argument (record, list, map) with serde.
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CapabilityError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                CapabilityError::invalid_parameter(format!(
                    "Parameter '{}' has an unexpected shape: {}",
                    name, e
                ))
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }
}

// ---------------------------------------------------------------------------
// Binding and coercion
// ---------------------------------------------------------------------------

/// Bind raw parameters against a capability's table.
///
/// A capability with an empty table receives the raw parameters untouched.
pub fn bind_arguments(
    capability_id: &str,
    bindings: &[ParamBinding],
    params: &Map<String, Value>,
) -> Result<BoundArgs, CapabilityError> {
    if bindings.is_empty() {
        return Ok(BoundArgs::new(params.clone()));
    }

    let mut values = Map::new();
    for binding in bindings {
        let supplied = params.get(&binding.name).filter(|v| !v.is_null());
        let value = match (supplied, &binding.default) {
            (Some(v), _) => coerce(&binding.name, v, &binding.kind)?,
            (None, Some(default)) => {
                coerce(&binding.name, &parse_default_value(default), &binding.kind)?
            }
            (None, None) if binding.required => {
                return Err(CapabilityError::new(
                    ErrorCode::ParameterRequired,
                    format!(
                        "Required parameter '{}' is missing for capability: {}",
                        binding.name, capability_id
                    ),
                ));
            }
            (None, None) => Value::Null,
        };
        values.insert(binding.name.clone(), value);
    }
    Ok(BoundArgs::new(values))
}

/// Truncate toward zero. `None` outside the `i64` range.
fn float_to_i64(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f.trunc() as i64)
    } else {
        None
    }
}

/// Coerce one JSON value into the shape `kind` expects.
pub fn coerce(name: &str, value: &Value, kind: &ParamKind) -> Result<Value, CapabilityError> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match kind {
        ParamKind::Any => Ok(value.clone()),
        ParamKind::String => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        ParamKind::Integer => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(float_to_i64)),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            parsed
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| mismatch(name, "an integer", value))
        }
        ParamKind::Number => {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(name, "a number", value))
        }
        ParamKind::Boolean => Ok(Value::Bool(match value {
            Value::Bool(b) => *b,
            Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        })),
        ParamKind::Enum {
            name: type_name,
            variants,
        } => {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            variants
                .iter()
                .find(|v| **v == raw)
                .or_else(|| variants.iter().find(|v| v.eq_ignore_ascii_case(&raw)))
                .map(|v| Value::String(v.clone()))
                .ok_or_else(|| {
                    CapabilityError::new(
                        ErrorCode::InvalidEnumValue,
                        format!(
                            "Invalid enum value '{}' for type {}. Valid values: {}",
                            raw,
                            type_name,
                            variants.join(", ")
                        ),
                    )
                })
        }
        ParamKind::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(mismatch(name, "an array", value)),
        },
        ParamKind::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(mismatch(name, "an object", value)),
        },
    }
}

fn mismatch(name: &str, expected: &str, value: &Value) -> CapabilityError {
    CapabilityError::invalid_parameter(format!(
        "Parameter '{}' expects {}, got {}",
        name, expected, value
    ))
}

/// Parse a textual default: `true`/`false` become booleans, text containing
/// a `.` is tried as a float, anything else as an integer, and whatever
/// fails all of those stays a string.
pub fn parse_default_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.contains('.') {
        if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    } else if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    Value::String(raw.to_string())
}
