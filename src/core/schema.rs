//! Structural validation of capability parameters and return values.
//!
//! Supports the subset of JSON Schema capabilities actually declare:
//! `required`, `properties[*].type`, `minimum` / `maximum` and `pattern`.
//! Unknown `type` keywords are skipped so newer schemas keep validating.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};

use super::chain::Interceptor;
use super::context::ExecutionContext;
use crate::error::{CapabilityError, ErrorCode};

/// Default interceptor order: after permission checks, before audit.
pub const SCHEMA_ORDER: i32 = 200;

/// Validates values against capability schemas. Compiled patterns are cached.
#[derive(Debug, Default)]
pub struct SchemaValidator {
    patterns: DashMap<String, Option<Regex>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `parameters` against a capability's parameter schema.
    ///
    /// Required fields are checked first and the first missing one fails.
    /// An absent or empty schema always passes.
    pub fn validate_parameters(
        &self,
        capability_id: &str,
        schema: &Value,
        parameters: &Map<String, Value>,
    ) -> Result<(), CapabilityError> {
        let Some(schema) = schema.as_object().filter(|s| !s.is_empty()) else {
            return Ok(());
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if parameters.get(name).map_or(true, Value::is_null) {
                    return Err(CapabilityError::new(
                        ErrorCode::ParameterRequired,
                        format!(
                            "Required parameter '{}' is missing for capability: {}",
                            name, capability_id
                        ),
                    ));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in properties {
                if let Some(value) = parameters.get(name) {
                    self.validate_property(name, value, prop_schema)?;
                }
            }
        }

        log::debug!("Parameters validated for capability: {}", capability_id);
        Ok(())
    }

    /// Shallow check of the declared return type.
    pub fn validate_return(
        &self,
        capability_id: &str,
        schema: &Value,
        value: &Value,
    ) -> Result<(), CapabilityError> {
        let Some(expected) = schema.get("type").and_then(Value::as_str) else {
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        check_type("return value", value, expected).map_err(|e| {
            CapabilityError::new(
                ErrorCode::SchemaValidationFailed,
                format!("Return value of {} is invalid: {}", capability_id, e),
            )
        })
    }

    fn validate_property(&self, name: &str, value: &Value, schema: &Value) -> Result<(), CapabilityError> {
        if let Some(expected) = schema.get("type").and_then(Value::as_str) {
            check_type(name, value, expected)?;
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    return Err(CapabilityError::invalid_parameter(format!(
                        "Parameter '{}' must be at least {}",
                        name, min
                    )));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    return Err(CapabilityError::invalid_parameter(format!(
                        "Parameter '{}' must be at most {}",
                        name, max
                    )));
                }
            }
        }

        if let (Some(s), Some(pattern)) = (
            value.as_str(),
            schema.get("pattern").and_then(Value::as_str).filter(|p| !p.is_empty()),
        ) {
            if let Some(re) = self.compiled(name, pattern) {
                if !re.is_match(s) {
                    return Err(CapabilityError::invalid_parameter(format!(
                        "Parameter '{}' does not match pattern: {}",
                        name, pattern
                    )));
                }
            }
        }

        Ok(())
    }

    /// Full-match regex for `pattern`, or `None` if it does not compile.
    fn compiled(&self, name: &str, pattern: &str) -> Option<Regex> {
        if let Some(entry) = self.patterns.get(pattern) {
            return entry.clone();
        }
        let compiled = match Regex::new(&format!("^(?:{})$", pattern)) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("Invalid regex pattern for parameter '{}': {} ({})", name, pattern, e);
                None
            }
        };
        self.patterns.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

// ---------------------------------------------------------------------------
// Interceptor
// ---------------------------------------------------------------------------

/// Runs the validator inside the chain so bad parameters never reach the
/// target. Return-type mismatches are only logged.
#[derive(Debug, Clone, Default)]
pub struct SchemaInterceptor {
    validator: Arc<SchemaValidator>,
}

impl SchemaInterceptor {
    pub fn new(validator: Arc<SchemaValidator>) -> Self {
        Self { validator }
    }
}

impl Interceptor for SchemaInterceptor {
    fn name(&self) -> &str {
        "schema"
    }

    fn order(&self) -> i32 {
        SCHEMA_ORDER
    }

    fn pre_handle(&self, ctx: &mut ExecutionContext) -> Result<bool, CapabilityError> {
        self.validator.validate_parameters(
            &ctx.capability.id,
            &ctx.capability.parameter_schema,
            &ctx.parameters,
        )?;
        Ok(true)
    }

    fn post_handle(&self, ctx: &mut ExecutionContext, result: &Value) -> Result<(), CapabilityError> {
        if let Err(e) = self
            .validator
            .validate_return(&ctx.capability.id, &ctx.capability.return_schema, result)
        {
            log::warn!("{}", e);
        }
        Ok(())
    }
}

fn check_type(name: &str, value: &Value, expected: &str) -> Result<(), CapabilityError> {
    let (ok, article) = match expected {
        "string" => (value.is_string(), "a string"),
        "integer" => (is_integer(value), "an integer"),
        "number" => (value.is_number(), "a number"),
        "boolean" => (value.is_boolean(), "a boolean"),
        "array" => (value.is_array(), "an array"),
        "object" => (value.is_object(), "an object"),
        "null" => (value.is_null(), "null"),
        other => {
            log::debug!("Unknown type '{}' for {}, skipping type validation", other, name);
            return Ok(());
        }
    };
    if ok {
        Ok(())
    } else {
        Err(CapabilityError::invalid_parameter(format!("{} must be {}", name, article)))
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["player", "amount"],
            "properties": {
                "player": {"type": "string", "pattern": "[A-Za-z0-9_]{3,16}"},
                "amount": {"type": "integer", "minimum": 1, "maximum": 64},
                "reason": {"type": "string"},
                "meta": {"type": "future-type"}
            }
        })
    }

    #[test]
    fn test_empty_schema_passes() {
        let v = SchemaValidator::new();
        v.validate_parameters("x", &Value::Null, &params(json!({"a": 1}))).unwrap();
        v.validate_parameters("x", &json!({}), &params(json!({}))).unwrap();
    }

    #[test]
    fn test_first_missing_required_fails_fast() {
        let v = SchemaValidator::new();
        let err = v
            .validate_parameters("inv.give", &schema(), &params(json!({"amount": "nope"})))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ParameterRequired));
        assert_eq!(
            err.to_string(),
            "Required parameter 'player' is missing for capability: inv.give"
        );
    }

    #[test]
    fn test_type_and_range_checks() {
        let v = SchemaValidator::new();
        let err = v
            .validate_parameters("inv.give", &schema(), &params(json!({"player": "Steve", "amount": "3"})))
            .unwrap_err();
        assert_eq!(err.to_string(), "amount must be an integer");

        let err = v
            .validate_parameters("inv.give", &schema(), &params(json!({"player": "Steve", "amount": 65})))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ParameterInvalid));
        assert_eq!(err.to_string(), "Parameter 'amount' must be at most 64");

        v.validate_parameters(
            "inv.give",
            &schema(),
            &params(json!({"player": "Steve", "amount": 64, "meta": [1]})),
        )
        .unwrap();
    }

    #[test]
    fn test_pattern_must_match_whole_string() {
        let v = SchemaValidator::new();
        let err = v
            .validate_parameters("inv.give", &schema(), &params(json!({"player": "St eve!", "amount": 1})))
            .unwrap_err();
        assert!(err.to_string().contains("does not match pattern"));

        // A substring match is not enough.
        let err = v
            .validate_parameters(
                "inv.give",
                &schema(),
                &params(json!({"player": "this_name_is_way_too_long_for_it", "amount": 1})),
            )
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ParameterInvalid));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let v = SchemaValidator::new();
        let schema = json!({"properties": {"name": {"type": "string", "pattern": "(unclosed"}}});
        v.validate_parameters("x", &schema, &params(json!({"name": "anything"}))).unwrap();
    }

    #[test]
    fn test_validate_return_checks_type_only() {
        let v = SchemaValidator::new();
        let schema = json!({"type": "object", "properties": {"time": {"type": "integer"}}});
        v.validate_return("t", &schema, &json!({"time": "not checked"})).unwrap();
        let err = v.validate_return("t", &schema, &json!([1, 2])).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SchemaValidationFailed));
        v.validate_return("t", &Value::Null, &json!(5)).unwrap();
    }

    #[test]
    fn test_interceptor_rejects_before_target_and_tolerates_bad_return() {
        use crate::capabilities::capability::{handler_fn, CapabilityBinding, CapabilitySpec};
        use crate::capabilities::CapabilityDescriptor;
        use crate::core::context::ExecutionRequest;

        let spec = CapabilitySpec::action("inv.give", "give")
            .with_parameter_schema(schema())
            .with_return_schema(json!({"type": "boolean"}));
        let desc = Arc::new(CapabilityDescriptor::from_binding(
            CapabilityBinding::new(spec, handler_fn(|_| async { Ok(Value::Null) })),
            "p",
        ));
        let interceptor = SchemaInterceptor::default();
        assert_eq!(interceptor.order(), SCHEMA_ORDER);

        let bad = ExecutionRequest::new("r1", "inv.give", params(json!({"amount": 1})));
        let mut ctx = ExecutionContext::new(&bad, desc.clone(), None);
        let err = interceptor.pre_handle(&mut ctx).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ParameterRequired));

        let good = ExecutionRequest::new("r2", "inv.give", params(json!({"player": "Steve", "amount": 1})));
        let mut ctx = ExecutionContext::new(&good, desc, None);
        assert!(interceptor.pre_handle(&mut ctx).unwrap());
        interceptor.post_handle(&mut ctx, &json!("not a bool")).unwrap();
    }
}
