//! JSON Schema derivation from a DAG's default params string

pub use dagflow_common::params::{parse_token, split_params, ParamSpec};
use serde_json::{json, Map, Value};

/// Infer a JSON Schema type from a default value's shape
fn infer_type(default: &str) -> &'static str {
    if default.parse::<i64>().is_ok() {
        "integer"
    } else if default.parse::<f64>().is_ok() {
        "number"
    } else if default.eq_ignore_ascii_case("true") || default.eq_ignore_ascii_case("false") {
        "boolean"
    } else if default.starts_with('[') {
        "array"
    } else if default.starts_with('{') {
        "object"
    } else {
        "string"
    }
}

/// Build the JSON Schema published for a tool DAG from its default params.
///
/// Bare tokens become required string properties; `name=default` tokens
/// become optional properties whose type is inferred from the default.
pub fn params_to_schema(default_params: &str) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for token in split_params(default_params) {
        let spec = parse_token(&token);
        match spec.default {
            None => {
                properties.insert(spec.name.clone(), json!({"type": "string"}));
                required.push(Value::String(spec.name));
            }
            Some(default) => {
                let inferred = infer_type(&default);
                let mut prop = Map::new();
                prop.insert("type".to_string(), Value::String(inferred.to_string()));
                prop.insert("default".to_string(), Value::String(default));
                properties.insert(spec.name, Value::Object(prop));
            }
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
