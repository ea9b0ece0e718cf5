//! Tool registry: DAGs published to the model as callable tools

use crate::schema::params_to_schema;
use dagflow_common::error::{Error, Result, ResultExt};
use dagflow_common::llm::ToolDefinition;
use dagflow_core::dag::Dag;
use dagflow_core::store::DagDatabase;

/// One resolved tool
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub dag: Dag,
    pub definition: ToolDefinition,
}

/// Tools resolvable by the chat loop
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
}

impl ToolRegistry {
    /// Resolve each tool name, first in the parent DAG's inline `local_dags`,
    /// otherwise through the DAG database
    pub async fn build(
        names: &[String],
        parent: &Dag,
        db: &dyn DagDatabase,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        for name in names {
            let dag = match parent.local_dags.get(name) {
                Some(local) => local.clone(),
                None => db
                    .get_dag(name)
                    .await
                    .ctx(format!("resolving tool DAG {name}"))?,
            };
            let definition = ToolDefinition {
                name: dag.name.clone(),
                description: dag.description.clone(),
                parameters: params_to_schema(dag.params.as_deref().unwrap_or_default()),
            };
            entries.push(ToolEntry { dag, definition });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.iter().find(|e| e.definition.name == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serialize tool-call arguments as a params string: sorted `KEY=value`
/// pairs, values quoted when they contain whitespace, integral floats
/// rendered as integers, arrays and objects JSON-encoded.
pub fn args_to_params(args: &serde_json::Value) -> Result<String> {
    let serde_json::Value::Object(map) = args else {
        return Err(Error::Validation(format!(
            "tool arguments must be a JSON object, got: {args}"
        )));
    };

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let rendered = render_value(&map[key]);
        parts.push(format!("{key}={rendered}"));
    }
    Ok(parts.join(" "))
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => quote_if_needed(s),
        serde_json::Value::Number(n) => {
            // Providers send integers as f64; keep them integral
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                    return (f as i64).to_string();
                }
            }
            n.to_string()
        }
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => String::new(),
        composite => quote_if_needed(&composite.to_string()),
    }
}

fn quote_if_needed(s: &str) -> String {
    if s.chars().any(char::is_whitespace) {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_core::dag::Step;
    use serde_json::json;

    fn tool_dag(name: &str, params: &str) -> Dag {
        Dag {
            name: name.to_string(),
            description: format!("{name} tool"),
            params: if params.is_empty() {
                None
            } else {
                Some(params.to_string())
            },
            steps: vec![Step {
                name: "work".to_string(),
                run: Some("true".to_string()),
                ..Step::default()
            }],
            ..Dag::default()
        }
    }

    #[tokio::test]
    async fn local_dags_win_over_database() {
        let db = dagflow_store::InMemoryDagDatabase::new();
        db.insert(tool_dag("compute", "x"));

        let mut parent = tool_dag("parent", "");
        parent
            .local_dags
            .insert("compute".to_string(), tool_dag("compute", "x y=2"));

        let registry = ToolRegistry::build(&["compute".to_string()], &parent, &db)
            .await
            .unwrap();
        let entry = registry.get("compute").unwrap();
        // Inline definition's params drove the schema
        assert!(entry.definition.parameters["properties"]["y"].is_object());
    }

    #[tokio::test]
    async fn database_fallback_and_missing_tool() {
        let db = dagflow_store::InMemoryDagDatabase::new();
        db.insert(tool_dag("compute", "x"));
        let parent = tool_dag("parent", "");

        let registry = ToolRegistry::build(&["compute".to_string()], &parent, &db)
            .await
            .unwrap();
        assert_eq!(registry.definitions().len(), 1);
        assert_eq!(registry.definitions()[0].description, "compute tool");

        let err = ToolRegistry::build(&["missing".to_string()], &parent, &db)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn args_sorted_and_quoted() {
        let params = args_to_params(&json!({"x": 1.0, "name": "hello world"})).unwrap();
        assert_eq!(params, r#"name="hello world" x=1"#);
    }

    #[test]
    fn integral_floats_become_integers() {
        let params = args_to_params(&json!({"a": 2.0, "b": 2.5, "c": true})).unwrap();
        assert_eq!(params, "a=2 b=2.5 c=true");
    }

    #[test]
    fn composites_json_encoded() {
        let params = args_to_params(&json!({"list": [1, 2], "obj": {"k": "v"}})).unwrap();
        assert_eq!(params, r#"list=[1,2] obj={"k":"v"}"#);
    }

    #[test]
    fn non_object_arguments_rejected() {
        assert!(args_to_params(&json!([1, 2])).is_err());
    }
}
