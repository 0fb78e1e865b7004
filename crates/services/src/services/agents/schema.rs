//! Structural checks of JSON values against the schemas agents publish in
//! their capabilities.

use jsonschema::{JSONSchema, ValidationError, error::ValidationErrorKind};
use schemars::{JsonSchema, generate::SchemaSettings};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::AgentError;

/// Draft-07 root schema for `T`, with nested types under `definitions`.
pub fn schema_value<T: JsonSchema>() -> Value {
    let schema = SchemaSettings::draft07()
        .into_generator()
        .into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or(Value::Null)
}

/// Every place where `value` violates `schema`, nested items and `$ref`
/// targets included. Each entry reads `path: problem`.
pub fn violations(schema: &Value, value: &Value) -> Vec<String> {
    let compiled = match JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(e) => return vec![format!("<schema>: {e}")],
    };
    match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|error| describe(&error)).collect(),
    }
}

/// Checks `input` against `T`'s schema and deserializes it.
pub fn validate_input<T>(input: &Value) -> Result<T, AgentError>
where
    T: JsonSchema + DeserializeOwned,
{
    let problems = violations(&schema_value::<T>(), input);
    if !problems.is_empty() {
        return Err(AgentError::SchemaViolation(problems));
    }
    serde_json::from_value(input.clone())
        .map_err(|e| AgentError::SchemaViolation(vec![e.to_string()]))
}

fn describe(error: &ValidationError<'_>) -> String {
    let mut path: Vec<String> = error
        .instance_path
        .to_string()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();

    if let ValidationErrorKind::Required { property } = &error.kind {
        let field = property
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| property.to_string());
        path.push(field);
        return format!("{}: required field missing", path.join("."));
    }

    let location = if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    };
    format!("{location}: {error}")
}

#[cfg(test)]
mod tests {
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::services::agents::types::BookmarkBatch;

    #[derive(Debug, Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct Sample {
        name: String,
        count: u32,
        note: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
    }

    #[test]
    fn reports_missing_required_fields() {
        let problems = violations(&schema_value::<Sample>(), &json!({ "note": "x" }));
        assert!(problems.iter().any(|p| p.starts_with("name:")));
        assert!(problems.iter().any(|p| p.starts_with("count:")));
        assert!(!problems.iter().any(|p| p.starts_with("note:")));
        assert!(!problems.iter().any(|p| p.starts_with("tags:")));
    }

    #[test]
    fn reports_type_mismatches() {
        let problems = violations(
            &schema_value::<Sample>(),
            &json!({ "name": 7, "count": 1, "tags": "a,b" }),
        );
        assert_eq!(problems.len(), 2, "{problems:?}");
        assert!(problems[0].contains("name") || problems[1].contains("name"));
    }

    #[test]
    fn non_object_input_is_rejected() {
        let problems = violations(&schema_value::<Sample>(), &json!([1, 2, 3]));
        assert_eq!(problems.len(), 1, "{problems:?}");
        assert!(problems[0].starts_with("<root>:"));
    }

    #[test]
    fn nested_items_are_checked_against_their_definitions() {
        let schema = schema_value::<BookmarkBatch>();

        let problems = violations(&schema, &json!({ "bookmarks": [42, "x", null] }));
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems.iter().any(|p| p.starts_with("bookmarks.0:")));
        assert!(problems.iter().any(|p| p.starts_with("bookmarks.2:")));

        let problems = violations(
            &schema,
            &json!({ "bookmarks": [{ "url": "https://a.example" }, { "title": "no url" }] }),
        );
        assert_eq!(problems, vec!["bookmarks.1.url: required field missing".to_string()]);

        let problems = violations(
            &schema,
            &json!({ "bookmarks": [{ "url": "https://a.example", "categories": "dev" }] }),
        );
        assert_eq!(problems.len(), 1, "{problems:?}");
        assert!(problems[0].starts_with("bookmarks.0.categories:"));
    }

    #[test]
    fn conforming_batches_pass() {
        let batch = json!({
            "bookmarks": [{
                "url": "https://www.rust-lang.org/",
                "title": "Rust",
                "tags": ["lang"],
                "add_date": "2024-01-02T03:04:05Z",
                "embedding": [0.5, 0.5]
            }]
        });
        assert!(violations(&schema_value::<BookmarkBatch>(), &batch).is_empty());
    }

    #[test]
    fn validate_input_parses_conforming_values() {
        let sample: Sample =
            validate_input(&json!({ "name": "a", "count": 2, "note": null })).expect("valid");
        assert_eq!(sample.count, 2);

        let err = validate_input::<Sample>(&json!({ "name": "a" })).expect_err("invalid");
        assert!(matches!(err, AgentError::SchemaViolation(fields) if fields.len() == 1));
    }
}
