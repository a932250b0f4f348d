use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;

use showroom_core::domain::conversation::ConversationContext;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model output does not match shape `{shape}`: {detail}")]
    SchemaViolation { shape: String, detail: String },
    #[error("model call timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("model capability unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    pub fn schema_violation(shape: &OutputShape, detail: impl Into<String>) -> Self {
        Self::SchemaViolation { shape: shape.name.to_string(), detail: detail.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Enum { values: &'static [&'static str], nullable: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShapeField {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// The closed set of fields a structured answer must carry. Every field is
/// required and nothing else is allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputShape {
    pub name: &'static str,
    pub fields: &'static [ShapeField],
}

impl OutputShape {
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in self.fields {
            let property = match field.kind {
                FieldKind::Text => json!({ "type": "string" }),
                FieldKind::Enum { values, nullable: false } => {
                    json!({ "type": "string", "enum": values })
                }
                FieldKind::Enum { values, nullable: true } => {
                    let mut allowed: Vec<Value> =
                        values.iter().map(|value| Value::from(*value)).collect();
                    allowed.push(Value::Null);
                    json!({ "type": ["string", "null"], "enum": allowed })
                }
            };
            properties.insert(field.name.to_string(), property);
        }

        let required: Vec<&str> = self.fields.iter().map(|field| field.name).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    pub fn validate(&self, value: &Value) -> Result<(), LlmError> {
        let Some(object) = value.as_object() else {
            return Err(LlmError::schema_violation(self, "expected a JSON object"));
        };

        if let Some(unknown) =
            object.keys().find(|key| !self.fields.iter().any(|field| field.name == key.as_str()))
        {
            return Err(LlmError::schema_violation(self, format!("unexpected field `{unknown}`")));
        }

        for field in self.fields {
            let Some(found) = object.get(field.name) else {
                return Err(LlmError::schema_violation(
                    self,
                    format!("missing field `{}`", field.name),
                ));
            };

            match (field.kind, found) {
                (FieldKind::Text, Value::String(_)) => {}
                (FieldKind::Text, _) => {
                    return Err(LlmError::schema_violation(
                        self,
                        format!("field `{}` must be a string", field.name),
                    ));
                }
                (FieldKind::Enum { nullable: true, .. }, Value::Null) => {}
                (FieldKind::Enum { values, .. }, Value::String(tag))
                    if values.contains(&tag.as_str()) => {}
                (FieldKind::Enum { .. }, other) => {
                    return Err(LlmError::schema_violation(
                        self,
                        format!("field `{}` has value {other} outside its allowed set", field.name),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// A typed answer bound to the shape the model is asked to produce.
pub trait StructuredJudgment: DeserializeOwned {
    const SHAPE: OutputShape;
}

#[async_trait]
pub trait LanguageModelCapability: Send + Sync {
    /// Free-text reply to the ordered messages. A provider that returns no
    /// content yields an empty string.
    async fn generate_text(&self, context: &ConversationContext) -> Result<String, LlmError>;

    /// Raw JSON produced under `shape`. Callers go through
    /// [`generate_structured`], which validates it.
    async fn generate_structured_value(
        &self,
        context: &ConversationContext,
        shape: &OutputShape,
    ) -> Result<Value, LlmError>;
}

pub async fn generate_structured<T: StructuredJudgment>(
    capability: &dyn LanguageModelCapability,
    context: &ConversationContext,
) -> Result<T, LlmError> {
    let value = capability.generate_structured_value(context, &T::SHAPE).await?;
    T::SHAPE.validate(&value)?;
    serde_json::from_value(value)
        .map_err(|error| LlmError::schema_violation(&T::SHAPE, error.to_string()))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::{json, Value};

    use showroom_core::domain::conversation::ConversationContext;

    use super::{
        generate_structured, FieldKind, LanguageModelCapability, LlmError, OutputShape,
        ShapeField, StructuredJudgment,
    };

    const VERDICT: OutputShape = OutputShape {
        name: "verdict",
        fields: &[
            ShapeField {
                name: "answer",
                kind: FieldKind::Enum { values: &["YES", "NO"], nullable: false },
            },
            ShapeField { name: "tag", kind: FieldKind::Enum { values: &["A"], nullable: true } },
            ShapeField { name: "message", kind: FieldKind::Text },
        ],
    };

    #[derive(Debug, Deserialize)]
    struct Verdict {
        answer: String,
    }

    impl StructuredJudgment for Verdict {
        const SHAPE: OutputShape = VERDICT;
    }

    fn detail(error: LlmError) -> String {
        match error {
            LlmError::SchemaViolation { shape, detail } => {
                assert_eq!(shape, "verdict");
                detail
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn conforming_value_is_accepted() {
        assert!(VERDICT.validate(&json!({"answer": "YES", "tag": null, "message": "ok"})).is_ok());
        assert!(VERDICT.validate(&json!({"answer": "NO", "tag": "A", "message": ""})).is_ok());
    }

    #[test]
    fn missing_and_unknown_fields_are_violations() {
        let missing = VERDICT.validate(&json!({"answer": "YES", "tag": null})).unwrap_err();
        assert_eq!(detail(missing), "missing field `message`");

        let unknown = VERDICT
            .validate(&json!({"answer": "YES", "tag": null, "message": "x", "extra": 1}))
            .unwrap_err();
        assert_eq!(detail(unknown), "unexpected field `extra`");
    }

    #[test]
    fn enum_values_outside_the_set_are_violations() {
        let error =
            VERDICT.validate(&json!({"answer": "MAYBE", "tag": null, "message": "x"})).unwrap_err();
        assert!(detail(error).contains("`answer`"));

        let not_nullable =
            VERDICT.validate(&json!({"answer": null, "tag": null, "message": "x"})).unwrap_err();
        assert!(detail(not_nullable).contains("`answer`"));
    }

    #[test]
    fn non_object_output_is_a_violation() {
        let error = VERDICT.validate(&json!("YES")).unwrap_err();
        assert_eq!(detail(error), "expected a JSON object");
    }

    #[test]
    fn json_schema_is_strict_and_lists_every_field() {
        let schema = VERDICT.to_json_schema();
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["required"], json!(["answer", "tag", "message"]));
        assert_eq!(schema["properties"]["tag"]["enum"], json!(["A", null]));
        assert_eq!(schema["properties"]["answer"]["enum"], json!(["YES", "NO"]));
    }

    #[test]
    fn retryable_errors_are_transport_failures() {
        assert!(LlmError::Unavailable("503".into()).is_retryable());
        assert!(!LlmError::schema_violation(&VERDICT, "bad").is_retryable());
    }

    struct Fixed(Value);

    #[async_trait::async_trait]
    impl LanguageModelCapability for Fixed {
        async fn generate_text(&self, _context: &ConversationContext) -> Result<String, LlmError> {
            Ok(String::new())
        }

        async fn generate_structured_value(
            &self,
            _context: &ConversationContext,
            _shape: &OutputShape,
        ) -> Result<Value, LlmError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn generate_structured_validates_before_deserializing() {
        let context = ConversationContext::new();

        let good = Fixed(json!({"answer": "NO", "tag": "A", "message": "fine"}));
        let verdict: Verdict = generate_structured(&good, &context).await.expect("valid");
        assert_eq!(verdict.answer, "NO");

        let bad = Fixed(json!({"answer": "NO", "message": "fine"}));
        let error = generate_structured::<Verdict>(&bad, &context).await.unwrap_err();
        assert_eq!(detail(error), "missing field `tag`");
    }
}
