//! Job-application form handler.
//!
//! The default strategy: discover the form's fields, fill the ones the user
//! supplied answers for, and submit. Field filling is overwrite-semantics,
//! so a restart after a crash redoes the same fills harmlessly.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, HandlerError};
use crate::handlers::{HandlerContext, TaskHandler};

/// One fillable field as reported by the page.
#[derive(Debug, Deserialize)]
struct FormField {
    selector: String,
    /// Canonical field name the input data is keyed by (`name`, `email`...).
    field: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    required: bool,
}

#[derive(Debug, Deserialize)]
struct FormSchema {
    fields: Vec<FormField>,
    #[serde(default)]
    submit_selector: Option<String>,
}

#[derive(Debug)]
pub struct FormApplicationHandler;

impl FormApplicationHandler {
    pub fn new() -> Self {
        Self
    }

    async fn discover_form(&self, ctx: &HandlerContext) -> Result<FormSchema, Error> {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "fields": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "selector": { "type": "string" },
                            "field": {
                                "type": "string",
                                "description": "canonical name: name, email, phone, resume, cover_letter, ..."
                            },
                            "kind": { "type": "string", "enum": ["text", "select", "file"] },
                            "required": { "type": "boolean" }
                        },
                        "required": ["selector", "field"]
                    }
                },
                "submit_selector": { "type": "string" }
            },
            "required": ["fields"]
        });

        let value = ctx
            .extract(
                "List every fillable field of the application form with a CSS \
                 selector and a canonical field name, plus the submit button selector.",
                &schema,
            )
            .await?;

        serde_json::from_value(value).map_err(|e| {
            Error::Handler(HandlerError::Failed {
                reason: format!("form discovery returned an unusable schema: {e}"),
            })
        })
    }
}

impl Default for FormApplicationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for FormApplicationHandler {
    fn task_type(&self) -> &'static str {
        "form_application"
    }

    fn validate(&self, input: &serde_json::Value) -> Result<(), HandlerError> {
        let Some(map) = input.as_object() else {
            return Err(HandlerError::InvalidInput {
                reason: "input data must be a JSON object of field answers".to_string(),
            });
        };
        if map.is_empty() {
            return Err(HandlerError::InvalidInput {
                reason: "input data has no field answers".to_string(),
            });
        }
        Ok(())
    }

    async fn run(&self, ctx: &HandlerContext) -> Result<(), Error> {
        ctx.navigate(&ctx.job.target_url).await?;

        let form = self.discover_form(ctx).await?;
        if form.fields.is_empty() {
            return Err(HandlerError::Failed {
                reason: "no fillable fields found on the page".to_string(),
            }
            .into());
        }

        for field in &form.fields {
            let have_answer = ctx
                .input()
                .get(&field.field)
                .is_some_and(|v| !v.is_null());

            if !have_answer {
                if field.required {
                    return Err(HandlerError::InvalidInput {
                        reason: format!("required field '{}' has no answer", field.field),
                    }
                    .into());
                }
                tracing::debug!(field = %field.field, "Skipping optional field without an answer");
                continue;
            }

            match field.kind.as_deref() {
                Some("select") => ctx.select(&field.selector, &field.field).await?,
                _ => ctx.fill(&field.selector, &field.field).await?,
            }
        }

        let submit = form
            .submit_selector
            .as_deref()
            .unwrap_or("button[type=submit]");
        ctx.submit(submit).await?;

        Ok(())
    }
}
