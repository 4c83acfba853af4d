use jsonschema::Validator;
use serde_json::Value;

use queuer_core::{config::TaskSchemas, models::WorkUnit, QueuerError, QueuerResult};

/// 任务选项与负载的 JSON Schema 校验器
///
/// Schema 在构建 Worker 时编译，无效的 Schema 属于配置错误。
#[derive(Default)]
pub struct SchemaValidator {
    options: Option<Validator>,
    payload: Option<Validator>,
}

fn compile(kind: &str, schema: Option<&Value>) -> QueuerResult<Option<Validator>> {
    schema
        .map(|schema| {
            jsonschema::validator_for(schema).map_err(|e| {
                QueuerError::configuration(format!("{kind} 的JSON Schema无效: {e}"))
            })
        })
        .transpose()
}

fn check(kind: &str, validator: Option<&Validator>, instance: &Value) -> Result<(), String> {
    let Some(validator) = validator else {
        return Ok(());
    };
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("{kind} 校验失败: {}", errors.join("; ")))
    }
}

impl SchemaValidator {
    pub fn compile(schemas: &TaskSchemas) -> QueuerResult<Self> {
        Ok(Self {
            options: compile("options", schemas.options.as_ref())?,
            payload: compile("payload", schemas.payload.as_ref())?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_none() && self.payload.is_none()
    }

    /// 校验工作单元，失败时返回描述性的原因
    pub fn validate(&self, unit: &WorkUnit) -> Result<(), String> {
        if self.options.is_some() {
            check("options", self.options.as_ref(), &unit.options_value())?;
        }
        check("payload", self.payload.as_ref(), &unit.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuer_core::models::TaskRunOptions;
    use serde_json::json;

    fn unit(options: TaskRunOptions, payload: Value) -> WorkUnit {
        WorkUnit {
            run_id: 1,
            queue_id: 1,
            queue_name: "q".to_string(),
            item_id: None,
            task_run_id: None,
            task_name: "t".to_string(),
            options,
            payload,
            previous_result: None,
            host: "h".to_string(),
            xid: "1-0".to_string(),
        }
    }

    #[test]
    fn test_no_schemas_accepts_everything() {
        let validator = SchemaValidator::compile(&TaskSchemas::default()).unwrap();
        assert!(validator.is_empty());
        assert!(validator.validate(&unit(TaskRunOptions::new(), json!(42))).is_ok());
    }

    #[test]
    fn test_payload_schema() {
        let validator = SchemaValidator::compile(&TaskSchemas {
            options: None,
            payload: Some(json!({"type": "object", "required": ["id"]})),
        })
        .unwrap();

        assert!(validator
            .validate(&unit(TaskRunOptions::new(), json!({"id": 1})))
            .is_ok());
        let reason = validator
            .validate(&unit(TaskRunOptions::new(), json!({"name": "x"})))
            .unwrap_err();
        assert!(reason.starts_with("payload 校验失败"));
        assert!(reason.contains("id"));
    }

    #[test]
    fn test_options_schema() {
        let validator = SchemaValidator::compile(&TaskSchemas {
            options: Some(json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            })),
            payload: None,
        })
        .unwrap();

        let mut options = TaskRunOptions::new();
        options.insert("url".to_string(), json!(5));
        let reason = validator.validate(&unit(options, json!({}))).unwrap_err();
        assert!(reason.starts_with("options 校验失败"));
        assert!(reason.contains("/url"));
    }

    #[test]
    fn test_invalid_schema_is_configuration_error() {
        let result = SchemaValidator::compile(&TaskSchemas {
            options: None,
            payload: Some(json!({"type": 12})),
        });
        assert!(matches!(result, Err(QueuerError::Configuration(_))));
    }
}
