use std::fmt::Write as _;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::NativeTool;

const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug)]
pub struct CurrentTimeTool;

#[async_trait]
impl NativeTool for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current local time. Use this first for any question that depends on the current date or time."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "strftime format string, defaults to \"%Y-%m-%d %H:%M:%S\"."
                }
            }
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let format = args["format"].as_str().unwrap_or(DEFAULT_FORMAT);

        let mut formatted = String::new();
        write!(formatted, "{}", chrono::Local::now().format(format))
            .map_err(|_| anyhow::anyhow!("invalid time format '{format}'"))?;

        Ok(Value::String(format!("Current time: {formatted}")))
    }
}
