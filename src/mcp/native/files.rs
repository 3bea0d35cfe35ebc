use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{NativeTool, str_arg};

#[derive(Debug)]
pub struct ReadFileTool;

#[async_trait]
impl NativeTool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its contents."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "Path of the file to read." }
            },
            "required": ["file_path"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let file_path = str_arg(&args, "file_path")?;
        let content = tokio::fs::read_to_string(file_path)
            .await
            .with_context(|| format!("cannot read '{file_path}'"))?;
        Ok(Value::String(content))
    }
}

#[derive(Debug)]
pub struct WriteFileTool;

#[async_trait]
impl NativeTool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file, creating parent directories as needed. Overwrites existing files."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "Path of the file to write." },
                "content": { "type": "string", "description": "Text to write." }
            },
            "required": ["file_path", "content"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let file_path = str_arg(&args, "file_path")?;
        let content = str_arg(&args, "content")?;

        if let Some(parent) = Path::new(file_path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory '{}'", parent.display()))?;
        }
        tokio::fs::write(file_path, content)
            .await
            .with_context(|| format!("cannot write '{file_path}'"))?;

        Ok(Value::String(format!("Wrote {} bytes to {file_path}", content.len())))
    }
}
