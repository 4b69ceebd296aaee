use serde_json::Value;

use crate::error::Result;
use crate::models::ExecutionResult;

// Serializes a query execution result into the payload of a data message
pub trait ResultWriter: Send + Sync {
    fn write_result(&self, result: &ExecutionResult) -> Result<Value>;
}

// Default writer producing the standard `{data, errors}` response shape
#[derive(Debug, Clone, Default)]
pub struct JsonResultWriter {
    pub always_include_data: bool, // Write `"data": null` when the result carries no data
}

impl ResultWriter for JsonResultWriter {
    fn write_result(&self, result: &ExecutionResult) -> Result<Value> {
        let mut value = serde_json::to_value(result)?;
        if self.always_include_data && result.data.is_none() {
            if let Value::Object(map) = &mut value {
                map.insert("data".to_string(), Value::Null);
            }
        }
        Ok(value)
    }
}
