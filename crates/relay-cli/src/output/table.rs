//! Table formatting for CLI output

use comfy_table::{ContentArrangement, Table as ComfyTable};
use serde_json::Value;

/// Table for CLI output
#[derive(Debug, Clone)]
pub struct Table {
    inner: ComfyTable,
}

impl Table {
    /// Create a table from a JSON array of flat objects. Headers come from
    /// the first object; later objects fill cells by key.
    pub fn from_json_array(arr: &[Value]) -> Self {
        let mut table = ComfyTable::new();

        let Some(headers) = arr
            .first()
            .and_then(Value::as_object)
            .map(|obj| obj.keys().cloned().collect::<Vec<String>>())
        else {
            return Self { inner: table };
        };
        table.set_header(&headers);

        for item in arr {
            if let Some(obj) = item.as_object() {
                let row: Vec<String> = headers
                    .iter()
                    .map(|key| match obj.get(key) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(v) => v.to_string(),
                    })
                    .collect();
                table.add_row(row);
            }
        }

        table
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_width(120);

        Self { inner: table }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}
