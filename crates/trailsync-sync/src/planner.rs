//! Create/update decisions, column rendering and batch documents.

use chrono::{DateTime, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use trailsync_core::{CanonicalRecord, CanonicalRegistry, IdentityKey, RemoteHandle};

/// Board column ids for each synchronized field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardColumns {
    pub location: String,
    pub state: String,
    pub serial: String,
    pub observed_at: String,
    pub staleness: String,
}

impl Default for BoardColumns {
    fn default() -> Self {
        Self {
            location: "link_mktvvmv".to_string(),
            state: "text_mktvv1mz".to_string(),
            serial: "text_mkxnr5nm".to_string(),
            observed_at: "text_mkxnv1fc".to_string(),
            staleness: "text_mky8qezb".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardTarget {
    pub board_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationTarget {
    Create,
    Update(RemoteHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOperation {
    pub alias: String,
    pub identity_key: IdentityKey,
    pub target: OperationTarget,
    pub fields: Map<String, Value>,
}

impl BatchOperation {
    pub fn is_create(&self) -> bool {
        matches!(self.target, OperationTarget::Create)
    }

    pub fn render(&self, board: &BoardTarget) -> String {
        let column_values = escape_graphql(&Value::Object(self.fields.clone()).to_string());
        match &self.target {
            OperationTarget::Create => format!(
                "  {alias}: create_item(board_id: \"{board}\", group_id: \"{group}\", item_name: \"{name}\", column_values: \"{column_values}\") {{ id }}",
                alias = self.alias,
                board = escape_graphql(&board.board_id),
                group = escape_graphql(&board.group_id),
                name = escape_graphql(self.identity_key.as_str()),
            ),
            OperationTarget::Update(handle) => format!(
                "  {alias}: change_multiple_column_values(board_id: \"{board}\", item_id: \"{item}\", column_values: \"{column_values}\") {{ id }}",
                alias = self.alias,
                board = escape_graphql(&board.board_id),
                item = escape_graphql(handle.as_str()),
            ),
        }
    }
}

/// One network request worth of aliased operations.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDocument {
    pub index: usize,
    pub operations: Vec<BatchOperation>,
    query: String,
}

impl BatchDocument {
    pub fn new(index: usize, operations: Vec<BatchOperation>, board: &BoardTarget) -> Self {
        let body = operations
            .iter()
            .map(|op| op.render(board))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            index,
            operations,
            query: format!("mutation {{\n{body}\n}}"),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub documents: Vec<BatchDocument>,
    pub creates: usize,
    pub updates: usize,
}

impl Plan {
    pub fn operation_count(&self) -> usize {
        self.creates + self.updates
    }

    pub fn operations(&self) -> impl Iterator<Item = &BatchOperation> {
        self.documents.iter().flat_map(|d| d.operations.iter())
    }
}

#[derive(Debug, Clone)]
pub struct Planner {
    pub board: BoardTarget,
    pub columns: BoardColumns,
    pub batch_size: usize,
}

impl Planner {
    /// Walks the registry in iteration order; aliases run `op_0..` across the whole plan.
    pub fn plan(&self, registry: &CanonicalRegistry, now: DateTime<Utc>) -> Plan {
        let operations: Vec<BatchOperation> = registry
            .iter()
            .enumerate()
            .map(|(n, (key, record))| BatchOperation {
                alias: format!("op_{n}"),
                identity_key: key.clone(),
                target: match &record.remote_handle {
                    Some(handle) => OperationTarget::Update(handle.clone()),
                    None => OperationTarget::Create,
                },
                fields: column_values(record, &self.columns, now),
            })
            .collect();

        let creates = operations.iter().filter(|op| op.is_create()).count();
        let updates = operations.len() - creates;
        let documents = chunk_operations(operations, self.batch_size)
            .into_iter()
            .enumerate()
            .map(|(index, ops)| BatchDocument::new(index, ops, &self.board))
            .collect();

        Plan {
            documents,
            creates,
            updates,
        }
    }
}

/// Order-preserving split into groups of `size`; the last group may be shorter.
pub fn chunk_operations(operations: Vec<BatchOperation>, size: usize) -> Vec<Vec<BatchOperation>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(operations.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for op in operations {
        current.push(op);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Column payload for one record. Absent values render as `""` so the column is cleared.
pub fn column_values(record: &CanonicalRecord, columns: &BoardColumns, now: DateTime<Utc>) -> Map<String, Value> {
    let mut values = Map::new();
    values.insert(
        columns.location.clone(),
        json!({
            "url": format!(
                "www.google.com/maps/search/?api=1&query={},{}",
                display_or_empty(record.latitude),
                display_or_empty(record.longitude),
            ),
            "text": record.full_address.clone().unwrap_or_default(),
        }),
    );
    values.insert(
        columns.state.clone(),
        Value::String(record.address_state.clone().unwrap_or_default()),
    );
    values.insert(
        columns.serial.clone(),
        Value::String(record.serial_data.clone().unwrap_or_default()),
    );
    values.insert(
        columns.observed_at.clone(),
        Value::String(record.observed_at.map(format_eastern).unwrap_or_default()),
    );
    values.insert(
        columns.staleness.clone(),
        Value::String(staleness(record.observed_at, now)),
    );
    values
}

fn display_or_empty(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// `Nov 3, 2025, 2:07 PM EST`
pub fn format_eastern(at: DateTime<Utc>) -> String {
    at.with_timezone(&New_York)
        .format("%b %-d, %Y, %-I:%M %p %Z")
        .to_string()
}

/// Elapsed time since `observed_at`, e.g. `1 day 3 hours ago`. Empty when unknown.
pub fn staleness(observed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(observed_at) = observed_at else {
        return String::new();
    };
    let total_minutes = (now - observed_at).num_minutes().unsigned_abs();
    let days = total_minutes / (60 * 24);
    let hours = (total_minutes % (60 * 24)) / 60;
    let minutes = total_minutes % 60;

    let mut parts = Vec::with_capacity(3);
    if days > 0 {
        parts.push(plural(days, "day"));
    }
    if hours > 0 {
        parts.push(plural(hours, "hour"));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(plural(minutes, "minute"));
    }
    format!("{} ago", parts.join(" "))
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// Escapes text for a double-quoted GraphQL string literal.
pub fn escape_graphql(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}
