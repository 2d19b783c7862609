use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSourceId {
    Projects,
    Tasks,
    Contacts,
    Payments,
    Invoices,
}

impl DataSourceId {
    pub const ALL: [Self; 5] = [
        Self::Projects,
        Self::Tasks,
        Self::Contacts,
        Self::Payments,
        Self::Invoices,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Tasks => "tasks",
            Self::Contacts => "contacts",
            Self::Payments => "payments",
            Self::Invoices => "invoices",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "projects" => Some(Self::Projects),
            "tasks" => Some(Self::Tasks),
            "contacts" => Some(Self::Contacts),
            "payments" => Some(Self::Payments),
            "invoices" => Some(Self::Invoices),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    String,
    Number,
    Date,
    Boolean,
}

impl FieldType {
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Number | Self::Date)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub field_type: FieldType,
}

const fn field(name: &'static str, field_type: FieldType) -> FieldDef {
    FieldDef { name, field_type }
}

// Date scope filters on this field before any explicit predicate runs.
pub const CREATED_AT_FIELD: &str = "created_at";

static REGISTRY: Lazy<HashMap<DataSourceId, Vec<FieldDef>>> = Lazy::new(|| {
    use FieldType::{Boolean, Date, Number, String};
    let mut map = HashMap::new();
    map.insert(
        DataSourceId::Projects,
        vec![
            field("name", String),
            field("status", String),
            field("client", String),
            field("budget", Number),
            field("spent", Number),
            field("progress", Number),
            field("archived", Boolean),
            field("start_date", Date),
            field("due_date", Date),
            field(CREATED_AT_FIELD, Date),
        ],
    );
    map.insert(
        DataSourceId::Tasks,
        vec![
            field("title", String),
            field("status", String),
            field("priority", String),
            field("project", String),
            field("assignee", String),
            field("estimate_hours", Number),
            field("completed", Boolean),
            field("due_date", Date),
            field(CREATED_AT_FIELD, Date),
        ],
    );
    map.insert(
        DataSourceId::Contacts,
        vec![
            field("name", String),
            field("company", String),
            field("email", String),
            field("kind", String),
            field("city", String),
            field("lead_score", Number),
            field("active", Boolean),
            field(CREATED_AT_FIELD, Date),
        ],
    );
    map.insert(
        DataSourceId::Payments,
        vec![
            field("reference", String),
            field("method", String),
            field("status", String),
            field("client", String),
            field("amount", Number),
            field("refunded", Boolean),
            field("paid_at", Date),
            field(CREATED_AT_FIELD, Date),
        ],
    );
    map.insert(
        DataSourceId::Invoices,
        vec![
            field("number", String),
            field("status", String),
            field("client", String),
            field("total", Number),
            field("balance_due", Number),
            field("overdue", Boolean),
            field("issued_at", Date),
            field("due_date", Date),
            field(CREATED_AT_FIELD, Date),
        ],
    );
    map
});

pub fn fields(source: DataSourceId) -> &'static [FieldDef] {
    REGISTRY
        .get(&source)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn field_type(source: DataSourceId, name: &str) -> Option<FieldType> {
    fields(source)
        .iter()
        .find(|def| def.name == name)
        .map(|def| def.field_type)
}
