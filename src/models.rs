use crate::schema::DataSourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "private" => Some(Self::Private),
            "public" => Some(Self::Public),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChartType {
    Line,
    Bar,
    Pie,
    Donut,
    Area,
    Number,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn is_ordering(self) -> bool {
        matches!(self, Self::GreaterThan | Self::LessThan)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPredicate {
    pub field: String,
    pub operator: FilterOperator,
    // Stored untyped, coerced to the field's declared type at evaluation.
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSpec {
    pub function: AggregateFunction,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRange {
    Today,
    Yesterday,
    #[serde(rename = "last_7_days")]
    Last7Days,
    #[serde(rename = "last_30_days")]
    Last30Days,
    #[serde(rename = "last_90_days")]
    Last90Days,
    ThisMonth,
    LastMonth,
    ThisQuarter,
    ThisYear,
    AllTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub key: String,
    pub value: f64,
}

// ─── Custom Metrics ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub data_source: DataSourceId,
    pub filters: Vec<FilterPredicate>,
    pub aggregation: AggregationSpec,
    pub date_range: Option<DateRange>,
    pub chart_type: ChartType,
    pub visibility: Visibility,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMetricDefinitionPayload {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub data_source: DataSourceId,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
    pub aggregation: AggregationSpec,
    pub date_range: Option<DateRange>,
    pub chart_type: ChartType,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListMetricFilters {
    pub owner: Option<String>,
    pub visibility: Option<Visibility>,
}

// ─── Dashboards ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridPosition {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Default for GridPosition {
    fn default() -> Self {
        Self { x: 0, y: 0, w: 4, h: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayOptions {
    pub show_legend: bool,
    pub show_grid: bool,
    pub show_tooltip: bool,
    pub animate: bool,
    pub color_scheme: Option<String>,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            show_legend: true,
            show_grid: true,
            show_tooltip: true,
            animate: true,
            color_scheme: None,
        }
    }
}

// A widget embeds a copy of this data, never a reference to a stored
// MetricDefinition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    pub data_source: DataSourceId,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
    pub aggregation: AggregationSpec,
    pub date_range: Option<DateRange>,
    pub chart_type: ChartType,
    pub refresh_interval_secs: Option<u64>,
}

impl WidgetConfig {
    pub fn from_metric(metric: &MetricDefinition) -> Self {
        Self {
            data_source: metric.data_source,
            filters: metric.filters.clone(),
            aggregation: metric.aggregation.clone(),
            date_range: metric.date_range,
            chart_type: metric.chart_type,
            refresh_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    pub id: String,
    pub widget_type: ChartType,
    pub position: GridPosition,
    pub config: WidgetConfig,
    pub display_options: DisplayOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub id: String,
    pub name: String,
    pub widgets: Vec<Widget>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub is_template: bool,
    pub owner: String,
    pub access_count: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDashboardPayload {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub visibility: Option<Visibility>,
    pub is_template: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddWidgetPayload {
    pub config: WidgetConfig,
    pub position: Option<GridPosition>,
    pub display_options: Option<DisplayOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWidgetPayload {
    pub widget_id: String,
    pub config: Option<WidgetConfig>,
    pub position: Option<GridPosition>,
    pub display_options: Option<DisplayOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListDashboardFilters {
    pub owner: Option<String>,
    pub visibility: Option<Visibility>,
    pub templates_only: Option<bool>,
}

// ─── Scheduled Reports ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl ReportFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Pdf,
    Excel,
    Csv,
}

impl ReportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Excel => "excel",
            Self::Csv => "csv",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pdf" => Some(Self::Pdf),
            "excel" => Some(Self::Excel),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    User,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecipient {
    pub email: String,
    pub name: Option<String>,
    pub kind: RecipientKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSchedule {
    pub frequency: ReportFrequency,
    // 0 = Sunday .. 6 = Saturday, present iff weekly.
    pub day_of_week: Option<u8>,
    // 1..=31 clamped to month length, present iff monthly or quarterly.
    pub day_of_month: Option<u8>,
    // Wall-clock "HH:MM" in `timezone`, an IANA name like "America/New_York".
    pub time: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReport {
    pub id: String,
    pub dashboard_id: String,
    pub schedule: ReportSchedule,
    pub recipients: Vec<ReportRecipient>,
    pub format: ReportFormat,
    pub is_active: bool,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub next_send_at: DateTime<Utc>,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveScheduledReportPayload {
    pub id: Option<String>,
    pub dashboard_id: String,
    pub schedule: ReportSchedule,
    #[serde(default)]
    pub recipients: Vec<ReportRecipient>,
    pub format: ReportFormat,
    pub is_active: Option<bool>,
}

// ─── Evaluation results ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetResult {
    pub value: Option<f64>,
    pub series: Option<Vec<SeriesPoint>>,
    pub error: Option<String>,
}

impl WidgetResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            value: None,
            series: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSnapshot {
    pub widget_id: String,
    pub result: WidgetResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub dashboard: Dashboard,
    pub captured_at: DateTime<Utc>,
    pub results: Vec<WidgetSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}

// ─── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub sweep_interval_secs: u64,
    pub refresh_debounce_ms: u64,
    pub default_refresh_interval_secs: u64,
    pub retention_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            refresh_debounce_ms: 250,
            default_refresh_interval_secs: 300,
            retention_days: 90,
        }
    }
}
