use crate::aggregate::{self, AggregateOutput};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AddWidgetPayload, BooleanResponse, CreateDashboardPayload, Dashboard, DashboardSnapshot,
    EngineSettings, FilterPredicate, GridPosition, ListDashboardFilters, ListMetricFilters,
    MetricDefinition, SaveMetricDefinitionPayload, SaveScheduledReportPayload, ScheduledReport,
    UpdateWidgetPayload, Visibility, Widget, WidgetConfig, WidgetResult, WidgetSnapshot,
};
use crate::render::{self, WidgetState};
use crate::schedule::{self, ReportDispatcher};
use crate::schema::{self, DataSourceId, FieldType};
use crate::subscription::{self, ChangeHub, Recompute};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::time::Duration;
use uuid::Uuid;

// The engine re-applies the filter set and date window after the fetch, so
// a provider may pre-filter with them or ignore both.
pub trait DataSourceProvider: Send + Sync {
    fn fetch(
        &self,
        source: DataSourceId,
        filters: &[FilterPredicate],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> AppResult<Vec<serde_json::Value>>;
}

const DUPLICATE_OFFSET: i32 = 1;

#[derive(Clone)]
pub struct EngineCore {
    db: Arc<Database>,
    provider: Arc<dyn DataSourceProvider>,
    dispatcher: Arc<dyn ReportDispatcher>,
    hub: ChangeHub,
    widget_states: Arc<RwLock<HashMap<String, WidgetState>>>,
    settings: EngineSettings,
}

impl EngineCore {
    pub fn new(
        data_dir: PathBuf,
        provider: Arc<dyn DataSourceProvider>,
        dispatcher: Arc<dyn ReportDispatcher>,
    ) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&data_dir.join("state.sqlite"))?);
        let settings = db.get_settings()?;
        let hub = ChangeHub::new(Duration::from_millis(settings.refresh_debounce_ms));

        Ok(Arc::new(Self {
            db,
            provider,
            dispatcher,
            hub,
            widget_states: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn update_settings(&self, settings: &EngineSettings) -> AppResult<()> {
        self.db.save_settings(settings)
    }

    // ─── Custom metrics ───────────────────────────────────────────────────

    pub fn save_metric_definition(
        &self,
        payload: SaveMetricDefinitionPayload,
        acting_user: &str,
    ) -> AppResult<MetricDefinition> {
        validate_metric_payload(&payload)?;
        if let Some(id) = &payload.id {
            let existing = self
                .db
                .get_metric_definition(id)?
                .ok_or_else(|| AppError::NotFound(format!("metric definition {id}")))?;
            if existing.owner != acting_user {
                return Err(AppError::Policy(
                    "Only the owner may modify a metric definition".to_string(),
                ));
            }
        }
        self.db.save_metric_definition(&payload, acting_user)
    }

    pub fn get_metric_definition(
        &self,
        id: &str,
        viewer: &str,
    ) -> AppResult<Option<MetricDefinition>> {
        let Some(metric) = self.db.get_metric_definition(id)? else {
            return Ok(None);
        };
        if metric.visibility == Visibility::Private && metric.owner != viewer {
            return Err(AppError::Policy(
                "Metric definition is private".to_string(),
            ));
        }
        Ok(Some(metric))
    }

    pub fn list_metric_definitions(
        &self,
        filters: ListMetricFilters,
    ) -> AppResult<Vec<MetricDefinition>> {
        self.db.list_metric_definitions(&filters)
    }

    // Never cascades: dashboards embed a copy of the configuration.
    pub fn delete_metric_definition(
        &self,
        id: &str,
        acting_user: &str,
    ) -> AppResult<BooleanResponse> {
        let existing = self
            .db
            .get_metric_definition(id)?
            .ok_or_else(|| AppError::NotFound(format!("metric definition {id}")))?;
        if existing.owner != acting_user {
            return Err(AppError::Policy(
                "Only the owner may delete a metric definition".to_string(),
            ));
        }
        let success = self.db.delete_metric_definition(id)?;
        Ok(BooleanResponse { success })
    }

    // ─── Dashboards ───────────────────────────────────────────────────────

    pub fn create_dashboard(
        &self,
        payload: CreateDashboardPayload,
        acting_user: &str,
    ) -> AppResult<Dashboard> {
        if payload.name.trim().is_empty() {
            return Err(AppError::Validation("Dashboard name cannot be empty".to_string()));
        }
        self.db.create_dashboard(&payload, acting_user)
    }

    pub fn open_dashboard(&self, id: &str, viewer: &str) -> AppResult<Dashboard> {
        let dashboard = self.readable_dashboard(id, viewer)?;
        if let Err(error) = self.db.record_dashboard_access(id) {
            tracing::warn!(dashboard_id = %id, error = %error, "failed to record dashboard access");
        }
        Ok(dashboard)
    }

    pub fn list_dashboards(&self, filters: ListDashboardFilters) -> AppResult<Vec<Dashboard>> {
        self.db.list_dashboards(&filters)
    }

    pub fn delete_dashboard(&self, id: &str, acting_user: &str) -> AppResult<BooleanResponse> {
        self.require_dashboard_owner(id, acting_user)?;
        let success = self.db.delete_dashboard(id)?;
        Ok(BooleanResponse { success })
    }

    pub fn add_widget(
        &self,
        dashboard_id: &str,
        payload: AddWidgetPayload,
        acting_user: &str,
    ) -> AppResult<Widget> {
        validate_widget_config(&payload.config)?;
        let mut dashboard = self.require_dashboard_owner(dashboard_id, acting_user)?;

        let widget = Widget {
            id: Uuid::new_v4().to_string(),
            widget_type: payload.config.chart_type,
            position: payload
                .position
                .unwrap_or_else(|| next_free_position(&dashboard.widgets)),
            config: payload.config,
            display_options: payload.display_options.unwrap_or_default(),
        };
        dashboard.widgets.push(widget.clone());
        self.db.save_dashboard_widgets(dashboard_id, &dashboard.widgets)?;
        Ok(widget)
    }

    pub fn add_widget_from_metric(
        &self,
        dashboard_id: &str,
        metric_id: &str,
        acting_user: &str,
    ) -> AppResult<Widget> {
        let metric = self
            .get_metric_definition(metric_id, acting_user)?
            .ok_or_else(|| AppError::NotFound(format!("metric definition {metric_id}")))?;
        self.add_widget(
            dashboard_id,
            AddWidgetPayload {
                config: WidgetConfig::from_metric(&metric),
                position: None,
                display_options: None,
            },
            acting_user,
        )
    }

    pub fn update_widget(
        &self,
        dashboard_id: &str,
        payload: UpdateWidgetPayload,
        acting_user: &str,
    ) -> AppResult<Widget> {
        if let Some(config) = &payload.config {
            validate_widget_config(config)?;
        }
        let mut dashboard = self.require_dashboard_owner(dashboard_id, acting_user)?;
        let widget = dashboard
            .widgets
            .iter_mut()
            .find(|widget| widget.id == payload.widget_id)
            .ok_or_else(|| AppError::NotFound(format!("widget {}", payload.widget_id)))?;

        if let Some(config) = payload.config {
            widget.widget_type = config.chart_type;
            widget.config = config;
        }
        if let Some(position) = payload.position {
            widget.position = position;
        }
        if let Some(display_options) = payload.display_options {
            widget.display_options = display_options;
        }
        let updated = widget.clone();
        self.db.save_dashboard_widgets(dashboard_id, &dashboard.widgets)?;
        Ok(updated)
    }

    pub async fn remove_widget(
        &self,
        dashboard_id: &str,
        widget_id: &str,
        acting_user: &str,
    ) -> AppResult<BooleanResponse> {
        let mut dashboard = self.require_dashboard_owner(dashboard_id, acting_user)?;
        let before = dashboard.widgets.len();
        dashboard.widgets.retain(|widget| widget.id != widget_id);
        if dashboard.widgets.len() == before {
            return Ok(BooleanResponse { success: false });
        }
        self.db.save_dashboard_widgets(dashboard_id, &dashboard.widgets)?;
        self.hub.unsubscribe(widget_id).await;
        if let Ok(mut states) = self.widget_states.write() {
            states.remove(widget_id);
        }
        Ok(BooleanResponse { success: true })
    }

    pub fn duplicate_widget(
        &self,
        dashboard_id: &str,
        widget_id: &str,
        acting_user: &str,
    ) -> AppResult<Widget> {
        let mut dashboard = self.require_dashboard_owner(dashboard_id, acting_user)?;
        let source = dashboard
            .widgets
            .iter()
            .find(|widget| widget.id == widget_id)
            .ok_or_else(|| AppError::NotFound(format!("widget {widget_id}")))?;

        let mut clone = source.clone();
        clone.id = Uuid::new_v4().to_string();
        clone.position.x += DUPLICATE_OFFSET;
        clone.position.y += DUPLICATE_OFFSET;
        dashboard.widgets.push(clone.clone());
        self.db.save_dashboard_widgets(dashboard_id, &dashboard.widgets)?;
        Ok(clone)
    }

    // Whole-document replace, last write wins.
    pub fn save_dashboard(
        &self,
        dashboard_id: &str,
        widgets: Vec<Widget>,
        acting_user: &str,
    ) -> AppResult<Dashboard> {
        for widget in &widgets {
            validate_widget_config(&widget.config)?;
        }
        let mut dashboard = self.require_dashboard_owner(dashboard_id, acting_user)?;
        self.db.save_dashboard_widgets(dashboard_id, &widgets)?;
        dashboard.widgets = widgets;
        Ok(dashboard)
    }

    // ─── Widget evaluation ────────────────────────────────────────────────

    // Provider failures are captured in the result, never propagated.
    pub fn evaluate_widget(&self, config: &WidgetConfig) -> WidgetResult {
        let now = Utc::now();
        let window = config
            .date_range
            .and_then(|range| aggregate::resolve_date_range(range, now));
        match self
            .provider
            .fetch(config.data_source, &config.filters, window)
        {
            Ok(records) => {
                let output = aggregate::run_query(
                    config.data_source,
                    &records,
                    &config.filters,
                    &config.aggregation,
                    config.date_range,
                    now,
                );
                match output {
                    AggregateOutput::Scalar(value) => render::scalar_result(value),
                    AggregateOutput::Series(series) => render::series_result(series),
                }
            }
            Err(error) => WidgetResult::failed(error.to_string()),
        }
    }

    pub fn evaluate_dashboard(&self, dashboard: &Dashboard) -> Vec<WidgetSnapshot> {
        dashboard
            .widgets
            .iter()
            .map(|widget| WidgetSnapshot {
                widget_id: widget.id.clone(),
                result: self.evaluate_widget(&widget.config),
            })
            .collect()
    }

    pub fn snapshot_dashboard(&self, dashboard_id: &str) -> AppResult<DashboardSnapshot> {
        let dashboard = self
            .db
            .get_dashboard(dashboard_id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {dashboard_id}")))?;
        let results = self.evaluate_dashboard(&dashboard);
        Ok(DashboardSnapshot {
            dashboard,
            captured_at: Utc::now(),
            results,
        })
    }

    // ─── Reactive recomputation ───────────────────────────────────────────

    pub async fn mount_widget(self: &Arc<Self>, widget: &Widget) {
        self.store_widget_state(&widget.id, WidgetState::Loading);
        let fingerprint = subscription::fingerprint(widget.config.data_source, &widget.config.filters);
        let refresh = widget
            .config
            .refresh_interval_secs
            .map(Duration::from_secs);

        let weak = Arc::downgrade(self);
        let widget_id = widget.id.clone();
        let config = widget.config.clone();
        let recompute: Recompute = Arc::new(move || {
            let weak = weak.clone();
            let widget_id = widget_id.clone();
            let config = config.clone();
            Box::pin(async move {
                if let Some(engine) = weak.upgrade() {
                    let result = engine.evaluate_widget(&config);
                    engine.store_widget_state(&widget_id, WidgetState::from_result(result));
                }
            })
        });
        self.hub
            .subscribe(&widget.id, fingerprint, refresh, recompute)
            .await;
    }

    pub async fn mount_dashboard(self: &Arc<Self>, dashboard: &Dashboard) {
        for widget in &dashboard.widgets {
            self.mount_widget(widget).await;
        }
    }

    pub async fn unmount_dashboard(&self, dashboard: &Dashboard) {
        for widget in &dashboard.widgets {
            self.hub.unsubscribe(&widget.id).await;
            if let Ok(mut states) = self.widget_states.write() {
                states.remove(&widget.id);
            }
        }
    }

    pub async fn notify_records_changed(&self, source: DataSourceId) {
        self.hub.publish(source).await;
    }

    pub fn widget_state(&self, widget_id: &str) -> WidgetState {
        self.widget_states
            .read()
            .ok()
            .and_then(|states| states.get(widget_id).cloned())
            .unwrap_or(WidgetState::Loading)
    }

    fn store_widget_state(&self, widget_id: &str, state: WidgetState) {
        if let Ok(mut states) = self.widget_states.write() {
            states.insert(widget_id.to_string(), state);
        }
    }

    // ─── Scheduled reports ────────────────────────────────────────────────

    pub fn save_scheduled_report(
        &self,
        payload: SaveScheduledReportPayload,
        acting_user: &str,
    ) -> AppResult<ScheduledReport> {
        schedule::validate_schedule(&payload.schedule)?;
        self.require_dashboard_owner(&payload.dashboard_id, acting_user)?;
        let now = Utc::now();

        let existing = match &payload.id {
            Some(id) => Some(
                self.db
                    .get_scheduled_report(id)?
                    .ok_or_else(|| AppError::NotFound(format!("scheduled report {id}")))?,
            ),
            None => None,
        };

        let is_active = payload
            .is_active
            .or(existing.as_ref().map(|report| report.is_active))
            .unwrap_or(true);
        // An inactive report keeps its frozen dispatch instant.
        let next_send_at = if is_active {
            schedule::compute_next(&payload.schedule, now)?
        } else {
            match &existing {
                Some(report) => report.next_send_at,
                None => schedule::compute_next(&payload.schedule, now)?,
            }
        };

        let report = ScheduledReport {
            id: payload
                .id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            dashboard_id: payload.dashboard_id,
            schedule: payload.schedule,
            recipients: payload.recipients,
            format: payload.format,
            is_active,
            last_sent_at: existing.as_ref().and_then(|report| report.last_sent_at),
            next_send_at,
            error_count: existing.as_ref().map_or(0, |report| report.error_count),
            last_error: existing.as_ref().and_then(|report| report.last_error.clone()),
            created_at: existing.as_ref().map_or(now, |report| report.created_at),
            updated_at: now,
        };
        self.db.upsert_scheduled_report(&report)?;
        Ok(report)
    }

    pub fn get_scheduled_report(&self, id: &str) -> AppResult<Option<ScheduledReport>> {
        self.db.get_scheduled_report(id)
    }

    pub fn list_scheduled_reports(&self) -> AppResult<Vec<ScheduledReport>> {
        self.db.list_scheduled_reports()
    }

    pub fn delete_scheduled_report(
        &self,
        id: &str,
        acting_user: &str,
    ) -> AppResult<BooleanResponse> {
        let report = self
            .db
            .get_scheduled_report(id)?
            .ok_or_else(|| AppError::NotFound(format!("scheduled report {id}")))?;
        self.require_dashboard_owner(&report.dashboard_id, acting_user)?;
        let success = self.db.delete_scheduled_report(id)?;
        Ok(BooleanResponse { success })
    }

    // Deactivating freezes next_send_at; reactivating recomputes it from now
    // so a dormant schedule does not replay missed occurrences.
    pub fn set_report_active(
        &self,
        id: &str,
        active: bool,
        acting_user: &str,
    ) -> AppResult<ScheduledReport> {
        let mut report = self
            .db
            .get_scheduled_report(id)?
            .ok_or_else(|| AppError::NotFound(format!("scheduled report {id}")))?;
        self.require_dashboard_owner(&report.dashboard_id, acting_user)?;
        if report.is_active == active {
            return Ok(report);
        }
        let now = Utc::now();
        report.is_active = active;
        if active {
            report.next_send_at = schedule::compute_next(&report.schedule, now)?;
        }
        report.updated_at = now;
        self.db.upsert_scheduled_report(&report)?;
        Ok(report)
    }

    // Due reports fail independently; the sweep continues past each failure.
    pub fn run_report_sweep(&self, now: chrono::DateTime<Utc>) -> AppResult<()> {
        let due = self.db.due_scheduled_reports(now)?;
        for mut report in due {
            let outcome = self
                .snapshot_dashboard(&report.dashboard_id)
                .and_then(|snapshot| {
                    self.dispatcher
                        .dispatch(&snapshot, report.format, &report.recipients)
                })
                .map_err(|error| error.to_string());
            if let Err(message) = &outcome {
                tracing::warn!(report_id = %report.id, error = %message, "scheduled report dispatch failed");
            }
            if let Err(error) = schedule::apply_dispatch_outcome(&mut report, outcome, now)
                .and_then(|_| self.db.upsert_scheduled_report(&report))
            {
                tracing::warn!(report_id = %report.id, error = %error, "failed to persist dispatch bookkeeping");
            }
        }
        Ok(())
    }

    pub fn start_report_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.settings.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if let Err(error) = engine.run_report_sweep(Utc::now()) {
                    tracing::warn!(error = %error, "scheduled report sweep failed");
                }
            }
        });
    }

    // ─── Internals ────────────────────────────────────────────────────────

    fn readable_dashboard(&self, id: &str, viewer: &str) -> AppResult<Dashboard> {
        let dashboard = self
            .db
            .get_dashboard(id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {id}")))?;
        if dashboard.visibility == Visibility::Private && dashboard.owner != viewer {
            return Err(AppError::Policy("Dashboard is private".to_string()));
        }
        Ok(dashboard)
    }

    fn require_dashboard_owner(&self, id: &str, acting_user: &str) -> AppResult<Dashboard> {
        let dashboard = self
            .db
            .get_dashboard(id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {id}")))?;
        if dashboard.owner != acting_user {
            return Err(AppError::Policy(
                "Only the owner may edit this dashboard".to_string(),
            ));
        }
        Ok(dashboard)
    }
}

fn next_free_position(widgets: &[Widget]) -> GridPosition {
    let y = widgets
        .iter()
        .map(|widget| widget.position.y + widget.position.h)
        .max()
        .unwrap_or(0);
    GridPosition {
        y,
        ..GridPosition::default()
    }
}

pub fn validate_widget_config(config: &WidgetConfig) -> AppResult<()> {
    let source = config.data_source;

    for predicate in &config.filters {
        let Some(field_type) = schema::field_type(source, &predicate.field) else {
            return Err(AppError::Validation(format!(
                "Unknown field {:?} on data source {}",
                predicate.field,
                source.as_str()
            )));
        };
        if predicate.operator.is_ordering() && !field_type.is_ordered() {
            return Err(AppError::Validation(format!(
                "Operator {:?} requires a number or date field, but {:?} is not one",
                predicate.operator, predicate.field
            )));
        }
    }

    match config.aggregation.function {
        crate::models::AggregateFunction::Count => {}
        function => {
            let field = config.aggregation.field.as_deref().ok_or_else(|| {
                AppError::Validation(format!("Aggregation {function:?} requires a field"))
            })?;
            match schema::field_type(source, field) {
                Some(FieldType::Number) => {}
                Some(_) => {
                    return Err(AppError::Validation(format!(
                        "Aggregation {function:?} requires a numeric field, {field:?} is not"
                    )))
                }
                None => {
                    return Err(AppError::Validation(format!(
                        "Unknown aggregation field {:?} on data source {}",
                        field,
                        source.as_str()
                    )))
                }
            }
        }
    }

    if let Some(group_by) = &config.aggregation.group_by {
        if schema::field_type(source, group_by).is_none() {
            return Err(AppError::Validation(format!(
                "Unknown groupBy field {:?} on data source {}",
                group_by,
                source.as_str()
            )));
        }
    }

    Ok(())
}

fn validate_metric_payload(payload: &SaveMetricDefinitionPayload) -> AppResult<()> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("Metric name cannot be empty".to_string()));
    }
    validate_widget_config(&WidgetConfig {
        data_source: payload.data_source,
        filters: payload.filters.clone(),
        aggregation: payload.aggregation.clone(),
        date_range: payload.date_range,
        chart_type: payload.chart_type,
        refresh_interval_secs: None,
    })
}
