use records_command_center_lib::engine::{DataSourceProvider, EngineCore};
use records_command_center_lib::errors::AppResult;
use records_command_center_lib::models::{
    AddWidgetPayload, AggregateFunction, AggregationSpec, ChartType, CreateDashboardPayload,
    DashboardSnapshot, FilterOperator, FilterPredicate, ListDashboardFilters, ReportFormat,
    ReportFrequency, ReportRecipient, ReportSchedule, RecipientKind, SaveMetricDefinitionPayload,
    SaveScheduledReportPayload, WidgetConfig,
};
use records_command_center_lib::schedule::ReportDispatcher;
use records_command_center_lib::schema::DataSourceId;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};

struct FixtureProvider;

impl DataSourceProvider for FixtureProvider {
    fn fetch(
        &self,
        source: DataSourceId,
        _filters: &[FilterPredicate],
        _window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> AppResult<Vec<serde_json::Value>> {
        Ok(match source {
            DataSourceId::Payments => vec![
                json!({"reference": "p-1", "status": "paid", "amount": 100.0, "created_at": "2026-08-01T10:00:00Z"}),
                json!({"reference": "p-2", "status": "paid", "amount": 40.0, "created_at": "2026-08-02T10:00:00Z"}),
                json!({"reference": "p-3", "status": "pending", "amount": 25.0, "created_at": "2026-08-03T10:00:00Z"}),
                json!({"reference": "p-4", "status": "refunded", "amount": 60.0, "created_at": "2026-08-04T10:00:00Z"}),
            ],
            DataSourceId::Tasks => vec![
                json!({"title": "ship", "status": "done", "created_at": "2026-08-10T09:00:00Z"}),
                json!({"title": "plan", "status": "open", "created_at": "2026-08-11T09:00:00Z"}),
                json!({"title": "review", "status": "open", "created_at": "2026-08-12T09:00:00Z"}),
            ],
            _ => Vec::new(),
        })
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    snapshots: Mutex<Vec<DashboardSnapshot>>,
}

impl ReportDispatcher for RecordingDispatcher {
    fn dispatch(
        &self,
        snapshot: &DashboardSnapshot,
        _format: ReportFormat,
        _recipients: &[ReportRecipient],
    ) -> AppResult<()> {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

fn build_engine(dispatcher: Arc<RecordingDispatcher>) -> (Arc<EngineCore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = EngineCore::new(
        dir.path().to_path_buf(),
        Arc::new(FixtureProvider),
        dispatcher,
    )
    .expect("engine");
    (engine, dir)
}

#[test]
fn metric_to_dashboard_to_evaluation_flow() {
    let (engine, _dir) = build_engine(Arc::new(RecordingDispatcher::default()));

    let metric = engine
        .save_metric_definition(
            SaveMetricDefinitionPayload {
                id: None,
                name: "Revenue by status".to_string(),
                description: Some("Amount of non-refunded payments".to_string()),
                data_source: DataSourceId::Payments,
                filters: vec![FilterPredicate {
                    field: "status".to_string(),
                    operator: FilterOperator::NotEquals,
                    value: "refunded".to_string(),
                }],
                aggregation: AggregationSpec {
                    function: AggregateFunction::Sum,
                    field: Some("amount".to_string()),
                    group_by: Some("status".to_string()),
                },
                date_range: None,
                chart_type: ChartType::Bar,
                visibility: None,
            },
            "ana",
        )
        .expect("save metric");

    let dashboard = engine
        .create_dashboard(
            CreateDashboardPayload {
                name: "Finance".to_string(),
                tags: vec!["money".to_string()],
                visibility: None,
                is_template: None,
            },
            "ana",
        )
        .expect("create dashboard");

    let widget = engine
        .add_widget_from_metric(&dashboard.id, &metric.id, "ana")
        .expect("embed metric");

    let result = engine.evaluate_widget(&widget.config);
    assert_eq!(result.error, None);
    let series = result.series.expect("grouped series");
    assert_eq!(series.len(), 2);
    // Largest group first, refunded filtered out entirely.
    assert_eq!(series[0].key, "paid");
    assert_eq!(series[0].value, 140.0);
    assert_eq!(series[1].key, "pending");
    assert_eq!(series[1].value, 25.0);

    let listed = engine
        .list_dashboards(ListDashboardFilters {
            owner: Some("ana".to_string()),
            visibility: None,
            templates_only: None,
        })
        .expect("list dashboards");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].widgets.len(), 1);
}

#[test]
fn dashboard_snapshot_reaches_the_dispatcher() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (engine, _dir) = build_engine(dispatcher.clone());

    let dashboard = engine
        .create_dashboard(
            CreateDashboardPayload {
                name: "Ops digest".to_string(),
                tags: vec![],
                visibility: None,
                is_template: None,
            },
            "ana",
        )
        .expect("create dashboard");
    engine
        .add_widget(
            &dashboard.id,
            AddWidgetPayload {
                config: WidgetConfig {
                    data_source: DataSourceId::Tasks,
                    filters: vec![FilterPredicate {
                        field: "status".to_string(),
                        operator: FilterOperator::Equals,
                        value: "open".to_string(),
                    }],
                    aggregation: AggregationSpec {
                        function: AggregateFunction::Count,
                        field: None,
                        group_by: None,
                    },
                    date_range: None,
                    chart_type: ChartType::Number,
                    refresh_interval_secs: None,
                },
                position: None,
                display_options: None,
            },
            "ana",
        )
        .expect("add widget");

    let report = engine
        .save_scheduled_report(
            SaveScheduledReportPayload {
                id: None,
                dashboard_id: dashboard.id.clone(),
                schedule: ReportSchedule {
                    frequency: ReportFrequency::Daily,
                    day_of_week: None,
                    day_of_month: None,
                    time: "08:00".to_string(),
                    timezone: "UTC".to_string(),
                },
                recipients: vec![ReportRecipient {
                    email: "digest@example.com".to_string(),
                    name: Some("Digest".to_string()),
                    kind: RecipientKind::External,
                }],
                format: ReportFormat::Pdf,
                is_active: Some(true),
            },
            "ana",
        )
        .expect("save report");

    // Sweeping at the computed dispatch instant sends exactly once.
    engine
        .run_report_sweep(report.next_send_at)
        .expect("sweep");

    let snapshots = dispatcher.snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 1);
    let snapshot = &snapshots[0];
    assert_eq!(snapshot.dashboard.id, dashboard.id);
    assert_eq!(snapshot.results.len(), 1);
    assert_eq!(snapshot.results[0].result.value, Some(2.0));

    drop(snapshots);
    let stored = engine
        .get_scheduled_report(&report.id)
        .expect("get report")
        .expect("report exists");
    assert_eq!(stored.error_count, 0);
    assert!(stored.next_send_at > report.next_send_at);
    assert_eq!(stored.last_sent_at, Some(report.next_send_at));
}

#[tokio::test]
async fn change_notifications_refresh_mounted_widgets() {
    let (engine, _dir) = build_engine(Arc::new(RecordingDispatcher::default()));

    let dashboard = engine
        .create_dashboard(
            CreateDashboardPayload {
                name: "Live board".to_string(),
                tags: vec![],
                visibility: None,
                is_template: None,
            },
            "ana",
        )
        .expect("create dashboard");
    let widget = engine
        .add_widget(
            &dashboard.id,
            AddWidgetPayload {
                config: WidgetConfig {
                    data_source: DataSourceId::Payments,
                    filters: vec![],
                    aggregation: AggregationSpec {
                        function: AggregateFunction::Count,
                        field: None,
                        group_by: None,
                    },
                    date_range: None,
                    chart_type: ChartType::Number,
                    refresh_interval_secs: None,
                },
                position: None,
                display_options: None,
            },
            "ana",
        )
        .expect("add widget");

    engine.mount_widget(&widget).await;
    engine.notify_records_changed(DataSourceId::Payments).await;

    // The default debounce is 250ms; give the worker room to finish.
    let mut state = engine.widget_state(&widget.id);
    for _ in 0..50 {
        if state.is_ready() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        state = engine.widget_state(&widget.id);
    }
    match state {
        records_command_center_lib::render::WidgetState::Ready { result } => {
            assert_eq!(result.value, Some(4.0));
        }
        other => panic!("widget never became ready: {other:?}"),
    }

    let stored = engine
        .open_dashboard(&dashboard.id, "ana")
        .expect("open dashboard");
    engine.unmount_dashboard(&stored).await;
}

#[test]
fn private_dashboards_are_invisible_to_other_users() {
    let (engine, _dir) = build_engine(Arc::new(RecordingDispatcher::default()));

    let dashboard = engine
        .create_dashboard(
            CreateDashboardPayload {
                name: "Mine".to_string(),
                tags: vec![],
                visibility: None,
                is_template: None,
            },
            "ana",
        )
        .expect("create dashboard");

    let err = engine
        .open_dashboard(&dashboard.id, "bo")
        .expect_err("private dashboard");
    assert!(err.to_string().contains("POLICY"));
}
