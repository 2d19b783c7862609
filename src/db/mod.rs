use crate::errors::{AppError, AppResult};
use crate::models::{
    CreateDashboardPayload, Dashboard, EngineSettings, ListDashboardFilters, ListMetricFilters,
    MetricDefinition, SaveMetricDefinitionPayload, ScheduledReport, Visibility, Widget,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_KEY: &str = "engine";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Metric Definitions ───────────────────────────────────────────────

    pub fn save_metric_definition(
        &self,
        payload: &SaveMetricDefinitionPayload,
        owner: &str,
    ) -> AppResult<MetricDefinition> {
        let now = Utc::now();
        let filters_json = serde_json::to_string(&payload.filters)?;
        let aggregation_json = serde_json::to_string(&payload.aggregation)?;
        let date_range_json = payload
            .date_range
            .map(|range| serde_json::to_string(&range))
            .transpose()?;
        let chart_type_json = serde_json::to_string(&payload.chart_type)?;
        let data_source = payload.data_source.as_str();
        let visibility = payload.visibility.unwrap_or(Visibility::Private);

        let conn = self.lock()?;
        if let Some(id) = &payload.id {
            let existing: Option<(String, String)> = conn
                .query_row(
                    "SELECT owner, created_at FROM metric_definitions WHERE id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (stored_owner, created_at) = existing
                .ok_or_else(|| AppError::NotFound(format!("metric definition {id}")))?;

            conn.execute(
                "UPDATE metric_definitions SET name=?1, description=?2, data_source=?3,
                   filters_json=?4, aggregation_json=?5, date_range=?6, chart_type=?7,
                   visibility=?8, updated_at=?9
                 WHERE id = ?10",
                params![
                    payload.name,
                    payload.description,
                    data_source,
                    filters_json,
                    aggregation_json,
                    date_range_json,
                    chart_type_json,
                    visibility.as_str(),
                    now.to_rfc3339(),
                    id,
                ],
            )?;

            Ok(MetricDefinition {
                id: id.clone(),
                name: payload.name.clone(),
                description: payload.description.clone(),
                data_source: payload.data_source,
                filters: payload.filters.clone(),
                aggregation: payload.aggregation.clone(),
                date_range: payload.date_range,
                chart_type: payload.chart_type,
                visibility,
                owner: stored_owner,
                created_at: parse_time(&created_at)?,
                updated_at: now,
            })
        } else {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO metric_definitions (
                   id, name, description, data_source, filters_json, aggregation_json,
                   date_range, chart_type, visibility, owner, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    id,
                    payload.name,
                    payload.description,
                    data_source,
                    filters_json,
                    aggregation_json,
                    date_range_json,
                    chart_type_json,
                    visibility.as_str(),
                    owner,
                    now.to_rfc3339(),
                ],
            )?;

            Ok(MetricDefinition {
                id,
                name: payload.name.clone(),
                description: payload.description.clone(),
                data_source: payload.data_source,
                filters: payload.filters.clone(),
                aggregation: payload.aggregation.clone(),
                date_range: payload.date_range,
                chart_type: payload.chart_type,
                visibility,
                owner: owner.to_string(),
                created_at: now,
                updated_at: now,
            })
        }
    }

    pub fn get_metric_definition(&self, id: &str) -> AppResult<Option<MetricDefinition>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, description, data_source, filters_json, aggregation_json,
                    date_range, chart_type, visibility, owner, created_at, updated_at
             FROM metric_definitions WHERE id = ?1",
            [id],
            parse_metric_definition_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_metric_definitions(
        &self,
        filters: &ListMetricFilters,
    ) -> AppResult<Vec<MetricDefinition>> {
        let conn = self.lock()?;
        let mut query = String::from(
            "SELECT id, name, description, data_source, filters_json, aggregation_json,
                    date_range, chart_type, visibility, owner, created_at, updated_at
             FROM metric_definitions WHERE 1 = 1",
        );
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(owner) = &filters.owner {
            query.push_str(" AND owner = ?");
            params_vec.push(owner.clone());
        }
        if let Some(visibility) = filters.visibility {
            query.push_str(" AND visibility = ?");
            params_vec.push(visibility.as_str().to_string());
        }
        query.push_str(" ORDER BY name ASC");

        let mut statement = conn.prepare(&query)?;
        let dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        let rows = statement.query_map(dyn_params.as_slice(), parse_metric_definition_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_metric_definition(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM metric_definitions WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    // ─── Dashboards ───────────────────────────────────────────────────────

    pub fn create_dashboard(
        &self,
        payload: &CreateDashboardPayload,
        owner: &str,
    ) -> AppResult<Dashboard> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let visibility = payload.visibility.unwrap_or(Visibility::Private);
        let is_template = payload.is_template.unwrap_or(false);
        let tags_json = serde_json::to_string(&payload.tags)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dashboards (
               id, name, widgets_json, tags_json, visibility, is_template, owner,
               access_count, created_at, updated_at
             ) VALUES (?1, ?2, '[]', ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                id,
                payload.name,
                tags_json,
                visibility.as_str(),
                is_template,
                owner,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Dashboard {
            id,
            name: payload.name.clone(),
            widgets: Vec::new(),
            tags: payload.tags.clone(),
            visibility,
            is_template,
            owner: owner.to_string(),
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_dashboard(&self, id: &str) -> AppResult<Option<Dashboard>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, widgets_json, tags_json, visibility, is_template, owner,
                    access_count, last_accessed_at, created_at, updated_at
             FROM dashboards WHERE id = ?1",
            [id],
            parse_dashboard_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_dashboards(&self, filters: &ListDashboardFilters) -> AppResult<Vec<Dashboard>> {
        let conn = self.lock()?;
        let mut query = String::from(
            "SELECT id, name, widgets_json, tags_json, visibility, is_template, owner,
                    access_count, last_accessed_at, created_at, updated_at
             FROM dashboards WHERE 1 = 1",
        );
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(owner) = &filters.owner {
            query.push_str(" AND owner = ?");
            params_vec.push(owner.clone());
        }
        if let Some(visibility) = filters.visibility {
            query.push_str(" AND visibility = ?");
            params_vec.push(visibility.as_str().to_string());
        }
        if filters.templates_only.unwrap_or(false) {
            query.push_str(" AND is_template = 1");
        }
        query.push_str(" ORDER BY updated_at DESC");

        let mut statement = conn.prepare(&query)?;
        let dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        let rows = statement.query_map(dyn_params.as_slice(), parse_dashboard_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // Whole-document widget replace, last write wins.
    pub fn save_dashboard_widgets(&self, id: &str, widgets: &[Widget]) -> AppResult<()> {
        let widgets_json = serde_json::to_string(widgets)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE dashboards SET widgets_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![widgets_json, now, id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("dashboard {id}")));
        }
        Ok(())
    }

    pub fn record_dashboard_access(&self, id: &str) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE dashboards
             SET access_count = access_count + 1, last_accessed_at = ?1
             WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn delete_dashboard(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM scheduled_reports WHERE dashboard_id = ?1", [id])?;
        let changed = conn.execute("DELETE FROM dashboards WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    // ─── Scheduled Reports ────────────────────────────────────────────────

    pub fn upsert_scheduled_report(&self, report: &ScheduledReport) -> AppResult<()> {
        let schedule_json = serde_json::to_string(&report.schedule)?;
        let recipients_json = serde_json::to_string(&report.recipients)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduled_reports (
               id, dashboard_id, schedule_json, recipients_json, format, is_active,
               last_sent_at, next_send_at, error_count, last_error, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
               dashboard_id = excluded.dashboard_id,
               schedule_json = excluded.schedule_json,
               recipients_json = excluded.recipients_json,
               format = excluded.format,
               is_active = excluded.is_active,
               last_sent_at = excluded.last_sent_at,
               next_send_at = excluded.next_send_at,
               error_count = excluded.error_count,
               last_error = excluded.last_error,
               updated_at = excluded.updated_at",
            params![
                report.id,
                report.dashboard_id,
                schedule_json,
                recipients_json,
                report.format.as_str(),
                report.is_active,
                report.last_sent_at.map(|at| at.to_rfc3339()),
                report.next_send_at.to_rfc3339(),
                report.error_count,
                report.last_error,
                report.created_at.to_rfc3339(),
                report.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_scheduled_report(&self, id: &str) -> AppResult<Option<ScheduledReport>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, dashboard_id, schedule_json, recipients_json, format, is_active,
                    last_sent_at, next_send_at, error_count, last_error, created_at, updated_at
             FROM scheduled_reports WHERE id = ?1",
            [id],
            parse_scheduled_report_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_scheduled_reports(&self) -> AppResult<Vec<ScheduledReport>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, dashboard_id, schedule_json, recipients_json, format, is_active,
                    last_sent_at, next_send_at, error_count, last_error, created_at, updated_at
             FROM scheduled_reports ORDER BY next_send_at ASC",
        )?;
        let rows = statement.query_map([], parse_scheduled_report_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn due_scheduled_reports(&self, now: DateTime<Utc>) -> AppResult<Vec<ScheduledReport>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, dashboard_id, schedule_json, recipients_json, format, is_active,
                    last_sent_at, next_send_at, error_count, last_error, created_at, updated_at
             FROM scheduled_reports
             WHERE is_active = 1 AND next_send_at <= ?1
             ORDER BY next_send_at ASC",
        )?;
        let rows = statement.query_map([now.to_rfc3339()], parse_scheduled_report_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_scheduled_report(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM scheduled_reports WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    // ─── Settings ─────────────────────────────────────────────────────────

    fn ensure_default_settings(&self) -> AppResult<()> {
        let defaults = serde_json::to_string(&EngineSettings::default())?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value_json) VALUES (?1, ?2)",
            params![SETTINGS_KEY, defaults],
        )?;
        Ok(())
    }

    pub fn get_settings(&self) -> AppResult<EngineSettings> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(EngineSettings::default()),
        }
    }

    pub fn save_settings(&self, settings: &EngineSettings) -> AppResult<()> {
        let json = serde_json::to_string(settings)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
            params![SETTINGS_KEY, json],
        )?;
        Ok(())
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn parse_metric_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricDefinition> {
    let data_source_raw: String = row.get(3)?;
    let data_source = crate::schema::DataSourceId::parse(&data_source_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown data source {data_source_raw}").into(),
        )
    })?;
    let visibility_raw: String = row.get(8)?;
    let visibility = Visibility::parse(&visibility_raw).unwrap_or(Visibility::Private);

    Ok(MetricDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        data_source,
        filters: parse_json(&row.get::<_, String>(4)?)?,
        aggregation: parse_json(&row.get::<_, String>(5)?)?,
        date_range: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_json(&raw))
            .transpose()?,
        chart_type: parse_json(&row.get::<_, String>(7)?)?,
        visibility,
        owner: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
        updated_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}

fn parse_dashboard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dashboard> {
    let visibility_raw: String = row.get(4)?;
    Ok(Dashboard {
        id: row.get(0)?,
        name: row.get(1)?,
        widgets: parse_json(&row.get::<_, String>(2)?)?,
        tags: parse_json(&row.get::<_, String>(3)?)?,
        visibility: Visibility::parse(&visibility_raw).unwrap_or(Visibility::Private),
        is_template: row.get(5)?,
        owner: row.get(6)?,
        access_count: row.get(7)?,
        last_accessed_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_scheduled_report_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledReport> {
    let format_raw: String = row.get(4)?;
    let format = crate::models::ReportFormat::parse(&format_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown report format {format_raw}").into(),
        )
    })?;
    Ok(ScheduledReport {
        id: row.get(0)?,
        dashboard_id: row.get(1)?,
        schedule: parse_json(&row.get::<_, String>(2)?)?,
        recipients: parse_json(&row.get::<_, String>(3)?)?,
        format,
        is_active: row.get(5)?,
        last_sent_at: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        next_send_at: parse_time(&row.get::<_, String>(7)?)?,
        error_count: row.get(8)?,
        last_error: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
        updated_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}
