use crate::filter;
use crate::models::{AggregateFunction, AggregationSpec, DateRange, FilterPredicate, SeriesPoint};
use crate::schema::{DataSourceId, CREATED_AT_FIELD};
use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

// Scalar(None) is the explicit "no value" min/max yields on an empty set,
// never collapsed to 0.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutput {
    Scalar(Option<f64>),
    Series(Vec<SeriesPoint>),
}

const NONE_GROUP_KEY: &str = "(none)";

// Date scope, then explicit filters, then optional grouping, then the
// aggregate function per partition.
pub fn run_query(
    source: DataSourceId,
    records: &[Value],
    filters: &[FilterPredicate],
    spec: &AggregationSpec,
    date_range: Option<DateRange>,
    now: DateTime<Utc>,
) -> AggregateOutput {
    let window = date_range.and_then(|range| resolve_date_range(range, now));
    let matched: Vec<&Value> = records
        .iter()
        .filter(|record| in_window(record, window))
        .filter(|record| filter::evaluate(source, record, filters))
        .collect();

    match &spec.group_by {
        None => AggregateOutput::Scalar(apply_function(&matched, spec)),
        Some(group_field) => {
            let mut partitions: BTreeMap<String, Vec<&Value>> = BTreeMap::new();
            for record in matched {
                partitions
                    .entry(group_key(record, group_field))
                    .or_default()
                    .push(record);
            }
            let mut series: Vec<SeriesPoint> = partitions
                .into_iter()
                .filter_map(|(key, members)| {
                    apply_function(&members, spec).map(|value| SeriesPoint { key, value })
                })
                .collect();
            // Descending by value; BTreeMap iteration already ordered the
            // tie-break keys ascending.
            series.sort_by(|a, b| {
                b.value
                    .partial_cmp(&a.value)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.key.cmp(&b.key))
            });
            AggregateOutput::Series(series)
        }
    }
}

fn in_window(record: &Value, window: Option<(DateTime<Utc>, DateTime<Utc>)>) -> bool {
    let Some((start, end)) = window else {
        return true;
    };
    match filter::record_instant(record, CREATED_AT_FIELD) {
        Some(instant) => instant >= start && instant < end,
        None => false,
    }
}

fn group_key(record: &Value, field: &str) -> String {
    match record.get(field) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => NONE_GROUP_KEY.to_string(),
    }
}

fn apply_function(records: &[&Value], spec: &AggregationSpec) -> Option<f64> {
    if spec.function == AggregateFunction::Count {
        return Some(records.len() as f64);
    }

    let field = spec.field.as_deref()?;
    let values: Vec<f64> = records
        .iter()
        .filter_map(|record| numeric_value(record, field))
        .collect();

    match spec.function {
        AggregateFunction::Count => Some(records.len() as f64),
        AggregateFunction::Sum => Some(values.iter().sum()),
        // Policy: an empty partition averages to 0 rather than "undefined"
        // so number widgets always have something to show.
        AggregateFunction::Average => {
            if values.is_empty() {
                Some(0.0)
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggregateFunction::Min => values.iter().copied().reduce(f64::min),
        AggregateFunction::Max => values.iter().copied().reduce(f64::max),
    }
}

fn numeric_value(record: &Value, field: &str) -> Option<f64> {
    match record.get(field)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// Half-open [start, end) UTC window relative to `now`; AllTime imposes none.
pub fn resolve_date_range(
    range: DateRange,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let today = start_of_day(now);
    match range {
        DateRange::AllTime => None,
        DateRange::Today => Some((today, today + Duration::days(1))),
        DateRange::Yesterday => Some((today - Duration::days(1), today)),
        DateRange::Last7Days => Some((now - Duration::days(7), now)),
        DateRange::Last30Days => Some((now - Duration::days(30), now)),
        DateRange::Last90Days => Some((now - Duration::days(90), now)),
        DateRange::ThisMonth => {
            let start = start_of_month(now);
            Some((start, add_months(start, 1)))
        }
        DateRange::LastMonth => {
            let end = start_of_month(now);
            Some((sub_months(end, 1), end))
        }
        DateRange::ThisQuarter => {
            let quarter_month = ((now.month0() / 3) * 3) + 1;
            let start = Utc
                .with_ymd_and_hms(now.year(), quarter_month, 1, 0, 0, 0)
                .single()
                .unwrap_or(today);
            Some((start, add_months(start, 3)))
        }
        DateRange::ThisYear => {
            let start = Utc
                .with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(today);
            let end = Utc
                .with_ymd_and_hms(now.year() + 1, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(start);
            Some((start, end))
        }
    }
}

fn start_of_day(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(instant)
}

fn start_of_month(instant: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(instant.year(), instant.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| start_of_day(instant))
}

fn add_months(instant: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    instant
        .checked_add_months(Months::new(months))
        .unwrap_or(instant)
}

fn sub_months(instant: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    instant
        .checked_sub_months(Months::new(months))
        .unwrap_or(instant)
}
