use crate::models::{FilterOperator, FilterPredicate};
use crate::schema::{self, DataSourceId, FieldType};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

// Dates coerce to epoch seconds so date and number comparisons share one
// ordering path.
#[derive(Debug, Clone, PartialEq)]
enum Coerced {
    Text(String),
    Num(f64),
    Flag(bool),
}

pub fn evaluate(source: DataSourceId, record: &Value, filters: &[FilterPredicate]) -> bool {
    filters
        .iter()
        .all(|predicate| evaluate_predicate(source, record, predicate))
}

pub fn evaluate_predicate(source: DataSourceId, record: &Value, predicate: &FilterPredicate) -> bool {
    let Some(field_type) = schema::field_type(source, &predicate.field) else {
        return false;
    };

    let record_value = record.get(&predicate.field).filter(|value| !value.is_null());
    let Some(actual) = record_value.and_then(|value| coerce_value(value, field_type)) else {
        // Missing field: "equals nothing" satisfies the negated operators.
        return matches!(
            predicate.operator,
            FilterOperator::NotEquals | FilterOperator::NotIn
        );
    };

    match predicate.operator {
        FilterOperator::Equals => coerce_literal(&predicate.value, field_type)
            .is_some_and(|expected| actual == expected),
        FilterOperator::NotEquals => coerce_literal(&predicate.value, field_type)
            .map_or(true, |expected| actual != expected),
        FilterOperator::GreaterThan => compare_ordered(&actual, &predicate.value, field_type)
            .is_some_and(|ordering| ordering == std::cmp::Ordering::Greater),
        FilterOperator::LessThan => compare_ordered(&actual, &predicate.value, field_type)
            .is_some_and(|ordering| ordering == std::cmp::Ordering::Less),
        FilterOperator::Contains => text_of(&actual)
            .to_lowercase()
            .contains(&predicate.value.to_lowercase()),
        FilterOperator::NotContains => !text_of(&actual)
            .to_lowercase()
            .contains(&predicate.value.to_lowercase()),
        FilterOperator::StartsWith => text_of(&actual)
            .to_lowercase()
            .starts_with(&predicate.value.to_lowercase()),
        FilterOperator::EndsWith => text_of(&actual)
            .to_lowercase()
            .ends_with(&predicate.value.to_lowercase()),
        FilterOperator::In => literal_list(&predicate.value, field_type)
            .iter()
            .any(|candidate| *candidate == actual),
        FilterOperator::NotIn => !literal_list(&predicate.value, field_type)
            .iter()
            .any(|candidate| *candidate == actual),
    }
}

fn coerce_value(value: &Value, field_type: FieldType) -> Option<Coerced> {
    match field_type {
        FieldType::String => match value {
            Value::String(text) => Some(Coerced::Text(text.clone())),
            Value::Number(number) => Some(Coerced::Text(number.to_string())),
            Value::Bool(flag) => Some(Coerced::Text(flag.to_string())),
            _ => None,
        },
        FieldType::Number => match value {
            Value::Number(number) => number.as_f64().map(Coerced::Num),
            Value::String(text) => text.trim().parse::<f64>().ok().map(Coerced::Num),
            _ => None,
        },
        FieldType::Date => match value {
            Value::String(text) => parse_instant(text).map(Coerced::Num),
            Value::Number(number) => number.as_f64().map(Coerced::Num),
            _ => None,
        },
        FieldType::Boolean => match value {
            Value::Bool(flag) => Some(Coerced::Flag(*flag)),
            Value::String(text) => parse_bool(text).map(Coerced::Flag),
            _ => None,
        },
    }
}

fn coerce_literal(raw: &str, field_type: FieldType) -> Option<Coerced> {
    match field_type {
        FieldType::String => Some(Coerced::Text(raw.to_string())),
        FieldType::Number => raw.trim().parse::<f64>().ok().map(Coerced::Num),
        FieldType::Date => parse_instant(raw).map(Coerced::Num),
        FieldType::Boolean => parse_bool(raw).map(Coerced::Flag),
    }
}

fn compare_ordered(actual: &Coerced, raw: &str, field_type: FieldType) -> Option<std::cmp::Ordering> {
    if !field_type.is_ordered() {
        return None;
    }
    let Coerced::Num(lhs) = actual else {
        return None;
    };
    let Some(Coerced::Num(rhs)) = coerce_literal(raw, field_type) else {
        return None;
    };
    lhs.partial_cmp(&rhs)
}

fn literal_list(raw: &str, field_type: FieldType) -> Vec<Coerced> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| coerce_literal(item, field_type))
        .collect()
}

fn text_of(value: &Coerced) -> String {
    match value {
        Coerced::Text(text) => text.clone(),
        Coerced::Num(number) => number.to_string(),
        Coerced::Flag(flag) => flag.to_string(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

// Accepts RFC 3339 or a bare YYYY-MM-DD.
pub fn parse_instant(raw: &str) -> Option<f64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Some(parsed.timestamp() as f64);
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp() as f64)
}

pub fn record_instant(record: &Value, field: &str) -> Option<DateTime<Utc>> {
    match record.get(field)? {
        Value::String(text) => {
            parse_instant(text).and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
        }
        Value::Number(number) => number
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pred(field: &str, operator: FilterOperator, value: &str) -> FilterPredicate {
        FilterPredicate {
            field: field.to_string(),
            operator,
            value: value.to_string(),
        }
    }

    #[test]
    fn empty_filter_set_matches_everything() {
        let record = json!({ "status": "done" });
        for source in DataSourceId::ALL {
            assert!(evaluate(source, &record, &[]));
        }
        assert!(evaluate(DataSourceId::Tasks, &json!({}), &[]));
    }

    #[test]
    fn equals_coerces_to_declared_type() {
        let record = json!({ "amount": 100, "status": "Paid" });
        assert!(evaluate_predicate(
            DataSourceId::Payments,
            &record,
            &pred("amount", FilterOperator::Equals, "100")
        ));
        assert!(evaluate_predicate(
            DataSourceId::Payments,
            &record,
            &pred("amount", FilterOperator::Equals, "100.0")
        ));
        assert!(!evaluate_predicate(
            DataSourceId::Payments,
            &record,
            &pred("status", FilterOperator::Equals, "paid")
        ));
    }

    #[test]
    fn string_operators_are_case_insensitive() {
        let record = json!({ "client": "Acme Corp" });
        assert!(evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("client", FilterOperator::Contains, "acme")
        ));
        assert!(evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("client", FilterOperator::StartsWith, "ACME")
        ));
        assert!(evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("client", FilterOperator::EndsWith, "corp")
        ));
        assert!(!evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("client", FilterOperator::NotContains, "Acme")
        ));
    }

    #[test]
    fn ordering_operators_compare_numbers_and_dates() {
        let record = json!({ "budget": 2500, "due_date": "2026-06-15" });
        assert!(evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("budget", FilterOperator::GreaterThan, "1000")
        ));
        assert!(evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("due_date", FilterOperator::LessThan, "2026-12-31")
        ));
        assert!(!evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("budget", FilterOperator::LessThan, "1000")
        ));
    }

    #[test]
    fn ordering_on_unparseable_literal_is_a_non_match() {
        let record = json!({ "budget": 2500 });
        assert!(!evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("budget", FilterOperator::GreaterThan, "lots")
        ));
    }

    #[test]
    fn in_and_not_in_split_comma_lists() {
        let record = json!({ "status": "active" });
        assert!(evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("status", FilterOperator::In, "active, paused")
        ));
        assert!(!evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("status", FilterOperator::In, "archived,paused")
        ));
        assert!(evaluate_predicate(
            DataSourceId::Projects,
            &record,
            &pred("status", FilterOperator::NotIn, "archived,paused")
        ));

        let payment = json!({ "amount": 50 });
        assert!(evaluate_predicate(
            DataSourceId::Payments,
            &payment,
            &pred("amount", FilterOperator::In, "25, 50, 75")
        ));
    }

    #[test]
    fn missing_field_only_matches_negated_operators() {
        let record = json!({ "title": "follow up" });
        assert!(!evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("status", FilterOperator::Equals, "done")
        ));
        assert!(!evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("status", FilterOperator::Contains, "done")
        ));
        assert!(evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("status", FilterOperator::NotEquals, "done")
        ));
        assert!(evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("status", FilterOperator::NotIn, "done,archived")
        ));
    }

    #[test]
    fn null_field_is_treated_as_missing() {
        let record = json!({ "status": null });
        assert!(evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("status", FilterOperator::NotEquals, "done")
        ));
    }

    #[test]
    fn boolean_fields_parse_true_false() {
        let record = json!({ "completed": true });
        assert!(evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("completed", FilterOperator::Equals, "true")
        ));
        assert!(!evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("completed", FilterOperator::Equals, "false")
        ));
        // Unparseable literal can never equal a real flag.
        assert!(!evaluate_predicate(
            DataSourceId::Tasks,
            &record,
            &pred("completed", FilterOperator::Equals, "yes")
        ));
    }

    #[test]
    fn conjunction_requires_every_predicate() {
        let record = json!({ "status": "done", "priority": "high" });
        let both = [
            pred("status", FilterOperator::Equals, "done"),
            pred("priority", FilterOperator::Equals, "high"),
        ];
        let mixed = [
            pred("status", FilterOperator::Equals, "done"),
            pred("priority", FilterOperator::Equals, "low"),
        ];
        assert!(evaluate(DataSourceId::Tasks, &record, &both));
        assert!(!evaluate(DataSourceId::Tasks, &record, &mixed));
    }
}
