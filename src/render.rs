use crate::models::{SeriesPoint, WidgetResult};
use serde::{Deserialize, Serialize};

// Loading, failure, and a valid zero-value result are three distinct states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum WidgetState {
    Loading,
    Failed { message: String },
    Ready { result: WidgetResult },
}

impl WidgetState {
    pub fn from_result(result: WidgetResult) -> Self {
        match result.error {
            Some(message) => Self::Failed { message },
            None => Self::Ready { result },
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

// A valueless min/max yields no chart data, distinct from a chartable zero.
pub fn chart_data(result: &WidgetResult) -> Option<ChartData> {
    if let Some(series) = &result.series {
        return Some(ChartData {
            labels: series.iter().map(|point| point.key.clone()).collect(),
            values: series.iter().map(|point| point.value).collect(),
        });
    }
    result.value.map(|value| ChartData {
        labels: vec![String::new()],
        values: vec![value],
    })
}

pub fn series_result(series: Vec<SeriesPoint>) -> WidgetResult {
    WidgetResult {
        value: None,
        series: Some(series),
        error: None,
    }
}

pub fn scalar_result(value: Option<f64>) -> WidgetResult {
    WidgetResult {
        value,
        series: None,
        error: None,
    }
}
