//! Chart Data Normalizer
//!
//! Aligns the model's chart proposal with the keys actually present in a
//! result set and fills in pie-chart axes the model left out.

use crate::dataset::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Area,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    pub config: ChartConfig,
    pub data: Vec<Row>,
}

/// Truncate to `limit` rows and resolve axes against the first row's keys.
/// Returns `None` for an empty result.
pub fn normalize_chart(rows: &[Row], config: &ChartConfig, limit: usize) -> Option<ChartData> {
    let data: Vec<Row> = rows.iter().take(limit).cloned().collect();
    let first = data.first()?;
    let keys: Vec<&String> = first.keys().collect();
    let by_lower: HashMap<String, &String> = keys.iter().map(|k| (k.to_lowercase(), *k)).collect();

    let resolve = |axis: &Option<String>| -> Option<String> {
        axis.as_ref().map(|name| {
            by_lower
                .get(&name.to_lowercase())
                .map(|k| (*k).clone())
                .unwrap_or_else(|| name.clone())
        })
    };

    let mut config = config.clone();
    config.x_axis = resolve(&config.x_axis);
    config.y_axis = resolve(&config.y_axis);

    if config.chart_type == ChartType::Pie {
        if config.x_axis.is_none() {
            config.x_axis = keys
                .iter()
                .find(|k| matches!(first.get(k.as_str()), Some(Value::String(_))))
                .or_else(|| keys.first())
                .map(|k| (*k).clone());
        }
        if config.y_axis.is_none() {
            config.y_axis = keys
                .iter()
                .find(|k| matches!(first.get(k.as_str()), Some(Value::Number(_))))
                .or_else(|| keys.get(1))
                .map(|k| (*k).clone());
        }
    }

    Some(ChartData { config, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    fn config(chart_type: ChartType, x: Option<&str>, y: Option<&str>) -> ChartConfig {
        ChartConfig {
            chart_type,
            title: "t".into(),
            x_axis: x.map(str::to_string),
            y_axis: y.map(str::to_string),
            group_by: None,
        }
    }

    #[test]
    fn test_axis_case_normalization() {
        let data = rows(vec![json!({"Region": "N", "Revenue": 10}), json!({"Region": "S", "Revenue": 5})]);
        let chart = normalize_chart(&data, &config(ChartType::Bar, Some("region"), Some("revenue")), 50).unwrap();
        assert_eq!(chart.config.x_axis.as_deref(), Some("Region"));
        assert_eq!(chart.config.y_axis.as_deref(), Some("Revenue"));
    }

    #[test]
    fn test_unknown_axis_left_unchanged() {
        let data = rows(vec![json!({"a": 1}), json!({"a": 2})]);
        let chart = normalize_chart(&data, &config(ChartType::Line, Some("missing"), None), 50).unwrap();
        assert_eq!(chart.config.x_axis.as_deref(), Some("missing"));
        assert_eq!(chart.config.y_axis, None);
    }

    #[test]
    fn test_pie_infers_axes() {
        let data = rows(vec![json!({"n": 3, "label": "x"}), json!({"n": 4, "label": "y"})]);
        let chart = normalize_chart(&data, &config(ChartType::Pie, None, None), 50).unwrap();
        assert_eq!(chart.config.x_axis.as_deref(), Some("label"));
        assert_eq!(chart.config.y_axis.as_deref(), Some("n"));
    }

    #[test]
    fn test_pie_positional_fallback() {
        let data = rows(vec![json!({"a": true, "b": null}), json!({"a": false, "b": null})]);
        let chart = normalize_chart(&data, &config(ChartType::Pie, None, None), 50).unwrap();
        assert_eq!(chart.config.x_axis.as_deref(), Some("a"));
        assert_eq!(chart.config.y_axis.as_deref(), Some("b"));
    }

    #[test]
    fn test_truncates_to_limit() {
        let data: Vec<Row> = (0..80).map(|i| json!({"i": i}).as_object().cloned().unwrap()).collect();
        let chart = normalize_chart(&data, &config(ChartType::Bar, Some("i"), Some("i")), 50).unwrap();
        assert_eq!(chart.data.len(), 50);
    }

    #[test]
    fn test_config_wire_format() {
        let parsed: ChartConfig =
            serde_json::from_value(json!({"type": "pie", "title": "Share", "xAxis": "k"})).unwrap();
        assert_eq!(parsed.chart_type, ChartType::Pie);
        assert_eq!(parsed.x_axis.as_deref(), Some("k"));
        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["type"], "pie");
        assert!(back.get("yAxis").is_none());
    }

    #[test]
    fn test_empty_rows() {
        assert!(normalize_chart(&[], &config(ChartType::Bar, None, None), 50).is_none());
    }
}
