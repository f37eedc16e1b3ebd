//! Chart construction: a closed set of chart types rendered to Vega-Lite
//! specifications.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::table::{ColumnType, ResultTable};

/// Bars with more categories than this are drawn horizontally.
const HORIZONTAL_BAR_THRESHOLD: usize = 8;
/// Line charts with at most this many rows get point markers.
const LINE_MARKER_MAX_ROWS: usize = 20;
/// Axis values above this get thousands separators.
const THOUSANDS_FORMAT_THRESHOLD: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    BarChart,
    LineChart,
    AreaChart,
    ScatterPlot,
    PieChart,
    Histogram,
    BoxPlot,
}

impl ChartType {
    pub const ALL: [ChartType; 7] = [
        ChartType::BarChart,
        ChartType::LineChart,
        ChartType::AreaChart,
        ChartType::ScatterPlot,
        ChartType::PieChart,
        ChartType::Histogram,
        ChartType::BoxPlot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::BarChart => "bar_chart",
            ChartType::LineChart => "line_chart",
            ChartType::AreaChart => "area_chart",
            ChartType::ScatterPlot => "scatter_plot",
            ChartType::PieChart => "pie_chart",
            ChartType::Histogram => "histogram",
            ChartType::BoxPlot => "box_plot",
        }
    }

    /// Argument signature shown to the LLM.
    pub fn signature(&self) -> &'static str {
        match self {
            ChartType::BarChart => {
                "x (category column), y (value column), color (optional column), orientation (optional, \"h\"), title (optional)"
            }
            ChartType::LineChart => {
                "x (temporal or ordered column), y (value column), color (optional series column), title (optional)"
            }
            ChartType::AreaChart => {
                "x (temporal or ordered column), y (value column), color (optional series column), title (optional)"
            }
            ChartType::ScatterPlot => {
                "x (numeric column), y (numeric column), color (optional column), title (optional)"
            }
            ChartType::PieChart => "names (category column), values (value column), title (optional)",
            ChartType::Histogram => "x (numeric column), nbins (optional integer), color (optional column), title (optional)",
            ChartType::BoxPlot => "y (numeric column), x (optional category column), color (optional column), title (optional)",
        }
    }

    /// One line per chart type, for the visualization prompt.
    pub fn catalogue() -> String {
        Self::ALL
            .iter()
            .map(|chart| format!("- {}: {}", chart.as_str(), chart.signature()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartType {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|chart| chart.as_str() == name)
            .ok_or_else(|| Error::UnsupportedChart(name.to_string()))
    }
}

/// Construction arguments. Unknown keys from the LLM are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub names: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbins: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
}

/// Chart type plus arguments: everything needed to redraw a chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRequest {
    pub chart_type: ChartType,
    pub args: ChartArgs,
}

impl ChartRequest {
    pub fn new(chart_type: ChartType, args: ChartArgs) -> Self {
        Self { chart_type, args }
    }

    /// Reads `{"<chart type>": {<args>}}`.
    pub fn from_toolset(toolset: &Map<String, Value>) -> Result<Self> {
        let mut entries = toolset.iter();
        let (name, args) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(Error::Visualization(format!(
                    "The visualization toolset must name exactly one chart type, got {}.",
                    toolset.len()
                )));
            }
        };
        let chart_type: ChartType = name.parse()?;
        let args = match args {
            Value::Null => ChartArgs::default(),
            other => serde_json::from_value(other.clone()).map_err(|e| {
                Error::Visualization(format!("Invalid arguments for {}: {}", name, e))
            })?,
        };
        Ok(Self { chart_type, args })
    }
}

/// Look of every rendered chart. Passed to the provider explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartStyle {
    pub font: String,
    pub font_size: u32,
    pub title_size: u32,
    pub text_color: String,
    pub tick_color: String,
    pub background: String,
    pub grid_color: String,
    pub axis_color: String,
    pub colorway: Vec<String>,
    pub width: u32,
    pub height: u32,
}

impl Default for ChartStyle {
    fn default() -> Self {
        Self {
            font: "Arial, sans-serif".to_string(),
            font_size: 12,
            title_size: 20,
            text_color: "#333333".to_string(),
            tick_color: "#555555".to_string(),
            background: "white".to_string(),
            grid_color: "#e9e9e9".to_string(),
            axis_color: "#d9d9d9".to_string(),
            colorway: ["#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            width: 640,
            height: 400,
        }
    }
}

impl ChartStyle {
    fn to_config(&self) -> Value {
        json!({
            "font": self.font,
            "background": self.background,
            "range": { "category": self.colorway },
            "title": { "fontSize": self.title_size, "color": self.text_color, "anchor": "middle" },
            "axis": {
                "grid": true,
                "gridColor": self.grid_color,
                "domainColor": self.axis_color,
                "tickColor": self.axis_color,
                "labelColor": self.tick_color,
                "labelFontSize": self.font_size,
                "titleColor": self.text_color,
                "titleFontSize": self.font_size
            },
            "legend": {
                "orient": "top",
                "direction": "horizontal",
                "labelFontSize": self.font_size,
                "titleFontSize": self.font_size + 1,
                "titleColor": self.tick_color
            },
            "view": { "stroke": self.axis_color }
        })
    }
}

/// A rendered chart: a Vega-Lite v5 specification with inline data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub chart_type: ChartType,
    pub spec: Value,
}

pub trait VisualizationProvider: Send + Sync {
    /// Fails on missing arguments or columns absent from `table`.
    fn create_chart(&self, request: &ChartRequest, table: &ResultTable) -> Result<Chart>;
}

/// Redraws a chart from stored parameters, e.g. after re-running its SQL.
pub fn regenerate_chart(
    provider: &dyn VisualizationProvider,
    params: &ChartRequest,
    table: &ResultTable,
) -> Result<Chart> {
    info!("Regenerating {} from stored parameters", params.chart_type);
    provider.create_chart(params, table)
}

#[derive(Debug, Clone, Default)]
pub struct VegaLiteProvider {
    style: ChartStyle,
}

impl VegaLiteProvider {
    pub fn new(style: ChartStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &ChartStyle {
        &self.style
    }
}

impl VisualizationProvider for VegaLiteProvider {
    fn create_chart(&self, request: &ChartRequest, table: &ResultTable) -> Result<Chart> {
        debug!("Creating {} over {} rows", request.chart_type, table.row_count());
        let builder = SpecBuilder { table, args: &request.args };

        let body = match request.chart_type {
            ChartType::BarChart => builder.bar()?,
            ChartType::LineChart => builder.line()?,
            ChartType::AreaChart => builder.area()?,
            ChartType::ScatterPlot => builder.scatter()?,
            ChartType::PieChart => builder.pie()?,
            ChartType::Histogram => builder.histogram()?,
            ChartType::BoxPlot => builder.box_plot()?,
        };

        let mut spec = json!({
            "$schema": "https://vega.github.io/schema/vega-lite/v5.json",
            "width": self.style.width,
            "height": self.style.height,
            "data": { "values": table.to_records() },
            "config": self.style.to_config(),
        });
        if let (Some(spec), Value::Object(body)) = (spec.as_object_mut(), body) {
            spec.extend(body);
            if let Some(title) = &request.args.title {
                spec.insert("title".to_string(), Value::String(title.clone()));
            }
        }

        info!("Generated {} chart", request.chart_type);
        Ok(Chart {
            chart_type: request.chart_type,
            spec,
        })
    }
}

struct SpecBuilder<'a> {
    table: &'a ResultTable,
    args: &'a ChartArgs,
}

impl SpecBuilder<'_> {
    fn require(&self, arg: &str, value: &Option<String>) -> Result<String> {
        let column = value.as_deref().ok_or_else(|| {
            Error::Visualization(format!("Missing required argument '{}'.", arg))
        })?;
        self.column(column)
    }

    fn optional(&self, value: &Option<String>) -> Result<Option<String>> {
        value.as_deref().map(|column| self.column(column)).transpose()
    }

    fn column(&self, name: &str) -> Result<String> {
        if self.table.column(name).is_none() {
            return Err(Error::Visualization(format!(
                "Column '{}' not found. Available columns: {}",
                name,
                self.table.column_names().join(", ")
            )));
        }
        Ok(name.to_string())
    }

    fn field(&self, name: &str) -> Value {
        let kind = match self.table.column(name).map(|c| c.dtype) {
            Some(ColumnType::Temporal) => "temporal",
            Some(ColumnType::Integer | ColumnType::Float) => "quantitative",
            _ => "nominal",
        };
        json!({ "field": field_ref(name), "type": kind, "title": name })
    }

    fn value_field(&self, name: &str) -> Value {
        let mut field = self.field(name);
        if self.max_value(name) > THOUSANDS_FORMAT_THRESHOLD {
            field["axis"] = json!({ "format": "," });
        }
        field
    }

    fn category_field(&self, name: &str) -> Value {
        let mut field = self.field(name);
        field["type"] = json!("nominal");
        field
    }

    fn color_field(&self, name: &str) -> Value {
        let mut field = self.category_field(name);
        if self.table.distinct_count(name) <= 1 {
            field["legend"] = Value::Null;
        }
        field
    }

    fn max_value(&self, name: &str) -> f64 {
        self.table
            .column_values(name)
            .unwrap_or_default()
            .into_iter()
            .filter_map(Value::as_f64)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    fn with_color(&self, mut encoding: Value) -> Result<Value> {
        if let Some(color) = self.optional(&self.args.color)? {
            encoding["color"] = self.color_field(&color);
        }
        Ok(encoding)
    }

    fn bar(&self) -> Result<Value> {
        let x = self.require("x", &self.args.x)?;
        let y = self.require("y", &self.args.y)?;
        let categories = self.table.distinct_count(&x);
        let horizontal = match self.args.orientation.as_deref() {
            Some(orientation) => orientation == "h",
            None => categories > HORIZONTAL_BAR_THRESHOLD,
        };

        let encoding = if horizontal {
            if self.args.orientation.is_none() {
                info!("{} categories, switching to horizontal bars", categories);
            }
            let mut category = self.category_field(&x);
            category["sort"] = json!("-x");
            json!({ "y": category, "x": self.value_field(&y) })
        } else {
            json!({ "x": self.category_field(&x), "y": self.value_field(&y) })
        };

        Ok(json!({
            "mark": { "type": "bar", "stroke": "white", "strokeWidth": 1.5 },
            "encoding": self.with_color(encoding)?
        }))
    }

    fn line(&self) -> Result<Value> {
        let x = self.require("x", &self.args.x)?;
        let y = self.require("y", &self.args.y)?;
        let markers = self.table.row_count() <= LINE_MARKER_MAX_ROWS;
        let mark = if markers {
            json!({ "type": "line", "strokeWidth": 2.5, "point": { "size": 64, "stroke": "white", "strokeWidth": 1 } })
        } else {
            json!({ "type": "line", "strokeWidth": 2.5 })
        };
        let encoding = json!({ "x": self.field(&x), "y": self.value_field(&y) });
        Ok(json!({ "mark": mark, "encoding": self.with_color(encoding)? }))
    }

    fn area(&self) -> Result<Value> {
        let x = self.require("x", &self.args.x)?;
        let y = self.require("y", &self.args.y)?;
        let encoding = json!({ "x": self.field(&x), "y": self.value_field(&y) });
        Ok(json!({
            "mark": { "type": "area", "opacity": 0.8, "line": true },
            "encoding": self.with_color(encoding)?
        }))
    }

    fn scatter(&self) -> Result<Value> {
        let x = self.require("x", &self.args.x)?;
        let y = self.require("y", &self.args.y)?;
        let encoding = json!({ "x": self.field(&x), "y": self.value_field(&y) });
        Ok(json!({
            "mark": { "type": "point", "filled": true, "opacity": 0.7, "stroke": "white", "strokeWidth": 1 },
            "encoding": self.with_color(encoding)?
        }))
    }

    fn pie(&self) -> Result<Value> {
        let names = self.require("names", &self.args.names)?;
        let values = self.require("values", &self.args.values)?;
        let value_expr = format!("datum[{}]", js_string(&values));
        let label_expr = format!(
            "datum[{}] + ' ' + format(datum.__share, '.0%')",
            js_string(&names)
        );

        Ok(json!({
            "transform": [
                { "joinaggregate": [{ "op": "sum", "field": field_ref(&values), "as": "__total" }] },
                { "calculate": format!("{} / datum.__total", value_expr), "as": "__share" },
                { "calculate": label_expr, "as": "__label" }
            ],
            "encoding": {
                "theta": { "field": field_ref(&values), "type": "quantitative", "stack": true },
                "color": { "field": field_ref(&names), "type": "nominal", "legend": null }
            },
            "layer": [
                { "mark": { "type": "arc", "outerRadius": 150, "stroke": "white", "strokeWidth": 2 } },
                {
                    "mark": { "type": "text", "radius": 105, "fill": "white" },
                    "encoding": { "text": { "field": "__label", "type": "nominal" } }
                }
            ]
        }))
    }

    fn histogram(&self) -> Result<Value> {
        let x = self.require("x", &self.args.x)?;
        let bin = match self.args.nbins {
            Some(nbins) => json!({ "maxbins": nbins }),
            None => json!(true),
        };
        let encoding = json!({
            "x": { "field": field_ref(&x), "type": "quantitative", "bin": bin, "title": x },
            "y": { "aggregate": "count", "type": "quantitative", "title": "count" }
        });
        Ok(json!({
            "mark": { "type": "bar", "stroke": "white", "strokeWidth": 1.5 },
            "encoding": self.with_color(encoding)?
        }))
    }

    fn box_plot(&self) -> Result<Value> {
        let y = self.require("y", &self.args.y)?;
        let mut encoding = json!({ "y": self.value_field(&y) });
        if let Some(x) = self.optional(&self.args.x)? {
            encoding["x"] = self.category_field(&x);
        }
        Ok(json!({
            "mark": { "type": "boxplot", "extent": 1.5 },
            "encoding": self.with_color(encoding)?
        }))
    }
}

/// Vega-Lite reads `.` and `[` in field names as nested access.
fn field_ref(name: &str) -> String {
    name.replace('\\', "\\\\")
        .replace('.', "\\.")
        .replace('[', "\\[")
        .replace(']', "\\]")
}

fn js_string(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::table::TableColumn;

    fn monthly(rows: usize) -> ResultTable {
        ResultTable::new(
            vec![
                TableColumn::new("month", ColumnType::Temporal),
                TableColumn::new("revenue", ColumnType::Float),
            ],
            (0..rows)
                .map(|i| vec![json!(format!("2024-{:02}-01", i % 12 + 1)), json!(500.0 * i as f64)])
                .collect(),
        )
    }

    fn by_region(regions: usize) -> ResultTable {
        ResultTable::new(
            vec![
                TableColumn::new("region", ColumnType::Text),
                TableColumn::new("orders", ColumnType::Integer),
            ],
            (0..regions)
                .map(|i| vec![json!(format!("region-{}", i)), json!(i * 10)])
                .collect(),
        )
    }

    fn request(chart_type: ChartType, args: Value) -> ChartRequest {
        ChartRequest::new(chart_type, serde_json::from_value(args).unwrap())
    }

    #[test]
    fn test_unknown_chart_type_is_rejected() {
        let err = "waterfall_chart".parse::<ChartType>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedChart(name) if name == "waterfall_chart"));

        let toolset = json!({"sankey_diagram": {"x": "a"}});
        let err = ChartRequest::from_toolset(toolset.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedChart(_)));
    }

    #[test]
    fn test_toolset_needs_exactly_one_key() {
        let toolset = json!({"bar_chart": {}, "line_chart": {}});
        let err = ChartRequest::from_toolset(toolset.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Visualization(_)));

        let toolset = json!({"line_chart": {"x": "month", "y": "revenue", "markers": true}});
        let parsed = ChartRequest::from_toolset(toolset.as_object().unwrap()).unwrap();
        assert_eq!(parsed.chart_type, ChartType::LineChart);
        assert_eq!(parsed.args.x.as_deref(), Some("month"));
    }

    #[test]
    fn test_missing_column_fails() {
        let provider = VegaLiteProvider::default();
        let err = provider
            .create_chart(
                &request(ChartType::BarChart, json!({"x": "country", "y": "orders"})),
                &by_region(3),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Column 'country' not found"));

        let err = provider
            .create_chart(&request(ChartType::PieChart, json!({"names": "region"})), &by_region(3))
            .unwrap_err();
        assert!(err.to_string().contains("'values'"));
    }

    #[test]
    fn test_bar_switches_to_horizontal_above_eight_categories() {
        let provider = VegaLiteProvider::default();
        let args = json!({"x": "region", "y": "orders"});

        let chart = provider
            .create_chart(&request(ChartType::BarChart, args.clone()), &by_region(8))
            .unwrap();
        assert_eq!(chart.spec["encoding"]["x"]["field"], "region");

        let chart = provider
            .create_chart(&request(ChartType::BarChart, args), &by_region(9))
            .unwrap();
        assert_eq!(chart.spec["encoding"]["y"]["field"], "region");
        assert_eq!(chart.spec["encoding"]["x"]["field"], "orders");
    }

    #[test]
    fn test_line_markers_and_thousands_format() {
        let provider = VegaLiteProvider::default();
        let args = json!({"x": "month", "y": "revenue"});

        let short = provider
            .create_chart(&request(ChartType::LineChart, args.clone()), &monthly(3))
            .unwrap();
        assert!(short.spec["mark"]["point"].is_object());
        assert_eq!(short.spec["encoding"]["x"]["type"], "temporal");
        assert!(short.spec["encoding"]["y"].get("axis").is_none());

        let long = provider
            .create_chart(&request(ChartType::LineChart, args), &monthly(24))
            .unwrap();
        assert!(long.spec["mark"].get("point").is_none());
        assert_eq!(long.spec["encoding"]["y"]["axis"]["format"], ",");
        assert_eq!(long.spec["data"]["values"].as_array().unwrap().len(), 24);
    }

    #[test]
    fn test_single_series_hides_legend() {
        let table = ResultTable::new(
            vec![
                TableColumn::new("region", ColumnType::Text),
                TableColumn::new("segment", ColumnType::Text),
                TableColumn::new("orders", ColumnType::Integer),
            ],
            vec![
                vec![json!("north"), json!("retail"), json!(3)],
                vec![json!("south"), json!("retail"), json!(5)],
            ],
        );
        let chart = VegaLiteProvider::default()
            .create_chart(
                &request(ChartType::BarChart, json!({"x": "region", "y": "orders", "color": "segment"})),
                &table,
            )
            .unwrap();
        assert!(chart.spec["encoding"]["color"]["legend"].is_null());
        assert!(chart.spec["encoding"]["color"].get("legend").is_some());
    }

    #[test]
    fn test_pie_has_labels_and_no_legend() {
        let chart = VegaLiteProvider::default()
            .create_chart(
                &request(
                    ChartType::PieChart,
                    json!({"names": "region", "values": "orders", "title": "Orders by region"}),
                ),
                &by_region(4),
            )
            .unwrap();
        assert_eq!(chart.spec["title"], "Orders by region");
        assert!(chart.spec["encoding"]["color"]["legend"].is_null());
        assert_eq!(chart.spec["layer"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_style_is_applied_per_call() {
        let style = ChartStyle {
            colorway: vec!["#000000".to_string()],
            width: 300,
            ..ChartStyle::default()
        };
        let chart = VegaLiteProvider::new(style)
            .create_chart(&request(ChartType::Histogram, json!({"x": "orders", "nbins": 5})), &by_region(5))
            .unwrap();
        assert_eq!(chart.spec["width"], 300);
        assert_eq!(chart.spec["config"]["range"]["category"], json!(["#000000"]));
        assert_eq!(chart.spec["encoding"]["x"]["bin"]["maxbins"], 5);
    }

    #[test]
    fn test_regenerate_matches_original() {
        let provider = VegaLiteProvider::default();
        let params = request(ChartType::LineChart, json!({"x": "month", "y": "revenue"}));
        let first = provider.create_chart(&params, &monthly(6)).unwrap();
        let again = regenerate_chart(&provider, &params, &monthly(6)).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_dotted_field_names_are_escaped() {
        assert_eq!(field_ref("t.total"), "t\\.total");
        assert_eq!(field_ref("plain"), "plain");
    }
}
