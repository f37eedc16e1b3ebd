use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, bail};
use clap::Parser;
use insightflow_rs::config::LlmProviderSettings;
use insightflow_rs::utils::database::DuckDbGateway;
use insightflow_rs::{IntelliQuery, ResultStatus, ResultTable, Settings};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "text2sql")]
#[command(about = "Ask questions about CSV data in plain language")]
struct Args {
    /// CSV files to load; each becomes a table named after the file
    #[arg(long = "csv", default_values = ["example_data/customers.csv", "example_data/orders.csv"])]
    csv: Vec<PathBuf>,

    /// DuckDB database file
    #[arg(long, default_value = "ecommerce.duckdb")]
    db: PathBuf,

    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model used when the settings declare no provider
    #[arg(long, default_value = "qwen-plus")]
    model: String,

    #[arg(long, default_value = "https://dashscope.aliyuncs.com/compatible-mode/v1/")]
    endpoint: String,

    #[arg(long, default_value = "DASH_SCOPE_API_KEY")]
    api_key_env: String,

    /// Free-text notes about the data passed to the SQL writer
    #[arg(short, long)]
    business_context: Option<String>,

    /// Where to write the Vega-Lite spec of the last chart
    #[arg(long)]
    chart_out: Option<PathBuf>,
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    if settings.llm_providers.is_empty() {
        settings.llm_providers.insert(
            "default".to_string(),
            LlmProviderSettings {
                model: args.model.clone(),
                endpoint: args.endpoint.clone(),
                api_key_env: args.api_key_env.clone(),
            },
        );
        settings.default_provider = Some("default".to_string());
    }
    Ok(settings)
}

fn load_csv(gateway: &DuckDbGateway, path: &Path) -> Result<()> {
    let table = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("cannot derive a table name from {}", path.display()))?;
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("table name '{}' must be alphanumeric", table);
    }
    gateway.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM read_csv_auto('{}', AUTO_DETECT=TRUE)",
        table,
        path.display().to_string().replace('\'', "''")
    ))?;
    info!("Loaded {} into table '{}'", path.display(), table);
    Ok(())
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_table(table: &ResultTable) {
    let headers: Vec<String> = table.column_names().iter().map(|h| h.to_string()).collect();
    if headers.is_empty() {
        println!("Query returned no columns.");
        return;
    }
    let data: Vec<Vec<String>> = table.rows.iter().map(|row| row.iter().map(cell).collect()).collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &data {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_line = headers
        .iter()
        .zip(&widths)
        .map(|(h, w)| format!("{:<width$}", h, width = w))
        .collect::<Vec<_>>()
        .join(" | ");
    println!("\n{}", header_line);

    let separator_line = widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>()
        .join("-+-");
    println!("{}", separator_line);

    if data.is_empty() {
        println!("(No rows returned)");
    } else {
        for row in &data {
            let row_line = row
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<width$}", c, width = w))
                .collect::<Vec<_>>()
                .join(" | ");
            println!("{}", row_line);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = load_settings(&args)?;

    let gateway = Arc::new(DuckDbGateway::open(&args.db)?);
    for path in &args.csv {
        load_csv(&gateway, path)?;
    }

    let query = IntelliQuery::builder(gateway)
        .settings(settings)
        .openai_providers()?
        .build()?;

    let mut history: Vec<(String, String)> = Vec::new();
    let stdin = io::stdin();
    loop {
        print!("\nAsk a question about your data (empty line to quit): ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            break;
        }

        let result = match query
            .ask(question, &history, args.business_context.as_deref(), None)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                eprintln!("Error: {}", e);
                continue;
            }
        };

        match result.status {
            ResultStatus::Success => println!("\n{}", result.final_answer),
            ResultStatus::ClarificationNeeded => println!("\nClarification needed: {}", result.final_answer),
            ResultStatus::Error => println!(
                "\n{}\nError: {}",
                result.final_answer,
                result.error_message.as_deref().unwrap_or("unknown")
            ),
        }
        if let Some(sql) = &result.sql_query {
            println!("\nSQL:\n{}", sql);
        }
        if let Some(table) = &result.result_table {
            print_table(table);
        }
        if let (Some(chart), Some(path)) = (&result.chart, &args.chart_out) {
            std::fs::write(path, serde_json::to_string_pretty(&chart.spec)?)?;
            println!("Chart ({}) written to {}", chart.chart_type, path.display());
        }

        let summary = result.sql_query.clone().unwrap_or_else(|| result.final_answer.clone());
        history.push((question.to_string(), summary));
    }

    Ok(())
}
