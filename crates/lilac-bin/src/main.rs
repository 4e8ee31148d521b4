//! Command-line driver for the Lilac dataset engine: opens a dataset
//! directory and exposes the Query API as subcommands.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use lilac_cli::{DatasetArgs, OutputArgs, OutputFormat};
use lilac_core::dataset::{Search, SelectRowsRequest};
use lilac_core::path::Path;
use lilac_core::planner::ColumnRequest;
use lilac_core::schema::SignalDescriptor;
use lilac_core::signal::SignalRegistry;
use lilac_core::stats::{Bins, GroupOrder, SortBy};
use lilac_core::value::Row;
use lilac_core::{Dataset, EngineConfig};
use std::collections::BTreeMap;

#[derive(Parser, Debug)]
#[command(name = "lilac", version, about = "Query a Lilac dataset")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the dataset's namespace, name, schema, and row count
    Manifest {
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Run a query and print matching rows
    SelectRows {
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        output: OutputArgs,
        /// Dotted leaf paths to select, e.g. `text`, `text.__value__`
        #[arg(long = "column", value_name = "PATH")]
        columns: Vec<String>,
        /// Substring search: `<path>:<query>`, e.g. `text:hello`
        #[arg(long = "contains", value_name = "PATH:QUERY")]
        contains: Vec<String>,
        /// Maximum number of rows to return
        #[arg(long = "limit")]
        limit: Option<usize>,
        /// Number of rows to skip before the first returned row
        #[arg(long = "offset", default_value_t = 0)]
        offset: usize,
        /// Resolve `__span__` markers against their source text before output
        #[arg(long = "resolve-spans", action)]
        resolve_spans: bool,
    },
    /// Print approximate statistics for one leaf column
    Stats {
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        output: OutputArgs,
        /// Dotted leaf path to summarize
        #[arg(long = "path")]
        path: String,
    },
    /// Print value counts grouped by one leaf column
    SelectGroups {
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        output: OutputArgs,
        /// Dotted leaf path to group by
        #[arg(long = "path")]
        path: String,
        /// Maximum number of groups to return
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Compute a registered signal over a leaf path and write it as a new signal shard
    ComputeSignal {
        #[command(flatten)]
        dataset: DatasetArgs,
        /// Dotted leaf path the signal reads from
        #[arg(long = "path")]
        path: String,
        /// Registered signal name, e.g. `text_statistics`
        #[arg(long = "signal")]
        signal: String,
        /// Signal parameters as a JSON object, e.g. `{"k": 3}`
        #[arg(long = "params", default_value = "{}")]
        params: String,
    },
}

fn open_dataset(args: &DatasetArgs) -> Result<Dataset> {
    Dataset::open_dir(args.dataset_dir.clone(), SignalRegistry::with_builtins(), EngineConfig::default())
        .wrap_err_with(|| format!("opening dataset at {}", args.dataset_dir.display()))
}

fn print_rows(rows: &[Row], format: OutputFormat) -> Result<()> {
    let text = match format {
        OutputFormat::Json => serde_json::to_string(rows)?,
        OutputFormat::JsonPretty => serde_json::to_string_pretty(rows)?,
    };
    println!("{text}");
    Ok(())
}

fn print_value(value: &serde_json::Value, format: OutputFormat) -> Result<()> {
    let text = match format {
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::JsonPretty => serde_json::to_string_pretty(value)?,
    };
    println!("{text}");
    Ok(())
}

fn parse_contains(spec: &str) -> Result<Search> {
    let (path, query) = spec
        .split_once(':')
        .ok_or_else(|| eyre!("--contains expects PATH:QUERY, got `{spec}`"))?;
    Ok(Search::Contains {
        path: Path::normalize(path),
        query: query.to_string(),
    })
}

fn parse_params(raw: &str) -> Result<BTreeMap<String, serde_json::Value>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).wrap_err("parsing --params as JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(eyre!("--params must be a JSON object")),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Manifest { dataset, output } => {
            let ds = open_dataset(&dataset)?;
            let manifest = ds.manifest()?;
            let value = serde_json::json!({
                "namespace": manifest.namespace,
                "dataset": manifest.dataset,
                "num_items": manifest.num_items,
                "schema": manifest.schema,
            });
            print_value(&value, output.format)
        }
        Command::SelectRows {
            dataset,
            output,
            columns,
            contains,
            limit,
            offset,
            resolve_spans,
        } => {
            let ds = open_dataset(&dataset)?;
            let columns = columns
                .iter()
                .map(|c| ColumnRequest::path(Path::normalize(c)))
                .collect();
            let searches = contains
                .iter()
                .map(|s| parse_contains(s))
                .collect::<Result<Vec<_>>>()?;
            let rows = ds.select_rows(SelectRowsRequest {
                columns,
                searches,
                limit,
                offset,
                resolve_spans,
                ..Default::default()
            })?;
            print_rows(&rows, output.format)
        }
        Command::Stats { dataset, output, path } => {
            let ds = open_dataset(&dataset)?;
            let result = ds.stats(&Path::normalize(&path))?;
            let value = serde_json::to_value(result)?;
            print_value(&value, output.format)
        }
        Command::SelectGroups {
            dataset,
            output,
            path,
            limit,
        } => {
            let ds = open_dataset(&dataset)?;
            let groups = ds.select_groups(
                &Path::normalize(&path),
                Vec::new(),
                SortBy::Count,
                GroupOrder::Desc,
                limit,
                None::<&Bins>,
            )?;
            let value = serde_json::to_value(groups)?;
            print_value(&value, output.format)
        }
        Command::ComputeSignal {
            dataset,
            path,
            signal,
            params,
        } => {
            let ds = open_dataset(&dataset)?;
            let registry = SignalRegistry::with_builtins();
            let mut descriptor = SignalDescriptor::new(&signal);
            for (key, value) in parse_params(&params)? {
                descriptor = descriptor.with_param(key, value);
            }
            let signal = registry
                .construct(&descriptor)
                .wrap_err_with(|| format!("constructing signal `{signal}`"))?;
            let manifest = ds.compute_signal(&Path::normalize(&path), signal, None)?;
            let value = serde_json::to_value(manifest)?;
            print_value(&value, OutputFormat::JsonPretty)
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
    Ok(())
}
