//! Thin HTTP client for the context-cache service.
//!
//! Exit codes: 0 success, 2 usage error (clap), 3 backend unreachable,
//! 4 server error.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

const EXIT_UNREACHABLE: i32 = 3;
const EXIT_SERVER: i32 = 4;

#[derive(Parser)]
#[command(name = "ctxc", about = "Query and manage a local context cache", version)]
struct Cli {
    /// Service address. Falls back to `CTXC_HOST`, then the default port.
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage sources.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },
    /// Trigger ingestion.
    Ingest {
        /// Source ids to ingest.
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Explicit file paths to ingest.
        #[arg(long = "path")]
        paths: Vec<String>,
        /// Ingest every registered source.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Run a query.
    Query {
        text: String,
        #[arg(long, default_value_t = 8)]
        k: usize,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        hybrid: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        rerank: bool,
        /// Repeatable filter: `mime=...`, `source=...`, or `tag=...`.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// Replay a past query from the journal.
    Why { query_id: i64 },
    /// Dump the query journal as JSON lines.
    Export,
}

#[derive(Subcommand)]
enum SourcesAction {
    Add {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        uri: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        include_glob: Option<String>,
        #[arg(long)]
        exclude_glob: Option<String>,
    },
    List,
    Remove {
        id: String,
        #[arg(long)]
        hard: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let host = cli
        .host
        .or_else(|| std::env::var("CTXC_HOST").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "127.0.0.1:5173".to_string());
    let base = format!("http://{host}");

    let result = match cli.command {
        Command::Sources { action } => run_sources(&base, action),
        Command::Ingest { sources, paths, all, priority } => {
            run_ingest(&base, sources, paths, all, priority)
        }
        Command::Query { text, k, hybrid, rerank, filters } => {
            run_query(&base, &text, k, hybrid, rerank, &filters)
        }
        Command::Why { query_id } => get_json(&base, &format!("/why/{query_id}")),
        Command::Export => run_export(&base),
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        }
        Err(err) => fail(err),
    }
}

enum CliError {
    Http(ureq::Error),
    Decode(std::io::Error),
}

impl From<ureq::Error> for CliError {
    fn from(e: ureq::Error) -> Self {
        CliError::Http(e)
    }
}

fn run_sources(base: &str, action: SourcesAction) -> Result<Value, CliError> {
    match action {
        SourcesAction::Add { kind, uri, label, include_glob, exclude_glob } => post_json(
            base,
            "/sources",
            json!({
                "kind": kind,
                "uri": uri,
                "label": label,
                "include_glob": include_glob,
                "exclude_glob": exclude_glob,
            }),
        ),
        SourcesAction::List => get_json(base, "/sources"),
        SourcesAction::Remove { id, hard } => {
            post_json(base, "/delete", json!({ "source_ids": [id], "hard": hard }))
        }
    }
}

fn run_ingest(
    base: &str,
    mut sources: Vec<String>,
    paths: Vec<String>,
    all: bool,
    priority: Option<String>,
) -> Result<Value, CliError> {
    if all {
        let listed = get_json(base, "/sources")?;
        if let Some(items) = listed.as_array() {
            for item in items {
                if let Some(id) = item.get("id").and_then(|v| v.as_str()) {
                    sources.push(id.to_string());
                }
            }
        }
    }
    post_json(
        base,
        "/ingest",
        json!({ "sources": sources, "paths": paths, "priority": priority }),
    )
}

fn run_query(
    base: &str,
    text: &str,
    k: usize,
    hybrid: bool,
    rerank: bool,
    filters: &[String],
) -> Result<Value, CliError> {
    let mut mimes = Vec::new();
    let mut source_ids = Vec::new();
    let mut tags = Vec::new();
    for f in filters {
        match f.split_once('=') {
            Some(("mime", v)) => mimes.push(v.to_string()),
            Some(("source", v)) => source_ids.push(v.to_string()),
            Some(("tag", v)) => tags.push(v.to_string()),
            _ => {
                eprintln!("unknown filter `{f}` (expected mime=, source= or tag=)");
                std::process::exit(2);
            }
        }
    }
    post_json(
        base,
        "/query",
        json!({
            "query": text,
            "k": k,
            "hybrid": hybrid,
            "rerank": rerank,
            "filters": { "mimes": mimes, "source_ids": source_ids, "tags": tags },
        }),
    )
}

fn run_export(base: &str) -> Result<Value, CliError> {
    let journal = get_json(base, "/export")?;
    if let Some(entries) = journal.as_array() {
        for entry in entries {
            println!("{}", serde_json::to_string(entry).unwrap_or_default());
        }
        std::process::exit(0);
    }
    Ok(journal)
}

fn get_json(base: &str, path: &str) -> Result<Value, CliError> {
    let response = ureq::get(&format!("{base}{path}")).call()?;
    response.into_json().map_err(CliError::Decode)
}

fn post_json(base: &str, path: &str, body: Value) -> Result<Value, CliError> {
    let response = ureq::post(&format!("{base}{path}")).send_json(body)?;
    response.into_json().map_err(CliError::Decode)
}

fn fail(err: CliError) -> ! {
    match err {
        CliError::Http(ureq::Error::Status(code, response)) => {
            let detail = response
                .into_json::<Value>()
                .ok()
                .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
                .unwrap_or_else(|| format!("server returned {code}"));
            eprintln!("error: {detail}");
            std::process::exit(EXIT_SERVER);
        }
        CliError::Http(ureq::Error::Transport(t)) => {
            eprintln!("error: backend unreachable: {t}");
            std::process::exit(EXIT_UNREACHABLE);
        }
        CliError::Decode(e) => {
            eprintln!("error: malformed server response: {e}");
            std::process::exit(EXIT_SERVER);
        }
    }
}
