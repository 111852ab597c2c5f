//! graphlink CLI: run operations, merge cache snapshots, classify errors
//!
//! Usage:
//!   graphlink-cli query <url> <document> [--variables <json>] [--context <ctx>]
//!   graphlink-cli merge <server.json> <existing.json>
//!   graphlink-cli classify <error.json>

use anyhow::{anyhow, bail, Context};
use graphlink::transport::TransportError;
use graphlink::{
    classify, CacheSnapshot, ClientConfig, Error, ErrorContext, ExecutionContext, GraphqlClient,
    GraphqlError, Operation,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use url::Url;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "query" => cmd_query(&args[2..]),
        "merge" => cmd_merge(&args[2..]),
        "classify" => cmd_classify(&args[2..]),
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"graphlink-cli: GraphQL data layer tools

USAGE:
    graphlink-cli <COMMAND> [OPTIONS]

COMMANDS:
    query <url> <document>          Execute an operation and print data plus cache
        --variables <json>          Operation variables (JSON object)
        --context <ctx>             rendering | interactive (default: rendering)
    merge <server> <existing>       Merge two cache snapshot files, print the result
    classify <error.json>           Print the presentable message for an error
    version                         Show version information
    help                            Show this help message

ENVIRONMENT:
    RUST_LOG                        Log filter (default: warn)
    GRAPHLINK_RETRY_MAX_ATTEMPTS    Retry bound for `query` (default: 5)
    GRAPHLINK_RETRY_MIN_DELAY_MS    Initial backoff (default: 300)
"#
    );
}

fn version_line() -> String {
    format!(
        "graphlink-cli {} (stream protocol: {})",
        env!("CARGO_PKG_VERSION"),
        graphlink::transport::ws::SUB_PROTOCOL,
    )
}

fn cmd_version() {
    println!("{}", version_line());
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
        } else if arg.starts_with("--") {
            skip = true;
        } else {
            out.push(arg.as_str());
        }
    }
    out
}

/// Retry knobs from the environment, everything else from the arguments.
fn config_for(url: Url) -> anyhow::Result<ClientConfig> {
    let config = ClientConfig::new(url);
    if std::env::var("GRAPHLINK_PUBLIC_API_URL").is_ok() {
        let env = ClientConfig::from_env()?;
        return Ok(config.with_retry(env.retry));
    }
    Ok(config)
}

fn cmd_query(args: &[String]) -> anyhow::Result<()> {
    let pos = positional(args);
    let (url, document) = match pos.as_slice() {
        [url, document, ..] => (*url, *document),
        _ => bail!("usage: graphlink-cli query <url> <document> [--variables <json>]"),
    };
    let url = Url::parse(url).with_context(|| format!("invalid url '{url}'"))?;
    let variables: Value = match flag(args, "--variables") {
        Some(raw) => serde_json::from_str(raw).context("--variables must be JSON")?,
        None => Value::Null,
    };
    let context: ExecutionContext = flag(args, "--context").unwrap_or("rendering").parse()?;

    let operation = Operation::parse(document)?;
    let client = GraphqlClient::builder(config_for(url)?, context).build()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let response = runtime.block_on(client.execute(&operation, variables));
    match response {
        Ok(response) => {
            let out = json!({
                "data": response.data,
                "cache": client.extract().to_value(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Err(e) => Err(anyhow!(classify(&e)).context(format!("{} failed", operation.display_name()))),
    }
}

fn read_snapshot(path: &str) -> anyhow::Result<CacheSnapshot> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    CacheSnapshot::from_json_str(&text).with_context(|| format!("parsing {path}"))
}

fn cmd_merge(args: &[String]) -> anyhow::Result<()> {
    let (server, existing) = match args {
        [server, existing, ..] => (read_snapshot(server)?, read_snapshot(existing)?),
        _ => bail!("usage: graphlink-cli merge <server.json> <existing.json>"),
    };
    let merged = graphlink::hydration::merge(&server, &existing);
    println!("{}", serde_json::to_string_pretty(&merged.to_value())?);
    Ok(())
}

/// Accepts a GraphQL response body (`errors`), an HTTP failure (`status`,
/// optional `body`) or a bare `message`.
fn error_from_json(value: &Value) -> anyhow::Result<Error> {
    if let Some(errors) = value.get("errors") {
        let errors: Vec<GraphqlError> = serde_json::from_value(errors.clone())?;
        return Ok(Error::Api { errors });
    }
    if let Some(status) = value.get("status").and_then(Value::as_u64) {
        return Ok(Error::Transport(TransportError::Status {
            status: u16::try_from(status).context("status out of range")?,
            body: value
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }));
    }
    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return Ok(Error::runtime_with_context(message, ErrorContext::new()));
    }
    bail!("expected one of: errors, status, message")
}

fn cmd_classify(args: &[String]) -> anyhow::Result<()> {
    let Some(path) = args.first() else {
        bail!("usage: graphlink-cli classify <error.json>");
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let value: Value = serde_json::from_str(&text)?;
    println!("{}", classify(&error_from_json(&value)?));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_names_the_release_once() {
        let line = version_line();
        assert_eq!(line.matches(env!("CARGO_PKG_VERSION")).count(), 1);
        assert!(line.ends_with("(stream protocol: graphql-ws)"));
    }

    #[test]
    fn classify_input_shapes() {
        let api = error_from_json(&json!({"errors": [{"message": "nope"}]})).unwrap();
        assert_eq!(classify(&api), "Error: nope");
        let status = error_from_json(&json!({"status": 500})).unwrap();
        assert_eq!(classify(&status), graphlink::client::GENERIC_SERVER_ERROR_MESSAGE);
        assert!(error_from_json(&json!({"other": 1})).is_err());
    }
}
