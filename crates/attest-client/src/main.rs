//! Requester binary.
//!
//! Usage: `attest-client [config.toml] <procedure> [name=value ...]`
//!
//! Runs one procedure and prints the staged data and the attestations as
//! JSON. Each `name=value` pair supplies the value of a required credential.

use attest_bridge::PollingBridge;
use attest_client::config::{self, Config};
use attest_client::{HttpProviderGateway, ProcedureClient};
use attest_node::HttpNodeClient;
use attest_services::{SystemClock, VerifieeService};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct Args {
    config_path: Option<String>,
    config_source: &'static str,
    procedure: String,
    values: HashMap<String, String>,
}

fn parse_args(mut args: Vec<String>) -> Result<Args, String> {
    let (config_path, config_source) = if args.first().is_some_and(|a| a.ends_with(".toml")) {
        (Some(args.remove(0)), "cli-arg")
    } else {
        match std::env::var("ATTEST_CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => (Some(path), "env-var"),
            _ => (None, "default"),
        }
    };

    let mut args = args.into_iter();
    let procedure = args
        .next()
        .ok_or_else(|| "usage: attest-client [config.toml] <procedure> [name=value ...]".to_string())?;

    let mut values = HashMap::new();
    for pair in args {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected name=value, got {pair}"))?;
        values.insert(name.to_string(), value.to_string());
    }

    Ok(Args {
        config_path,
        config_source,
        procedure,
        values,
    })
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    let args = match parse_args(std::env::args().skip(1).collect()) {
        Ok(args) => args,
        Err(usage) => {
            eprintln!("{usage}");
            std::process::exit(2);
        }
    };
    let selected_config_path = args.config_path.as_deref().or(Some("client.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the client cannot start without valid config");
    init_tracing(&config);

    tracing::info!(
        source = args.config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let Some(procedure) = config
        .procedures
        .iter()
        .find(|p| p.desc.procedure_name == args.procedure)
    else {
        tracing::error!(procedure = %args.procedure, "procedure is not configured");
        std::process::exit(2);
    };

    let node = Arc::new(
        HttpNodeClient::with_timeout(
            config.node.url.clone(),
            Duration::from_millis(config.node.request_timeout_ms),
        )
        .expect("failed to build the node HTTP client"),
    );
    let clock = Arc::new(SystemClock);
    let bridge = Arc::new(PollingBridge::with_interval(
        node,
        Duration::from_millis(config.node.poll_interval_ms),
    ));
    let verifiee = Arc::new(VerifieeService::new(bridge.clone(), clock.clone()));
    let client = ProcedureClient::new(
        config.identity.peer_id(),
        bridge.clone(),
        verifiee.clone(),
        Arc::new(
            HttpProviderGateway::new(Duration::from_millis(config.node.request_timeout_ms))
                .expect("failed to build the provider HTTP client"),
        ),
        clock,
        config.client.settings(),
    );

    let bridge_handle = bridge.start();
    let verifiee_handle = verifiee.start();

    let result = client.execute(procedure, &args.values).await;

    verifiee_handle.abort();
    bridge_handle.stop();

    match result {
        Ok(outcome) => match serde_json::to_string_pretty(&outcome) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outcome");
                std::process::exit(1);
            }
        },
        Err(e) => {
            tracing::error!(procedure = %args.procedure, error = %e, "procedure failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_path_and_values() {
        let parsed = parse_args(args(&["client.toml", "p_kvknr", "bsn=bsn1"])).unwrap();
        assert_eq!(parsed.config_path.as_deref(), Some("client.toml"));
        assert_eq!(parsed.config_source, "cli-arg");
        assert_eq!(parsed.procedure, "p_kvknr");
        assert_eq!(parsed.values["bsn"], "bsn1");
    }

    #[test]
    fn rejects_missing_procedure_and_bad_pairs() {
        assert!(parse_args(args(&["client.toml"])).is_err());
        assert!(parse_args(args(&["p_kvknr", "bsn"])).is_err());
    }
}
