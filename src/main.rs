//! Platewise MCP server - serves the built-in journal tools over stdio.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use platewise_core::dispatch::{Dispatcher, FanoutSink, ToolMetrics, TracingSink};
use platewise_core::journal::register_builtin_tools;
use platewise_core::resilience::CircuitBreakerRegistry;
use platewise_core::server::{serve_stdio, ServerOptions};
use platewise_core::tools::{CallerIdentity, ToolRegistry};
use platewise_core::Config;

#[derive(Debug, Parser)]
#[command(name = "platewise-mcp", version, about = "Platewise food journal tools over MCP stdio")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "PLATEWISE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON logs on stderr
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if args.json_logs {
        config.observability.json_logs = true;
    }
    platewise_core::observability::init_tracing(&config.observability);

    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breakers.clone()));
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, breakers.clone())?;

    let metrics = Arc::new(ToolMetrics::default());
    let sink = FanoutSink::new(Vec::new())
        .with(Arc::new(TracingSink))
        .with(metrics.clone());

    let dispatcher = Arc::new(
        Dispatcher::builder(Arc::new(registry))
            .config(&config)
            .circuit_breakers(breakers)
            .sink(Arc::new(sink))
            .build(),
    );
    let options = ServerOptions {
        caller: CallerIdentity {
            user_id: config.dispatch.default_user_id.clone(),
            can_write: config.dispatch.can_write,
            is_admin: config.dispatch.is_admin,
        },
        max_line_bytes: config.dispatch.max_request_bytes,
        ..ServerOptions::default()
    };

    tracing::info!(
        tools = dispatcher.registry().len(),
        default_user = %options.caller.user_id,
        can_write = options.caller.can_write,
        is_admin = options.caller.is_admin,
        "platewise-mcp starting"
    );

    tokio::select! {
        result = serve_stdio(dispatcher, options) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    let summary = metrics.summary();
    for tool in &summary.tools {
        tracing::info!(
            tool = %tool.tool,
            calls = tool.calls,
            success_rate = tool.success_rate,
            avg_latency_ms = tool.avg_latency_ms,
            "tool metrics"
        );
    }
    tracing::info!(total_calls = summary.total_calls, "platewise-mcp stopped");

    Ok(())
}
