//! hardened-agent 命令行：用 Mock LLM 演示监管层
//!
//! 用法：hardened-agent [behavior] [goal...]
//! behavior：normal / loop / confused / overconfident / contradictory / token_heavy

use std::sync::Arc;

use anyhow::Context;
use hardened_agent::config::{load_config, LedgerBackend};
use hardened_agent::llm::{MockBehavior, MockLlmClient};
use hardened_agent::memory::{ActionLedger, InMemoryLedger, SqliteLedger};
use hardened_agent::tools::{default_registry, ToolExecutor};
use hardened_agent::{observability, HardenedAgent, Supervisor};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(None).context("Failed to load config")?;
    observability::init(&config.observability.log_level);
    config.validate().context("Invalid config")?;

    let mut args = std::env::args().skip(1);
    let behavior: MockBehavior = match args.next() {
        Some(b) => b.parse().map_err(anyhow::Error::msg)?,
        None => MockBehavior::LoopForever,
    };
    let goal = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() {
            "Find the answer".to_string()
        } else {
            rest.join(" ")
        }
    };

    let ledger: Arc<dyn ActionLedger> = match config.ledger.backend {
        LedgerBackend::Memory => Arc::new(InMemoryLedger::new()),
        LedgerBackend::Sqlite => Arc::new(
            SqliteLedger::open(&config.ledger.path)
                .with_context(|| format!("Failed to open ledger {}", config.ledger.path.display()))?,
        ),
    };
    let supervisor = Arc::new(Supervisor::new(&config, ledger)?);
    let metrics = Arc::clone(supervisor.metrics());
    let executor = ToolExecutor::new(default_registry(), config.agent.tool_timeout_secs);
    let agent = HardenedAgent::new(
        Arc::new(MockLlmClient::new(behavior)),
        executor,
        supervisor,
        &config.agent,
    );

    // Ctrl+C 取消当前运行（在步与步之间生效）
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = agent.run(&goal, cancel).await.context("Agent run failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if config.observability.print_metrics {
        eprintln!("{}", metrics.render().context("Failed to render metrics")?);
    }
    Ok(())
}
