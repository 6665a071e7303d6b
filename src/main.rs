//! Autopilot 命令行入口
//!
//! 用法：autopilot "<task>" ["<goal>"] [config.toml]
//! 运行一个会话，逐行打印进度事件，最后输出 ExecutionResult（JSON）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autopilot::config::load_config;
use autopilot::core::SessionManager;
use autopilot::llm::create_reasoning_from_config;
use autopilot::memory::{ConversationStore, InMemoryConversationStore, InMemoryLongTerm, Role};
use autopilot::observability;
use autopilot::react::SessionEvent;
use autopilot::tools::{EchoTool, ToolExecutor, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let task = args
        .next()
        .context("usage: autopilot <task> [goal] [config.toml]")?;
    let goal = args.next().unwrap_or_else(|| task.clone());
    let config = load_config(args.next().map(PathBuf::from)).context("Failed to load config")?;

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(registry),
        config.tools.tool_timeout_secs,
    ));
    let llm = create_reasoning_from_config(&config.llm);
    let usage = llm.clone();
    let memory = Arc::new(InMemoryLongTerm::default());
    let conversations = Arc::new(InMemoryConversationStore::new());
    let conversation_id = conversations.create("cli").await;
    conversations
        .append_message(&conversation_id, &task, Role::User)
        .await
        .map_err(anyhow::Error::msg)?;

    let manager = SessionManager::new(config, llm, executor, memory.clone(), conversations);
    let mut handle = manager
        .start_task(&task, &goal, &conversation_id)
        .await
        .context("Failed to start task")?;

    while let Some(event) = handle.events.recv().await {
        match event {
            SessionEvent::Progress(e) => {
                println!(
                    "[{:>5.1}%] {:<13} {}",
                    e.progress,
                    format!("{:?}", e.event_type),
                    e.message
                );
            }
            SessionEvent::Error(report) => {
                eprintln!("error ({:?}): {}", report.kind, report.message);
            }
            SessionEvent::Completed(result) => {
                memory.add(&format!("{task}: {}", result.summary));
                let (prompt_tokens, completion_tokens, total_tokens) = usage.token_usage();
                tracing::info!(prompt_tokens, completion_tokens, total_tokens, "token usage");
                println!("{}", serde_json::to_string_pretty(&result)?);
                break;
            }
        }
    }

    Ok(())
}
