//! task-engine - command line entry point
//!
//! Runs one task unattended against the configured model and prints its result.

use std::sync::Arc;

use task_engine::checkpoint::RecordingCheckpoints;
use task_engine::llm::OpenRouterClient;
use task_engine::messages::{AutoResponder, MessageKind, SayKind};
use task_engine::store::FileTaskStore;
use task_engine::task::{AbortReason, BackgroundContext, TaskEvent};
use task_engine::{Config, EngineContext, NewTaskRequest, TaskEngine};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "task_engine=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let text = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("usage: task-engine <task description>");
    }

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, workspace={}",
        config.default_model,
        config.working_dir.display()
    );

    let client = OpenRouterClient::new(config.require_api_key()?, config.default_model.clone())
        .with_base_url(config.base_url.clone())
        .with_limits(config.context.context_window, config.context.max_output_tokens);
    let store = FileTaskStore::new(config.storage_dir.clone()).await?;
    let checkpoints_enabled = config.checkpoints_enabled;

    let mut ctx = EngineContext::new(config, Arc::new(client), Arc::new(store));
    if checkpoints_enabled {
        ctx = ctx.with_checkpoints(Arc::new(RecordingCheckpoints::new()));
    }

    let engine = TaskEngine::new(ctx);
    let mut events = engine.subscribe();
    let task = engine
        .new_task(
            NewTaskRequest::new(text)
                .in_background(BackgroundContext::new("cli"))
                .with_responder(Arc::new(AutoResponder::new())),
        )
        .await?;
    let task_id = task.id();
    info!(task_id = %task_id, "Task started");

    let outcome = async {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            };
            match event.event {
                TaskEvent::Message { message }
                    if message.kind == MessageKind::Say(SayKind::Text) && !message.is_partial() =>
                {
                    if let Some(text) = message.text {
                        println!("{}", text);
                    }
                }
                TaskEvent::Completed { result, token_usage, .. } if event.task_id == task_id => {
                    info!(cost = token_usage.total_cost, "Task finished");
                    return Some(Ok(result));
                }
                // a broken stream is rebuilt by the engine, only a failure ends the run
                TaskEvent::Aborted {
                    reason: AbortReason::Failed,
                } if event.task_id == task_id => return Some(Err(AbortReason::Failed)),
                _ => {}
            }
        }
    };

    tokio::select! {
        outcome = outcome => match outcome {
            Some(Ok(result)) => println!("\n{}", result),
            Some(Err(reason)) => warn!(?reason, "Task stopped before completing"),
            None => warn!("Task engine went away"),
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    engine.shutdown().await;
    Ok(())
}
