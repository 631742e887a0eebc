use std::io::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tracing_subscriber::EnvFilter;

use agent_relay::config::{InvokerConfig, QueueConfig, SchedulerConfig};
use agent_relay::delivery::ConsoleDelivery;
use agent_relay::invoker::{AgentInvoker, AgentProvider, InvokeRequest};
use agent_relay::queue::{TaskMetadata, TaskQueue, TaskWork, truncate_for_preview};
use agent_relay::scheduler::JobScheduler;
use agent_relay::store::MemoryJobStore;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; when RELAY_LOG_DIR is set, write to a daily
    // rolling file instead of stderr. The guard must outlive main.
    let _log_guard = match std::env::var("RELAY_LOG_DIR") {
        Ok(dir) => {
            let file = tracing_appender::rolling::daily(dir, "agent-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let invoker_config = InvokerConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env();

    eprintln!("🤖 Agent Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent program: {}", invoker_config.program);
    eprintln!("   Tool config: {}", scheduler_config.tool_config.display());
    eprintln!("   Type a message and press Enter. /quit to exit.\n");

    let invoker: Arc<dyn AgentProvider> = Arc::new(AgentInvoker::new(invoker_config));
    let queue = TaskQueue::new(QueueConfig::default());
    queue.start().await;

    let store = Arc::new(MemoryJobStore::new());
    let delivery = Arc::new(ConsoleDelivery);
    let scheduler = JobScheduler::new(
        scheduler_config.clone(),
        store,
        Arc::clone(&invoker),
        delivery,
    );
    scheduler.start().await?;

    // Log task lifecycle events
    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    kind = event.kind(),
                    channel = event.channel_id(),
                    task = %event.task().id,
                    "Task event"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Task event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Conversation session token, threaded between CLI turns
    let session: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }

                let invoker = Arc::clone(&invoker);
                let session = Arc::clone(&session);
                let tool_config = scheduler_config.tool_config.clone();
                let prompt = text.clone();
                let work: TaskWork = Box::new(move |token| {
                    Box::pin(async move {
                        let mut request = InvokeRequest::new(prompt, tool_config)
                            .with_token_callback(Box::new(|chunk: &str| {
                                print!("{chunk}");
                                let _ = std::io::stdout().flush();
                            }))
                            .with_cancel(token);
                        if let Some(prior) = session.lock().await.clone() {
                            request = request.with_resume(prior);
                        }
                        let reply = invoker.invoke(request).await?;
                        println!();
                        *session.lock().await = reply.session_id.clone();
                        Ok(reply.text)
                    })
                });

                let metadata = TaskMetadata::default()
                    .with_preview(truncate_for_preview(&text, 80))
                    .with_platform("cli");
                queue.enqueue("cli", work, metadata).await;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    scheduler.shutdown().await;
    queue.shutdown().await;
    eprintln!("Bye.");
    Ok(())
}
