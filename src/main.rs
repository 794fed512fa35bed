//! llama-session: interactive chat over a local model.
//!
//! Reads prompts from stdin and streams replies to stdout. A 16 ms tick
//! pumps session results to the callbacks, the way a game or UI frame loop
//! would.

use std::io::Write;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use llama_session::config::{Cli, Config};
use llama_session::inference::llama_ffi::LlamaBackend;
use llama_session::session::{ConversationController, Role};

#[cfg(feature = "llama")]
fn backend() -> Box<dyn LlamaBackend> {
    Box::new(llama_session::inference::llama_cpp::LlamaCppBackend::new())
}

/// Without llama.cpp the session runs on the simulated backend.
#[cfg(not(feature = "llama"))]
fn backend() -> Box<dyn LlamaBackend> {
    use llama_session::inference::stub::{StubBackend, StubConfig};
    Box::new(StubBackend::new(StubConfig::default()))
}

const FRAME: Duration = Duration::from_millis(16);

const HELP: &str = "\
commands:
  /reset        clear the conversation
  /reset-keep   clear the conversation, keep the system prompt
  /undo         remove the last reply
  /undo-input   remove the last user input and its reply
  /resume       continue a stopped reply
  /stop         stop the current reply
  /history      print the conversation
  /quit         exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "llama_session=debug"
    } else {
        "llama_session=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("llama-session v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;

    info!(
        model = %config.model.model_path.display(),
        context_size = config.model.context_size,
        batch_size = config.model.batch_size,
        template = %config.template.template_source,
        "Configuration loaded"
    );

    let backend = backend();
    let mut controller = ConversationController::new(backend, config)?;
    controller
        .callbacks_mut()
        .on_token(|token| {
            print!("{token}");
            let _ = std::io::stdout().flush();
        })
        .on_generation_complete(|summary| {
            println!();
            info!(
                tokens = summary.token_count,
                tokens_per_second = summary.tokens_per_second,
                reason = ?summary.stop_reason,
                "Reply finished"
            );
        })
        .on_model_loaded(|path| info!(path, "Model ready"))
        .on_context_reset(|| println!("(context reset)"))
        .on_error(|message, code| error!(code = code.as_i32(), "{message}"));

    controller.load_model()?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(FRAME);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                controller.poll();
            }
            _ = tokio::signal::ctrl_c() => {
                if controller.is_generating() {
                    controller.stop_generation();
                } else {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                // Rejections are reported through the error callback.
                let _ = match line {
                    "" => continue,
                    "/quit" => break,
                    "/reset" => controller.reset_context_history(false),
                    "/reset-keep" => controller.reset_context_history(true),
                    "/undo" => controller.remove_last_reply(),
                    "/undo-input" => controller.remove_last_user_input(),
                    "/resume" => controller.resume_generation(),
                    "/stop" => {
                        controller.stop_generation();
                        continue;
                    }
                    "/history" => {
                        for message in controller.structured_history() {
                            println!("[{}] {}", message.role, message.content);
                        }
                        continue;
                    }
                    prompt => controller.insert_prompt(prompt, Role::User, true, true),
                };
            }
        }
    }

    controller.shutdown();
    info!("Session closed");
    Ok(())
}
