use std::io::Read;

use convo_budget::cli::{Action, Command};
use convo_budget::compaction::{compact_all, run_periodic};
use convo_budget::config::{Configuration, init_logger, verbose};
use convo_budget::context::{CompressionOutcome, Optimizer, estimate_tokens};
use convo_budget::models::Role;
use convo_budget::storage::new_storage;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Command::new();
    if cmd.version() {
        cmd.print_version();
        return Ok(());
    }

    std::panic::set_hook(Box::new(|panic_info| {
        better_panic::Settings::auto().create_panic_handler()(panic_info);
    }));

    let config = cmd.get_config()?;
    Configuration::init(config.clone())?;
    init_logger(&config.log)?;
    verbose!("[+] Logger initialized");

    let Some(action) = cmd.action() else {
        return Command::print_help();
    };

    // estimating needs no storage
    if let Action::Estimate { text } = action {
        return estimate(text.as_deref());
    }

    verbose!("[+] Initializing storage...");
    let storage = new_storage(&config.storage)
        .await
        .wrap_err("initializing storage")?;
    verbose!("[+] Storage initialized");

    let optimizer = Optimizer::with_config(storage, config.budget.clone());
    verbose!(
        "[+] Budget: {} tokens, {} priority messages, {} days retention",
        config.budget.max_conversation_tokens,
        config.budget.priority_message_count,
        config.budget.retention_days
    );

    match action {
        Action::Context {
            conversation_id,
            json,
        } => {
            if *json {
                let prompt = optimizer.prompt_context(conversation_id).await?;
                println!("{}", serde_json::to_string_pretty(&prompt)?);
                return Ok(());
            }
            for msg in optimizer.select_context(conversation_id).await? {
                println!(
                    "[{}] {} ({} tokens): {}",
                    msg.created_at().format("%Y-%m-%d %H:%M:%S"),
                    msg.role(),
                    msg.token_count(),
                    msg.content()
                );
            }
        }

        Action::Status { conversation_id } => {
            let conversations = match conversation_id {
                Some(id) => vec![optimizer.get_conversation(id).await?],
                None => optimizer.conversations().await?,
            };
            let max_tokens = optimizer.config().max_conversation_tokens;
            for conversation in conversations {
                println!(
                    "{}\t{}\t{}/{}{}",
                    conversation.id(),
                    conversation.title(),
                    conversation.token_usage(),
                    max_tokens,
                    if conversation.token_usage() > max_tokens {
                        "\tover budget"
                    } else {
                        ""
                    }
                );
            }
        }

        Action::New { title } => {
            let conversation = optimizer.create_conversation(title.as_deref()).await?;
            println!("{}", conversation.id());
        }

        Action::Append {
            conversation_id,
            role,
            content,
        } => {
            let role = role.parse::<Role>()?;
            let msg = optimizer
                .append_message(conversation_id, role, content.as_str())
                .await?;
            println!("{}\t{} tokens", msg.id(), msg.token_count());
        }

        Action::Compress {
            conversation_id,
            force,
        } => {
            let outcome = if *force {
                optimizer.compress_old_messages(conversation_id).await?
            } else {
                optimizer.compress_if_needed(conversation_id).await?
            };
            match outcome {
                CompressionOutcome::Compressed { summary, removed } => {
                    println!("Compressed {} messages into {}", removed, summary.id())
                }
                CompressionOutcome::Skipped(reason) => println!("Skipped: {:?}", reason),
            }
        }

        Action::CompressAll { force } => {
            let report = compact_all(&optimizer, *force).await?;
            for (id, removed) in &report.compressed {
                println!("{}\tcompressed {} messages", id, removed);
            }
            for (id, err) in &report.failed {
                println!("{}\tfailed: {}", id, err);
            }
            println!(
                "{} conversations: {} compressed, {} skipped, {} failed",
                report.total(),
                report.compressed.len(),
                report.skipped.len(),
                report.failed.len()
            );
            if !report.failed.is_empty() {
                eyre::bail!("{} conversations failed to compress", report.failed.len());
            }
        }

        Action::Watch { interval } => {
            let interval = interval
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| config.compaction.interval());

            let token = CancellationToken::new();
            let ctrl_c = token.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for Ctrl-C: {}", err);
                }
                ctrl_c.cancel();
            });

            verbose!("[+] Compacting every {:?}, press Ctrl-C to stop", interval);
            run_periodic(&optimizer, interval, token).await;
        }

        Action::Recalculate { conversation_id } => {
            let usage = optimizer
                .recalculate_token_usage(conversation_id)
                .await
                .wrap_err(format!("recalculating {}", conversation_id))?;
            println!("{}\t{}", conversation_id, usage);
        }

        Action::Estimate { text } => estimate(text.as_deref())?,
    }

    Ok(())
}

fn estimate(text: Option<&str>) -> Result<()> {
    let text = match text {
        Some(text) => text.to_string(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .wrap_err("reading stdin")?;
            buf
        }
    };
    println!("{}", estimate_tokens(&text));
    Ok(())
}
