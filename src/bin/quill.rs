use anyhow::Result;
use crossterm::style::Stylize;
use quill::api::logging::init_logging;
use quill::api::ApiClient;
use quill::config::Config;
use quill::state::{ChatEngine, EngineSettings, EngineSnapshot, EngineUpdate, Message, TurnOutcome};
use quill::types::{ContextId, ContextKind, Role};
use quill::util::truncate_to_width;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

const TITLE_WIDTH: usize = 48;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    New(ContextKind),
    List(ContextKind),
    Open(ContextKind, ContextId),
    Older,
    Rename(String),
    Delete,
    Quit,
    Say(String),
}

fn parse_kind(arg: Option<&str>) -> Result<ContextKind, String> {
    match arg {
        None => Ok(ContextKind::Conversation),
        Some(raw) => ContextKind::parse(raw).ok_or_else(|| format!("unknown kind '{raw}'")),
    }
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Say(line.to_string())));
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let rest = parts.next().map(str::trim).filter(|rest| !rest.is_empty());
    let command = match name {
        "/help" | "/commands" => Command::Help,
        "/new" => Command::New(parse_kind(rest)?),
        "/list" => Command::List(parse_kind(rest)?),
        "/open" => {
            let mut args = rest.unwrap_or_default().split_whitespace();
            match (args.next(), args.next()) {
                (Some(kind), Some(id)) => Command::Open(parse_kind(Some(kind))?, ContextId::new(id)),
                (Some(id), None) => Command::Open(ContextKind::Conversation, ContextId::new(id)),
                _ => return Err("usage: /open [conversation|work] <id>".to_string()),
            }
        }
        "/older" => Command::Older,
        "/rename" => match rest {
            Some(title) => Command::Rename(title.to_string()),
            None => return Err("usage: /rename <title>".to_string()),
        },
        "/delete" => Command::Delete,
        "/q" | "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("unknown command {other}; try /help")),
    };
    Ok(Some(command))
}

fn print_help() {
    println!("* Commands");
    println!("  └ /new [work], /list [work], /open [work] <id>, /older");
    println!("    /rename <title>, /delete, /quit");
}

fn print_message(message: &Message) {
    match message.role {
        Role::User => println!("{} {}", ">".cyan(), message.content),
        Role::Assistant => println!("{}", message.content),
    }
}

fn print_header(context: Option<(&str, &str)>, kind: ContextKind) {
    match context {
        Some((id, title)) => {
            let title = if title.is_empty() { kind.default_title() } else { title };
            println!(
                "{} {} {}",
                "*".dark_grey(),
                truncate_to_width(title, TITLE_WIDTH).bold(),
                format!("({} {id})", kind.label()).dark_grey()
            );
        }
        None => println!("{} new {}", "*".dark_grey(), kind.label()),
    }
}

fn print_window(snapshot: &EngineSnapshot, messages: &[Message]) {
    for message in messages {
        print_message(message);
    }
    if snapshot.has_more {
        println!("{}", "  └ older messages available: /older".dark_grey());
    }
}

async fn print_updates<B: quill::Backend>(
    engine: ChatEngine<B>,
    mut updates: UnboundedReceiver<EngineUpdate>,
) {
    let mut stdout = std::io::stdout();
    while let Some(update) = updates.recv().await {
        match update {
            EngineUpdate::LogReset { context } => {
                let kind = engine.snapshot().kind;
                print_header(
                    context.as_ref().map(|r| (r.id.as_str(), r.title.as_str())),
                    kind,
                );
            }
            EngineUpdate::MessageAppended { .. } => {}
            EngineUpdate::ContentGrew { appended, .. } => {
                print!("{appended}");
                let _ = stdout.flush();
            }
            EngineUpdate::Finalized { .. } => println!(),
            EngineUpdate::TurnFailed { notice, .. } => {
                println!();
                println!("{}", notice.red());
            }
            EngineUpdate::HistoryPrepended { count, .. } => {
                let snapshot = engine.snapshot();
                let end = count.min(snapshot.messages.len());
                print_window(&snapshot, &snapshot.messages[..end]);
            }
            EngineUpdate::HistoryReplaced { .. } => {
                let snapshot = engine.snapshot();
                println!("{}", "* refreshed".dark_grey());
                print_window(&snapshot, &snapshot.messages);
            }
            EngineUpdate::ContextCreated(record) => {
                println!(
                    "{}",
                    format!("* created {} {}", record.kind.label(), record.id).dark_grey()
                );
            }
            EngineUpdate::TitleChanged { context, title } => {
                println!(
                    "{}",
                    format!("* {context} is now \"{}\"", truncate_to_width(&title, TITLE_WIDTH))
                        .dark_grey()
                );
            }
        }
    }
}

async fn run_command<B: quill::Backend>(engine: &ChatEngine<B>, command: Command) -> Result<bool> {
    match command {
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
        Command::Say(text) => {
            let engine = engine.clone();
            tokio::spawn(async move {
                match engine.send_message(&text).await {
                    Ok(TurnOutcome::Completed { .. }) | Ok(TurnOutcome::Failed { .. }) => {}
                    Ok(TurnOutcome::Detached) => {
                        tracing::debug!("reply detached; it will appear when reopened");
                    }
                    Err(error) => eprintln!("{}", format!("[error] {error:#}").red()),
                }
            });
        }
        Command::New(kind) => engine.new_context(kind).await,
        Command::List(kind) => {
            let records = engine.list_contexts(kind).await?;
            println!("* {} list", kind.label());
            if records.is_empty() {
                println!("  └ none yet");
            }
            for record in records {
                let title = if record.title.is_empty() {
                    kind.default_title()
                } else {
                    record.title.as_str()
                };
                println!("  {}  {}", record.id, truncate_to_width(title, TITLE_WIDTH));
            }
        }
        Command::Open(kind, id) => {
            let records = engine.list_contexts(kind).await?;
            match records.into_iter().find(|record| record.id == id) {
                Some(record) => engine.switch_to(record).await?,
                None => println!("  └ no {} with id {id}", kind.label()),
            }
        }
        Command::Older => {
            let added = engine.load_older().await?;
            if added == 0 {
                println!("{}", "  └ at the beginning".dark_grey());
            }
        }
        Command::Rename(title) => match engine.active_context() {
            Some(record) => engine.rename_context(record.kind, &record.id, &title).await?,
            None => println!("  └ nothing to rename yet"),
        },
        Command::Delete => match engine.active_context() {
            Some(record) => engine.delete_context(record.kind, &record.id).await?,
            None => println!("  └ nothing to delete"),
        },
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    init_logging()?;

    let settings = EngineSettings::from_config(&config)?;
    let engine = ChatEngine::new(ApiClient::new(&config)?, settings);
    let printer = tokio::spawn(print_updates(engine.clone(), engine.subscribe()));
    tracing::info!(api = %config.api_url, user = %config.user_id, "quill started");

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("  └ {message}");
                continue;
            }
        };
        match run_command(&engine, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(error) => eprintln!("{}", format!("[error] {error:#}").red()),
        }
    }

    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(
            parse_command("  hello there "),
            Ok(Some(Command::Say("hello there".to_string())))
        );
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn test_parse_context_commands() {
        assert_eq!(
            parse_command("/new work"),
            Ok(Some(Command::New(ContextKind::Work)))
        );
        assert_eq!(
            parse_command("/list"),
            Ok(Some(Command::List(ContextKind::Conversation)))
        );
        assert_eq!(
            parse_command("/open work w-12"),
            Ok(Some(Command::Open(ContextKind::Work, ContextId::new("w-12"))))
        );
        assert_eq!(
            parse_command("/rename  Trip plans"),
            Ok(Some(Command::Rename("Trip plans".to_string())))
        );
        assert!(parse_command("/rename").is_err());
        assert!(parse_command("/open").is_err());
        assert!(parse_command("/bogus").is_err());
    }
}
