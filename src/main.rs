use clap::Parser;
use desktriage::TriageError;
use desktriage::cli::{Cli, Command, KbCommand};
use desktriage::{desk, kb, serve, status};
use std::path::PathBuf;
use std::process::ExitCode;

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".desktriage").join("desk.db")
}

fn run() -> Result<(), TriageError> {
    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Command::Ticket(args) => desk::handle_ticket(
            &db_path,
            &args.user.context(),
            &args.subject,
            &args.description,
            args.priority,
        ),
        Command::Dashboard(args) => {
            desk::handle_dashboard(&db_path, &args.user.context(), args.search.as_deref())
        }
        Command::Similar(args) => desk::handle_similar(&db_path, &args.query),
        Command::Kb { command } => match command {
            KbCommand::Add(args) => {
                kb::handle_kb_add(&db_path, &args.title, &args.content, &args.categories)
            }
            KbCommand::Import { file } => kb::handle_kb_import(&db_path, &file),
            KbCommand::List => kb::handle_kb_list(&db_path),
        },
        Command::Status => status::handle_status(&db_path),
        Command::Serve => serve::handle_serve(&db_path),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("desktriage: {e}");
            ExitCode::from(1)
        }
    }
}
