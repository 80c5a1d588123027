use crate::store::Priority;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "desktriage",
    version,
    about = "Support-desk ticket triage and knowledge-base retrieval"
)]
pub struct Cli {
    /// Database path
    #[arg(long, env = "DESKTRIAGE_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a ticket: classify, score sentiment and store it
    Ticket(TicketArgs),
    /// List open tickets, optionally searching and suggesting solutions
    Dashboard(DashboardArgs),
    /// Find knowledge-base entries similar to a query
    Similar(SimilarArgs),
    /// Manage knowledge-base entries
    Kb {
        #[command(subcommand)]
        command: KbCommand,
    },
    /// Show database counts and loaded models
    Status,
    /// Start MCP server on stdio
    Serve,
}

/// The authenticated caller, passed in by the front end.
#[derive(Args, Clone)]
pub struct UserArgs {
    #[arg(long)]
    pub user_id: i64,
    #[arg(long)]
    pub username: String,
    #[arg(long)]
    pub email: String,
}

impl UserArgs {
    pub fn context(&self) -> crate::desk::UserContext {
        crate::desk::UserContext {
            user_id: self.user_id,
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Args)]
pub struct TicketArgs {
    #[arg(long)]
    pub subject: String,

    #[arg(long)]
    pub description: String,

    #[arg(long, value_enum, default_value = "medium")]
    pub priority: Priority,

    #[command(flatten)]
    pub user: UserArgs,
}

#[derive(Args)]
pub struct DashboardArgs {
    /// Filter tickets and suggest similar solutions
    #[arg(long)]
    pub search: Option<String>,

    #[command(flatten)]
    pub user: UserArgs,
}

#[derive(Args)]
pub struct SimilarArgs {
    /// Free-text problem description
    pub query: String,
}

#[derive(Subcommand)]
pub enum KbCommand {
    /// Add one entry, embedding its title and content
    Add(KbAddArgs),
    /// Import entries from a JSON array of {title, content, categories}
    Import {
        file: PathBuf,
    },
    /// List stored entries
    List,
}

#[derive(Args)]
pub struct KbAddArgs {
    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub content: String,

    /// Category id (repeatable)
    #[arg(long = "category")]
    pub categories: Vec<i64>,
}
