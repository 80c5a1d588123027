use crate::config::load_config;
use crate::db::open_db;
use crate::desk::{Desk, UserContext};
use crate::store::Priority;
use crate::TriageError;
use rmcp::{
    ErrorData, ServerHandler, ServiceExt,
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct DesktriageServer {
    desk: Arc<Desk>,
    #[allow(dead_code)]
    tool_router: ToolRouter<Self>,
}

// --- Parameter types ---

#[derive(Deserialize, JsonSchema)]
pub struct CreateTicketParams {
    /// Short summary of the problem.
    pub subject: String,
    /// Full problem description. Classified and sentiment-scored.
    pub description: String,
    /// high, medium or low (default medium).
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Authenticated caller id.
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct DashboardParams {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    /// Filter open tickets and suggest up to 3 similar solutions.
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
pub struct SimilarSolutionsParams {
    /// Free-text problem description.
    pub query: String,
}

// --- Helpers ---

fn internal_err(e: &impl std::fmt::Display) -> ErrorData {
    ErrorData::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None)
}

/// Bad input and model failures go back to the caller as tool errors;
/// anything else is a server error.
fn triage_err(e: TriageError) -> Result<CallToolResult, ErrorData> {
    match e {
        TriageError::Inference(_) | TriageError::DimensionMismatch { .. } => {
            Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
        }
        other => Err(internal_err(&other)),
    }
}

fn json_result(value: &impl serde::Serialize) -> Result<CallToolResult, ErrorData> {
    let json = serde_json::to_string(value).map_err(|e| internal_err(&e))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

// --- Core tool logic (pub for testing) ---

impl DesktriageServer {
    pub async fn do_create_ticket(
        &self,
        params: CreateTicketParams,
    ) -> Result<CallToolResult, ErrorData> {
        let user = UserContext {
            user_id: params.user_id,
            username: params.username,
            email: params.email,
        };
        match self
            .desk
            .create_ticket(
                &user,
                &params.subject,
                &params.description,
                params.priority.unwrap_or(Priority::Medium),
            )
            .await
        {
            Ok(ticket) => json_result(&ticket),
            Err(e) => triage_err(e),
        }
    }

    pub async fn do_dashboard(&self, params: DashboardParams) -> Result<CallToolResult, ErrorData> {
        let user = UserContext {
            user_id: params.user_id,
            username: params.username,
            email: params.email,
        };
        match self.desk.dashboard(&user, params.search.as_deref()).await {
            Ok(dashboard) => json_result(&dashboard),
            Err(e) => triage_err(e),
        }
    }

    pub async fn do_similar_solutions(
        &self,
        params: SimilarSolutionsParams,
    ) -> Result<CallToolResult, ErrorData> {
        match self.desk.retrieve(&params.query).await {
            Ok(found) => json_result(&found),
            Err(e) => triage_err(e),
        }
    }
}

// --- MCP tool wrappers (delegate to do_* methods) ---

#[tool_router]
impl DesktriageServer {
    pub fn new(desk: Arc<Desk>) -> Self {
        Self {
            desk,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Create a support ticket. Classifies the description into a category and scores its sentiment before storing.",
        annotations(read_only_hint = false, open_world_hint = false)
    )]
    async fn create_ticket(
        &self,
        p: Parameters<CreateTicketParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_create_ticket(p.0).await
    }

    #[tool(
        description = "List open tickets, newest first. With a search query, filters tickets and adds up to 3 similar knowledge-base solutions.",
        annotations(read_only_hint = true, open_world_hint = false)
    )]
    async fn dashboard(&self, p: Parameters<DashboardParams>) -> Result<CallToolResult, ErrorData> {
        self.do_dashboard(p.0).await
    }

    #[tool(
        description = "Find up to 3 knowledge-base entries nearest to a problem description.",
        annotations(read_only_hint = true, open_world_hint = false)
    )]
    async fn similar_solutions(
        &self,
        p: Parameters<SimilarSolutionsParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.do_similar_solutions(p.0).await
    }
}

#[tool_handler]
impl ServerHandler for DesktriageServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_instructions("desktriage: support ticket triage and knowledge-base retrieval")
    }
}

pub fn handle_serve(db_path: &Path) -> Result<(), TriageError> {
    let config = load_config()?;
    let conn = open_db(db_path)?;
    let desk = Arc::new(Desk::open(conn, &config)?);
    let server = DesktriageServer::new(desk);

    crate::runtime()?.block_on(async {
        let provider = crate::metrics::init_meter_provider(&config.metrics);

        log::info!("serve starting on {}", db_path.display());
        let service = server
            .serve(stdio())
            .await
            .map_err(|e| TriageError::Config(format!("mcp: {e}")))?;
        service
            .waiting()
            .await
            .map_err(|e| TriageError::Config(format!("mcp: {e}")))?;
        log::info!("serve stopped");

        if let Some(p) = provider {
            let _ = p.shutdown();
        }

        Ok(())
    })
}
