use desktriage::config::TriageConfig;
use desktriage::db::open_memory_db;
use desktriage::desk::Desk;
use desktriage::embed::HashingEncoder;
use desktriage::kb::{NewKbEntry, add_entry};
use desktriage::serve::{
    CreateTicketParams, DashboardParams, DesktriageServer, SimilarSolutionsParams,
};
use desktriage::store::Priority;
use std::sync::Arc;

const KB: &[(&str, &str, &[i64])] = &[
    ("Reset your password", "Use the forgot password link on the login page", &[3]),
    ("Login keeps failing", "Clear cookies if login is broken after an update", &[1, 3]),
    ("Refund policy", "Refunds for a double charge are issued within five days", &[2]),
    ("Server error 500", "Restart the api server and check the error log", &[1]),
    ("Update billing card", "Change the payment card under billing settings", &[2]),
];

fn make_server_with(config: TriageConfig) -> DesktriageServer {
    let conn = open_memory_db().unwrap();
    desktriage::store::ensure_categories(
        &conn,
        &["technical".into(), "billing".into(), "account".into()],
    )
    .unwrap();
    let encoder = HashingEncoder::load(None, None).unwrap();
    for (title, content, categories) in KB {
        add_entry(
            &conn,
            &encoder,
            &NewKbEntry {
                title: title.to_string(),
                content: content.to_string(),
                categories: categories.to_vec(),
            },
        )
        .unwrap();
    }
    let desk = Desk::open(conn, &config).unwrap();
    DesktriageServer::new(Arc::new(desk))
}

fn make_server() -> DesktriageServer {
    make_server_with(TriageConfig::default())
}

/// Extract result text from a CallToolResult
fn result_text(result: &rmcp::model::CallToolResult) -> String {
    result
        .content
        .first()
        .map(|c| c.as_text().unwrap().text.clone())
        .unwrap_or_default()
}

fn result_json(result: &rmcp::model::CallToolResult) -> serde_json::Value {
    serde_json::from_str(&result_text(result)).unwrap()
}

fn ticket(description: &str) -> CreateTicketParams {
    CreateTicketParams {
        subject: "Help".into(),
        description: description.into(),
        priority: Some(Priority::High),
        user_id: 7,
        username: "ana".into(),
        email: "ana@example.com".into(),
    }
}

fn dashboard(search: Option<&str>) -> DashboardParams {
    DashboardParams {
        user_id: 7,
        username: "ana".into(),
        email: "ana@example.com".into(),
        search: search.map(String::from),
    }
}

// --- create_ticket ---

#[tokio::test]
async fn create_ticket_returns_triaged_ticket() {
    let server = make_server();
    let result = server
        .do_create_ticket(ticket("My login is broken"))
        .await
        .unwrap();
    assert!(!result.is_error.unwrap_or(false));

    let json = result_json(&result);
    let category = json["category_id"].as_i64().unwrap();
    assert!((1..=3).contains(&category));
    let sentiment = json["sentiment_score"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&sentiment));
    assert_eq!(json["status"], "open");
    assert_eq!(json["priority"], "high");
}

#[tokio::test]
async fn create_ticket_categories_follow_content() {
    let server = make_server();
    let cases = [
        ("The server shows an error and the app crashes", 1),
        ("I was charged twice, please refund my invoice", 2),
        ("I need a password reset, my account is locked", 3),
    ];
    for (description, expected) in cases {
        let result = server.do_create_ticket(ticket(description)).await.unwrap();
        assert_eq!(result_json(&result)["category_id"], expected, "{description}");
    }
}

#[tokio::test]
async fn create_ticket_empty_description_is_tool_error() {
    let server = make_server();
    let result = server.do_create_ticket(ticket("   ")).await.unwrap();
    assert!(result.is_error.unwrap_or(false));
    assert!(result_text(&result).contains("empty input"));

    let listed = server.do_dashboard(dashboard(None)).await.unwrap();
    assert!(result_json(&listed)["tickets"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn long_description_is_accepted() {
    let server = make_server();
    let long = "the login page is broken again ".repeat(400);
    let result = server.do_create_ticket(ticket(&long)).await.unwrap();
    assert!(!result.is_error.unwrap_or(false));
}

// --- dashboard ---

#[tokio::test]
async fn dashboard_sees_ticket_after_cached_listing() {
    let server = make_server();
    let before = server.do_dashboard(dashboard(None)).await.unwrap();
    assert!(result_json(&before)["tickets"].as_array().unwrap().is_empty());

    server
        .do_create_ticket(ticket("My login is broken"))
        .await
        .unwrap();

    let after = server.do_dashboard(dashboard(None)).await.unwrap();
    let json = result_json(&after);
    assert_eq!(json["tickets"].as_array().unwrap().len(), 1);
    assert!(json["similar_solutions"].as_array().unwrap().is_empty());
    assert!(json["search_query"].is_null());
}

#[tokio::test]
async fn dashboard_search_adds_solutions() {
    let server = make_server();
    server
        .do_create_ticket(ticket("My login is broken"))
        .await
        .unwrap();
    server
        .do_create_ticket(ticket("Refund my invoice"))
        .await
        .unwrap();

    let result = server
        .do_dashboard(dashboard(Some("broken login")))
        .await
        .unwrap();
    let json = result_json(&result);
    assert_eq!(json["tickets"].as_array().unwrap().len(), 1);
    let solutions = json["similar_solutions"].as_array().unwrap();
    assert!(!solutions.is_empty() && solutions.len() <= 3);
}

// --- similar_solutions ---

fn distances(result: &rmcp::model::CallToolResult) -> Vec<f64> {
    result_json(result)
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["distance"].as_f64().unwrap())
        .collect()
}

#[tokio::test]
async fn similar_solutions_ranked_by_distance() {
    let server = make_server();
    let result = server
        .do_similar_solutions(SimilarSolutionsParams {
            query: "broken login".into(),
        })
        .await
        .unwrap();
    let d = distances(&result);
    assert_eq!(d.len(), 3);
    assert!(d.windows(2).all(|w| w[0] <= w[1]));

    let first = &result_json(&result)[0];
    assert_eq!(first["title"], "Login keeps failing");
    let similarity = first["similarity"].as_f64().unwrap();
    assert!((similarity - 1.0 / (1.0 + d[0])).abs() < 1e-9);
}

#[tokio::test]
async fn similar_solutions_deterministic_across_indexes() {
    let memory = make_server();
    let mut config = TriageConfig::default();
    config.retrieval.index = "sqlite".into();
    let sqlite = make_server_with(config);

    let query = || SimilarSolutionsParams {
        query: "refund for a double charge".into(),
    };
    let a = result_json(&memory.do_similar_solutions(query()).await.unwrap());
    let b = result_json(&memory.do_similar_solutions(query()).await.unwrap());
    let c = result_json(&sqlite.do_similar_solutions(query()).await.unwrap());
    assert_eq!(a, b);

    let ids = |v: &serde_json::Value| -> Vec<i64> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_i64().unwrap())
            .collect()
    };
    assert_eq!(ids(&a), ids(&c));
}

#[tokio::test]
async fn similar_solutions_empty_query_is_tool_error() {
    let server = make_server();
    let result = server
        .do_similar_solutions(SimilarSolutionsParams { query: "".into() })
        .await
        .unwrap();
    assert!(result.is_error.unwrap_or(false));
}
