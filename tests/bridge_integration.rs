//! Tool Bridge Integration Tests
//!
//! Remote tools surfaced through the registry with capability checks.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{manager, server, ScriptedServer, Step, StubConnector};
use toolgate::core::{CircuitConfig, RetryConfig};
use toolgate::mcp::{server_capability, CapabilitySet, ErrorClass, Tool, BLANKET_CAPABILITY};
use toolgate::{CallContext, ClientManager};

async fn connected() -> (Arc<ClientManager>, Arc<ScriptedServer>) {
    let connector = StubConnector::new();
    let github = ScriptedServer::new(&["search", "create_issue"]);
    connector.add("github", github.clone());
    connector.add("docs", ScriptedServer::new(&["lookup"]));
    let manager = manager(&connector);
    manager
        .connect(
            server("github")
                .with_retry(RetryConfig::no_retry())
                .with_circuit(CircuitConfig { failure_threshold: 1, ..CircuitConfig::default() }),
        )
        .await
        .unwrap();
    manager.connect(server("docs")).await.unwrap();
    (manager, github)
}

#[tokio::test]
async fn test_tools_are_registered_with_qualified_names() {
    let (manager, _) = connected().await;
    let registry = manager.registry();

    assert_eq!(registry.names(), vec!["docs_lookup", "github_create_issue", "github_search"]);
    assert_eq!(registry.server_tools("github"), vec!["github_create_issue", "github_search"]);

    let tool = registry.get("github_search").unwrap();
    assert_eq!(tool.description(), "The search tool");
    assert_eq!(tool.parameters_schema()["type"], "object");
}

#[tokio::test]
async fn test_definitions_follow_capabilities() {
    let (manager, _) = connected().await;
    let registry = manager.registry();

    let github_only = CapabilitySet::new().with(server_capability("github"));
    let names: Vec<_> = registry
        .definitions_for(&github_only)
        .iter()
        .map(|d| d["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["github_create_issue", "github_search"]);

    let everything: CapabilitySet = [BLANKET_CAPABILITY].into_iter().collect();
    assert_eq!(registry.definitions_for(&everything).len(), 3);

    assert!(registry.definitions_for(&CapabilitySet::new()).is_empty());
}

#[tokio::test]
async fn test_execute_through_registry() {
    let (manager, github) = connected().await;
    let registry = manager.registry();
    let caller = CapabilitySet::new().with("mcp_github");

    let output = registry
        .execute(&caller, &CallContext::background(), "github_search", json!({"query": "tokio"}))
        .await;

    assert!(output.success);
    assert_eq!(output.content, r#"search:{"query":"tokio"}"#);
    assert_eq!(output.attempts, 1);
    assert!(output.error_class.is_none());
    assert_eq!(github.calls(), 1);
}

#[tokio::test]
async fn test_unauthorized_caller_never_reaches_server() {
    let (manager, github) = connected().await;
    let registry = manager.registry();
    let caller = CapabilitySet::new().with("mcp_docs");

    let output = registry.execute(&caller, &CallContext::background(), "github_search", json!({})).await;

    assert!(!output.success);
    assert_eq!(output.error_class, Some(ErrorClass::Authorization));
    assert!(output.error.unwrap().contains("mcp_github"));
    assert_eq!(github.calls(), 0);
}

#[tokio::test]
async fn test_unknown_tool() {
    let (manager, _) = connected().await;
    let caller = CapabilitySet::new().with(BLANKET_CAPABILITY);

    let output = manager.registry().execute(&caller, &CallContext::background(), "github_nope", json!({})).await;

    assert!(!output.success);
    assert_eq!(output.error_class, Some(ErrorClass::Configuration));
}

#[tokio::test]
async fn test_failures_carry_their_class() {
    let (manager, github) = connected().await;
    github.script([Step::ToolError, Step::Timeout]);
    let registry = manager.registry();
    let caller = CapabilitySet::new().with(BLANKET_CAPABILITY);
    let ctx = CallContext::background();

    // A tool-level error is a result, not a client failure.
    let output = registry.execute(&caller, &ctx, "github_search", json!({})).await;
    assert!(!output.success);
    assert_eq!(output.error.as_deref(), Some("tool blew up"));
    assert!(output.error_class.is_none());

    let output = registry.execute(&caller, &ctx, "github_search", json!({})).await;
    assert_eq!(output.error_class, Some(ErrorClass::Transient));

    // Threshold of one: the breaker is now open.
    let output = registry.execute(&caller, &ctx, "github_search", json!({})).await;
    assert_eq!(output.error_class, Some(ErrorClass::BreakerOpen));
    assert_eq!(github.calls(), 2);
}

#[tokio::test]
async fn test_disconnect_unregisters_bridged_tools() {
    let (manager, _) = connected().await;
    let registry = manager.registry();
    let stale = registry.get("github_search").unwrap();

    manager.disconnect("github").await.unwrap();
    assert_eq!(registry.names(), vec!["docs_lookup"]);

    // A handle taken before the disconnect fails cleanly.
    let output = stale.execute(&CallContext::background(), json!({})).await;
    assert_eq!(output.error_class, Some(ErrorClass::Configuration));
}

#[tokio::test]
async fn test_output_serializes() {
    let (manager, _) = connected().await;
    let caller = CapabilitySet::new().with(BLANKET_CAPABILITY);
    let output = manager
        .registry()
        .execute(&caller, &CallContext::background(), "docs_lookup", json!({"q": "x"}))
        .await;

    let value = serde_json::to_value(&output).unwrap();
    assert_eq!(value["success"], true);
    assert!(value.get("error").is_none());
}
