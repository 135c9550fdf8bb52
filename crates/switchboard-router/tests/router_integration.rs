#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::sync::Arc;
use switchboard_core::{RouterConfig, RuleConfig, SwitchboardResult, Task, TenantId};
use switchboard_llm::{Completion, CompletionRequest, CompletionService};
use switchboard_registry::{AgentRegistration, AgentRegistry};
use switchboard_router::{HybridRouter, RoutingMethod, RoutingRule};

struct Catalog;

#[async_trait]
impl CompletionService for Catalog {
    async fn complete(&self, request: CompletionRequest) -> SwitchboardResult<Completion> {
        let prompt = &request.messages[1].content;
        let worker = if prompt.contains("Request: research") {
            "analyst"
        } else {
            "generalist"
        };
        Ok(Completion {
            text: format!("```json\n{{\"worker_id\": \"{worker}\", \"reasoning\": \"catalog match\"}}\n```"),
            model: "fast-test".into(),
        })
    }
}

fn registry() -> Arc<AgentRegistry> {
    let registry = AgentRegistry::new();
    registry
        .register(
            AgentRegistration::new("analyst", "Analyst", "Researches accounts and competitors")
                .with_capabilities(&["research"]),
        )
        .unwrap();
    registry
        .register(AgentRegistration::new("mailer", "Mailer", "Sends email"))
        .unwrap();
    registry
        .register(AgentRegistration::new("crm", "CRM", "Updates deal records"))
        .unwrap();
    Arc::new(registry)
}

fn config() -> RouterConfig {
    RouterConfig {
        rules: vec![
            RuleConfig {
                name: Some("email".into()),
                task_type: Some("email".into()),
                param: None,
                equals: None,
                worker_id: "mailer".into(),
            },
            RuleConfig {
                name: None,
                task_type: None,
                param: Some("system".into()),
                equals: Some(serde_json::json!("hubspot")),
                worker_id: "crm".into(),
            },
        ],
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn test_decomposed_subtasks_route_by_rule_and_model() {
    let router = HybridRouter::new(registry(), Some(Arc::new(Catalog)), &config()).unwrap();
    let tenant = TenantId::new("acme").unwrap();
    let task = Task::new(tenant, "request")
        .with_instruction("research the Globex account and then email Dana the findings")
        .with_param("deal", serde_json::json!("D-42"));

    let plan = router.decompose(&task).await.unwrap().unwrap();
    assert_eq!(plan.waves(), &[vec![0], vec![1]]);

    let research = &plan.subtasks()[0].task;
    let email = &plan.subtasks()[1].task;
    assert_eq!(email.task_type, "email");
    assert_eq!(email.param_str("deal"), Some("D-42"));

    let d = router.route(email).await.unwrap();
    assert_eq!((d.worker_id.as_str(), d.method), ("mailer", RoutingMethod::Rule));

    let d = router.route(research).await.unwrap();
    assert_eq!((d.worker_id.as_str(), d.method), ("analyst", RoutingMethod::Model));
}

#[tokio::test]
async fn test_param_rule_and_status_email_stays_whole() {
    let router = HybridRouter::new(registry(), None, &config())
        .unwrap()
        .with_rule(RoutingRule::new("status", "mailer", |t: &Task| {
            t.instruction.contains("status")
        }));
    let tenant = TenantId::new("acme").unwrap();

    let sync = Task::new(tenant.clone(), "sync").with_param("system", serde_json::json!("hubspot"));
    assert_eq!(router.route(&sync).await.unwrap().worker_id, "crm");

    let status = Task::new(tenant, "notify").with_instruction("send a status email");
    assert!(router.decompose(&status).await.unwrap().is_none());
    assert_eq!(router.route(&status).await.unwrap().worker_id, "mailer");
}
