//! Deployment pipeline against the scripted engine

mod common;

use axum::{http::StatusCode, routing::post, Json, Router};
use common::{deployer, fast_config, MockEngine, StartMode};
use dockployment::history::DeploymentHistory;
use dockployment::models::{DeployRule, DeploymentStatus, ErrorCode, ImageRef, Trigger};
use dockployment::{DeployRequest, Deployer, WebhookNotifier};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

fn request(repo: &str, tag: &str, id: &str) -> DeployRequest {
    DeployRequest {
        image: ImageRef::new(repo, tag),
        image_id: id.to_string(),
        trigger: Trigger::Event,
    }
}

#[tokio::test]
async fn test_first_deploy_starts_container() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v1", "sha256:v1", 100);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v1", "sha256:v1")).await;

    assert_eq!(record.status, DeploymentStatus::Succeeded, "{:?}", record.reason);
    assert_eq!(record.attempts, 1);
    assert!(record.previous_image.is_none());
    assert!(record.finished_at.is_some());
    let web = engine.container("web").unwrap();
    assert!(web.running);
    assert_eq!(web.image_id, "sha256:v1");
    assert_eq!(deployer.history().len(), 1);
}

#[tokio::test]
async fn test_replaces_running_container() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    let mut rule = DeployRule::new("web", "myapp");
    rule.run.ports = vec!["8080:80".to_string()];
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::Succeeded, "{:?}", record.reason);
    assert_eq!(record.previous_image.as_deref(), Some("myapp:v1"));
    assert_eq!(engine.container("web").unwrap().image_id, "sha256:v2");
    assert!(engine.container("web-dockployment-previous").is_none(), "backup must be cleaned up");

    let runs = engine.with(|s| s.runs.clone());
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].ports, vec!["8080:80".to_string()]);
    assert_eq!(runs[0].rule, "web");
}

#[tokio::test]
async fn test_same_image_is_skipped() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v1", "sha256:v1", 100);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v1", "sha256:v1")).await;

    assert_eq!(record.status, DeploymentStatus::Skipped);
    assert_eq!(engine.run_count(), 0);
    assert_eq!(engine.container("web").unwrap().id, "old-web");
}

#[tokio::test]
async fn test_semver_rule_skips_downgrade() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v1.2.0", "sha256:old", 100);
    engine.add_running("web", "myapp:v1.10.0", "sha256:current");
    let mut rule = DeployRule::new("web", "myapp");
    rule.semver_only = true;
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v1.2.0", "sha256:old")).await;

    assert_eq!(record.status, DeploymentStatus::Skipped);
    assert!(record.reason.unwrap().contains("not newer"));
    assert_eq!(engine.run_count(), 0);
}

#[tokio::test]
async fn test_unhealthy_container_rolls_back() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    engine.with(|s| s.start_mode = StartMode::Unhealthy);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert!(record.reason.unwrap().contains("DEPLOY_UNHEALTHY"));
    let web = engine.container("web").unwrap();
    assert_eq!(web.image_id, "sha256:v1");
    assert!(web.running);
    assert!(engine.container("web-dockployment-previous").is_none());
}

#[tokio::test]
async fn test_run_failure_rolls_back_without_retry() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    engine.with(|s| s.run_always_fails = true);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::RolledBack);
    // Start failures are not retryable
    assert_eq!(record.attempts, 1);
    assert_eq!(engine.container("web").unwrap().image_id, "sha256:v1");
}

#[tokio::test]
async fn test_transient_run_failures_are_retried() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v1", "sha256:v1", 100);
    engine.with(|s| s.transient_run_failures = 2);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v1", "sha256:v1")).await;

    assert_eq!(record.status, DeploymentStatus::Succeeded, "{:?}", record.reason);
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn test_exit_without_previous_is_failure() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v1", "sha256:v1", 100);
    engine.with(|s| s.start_mode = StartMode::Exits);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v1", "sha256:v1")).await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.reason.unwrap().contains("exited"));
    assert!(engine.container("web").is_none(), "failed container must be removed");
    assert_eq!(deployer.history().summary().failed, 1);
}

#[tokio::test]
async fn test_container_without_healthcheck_passes_after_grace() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v1", "sha256:v1", 100);
    engine.with(|s| s.start_mode = StartMode::NoHealthcheck);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v1", "sha256:v1")).await;
    assert_eq!(record.status, DeploymentStatus::Succeeded, "{:?}", record.reason);
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    let rule = DeployRule::new("web", "myapp");
    let mut config = fast_config(vec![rule.clone()]);
    config.dry_run = true;
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::DryRun);
    assert!(record.reason.unwrap().starts_with("would run: docker run -d --name web"));
    assert_eq!(engine.run_count(), 0);
    assert_eq!(engine.container("web").unwrap().image_id, "sha256:v1");
}

#[tokio::test]
async fn test_manual_request_resolution() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v3", "sha256:v3", 300);
    engine.add_image("myapp", "stable", "sha256:stable", 300);
    let wildcard = DeployRule::new("web", "myapp");
    let mut literal = DeployRule::new("pinned", "myapp");
    literal.tag_pattern = "stable".to_string();
    let config = fast_config(vec![wildcard.clone(), literal.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let err = deployer.manual_request(&wildcard, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ApiBadRequest);

    let req = deployer.manual_request(&wildcard, Some("v3")).await.unwrap();
    assert_eq!(req.image_id, "sha256:v3");
    assert_eq!(req.trigger, Trigger::Manual);

    let req = deployer.manual_request(&literal, None).await.unwrap();
    assert_eq!(req.image.tag, "stable");

    let err = deployer.manual_request(&wildcard, Some("v9")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DeployImageNotFound);
}

#[tokio::test]
async fn test_failed_stop_brings_current_container_back() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    engine.with(|s| s.stop_fails = true);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    let reason = record.reason.unwrap();
    assert!(reason.contains("could not park"), "{}", reason);
    assert!(reason.contains("DOCKER_TIMEOUT"), "{}", reason);
    assert_eq!(engine.run_count(), 0);
    let web = engine.container("web").unwrap();
    assert_eq!(web.image_id, "sha256:v1");
    assert!(web.running, "service must not be left stopped");
    assert!(engine.container("web-dockployment-previous").is_none());
}

#[tokio::test]
async fn test_failed_rollback_reports_both_reasons() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    engine.with(|s| {
        s.start_mode = StartMode::Unhealthy;
        s.start_fails = true;
    });
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    let reason = record.reason.unwrap();
    assert!(reason.contains("DEPLOY_UNHEALTHY"), "{}", reason);
    assert!(reason.contains("DEPLOY_ROLLBACK_FAILED"), "{}", reason);
    // Renamed back, but not running
    let web = engine.container("web").unwrap();
    assert_eq!(web.image_id, "sha256:v1");
    assert!(!web.running);
}

#[tokio::test]
async fn test_stale_backup_is_removed_before_parking() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    engine.add_running("web-dockployment-previous", "myapp:v0", "sha256:v0");
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::Succeeded, "{:?}", record.reason);
    assert_eq!(record.previous_image.as_deref(), Some("myapp:v1"));
    assert_eq!(engine.container("web").unwrap().image_id, "sha256:v2");
    assert!(engine.container("web-dockployment-previous").is_none());
}

#[tokio::test]
async fn test_health_timeout_rolls_back() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    engine.with(|s| s.start_mode = StartMode::Starting);
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;

    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert!(record.reason.unwrap().contains("DEPLOY_HEALTH_TIMEOUT"));
    let web = engine.container("web").unwrap();
    assert_eq!(web.image_id, "sha256:v1");
    assert!(web.running);
}

#[tokio::test]
async fn test_deployments_of_one_rule_run_one_at_a_time() {
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_image("myapp", "v3", "sha256:v3", 300);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    engine.with(|s| s.stop_delay = Duration::from_millis(50));
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let deployer = deployer(engine.clone(), &config);

    let (first, second) = tokio::join!(
        deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")),
        deployer.deploy(&rule, request("myapp", "v3", "sha256:v3")),
    );

    assert_eq!(first.status, DeploymentStatus::Succeeded, "{:?}", first.reason);
    assert_eq!(second.status, DeploymentStatus::Succeeded, "{:?}", second.reason);
    assert_eq!(second.previous_image.as_deref(), Some("myapp:v2"));
    assert_eq!(engine.with(|s| s.max_stopping), 1);
    assert_eq!(engine.container("web").unwrap().image_id, "sha256:v3");
}

#[tokio::test]
async fn test_concurrent_deployments_are_bounded() {
    let engine = MockEngine::new();
    let rules: Vec<DeployRule> = (1..=3)
        .map(|i| {
            let repo = format!("app{}", i);
            engine.add_image(&repo, "v2", &format!("sha256:{}-v2", repo), 200);
            engine.add_running(&format!("web{}", i), &format!("{}:v1", repo), "sha256:v1");
            DeployRule::new(&format!("web{}", i), &repo)
        })
        .collect();
    engine.with(|s| s.stop_delay = Duration::from_millis(50));
    let mut config = fast_config(rules.clone());
    config.max_concurrent_deploys = 2;
    let deployer = deployer(engine.clone(), &config);

    let requests: Vec<DeployRequest> = (1..=3)
        .map(|i| request(&format!("app{}", i), "v2", &format!("sha256:app{}-v2", i)))
        .collect();
    let (a, b, c) = tokio::join!(
        deployer.deploy(&rules[0], requests[0].clone()),
        deployer.deploy(&rules[1], requests[1].clone()),
        deployer.deploy(&rules[2], requests[2].clone()),
    );

    for record in [a, b, c] {
        assert_eq!(record.status, DeploymentStatus::Succeeded, "{:?}", record.reason);
    }
    assert_eq!(engine.with(|s| s.max_stopping), 2);
}

/// Local HTTP endpoint collecting webhook bodies
async fn webhook_sink() -> (String, Arc<Mutex<Vec<Value>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let app = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(body);
                StatusCode::NO_CONTENT
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{}/hook", addr), received)
}

#[tokio::test]
async fn test_outcomes_are_sent_to_webhook() {
    let (url, received) = webhook_sink().await;
    let engine = MockEngine::new();
    engine.add_image("myapp", "v2", "sha256:v2", 200);
    engine.add_running("web", "myapp:v1", "sha256:v1");
    let rule = DeployRule::new("web", "myapp");
    let config = fast_config(vec![rule.clone()]);
    let history = Arc::new(DeploymentHistory::new(config.history_capacity));
    let deployer = Deployer::new(engine.clone(), history, &config)
        .with_notifier(Arc::new(WebhookNotifier::new(url, Duration::from_secs(5))));

    let record = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;
    assert_eq!(record.status, DeploymentStatus::Succeeded, "{:?}", record.reason);
    // Skips are not sent
    let skipped = deployer.deploy(&rule, request("myapp", "v2", "sha256:v2")).await;
    assert_eq!(skipped.status, DeploymentStatus::Skipped);

    let bodies = received.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["id"], record.id.as_str());
    assert_eq!(bodies[0]["rule"], "web");
    assert_eq!(bodies[0]["status"], "succeeded");
    assert_eq!(bodies[0]["previous_image"], "myapp:v1");
}
