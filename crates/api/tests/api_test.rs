#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use coordinator_api::{create_app, AppState};
    use chrono::Utc;
    use coordinator_core::{ApiConfig, AppConfig, Message, MessageBus, TaskCompleteMessage};
    use coordinator_dispatcher::{EscalationChannel, TaskDispatcher};
    use coordinator_infrastructure::{InMemoryMessageBus, MemoryEscalationSink};

    fn test_app() -> (Router, Arc<TaskDispatcher>) {
        let config = AppConfig::default();
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
        let escalation = Arc::new(EscalationChannel::new(
            Arc::new(MemoryEscalationSink::new()),
            Some(bus.clone()),
            config.escalation.clone(),
            "dispatcher",
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(&config, bus.clone(), escalation));
        let state = AppState {
            dispatcher: dispatcher.clone(),
            bus,
            metrics_handle: None,
        };
        (create_app(state, &ApiConfig::default()), dispatcher)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_task_lifecycle_over_http() {
        let (app, dispatcher) = test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/api/workers",
            Some(json!({"worker_id": "w-1", "capabilities": ["build"], "max_concurrency": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["worker_id"], "w-1");

        let (status, _) = send(
            &app,
            "POST",
            "/api/workers/w-1/heartbeat",
            Some(json!({"status": "IDLE", "current_load": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({"description": {"cmd": "make"}, "required_capabilities": ["build"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

        dispatcher.dispatch_tick().await;

        let (status, body) = send(&app, "GET", "/api/workers/w-1/messages?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        let messages = body["data"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["message_type"]["type"], "TaskAssignment");
        let message_id = messages[0]["id"].as_str().unwrap().to_string();

        let (_, body) = send(&app, "GET", &format!("/api/messages/{message_id}"), None).await;
        assert_eq!(body["data"]["state"], "in_flight");
        assert_eq!(body["data"]["recipient"], "w-1");
        assert_eq!(body["data"]["message_type"], "task_assignment");

        let (status, _) = send(&app, "POST", &format!("/api/messages/{message_id}/ack"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, "GET", &format!("/api/messages/{message_id}"), None).await;
        assert_eq!(body["data"]["state"], "acknowledged");

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/tasks/{task_id}/progress"),
            Some(json!({"worker_id": "w-1", "note": "compiling"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "RUNNING");

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/tasks/{task_id}/complete"),
            Some(json!({"worker_id": "w-1", "result": {"ok": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "COMPLETED");

        let (status, body) = send(&app, "GET", "/api/tasks?state=completed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "POST", &format!("/api/tasks/{task_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "ALREADY_TERMINAL");
    }

    #[tokio::test]
    async fn test_unknown_task_returns_not_found() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "GET", "/api/tasks/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "UNKNOWN_TASK");
    }

    #[tokio::test]
    async fn test_cyclic_subtasks_return_bad_request() {
        let (app, _) = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({
                "description": {"goal": "release"},
                "subtasks": [
                    {"key": "a", "description": "compile", "required_capabilities": ["build"], "depends_on": ["b"]},
                    {"key": "b", "description": "package", "required_capabilities": ["build"], "depends_on": ["a"]}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_DEPENDENCY_GRAPH");
    }

    #[tokio::test]
    async fn test_invalid_state_filter_is_rejected() {
        let (app, _) = test_app();
        let (status, _) = send(&app, "GET", "/api/tasks?state=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_worker_gets_new_identity() {
        let (app, _) = test_app();
        let registration = json!({"worker_id": "builder", "capabilities": ["build"]});
        send(&app, "POST", "/api/workers", Some(registration.clone())).await;
        let (status, body) = send(&app, "POST", "/api/workers", Some(registration)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["worker_id"], "builder-2");
        assert_eq!(body["data"]["disambiguated"], true);

        let (_, body) = send(&app, "GET", "/api/workers?status=starting", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_system_stats_and_disabled_metrics() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "GET", "/api/system/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_tasks"], 0);

        let (status, _) = send(&app, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_message_status_returns_not_found() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "GET", "/api/messages/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "UNKNOWN_MESSAGE");
    }

    #[tokio::test]
    async fn test_core_inbox_cannot_be_polled_over_http() {
        let (app, dispatcher) = test_app();
        let report = Message::task_complete(
            "dispatcher",
            TaskCompleteMessage {
                task_id: "t-1".to_string(),
                worker_id: "w-1".to_string(),
                result: json!({}),
                timestamp: Utc::now(),
            },
        );
        dispatcher.bus().publish_message(&report).await.unwrap();

        let (status, body) = send(&app, "GET", "/api/mailboxes/dispatcher/messages", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");
        let (status, _) = send(&app, "GET", "/api/workers/dispatcher/messages", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&app, "GET", "/api/mailboxes/some-team/messages", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // 状态监听器仍能取到该消息
        assert_eq!(dispatcher.bus().pending_count("dispatcher").await.unwrap(), 1);
        let (_, body) = send(&app, "GET", &format!("/api/messages/{}", report.id), None).await;
        assert_eq!(body["data"]["state"], "pending");

        let (status, body) = send(&app, "GET", "/api/mailboxes/escalations/messages", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());
    }
}
