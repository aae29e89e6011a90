mod common;

use rocket::http::{ContentType, Status};
use serde_json::{json, Value};

use common::{client, cluster_state, fake_upstream};
use local_llm_gateway::app_state::AppState;
use local_llm_gateway::load_balancer::LoadBalancer;

fn balancer(state: &AppState) -> &LoadBalancer {
    state.cluster().unwrap().load_balancer()
}

#[rocket::async_test]
async fn empty_cluster_answers_no_instance_available() {
    let client = client(cluster_state()).await;

    let res = client.get("/health").dispatch().await;
    assert_eq!(res.status(), Status::ServiceUnavailable);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["mode"], "load_balance");
    assert_eq!(body["status"], "unhealthy");

    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "messages": [{"role": "user", "content": "hi"}]}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::ServiceUnavailable);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["error"]["code"], "no_instance_available");
}

#[rocket::async_test]
async fn validation_happens_before_forwarding() {
    let client = client(cluster_state()).await;
    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "messages": []}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
}

#[rocket::async_test]
async fn strategy_can_be_changed_and_rejected() {
    let state = cluster_state();
    let client = client(state.clone()).await;

    let res = client
        .post("/v1/cluster/strategy")
        .header(ContentType::JSON)
        .body(json!({"strategy": "least_connections"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);

    let status: Value = client.get("/v1/cluster/status").dispatch().await.into_json().await.unwrap();
    assert_eq!(status["load_balancer_strategy"], "least_connections");
    assert_eq!(status["total_instances"], 0);

    let res = client
        .post("/v1/cluster/strategy")
        .header(ContentType::JSON)
        .body(json!({"strategy": "fastest_guess"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(balancer(&state).strategy().as_str(), "least_connections");
}

#[rocket::async_test]
async fn scale_requests_are_checked() {
    let client = client(cluster_state()).await;

    let res = client
        .post("/v1/cluster/scale")
        .header(ContentType::JSON)
        .body(json!({"action": "sideways"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);

    // 没有实例可以移除
    let res = client
        .post("/v1/cluster/scale")
        .header(ContentType::JSON)
        .body(json!({"action": "down", "count": 1}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post("/v1/cluster/scale")
        .header(ContentType::JSON)
        .body(json!({"action": "up", "count": 10}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::ServiceUnavailable);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["error"]["code"], "resource_limit");
}

#[rocket::async_test]
async fn restart_of_unknown_instance_fails() {
    let client = client(cluster_state()).await;
    let res = client
        .post("/v1/cluster/restart")
        .header(ContentType::JSON)
        .body(json!({"instance_id": "instance_9"}).to_string())
        .dispatch()
        .await;
    assert!(res.status().code >= 400);
    let body: Value = res.into_json().await.unwrap();
    assert!(body["error"]["message"].as_str().unwrap().contains("instance_9"));
}

#[rocket::async_test]
async fn requests_are_forwarded_and_accounted() {
    let upstream = r#"{"id":"chatcmpl-up","object":"chat.completion","choices":[]}"#;
    let port = fake_upstream("200 OK", upstream).await;
    let state = cluster_state();
    balancer(&state).add_instance("instance_0", "127.0.0.1", port, 1, Vec::new());
    let client = client(state.clone()).await;

    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "messages": [{"role": "user", "content": "hi"}]}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["id"], "chatcmpl-up");

    let stats = balancer(&state).get("instance_0").unwrap().stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(stats.active_connections, 0);
}

#[rocket::async_test]
async fn upstream_error_envelope_passes_through() {
    let upstream = r#"{"error":{"message":"Model 'x' not found","type":"model_not_found","param":"model","code":"model_not_found"}}"#;
    let port = fake_upstream("404 Not Found", upstream).await;
    let state = cluster_state();
    balancer(&state).add_instance("instance_0", "127.0.0.1", port, 1, Vec::new());
    let client = client(state.clone()).await;

    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "x", "messages": [{"role": "user", "content": "hi"}]}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::NotFound);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["error"]["code"], "model_not_found");

    let stats = balancer(&state).get("instance_0").unwrap().stats();
    assert_eq!(stats.failed_requests, 1);
}

#[rocket::async_test]
async fn single_mode_management_is_refused() {
    let client = client(cluster_state()).await;
    let res = client
        .post("/v1/models/load")
        .header(ContentType::JSON)
        .body(json!({"model_name": "tiny"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);

    let metrics: Value = client.get("/v1/system/metrics").dispatch().await.into_json().await.unwrap();
    assert_eq!(metrics["load_balancer"]["total_instances"], 0);
}

#[rocket::async_test]
async fn streamed_forward_is_settled_after_the_body() {
    let upstream = "data: {\"id\":\"chatcmpl-up\"}\n\ndata: [DONE]\n\n";
    let port = fake_upstream("200 OK", upstream).await;
    let state = cluster_state();
    balancer(&state).add_instance("instance_0", "127.0.0.1", port, 1, Vec::new());
    let client = client(state.clone()).await;

    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "messages": [{"role": "user", "content": "hi"}], "stream": true}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);

    // 响应体还没读完，连接仍然在途
    let stats = balancer(&state).get("instance_0").unwrap().stats();
    assert_eq!(stats.active_connections, 1);

    let body = res.into_string().await.unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));

    let stats = balancer(&state).get("instance_0").unwrap().stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failed_requests, 0);
}
