mod common;

use rocket::http::{ContentType, Status};
use serde_json::{json, Value};

use common::{client, frames, single_state, FLAKY_MODEL};

#[rocket::async_test]
async fn health_reports_mode_and_status() {
    let client = client(single_state().await).await;
    let res = client.get("/health").dispatch().await;
    assert_eq!(res.status(), Status::Ok);
    assert!(res.headers().get_one("X-Request-Id").is_some());

    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["mode"], "single");
    assert_eq!(body["details"]["manager_initialized"], true);
}

#[rocket::async_test]
async fn model_list_includes_registered_models_and_aliases() {
    let client = client(single_state().await).await;
    let body: Value = client.get("/v1/models").dispatch().await.into_json().await.unwrap();
    assert_eq!(body["object"], "list");

    let data = body["data"].as_array().unwrap();
    let owner = |id: &str| {
        data.iter()
            .find(|m| m["id"] == id)
            .map(|m| m["owned_by"].as_str().unwrap().to_string())
    };
    assert_eq!(owner("tiny").as_deref(), Some("local"));
    assert_eq!(owner("gpt-3.5-turbo").as_deref(), Some("openai"));

    let res = client.get("/v1/models/gpt-4").dispatch().await;
    assert_eq!(res.status(), Status::Ok);
    let res = client.get("/v1/models/nope").dispatch().await;
    assert_eq!(res.status(), Status::NotFound);
}

#[rocket::async_test]
async fn chat_completion_returns_openai_shape() {
    let client = client(single_state().await).await;
    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(
            json!({
                "model": "tiny",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello there"}
                ],
                "n": 2
            })
            .to_string(),
        )
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);

    let body: Value = res.into_json().await.unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "tiny");
    assert_eq!(body["choices"].as_array().unwrap().len(), 2);
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("HELLO THERE"));
    let usage = &body["usage"];
    assert_eq!(
        usage["total_tokens"].as_u64().unwrap(),
        usage["prompt_tokens"].as_u64().unwrap() + usage["completion_tokens"].as_u64().unwrap()
    );
}

#[rocket::async_test]
async fn alias_is_answered_by_default_model() {
    let client = client(single_state().await).await;
    let body: Value = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}).to_string())
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    assert_eq!(body["model"], "gpt-4");
    assert!(body["choices"][0]["message"]["content"]
        .as_str()
        .unwrap()
        .contains("[tiny DUMMY]"));
}

#[rocket::async_test]
async fn chat_stream_frames_are_ordered() {
    let client = client(single_state().await).await;
    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "messages": [{"role": "user", "content": "a b"}], "stream": true}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(res.content_type(), Some(ContentType::EventStream));

    let frames = frames(&res.into_string().await.unwrap());
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));

    let chunks: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert!(text.contains("A B"));
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
}

#[rocket::async_test]
async fn stream_failure_ends_with_error_frame() {
    let client = client(single_state().await).await;
    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": FLAKY_MODEL, "messages": [{"role": "user", "content": "hi"}], "stream": true}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);

    let frames = frames(&res.into_string().await.unwrap());
    assert!(!frames.iter().any(|f| f == "[DONE]"));
    let last: Value = serde_json::from_str(frames.last().unwrap()).unwrap();
    assert_eq!(last["error"]["code"], "inference_error");
    assert!(frames.iter().any(|f| f.contains("partial")));
}

#[rocket::async_test]
async fn unknown_model_is_404_envelope() {
    let client = client(single_state().await).await;
    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "missing", "messages": [{"role": "user", "content": "hi"}]}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::NotFound);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["error"]["type"], "model_not_found");
    assert_eq!(body["error"]["code"], "model_not_found");
}

#[rocket::async_test]
async fn invalid_requests_are_400_with_param() {
    let client = client(single_state().await).await;
    let cases = [
        (json!({"model": "tiny", "messages": []}), "messages"),
        (json!({"model": "tiny", "messages": [{"role": "bot", "content": "x"}]}), "messages[0].role"),
        (json!({"model": "tiny", "messages": [{"role": "user", "content": "x"}], "temperature": 3.0}), "temperature"),
        (json!({"model": "tiny", "messages": [{"role": "user", "content": "x"}], "max_tokens": 0}), "max_tokens"),
        (json!({"model": "tiny", "messages": [{"role": "user", "content": "x"}], "n": 4294967295u32}), "n"),
    ];
    for (body, param) in cases {
        let res = client
            .post("/v1/chat/completions")
            .header(ContentType::JSON)
            .body(body.to_string())
            .dispatch()
            .await;
        assert_eq!(res.status(), Status::BadRequest, "{param}");
        let body: Value = res.into_json().await.unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["param"], param);
    }

    let res = client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body("{not json")
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
}

#[rocket::async_test]
async fn unknown_route_is_404_envelope() {
    let client = client(single_state().await).await;
    let res = client.get("/v1/nothing-here").dispatch().await;
    assert_eq!(res.status(), Status::NotFound);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    // 单机模式没有集群接口
    let res = client.get("/v1/cluster/status").dispatch().await;
    assert_eq!(res.status(), Status::NotFound);
}

#[rocket::async_test]
async fn completions_echo_and_suffix() {
    let client = client(single_state().await).await;
    let body: Value = client
        .post("/v1/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "prompt": "once upon", "echo": true, "suffix": " END", "max_tokens": 50}).to_string())
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("cmpl-"));
    assert_eq!(body["object"], "text_completion");
    let text = body["choices"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("once upon"));
    assert!(text.ends_with(" END"));
    assert!(text.contains("ONCE UPON"));
}

#[rocket::async_test]
async fn completions_default_to_sixteen_tokens() {
    let client = client(single_state().await).await;
    let prompt = vec!["word"; 40].join(" ");
    let body: Value = client
        .post("/v1/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "prompt": prompt}).to_string())
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    assert_eq!(body["choices"][0]["finish_reason"], "length");
    let words = body["choices"][0]["text"].as_str().unwrap().split_whitespace().count();
    assert_eq!(words, 16);
}

#[rocket::async_test]
async fn management_load_status_unload() {
    let client = client(single_state().await).await;

    let res = client
        .post("/v1/models/load")
        .header(ContentType::JSON)
        .body(json!({"model_name": "small"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let body: Value = res.into_json().await.unwrap();
    assert_eq!(body["success"], true);

    let status: Value = client
        .get("/v1/models/small/status")
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    assert_eq!(status["status"], "loaded");

    let res = client
        .post("/v1/models/unload")
        .header(ContentType::JSON)
        .body(json!({"model_name": "small"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);

    // 已经卸载过
    let res = client
        .post("/v1/models/unload")
        .header(ContentType::JSON)
        .body(json!({"model_name": "small"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post("/v1/models/load")
        .header(ContentType::JSON)
        .body(json!({"model_name": "ghost"}).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::NotFound);
}

#[rocket::async_test]
async fn system_endpoints_report_manager_state() {
    let client = client(single_state().await).await;
    client
        .post("/v1/chat/completions")
        .header(ContentType::JSON)
        .body(json!({"model": "tiny", "messages": [{"role": "user", "content": "hi"}]}).to_string())
        .dispatch()
        .await;

    let status: Value = client.get("/v1/system/status").dispatch().await.into_json().await.unwrap();
    assert_eq!(status["mode"], "single");
    assert_eq!(status["manager"]["registered_models"], 3);
    assert_eq!(status["manager"]["loaded_models"], 1);

    let metrics: Value = client.get("/v1/system/metrics").dispatch().await.into_json().await.unwrap();
    assert_eq!(metrics["inference"]["total_requests"], 1);
    assert!(metrics["http"]["requests"].as_u64().unwrap() >= 2);
}
