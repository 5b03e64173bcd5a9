use std::sync::Arc;

use newsbot::llm::remote::RemoteLlmProvider;
use newsbot::llm::{Analyzer, LlmProvider, LlmRequest, Sentiment};

fn completion(content: &str) -> String {
    serde_json::json!({
        "model": "gpt-4o-mini",
        "choices": [{
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
    })
    .to_string()
}

fn analyzer_for(url: String) -> Analyzer {
    let provider = RemoteLlmProvider::new(url, "fake-api-key", "gpt-4o-mini").unwrap();
    Analyzer::new(Some(Arc::new(provider) as Arc<dyn LlmProvider>))
}

#[tokio::test]
async fn test_remote_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer fake-api-key")
        .match_header("user-agent", mockito::Matcher::Regex("^newsbot/".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion("This is a test response"))
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini").unwrap();

    let request = LlmRequest {
        prompt: "Test prompt".to_string(),
        max_tokens: Some(100),
        temperature: Some(0.7),
        timeout_seconds: Some(10),
        ..Default::default()
    };

    let response = provider.generate(request).await.unwrap();
    assert_eq!(response.content, "This is a test response");
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.completion_tokens, 5);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model, "gpt-4o-mini");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_analyzer_uses_model_answers() {
    let mut server = mockito::Server::new_async().await;

    let summary_mock = server
        .mock("POST", "/")
        .match_body(mockito::Matcher::Regex("Summarize".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion("Markets rallied on Monday."))
        .create_async()
        .await;
    let sentiment_mock = server
        .mock("POST", "/")
        .match_body(mockito::Matcher::Regex("sentiment".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion("positive."))
        .create_async()
        .await;
    let reliability_mock = server
        .mock("POST", "/")
        .match_body(mockito::Matcher::Regex("reliability".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion("Score: 130"))
        .create_async()
        .await;

    let analyzer = analyzer_for(server.url());

    let outcome = analyzer.summarize("Stocks went up a lot today.", "English").await;
    assert_eq!(outcome.summary, "Markets rallied on Monday.");
    assert!(!outcome.fallback);
    assert_eq!(outcome.usage.total_tokens, 15);

    assert_eq!(analyzer.sentiment("Stocks went up").await, Sentiment::Positive);
    assert_eq!(analyzer.reliability("Stocks went up").await, 100);

    summary_mock.assert_async().await;
    sentiment_mock.assert_async().await;
    reliability_mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_error_handling() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "Rate limit exceeded"}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini").unwrap();

    let request = LlmRequest {
        prompt: "Test".to_string(),
        ..Default::default()
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(err.to_string().contains("429"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_analyzer_falls_back_when_provider_fails() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/")
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;

    let analyzer = analyzer_for(server.url());

    let outcome = analyzer
        .summarize("First sentence here. Second one follows.", "English")
        .await;
    assert!(outcome.fallback);
    assert_eq!(outcome.summary, "First sentence here. Second one follows.");

    assert_eq!(analyzer.sentiment("great wonderful news").await, Sentiment::Neutral);
    assert_eq!(analyzer.reliability("anything").await, 75);
}

#[tokio::test]
async fn test_remote_provider_timeout() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini").unwrap();

    let request = LlmRequest {
        prompt: "Test".to_string(),
        timeout_seconds: Some(1),
        ..Default::default()
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("timed out"));
}
