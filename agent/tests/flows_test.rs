/// BedrockFlowsAgent の統合テスト
///
/// モックのトランスポートを使用して、エンコード・検証・デコードの一連の流れを検証します。
use async_trait::async_trait;
use aws_agent::flows::{FlowEvent, FlowInvocation, FlowResult};
use aws_agent::{
    Agent, AgentError, AgentIdentity, AgentRequest, BedrockFlowsAgent, BedrockFlowsAgentOptions,
    DecodingError, DefaultFlowCodec, EncodingError, FlowTransport, FnFlowCodec, RequestContext,
};
use serde_json::{Value, json};
use std::env;
use std::sync::{Arc, Mutex};

/// 受け取った呼び出しを記録し、固定のイベントを返すトランスポート
struct RecordingTransport {
    events: Vec<FlowEvent>,
    calls: Mutex<Vec<FlowInvocation>>,
}

impl RecordingTransport {
    fn new(events: Vec<FlowEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<FlowInvocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlowTransport for RecordingTransport {
    async fn invoke_flow(&self, invocation: FlowInvocation) -> Result<FlowResult, AgentError> {
        self.calls.lock().unwrap().push(invocation);
        Ok(FlowResult {
            execution_id: Some("exec-42".to_string()),
            events: self.events.clone(),
        })
    }
}

fn output_event(document: Value) -> FlowEvent {
    FlowEvent::Output {
        node_name: "FlowOutputNode".to_string(),
        document: Some(document),
    }
}

fn options(name: &str) -> BedrockFlowsAgentOptions {
    BedrockFlowsAgentOptions::new(name, "test flow", "FLOW123", "ALIAS123")
}

#[tokio::test]
async fn test_default_codec_round_trip() {
    let transport = RecordingTransport::new(vec![
        output_event(json!("Your flight is booked")),
        FlowEvent::Completion {
            reason: "SUCCESS".to_string(),
        },
    ]);
    let agent = BedrockFlowsAgent::with_transport(options("travel-flow"), transport.clone()).unwrap();

    let response = agent
        .process_request(&AgentRequest::new("book a flight", "user", "session"))
        .await
        .unwrap();

    assert_eq!(response.text, "Your flight is booked");
    assert_eq!(response.metadata.get("flowExecutionId"), Some(&json!("exec-42")));

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload.as_value(), &json!("book a flight"));
    assert_eq!(calls[0].node_name, "FlowInputNode");
    assert_eq!(calls[0].node_output_name, "document");
    assert_eq!(calls[0].flow_identifier, "FLOW123");
    assert_eq!(calls[0].flow_alias_identifier, "ALIAS123");
}

#[tokio::test]
async fn test_custom_codec_shapes_payload_per_agent() {
    let codec = Arc::new(FnFlowCodec::new(
        |agent: &AgentIdentity, input: &str, _ctx: &RequestContext<'_>| {
            if agent.name == "tech-flow-agent" {
                json!({ "question": input })
            } else {
                Value::String(input.to_string())
            }
        },
        DefaultFlowCodec::decode_text,
    ));

    for (name, expected) in [
        ("tech-flow-agent", json!({ "question": "reset my router" })),
        ("other-flow-agent", json!("reset my router")),
    ] {
        let transport = RecordingTransport::new(vec![output_event(json!({ "text": "done" }))]);
        let agent = BedrockFlowsAgent::with_transport(options(name), transport.clone())
            .unwrap()
            .with_codec(codec.clone());

        let response = agent
            .process_request(&AgentRequest::new("reset my router", "user", "session"))
            .await
            .unwrap();

        assert_eq!(response.text, "done");
        assert_eq!(transport.calls()[0].payload.as_value(), &expected);
    }
}

#[tokio::test]
async fn test_encoder_can_read_context() {
    let codec = Arc::new(FnFlowCodec::new(
        |_agent: &AgentIdentity, input: &str, ctx: &RequestContext<'_>| {
            json!({
                "input": input,
                "user": ctx.user_id,
                "turns": ctx.chat_history.len(),
                "tier": ctx.extra.get("tier").cloned().unwrap_or(Value::Null),
            })
        },
        DefaultFlowCodec::decode_text,
    ));
    let transport = RecordingTransport::new(vec![output_event(json!("ok"))]);
    let agent = BedrockFlowsAgent::with_transport(options("ctx-flow"), transport.clone())
        .unwrap()
        .with_codec(codec);

    let request = AgentRequest::new("hi", "user-7", "session")
        .with_chat_history(vec![aws_agent::ChatMessage::user("earlier")])
        .with_extra("tier", json!("gold"));
    agent.process_request(&request).await.unwrap();

    assert_eq!(
        transport.calls()[0].payload.as_value(),
        &json!({ "input": "hi", "user": "user-7", "turns": 1, "tier": "gold" })
    );
}

#[tokio::test]
async fn test_invalid_payload_is_rejected_before_dispatch() {
    let codec = Arc::new(FnFlowCodec::new(
        |_agent: &AgentIdentity, _input: &str, _ctx: &RequestContext<'_>| Value::Null,
        DefaultFlowCodec::decode_text,
    ));
    let transport = RecordingTransport::new(vec![output_event(json!("unused"))]);
    let agent = BedrockFlowsAgent::with_transport(options("null-flow"), transport.clone())
        .unwrap()
        .with_codec(codec);

    let result = agent
        .process_request(&AgentRequest::new("hello", "user", "session"))
        .await;

    match result {
        Err(AgentError::EncodingError(EncodingError::UnsupportedShape { agent, shape })) => {
            assert_eq!(agent, "null-flow");
            assert_eq!(shape, "null");
        }
        other => panic!("EncodingError が返されるべき: {:?}", other),
    }
    assert!(
        transport.calls().is_empty(),
        "エンコードに失敗した場合はフローを呼び出さないこと"
    );
}

#[tokio::test]
async fn test_missing_text_field_is_decoding_error() {
    let transport = RecordingTransport::new(vec![output_event(json!({ "answer": "42" }))]);
    let agent = BedrockFlowsAgent::with_transport(options("flow"), transport).unwrap();

    let result = agent
        .process_request(&AgentRequest::new("question", "user", "session"))
        .await;

    assert!(matches!(
        result,
        Err(AgentError::DecodingError(DecodingError::MissingField { field: "text" }))
    ));
}

#[tokio::test]
async fn test_flow_without_output_is_decoding_error() {
    let transport = RecordingTransport::new(vec![FlowEvent::Completion {
        reason: "INPUT_REQUIRED".to_string(),
    }]);
    let agent = BedrockFlowsAgent::with_transport(options("flow"), transport).unwrap();

    let result = agent
        .process_request(&AgentRequest::new("question", "user", "session"))
        .await;

    assert!(matches!(
        result,
        Err(AgentError::DecodingError(DecodingError::NoOutput))
    ));
}

#[tokio::test]
async fn test_output_without_document_is_decoding_error() {
    let transport = RecordingTransport::new(vec![
        FlowEvent::Output {
            node_name: "FlowOutputNode".to_string(),
            document: None,
        },
        FlowEvent::Completion {
            reason: "SUCCESS".to_string(),
        },
    ]);
    let agent = BedrockFlowsAgent::with_transport(options("flow"), transport).unwrap();

    let result = agent
        .process_request(&AgentRequest::new("question", "user", "session"))
        .await;

    assert!(matches!(
        result,
        Err(AgentError::DecodingError(DecodingError::MissingField { field: "document" }))
    ));
}

#[tokio::test]
async fn test_trace_enabled_is_forwarded_and_output_still_decoded() {
    let transport = RecordingTransport::new(vec![
        output_event(json!("traced answer")),
        FlowEvent::Trace("FlowTraceNodeOutputEvent".to_string()),
        FlowEvent::Completion {
            reason: "SUCCESS".to_string(),
        },
    ]);
    let mut options = options("traced-flow");
    options.enable_trace = true;
    let agent = BedrockFlowsAgent::with_transport(options, transport.clone()).unwrap();

    let response = agent
        .process_request(&AgentRequest::new("question", "user", "session"))
        .await
        .unwrap();

    assert_eq!(response.text, "traced answer");
    assert!(
        transport.calls()[0].enable_trace,
        "enable_trace がフローの呼び出しに渡されること"
    );
}

#[tokio::test]
async fn test_trace_disabled_by_default() {
    let transport = RecordingTransport::new(vec![output_event(json!("ok"))]);
    let agent = BedrockFlowsAgent::with_transport(options("flow"), transport.clone()).unwrap();

    agent
        .process_request(&AgentRequest::new("question", "user", "session"))
        .await
        .unwrap();

    assert!(!transport.calls()[0].enable_trace);
}

#[tokio::test]
async fn test_concurrent_requests_share_agent() {
    let transport = RecordingTransport::new(vec![output_event(json!("pong"))]);
    let agent = Arc::new(BedrockFlowsAgent::with_transport(options("flow"), transport.clone()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let agent = agent.clone();
            tokio::spawn(async move {
                agent
                    .process_request(&AgentRequest::new(format!("ping {}", i), "user", "session"))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().text, "pong");
    }
    assert_eq!(transport.calls().len(), 4);
}

#[test]
fn test_empty_identifier_is_config_error() {
    let transport = RecordingTransport::new(Vec::new());
    let result = BedrockFlowsAgent::with_transport(
        BedrockFlowsAgentOptions::new("flow", "desc", "FLOW", " "),
        transport,
    );

    match result {
        Err(AgentError::ConfigError(msg)) => assert!(msg.contains("flow_alias_identifier")),
        Err(other) => panic!("ConfigError が返されるべき: {:?}", other),
        Ok(_) => panic!("空の識別子は拒否されるべき"),
    }
}

#[cfg(test)]
mod real_service_tests {
    use super::*;

    /// 実際の Bedrock Flow を使用したテスト
    ///
    /// 実行方法:
    /// ```bash
    /// FLOW_ID=... FLOW_ALIAS_ID=... cargo test --test flows_test -- --ignored
    /// ```
    #[tokio::test]
    #[ignore] // デフォルトではスキップ
    async fn test_with_real_flow() {
        if env::var("SKIP_AWS_INTEGRATION_TEST").is_ok() {
            return;
        }

        let flow_id = env::var("FLOW_ID").expect("FLOW_ID が設定されていません");
        let alias_id = env::var("FLOW_ALIAS_ID").expect("FLOW_ALIAS_ID が設定されていません");

        let agent = BedrockFlowsAgent::new(
            BedrockFlowsAgentOptions::new("real-flow", "integration test", flow_id, alias_id),
            None,
        )
        .await
        .expect("BedrockFlowsAgentの初期化に失敗");

        let response = agent
            .process_request(&AgentRequest::new("hello", "integration", "session-1"))
            .await
            .expect("フローの呼び出しに失敗");

        eprintln!("フローの応答: {}", response.text);
        assert!(!response.text.is_empty(), "応答が空でないこと");
    }
}
