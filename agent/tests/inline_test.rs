/// BedrockInlineAgent の統合テスト
///
/// Converse とインラインエージェントの両方をモックに差し替えて、
/// ツール呼び出しの有無による分岐を検証します。
use async_trait::async_trait;
use aws_agent::inline::{
    ActionGroupSpec, ConverseReply, ConverseRequest, INLINE_AGENT_TOOL_NAME,
    InlineAgentInvocation, KnowledgeBaseSpec,
};
use aws_agent::{
    Agent, AgentError, AgentRequest, BedrockInlineAgent, BedrockInlineAgentOptions, ChatMessage,
    ConverseRuntime, DecodingError, InlineAgentRuntime, Role,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

struct MockConverse {
    reply: ConverseReply,
    requests: Mutex<Vec<ConverseRequest>>,
}

#[async_trait]
impl ConverseRuntime for MockConverse {
    async fn converse(&self, request: ConverseRequest) -> Result<ConverseReply, AgentError> {
        self.requests.lock().unwrap().push(request);
        Ok(self.reply.clone())
    }
}

#[derive(Default)]
struct MockInlineAgent {
    invocations: Mutex<Vec<InlineAgentInvocation>>,
}

#[async_trait]
impl InlineAgentRuntime for MockInlineAgent {
    async fn invoke_inline_agent(
        &self,
        invocation: InlineAgentInvocation,
    ) -> Result<String, AgentError> {
        let answer = format!("handled: {}", invocation.input_text);
        self.invocations.lock().unwrap().push(invocation);
        Ok(answer)
    }
}

fn action_group(name: &str) -> ActionGroupSpec {
    ActionGroupSpec {
        name: name.to_string(),
        description: Some(format!("{} tools", name)),
        parent_action_group_signature: None,
        lambda_arn: Some(format!("arn:aws:lambda:us-east-1:123456789012:function:{}", name)),
        api_schema: None,
    }
}

fn options() -> BedrockInlineAgentOptions {
    let mut options = BedrockInlineAgentOptions::new("support-agent", "Customer support");
    options.action_groups = vec![action_group("Orders"), action_group("Billing")];
    options.knowledge_bases = vec![
        KnowledgeBaseSpec {
            knowledge_base_id: "KB-MANUALS".to_string(),
            description: "Product manuals".to_string(),
        },
        KnowledgeBaseSpec {
            knowledge_base_id: "KB-POLICY".to_string(),
            description: "Return policy".to_string(),
        },
    ];
    options
}

fn agent_with(reply: ConverseReply) -> (BedrockInlineAgent, Arc<MockConverse>, Arc<MockInlineAgent>) {
    agent_with_options(options(), reply)
}

fn agent_with_options(
    options: BedrockInlineAgentOptions,
    reply: ConverseReply,
) -> (BedrockInlineAgent, Arc<MockConverse>, Arc<MockInlineAgent>) {
    let converse = Arc::new(MockConverse {
        reply,
        requests: Mutex::new(Vec::new()),
    });
    let inline = Arc::new(MockInlineAgent::default());
    let agent = BedrockInlineAgent::with_runtimes(options, converse.clone(), inline.clone()).unwrap();
    (agent, converse, inline)
}

#[tokio::test]
async fn test_text_reply_is_returned_directly() {
    let (agent, converse, inline) = agent_with(ConverseReply::Text("Hello there".to_string()));

    let request = AgentRequest::new("hi", "user", "session")
        .with_chat_history(vec![ChatMessage::user("before"), ChatMessage::assistant("ok")]);
    let response = agent.process_request(&request).await.unwrap();

    assert_eq!(response.text, "Hello there");
    assert!(inline.invocations.lock().unwrap().is_empty());

    let requests = converse.requests.lock().unwrap();
    let sent = &requests[0];
    assert_eq!(sent.messages.len(), 3);
    assert_eq!(sent.messages[2].role, Role::User);
    assert_eq!(sent.messages[2].content, "hi");
    assert_eq!(sent.tool.name, INLINE_AGENT_TOOL_NAME);
    assert_eq!(sent.system_prompt, agent.system_prompt());
    assert_eq!(sent.inference_config.max_tokens, 1000);
}

#[tokio::test]
async fn test_tool_use_creates_inline_agent_with_selected_capabilities() {
    let (agent, _converse, inline) = agent_with(ConverseReply::ToolUse {
        name: INLINE_AGENT_TOOL_NAME.to_string(),
        input: json!({
            "action_group_names": ["Billing", "Unknown"],
            "knowledge_bases": ["KB-POLICY"],
            "description": "Check the refund status using the billing tools and the return policy",
            "user_request": "Where is my refund?"
        }),
    });

    let response = agent
        .process_request(&AgentRequest::new("Where is my refund?", "user", "session-3"))
        .await
        .unwrap();

    assert_eq!(response.text, "handled: Where is my refund?");
    assert_eq!(response.metadata.get("actionGroups"), Some(&json!(["Billing"])));
    assert_eq!(response.metadata.get("knowledgeBases"), Some(&json!(["KB-POLICY"])));

    let invocations = inline.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    let invocation = &invocations[0];
    assert_eq!(invocation.session_id, "session-3");
    assert_eq!(
        invocation.instruction,
        "Check the refund status using the billing tools and the return policy"
    );
    assert_eq!(invocation.foundation_model, agent.options().foundation_model);
    assert_eq!(invocation.action_groups, vec![action_group("Billing")]);
    assert_eq!(invocation.knowledge_bases.len(), 1);
    assert_eq!(invocation.knowledge_bases[0].knowledge_base_id, "KB-POLICY");
    assert!(!invocation.enable_trace);
}

fn billing_tool_use() -> ConverseReply {
    ConverseReply::ToolUse {
        name: INLINE_AGENT_TOOL_NAME.to_string(),
        input: json!({
            "action_group_names": ["Billing"],
            "knowledge_bases": [],
            "description": "Look up the invoice with the billing tools",
            "user_request": "Send me my invoice"
        }),
    }
}

#[tokio::test]
async fn test_trace_setting_is_forwarded_to_inline_agent() {
    let mut options = options();
    options.enable_trace = true;
    let (agent, _converse, inline) = agent_with_options(options, billing_tool_use());

    let response = agent
        .process_request(&AgentRequest::new("Send me my invoice", "user", "session"))
        .await
        .unwrap();

    assert_eq!(response.text, "handled: Send me my invoice");
    let invocations = inline.invocations.lock().unwrap();
    assert!(
        invocations[0].enable_trace,
        "enable_trace がインラインエージェントの呼び出しに渡されること"
    );
    assert!(invocations[0].knowledge_bases.is_empty());
}

#[tokio::test]
async fn test_history_ending_with_user_turn_is_merged() {
    let (agent, converse, _inline) = agent_with(ConverseReply::Text("ok".to_string()));

    let request = AgentRequest::new("and my invoice", "user", "session")
        .with_chat_history(vec![ChatMessage::assistant("hi"), ChatMessage::user("I need my order")]);
    agent.process_request(&request).await.unwrap();

    let requests = converse.requests.lock().unwrap();
    let sent = &requests[0].messages;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1], ChatMessage::user("I need my order\nand my invoice"));
}

#[tokio::test]
async fn test_malformed_tool_input_is_decoding_error() {
    let (agent, _converse, inline) = agent_with(ConverseReply::ToolUse {
        name: INLINE_AGENT_TOOL_NAME.to_string(),
        input: json!({ "action_group_names": "Billing" }),
    });

    let result = agent
        .process_request(&AgentRequest::new("refund?", "user", "session"))
        .await;

    assert!(matches!(
        result,
        Err(AgentError::DecodingError(DecodingError::InvalidToolInput(_)))
    ));
    assert!(inline.invocations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_tool_is_decoding_error() {
    let (agent, _converse, _inline) = agent_with(ConverseReply::ToolUse {
        name: "delete_everything".to_string(),
        input: json!({}),
    });

    let result = agent
        .process_request(&AgentRequest::new("hi", "user", "session"))
        .await;

    match result {
        Err(AgentError::DecodingError(DecodingError::UnexpectedTool(name))) => {
            assert_eq!(name, "delete_everything")
        }
        other => panic!("UnexpectedTool が返されるべき: {:?}", other),
    }
}
