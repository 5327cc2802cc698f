/// Amazon Bedrock Flows を呼び出すエージェント
use crate::agent::{Agent, load_sdk_config, require};
use crate::codec::{DefaultFlowCodec, ExternalPayload, FlowCodec, FlowOutput};
use crate::document::{from_document, to_document};
use crate::error::{AgentError, DecodingError};
use crate::types::{AgentIdentity, AgentRequest, AgentResponse};
use async_trait::async_trait;
use aws_sdk_bedrockagentruntime::Client;
use aws_sdk_bedrockagentruntime::types::{FlowInput, FlowInputContent, FlowResponseStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, debug, info};

/// 入力ノード名の既定値
pub const DEFAULT_INPUT_NODE_NAME: &str = "FlowInputNode";
/// 入力ノードの出力名の既定値
pub const DEFAULT_INPUT_NODE_OUTPUT_NAME: &str = "document";

fn default_input_node_name() -> String {
    DEFAULT_INPUT_NODE_NAME.to_string()
}

fn default_input_node_output_name() -> String {
    DEFAULT_INPUT_NODE_OUTPUT_NAME.to_string()
}

/// BedrockFlowsAgent の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedrockFlowsAgentOptions {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub flow_identifier: String,
    pub flow_alias_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub enable_trace: bool,
    #[serde(default = "default_input_node_name")]
    pub input_node_name: String,
    #[serde(default = "default_input_node_output_name")]
    pub input_node_output_name: String,
}

impl BedrockFlowsAgentOptions {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        flow_identifier: impl Into<String>,
        flow_alias_identifier: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            flow_identifier: flow_identifier.into(),
            flow_alias_identifier: flow_alias_identifier.into(),
            region: None,
            enable_trace: false,
            input_node_name: default_input_node_name(),
            input_node_output_name: default_input_node_output_name(),
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        require("name", &self.name)?;
        require("flow_identifier", &self.flow_identifier)?;
        require("flow_alias_identifier", &self.flow_alias_identifier)?;
        require("input_node_name", &self.input_node_name)
    }
}

/// InvokeFlow に渡すパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct FlowInvocation {
    pub flow_identifier: String,
    pub flow_alias_identifier: String,
    pub node_name: String,
    pub node_output_name: String,
    pub payload: ExternalPayload,
    pub enable_trace: bool,
}

/// フローのレスポンスストリームから受信したイベント
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// 出力イベント。ドキュメントを含まない場合は `document` が `None`
    Output {
        node_name: String,
        document: Option<Value>,
    },
    Completion { reason: String },
    Trace(String),
}

/// InvokeFlow の結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowResult {
    pub execution_id: Option<String>,
    pub events: Vec<FlowEvent>,
}

impl FlowResult {
    /// 最後に受信した出力イベントを取り出す
    ///
    /// # Errors
    /// * `DecodingError::NoOutput` - 出力イベントが1つもない場合
    /// * `DecodingError::MissingField` - 最後の出力イベントにドキュメントがない場合
    pub fn final_output(&self) -> Result<FlowOutput, DecodingError> {
        let (node_name, document) = self
            .events
            .iter()
            .rev()
            .find_map(|event| match event {
                FlowEvent::Output {
                    node_name,
                    document,
                } => Some((node_name, document)),
                _ => None,
            })
            .ok_or(DecodingError::NoOutput)?;

        let document = document
            .clone()
            .ok_or(DecodingError::MissingField { field: "document" })?;

        Ok(FlowOutput {
            node_name: node_name.clone(),
            execution_id: self.execution_id.clone(),
            document,
        })
    }
}

/// Bedrock Flows との通信を抽象化するトレイト
#[async_trait]
pub trait FlowTransport: Send + Sync {
    async fn invoke_flow(&self, invocation: FlowInvocation) -> Result<FlowResult, AgentError>;
}

/// AWS SDK を使用した FlowTransport の実装
pub struct AwsFlowTransport {
    client: Client,
}

impl AwsFlowTransport {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

#[async_trait]
impl FlowTransport for AwsFlowTransport {
    async fn invoke_flow(&self, invocation: FlowInvocation) -> Result<FlowResult, AgentError> {
        let input = FlowInput::builder()
            .node_name(invocation.node_name)
            .node_output_name(invocation.node_output_name)
            .content(FlowInputContent::Document(to_document(
                invocation.payload.as_value(),
            )))
            .build()
            .map_err(|e| {
                AgentError::MessageBuildError(format!("Failed to build flow input: {}", e))
            })?;

        let output = self
            .client
            .invoke_flow()
            .flow_identifier(invocation.flow_identifier)
            .flow_alias_identifier(invocation.flow_alias_identifier)
            .inputs(input)
            .enable_trace(invocation.enable_trace)
            .send()
            .await
            .map_err(|e| AgentError::AwsSdkError(e.to_string()))?;

        let mut result = FlowResult {
            execution_id: output.execution_id,
            events: Vec::new(),
        };

        let mut stream = output.response_stream;
        while let Some(event) = stream
            .recv()
            .await
            .map_err(|e| AgentError::AwsSdkError(e.to_string()))?
        {
            match event {
                FlowResponseStream::FlowOutputEvent(output_event) => {
                    let document = output_event
                        .content
                        .as_ref()
                        .and_then(|content| content.as_document().ok())
                        .map(from_document);
                    result.events.push(FlowEvent::Output {
                        node_name: output_event.node_name,
                        document,
                    });
                }
                FlowResponseStream::FlowCompletionEvent(completion) => {
                    result.events.push(FlowEvent::Completion {
                        reason: completion.completion_reason.as_str().to_string(),
                    });
                }
                FlowResponseStream::FlowTraceEvent(trace) => {
                    result.events.push(FlowEvent::Trace(format!("{:?}", trace.trace)));
                }
                _ => {}
            }
        }

        Ok(result)
    }
}

/// Bedrock Flows エージェント
///
/// リクエストは `FlowCodec` でエンコードされ、検証されたうえでフローに送信される。
/// フローの最後の出力が同じコーデックでデコードされてレスポンスとなる。
pub struct BedrockFlowsAgent {
    identity: AgentIdentity,
    options: BedrockFlowsAgentOptions,
    codec: Arc<dyn FlowCodec>,
    transport: Arc<dyn FlowTransport>,
    span: tracing::Span,
}

impl BedrockFlowsAgent {
    /// AWS の認証情報を読み込んで新しい BedrockFlowsAgent を作成する
    ///
    /// コーデックは既定のもの（テキストをそのまま送受信）を使用する。
    pub async fn new(
        options: BedrockFlowsAgentOptions,
        profile: Option<&str>,
    ) -> Result<Self, AgentError> {
        options.validate()?;
        let config = load_sdk_config(profile, options.region.clone()).await;
        Self::with_transport(options, Arc::new(AwsFlowTransport::new(&config)))
    }

    /// 任意のトランスポートを使用して BedrockFlowsAgent を作成する
    pub fn with_transport(
        options: BedrockFlowsAgentOptions,
        transport: Arc<dyn FlowTransport>,
    ) -> Result<Self, AgentError> {
        options.validate()?;
        let identity = AgentIdentity::new(&options.name, &options.description);
        let span = tracing::info_span!("bedrock_flows_agent", agent = %options.name);
        Ok(Self {
            identity,
            options,
            codec: Arc::new(DefaultFlowCodec),
            transport,
            span,
        })
    }

    /// エンコーダーとデコーダーの組を差し替える
    pub fn with_codec(mut self, codec: Arc<dyn FlowCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// ログ出力に使用する span を差し替える
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn options(&self) -> &BedrockFlowsAgentOptions {
        &self.options
    }

    fn encode(&self, request: &AgentRequest) -> Result<ExternalPayload, AgentError> {
        let value = self
            .codec
            .encode(&self.identity, &request.text, &request.context());
        Ok(ExternalPayload::validate(&self.identity, value)?)
    }
}

#[async_trait]
impl Agent for BedrockFlowsAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn process_request(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        async move {
            let payload = self.encode(request)?;

            let invocation = FlowInvocation {
                flow_identifier: self.options.flow_identifier.clone(),
                flow_alias_identifier: self.options.flow_alias_identifier.clone(),
                node_name: self.options.input_node_name.clone(),
                node_output_name: self.options.input_node_output_name.clone(),
                payload,
                enable_trace: self.options.enable_trace,
            };

            debug!(flow = %invocation.flow_identifier, "Invoking flow");
            let result = self.transport.invoke_flow(invocation).await?;

            for event in &result.events {
                match event {
                    FlowEvent::Trace(trace) if self.options.enable_trace => {
                        debug!(trace = %trace, "Flow trace");
                    }
                    FlowEvent::Completion { reason } => {
                        info!(reason = %reason, "Flow completed");
                    }
                    _ => {}
                }
            }

            let output = result.final_output()?;
            Ok(self.codec.decode(&output)?)
        }
        .instrument(self.span.clone())
        .await
    }
}
