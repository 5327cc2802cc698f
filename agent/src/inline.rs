/// Converse のツール呼び出しでアクショングループとナレッジベースを選択し、
/// Bedrock のインラインエージェントを生成して応答させるエージェント
use crate::agent::{Agent, load_sdk_config, require};
use crate::document::{from_document, to_document};
use crate::error::{AgentError, DecodingError};
use crate::types::{AgentIdentity, AgentRequest, AgentResponse, ChatMessage, Role};
use async_trait::async_trait;
use aws_sdk_bedrockagentruntime::types::{
    ActionGroupExecutor, ActionGroupSignature, AgentActionGroup, ApiSchema,
    InlineAgentResponseStream, KnowledgeBase,
};
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, ConverseOutput as ConverseOutputType, InferenceConfiguration,
    Message, SystemContentBlock, Tool, ToolConfiguration, ToolInputSchema, ToolSpecification,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{Instrument, debug, info};

/// 使用するモデルIDの既定値
pub const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-haiku-20240307-v1:0";

/// インラインエージェント生成用ツールの名前
pub const INLINE_AGENT_TOOL_NAME: &str = "inline_agent_creation";

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

/// Converse の推論パラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InferenceConfig {
    pub max_tokens: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.0,
            top_p: 0.9,
            stop_sequences: Vec::new(),
        }
    }
}

/// インラインエージェントに渡すことができるアクショングループ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionGroupSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 組み込みアクショングループのシグネチャ（例: "AMAZON.CodeInterpreter"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_action_group_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda_arn: Option<String>,
    /// OpenAPI スキーマ本文
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_schema: Option<String>,
}

/// インラインエージェントに渡すことができるナレッジベース
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseSpec {
    pub knowledge_base_id: String,
    pub description: String,
}

/// システムプロンプトのテンプレート変数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateVariable {
    Text(String),
    Lines(Vec<String>),
}

impl TemplateVariable {
    fn render(&self) -> String {
        match self {
            TemplateVariable::Text(text) => text.clone(),
            TemplateVariable::Lines(lines) => lines.join("\n"),
        }
    }
}

/// ユーザー指定のシステムプロンプト
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CustomSystemPrompt {
    pub template: String,
    #[serde(default)]
    pub variables: HashMap<String, TemplateVariable>,
}

/// BedrockInlineAgent の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedrockInlineAgentOptions {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// アクショングループの選択に使用するモデル
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// インラインエージェントの基盤モデル
    #[serde(default = "default_model_id")]
    pub foundation_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub inference_config: InferenceConfig,
    #[serde(default)]
    pub action_groups: Vec<ActionGroupSpec>,
    #[serde(default)]
    pub knowledge_bases: Vec<KnowledgeBaseSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_system_prompt: Option<CustomSystemPrompt>,
    #[serde(default)]
    pub enable_trace: bool,
}

impl BedrockInlineAgentOptions {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            model_id: default_model_id(),
            foundation_model: default_model_id(),
            region: None,
            inference_config: InferenceConfig::default(),
            action_groups: Vec::new(),
            knowledge_bases: Vec::new(),
            custom_system_prompt: None,
            enable_trace: false,
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        require("name", &self.name)?;
        require("model_id", &self.model_id)?;
        require("foundation_model", &self.foundation_model)?;

        let mut seen = HashSet::new();
        for group in &self.action_groups {
            require("action group name", &group.name)?;
            if !seen.insert(group.name.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "duplicate action group name: {}",
                    group.name
                )));
            }
        }
        for kb in &self.knowledge_bases {
            require("knowledge_base_id", &kb.knowledge_base_id)?;
        }
        Ok(())
    }
}

/// システムプロンプトを組み立てる
///
/// ペルソナ部分（既定またはカスタムテンプレート）の後に、
/// 利用可能なアクショングループとナレッジベースの一覧を続ける。
pub fn build_system_prompt(options: &BedrockInlineAgentOptions) -> String {
    let mut prompt = match &options.custom_system_prompt {
        Some(custom) => replace_placeholders(&custom.template, &custom.variables),
        None => default_persona(&options.name, &options.description),
    };

    prompt.push_str("\n\nHere are the action groups that you can use to solve the customer request:\n");
    prompt.push_str("<action_groups>\n");
    for group in &options.action_groups {
        prompt.push_str(&format!("Action Group Name: {}\n", group.name));
        prompt.push_str(&format!(
            "Action Group Description: {}\n",
            group.description.as_deref().unwrap_or_default()
        ));
    }
    prompt.push_str("</action_groups>\n");

    prompt.push_str("\nHere are the knowledge bases that you can use to solve the customer request:\n");
    prompt.push_str("<knowledge_bases>\n");
    for kb in &options.knowledge_bases {
        prompt.push_str(&format!("Knowledge Base ID: {}\n", kb.knowledge_base_id));
        prompt.push_str(&format!("Knowledge Base Description: {}\n", kb.description));
    }
    prompt.push_str("</knowledge_bases>\n");

    prompt
}

fn default_persona(name: &str, description: &str) -> String {
    format!(
        "You are a {name}.\n{description}\n\
         Answer the user's questions accurately, keeping the context of the whole conversation.\n\
         When the user's request needs one of the action groups or knowledge bases listed below, \
         call the {INLINE_AGENT_TOOL_NAME} tool with the ones required to solve it, \
         a description of how to solve it, and the user's request.\n\
         Otherwise answer directly and ask for clarification when the request is ambiguous."
    )
}

/// `{{key}}` 形式のプレースホルダーを置換する。未知のキーはそのまま残す
///
/// テンプレートを先頭から1回だけ走査し、置換後の値は再走査しない。
fn replace_placeholders(template: &str, variables: &HashMap<String, TemplateVariable>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let key = &after_open[..end];
                match variables.get(key) {
                    Some(value) => rendered.push_str(&value.render()),
                    None => {
                        rendered.push_str("{{");
                        rendered.push_str(key);
                        rendered.push_str("}}");
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                rendered.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

/// インラインエージェント生成ツールの入力スキーマ
pub fn inline_agent_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action_group_names": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Names of the action groups needed to solve the user request"
            },
            "knowledge_bases": {
                "type": "array",
                "items": { "type": "string" },
                "description": "IDs of the knowledge bases needed to solve the user request"
            },
            "description": {
                "type": "string",
                "description": "Instructions for the agent on how to solve the user request with the selected action groups and knowledge bases"
            },
            "user_request": {
                "type": "string",
                "description": "The user's original request"
            }
        },
        "required": ["action_group_names", "knowledge_bases", "description", "user_request"]
    })
}

/// モデルがツール呼び出しで返すインラインエージェントの構成
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InlineAgentCreation {
    pub action_group_names: Vec<String>,
    pub knowledge_bases: Vec<String>,
    pub description: String,
    pub user_request: String,
}

/// Converse に渡すツール定義
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Converse に渡すパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct ConverseRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub inference_config: InferenceConfig,
    pub tool: ToolDefinition,
}

/// Converse の応答
#[derive(Debug, Clone, PartialEq)]
pub enum ConverseReply {
    Text(String),
    ToolUse { name: String, input: Value },
}

/// Bedrock Converse API との通信を抽象化するトレイト
#[async_trait]
pub trait ConverseRuntime: Send + Sync {
    async fn converse(&self, request: ConverseRequest) -> Result<ConverseReply, AgentError>;
}

/// InvokeInlineAgent に渡すパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct InlineAgentInvocation {
    pub session_id: String,
    pub input_text: String,
    pub instruction: String,
    pub foundation_model: String,
    pub action_groups: Vec<ActionGroupSpec>,
    pub knowledge_bases: Vec<KnowledgeBaseSpec>,
    pub enable_trace: bool,
}

/// Bedrock のインラインエージェント API との通信を抽象化するトレイト
#[async_trait]
pub trait InlineAgentRuntime: Send + Sync {
    /// インラインエージェントを呼び出し、応答テキストを返す
    async fn invoke_inline_agent(
        &self,
        invocation: InlineAgentInvocation,
    ) -> Result<String, AgentError>;
}

/// AWS SDK を使用した ConverseRuntime の実装
pub struct AwsConverseRuntime {
    client: aws_sdk_bedrockruntime::Client,
}

impl AwsConverseRuntime {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_bedrockruntime::Client::new(config),
        }
    }
}

/// 会話履歴の末尾にユーザーの発話を追加する
///
/// Converse は同じ発話者のメッセージが連続することを許さないため、
/// 履歴がユーザーの発話で終わっている場合は改行で連結する。
pub fn conversation_messages(chat_history: &[ChatMessage], text: &str) -> Vec<ChatMessage> {
    let mut messages = chat_history.to_vec();
    match messages.last_mut() {
        Some(last) if last.role == Role::User => {
            last.content.push('\n');
            last.content.push_str(text);
        }
        _ => messages.push(ChatMessage::user(text)),
    }
    messages
}

fn build_message(message: &ChatMessage) -> Result<Message, AgentError> {
    let role = match message.role {
        Role::User => ConversationRole::User,
        Role::Assistant => ConversationRole::Assistant,
    };
    Message::builder()
        .role(role)
        .content(ContentBlock::Text(message.content.clone()))
        .build()
        .map_err(|e| AgentError::MessageBuildError(format!("Failed to build message: {}", e)))
}

#[async_trait]
impl ConverseRuntime for AwsConverseRuntime {
    async fn converse(&self, request: ConverseRequest) -> Result<ConverseReply, AgentError> {
        let messages = request
            .messages
            .iter()
            .map(build_message)
            .collect::<Result<Vec<_>, _>>()?;

        let inference = &request.inference_config;
        let inference_config = InferenceConfiguration::builder()
            .max_tokens(inference.max_tokens)
            .temperature(inference.temperature)
            .top_p(inference.top_p)
            .set_stop_sequences(
                (!inference.stop_sequences.is_empty()).then(|| inference.stop_sequences.clone()),
            )
            .build();

        let tool_spec = ToolSpecification::builder()
            .name(request.tool.name)
            .description(request.tool.description)
            .input_schema(ToolInputSchema::Json(to_document(&request.tool.input_schema)))
            .build()
            .map_err(|e| AgentError::MessageBuildError(format!("Failed to build tool: {}", e)))?;

        let tool_config = ToolConfiguration::builder()
            .tools(Tool::ToolSpec(tool_spec))
            .build()
            .map_err(|e| {
                AgentError::MessageBuildError(format!("Failed to build tool config: {}", e))
            })?;

        let output = self
            .client
            .converse()
            .model_id(request.model_id)
            .system(SystemContentBlock::Text(request.system_prompt))
            .set_messages(Some(messages))
            .inference_config(inference_config)
            .tool_config(tool_config)
            .send()
            .await
            .map_err(|e| AgentError::AwsSdkError(e.to_string()))?;

        let message = match output.output {
            Some(ConverseOutputType::Message(message)) => message,
            _ => return Err(DecodingError::NoOutput.into()),
        };

        let mut text = String::new();
        for block in message.content {
            match block {
                ContentBlock::ToolUse(tool_use) => {
                    return Ok(ConverseReply::ToolUse {
                        name: tool_use.name,
                        input: from_document(&tool_use.input),
                    });
                }
                ContentBlock::Text(chunk) => text.push_str(&chunk),
                _ => {}
            }
        }

        Ok(ConverseReply::Text(text))
    }
}

/// AWS SDK を使用した InlineAgentRuntime の実装
pub struct AwsInlineAgentRuntime {
    client: aws_sdk_bedrockagentruntime::Client,
}

impl AwsInlineAgentRuntime {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_bedrockagentruntime::Client::new(config),
        }
    }
}

fn build_action_group(spec: &ActionGroupSpec) -> Result<AgentActionGroup, AgentError> {
    let mut builder = AgentActionGroup::builder()
        .action_group_name(&spec.name)
        .set_description(spec.description.clone());
    if let Some(signature) = &spec.parent_action_group_signature {
        builder = builder.parent_action_group_signature(ActionGroupSignature::from(signature.as_str()));
    }
    if let Some(arn) = &spec.lambda_arn {
        builder = builder.action_group_executor(ActionGroupExecutor::Lambda(arn.clone()));
    }
    if let Some(schema) = &spec.api_schema {
        builder = builder.api_schema(ApiSchema::Payload(schema.clone()));
    }
    builder.build().map_err(|e| {
        AgentError::MessageBuildError(format!("Failed to build action group '{}': {}", spec.name, e))
    })
}

fn build_knowledge_base(spec: &KnowledgeBaseSpec) -> Result<KnowledgeBase, AgentError> {
    KnowledgeBase::builder()
        .knowledge_base_id(&spec.knowledge_base_id)
        .description(&spec.description)
        .build()
        .map_err(|e| {
            AgentError::MessageBuildError(format!(
                "Failed to build knowledge base '{}': {}",
                spec.knowledge_base_id, e
            ))
        })
}

#[async_trait]
impl InlineAgentRuntime for AwsInlineAgentRuntime {
    async fn invoke_inline_agent(
        &self,
        invocation: InlineAgentInvocation,
    ) -> Result<String, AgentError> {
        let action_groups = invocation
            .action_groups
            .iter()
            .map(build_action_group)
            .collect::<Result<Vec<_>, _>>()?;
        let knowledge_bases = invocation
            .knowledge_bases
            .iter()
            .map(build_knowledge_base)
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .invoke_inline_agent()
            .session_id(invocation.session_id)
            .input_text(invocation.input_text)
            .instruction(invocation.instruction)
            .foundation_model(invocation.foundation_model)
            .enable_trace(invocation.enable_trace)
            .end_session(false)
            .set_action_groups((!action_groups.is_empty()).then_some(action_groups))
            .set_knowledge_bases((!knowledge_bases.is_empty()).then_some(knowledge_bases))
            .send()
            .await
            .map_err(|e| AgentError::AwsSdkError(e.to_string()))?;

        // マルチバイト文字がチャンク境界で分割されることがあるため、まとめてから変換する
        let mut bytes = Vec::new();
        let mut stream = output.completion;
        while let Some(event) = stream
            .recv()
            .await
            .map_err(|e| AgentError::AwsSdkError(e.to_string()))?
        {
            match event {
                InlineAgentResponseStream::Chunk(chunk) => {
                    if let Some(blob) = chunk.bytes {
                        bytes.extend_from_slice(blob.as_ref());
                    }
                }
                InlineAgentResponseStream::Trace(trace) if invocation.enable_trace => {
                    debug!(trace = ?trace.trace, "Inline agent trace");
                }
                _ => {}
            }
        }

        String::from_utf8(bytes)
            .map_err(|e| DecodingError::InvalidUtf8(e.to_string()).into())
    }
}

/// Bedrock インラインエージェント
pub struct BedrockInlineAgent {
    identity: AgentIdentity,
    options: BedrockInlineAgentOptions,
    system_prompt: String,
    converse: Arc<dyn ConverseRuntime>,
    inline_agent: Arc<dyn InlineAgentRuntime>,
    span: tracing::Span,
}

impl BedrockInlineAgent {
    /// AWS の認証情報を読み込んで新しい BedrockInlineAgent を作成する
    pub async fn new(
        options: BedrockInlineAgentOptions,
        profile: Option<&str>,
    ) -> Result<Self, AgentError> {
        options.validate()?;
        let config = load_sdk_config(profile, options.region.clone()).await;
        Self::with_runtimes(
            options,
            Arc::new(AwsConverseRuntime::new(&config)),
            Arc::new(AwsInlineAgentRuntime::new(&config)),
        )
    }

    /// 任意のランタイムを使用して BedrockInlineAgent を作成する
    pub fn with_runtimes(
        options: BedrockInlineAgentOptions,
        converse: Arc<dyn ConverseRuntime>,
        inline_agent: Arc<dyn InlineAgentRuntime>,
    ) -> Result<Self, AgentError> {
        options.validate()?;
        let identity = AgentIdentity::new(&options.name, &options.description);
        let system_prompt = build_system_prompt(&options);
        let span = tracing::info_span!("bedrock_inline_agent", agent = %options.name);
        Ok(Self {
            identity,
            options,
            system_prompt,
            converse,
            inline_agent,
            span,
        })
    }

    /// ログ出力に使用する span を差し替える
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn options(&self) -> &BedrockInlineAgentOptions {
        &self.options
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    async fn create_inline_agent(
        &self,
        request: &AgentRequest,
        creation: InlineAgentCreation,
    ) -> Result<AgentResponse, AgentError> {
        let action_groups: Vec<ActionGroupSpec> = self
            .options
            .action_groups
            .iter()
            .filter(|group| creation.action_group_names.contains(&group.name))
            .cloned()
            .collect();
        let knowledge_bases: Vec<KnowledgeBaseSpec> = self
            .options
            .knowledge_bases
            .iter()
            .filter(|kb| creation.knowledge_bases.contains(&kb.knowledge_base_id))
            .cloned()
            .collect();

        let group_names: Vec<&str> = action_groups.iter().map(|g| g.name.as_str()).collect();
        let kb_ids: Vec<&str> = knowledge_bases
            .iter()
            .map(|kb| kb.knowledge_base_id.as_str())
            .collect();
        info!(
            action_groups = ?group_names,
            knowledge_bases = ?kb_ids,
            "Creating inline agent"
        );
        let metadata_groups = json!(group_names);
        let metadata_kbs = json!(kb_ids);

        let text = self
            .inline_agent
            .invoke_inline_agent(InlineAgentInvocation {
                session_id: request.session_id.clone(),
                input_text: creation.user_request,
                instruction: creation.description,
                foundation_model: self.options.foundation_model.clone(),
                action_groups,
                knowledge_bases,
                enable_trace: self.options.enable_trace,
            })
            .await?;

        Ok(AgentResponse::text(text)
            .with_metadata("actionGroups", metadata_groups)
            .with_metadata("knowledgeBases", metadata_kbs))
    }
}

#[async_trait]
impl Agent for BedrockInlineAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn process_request(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        async move {
            let messages = conversation_messages(&request.chat_history, &request.text);

            let reply = self
                .converse
                .converse(ConverseRequest {
                    model_id: self.options.model_id.clone(),
                    system_prompt: self.system_prompt.clone(),
                    messages,
                    inference_config: self.options.inference_config.clone(),
                    tool: ToolDefinition {
                        name: INLINE_AGENT_TOOL_NAME.to_string(),
                        description: "Create an inline agent with a list of action groups and knowledge bases"
                            .to_string(),
                        input_schema: inline_agent_tool_schema(),
                    },
                })
                .await?;

            match reply {
                ConverseReply::Text(text) => {
                    debug!("Model answered without creating an inline agent");
                    Ok(AgentResponse::text(text))
                }
                ConverseReply::ToolUse { name, input } if name == INLINE_AGENT_TOOL_NAME => {
                    let creation: InlineAgentCreation = serde_json::from_value(input)
                        .map_err(|e| DecodingError::InvalidToolInput(e.to_string()))?;
                    self.create_inline_agent(request, creation).await
                }
                ConverseReply::ToolUse { name, .. } => Err(DecodingError::UnexpectedTool(name).into()),
            }
        }
        .instrument(self.span.clone())
        .await
    }
}
