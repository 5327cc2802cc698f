/// Amazon Lex V2 ボットに発話を転送するエージェント
use crate::agent::{Agent, load_sdk_config, require};
use crate::error::AgentError;
use crate::types::{AgentIdentity, AgentRequest, AgentResponse};
use async_trait::async_trait;
use aws_sdk_lexruntimev2::Client;
use aws_sdk_lexruntimev2::types::SessionState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, debug};

/// LexBotAgent の設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LexBotAgentOptions {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub bot_id: String,
    pub bot_alias_id: String,
    pub locale_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl LexBotAgentOptions {
    pub fn validate(&self) -> Result<(), AgentError> {
        require("name", &self.name)?;
        require("bot_id", &self.bot_id)?;
        require("bot_alias_id", &self.bot_alias_id)?;
        require("locale_id", &self.locale_id)
    }
}

/// RecognizeText に渡すパラメータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizeTextRequest {
    pub bot_id: String,
    pub bot_alias_id: String,
    pub locale_id: String,
    pub session_id: String,
    pub text: String,
}

/// RecognizeText の結果のうちエージェントが使用する部分
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LexRecognition {
    /// ボットが返したメッセージの本文（本文のないメッセージは含まない）
    pub messages: Vec<String>,
    pub intent_name: Option<String>,
    pub intent_state: Option<String>,
}

/// Lex V2 ランタイムとの通信を抽象化するトレイト
#[async_trait]
pub trait LexRuntime: Send + Sync {
    async fn recognize_text(&self, request: RecognizeTextRequest)
    -> Result<LexRecognition, AgentError>;
}

/// AWS SDK を使用した LexRuntime の実装
pub struct AwsLexRuntime {
    client: Client,
}

impl AwsLexRuntime {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

#[async_trait]
impl LexRuntime for AwsLexRuntime {
    async fn recognize_text(
        &self,
        request: RecognizeTextRequest,
    ) -> Result<LexRecognition, AgentError> {
        let output = self
            .client
            .recognize_text()
            .bot_id(request.bot_id)
            .bot_alias_id(request.bot_alias_id)
            .locale_id(request.locale_id)
            .session_id(request.session_id)
            .text(request.text)
            .session_state(SessionState::builder().build())
            .send()
            .await
            .map_err(|e| AgentError::AwsSdkError(e.to_string()))?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| message.content)
            .filter(|content| !content.is_empty())
            .collect();

        let intent = output.session_state.and_then(|state| state.intent);

        Ok(LexRecognition {
            messages,
            intent_name: intent.as_ref().map(|intent| intent.name.clone()),
            intent_state: intent
                .as_ref()
                .and_then(|intent| intent.state.as_ref())
                .map(|state| state.as_str().to_string()),
        })
    }
}

/// Lex V2 ボットエージェント
pub struct LexBotAgent {
    identity: AgentIdentity,
    options: LexBotAgentOptions,
    runtime: Arc<dyn LexRuntime>,
    span: tracing::Span,
}

impl LexBotAgent {
    /// AWS の認証情報を読み込んで新しい LexBotAgent を作成する
    ///
    /// # Arguments
    /// * `options` - エージェントの設定
    /// * `profile` - 使用する AWS プロファイル名（オプション）
    pub async fn new(options: LexBotAgentOptions, profile: Option<&str>) -> Result<Self, AgentError> {
        options.validate()?;
        let config = load_sdk_config(profile, options.region.clone()).await;
        Self::with_runtime(options, Arc::new(AwsLexRuntime::new(&config)))
    }

    /// 任意のランタイムを使用して LexBotAgent を作成する
    pub fn with_runtime(
        options: LexBotAgentOptions,
        runtime: Arc<dyn LexRuntime>,
    ) -> Result<Self, AgentError> {
        options.validate()?;
        let identity = AgentIdentity::new(&options.name, &options.description);
        let span = tracing::info_span!("lex_bot_agent", agent = %options.name);
        Ok(Self {
            identity,
            options,
            runtime,
            span,
        })
    }

    /// ログ出力に使用する span を差し替える
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn options(&self) -> &LexBotAgentOptions {
        &self.options
    }
}

#[async_trait]
impl Agent for LexBotAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn process_request(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let recognize = RecognizeTextRequest {
            bot_id: self.options.bot_id.clone(),
            bot_alias_id: self.options.bot_alias_id.clone(),
            locale_id: self.options.locale_id.clone(),
            session_id: request.session_id.clone(),
            text: request.text.clone(),
        };

        async move {
            debug!(session_id = %recognize.session_id, "Sending text to Lex bot");
            let recognition = self.runtime.recognize_text(recognize).await?;
            debug!(
                messages = recognition.messages.len(),
                intent = ?recognition.intent_name,
                "Lex bot responded"
            );

            let mut response = AgentResponse::text(recognition.messages.join(" "));
            if let Some(name) = recognition.intent_name {
                response = response.with_metadata("intentName", Value::String(name));
            }
            if let Some(state) = recognition.intent_state {
                response = response.with_metadata("intentState", Value::String(state));
            }
            Ok(response)
        }
        .instrument(self.span.clone())
        .await
    }
}
