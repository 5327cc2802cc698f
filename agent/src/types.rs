/// オーケストレーターとエージェント間で受け渡す正規化済みの型定義
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// 会話の発話者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 会話履歴の1メッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// エージェントの識別情報（名前と説明）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub description: String,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// 1回の呼び出しでエージェントに渡されるリクエスト
///
/// 呼び出し中は不変として扱われ、エージェントには参照で渡される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub text: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl AgentRequest {
    pub fn new(
        text: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            chat_history: Vec::new(),
            extra: HashMap::new(),
        }
    }

    pub fn with_chat_history(mut self, chat_history: Vec<ChatMessage>) -> Self {
        self.chat_history = chat_history;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// エンコーダーに渡すコンテキストを取得する
    pub fn context(&self) -> RequestContext<'_> {
        RequestContext {
            user_id: &self.user_id,
            session_id: &self.session_id,
            chat_history: &self.chat_history,
            extra: &self.extra,
        }
    }
}

/// エンコーダーから参照されるリクエストのコンテキスト
///
/// 借用のみを保持するため、エンコーダーはコンテキストを変更できない。
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub chat_history: &'a [ChatMessage],
    pub extra: &'a HashMap<String, Value>,
}

/// エージェントからオーケストレーターへ返す正規化済みレスポンス
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl AgentResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
