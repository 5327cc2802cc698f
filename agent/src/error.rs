/// エージェント層のエラー型
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("Encoding error: {0}")]
    EncodingError(#[from] EncodingError),

    #[error("Decoding error: {0}")]
    DecodingError(#[from] DecodingError),

    #[error("AWS SDK error: {0}")]
    AwsSdkError(String),

    #[error("Message building error: {0}")]
    MessageBuildError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// エンコーダーが送信先サービスで扱えない値を生成した場合のエラー
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("agent '{agent}' produced an unsupported payload shape: {shape}")]
    UnsupportedShape { agent: String, shape: &'static str },
}

/// サービスのレスポンスを正規化できなかった場合のエラー
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodingError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("field '{field}' has the wrong type: expected {expected}, found {found}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("service returned no output")]
    NoOutput,

    #[error("model requested unknown tool: {0}")]
    UnexpectedTool(String),

    #[error("invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("response is not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// JSON 値の型名を返す（エラーメッセージ用）
pub(crate) fn shape_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
