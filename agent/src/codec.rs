/// Bedrock Flows 向けのペイロード変換（エンコーダー/デコーダー）
///
/// エンコーダーとデコーダーは1つの `FlowCodec` として組で指定する。
/// 片方だけを差し替えることはできず、既定の挙動を再利用したい場合は
/// `DefaultFlowCodec` の関数を明示的に呼び出す。
use crate::error::{DecodingError, EncodingError, shape_name};
use crate::types::{AgentIdentity, AgentResponse, RequestContext};
use serde_json::Value;

/// 送信先サービスに渡すことが検証済みのペイロード
///
/// 文字列・数値・真偽値・オブジェクト・配列のいずれかであることが保証される。
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalPayload(Value);

impl ExternalPayload {
    /// エンコーダーの出力を検証する
    ///
    /// # Errors
    /// 値が null の場合は `EncodingError::UnsupportedShape`
    pub fn validate(agent: &AgentIdentity, value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::String(_)
            | Value::Number(_)
            | Value::Bool(_)
            | Value::Object(_)
            | Value::Array(_) => Ok(Self(value)),
            Value::Null => Err(EncodingError::UnsupportedShape {
                agent: agent.name.clone(),
                shape: shape_name(&value),
            }),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// フローから返された生の出力
#[derive(Debug, Clone, PartialEq)]
pub struct FlowOutput {
    /// 出力を生成したノード名
    pub node_name: String,
    /// フロー実行ID（サービスが返した場合のみ）
    pub execution_id: Option<String>,
    /// 出力ドキュメント
    pub document: Value,
}

/// フローのペイロード変換を担うインターフェース
///
/// 両メソッドとも副作用を持たず、同じ入力に対して同じ出力を返すこと。
pub trait FlowCodec: Send + Sync {
    /// リクエストをフローの入力ドキュメントに変換する
    fn encode(&self, agent: &AgentIdentity, input_text: &str, context: &RequestContext<'_>)
    -> Value;

    /// フローの出力をエージェントのレスポンスに変換する
    fn decode(&self, output: &FlowOutput) -> Result<AgentResponse, DecodingError>;
}

/// 既定のコーデック
///
/// 入力テキストをそのまま文字列として送り、出力からテキストを取り出す。
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFlowCodec;

impl DefaultFlowCodec {
    pub fn encode_text(input_text: &str) -> Value {
        Value::String(input_text.to_string())
    }

    /// 出力ドキュメントからテキストを取り出す
    ///
    /// ドキュメントが文字列ならその値、オブジェクトなら `text` フィールドの値を返す。
    pub fn decode_text(output: &FlowOutput) -> Result<AgentResponse, DecodingError> {
        let text = match &output.document {
            Value::String(text) => text.clone(),
            Value::Object(fields) => match fields.get("text") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => {
                    return Err(DecodingError::WrongType {
                        field: "text",
                        expected: "string",
                        found: shape_name(other),
                    });
                }
                None => return Err(DecodingError::MissingField { field: "text" }),
            },
            other => {
                return Err(DecodingError::WrongType {
                    field: "document",
                    expected: "string or object",
                    found: shape_name(other),
                });
            }
        };

        let mut response = AgentResponse::text(text)
            .with_metadata("flowNodeName", Value::String(output.node_name.clone()));
        if let Some(execution_id) = &output.execution_id {
            response = response.with_metadata("flowExecutionId", Value::String(execution_id.clone()));
        }
        Ok(response)
    }
}

impl FlowCodec for DefaultFlowCodec {
    fn encode(
        &self,
        _agent: &AgentIdentity,
        input_text: &str,
        _context: &RequestContext<'_>,
    ) -> Value {
        Self::encode_text(input_text)
    }

    fn decode(&self, output: &FlowOutput) -> Result<AgentResponse, DecodingError> {
        Self::decode_text(output)
    }
}

/// クロージャの組から作るコーデック
pub struct FnFlowCodec<E, D> {
    encoder: E,
    decoder: D,
}

impl<E, D> FnFlowCodec<E, D>
where
    E: Fn(&AgentIdentity, &str, &RequestContext<'_>) -> Value + Send + Sync,
    D: Fn(&FlowOutput) -> Result<AgentResponse, DecodingError> + Send + Sync,
{
    pub fn new(encoder: E, decoder: D) -> Self {
        Self { encoder, decoder }
    }
}

impl<E, D> FlowCodec for FnFlowCodec<E, D>
where
    E: Fn(&AgentIdentity, &str, &RequestContext<'_>) -> Value + Send + Sync,
    D: Fn(&FlowOutput) -> Result<AgentResponse, DecodingError> + Send + Sync,
{
    fn encode(
        &self,
        agent: &AgentIdentity,
        input_text: &str,
        context: &RequestContext<'_>,
    ) -> Value {
        (self.encoder)(agent, input_text, context)
    }

    fn decode(&self, output: &FlowOutput) -> Result<AgentResponse, DecodingError> {
        (self.decoder)(output)
    }
}
