/// agents.json 設定ファイルの構造体定義
///
/// エージェント名をキーとして、各エージェントの種類と設定を記述する。
use crate::agent::Agent;
use crate::error::AgentError;
use crate::flows::{BedrockFlowsAgent, BedrockFlowsAgentOptions};
use crate::inline::{BedrockInlineAgent, BedrockInlineAgentOptions};
use crate::lex::{LexBotAgent, LexBotAgentOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// agents.json ファイルのルート構造
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// 全エージェントで共通のリージョン（オプション）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// エージェントの設定マップ
    pub agents: HashMap<String, AgentConfig>,
}

/// エージェント1つ分の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentConfig {
    LexBot(LexBotAgentOptions),
    BedrockFlows(BedrockFlowsAgentOptions),
    BedrockInline(BedrockInlineAgentOptions),
}

impl AgentConfig {
    /// エージェントの種類を表す文字列
    pub fn kind(&self) -> &'static str {
        match self {
            AgentConfig::LexBot(_) => "lex-bot",
            AgentConfig::BedrockFlows(_) => "bedrock-flows",
            AgentConfig::BedrockInline(_) => "bedrock-inline",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            AgentConfig::LexBot(options) => &options.description,
            AgentConfig::BedrockFlows(options) => &options.description,
            AgentConfig::BedrockInline(options) => &options.description,
        }
    }

    /// 名前とリージョンの既定値を補完する
    ///
    /// 設定ファイル内で名前が省略された場合はマップのキーを、
    /// リージョンが省略された場合はファイル全体の設定を使用する。
    fn with_defaults(mut self, name: &str, region: Option<&String>) -> Self {
        let (option_name, option_region) = match &mut self {
            AgentConfig::LexBot(options) => (&mut options.name, &mut options.region),
            AgentConfig::BedrockFlows(options) => (&mut options.name, &mut options.region),
            AgentConfig::BedrockInline(options) => (&mut options.name, &mut options.region),
        };
        if option_name.is_empty() {
            *option_name = name.to_string();
        }
        if option_region.is_none() {
            *option_region = region.cloned();
        }
        self
    }

    /// 設定からエージェントを生成する
    ///
    /// # Arguments
    /// * `profile` - 使用する AWS プロファイル名（オプション）
    pub async fn build(self, profile: Option<&str>) -> Result<Box<dyn Agent>, AgentError> {
        let agent: Box<dyn Agent> = match self {
            AgentConfig::LexBot(options) => Box::new(LexBotAgent::new(options, profile).await?),
            AgentConfig::BedrockFlows(options) => {
                Box::new(BedrockFlowsAgent::new(options, profile).await?)
            }
            AgentConfig::BedrockInline(options) => {
                Box::new(BedrockInlineAgent::new(options, profile).await?)
            }
        };
        Ok(agent)
    }
}

impl AgentsConfig {
    /// agents.jsonファイルを読み込む
    ///
    /// # Errors
    /// ファイルの読み込みやパースに失敗した場合
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            AgentError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, AgentError> {
        serde_json::from_str(content)
            .map_err(|e| AgentError::ConfigError(format!("Failed to parse agents.json: {}", e)))
    }

    /// デフォルトの設定ファイルパスを取得
    ///
    /// 以下の順序で検索：
    /// 1. `.aws-agent/agents.json`
    /// 2. `agents.json`（カレントディレクトリ）
    pub fn default_path() -> Option<PathBuf> {
        let dot_path = PathBuf::from(".aws-agent/agents.json");
        if dot_path.exists() {
            return Some(dot_path);
        }

        let current_path = PathBuf::from("agents.json");
        if current_path.exists() {
            return Some(current_path);
        }

        None
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// # Returns
    /// 設定が見つかった場合はSome(config)、見つからない場合はNone
    pub fn load_default() -> Result<Option<Self>, AgentError> {
        match Self::default_path() {
            Some(path) => Ok(Some(Self::load_from_file(path)?)),
            None => Ok(None),
        }
    }

    /// エージェント名のリストを取得（名前順）
    pub fn agent_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.agents.keys().collect();
        names.sort();
        names
    }

    /// 特定のエージェント設定を取得
    ///
    /// 名前とリージョンの既定値は補完済みの状態で返す。
    pub fn get_agent(&self, name: &str) -> Option<AgentConfig> {
        self.agents
            .get(name)
            .cloned()
            .map(|config| config.with_defaults(name, self.region.as_ref()))
    }
}
