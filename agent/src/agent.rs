use crate::error::AgentError;
use crate::types::{AgentIdentity, AgentRequest, AgentResponse};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{self, BehaviorVersion, SdkConfig};

/// リージョンが解決できなかった場合に使用するリージョン
pub const DEFAULT_REGION: &str = "us-east-1";

/// オーケストレーターから呼び出されるエージェントのインターフェース
///
/// 実装は `&self` のみを受け取り、呼び出し間で可変状態を共有しない。
/// そのため同一インスタンスへの並行呼び出しは安全。
#[async_trait]
pub trait Agent: Send + Sync {
    /// エージェントの名前と説明
    fn identity(&self) -> &AgentIdentity;

    /// リクエストを処理し、正規化されたレスポンスを返す
    async fn process_request(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// AWS SDK の共通設定を読み込む
///
/// # Arguments
/// * `profile` - 使用する AWS プロファイル名（オプション）
/// * `region` - リージョン（オプション）。指定しない場合はデフォルトプロファイルの設定またはus-east-1を使用
pub async fn load_sdk_config(profile: Option<&str>, region: Option<String>) -> SdkConfig {
    let region_provider = RegionProviderChain::first_try(region.map(aws_config::Region::new))
        .or_default_provider()
        .or_else(aws_config::Region::new(DEFAULT_REGION));

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }

    loader.load().await
}

/// 必須の設定項目が空でないことを確認する
pub(crate) fn require(field: &str, value: &str) -> Result<(), AgentError> {
    if value.trim().is_empty() {
        Err(AgentError::ConfigError(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}
