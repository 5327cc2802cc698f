pub mod agent;
pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod flows;
pub mod inline;
pub mod lex;
pub mod types;

pub use agent::{Agent, load_sdk_config};
pub use codec::{DefaultFlowCodec, ExternalPayload, FlowCodec, FlowOutput, FnFlowCodec};
pub use config::{AgentConfig, AgentsConfig};
pub use error::{AgentError, DecodingError, EncodingError};
pub use flows::{BedrockFlowsAgent, BedrockFlowsAgentOptions, FlowTransport};
pub use inline::{
    BedrockInlineAgent, BedrockInlineAgentOptions, ConverseRuntime, InlineAgentRuntime,
};
pub use lex::{LexBotAgent, LexBotAgentOptions, LexRuntime};
pub use types::{AgentIdentity, AgentRequest, AgentResponse, ChatMessage, RequestContext, Role};
