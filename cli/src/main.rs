use anyhow::{Context, anyhow};
use aws_agent::{Agent, AgentRequest, AgentsConfig, ChatMessage};
use clap::{Parser, Subcommand};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

// UI関連の設定
const USER_NAME: &str = "User";
const LOADING_ANIMATION_INTERVAL: u64 = 200;
const LOADING_ANIMATION_CHARACTER: &str = ".";
// ローディングアニメーションをクリアするためのスペース文字列
const CLEAR_LINE_SPACES: &str = "                                     "; // 37 spaces

// CLIの引数構造体定義
#[derive(Parser)]
#[command(name = "aws-agent-cli")]
#[command(about = "Talk to Lex bots, Bedrock Flows and Bedrock inline agents", long_about = None)]
struct Cli {
    /// 設定ファイルのパス (オプション: デフォルトは .aws-agent/agents.json または agents.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 設定されているエージェントの一覧を表示します
    List,

    /// エージェントと対話します
    Run {
        /// 使用するエージェント名
        #[arg(long)]
        agent: String,

        /// 使用するAWSプロファイル名
        #[arg(long)]
        aws_profile: Option<String>,

        /// リクエストに付与するユーザーID
        #[arg(long, default_value = "cli-user")]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // 引数の解析
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::List => {
            for name in config.agent_names() {
                if let Some(agent) = config.get_agent(name) {
                    println!("{:<24} {:<16} {}", name, agent.kind(), agent.description());
                }
            }
        }
        Commands::Run {
            agent,
            aws_profile,
            user_id,
        } => {
            let agent_config = config
                .get_agent(&agent)
                .ok_or_else(|| anyhow!("agent '{}' is not defined in the config", agent))?;
            let agent = agent_config.build(aws_profile.as_deref()).await?;
            run_agent_cli(agent, user_id).await?;
        }
    }

    Ok(())
}

/// 設定ファイルを読み込む
fn load_config(path: Option<PathBuf>) -> anyhow::Result<AgentsConfig> {
    match path {
        Some(path) => AgentsConfig::load_from_file(&path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => AgentsConfig::load_default()?
            .ok_or_else(|| anyhow!("no agents.json found; pass --config <path>")),
    }
}

/// CLI対話型エージェントを実行する
///
/// 会話履歴は CLI 側で保持し、成功したやり取りのみ履歴に追加する。
async fn run_agent_cli(agent: Box<dyn Agent>, user_id: String) -> anyhow::Result<()> {
    let identity = agent.identity().clone();
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut history: Vec<ChatMessage> = Vec::new();

    // rustylineエディタの初期化（UI層）
    let mut rl = DefaultEditor::new()?;

    println!("Agent: {} ({})", identity.name, identity.description);
    println!("Session: {}", session_id);
    println!("+--------------------------------------------------+");
    println!("| Agent Started. Type 'exit' or 'quit' to stop.    |");
    println!("+--------------------------------------------------+");

    loop {
        // ユーザー入力の受け付け
        let readline = rl.readline(&format!("{} > ", USER_NAME));
        match readline {
            Ok(line) => {
                let input = line.trim();

                // 空入力はスキップ
                if input.is_empty() {
                    continue;
                }

                // 終了コマンドの処理
                if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                    break;
                }

                let _ = rl.add_history_entry(input);

                print!("{} > ", identity.name);
                std::io::stdout().flush()?;

                // ローディングアニメーション開始
                let loading_task = tokio::spawn(async {
                    loop {
                        sleep(Duration::from_millis(LOADING_ANIMATION_INTERVAL)).await;
                        print!("{}", LOADING_ANIMATION_CHARACTER);
                        if std::io::stdout().flush().is_err() {
                            break;
                        }
                    }
                });

                let request = AgentRequest::new(input, user_id.as_str(), session_id.as_str())
                    .with_chat_history(history.clone());
                let result = agent.process_request(&request).await;

                loading_task.abort();
                clear_loading_animation(&identity.name);

                match result {
                    Ok(response) => {
                        println!("{}", response.text);
                        if !response.metadata.is_empty() {
                            tracing::info!(
                                metadata = %serde_json::to_string(&response.metadata)?,
                                "Response metadata"
                            );
                        }
                        history.push(ChatMessage::user(input));
                        history.push(ChatMessage::assistant(response.text));
                    }
                    Err(e) => {
                        println!("\n[Error] {} failed: {}", identity.name, e);
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// ローディングアニメーションをクリアしてカーソルを戻す
fn clear_loading_animation(agent_name: &str) {
    print!(
        "\r{} > {}\r{} > ",
        agent_name, CLEAR_LINE_SPACES, agent_name
    );
    let _ = std::io::stdout().flush();
}
