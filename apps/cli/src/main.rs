use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use cinemaai_core_sdk::{
    config::Settings,
    credentials::{self, CredentialResolver},
    db,
    error::CompletionError,
    llm::{CompletionClient, StreamSink},
    models::CompletionRequest,
    proxy::{self, ProxyState},
    secret::SecretCodec,
    server, telemetry,
};

/**
 * \brief CinemaAI Studio 命令行入口。
 */
#[derive(Parser, Debug)]
#[command(name = "cinemaai", version, about = "CinemaAI Studio completion toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief 管理用户绑定的 API 密钥。 */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 发起一次补全。
     * \param owner  用户标识，提供时优先使用其绑定的密钥
     * \param stream 是否逐段输出
     */
    Complete {
        #[arg(long, default_value = "")]
        system: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value_t = false)]
        stream: bool,
    },

    /** \brief 启动 Studio 本地 HTTP 服务。 */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /** \brief 启动 AI 代理函数。 */
    Proxy {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },

    /** \brief 开关本地遥测文件。 */
    Telemetry {
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /** \brief 校验并保存密钥。 */
    Set {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        provider: Option<String>,
    },
    /** \brief 解绑密钥。 */
    Unset {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        provider: Option<String>,
    },
    /** \brief 列出已绑定的 Provider。 */
    List {
        #[arg(long)]
        owner: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

/**
 * \brief 将增量直接写到终端。
 */
struct StdoutSink;

impl StreamSink for StdoutSink {
    fn on_delta(&mut self, delta: &str) {
        print!("{}", delta);
        std::io::stdout().flush().ok();
    }

    fn on_complete(&mut self) {
        println!();
    }

    fn on_error(&mut self, error: &CompletionError) {
        println!();
        eprintln!("{}", error.user_message());
    }
}

fn build_client(settings: Settings, owner: Option<String>) -> Result<CompletionClient> {
    let codec = SecretCodec::from_config(settings.secret_key.as_deref())
        .context("invalid CINEMAAI_SECRET_KEY")?;
    let resolver = CredentialResolver::new(&settings.db_path, codec)
        .with_cached_key(settings.cached_key.clone())
        .with_owner(owner);
    CompletionClient::new(settings, resolver)
}

/**
 * \brief 子命令是否需要本地数据库；代理函数不做任何持久化。
 */
fn uses_store(command: &Commands) -> bool {
    !matches!(command, Commands::Proxy { .. })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init();
    let cli = Cli::parse();
    let settings = Settings::from_env();
    telemetry::set_log_dir(&settings.log_dir);

    if uses_store(&cli.command) {
        let conn = db::open_migrated(&settings.db_path).context("open database failed")?;
        telemetry::set_enabled(db::get_telemetry_enabled(&conn).unwrap_or(false));
    }

    match cli.command {
        Commands::Key { action } => match action {
            KeyAction::Set {
                owner,
                api_key,
                provider,
            } => {
                if let Some(p) = provider.as_deref() {
                    anyhow::ensure!(p == settings.provider, "unsupported provider: {}", p);
                }
                let client = build_client(settings, None)?;
                match credentials::bind_credential(&client, &owner, &api_key).await {
                    Ok(id) => println!(
                        "Saved key id={} (owner={} | provider={})",
                        id,
                        owner,
                        client.settings().provider
                    ),
                    Err(credentials::BindError::Validation(e)) => {
                        anyhow::bail!("{}", e.user_message())
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            KeyAction::Unset { owner, provider } => {
                let provider = provider.unwrap_or_else(|| settings.provider.clone());
                let removed = credentials::unbind_credential(&settings.db_path, &owner, &provider)?;
                if removed {
                    println!("Removed key (owner={} | provider={})", owner, provider);
                } else {
                    println!("No key bound for owner={} provider={}", owner, provider);
                }
            }
            KeyAction::List { owner } => {
                let listed = credentials::list_credentials(&settings.db_path, &owner)?;
                if listed.is_empty() {
                    println!("No keys bound for owner={}", owner);
                }
                for c in listed {
                    println!("{}\tcreated={}\tupdated={}", c.provider, c.created_at, c.updated_at);
                }
            }
        },
        Commands::Complete {
            system,
            user,
            owner,
            stream,
        } => {
            let client = build_client(settings, owner)?;
            let mut request = CompletionRequest::new(system, user);
            if stream {
                request = request.streaming();
            }
            telemetry::log_event(
                "cli.complete",
                &format!("stream={} user_len={}", stream, request.user_prompt.len()),
            );
            if client.execute(&request, &mut StdoutSink).await.is_err() {
                std::process::exit(1);
            }
        }
        Commands::Serve { addr } => {
            server::run(&addr, settings).await?;
        }
        Commands::Proxy { addr } => {
            let state = ProxyState::from_settings(&settings)?;
            proxy::serve(&addr, state).await?;
        }
        Commands::Telemetry { state } => {
            let enabled = matches!(state, Switch::On);
            let conn = db::open_migrated(&settings.db_path).context("open database failed")?;
            db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
            telemetry::set_enabled(enabled);
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    Ok(())
}
