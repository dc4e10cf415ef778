use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;

use portal_client::accounts::AccountDirectory;
use portal_client::auth::{self, InitOutcome, RegisterRequest, SessionEvent, SessionManager};
use portal_client::chatbot::{ChatbotClient, Conversation};
use portal_client::config::{Command, Config};
use portal_client::gemini::{GeminiClient, InstructorChat};
use portal_client::http_client::ApiClient;
use portal_client::interceptor::{InterceptedClient, InterceptorPolicy, REFRESH_PATH};
use portal_client::storage::{FileStorage, LocalStorage, MemoryStorage};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(api_url = %config.api_url, "Configuration loaded");

    let storage: Arc<dyn LocalStorage> = match config.storage_file {
        Some(ref path) => Arc::new(FileStorage::open(path)?),
        None => Arc::new(MemoryStorage::new()),
    };

    let api = Arc::new(ApiClient::new(
        &config.api_url,
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?);
    let policy = InterceptorPolicy::new(REFRESH_PATH, config.exempt_paths.clone());
    let http = Arc::new(InterceptedClient::new(api, policy, storage.clone()));
    let session = SessionManager::new(http, storage, config.refresh_lead_secs);

    // Restore the stored session before doing anything else
    let outcome = auth::initialize(&session).await;
    tracing::debug!(?outcome, "Startup initializer finished");

    if let Err(e) = run(&config, command, session, outcome).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(
    config: &Config,
    command: Command,
    session: Arc<SessionManager>,
    outcome: InitOutcome,
) -> Result<()> {
    match command {
        Command::Login {
            email,
            password,
            stay,
        } => {
            let password = match password {
                Some(p) => p,
                None => Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            let account = session
                .login(&email, &password)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Signed in as {} ({})", account.email, account.id);
            print_schedule(&session);

            if stay {
                keep_alive(&session).await;
            }
        }

        Command::Refresh => {
            if outcome == InitOutcome::Refreshed {
                println!("Session refreshed");
            } else {
                let account = session
                    .refresh_token()
                    .await
                    .map_err(|e| anyhow::anyhow!(e.user_message()))?;
                println!("Session refreshed for {}", account.email);
            }
            print_schedule(&session);
        }

        Command::Logout => {
            session
                .logout_and_wait(std::time::Duration::from_secs(config.http_request_timeout))
                .await;
            println!("Signed out");
        }

        Command::Whoami => match session.current_identity() {
            Some(account) => {
                println!("{}", serde_json::to_string_pretty(&account)?);
                print_schedule(&session);
            }
            None => println!("Not signed in"),
        },

        Command::Chat { message } => {
            let mut conversation = Conversation::new(ChatbotClient::new(session.clone()));
            if let Err(e) = conversation.load_history().await {
                tracing::warn!("Error loading chat history: {}", e);
            }
            let reply = conversation
                .send(&message)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("{}", reply.message);
        }

        Command::History { limit } => {
            let history = ChatbotClient::new(session.clone())
                .history(limit)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            for msg in history {
                println!(
                    "[{}] {:?}: {}",
                    msg.timestamp.format("%Y-%m-%d %H:%M"),
                    msg.role,
                    msg.message
                );
            }
        }

        Command::ClearHistory => {
            ChatbotClient::new(session.clone())
                .clear_history()
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Chat history cleared");
        }

        Command::Register {
            email,
            title,
            first_name,
            last_name,
        } => {
            let password: String = Password::new()
                .with_prompt("Password")
                .with_confirmation("Confirm password", "Passwords do not match")
                .interact()
                .context("Failed to read password")?;
            let accept: String = Input::new()
                .with_prompt("Accept terms and conditions? (yes/no)")
                .default("no".to_string())
                .interact_text()
                .context("Failed to read confirmation")?;

            let request = RegisterRequest {
                title,
                first_name,
                last_name,
                email,
                confirm_password: password.clone(),
                password,
                accept_terms: accept.eq_ignore_ascii_case("yes"),
            };
            AccountDirectory::new(session.clone())
                .register(&request)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Registration successful, please check your email for verification instructions");
        }

        Command::Ask { message } => {
            let api_key = config
                .gemini_api_key
                .clone()
                .context("GEMINI_API_KEY is not set")?;
            let api = ApiClient::new(
                &config.gemini_api_url,
                config.http_connect_timeout,
                config.http_request_timeout,
                config.http_max_retries,
            )?;
            let mut chat = InstructorChat::new(GeminiClient::new(api, api_key, &config.gemini_model));
            let reply = chat
                .send(&message)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("{}", reply);
        }

        Command::ForgotPassword { email } => {
            AccountDirectory::new(session.clone())
                .forgot_password(&email)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Please check your email for password reset instructions");
        }
    }

    Ok(())
}

fn print_schedule(session: &SessionManager) {
    if let auth::SchedulerState::Scheduled { refresh_at } = session.scheduled_refresh() {
        println!("Next refresh at {}", refresh_at.to_rfc3339());
    }
}

/// Stay up, letting the refresh timer run, until the session ends or Ctrl+C
async fn keep_alive(session: &SessionManager) {
    let mut events = session.events();
    tracing::info!("Keeping session alive, press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal, exiting");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Refreshed { account_id }) => {
                    tracing::info!(account_id = %account_id, "Session refreshed");
                }
                Ok(SessionEvent::Expired) | Ok(SessionEvent::LoggedOut { .. }) => {
                    println!("Session ended");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Session event stream closed: {}", e);
                    break;
                }
            }
        }
    }
}
