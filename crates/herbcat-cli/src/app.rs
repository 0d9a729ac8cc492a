//! Command handlers on top of the session core.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use herbcat_core::api::{ApiRequest, ReqwestTransport, Transport};
use herbcat_core::auth::{AuthError, EndReason, SessionEvent};
use herbcat_core::{ApiClient, Config, SessionManager};
use tracing::{debug, warn};

pub struct App {
    pub config: Config,
    session: SessionManager,
    api: ApiClient,
}

impl App {
    pub fn new() -> Result<Self> {
        let mut config = Config::load()?;
        config.apply_env();

        let transport: Arc<dyn Transport> = Arc::new(
            ReqwestTransport::new(config.request_timeout())
                .context("Failed to build HTTP client")?,
        );
        let store = config.credential_store()?;
        let session = SessionManager::new(config.session_config(), transport.clone(), store);
        let api = ApiClient::new(transport, session.clone(), &config.api_base_url)
            .with_timeout(config.request_timeout());

        Ok(Self {
            config,
            session,
            api,
        })
    }

    /// Pick up a remembered session, if any.
    pub async fn restore(&self) {
        match self.session.restore().await {
            Ok(state) => debug!(authenticated = state.is_authenticated, "Session restored"),
            Err(e) => warn!(error = %e, "Could not restore stored session"),
        }
    }

    pub async fn login_interactive(&mut self, remember: bool) -> Result<()> {
        println!("\n=== herbcat login ===\n");

        let email = match std::env::var("HERBCAT_EMAIL") {
            Ok(email) if !email.is_empty() => email,
            _ => self.prompt_email().await?,
        };
        let password = match std::env::var("HERBCAT_PASSWORD") {
            Ok(password) if !password.is_empty() => password,
            _ => prompt_password().await?,
        };

        println!("\nAuthenticating...");
        let credential = self
            .session
            .login(&email, &password, remember)
            .await
            .map_err(describe)?;

        self.config.last_email = Some(email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }

        println!("Signed in as {} ({})\n", credential.username, credential.role);
        Ok(())
    }

    pub async fn register_interactive(&mut self) -> Result<()> {
        println!("\n=== herbcat registration ===\n");

        let username = prompt("Username: ").await?;
        let email = self.prompt_email().await?;
        let password = prompt_password().await?;

        let credential = self
            .session
            .register(&username, &email, &password)
            .await
            .map_err(describe)?;

        self.config.last_email = Some(email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }

        println!("Welcome, {}!\n", credential.username);
        Ok(())
    }

    pub async fn logout(&self) {
        self.session.logout().await;
        println!("Signed out.");
    }

    pub fn print_status(&self) {
        let state = self.session.get_auth_state();
        if state.is_authenticated {
            println!(
                "Signed in as {} ({})",
                state.username.unwrap_or_default(),
                state.role.unwrap_or_default()
            );
            if let Some(credential) = self.session.current_credential() {
                println!("Session expires at {}", credential.expires_at.to_rfc3339());
            }
        } else {
            println!("Not signed in.");
        }
    }

    /// GET a catalog path and pretty-print the JSON body.
    pub async fn get(&self, path: &str) -> Result<()> {
        let response = self
            .api
            .send(ApiRequest::get(path))
            .await
            .with_context(|| format!("Failed to fetch {}", path))?;

        if !response.is_success() {
            return Err(anyhow::anyhow!(
                "{} returned status {}: {}",
                path,
                response.status,
                response.body
            ));
        }

        match serde_json::from_str::<serde_json::Value>(&response.body) {
            Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
            Err(_) => println!("{}", response.body),
        }
        Ok(())
    }

    /// Line-oriented session. Ephemeral logins last until `quit`.
    pub async fn shell(&mut self) -> Result<()> {
        let mut events = self.session.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::Ended(EndReason::RefreshFailed) => {
                        eprintln!("\n[session could not be refreshed - please log in again]");
                    }
                    SessionEvent::Ended(EndReason::Expired) => {
                        eprintln!("\n[session expired - please log in again]");
                    }
                    SessionEvent::Refreshed => debug!("Session refreshed in background"),
                    _ => {}
                }
            }
        });

        println!("herbcat shell - commands: login [--remember], register, status, get <path>, logout, quit");
        loop {
            let line = prompt("herbcat> ").await?;
            let mut words = line.split_whitespace();
            let result = match words.next() {
                None => continue,
                Some("quit") | Some("exit") => break,
                Some("login") => {
                    let remember = words.any(|w| w == "--remember" || w == "-r");
                    self.login_interactive(remember).await
                }
                Some("register") => self.register_interactive().await,
                Some("logout") => {
                    self.logout().await;
                    Ok(())
                }
                Some("status") => {
                    self.print_status();
                    Ok(())
                }
                Some("get") => match words.next() {
                    Some(path) => self.get(path).await,
                    None => Err(anyhow::anyhow!("usage: get <path>")),
                },
                Some(other) => Err(anyhow::anyhow!("unknown command `{}`", other)),
            };
            if let Err(e) = result {
                eprintln!("Error: {:#}", e);
            }
        }
        Ok(())
    }

    async fn prompt_email(&self) -> Result<String> {
        match self.config.last_email {
            Some(ref last) => {
                let input = prompt(&format!("Email [{}]: ", last)).await?;
                Ok(if input.is_empty() { last.clone() } else { input })
            }
            None => prompt("Email: ").await,
        }
    }
}

/// Turn an auth failure into something worth showing on a terminal.
fn describe(e: AuthError) -> anyhow::Error {
    if !e.is_user_facing() {
        // Not the user's input; keep the cause chain for `{:#}`
        return anyhow::Error::new(e).context("Could not complete sign-in");
    }
    match e {
        AuthError::Server { payload, .. } => {
            // Servers usually send {"message": "..."}; fall back to the raw body
            let message = serde_json::from_str::<serde_json::Value>(&payload)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("error"))
                        .and_then(|m| m.as_str().map(str::to_string))
                })
                .unwrap_or(payload);
            anyhow::anyhow!("{}", message)
        }
        other => anyhow::Error::new(other),
    }
}

/// Terminal reads block, so they run off the async workers where the
/// refresh timer lives.
async fn prompt(label: &str) -> Result<String> {
    let label = label.to_string();
    tokio::task::spawn_blocking(move || -> Result<String> {
        print!("{}", label);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().lock().read_line(&mut input)?;
        Ok(input.trim().to_string())
    })
    .await?
}

async fn prompt_password() -> Result<String> {
    let password =
        tokio::task::spawn_blocking(|| rpassword::prompt_password("Password: ")).await??;
    Ok(password)
}
