//! herbcat - a terminal client for the herbcat catalog API.
//!
//! Signs in against the identity server, keeps the session fresh in the
//! background, and issues authenticated catalog requests.

mod app;

use std::io;

use anyhow::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;

const USAGE: &str = "\
Usage: herbcat <command>

Commands:
  login [--remember]   Sign in (durable session with --remember)
  register             Create an account and sign in
  logout               Sign out and forget the stored session
  status               Show who is signed in
  get <path>           GET a catalog path, e.g. /products
  shell                Interactive session (login, get, status, logout, quit)";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, plus `herbcat.log` in the cache directory when
/// `HERBCAT_LOG_FILE` is set. The returned guard flushes the file on drop.
fn init_tracing(cache_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match (std::env::var_os("HERBCAT_LOG_FILE"), cache_dir) {
        (Some(_), Some(dir)) => {
            let appender = tracing_appender::rolling::never(dir, "herbcat.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut app = App::new()?;
    let cache_dir = app.config.cache_dir().ok();
    let _log_guard = init_tracing(cache_dir.as_deref());
    info!(command, "herbcat starting");

    app.restore().await;

    match command {
        "login" => {
            let remember = args.iter().any(|a| a == "--remember" || a == "-r");
            app.login_interactive(remember).await
        }
        "register" => app.register_interactive().await,
        "logout" => {
            app.logout().await;
            Ok(())
        }
        "status" => {
            app.print_status();
            Ok(())
        }
        "get" => match args.get(1) {
            Some(path) => app.get(path).await,
            None => Err(anyhow::anyhow!("get needs a path, e.g. `herbcat get /products`")),
        },
        "shell" => app.shell().await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command `{}`\n\n{}", other, USAGE)),
    }
}
