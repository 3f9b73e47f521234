mod face;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use browser_pilot::driver::ChromeDriver;
use browser_pilot::oracle::OpenAiOracle;
use browser_pilot::{Config, Controller, ControllerEvent};
use clap::Parser;
use dotenvy::dotenv;
use face::UiEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drive a Chrome browser with natural-language commands.
#[derive(Parser, Debug)]
#[command(name = "agent", version)]
struct Cli {
    /// Plan and execute one task, then exit (0 when the plan completes).
    #[arg(long)]
    task: Option<String>,

    /// Config file (defaults to <config dir>/browser-pilot/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `browser.headless`.
    #[arg(long)]
    headless: Option<bool>,

    /// Serve the web UI instead of reading commands from stdin.
    #[arg(long)]
    serve: bool,

    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Write the session's action log to this file before exiting.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(headless) = cli.headless {
        config.browser.headless = headless;
    }

    let oracle = OpenAiOracle::from_env(&config.oracle)?;

    // Chrome can take a while to come up; keep it off the runtime threads.
    info!("launching Chrome");
    let browser_config = config.browser.clone();
    let driver = tokio::task::spawn_blocking(move || ChromeDriver::launch(&browser_config))
        .await
        .map_err(|e| anyhow!("browser launch panicked: {e}"))??;

    let mut controller = Controller::start(Arc::new(driver), Arc::new(oracle), &config).await?;
    info!(page = %controller.session().snapshot().summary(), "ready");

    let code = if cli.serve {
        serve(&mut controller, cli.port).await?
    } else if let Some(task) = cli.task.as_deref() {
        one_shot(&mut controller, task).await
    } else {
        repl(&mut controller).await?
    };

    if let Some(path) = cli.log_file.as_deref() {
        save_log(&controller, path);
    }
    Ok(code)
}

fn print_events(mut rx: broadcast::Receiver<ControllerEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!("{event}"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "progress output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn one_shot(controller: &mut Controller, task: &str) -> ExitCode {
    let printer = print_events(controller.subscribe());
    let token = controller.cancellation_token();
    let watcher = cancel_on_ctrl_c(token);

    let result = controller.run_task(task).await;
    watcher.abort();
    printer.abort();

    match result {
        Ok(report) => {
            println!("{report}");
            if report.completed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            println!("task failed: {e}");
            println!("page: {}", controller.session().snapshot().summary());
            ExitCode::FAILURE
        }
    }
}

async fn repl(controller: &mut Controller) -> Result<ExitCode> {
    let printer = print_events(controller.subscribe());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_ok = true;

    println!(
        "Type a command (\"log\" shows recent activity, \"quit\" exits). Ctrl-C cancels the running command, or exits when idle."
    );
    loop {
        let Some(line) = next_command(&mut lines, ctrl_c()).await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        if line == "log" {
            for entry in controller.session().recent_log(20) {
                println!("{entry}");
            }
            continue;
        }

        let token = controller.cancellation_token();
        let watcher = cancel_on_ctrl_c(token);
        let result = controller.handle(line).await;
        watcher.abort();

        last_ok = match result {
            Ok(outcome) => {
                println!("{outcome}");
                outcome.is_success()
            }
            Err(e) => {
                println!("{e}");
                false
            }
        };
    }
    printer.abort();

    Ok(if last_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Resolves on Ctrl-C. Never resolves if the signal cannot be watched.
async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Next input line, or `None` at end of input or when `interrupt` fires first.
/// Once a Ctrl-C listener has been registered the default handler no longer
/// exits the process, so the idle prompt has to watch for it too.
async fn next_command<R>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = ()>,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?),
        _ = interrupt => {
            println!();
            Ok(None)
        }
    }
}

async fn serve(controller: &mut Controller, port: u16) -> Result<ExitCode> {
    let mut server = face::start_server(port).await?;
    println!("Web UI running at http://localhost:{}", server.port);

    let ui = server.events.clone();
    let mut rx = controller.subscribe();
    let forwarder = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = ui.send(UiEvent::Progress {
                        text: event.to_string(),
                        event,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        let command = tokio::select! {
            command = server.commands.recv() => command,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(command) = command else { break };

        let token = controller.cancellation_token();
        set_slot(&server.cancel, Some(token));
        let result = controller.handle(&command).await;
        set_slot(&server.cancel, None);

        let (success, text) = match result {
            Ok(outcome) => (outcome.is_success(), outcome.to_string()),
            Err(e) => (
                false,
                format!("{e}\npage: {}", controller.session().snapshot().summary()),
            ),
        };
        let _ = server.events.send(UiEvent::Result { success, text });
        let _ = server.events.send(UiEvent::Ready);
    }

    forwarder.abort();
    Ok(ExitCode::SUCCESS)
}

fn set_slot(slot: &face::CancelSlot, token: Option<tokio_util::sync::CancellationToken>) {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
}

fn cancel_on_ctrl_c(token: tokio_util::sync::CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling; the current browser action will finish first");
            token.cancel();
        }
    })
}

fn save_log(controller: &Controller, path: &Path) {
    match controller.session().save_log(path) {
        Ok(()) => info!(path = %path.display(), "action log saved"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not save action log"),
    }
}
