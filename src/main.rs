use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod app;
mod config;
mod handler;
mod store;
#[cfg(test)]
mod testutil;
mod tui;
mod ui;

use app::App;
use config::Config;
use store::{FileStateStore, ThreadStore};
use tui::EventHandler;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = Config::load().unwrap_or_else(|_| Config::new());
    let state_dir = FileStateStore::default_dir()?;
    let store = ThreadStore::load(Box::new(FileStateStore::new(state_dir)))?;
    let mut app = App::new(config, store);
    info!(threads = app.store.len(), "session restored");

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let result = run(&mut terminal, &mut app).await;
    tui::restore()?;
    result
}

async fn run(terminal: &mut tui::Tui, app: &mut App) -> Result<()> {
    let mut events = EventHandler::new();

    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(app, event).await?,
            None => break,
        }
    }

    Ok(())
}

/// Logs go to a file under the state directory; stderr hosts the TUI.
fn init_logging() -> Result<()> {
    let dir = FileStateStore::default_dir()?;
    std::fs::create_dir_all(&dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("sonar.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}
