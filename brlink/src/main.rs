use anyhow::Context;
use std::path::PathBuf;
use tokio::signal::unix::{self, SignalKind};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use brlink::config::{Config, DaemonConfig};
use brlink::keys::NormalizedCommand;
use brlink::session::Session;
use brlink::tracing::{self, prelude::*};
use brlink::transport::TransportDescriptor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref()).context("failed to load configuration")?;
    let descriptor = config
        .device
        .descriptor()
        .context("invalid device configuration")?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(display_task(config, descriptor, running.clone()));
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = tracker.wait() => warn!("Display task ended."),
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}

/// Connect, run until the display goes away, wait, and connect again.
async fn display_task(config: Config, descriptor: TransportDescriptor, running: CancellationToken) {
    trace!("Task started.");

    while !running.is_cancelled() {
        let connect = Session::connect(
            &descriptor,
            config.device.model.as_deref(),
            config.session.clone(),
        );
        let result = tokio::select! {
            _ = running.cancelled() => break,
            result = connect => result,
        };

        match result {
            Ok(session) => run_session(session, &config.daemon, &running).await,
            Err(e) => warn!(transport = %descriptor, error = %e, "Failed to connect"),
        }

        tokio::select! {
            _ = running.cancelled() => break,
            _ = time::sleep(config.daemon.reconnect_delay()) => {},
        }
    }

    trace!("Task stopped.");
}

async fn run_session(mut session: Session, daemon: &DaemonConfig, running: &CancellationToken) {
    let Some(profile) = session.profile() else {
        return;
    };
    let mut pad = Scratchpad::new(profile.cells(), daemon.pages);
    info!(display = %profile, keys = profile.key_table.describe().len(), "Showing scratchpad");
    for line in profile.key_table.describe() {
        debug!("{line}");
    }

    let mut ticker = time::interval(daemon.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dirty = true;

    loop {
        tokio::select! {
            _ = running.cancelled() => {
                session.disconnect().await;
                return;
            }
            _ = ticker.tick() => {},
        }

        match session.poll_commands().await {
            Ok(commands) => {
                for command in commands {
                    info!(%command, "Command");
                    dirty |= pad.apply(command);
                }
            }
            Err(e) => {
                warn!(error = %e, stats = ?session.stats(), "Display lost");
                session.disconnect().await;
                return;
            }
        }

        if dirty {
            dirty = false;
            session.set_window_offset(pad.window);
            let written = match session.set_cell_image(&pad.render()) {
                Ok(()) => session.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, "Failed to update display");
                session.disconnect().await;
                return;
            }
        }
    }
}

/// A line of raw dot patterns, several displays long, edited with the
/// display's own keys. The cursor cell shows dots 7 and 8.
struct Scratchpad {
    text: Vec<u8>,
    width: usize,
    cursor: usize,
    window: usize,
}

const CURSOR_DOTS: u8 = 0xc0;

impl Scratchpad {
    fn new(width: usize, pages: usize) -> Self {
        let width = width.max(1);
        Self {
            text: vec![0; width * pages.max(1)],
            width,
            cursor: 0,
            window: 0,
        }
    }

    fn last_window(&self) -> usize {
        self.text.len() - self.width
    }

    /// Returns whether the visible cells may have changed.
    fn apply(&mut self, command: NormalizedCommand) -> bool {
        use NormalizedCommand::*;

        let last = self.text.len() - 1;
        match command {
            Dots(dots) => {
                self.text[self.cursor] = dots;
                self.cursor = (self.cursor + 1).min(last);
                self.follow_cursor();
            }
            CursorLeft => {
                self.cursor = self.cursor.saturating_sub(1);
                self.follow_cursor();
            }
            CursorRight => {
                self.cursor = (self.cursor + 1).min(last);
                self.follow_cursor();
            }
            RouteCursor(cell) => self.cursor = cell.min(last),
            WindowLeft | LineUp => self.window = self.window.saturating_sub(self.width),
            WindowRight | LineDown => {
                self.window = (self.window + self.width).min(self.last_window())
            }
            Top => self.window = 0,
            Bottom => self.window = self.last_window(),
            ReturnToCursor => self.follow_cursor(),
            ClearDisplay => {
                self.text.fill(0);
                self.cursor = 0;
                self.window = 0;
            }
            _ => return false,
        }
        true
    }

    fn follow_cursor(&mut self) {
        if !(self.window..self.window + self.width).contains(&self.cursor) {
            self.window = (self.cursor / self.width * self.width).min(self.last_window());
        }
    }

    fn render(&self) -> Vec<u8> {
        let mut cells = self.text[self.window..self.window + self.width].to_vec();
        if let Some(cell) = self.cursor.checked_sub(self.window) {
            if let Some(cell) = cells.get_mut(cell) {
                *cell |= CURSOR_DOTS;
            }
        }
        cells
    }
}
