//! Terminal runtime: drives [`App`] with crossterm input, ticks and probe
//! completions, and draws each frame with ratatui.

use std::io::{self, Stdout};
use std::time::Instant;

use crossterm::event::{self, Event, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use log::{debug, info};
use ratatui::backend::CrosstermBackend;
use ratatui::widgets::{Paragraph, Wrap};
use ratatui::Terminal;
use tokio::sync::mpsc;

use crate::app::{App, Command, Message};
use crate::config::CheckerConfig;
use crate::error::Result;
use crate::probe;
use crate::types::ProbeResult;

type Term = Terminal<CrosstermBackend<Stdout>>;

/// Run the interactive session until the user quits.
///
/// The terminal is restored even when drawing or input fails.
pub async fn run(config: &CheckerConfig) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let result = event_loop(&mut terminal, config).await;
    restore_terminal(&mut terminal)?;
    result
}

fn setup_terminal() -> Result<Term> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    if let Err(e) = execute!(stdout, EnterAlternateScreen) {
        let _ = disable_raw_mode();
        return Err(e.into());
    }
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn restore_terminal(terminal: &mut Term) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

async fn event_loop(terminal: &mut Term, config: &CheckerConfig) -> Result<()> {
    let mut app = App::new(config);
    let (tx, mut rx) = mpsc::channel::<ProbeResult>(1);
    let tick_rate = config.tick_rate;
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| {
            let body = Paragraph::new(app.view()).wrap(Wrap { trim: false });
            f.render_widget(body, f.area());
        })?;

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match app.update(Message::Key(key)) {
                        Command::Quit => break,
                        Command::StartProbe(request) => {
                            info!("starting probe via {}", request.endpoint.address);
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                let result = probe::run(request).await;
                                if tx.send(result).await.is_err() {
                                    debug!("probe finished after the UI exited");
                                }
                            });
                        }
                        Command::None => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.update(Message::Tick);
            last_tick = Instant::now();
        }

        while let Ok(result) = rx.try_recv() {
            app.update(Message::ProbeComplete(result));
        }
    }

    Ok(())
}
