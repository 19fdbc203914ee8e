//! Interactive dashboard loop.

use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::widgets::{Block, Paragraph};
use scopeguard::defer;
use tokio_util::sync::CancellationToken;

use crate::config::GlobalOptions;
use crate::reload::ReloadHandle;
use crate::state::{Store, TargetStatus};
use crate::tui::view;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Run the dashboard until the user quits or the root token fires.
///
/// `q`/Ctrl-C cancels the root token; `r` requests a config reload.
pub async fn run_tui(
    store: Arc<Store>,
    cfg: GlobalOptions,
    cancel: CancellationToken,
    reload: ReloadHandle,
) -> Result<()> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;

    // Restore the terminal on any exit path (success, error, or panic).
    defer! {
        let _ = disable_raw_mode();
        let _ = stdout().execute(LeaveAlternateScreen);
    }

    let backend = CrosstermBackend::new(stdout());
    let mut terminal = Terminal::new(backend)?;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Snapshot before drawing so no store lock is held during render.
        let grouped = view::group_snapshot(store.snapshot());
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        terminal.draw(|frame| {
            draw_dashboard(frame, &grouped, &cfg, &now);
        })?;

        // Blocks for at most one refresh interval; any key wakes it early.
        if event::poll(REFRESH_INTERVAL)? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
                    KeyCode::Char('q') => {
                        cancel.cancel();
                        break;
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        cancel.cancel();
                        break;
                    }
                    KeyCode::Char('r') => {
                        reload.request();
                    }
                    _ => {}
                },
                Event::Resize(_, _) => {
                    terminal.autoresize()?;
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn draw_dashboard(
    frame: &mut ratatui::Frame<'_>,
    grouped: &[(String, Vec<TargetStatus>)],
    cfg: &GlobalOptions,
    now: &str,
) {
    let area = frame.area();
    if area.width < 20 || area.height < 5 {
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Min(0),
        ])
        .split(area);

    frame.render_widget(Paragraph::new(view::header_line(now)), chunks[0]);
    frame.render_widget(Paragraph::new(view::config_line(cfg)), chunks[1]);

    let mut y = chunks[2].y;
    let bottom = chunks[2].y + chunks[2].height;
    for (group, targets) in grouped {
        if bottom.saturating_sub(y) < 3 {
            break;
        }
        let box_height = ((targets.len() as u16) + 2).min(bottom - y);
        let box_area = Rect::new(chunks[2].x, y, chunks[2].width, box_height);

        let inner_width = box_area.width.saturating_sub(2) as usize;
        let rows: Vec<ratatui::text::Line<'_>> = targets
            .iter()
            .map(|target| view::target_line(target, cfg.ui_scale, inner_width))
            .collect();

        let title = ratatui::text::Span::styled(
            format!(" {group} "),
            Style::default().add_modifier(Modifier::BOLD),
        );
        let block = Block::bordered().title(title);
        frame.render_widget(Paragraph::new(rows).block(block), box_area);

        y += box_height;
    }
}
