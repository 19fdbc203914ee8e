//! Pure snapshot-to-widgets rendering helpers.

use std::time::Duration;

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use crate::config::GlobalOptions;
use crate::state::{Status, TargetStatus};

const NAME_WIDTH: usize = 14;
const ADDR_WIDTH: usize = 18;
const STATUS_WIDTH: usize = 6;
const RTT_WIDTH: usize = 12;
const LOSS_WIDTH: usize = 12;

/// Targets bucketed for display: "default" first, then lexicographic, each
/// group's targets sorted by name.
pub fn group_snapshot(snapshot: Vec<TargetStatus>) -> Vec<(String, Vec<TargetStatus>)> {
    let mut groups: Vec<(String, Vec<TargetStatus>)> = Vec::new();
    for target in snapshot {
        let name = if target.group.trim().is_empty() {
            "default".to_string()
        } else {
            target.group.trim().to_string()
        };
        match groups.iter_mut().find(|(g, _)| *g == name) {
            Some((_, members)) => members.push(target),
            None => groups.push((name, vec![target])),
        }
    }

    groups.sort_by(|(a, _), (b, _)| match (a.as_str(), b.as_str()) {
        ("default", "default") => std::cmp::Ordering::Equal,
        ("default", _) => std::cmp::Ordering::Less,
        (_, "default") => std::cmp::Ordering::Greater,
        (a, b) => a.cmp(b),
    });
    for (_, members) in &mut groups {
        members.sort_by(|a, b| a.name.cmp(&b.name));
    }
    groups
}

pub fn status_style(status: Status) -> Style {
    let color = match status {
        Status::Ok => Color::Green,
        Status::Warn => Color::Yellow,
        Status::Down => Color::Red,
        Status::Unknown => Color::DarkGray,
    };
    Style::default().fg(color)
}

/// One display row for a target: name, address, colored status, average RTT,
/// lifetime loss, and an RTT bar filling the remaining width.
pub fn target_line(target: &TargetStatus, ui_scale: i64, width: usize) -> Line<'static> {
    let style = status_style(target.status);

    let name = pad_or_trim(&target.name, NAME_WIDTH.min(width));
    let addr = pad_or_trim(&target.address, ADDR_WIDTH.min(width));
    let status = pad_or_trim(&target.status.to_string(), STATUS_WIDTH);
    let rtt = pad_or_trim(&format!("RTT:{}", format_rtt(target.average_rtt())), RTT_WIDTH);
    let loss = pad_or_trim(&format!("LOSS:{:.1}%", target.loss_percent()), LOSS_WIDTH);

    let mut spans = vec![
        Span::raw(name),
        Span::raw(" "),
        Span::raw(addr),
        Span::raw(" "),
        Span::styled(status, style),
        Span::raw(" "),
        Span::raw(rtt),
        Span::raw(" "),
        Span::styled(loss, style),
        Span::raw(" "),
    ];

    let used: usize = spans.iter().map(|s| s.content.chars().count()).sum();
    if width > used {
        spans.push(Span::styled(
            rtt_bar(target.last_rtt, ui_scale, width - used),
            style,
        ));
    }

    Line::from(spans)
}

/// Bar of `#` cells, one cell per `scale` milliseconds of the last RTT.
/// Non-positive scales render as 10.
pub fn rtt_bar(last_rtt: Duration, scale: i64, width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    let scale = if scale <= 0 { 10 } else { scale };
    let ms = last_rtt.as_millis() as f64;
    if ms <= 0.0 {
        return " ".repeat(width);
    }
    let units = ((ms / scale as f64).round() as usize).min(width);
    format!("{}{}", "#".repeat(units), " ".repeat(width - units))
}

pub fn header_line(now: &str) -> Line<'static> {
    Line::from(Span::styled(
        format!(" deadman  {now}  (q quit, r reload)"),
        Style::default().add_modifier(Modifier::BOLD),
    ))
}

pub fn config_line(cfg: &GlobalOptions) -> Line<'static> {
    Line::from(Span::styled(
        format!(
            " interval={}  timeout={}  max_concurrency={}  ui.scale={}",
            format_duration(cfg.interval),
            format_duration(cfg.timeout),
            cfg.max_concurrency,
            cfg.ui_scale,
        ),
        Style::default().fg(Color::DarkGray),
    ))
}

pub fn format_rtt(rtt: Duration) -> String {
    if rtt.is_zero() {
        return "-".to_string();
    }
    format_duration(rtt)
}

pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_millis(1) {
        format!("{}us", d.as_micros())
    } else if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else if d < Duration::from_secs(60) {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{:.1}m", d.as_secs_f64() / 60.0)
    }
}

fn pad_or_trim(value: &str, width: usize) -> String {
    let count = value.chars().count();
    if count > width {
        value.chars().take(width).collect()
    } else {
        format!("{value}{}", " ".repeat(width - count))
    }
}
