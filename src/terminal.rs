//! Terminal front-end: draws the panel view as text and turns typed lines
//! into operator intents.

use chrono::Local;
use std::fmt::Write as _;
use std::io::Write as _;

use crate::order::{Order, OrderId};
use crate::panel::{PanelIntent, PanelRenderer};
use crate::projector::OrderView;
use crate::session::PanelView;

pub const HELP: &str = "commands: arm <id> | confirm <id> | disarm | history | close | refresh | quit";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Intent(PanelIntent),
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(Command::Help);
    };
    let arg = words.next();

    let needs_id = |verb: &str| -> Result<OrderId, String> {
        arg.map(OrderId::from)
            .ok_or_else(|| format!("`{verb}` needs an order id"))
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "arm" | "deliver" => Command::Intent(PanelIntent::Arm(needs_id(verb)?)),
        "confirm" => Command::Intent(PanelIntent::Confirm(needs_id(verb)?)),
        "disarm" | "cancel" => Command::Intent(PanelIntent::Disarm),
        "history" => Command::Intent(PanelIntent::OpenHistory),
        "close" => Command::Intent(PanelIntent::CloseHistory),
        "refresh" | "r" => Command::Intent(PanelIntent::Refresh),
        "quit" | "exit" | "q" => Command::Quit,
        "help" | "?" => Command::Help,
        other => return Err(format!("Unknown command `{other}`")),
    };
    Ok(command)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn order_block(out: &mut String, row: &OrderView, view: &PanelView) {
    let order: &Order = &row.order;
    let badge = if row.is_newest { "[NEW] " } else { "" };
    let time = order
        .created_at
        .map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_default();

    let _ = writeln!(
        out,
        "  {badge}#{}  {}  {} ({})  \u{20b9}{:.2}  {time}",
        order.id,
        order.status,
        order.customer_name().unwrap_or("Customer"),
        order.customer_phone().unwrap_or("No phone"),
        order.total_amount,
    );
    let address = order.address_lines();
    if !address.is_empty() {
        let _ = writeln!(out, "      {}", address.join(" / "));
    }
    if !order.items.is_empty() {
        let items: Vec<String> = order
            .items
            .iter()
            .map(|i| format!("{}x {}", i.quantity, i.name))
            .collect();
        let _ = writeln!(out, "      {}", items.join(", "));
    }
    match order.location() {
        Some(point) => {
            let _ = writeln!(out, "      location: {:.5},{:.5}", point.lat, point.lng);
        }
        None => {
            let _ = writeln!(out, "      No location available");
        }
    }

    if view.transitioning.as_ref() == Some(&order.id) {
        let _ = writeln!(out, "      ... marking delivered");
    } else if view.armed.as_ref() == Some(&order.id) {
        let _ = writeln!(out, "      >> type `confirm {}` to mark delivered", order.id);
    }
}

/// Text for one frame.
pub fn render_view(view: &PanelView) -> String {
    let mut out = String::new();

    if view.loading {
        out.push_str("Loading orders...\n");
        return out;
    }

    let last_poll = view
        .last_successful_poll
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let _ = write!(
        out,
        "== Delivery Panel == {} active | last update {last_poll}",
        view.active.len()
    );
    if view.consecutive_failures > 0 {
        let _ = write!(out, " | offline ({} failed polls)", view.consecutive_failures);
    }
    out.push('\n');

    if view.active.is_empty() {
        out.push_str("  No active orders. Waiting for new orders...\n");
    }
    for row in &view.active {
        order_block(&mut out, row, view);
    }

    if let Some(history) = &view.history {
        out.push_str("-- Delivery history --\n");
        if history.loading {
            out.push_str("  Loading history...\n");
        } else if history.orders.is_empty() {
            out.push_str("  No deliveries yet\n");
        } else {
            for row in &history.orders {
                let order = &row.order;
                let delivered_at = order
                    .updated_at
                    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  #{}  {}  \u{20b9}{:.2}  {delivered_at}  {}",
                    order.id,
                    order.customer_name().unwrap_or("Customer"),
                    order.total_amount,
                    order.status,
                );
            }
        }
    }

    out
}

/// Renders frames to stdout.
#[derive(Debug, Default)]
pub struct TerminalRenderer;

impl PanelRenderer for TerminalRenderer {
    fn render(&mut self, view: &PanelView) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", render_view(view));
        let _ = stdout.flush();
    }

    fn alert(&mut self, message: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "!! {message}");
        let _ = stdout.flush();
    }
}
