//! Snapshot -> view-model projection.
//!
//! Pure functions: the same snapshot and selector always produce the same
//! ordered list. The backend returns orders oldest-first, so both views are
//! reversed to show the most recent arrival at the top.

use serde::{Deserialize, Serialize};

use crate::order::{Order, OrderStatus};

/// Which orders count as "active" for this panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActiveFilter {
    /// Only orders in exactly `Accepted` (delivery rider panel).
    #[default]
    AcceptedOnly,
    /// Anything that is not `Delivered` or `Cancelled` (dispatcher panel).
    NonTerminal,
}

impl ActiveFilter {
    pub fn admits(self, status: &OrderStatus) -> bool {
        match self {
            Self::AcceptedOnly => *status == OrderStatus::Accepted,
            Self::NonTerminal => !status.is_terminal(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "acceptedonly" | "accepted" => Some(Self::AcceptedOnly),
            "nonterminal" | "all" => Some(Self::NonTerminal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSelector {
    Active(ActiveFilter),
    History,
}

/// One display-ready row handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderView {
    pub order: Order,
    /// Set on the first row of the active projection only.
    pub is_newest: bool,
}

/// Filter + reverse a raw snapshot for the given view.
pub fn project(snapshot: &[Order], selector: ViewSelector) -> Vec<Order> {
    snapshot
        .iter()
        .rev()
        .filter(|order| match selector {
            ViewSelector::Active(filter) => filter.admits(&order.status),
            ViewSelector::History => order.status == OrderStatus::Delivered,
        })
        .cloned()
        .collect()
}

/// Wrap an already-projected active list as view rows, flagging the head.
pub fn active_rows(active: &[Order]) -> Vec<OrderView> {
    active
        .iter()
        .enumerate()
        .map(|(index, order)| OrderView {
            order: order.clone(),
            is_newest: index == 0,
        })
        .collect()
}

/// History rows never carry the newest flag.
pub fn history_rows(history: &[Order]) -> Vec<OrderView> {
    history
        .iter()
        .map(|order| OrderView {
            order: order.clone(),
            is_newest: false,
        })
        .collect()
}
