//! Routing of upstream function calls onto a session's order draft.
//!
//! Arguments arrive schema-validated by the upstream tool contract but are
//! re-validated here: unknown items are rejected against the menu, quantities
//! must be positive, and free-text fields and modifier lists are capped so
//! spoken input cannot smuggle unbounded payloads into downstream systems.
//!
//! Validation failures never fail the call; they come back as structured
//! correction hints the adapter relays into the conversation so the model can
//! self-correct.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::draft::{OrderDraft, OrderItem};
use super::menu::{LookupResult, MenuLookup};

/// Receives confirmed orders. The external order system owns persistence and
/// pricing; totals computed here are never authoritative.
pub trait OrderSink: Send + Sync {
    fn order_confirmed(&self, session_id: &str, tenant_id: &str, draft: &OrderDraft);
}

/// Default sink: structured log line per confirmed order.
pub struct LogOrderSink;

impl OrderSink for LogOrderSink {
    fn order_confirmed(&self, session_id: &str, tenant_id: &str, draft: &OrderDraft) {
        info!(
            session_id,
            tenant_id,
            order = %serde_json::to_string(draft).unwrap_or_default(),
            "order.confirmed"
        );
    }
}

/// What one tool call did, as seen by the owning session.
#[derive(Debug)]
pub struct ToolOutcome {
    /// Structured result relayed back to the model as the function output.
    pub reply: Value,
    /// The draft changed; the client should see an updated `order.detected`.
    pub draft_changed: bool,
    /// The order was confirmed by this call (emitted to the sink exactly once).
    pub confirmed: bool,
}

impl ToolOutcome {
    fn reply_only(reply: Value) -> Self {
        Self {
            reply,
            draft_changed: false,
            confirmed: false,
        }
    }
}

#[derive(Deserialize)]
struct AddItemsArgs {
    items: Vec<IncomingItem>,
}

#[derive(Deserialize)]
struct IncomingItem {
    name: String,
    #[serde(default = "default_quantity")]
    quantity: i64,
    #[serde(default)]
    modifiers: Vec<String>,
    #[serde(default)]
    special_instructions: Option<String>,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Deserialize)]
struct RemoveItemArgs {
    name: String,
    #[serde(default)]
    quantity: Option<i64>,
}

#[derive(Deserialize)]
struct ConfirmOrderArgs {
    action: String,
}

pub struct OrderToolRouter {
    menu: Arc<dyn MenuLookup>,
    sink: Arc<dyn OrderSink>,
    free_text_cap: usize,
}

impl OrderToolRouter {
    pub fn new(menu: Arc<dyn MenuLookup>, sink: Arc<dyn OrderSink>, free_text_cap: usize) -> Self {
        Self {
            menu,
            sink,
            free_text_cap,
        }
    }

    /// JSON tool declarations advertised to the upstream model at session
    /// configuration time.
    pub fn tool_schemas() -> Vec<Value> {
        vec![
            json!({
                "type": "function",
                "name": "add_items",
                "description": "Add one or more menu items to the customer's order.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "items": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": {"type": "string"},
                                    "quantity": {"type": "integer", "minimum": 1},
                                    "modifiers": {"type": "array", "items": {"type": "string"}},
                                    "special_instructions": {"type": "string"}
                                },
                                "required": ["name"]
                            }
                        }
                    },
                    "required": ["items"]
                }
            }),
            json!({
                "type": "function",
                "name": "remove_item",
                "description": "Remove an item (or part of its quantity) from the order.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "quantity": {"type": "integer", "minimum": 1}
                    },
                    "required": ["name"]
                }
            }),
            json!({
                "type": "function",
                "name": "confirm_order",
                "description": "Review, check out, or cancel the current order.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["checkout", "review", "cancel"]}
                    },
                    "required": ["action"]
                }
            }),
        ]
    }

    /// Apply one function call to the session's draft. Never fails: every
    /// validation problem becomes a structured hint in the reply.
    pub fn handle(
        &self,
        session_id: &str,
        tenant_id: &str,
        draft: &mut OrderDraft,
        tool_name: &str,
        arguments: &str,
    ) -> ToolOutcome {
        match tool_name {
            "add_items" => match serde_json::from_str::<AddItemsArgs>(arguments) {
                Ok(args) => self.add_items(tenant_id, draft, args),
                Err(e) => bad_arguments(tool_name, &e),
            },
            "remove_item" => match serde_json::from_str::<RemoveItemArgs>(arguments) {
                Ok(args) => self.remove_item(draft, args),
                Err(e) => bad_arguments(tool_name, &e),
            },
            "confirm_order" => match serde_json::from_str::<ConfirmOrderArgs>(arguments) {
                Ok(args) => self.confirm_order(session_id, tenant_id, draft, args),
                Err(e) => bad_arguments(tool_name, &e),
            },
            other => {
                warn!("Unknown tool call '{other}'");
                ToolOutcome::reply_only(json!({
                    "status": "rejected",
                    "reason": format!("unknown tool '{other}'"),
                }))
            }
        }
    }

    fn add_items(
        &self,
        tenant_id: &str,
        draft: &mut OrderDraft,
        args: AddItemsArgs,
    ) -> ToolOutcome {
        if draft.is_frozen() {
            return frozen_reply(draft);
        }

        let mut added = Vec::new();
        let mut rejected = Vec::new();

        for incoming in args.items {
            if incoming.quantity <= 0 || incoming.quantity > u32::MAX as i64 {
                rejected.push(json!({
                    "name": incoming.name,
                    "reason": "quantity must be a positive integer",
                }));
                continue;
            }

            match self.menu.lookup(tenant_id, &incoming.name) {
                LookupResult::Found(menu_item) => {
                    let item = OrderItem {
                        // Canonical menu spelling, not the transcribed one
                        name: menu_item.name.clone(),
                        quantity: incoming.quantity as u32,
                        modifiers: incoming
                            .modifiers
                            .into_iter()
                            .take(MODIFIER_LIST_CAP)
                            .map(|m| cap_text(&m, self.free_text_cap))
                            .collect(),
                        special_instructions: incoming
                            .special_instructions
                            .as_deref()
                            .map(|s| cap_text(s, self.free_text_cap)),
                    };
                    // Cannot fail: frozen state was checked above and nothing
                    // else mutates this draft concurrently
                    if draft.add(item).is_ok() {
                        added.push(json!({
                            "name": menu_item.name,
                            "quantity": incoming.quantity,
                        }));
                    }
                }
                LookupResult::NotFound { suggestion } => {
                    let hint = match &suggestion {
                        Some(s) => format!("'{}' is not on the menu, did you mean '{s}'?", incoming.name),
                        None => format!("'{}' is not on the menu", incoming.name),
                    };
                    rejected.push(json!({
                        "name": incoming.name,
                        "reason": "not_found",
                        "hint": hint,
                    }));
                }
            }
        }

        ToolOutcome {
            draft_changed: !added.is_empty(),
            confirmed: false,
            reply: json!({
                "status": if rejected.is_empty() { "ok" } else { "partial" },
                "added": added,
                "rejected": rejected,
            }),
        }
    }

    fn remove_item(&self, draft: &mut OrderDraft, args: RemoveItemArgs) -> ToolOutcome {
        if draft.is_frozen() {
            return frozen_reply(draft);
        }

        let quantity = match args.quantity {
            Some(q) if q <= 0 || q > u32::MAX as i64 => {
                return ToolOutcome::reply_only(json!({
                    "status": "rejected",
                    "reason": "quantity must be a positive integer",
                }));
            }
            Some(q) => Some(q as u32),
            None => None,
        };

        let removed = draft.remove(&args.name, quantity).unwrap_or(0);
        ToolOutcome {
            draft_changed: removed > 0,
            confirmed: false,
            reply: json!({ "status": "ok", "removed": removed }),
        }
    }

    fn confirm_order(
        &self,
        session_id: &str,
        tenant_id: &str,
        draft: &mut OrderDraft,
        args: ConfirmOrderArgs,
    ) -> ToolOutcome {
        match args.action.as_str() {
            "review" => ToolOutcome::reply_only(json!({
                "status": "ok",
                "order": draft,
            })),
            "checkout" => match draft.confirm() {
                Ok(()) => {
                    self.sink.order_confirmed(session_id, tenant_id, draft);
                    ToolOutcome {
                        draft_changed: true,
                        confirmed: true,
                        reply: json!({ "status": "confirmed", "order": draft }),
                    }
                }
                Err(e) => ToolOutcome::reply_only(json!({
                    "status": "rejected",
                    "reason": e.to_string(),
                })),
            },
            "cancel" => match draft.cancel() {
                Ok(()) => ToolOutcome {
                    draft_changed: true,
                    confirmed: false,
                    reply: json!({ "status": "cancelled" }),
                },
                Err(e) => ToolOutcome::reply_only(json!({
                    "status": "rejected",
                    "reason": e.to_string(),
                })),
            },
            other => ToolOutcome::reply_only(json!({
                "status": "rejected",
                "reason": format!("unknown action '{other}'"),
            })),
        }
    }
}

fn bad_arguments(tool_name: &str, error: &serde_json::Error) -> ToolOutcome {
    warn!("Malformed arguments for tool '{tool_name}': {error}");
    ToolOutcome::reply_only(json!({
        "status": "rejected",
        "reason": format!("malformed arguments: {error}"),
    }))
}

fn frozen_reply(draft: &OrderDraft) -> ToolOutcome {
    ToolOutcome::reply_only(json!({
        "status": "rejected",
        "reason": format!("order is already {:?}", draft.status).to_lowercase(),
    }))
}

/// Upper bound on the modifiers kept for a single item; extras are dropped.
const MODIFIER_LIST_CAP: usize = 10;

fn cap_text(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}
