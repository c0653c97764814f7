//! The in-memory order draft a session accumulates while the caller speaks.

use serde::Serialize;

use crate::errors::{VoiceError, VoiceResult};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    pub modifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Collecting,
    Confirmed,
    Cancelled,
}

/// Draft order owned by exactly one session.
///
/// Status only ever moves `collecting -> confirmed` or
/// `collecting -> cancelled`; once left, `collecting` is unreachable and the
/// item list is frozen.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDraft {
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
}

impl Default for OrderDraft {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderDraft {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            status: OrderStatus::Collecting,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.status != OrderStatus::Collecting
    }

    pub fn add(&mut self, item: OrderItem) -> VoiceResult<()> {
        self.ensure_collecting()?;
        self.items.push(item);
        Ok(())
    }

    /// Remove up to `quantity` units matching `name` (all units when `None`).
    /// Returns the number of units removed; zero matches is a no-op, not an
    /// error, since the model may act on a stale view of the draft.
    pub fn remove(&mut self, name: &str, quantity: Option<u32>) -> VoiceResult<u32> {
        self.ensure_collecting()?;

        let wanted = name.trim().to_lowercase();
        let mut remaining = quantity.unwrap_or(u32::MAX);
        let mut removed = 0u32;

        for item in self.items.iter_mut().rev() {
            if remaining == 0 {
                break;
            }
            if item.name.to_lowercase() != wanted {
                continue;
            }
            let take = item.quantity.min(remaining);
            item.quantity -= take;
            remaining -= take;
            removed += take;
        }
        self.items.retain(|i| i.quantity > 0);
        Ok(removed)
    }

    pub fn confirm(&mut self) -> VoiceResult<()> {
        self.ensure_collecting()?;
        self.status = OrderStatus::Confirmed;
        Ok(())
    }

    pub fn cancel(&mut self) -> VoiceResult<()> {
        self.ensure_collecting()?;
        self.status = OrderStatus::Cancelled;
        Ok(())
    }

    fn ensure_collecting(&self) -> VoiceResult<()> {
        if self.is_frozen() {
            return Err(VoiceError::ToolValidation(format!(
                "order is {:?} and can no longer change",
                self.status
            )));
        }
        Ok(())
    }
}
