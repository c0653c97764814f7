//! Order drafting: menu lookup, draft state, and the function-call router.

pub mod draft;
pub mod menu;
pub mod router;

pub use draft::{OrderDraft, OrderItem, OrderStatus};
pub use menu::{LookupResult, MenuItem, MenuLookup, StaticMenu};
pub use router::{LogOrderSink, OrderSink, OrderToolRouter, ToolOutcome};
