pub mod api;
pub mod telephony;
pub mod ws;
