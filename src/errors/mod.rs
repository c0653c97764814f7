pub mod voice_error;

pub use voice_error::{VoiceError, VoiceResult, is_retryable_code};
