pub mod bus;
pub mod call_state;
pub mod config;
pub mod db_types;
pub mod deepgram_client;
pub mod deepgram_types;
pub mod dialer;
pub mod error;
pub mod event_log;
pub mod handlers;
pub mod memory_store;
pub mod openai_client;
pub mod openai_types;
pub mod pg_store;
pub mod providers;
pub mod recording_pipeline;
pub mod store;
pub mod supervision;
pub mod tasks;
pub mod twilio_client;
pub mod twilio_types;
pub mod types;
pub mod utils;

pub mod consts {
    pub const INBOUND_GREETING: &str = "Thanks for calling. Connecting you now.";
    pub const DB_MAX_CONNECTIONS: u32 = 10;
    pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
    pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You review transcripts of sales phone calls.
Reply with a single JSON object and nothing else, shaped exactly like:
{"sentiment": {"label": "positive" | "negative" | "neutral", "score": <number from -1 to 1>},
 "keywords": [<up to 10 short keyword strings>],
 "quality": {"clarity": <1-10>, "professionalism": <1-10>, "resolution": <1-10>, "overall": <1-10>}}
Score the company-side speaker's clarity, professionalism, and how well the caller's need was resolved."#;
}
