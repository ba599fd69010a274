//! drawbridge — an OpenAI-compatible tool-calling bridge.
//!
//! Sits between a tool-calling client and a plain completion API with no
//! native function calling. Outbound, it teaches the upstream model an
//! in-band `<tool_call>` convention; inbound, it transcodes the live token
//! stream (prose, `<think>` reasoning spans, emulated tool-call markup)
//! into `chat.completion.chunk` SSE frames with incrementally streamed
//! tool-call arguments.

pub mod api;
pub mod config;
pub mod error;
pub mod inject;
pub mod observability;
pub mod sse;
pub mod state;
pub mod transcode;
pub(crate) mod util;

use config::Config;
use state::AppState;

/// Bind and serve until the listener fails.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState::new(config)?;
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
