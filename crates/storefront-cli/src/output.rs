use anyhow::Result;
use chrono::{DateTime, Utc};
use console::style;
use serde_json::Value;
use storefront_client::auth::SessionObserver;
use storefront_client::{ApiResponse, TokenStatus};

/// Tells the user on the terminal that they need to log in again.
#[derive(Debug, Default)]
pub struct TerminalObserver;

impl SessionObserver for TerminalObserver {
    fn redirect_to_login(&self) {
        eprintln!(
            "Run {} to start a new session.",
            style("storefront login").bold()
        );
    }

    fn notify(&self, message: &str) {
        eprintln!("{}", style(message).red());
    }
}

pub fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints a response body, pretty printed if it is JSON.
pub fn print_response(response: &ApiResponse) -> Result<()> {
    if response.body.is_empty() {
        eprintln!("{}", style(format!("{} (no content)", response.status)).dim());
        return Ok(());
    }
    match response.json::<Value>() {
        Ok(value) => print_json(&value),
        Err(_) => {
            println!("{}", response.text());
            Ok(())
        }
    }
}

pub fn print_status(status: TokenStatus, expires_at: Option<DateTime<Utc>>) {
    let label = match status {
        TokenStatus::NoToken => style("logged out").dim(),
        TokenStatus::Valid => style("logged in").green(),
        TokenStatus::Expiring => style("logged in, expiring soon").yellow(),
        TokenStatus::Invalid => style("session expired").red(),
    };
    println!("Session: {label}");

    if let Some(expires_at) = expires_at {
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or_default();
        let remaining = std::time::Duration::from_secs(remaining.as_secs());
        println!(
            "Token expires: {} (in {})",
            expires_at.to_rfc3339(),
            humantime::format_duration(remaining)
        );
    }
}
