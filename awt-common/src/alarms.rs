//! Alarm and measurement-report delivery
//!
//! Messages go out through a Telegram bot. Delivery is fire-and-forget:
//! a send failure is logged and never fails the run that raised it.

use crate::db::InstrumentSettings;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Clone)]
enum Transport {
    Telegram {
        client: reqwest::Client,
        token: String,
        chat_id: i64,
    },
    /// Test transport: messages are collected instead of sent.
    Capture(Arc<Mutex<Vec<String>>>),
    /// No credentials configured; messages are only logged.
    Disabled,
}

/// Outbound notification channel for alarms and reports.
#[derive(Clone)]
pub struct Notifier {
    instrument: String,
    transport: Transport,
}

impl Notifier {
    pub fn from_settings(settings: &InstrumentSettings) -> Self {
        let transport = match &settings.telegram_bot_token {
            Some(token) => Transport::Telegram {
                client: reqwest::Client::new(),
                token: token.clone(),
                chat_id: settings.telegram_chat_id,
            },
            None => Transport::Disabled,
        };
        Self {
            instrument: settings.instrument_name.clone(),
            transport,
        }
    }

    /// A notifier that records every message, for assertions in tests.
    pub fn capture(instrument: &str) -> (Self, Arc<Mutex<Vec<String>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                instrument: instrument.to_string(),
                transport: Transport::Capture(Arc::clone(&sink)),
            },
            sink,
        )
    }

    pub fn disabled(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            transport: Transport::Disabled,
        }
    }

    async fn send_text(&self, message: String) {
        match &self.transport {
            Transport::Telegram {
                client,
                token,
                chat_id,
            } => {
                let url = format!("https://api.telegram.org/bot{token}/sendMessage");
                let result = client
                    .get(&url)
                    .query(&[("chat_id", chat_id.to_string()), ("text", message.clone())])
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!("Notification rejected ({}): {}", resp.status(), message),
                    Err(e) => warn!("Notification send failed: {e}"),
                }
            }
            Transport::Capture(sink) => {
                if let Ok(mut messages) = sink.lock() {
                    messages.push(message);
                }
            }
            Transport::Disabled => info!("Notification (not sent): {message}"),
        }
    }

    pub async fn measurement_report(&self, test_name: &str, value: f64) {
        self.send_text(format!(
            "Measurement result from {}\nWith result: {} {:.2}",
            self.instrument, test_name, value
        ))
        .await;
    }

    pub async fn reagent_low(&self, slot: &str, remaining_ml: f64) {
        self.send_text(format!(
            "From: {}\nReagent in Slot {} Low, Remaining ML: {:.2}",
            self.instrument, slot, remaining_ml
        ))
        .await;
    }

    pub async fn fill_failure(&self, test_name: &str) {
        self.send_text(format!(
            "From: {}\nError filling Mixing Cylinder\nTest: {}",
            self.instrument, test_name
        ))
        .await;
    }

    pub async fn syringe_fill_failure(&self, slot: &str, test_name: &str) {
        self.send_text(format!(
            "From: {}\nUnable to Fill Syringes by reagent: {} For test: {}",
            self.instrument, slot, test_name
        ))
        .await;
    }

    pub async fn rotate_failure(&self, slot: &str, test_name: &str) {
        self.send_text(format!(
            "From: {}\nUnable to Rotate Carousel to Slot {}\nTest: {}",
            self.instrument, slot, test_name
        ))
        .await;
    }

    pub async fn evaluate_failure(&self, test_name: &str) {
        self.send_text(format!(
            "Unable to Evaluate Samples for Test {test_name}"
        ))
        .await;
    }

    pub async fn out_of_limits_alarm(&self, test_name: &str, value: f64) {
        self.send_text(format!(
            "From: {}\nWhat: Alarm\nOut of Limits {} results: {:.2}",
            self.instrument, test_name, value
        ))
        .await;
    }

    pub async fn out_of_limits_warning(&self, test_name: &str, value: f64) {
        self.send_text(format!(
            "From: {}\nWhat: Warning\nOut of Limits {} results: {:.2}",
            self.instrument, test_name, value
        ))
        .await;
    }
}
