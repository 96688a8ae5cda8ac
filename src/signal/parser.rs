use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

use crate::models::{ControlCommand, Signal, SignalAction};

const DEFAULT_SYMBOL: &str = "BTC-USDT-SWAP";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unrecognized signal format: {raw:?} (expected e.g. {expected:?})")]
    InvalidFormat { raw: String, expected: &'static str },

    #[error("bad field in signal {raw:?}: {detail}")]
    BadField { raw: String, detail: String },
}

/// Parses raw feed text into typed signals.
///
/// Control-command patterns are tried first, then progressively looser trading
/// templates; the first successful match wins.
pub struct SignalParser {
    trading_patterns: Vec<Regex>,
    control_pattern: Regex,
    leverage_pattern: Regex,
    stats: ParseStats,
}

#[derive(Debug, Default, Clone)]
pub struct ParseStats {
    pub total: u64,
    pub parsed: u64,
    pub failed: u64,
    pub pattern_usage: HashMap<usize, u64>,
}

impl SignalParser {
    pub fn new() -> Self {
        let trading_patterns = vec![
            // Canonical template: [open-short] qty:1 market:BTC-USDT-SWAP
            Regex::new(
                r"\[(open-long|open-short|close-long|close-short)\]\s*qty:(\d+\.?\d*)\s*market:([\w-]+)",
            )
            .expect("hard-coded pattern"),
            // Plain template: open-short 1 BTC
            Regex::new(r"(open-long|open-short|close-long|close-short)\s+(\d+\.?\d*)\s*([\w-]*)")
                .expect("hard-coded pattern"),
            // Compact template: open-short1 BTC
            Regex::new(r"(open-long|open-short|close-long|close-short)(\d+\.?\d*)\s*([\w-]*)")
                .expect("hard-coded pattern"),
        ];

        Self {
            trading_patterns,
            control_pattern: Regex::new(
                r"^(pause|resume|conservative-mode|normal-mode|uptime-query)$",
            )
            .expect("hard-coded pattern"),
            leverage_pattern: Regex::new(r"^(\d+)x$").expect("hard-coded pattern"),
            stats: ParseStats::default(),
        }
    }

    pub fn parse(&mut self, raw: &str) -> Result<Signal, ParseError> {
        self.stats.total += 1;

        let cleaned = clean_message(raw);

        if let Some(signal) = self.parse_control(&cleaned) {
            self.stats.parsed += 1;
            return Ok(signal);
        }

        match self.parse_trading(&cleaned) {
            Some(signal) => {
                self.stats.parsed += 1;
                tracing::info!(
                    signal_id = %signal.id,
                    action = signal.action.as_str(),
                    quantity = signal.quantity,
                    symbol = %signal.symbol,
                    "signal parsed"
                );
                Ok(signal)
            }
            None => {
                self.stats.failed += 1;
                tracing::warn!(raw, "signal parse failed");
                Err(ParseError::InvalidFormat {
                    raw: raw.to_string(),
                    expected: "[action] qty:<n> market:<symbol>",
                })
            }
        }
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    fn parse_control(&self, message: &str) -> Option<Signal> {
        if let Some(caps) = self.control_pattern.captures(message) {
            let command = match &caps[1] {
                "pause" => ControlCommand::Pause,
                "resume" => ControlCommand::Resume,
                "conservative-mode" => ControlCommand::ConservativeMode,
                "normal-mode" => ControlCommand::NormalMode,
                _ => ControlCommand::UptimeQuery,
            };
            return Some(Signal::control(message.to_string(), command));
        }

        if let Some(caps) = self.leverage_pattern.captures(message) {
            if let Ok(n) = caps[1].parse::<u32>() {
                return Some(Signal::control(
                    message.to_string(),
                    ControlCommand::Leverage(n),
                ));
            }
        }

        None
    }

    fn parse_trading(&mut self, message: &str) -> Option<Signal> {
        for (idx, pattern) in self.trading_patterns.iter().enumerate() {
            let Some(caps) = pattern.captures(message) else {
                continue;
            };

            let action = match &caps[1] {
                "open-long" => SignalAction::OpenLong,
                "open-short" => SignalAction::OpenShort,
                "close-long" => SignalAction::CloseLong,
                "close-short" => SignalAction::CloseShort,
                _ => continue,
            };

            let Ok(quantity) = caps[2].parse::<f64>() else {
                tracing::warn!(field = &caps[2], "quantity field did not parse, trying next pattern");
                continue;
            };

            let symbol = normalize_symbol(caps.get(3).map(|m| m.as_str()).unwrap_or(""));

            *self.stats.pattern_usage.entry(idx).or_insert(0) += 1;

            return Some(Signal::directional(
                message.to_string(),
                action,
                quantity,
                symbol,
            ));
        }

        None
    }
}

impl Default for SignalParser {
    fn default() -> Self {
        Self::new()
    }
}

fn clean_message(message: &str) -> String {
    let trimmed = message.trim();

    // Collapse runs of whitespace, strip everything but word chars and the
    // punctuation the templates use
    let mut cleaned = String::with_capacity(trimmed.len());
    let mut last_was_space = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                cleaned.push(' ');
                last_was_space = true;
            }
        } else if c.is_alphanumeric() || "[]:._-".contains(c) {
            cleaned.push(c);
            last_was_space = false;
        }
    }
    cleaned
}

/// Normalize instrument tokens to the default quote-pair convention
fn normalize_symbol(symbol: &str) -> String {
    if symbol.is_empty() || symbol.eq_ignore_ascii_case("BTC") {
        return DEFAULT_SYMBOL.to_string();
    }

    let mut symbol = symbol.to_uppercase();

    if !symbol.contains('-') {
        symbol = format!("{}-USDT-SWAP", symbol);
    }
    if !symbol.ends_with("-SWAP") {
        symbol = format!("{}-SWAP", symbol);
    }

    symbol
}
