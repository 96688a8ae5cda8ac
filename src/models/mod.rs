use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trading action carried by a signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    /// Operational command (pause, resume, leverage, ...)
    Control,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::OpenLong => "open-long",
            SignalAction::OpenShort => "open-short",
            SignalAction::CloseLong => "close-long",
            SignalAction::CloseShort => "close-short",
            SignalAction::Control => "control",
        }
    }
}

/// Signal class: a directional trade intent or an operational command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    Directional,
    Control,
}

/// Operational commands recognized by exact match (plus the `<N>x` leverage form)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    ConservativeMode,
    NormalMode,
    UptimeQuery,
    Leverage(u32),
}

/// Signal strength tier derived from the quantity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

impl Strength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strength::Weak => "weak",
            Strength::Medium => "medium",
            Strength::Strong => "strong",
        }
    }
}

/// Market direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

/// A parsed trade-intent event from the external feed.
///
/// Immutable once parsed; only the confidence is adjusted during validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub raw: String,
    pub action: SignalAction,
    /// Quantity in the signal source's own unit, not an order size
    pub quantity: f64,
    pub symbol: String,
    pub kind: SignalKind,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub control: Option<ControlCommand>,
}

impl Signal {
    pub fn directional(raw: String, action: SignalAction, quantity: f64, symbol: String) -> Self {
        let confidence = match quantity {
            q if q <= 2.0 => 0.3,
            q if q == 3.0 => 0.7,
            _ => 0.9,
        };

        Self {
            id: Uuid::new_v4(),
            raw,
            action,
            quantity,
            symbol,
            kind: SignalKind::Directional,
            timestamp: Utc::now(),
            confidence,
            control: None,
        }
    }

    pub fn control(raw: String, command: ControlCommand) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw,
            action: SignalAction::Control,
            quantity: 0.0,
            symbol: "CONTROL".to_string(),
            kind: SignalKind::Control,
            timestamp: Utc::now(),
            confidence: 1.0,
            control: Some(command),
        }
    }

    pub fn strength(&self) -> Strength {
        if self.quantity <= 2.0 {
            Strength::Weak
        } else if self.quantity == 3.0 {
            Strength::Medium
        } else {
            Strength::Strong
        }
    }

    pub fn is_opening(&self) -> bool {
        matches!(
            self.action,
            SignalAction::OpenLong | SignalAction::OpenShort
        )
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.action,
            SignalAction::CloseLong | SignalAction::CloseShort
        )
    }

    /// The direction the signal source is expressing
    pub fn direction(&self) -> Option<Direction> {
        match self.action {
            SignalAction::OpenLong | SignalAction::CloseShort => Some(Direction::Long),
            SignalAction::OpenShort | SignalAction::CloseLong => Some(Direction::Short),
            SignalAction::Control => None,
        }
    }

    /// Low-quantity opening signal: candidate for the reverse strategies
    pub fn is_reverse_trigger(&self) -> bool {
        self.kind == SignalKind::Directional
            && self.is_opening()
            && (self.quantity == 1.0 || self.quantity == 2.0)
    }

    /// High-quantity opening signal: candidate for the forward/rolling strategies
    pub fn is_forward_trigger(&self) -> bool {
        self.kind == SignalKind::Directional && self.is_opening() && self.quantity >= 3.0
    }

    /// Render in the canonical template accepted by the parser.
    ///
    /// `parse(render(s))` reproduces the signal fields for directional signals.
    pub fn render(&self) -> String {
        match self.kind {
            SignalKind::Control => self.raw.clone(),
            SignalKind::Directional => format!(
                "[{}] qty:{} market:{}",
                self.action.as_str(),
                self.quantity,
                self.symbol
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strength_tiers() {
        let weak =
            Signal::directional("x".into(), SignalAction::OpenLong, 1.0, "BTC-USDT-SWAP".into());
        assert_eq!(weak.strength(), Strength::Weak);
        assert_eq!(weak.confidence, 0.3);

        let medium =
            Signal::directional("x".into(), SignalAction::OpenLong, 3.0, "BTC-USDT-SWAP".into());
        assert_eq!(medium.strength(), Strength::Medium);
        assert_eq!(medium.confidence, 0.7);

        let strong =
            Signal::directional("x".into(), SignalAction::OpenShort, 5.0, "BTC-USDT-SWAP".into());
        assert_eq!(strong.strength(), Strength::Strong);
        assert_eq!(strong.confidence, 0.9);
    }

    #[test]
    fn test_opening_closing_tags() {
        let open =
            Signal::directional("x".into(), SignalAction::OpenShort, 1.0, "BTC-USDT-SWAP".into());
        assert!(open.is_opening());
        assert!(!open.is_closing());
        assert_eq!(open.direction(), Some(Direction::Short));

        let close =
            Signal::directional("x".into(), SignalAction::CloseLong, 1.0, "BTC-USDT-SWAP".into());
        assert!(close.is_closing());
        assert_eq!(close.direction(), Some(Direction::Short));
    }

    #[test]
    fn test_trigger_classification() {
        let reverse =
            Signal::directional("x".into(), SignalAction::OpenLong, 2.0, "BTC-USDT-SWAP".into());
        assert!(reverse.is_reverse_trigger());
        assert!(!reverse.is_forward_trigger());

        let forward =
            Signal::directional("x".into(), SignalAction::OpenLong, 4.0, "BTC-USDT-SWAP".into());
        assert!(forward.is_forward_trigger());
        assert!(!forward.is_reverse_trigger());

        // Closing signals trigger neither
        let close =
            Signal::directional("x".into(), SignalAction::CloseShort, 1.0, "BTC-USDT-SWAP".into());
        assert!(!close.is_reverse_trigger());
        assert!(!close.is_forward_trigger());
    }

    #[test]
    fn test_control_signal() {
        let signal = Signal::control("pause".into(), ControlCommand::Pause);
        assert_eq!(signal.kind, SignalKind::Control);
        assert_eq!(signal.symbol, "CONTROL");
        assert_eq!(signal.direction(), None);
    }

    #[test]
    fn test_render_canonical() {
        let signal = Signal::directional(
            "whatever".into(),
            SignalAction::OpenShort,
            1.0,
            "BTC-USDT-SWAP".into(),
        );
        assert_eq!(signal.render(), "[open-short] qty:1 market:BTC-USDT-SWAP");
    }
}
