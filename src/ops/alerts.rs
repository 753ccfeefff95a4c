use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::Sender;

/// Operator-facing alert conditions. The transport (Telegram) is injected;
/// this layer only classifies, dedups and hands off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    LiveArmed,
    LiveTrading,
    StartupDowngrade,
    Halted,
    HaltedDaily,
    WsDown,
    ClockSkew,
    OrphanRisk,
    PendingUnknownMismatch,
    CostAccountingDegraded,
    ConfigTamper,
    WalletRefStale,
    ReconcileEscalation,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LiveArmed => "LIVE_ARMED",
            AlertKind::LiveTrading => "LIVE_TRADING",
            AlertKind::StartupDowngrade => "STARTUP_DOWNGRADE",
            AlertKind::Halted => "HALTED",
            AlertKind::HaltedDaily => "HALTED_DAILY",
            AlertKind::WsDown => "WS_DOWN",
            AlertKind::ClockSkew => "CLOCK_SKEW",
            AlertKind::OrphanRisk => "ORPHAN_RISK",
            AlertKind::PendingUnknownMismatch => "PENDING_UNKNOWN_MISMATCH",
            AlertKind::CostAccountingDegraded => "COST_ACCOUNTING_DEGRADED",
            AlertKind::ConfigTamper => "CONFIG_TAMPER",
            AlertKind::WalletRefStale => "WALLET_REF_STALE",
            AlertKind::ReconcileEscalation => "RECONCILE_ESCALATION",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub dedup_key: String,
    pub message: String,
    pub ts_ms: i64,
}

pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: Alert);
}

/// Forwards alerts into an mpsc channel; the control transport drains it.
pub struct ChannelSink {
    tx: Sender<Alert>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Alert>) -> Self {
        Self { tx }
    }
}

impl AlertSink for ChannelSink {
    fn emit(&self, alert: Alert) {
        if self.tx.try_send(alert).is_err() {
            tracing::warn!(target: "alerts", "alert channel full or closed; dropping alert");
        }
    }
}

/// Dedup-keyed alert router. Repeats of the same dedup key inside the window
/// are suppressed so a flapping condition cannot flood the operator.
pub struct AlertRouter {
    sink: Box<dyn AlertSink>,
    dedup_window_ms: i64,
    last_sent: Mutex<HashMap<String, i64>>,
}

impl AlertRouter {
    pub fn new(sink: Box<dyn AlertSink>, dedup_window_ms: i64) -> Self {
        Self {
            sink,
            dedup_window_ms,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn raise(&self, kind: AlertKind, dedup_key: impl Into<String>, message: impl Into<String>, now_ms: i64) {
        let dedup_key = dedup_key.into();
        let message = message.into();
        {
            let mut last = self.last_sent.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(sent_ms) = last.get(&dedup_key) {
                if now_ms.saturating_sub(*sent_ms) < self.dedup_window_ms {
                    tracing::debug!(
                        target: "alerts",
                        kind = kind.as_str(),
                        dedup_key = %dedup_key,
                        "alert suppressed inside dedup window"
                    );
                    return;
                }
            }
            last.insert(dedup_key.clone(), now_ms);
        }

        tracing::warn!(
            target: "alerts",
            kind = kind.as_str(),
            dedup_key = %dedup_key,
            message = %message,
            "alert raised"
        );
        self.sink.emit(Alert {
            kind,
            dedup_key,
            message,
            ts_ms: now_ms,
        });
    }
}
