//! JSON message routing between the control peer and the chain.
//!
//! Inbound frames carry a `type` discriminator and are mapped to contract calls. Setpoint events
//! from the chain go out as one-field JSON objects, one concern per message.

use crate::abi::{ChainEvent, OutboundTx};
use crate::centi::{to_centi_signed, to_centi_unsigned};
use crate::listener::ChainEventHandler;
use crate::peer::PeerOutbox;
use crate::submitter::TxSubmitter;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("missing message type")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("status_update without physical_temp_celsius")]
    MissingTemperature,
    #[error("{field} = {value} is not representable on-chain")]
    Unrepresentable { field: &'static str, value: f64 },
}

/// A decoded message from the control peer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundControlMessage {
    StatusUpdate {
        temperature: f64,
        humidity: Option<f64>,
        power: Option<f64>,
    },
    SystemError {
        reason: String,
    },
    EnergyReport {
        total_wh: f64,
    },
}

#[derive(Deserialize)]
struct StatusUpdatePayload {
    physical_temp_celsius: Option<f64>,
    humidity_percent: Option<f64>,
    power_consumption_watts: Option<f64>,
}

#[derive(Deserialize)]
struct SystemErrorPayload {
    reason: String,
}

#[derive(Deserialize)]
struct EnergyReportPayload {
    total_wh: f64,
}

fn payload<'a, T: Deserialize<'a>>(kind: &'static str, value: &'a Value) -> Result<T, InboundError> {
    T::deserialize(value).map_err(|source| InboundError::Malformed { kind, source })
}

impl InboundControlMessage {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let value: Value = serde_json::from_str(text).map_err(InboundError::Json)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(InboundError::MissingType)?;
        match kind {
            "status_update" => {
                let p: StatusUpdatePayload = payload("status_update", &value)?;
                Ok(Self::StatusUpdate {
                    temperature: p.physical_temp_celsius.ok_or(InboundError::MissingTemperature)?,
                    humidity: p.humidity_percent,
                    power: p.power_consumption_watts,
                })
            }
            "system_error" => {
                let p: SystemErrorPayload = payload("system_error", &value)?;
                Ok(Self::SystemError { reason: p.reason })
            }
            "energy_report" => {
                let p: EnergyReportPayload = payload("energy_report", &value)?;
                Ok(Self::EnergyReport { total_wh: p.total_wh })
            }
            other => Err(InboundError::UnknownType(other.to_string())),
        }
    }

    /// Contract call for this message. Readings are passed through unfiltered; absent humidity or
    /// power is reported as zero.
    pub fn into_outbound(self) -> Result<OutboundTx, InboundError> {
        match self {
            Self::StatusUpdate {
                temperature,
                humidity,
                power,
            } => Ok(OutboundTx::UpdateSensorData {
                temp_centi: signed("physical_temp_celsius", temperature)?,
                humidity_centi: unsigned("humidity_percent", humidity.unwrap_or(0.0))?,
                power_centi: unsigned("power_consumption_watts", power.unwrap_or(0.0))?,
            }),
            Self::SystemError { reason } => Ok(OutboundTx::ReportError { reason }),
            Self::EnergyReport { total_wh } => Ok(OutboundTx::ReportEnergyUsage {
                wh_centi: unsigned("total_wh", total_wh)?,
            }),
        }
    }
}

fn signed(field: &'static str, value: f64) -> Result<i64, InboundError> {
    to_centi_signed(value).ok_or(InboundError::Unrepresentable { field, value })
}

fn unsigned(field: &'static str, value: f64) -> Result<u64, InboundError> {
    to_centi_unsigned(value).ok_or(InboundError::Unrepresentable { field, value })
}

/// Peer notification for a setpoint event. None for events that are only logged.
pub fn encode_setpoint(event: &ChainEvent) -> Option<String> {
    let value = event.value()?;
    let msg = match event {
        ChainEvent::TargetTemperatureSet { .. } => json!({ "temperature": value }),
        ChainEvent::TargetHumiditySet { .. } => json!({ "humidity": value }),
        ChainEvent::SystemErrorOccurred => return None,
    };
    Some(msg.to_string())
}

/// Connects the two sides: inbound frames become transactions, chain events become peer
/// notifications. Neither direction waits on the network.
pub struct MessageRouter {
    submitter: TxSubmitter,
    outbox: PeerOutbox,
}

impl MessageRouter {
    pub fn new(submitter: TxSubmitter, outbox: PeerOutbox) -> Self {
        Self { submitter, outbox }
    }

    /// Decode one inbound frame and enqueue the resulting transaction. Never blocks on submission.
    pub fn route_inbound(&self, text: &str) {
        let msg = match InboundControlMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(reason = %e, raw = %text, "inbound message dropped");
                return;
            }
        };
        tracing::info!(?msg, "inbound control message");
        match msg.into_outbound() {
            Ok(tx) => self.submitter.submit(tx),
            Err(e) => tracing::warn!(reason = %e, "inbound message dropped"),
        }
    }

    /// Drain the inbound channel until every sender is gone.
    pub async fn run_inbound(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = inbound.recv().await {
            self.route_inbound(&text);
        }
        tracing::debug!("inbound channel closed");
    }
}

impl ChainEventHandler for MessageRouter {
    async fn handle(&self, event: ChainEvent) {
        let Some(payload) = encode_setpoint(&event) else {
            tracing::warn!(event = event.name(), "system error reported on-chain");
            return;
        };
        tracing::info!(event = event.name(), %payload, "relaying setpoint to control peer");
        self.outbox.send(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_update_with_optional_fields() {
        let msg = InboundControlMessage::parse(
            r#"{"type":"status_update","physical_temp_celsius":4.25,"humidity_percent":61.5}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundControlMessage::StatusUpdate {
                temperature: 4.25,
                humidity: Some(61.5),
                power: None,
            }
        );
        assert_eq!(
            msg.into_outbound().unwrap(),
            OutboundTx::UpdateSensorData {
                temp_centi: 425,
                humidity_centi: 6150,
                power_centi: 0,
            }
        );
    }

    #[test]
    fn status_update_without_temperature_is_rejected() {
        let err = InboundControlMessage::parse(r#"{"type":"status_update","humidity_percent":50}"#).unwrap_err();
        assert!(matches!(err, InboundError::MissingTemperature));
        let err = InboundControlMessage::parse(r#"{"type":"status_update","physical_temp_celsius":null}"#)
            .unwrap_err();
        assert!(matches!(err, InboundError::MissingTemperature));
    }

    #[test]
    fn energy_report_scales_to_centi() {
        let tx = InboundControlMessage::parse(r#"{"type":"energy_report","total_wh":76.15}"#)
            .unwrap()
            .into_outbound()
            .unwrap();
        assert_eq!(tx, OutboundTx::ReportEnergyUsage { wh_centi: 7615 });
    }

    #[test]
    fn system_error_maps_to_report_error() {
        let tx = InboundControlMessage::parse(r#"{"type":"system_error","reason":"compressor stalled"}"#)
            .unwrap()
            .into_outbound()
            .unwrap();
        assert_eq!(
            tx,
            OutboundTx::ReportError {
                reason: "compressor stalled".into()
            }
        );
    }

    #[test]
    fn rejects_bad_discriminators() {
        assert!(matches!(
            InboundControlMessage::parse(r#"{"reason":"x"}"#),
            Err(InboundError::MissingType)
        ));
        assert!(matches!(
            InboundControlMessage::parse(r#"{"type":42}"#),
            Err(InboundError::MissingType)
        ));
        assert!(matches!(
            InboundControlMessage::parse(r#"{"type":"reboot"}"#),
            Err(InboundError::UnknownType(t)) if t == "reboot"
        ));
        assert!(matches!(
            InboundControlMessage::parse("not json"),
            Err(InboundError::Json(_))
        ));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(matches!(
            InboundControlMessage::parse(r#"{"type":"energy_report","total_wh":"lots"}"#),
            Err(InboundError::Malformed { kind: "energy_report", .. })
        ));
        assert!(matches!(
            InboundControlMessage::parse(r#"{"type":"system_error"}"#),
            Err(InboundError::Malformed { kind: "system_error", .. })
        ));
    }

    #[test]
    fn negative_energy_is_unrepresentable() {
        let err = InboundControlMessage::EnergyReport { total_wh: -1.0 }
            .into_outbound()
            .unwrap_err();
        assert!(matches!(err, InboundError::Unrepresentable { field: "total_wh", .. }));
    }

    #[test]
    fn encodes_setpoints() {
        assert_eq!(
            encode_setpoint(&ChainEvent::TargetTemperatureSet { raw_centi: 1200 }).as_deref(),
            Some(r#"{"temperature":12.0}"#)
        );
        assert_eq!(
            encode_setpoint(&ChainEvent::TargetTemperatureSet { raw_centi: -250 }).as_deref(),
            Some(r#"{"temperature":-2.5}"#)
        );
        assert_eq!(
            encode_setpoint(&ChainEvent::TargetHumiditySet { raw_centi: 6550 }).as_deref(),
            Some(r#"{"humidity":65.5}"#)
        );
        assert_eq!(encode_setpoint(&ChainEvent::SystemErrorOccurred), None);
    }

    #[test]
    fn huge_humidity_setpoint_is_not_negative() {
        let msg = encode_setpoint(&ChainEvent::TargetHumiditySet { raw_centi: u128::MAX }).unwrap();
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert!(v["humidity"].as_f64().unwrap() > 0.0);
    }
}
