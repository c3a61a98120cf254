//! ABI types and decoding for the controller contract.
//!
//! Consumed events: TargetTemperatureSet(int256), TargetHumiditySet(uint256), SystemErrorOccurred().
//! Issued calls: updateSensorData(int256,uint256,uint256), reportError(string), reportEnergyUsage(uint256).
//! Logs are decoded from the JSON-RPC log shape (eth_getLogs / eth_subscription result).

use crate::centi::{from_centi, from_centi_unsigned};
use alloy::primitives::{I256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use serde_json::Value;
use thiserror::Error;

alloy::sol! {
    interface IClimateController {
        event TargetTemperatureSet(int256 newTargetTemperature);
        event TargetHumiditySet(uint256 newTargetHumidity);
        event SystemErrorOccurred();

        function updateSensorData(int256 tempCenti, uint256 humidityCenti, uint256 powerCenti) external;
        function reportError(string reason) external;
        function reportEnergyUsage(uint256 whCenti) external;
    }
}

use IClimateController::{
    reportEnergyUsageCall, reportErrorCall, updateSensorDataCall, SystemErrorOccurred,
    TargetHumiditySet, TargetTemperatureSet,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("log missing {0}")]
    MissingField(&'static str),
    #[error("invalid hex in {field}: {reason}")]
    Hex { field: &'static str, reason: String },
    #[error("{event} data too short: {len} bytes")]
    ShortData { event: &'static str, len: usize },
    #[error("{event} value does not fit in 128 bits")]
    OutOfRange { event: &'static str },
    #[error("cannot encode {function}: {reason}")]
    Encode { function: &'static str, reason: String },
}

/// A contract log as delivered by the node, with hex fields already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: [u8; 20],
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: [u8; 32],
    pub log_index: u64,
    /// Set by the node when the log was dropped by a reorg.
    pub removed: bool,
}

impl RawLog {
    /// Parse a JSON-RPC log object.
    pub fn from_json(log: &Value) -> Result<Self, AbiError> {
        let field = |name: &'static str| -> Result<&str, AbiError> {
            log.get(name)
                .and_then(|v| v.as_str())
                .ok_or(AbiError::MissingField(name))
        };
        let address = parse_hex_fixed::<20>("address", field("address")?)?;
        let block_number = parse_hex_u64("blockNumber", field("blockNumber")?)?;
        let log_index = parse_hex_u64("logIndex", field("logIndex")?)?;
        let tx_hash = parse_hex_fixed::<32>("transactionHash", field("transactionHash")?)?;
        let data = parse_hex_bytes("data", field("data")?)?;
        let topics = log
            .get("topics")
            .and_then(|t| t.as_array())
            .ok_or(AbiError::MissingField("topics"))?
            .iter()
            .map(|t| {
                t.as_str()
                    .ok_or(AbiError::MissingField("topics"))
                    .and_then(|s| parse_hex_fixed::<32>("topics", s))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let removed = log.get("removed").and_then(|r| r.as_bool()).unwrap_or(false);
        Ok(Self {
            address,
            topics,
            data,
            block_number,
            tx_hash,
            log_index,
            removed,
        })
    }

    pub fn topic0(&self) -> Option<&[u8; 32]> {
        self.topics.first()
    }
}

/// Contract events the bridge reacts to. Values are raw centi-values as stored on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    TargetTemperatureSet { raw_centi: i128 },
    TargetHumiditySet { raw_centi: u128 },
    SystemErrorOccurred,
}

impl ChainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::TargetTemperatureSet { .. } => "TargetTemperatureSet",
            ChainEvent::TargetHumiditySet { .. } => "TargetHumiditySet",
            ChainEvent::SystemErrorOccurred => "SystemErrorOccurred",
        }
    }

    /// Setpoint as a float (`raw / 100.0`); None for events without a value.
    pub fn value(&self) -> Option<f64> {
        match *self {
            ChainEvent::TargetTemperatureSet { raw_centi } => Some(from_centi(raw_centi)),
            ChainEvent::TargetHumiditySet { raw_centi } => Some(from_centi_unsigned(raw_centi)),
            ChainEvent::SystemErrorOccurred => None,
        }
    }
}

/// Classify a log by topic0. Unknown topics (and logs without topics) yield `Ok(None)`.
pub fn decode_event(log: &RawLog) -> Result<Option<ChainEvent>, AbiError> {
    let topic0 = match log.topic0() {
        Some(t) => t,
        None => return Ok(None),
    };
    if *topic0 == TargetTemperatureSet::SIGNATURE_HASH.0 {
        let word = first_word(TargetTemperatureSet::SIGNATURE, &log.data)?;
        let raw_centi = word_to_i128(word).ok_or(AbiError::OutOfRange {
            event: "TargetTemperatureSet",
        })?;
        Ok(Some(ChainEvent::TargetTemperatureSet { raw_centi }))
    } else if *topic0 == TargetHumiditySet::SIGNATURE_HASH.0 {
        let word = first_word(TargetHumiditySet::SIGNATURE, &log.data)?;
        let raw_centi = word_to_u128(word).ok_or(AbiError::OutOfRange {
            event: "TargetHumiditySet",
        })?;
        Ok(Some(ChainEvent::TargetHumiditySet { raw_centi }))
    } else if *topic0 == SystemErrorOccurred::SIGNATURE_HASH.0 {
        Ok(Some(ChainEvent::SystemErrorOccurred))
    } else {
        Ok(None)
    }
}

fn first_word<'a>(event: &'static str, data: &'a [u8]) -> Result<&'a [u8], AbiError> {
    data.get(..32).ok_or(AbiError::ShortData {
        event,
        len: data.len(),
    })
}

/// Two's-complement int256 word → i128, if the upper 16 bytes are pure sign extension.
fn word_to_i128(word: &[u8]) -> Option<i128> {
    let (high, low) = word.split_at(16);
    let v = i128::from_be_bytes(low.try_into().ok()?);
    let fill = if v < 0 { 0xff } else { 0x00 };
    high.iter().all(|b| *b == fill).then_some(v)
}

fn word_to_u128(word: &[u8]) -> Option<u128> {
    let (high, low) = word.split_at(16);
    let v = u128::from_be_bytes(low.try_into().ok()?);
    high.iter().all(|b| *b == 0).then_some(v)
}

/// Contract calls issued by the bridge. Values are already scaled to centi-values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundTx {
    UpdateSensorData {
        temp_centi: i64,
        humidity_centi: u64,
        power_centi: u64,
    },
    ReportError {
        reason: String,
    },
    ReportEnergyUsage {
        wh_centi: u64,
    },
}

impl OutboundTx {
    pub fn function_name(&self) -> &'static str {
        match self {
            OutboundTx::UpdateSensorData { .. } => "updateSensorData",
            OutboundTx::ReportError { .. } => "reportError",
            OutboundTx::ReportEnergyUsage { .. } => "reportEnergyUsage",
        }
    }

    /// ABI-encoded calldata (selector followed by arguments).
    pub fn calldata(&self) -> Result<Vec<u8>, AbiError> {
        let data = match self {
            OutboundTx::UpdateSensorData {
                temp_centi,
                humidity_centi,
                power_centi,
            } => {
                let temp = I256::try_from(*temp_centi).map_err(|e| AbiError::Encode {
                    function: "updateSensorData",
                    reason: e.to_string(),
                })?;
                updateSensorDataCall {
                    tempCenti: temp,
                    humidityCenti: U256::from(*humidity_centi),
                    powerCenti: U256::from(*power_centi),
                }
                .abi_encode()
            }
            OutboundTx::ReportError { reason } => reportErrorCall {
                reason: reason.clone(),
            }
            .abi_encode(),
            OutboundTx::ReportEnergyUsage { wh_centi } => reportEnergyUsageCall {
                whCenti: U256::from(*wh_centi),
            }
            .abi_encode(),
        };
        Ok(data)
    }
}

fn parse_hex_bytes(field: &'static str, s: &str) -> Result<Vec<u8>, AbiError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| AbiError::Hex {
        field,
        reason: e.to_string(),
    })
}

fn parse_hex_u64(field: &'static str, s: &str) -> Result<u64, AbiError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| AbiError::Hex {
        field,
        reason: e.to_string(),
    })
}

fn parse_hex_fixed<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N], AbiError> {
    let bytes = parse_hex_bytes(field, s)?;
    bytes.try_into().map_err(|b: Vec<u8>| AbiError::Hex {
        field,
        reason: format!("expected {} bytes, got {}", N, b.len()),
    })
}
