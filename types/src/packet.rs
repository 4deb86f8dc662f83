//! In-flight IBC packets and their observed outcomes.

use serde::{Deserialize, Serialize};

/// Dedup identity of a packet: `"{source_channel}/{sequence}"`.
pub fn packet_key(source_channel: &str, sequence: u64) -> String {
    format!("{source_channel}/{sequence}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IbcPacket {
    pub sequence: u64,
    pub source_port: String,
    pub source_channel: String,
    pub dest_port: String,
    pub dest_channel: String,
    /// Raw packet data; for ICS-20 transfers this is the JSON
    /// `FungibleTokenPacketData` including the memo.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Unix nanoseconds, the IBC convention.
    pub timeout_timestamp: u64,
}

impl IbcPacket {
    pub fn key(&self) -> String {
        packet_key(&self.source_channel, self.sequence)
    }
}

/// Terminal outcome of a packet, as reported by the chain that sent it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "detail")]
pub enum PacketOutcome {
    /// Acknowledged without error.
    Success,
    /// Acknowledged with an application error.
    Error(String),
    /// The packet timed out before being received.
    Timeout,
}

impl PacketOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A packet outcome observed by a monitor, routed to the ack handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketEvent {
    pub chain_id: String,
    pub source_channel: String,
    pub dest_channel: String,
    pub sequence: u64,
    pub outcome: PacketOutcome,
}

impl PacketEvent {
    pub fn key(&self) -> String {
        packet_key(&self.source_channel, self.sequence)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(packet_key("channel-141", 7), "channel-141/7");
    }

    #[test]
    fn packet_round_trip() {
        let packet = IbcPacket {
            sequence: 42,
            source_port: "transfer".into(),
            source_channel: "channel-0".into(),
            dest_port: "transfer".into(),
            dest_channel: "channel-100".into(),
            data: b"{\"amount\":\"1\"}".to_vec(),
            timeout_timestamp: 1_700_000_000_000_000_000,
        };
        let json = serde_json::to_string(&packet).unwrap();
        assert_eq!(serde_json::from_str::<IbcPacket>(&json).unwrap(), packet);
        assert_eq!(packet.key(), "channel-0/42");
    }
}
