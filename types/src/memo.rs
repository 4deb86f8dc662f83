//! Wire formats for packet memos.
//!
//! Two JSON shapes cross chain boundaries and must stay bit-level stable:
//! the `htlc_create` memo describing the mirrored HTLC, and the nested
//! `forward` memo consumed by packet-forward middleware on intermediate
//! hops. Inbound memos arrive in heterogeneous layouts (bare, nested under
//! an `htlc` key, or tucked inside `forward.memo`), so parsing goes through
//! a single tagged [`MemoBody`] that downstream code pattern-matches.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Maximum accepted size of an inbound memo payload, in bytes.
pub const MAX_MEMO_BYTES: usize = 256;

/// The HTLC mirror memo carried by the final hop of a transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtlcMemo {
    pub htlc_id: String,
    pub receiver: String,
    /// 32-byte hashlock, hex encoded.
    pub hashlock: String,
    /// Unix seconds.
    pub timelock: u64,
    pub source_chain: String,
    #[serde(rename = "sourceHTLCId")]
    pub source_htlc_id: String,
    pub target_chain: String,
    pub target_address: String,
}

/// Type-tagged envelope for memos; `{"type":"htlc_create",...}` on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypedMemo {
    #[serde(rename = "htlc_create")]
    HtlcCreate(HtlcMemo),
}

impl HtlcMemo {
    /// Serialize with the `htlc_create` type tag.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&TypedMemo::HtlcCreate(self.clone()))
            .expect("htlc memo serialization cannot fail")
    }
}

/// One level of a packet-forward instruction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardInstruction {
    pub receiver: String,
    pub port: String,
    pub channel: String,
    /// Relative duration string, e.g. `"3600s"`.
    pub timeout: String,
    pub retries: u8,
    /// Position of this hop in the planned route, counted from the first
    /// forwarding chain. Lets the ack handler recover the hop without a
    /// channel table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<ForwardMemo>>,
    /// JSON-encoded [`TypedMemo`], present on the deepest hop only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Some senders attach the HTLC memo as a sibling object instead of an
    /// encoded string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htlc: Option<HtlcMemo>,
}

/// Nested forward memo: `{"forward":{...,"next":{"forward":{...}}}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMemo {
    pub forward: ForwardInstruction,
}

impl ForwardMemo {
    /// Number of forward levels, including this one.
    pub fn depth(&self) -> usize {
        1 + self.forward.next.as_deref().map_or(0, ForwardMemo::depth)
    }

    /// The deepest forward instruction in the chain.
    pub fn innermost(&self) -> &ForwardInstruction {
        match &self.forward.next {
            Some(next) => next.innermost(),
            None => &self.forward,
        }
    }

    /// The HTLC memo carried by the deepest hop, whether attached as an
    /// encoded `memo` string or a sibling `htlc` object.
    pub fn htlc_memo(&self) -> Option<HtlcMemo> {
        let inner = self.innermost();
        if let Some(htlc) = &inner.htlc {
            return Some(htlc.clone());
        }
        let raw = inner.memo.as_deref()?;
        match MemoBody::parse(raw) {
            MemoBody::Plain(memo) => Some(memo),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("forward memo serialization cannot fail")
    }
}

/// Parsed shape of an inbound memo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoBody {
    /// A bare `htlc_create` memo.
    Plain(HtlcMemo),
    /// A forward memo, with the HTLC memo extracted from the deepest hop
    /// when one is present.
    Forwarded {
        forward: ForwardMemo,
        inner: Option<HtlcMemo>,
    },
    /// Anything else; callers log and drop.
    Unknown,
}

impl MemoBody {
    pub fn parse(raw: &str) -> MemoBody {
        if let Ok(TypedMemo::HtlcCreate(memo)) = serde_json::from_str::<TypedMemo>(raw) {
            return MemoBody::Plain(memo);
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
            return MemoBody::Unknown;
        };
        if let Some(htlc) = value.get("htlc") {
            if let Ok(TypedMemo::HtlcCreate(memo)) =
                serde_json::from_value::<TypedMemo>(htlc.clone())
            {
                return MemoBody::Plain(memo);
            }
            if let Ok(memo) = serde_json::from_value::<HtlcMemo>(htlc.clone()) {
                return MemoBody::Plain(memo);
            }
        }
        if value.get("forward").is_some() {
            if let Ok(forward) = serde_json::from_value::<ForwardMemo>(value) {
                let inner = forward.htlc_memo();
                return MemoBody::Forwarded { forward, inner };
            }
        }
        MemoBody::Unknown
    }

    /// The HTLC memo carried by this body, if any.
    pub fn htlc(&self) -> Option<&HtlcMemo> {
        match self {
            MemoBody::Plain(memo) => Some(memo),
            MemoBody::Forwarded { inner, .. } => inner.as_ref(),
            MemoBody::Unknown => None,
        }
    }
}

const BIDI_OVERRIDES: [char; 9] = [
    '\u{202a}', '\u{202b}', '\u{202c}', '\u{202d}', '\u{202e}', '\u{2066}', '\u{2067}',
    '\u{2068}', '\u{2069}',
];

const INJECTION_MARKERS: [&str; 8] = [
    "$(", "`", "&&", "||", ";--", "'--", "union select", "drop table",
];

/// Reject text that contains control bytes, Unicode bidi overrides, or
/// known shell/SQL injection markers. Applied to every externally supplied
/// string that ends up inside a memo (receivers, addresses, memo payloads).
pub fn validate_text(raw: &str) -> Result<(), RelayError> {
    if raw.chars().any(char::is_control) {
        return Err(RelayError::Validation("text contains control bytes".into()));
    }
    if raw.chars().any(|c| BIDI_OVERRIDES.contains(&c)) {
        return Err(RelayError::Validation(
            "text contains bidirectional override characters".into(),
        ));
    }
    let lowered = raw.to_lowercase();
    for marker in INJECTION_MARKERS {
        if lowered.contains(marker) {
            return Err(RelayError::Validation(format!(
                "text contains injection marker {marker:?}"
            )));
        }
    }
    Ok(())
}

/// Reject inbound memo payloads that are oversized or fail [`validate_text`].
pub fn validate_memo(raw: &str) -> Result<(), RelayError> {
    if raw.len() > MAX_MEMO_BYTES {
        return Err(RelayError::Validation(format!(
            "memo is {} bytes, limit is {MAX_MEMO_BYTES}",
            raw.len()
        )));
    }
    validate_text(raw)
}

/// `channel-<n>`
pub fn is_valid_channel_id(s: &str) -> bool {
    s.strip_prefix("channel-")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// `transfer`, `wasm.<contract>`, or a bare lowercase word.
pub fn is_valid_port_id(s: &str) -> bool {
    if s == "transfer" {
        return true;
    }
    if let Some(rest) = s.strip_prefix("wasm.") {
        return !rest.is_empty()
            && rest
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    }
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase())
}

/// `ibc/<64 uppercase hex>` or a bare lowercase denom.
pub fn is_valid_denom(s: &str) -> bool {
    if let Some(hash) = s.strip_prefix("ibc/") {
        return hash.len() == 64
            && hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b));
    }
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase())
}

/// 32-byte hex string, optionally `0x`-prefixed.
pub fn is_valid_hashlock(s: &str) -> bool {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    digits.len() == 64 && digits.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_memo() -> HtlcMemo {
        HtlcMemo {
            htlc_id: "htlc-42".into(),
            receiver: "osm1recv".into(),
            hashlock: "ab".repeat(32),
            timelock: 1_700_014_400,
            source_chain: "eth".into(),
            source_htlc_id: "0xabc01".into(),
            target_chain: "osm-1".into(),
            target_address: "osm1recv".into(),
        }
    }

    #[test]
    fn htlc_memo_round_trip() {
        let memo = sample_memo();
        let json = memo.to_json();
        assert_eq!(MemoBody::parse(&json), MemoBody::Plain(memo));
    }

    #[test]
    fn htlc_memo_wire_keys() {
        let json = sample_memo().to_json();
        assert!(json.starts_with(r#"{"type":"htlc_create""#));
        for key in [
            "htlcId",
            "receiver",
            "hashlock",
            "timelock",
            "sourceChain",
            "sourceHTLCId",
            "targetChain",
            "targetAddress",
        ] {
            assert!(json.contains(&format!("\"{key}\"")), "missing {key}: {json}");
        }
    }

    #[test]
    fn parses_memo_nested_under_htlc_key() {
        let memo = sample_memo();
        let wrapped = format!(r#"{{"htlc":{}}}"#, memo.to_json());
        assert_eq!(MemoBody::parse(&wrapped), MemoBody::Plain(memo));
    }

    #[test]
    fn forward_memo_round_trip_preserves_inner_htlc() {
        let memo = sample_memo();
        let forward = ForwardMemo {
            forward: ForwardInstruction {
                receiver: "hub1pfm".into(),
                port: "transfer".into(),
                channel: "channel-0".into(),
                timeout: "3600s".into(),
                retries: 2,
                hop_index: Some(0),
                next: Some(Box::new(ForwardMemo {
                    forward: ForwardInstruction {
                        receiver: "osm1recv".into(),
                        port: "transfer".into(),
                        channel: "channel-141".into(),
                        timeout: "1800s".into(),
                        retries: 2,
                        hop_index: Some(1),
                        next: None,
                        memo: Some(memo.to_json()),
                        htlc: None,
                    },
                })),
                memo: None,
                htlc: None,
            },
        };
        let json = forward.to_json();
        match MemoBody::parse(&json) {
            MemoBody::Forwarded {
                forward: parsed,
                inner,
            } => {
                assert_eq!(parsed, forward);
                assert_eq!(inner, Some(memo));
            },
            other => panic!("expected forwarded memo, got {other:?}"),
        }
        assert_eq!(forward.depth(), 2);
        assert_eq!(forward.innermost().channel, "channel-141");
    }

    #[test]
    fn sibling_htlc_field_is_accepted() {
        let memo = sample_memo();
        let forward = ForwardMemo {
            forward: ForwardInstruction {
                receiver: "osm1recv".into(),
                port: "transfer".into(),
                channel: "channel-141".into(),
                timeout: "1800s".into(),
                retries: 2,
                hop_index: None,
                next: None,
                memo: None,
                htlc: Some(memo.clone()),
            },
        };
        assert_eq!(forward.htlc_memo(), Some(memo));
    }

    #[test]
    fn garbage_parses_to_unknown() {
        assert_eq!(MemoBody::parse("not json"), MemoBody::Unknown);
        assert_eq!(MemoBody::parse(r#"{"type":"other"}"#), MemoBody::Unknown);
        assert_eq!(MemoBody::parse("{}"), MemoBody::Unknown);
    }

    #[test]
    fn memo_validation() {
        assert!(validate_memo(r#"{"type":"htlc_create"}"#).is_ok());
        assert!(validate_memo(&"x".repeat(MAX_MEMO_BYTES + 1)).is_err());
        assert!(validate_memo("hello\u{0000}world").is_err());
        assert!(validate_memo("hello\u{202e}world").is_err());
        assert!(validate_memo("x; DROP TABLE swaps;--").is_err());
        assert!(validate_memo("$(rm -rf /)").is_err());
    }

    #[test]
    fn identifier_validation() {
        assert!(is_valid_channel_id("channel-0"));
        assert!(is_valid_channel_id("channel-141"));
        assert!(!is_valid_channel_id("channel-"));
        assert!(!is_valid_channel_id("chan-1"));

        assert!(is_valid_port_id("transfer"));
        assert!(is_valid_port_id("wasm.osm1contract9"));
        assert!(is_valid_port_id("icahost"));
        assert!(!is_valid_port_id("wasm."));
        assert!(!is_valid_port_id("Transfer"));

        assert!(is_valid_denom("uatom"));
        assert!(is_valid_denom(&format!("ibc/{}", "A1".repeat(32))));
        assert!(!is_valid_denom(&format!("ibc/{}", "a1".repeat(32))));
        assert!(!is_valid_denom("ibc/short"));

        assert!(is_valid_hashlock(&"ab".repeat(32)));
        assert!(is_valid_hashlock(&format!("0x{}", "AB".repeat(32))));
        assert!(!is_valid_hashlock("abc"));
    }
}
