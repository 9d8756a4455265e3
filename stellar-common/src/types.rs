use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Framing of the bytes carried in a telemetry unit.
///
/// Decided once per satellite in the configuration and carried through
/// unchanged; the streaming layer never inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Framing {
    #[default]
    #[serde(rename = "bitstream")]
    Bitstream,
    #[serde(rename = "ax25")]
    Ax25,
    #[serde(rename = "iq")]
    Iq,
    #[serde(rename = "free_text")]
    FreeText,
}

impl Framing {
    pub fn to_proto(&self) -> crate::proto::Framing {
        match self {
            Framing::Bitstream => crate::proto::Framing::Bitstream,
            Framing::Ax25 => crate::proto::Framing::Ax25,
            Framing::Iq => crate::proto::Framing::Iq,
            Framing::FreeText => crate::proto::Framing::FreeTextUtf8,
        }
    }

    pub fn from_proto(proto: crate::proto::Framing) -> Self {
        match proto {
            crate::proto::Framing::Bitstream => Framing::Bitstream,
            crate::proto::Framing::Ax25 => Framing::Ax25,
            crate::proto::Framing::Iq => Framing::Iq,
            crate::proto::Framing::FreeTextUtf8 => Framing::FreeText,
        }
    }

    /// Decode the raw enum value found on the wire. Unknown values are `None`.
    pub fn from_wire(value: i32) -> Option<Self> {
        crate::proto::Framing::try_from(value)
            .ok()
            .map(Framing::from_proto)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::Bitstream => "bitstream",
            Framing::Ax25 => "ax25",
            Framing::Iq => "iq",
            Framing::FreeText => "free_text",
        }
    }
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bitstream" => Ok(Framing::Bitstream),
            "ax25" | "ax.25" => Ok(Framing::Ax25),
            "iq" => Ok(Framing::Iq),
            "free_text" | "freetext" => Ok(Framing::FreeText),
            _ => Err(format!("Unknown framing: {}", s)),
        }
    }
}

/// Convert a chrono timestamp to its protobuf form.
pub fn to_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a protobuf timestamp to chrono. Returns `None` when the value is
/// outside the representable range or has negative nanos.
pub fn from_timestamp(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(ts.nanos).ok()?;
    if nanos >= 1_000_000_000 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(ts.seconds, nanos)
}
