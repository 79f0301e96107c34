//! Dissection engine.
//!
//! A capture is a text file with one chunk of link traffic per line:
//!
//! ```text
//! # seconds  dir  hex
//! 0.000100   >    024903..03
//! 0.004210   <    0249280176312e3003..03
//! ```
//!
//! `>` is host to display, `<` is display to host. Chunks need not align
//! with packets: each direction has its own codec, so a packet split over
//! several lines is reassembled before it is decoded.

use brlink::error::ProtocolError;
use brlink::model::{Inbound, Model};
use brlink::protocol::{Decoded, PacketCodec};
use colored::Colorize;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDisplay,
    DisplayToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::HostToDisplay => write!(f, "{}", "HOST>".cyan()),
            Direction::DisplayToHost => write!(f, "{}", "<DISP".yellow()),
        }
    }
}

/// One line of a capture file.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureChunk {
    pub timestamp: f64,
    pub direction: Direction,
    pub data: Vec<u8>,
}

/// Parse one capture line. Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> anyhow::Result<Option<CaptureChunk>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let (Some(time), Some(dir), Some(hex)) = (fields.next(), fields.next(), fields.next()) else {
        anyhow::bail!("expected TIME DIR HEX, got {line:?}");
    };
    let timestamp = time
        .parse()
        .map_err(|_| anyhow::anyhow!("bad timestamp {time:?}"))?;
    let direction = match dir {
        ">" => Direction::HostToDisplay,
        "<" => Direction::DisplayToHost,
        other => anyhow::bail!("bad direction {other:?}, expected > or <"),
    };
    let data = hex::decode(hex.replace(':', ""))?;

    Ok(Some(CaptureChunk {
        timestamp,
        direction,
        data,
    }))
}

#[derive(Debug)]
pub enum PacketContent {
    /// A packet the host sent, shown by type byte.
    Request { kind: u8, payload: Vec<u8> },
    /// A packet the display sent, as the model reads it.
    Inbound(Inbound),
    /// Bytes the codec threw away.
    Rejected(ProtocolError),
}

#[derive(Debug)]
pub struct DissectedPacket {
    pub timestamp: f64,
    pub direction: Direction,
    pub content: PacketContent,
}

impl fmt::Display for DissectedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>12.6} {} ", self.timestamp, self.direction)?;
        match &self.content {
            PacketContent::Request { kind, payload } => {
                let label = if kind.is_ascii_graphic() {
                    format!("'{}'", *kind as char)
                } else {
                    format!("{kind:#04x}")
                };
                write!(f, "{} {}", label.bold(), hex::encode(payload).dimmed())
            }
            PacketContent::Inbound(inbound) => match inbound {
                Inbound::Identity(profile) => write!(f, "{} {profile}", "IDENTITY".green()),
                Inbound::Acknowledged => write!(f, "{}", "ACK".green()),
                Inbound::Rejected { code } => write!(f, "{} code={code:#04x}", "NAK".red()),
                Inbound::Keys(events) => {
                    write!(f, "{}", "KEYS".blue())?;
                    for event in events {
                        let state = if event.pressed { "down" } else { "up" };
                        write!(f, " {:?}:{state}", event.code)?;
                    }
                    Ok(())
                }
                Inbound::Info(text) => write!(f, "{} {text:?}", "INFO".normal()),
                Inbound::Unknown(kind) => write!(f, "{} type={kind:#04x}", "UNKNOWN".yellow()),
                Inbound::Malformed(e) => write!(f, "{} {e}", "MALFORMED".red()),
            },
            PacketContent::Rejected(e) => write!(f, "{} {e}", "REJECTED".red().bold()),
        }
    }
}

/// Reassembles and decodes both directions of one link.
pub struct Dissector {
    model: Arc<dyn Model>,
    outbound: PacketCodec,
    inbound: PacketCodec,
}

impl Dissector {
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self {
            outbound: PacketCodec::new(model.grammar()),
            inbound: PacketCodec::new(model.grammar()),
            model,
        }
    }

    pub fn feed(&mut self, chunk: &CaptureChunk) -> Vec<DissectedPacket> {
        let codec = match chunk.direction {
            Direction::HostToDisplay => &mut self.outbound,
            Direction::DisplayToHost => &mut self.inbound,
        };
        let decoded = codec.feed(&chunk.data);

        decoded
            .into_iter()
            .map(|decoded| {
                let content = match (decoded, chunk.direction) {
                    (Decoded::Rejected(e), _) => PacketContent::Rejected(e),
                    (Decoded::Packet(payload), Direction::HostToDisplay) => {
                        PacketContent::Request {
                            kind: payload.first().copied().unwrap_or_default(),
                            payload: payload.to_vec(),
                        }
                    }
                    (Decoded::Packet(payload), Direction::DisplayToHost) => {
                        PacketContent::Inbound(self.model.interpret(&payload, Instant::now()))
                    }
                };
                DissectedPacket {
                    timestamp: chunk.timestamp,
                    direction: chunk.direction,
                    content,
                }
            })
            .collect()
    }

    /// Bytes held by either codec waiting for the rest of a packet.
    pub fn pending(&self) -> usize {
        self.outbound.buffered() + self.inbound.buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brlink::model::framed::FramedModel;
    use test_case::test_case;

    fn wire(model: &FramedModel, payload: &[u8]) -> String {
        hex::encode(model.grammar().frame(payload).unwrap())
    }

    #[test_case("" ; "blank")]
    #[test_case("   # comment" ; "comment")]
    fn test_skipped_lines(line: &str) {
        assert_eq!(parse_line(line).unwrap(), None);
    }

    #[test]
    fn test_parse_line() {
        let chunk = parse_line("0.25 < 02:49:03").unwrap().unwrap();
        assert_eq!(chunk.timestamp, 0.25);
        assert_eq!(chunk.direction, Direction::DisplayToHost);
        assert_eq!(chunk.data, vec![0x02, 0x49, 0x03]);
    }

    #[test_case("0.1 > zz" ; "bad hex")]
    #[test_case("0.1 ? 02" ; "bad direction")]
    #[test_case("soon > 02" ; "bad timestamp")]
    #[test_case("0.1 >" ; "missing field")]
    fn test_bad_lines(line: &str) {
        assert!(parse_line(line).is_err());
    }

    #[test]
    fn test_split_packet_is_reassembled() {
        let model = FramedModel::new();
        let mut dissector = Dissector::new(Arc::new(FramedModel::new()));
        let identity = wire(&model, b"I\x28\x01v1");
        let (head, tail) = identity.split_at(6);

        let first = parse_line(&format!("0.1 < {head}")).unwrap().unwrap();
        assert!(dissector.feed(&first).is_empty());
        assert!(dissector.pending() > 0);

        let second = parse_line(&format!("0.2 < {tail}")).unwrap().unwrap();
        let packets = dissector.feed(&second);
        assert_eq!(packets.len(), 1);
        assert!(matches!(
            &packets[0].content,
            PacketContent::Inbound(Inbound::Identity(p)) if p.columns == 40
        ));
        assert_eq!(dissector.pending(), 0);
    }

    #[test]
    fn test_directions_are_separate() {
        let model = FramedModel::new();
        let mut dissector = Dissector::new(Arc::new(FramedModel::new()));
        let line = format!("1.0 > {}", wire(&model, &[b'W', 0, 0, 1, 0x3f]));
        let packets = dissector.feed(&parse_line(&line).unwrap().unwrap());
        assert!(matches!(
            &packets[0].content,
            PacketContent::Request { kind: b'W', payload } if payload.len() == 5
        ));

        let line = format!("1.1 < {}", wire(&model, b"AW"));
        let packets = dissector.feed(&parse_line(&line).unwrap().unwrap());
        assert!(matches!(
            packets[0].content,
            PacketContent::Inbound(Inbound::Acknowledged)
        ));
    }
}
