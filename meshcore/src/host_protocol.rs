//! ASCII line protocol between the master node and its host machine.
//!
//! Ported from the doc comment at the top of `master_node.c`: commands are
//! whitespace-separated ASCII lines the host sends down the same UART the
//! master uses for its `defmt`/debug log, and events are `###`-prefixed
//! lines the master emits for the host to parse back out.

use core::fmt::Write;

use heapless::String;

use crate::node::NodeId;
use crate::wire::{
    RouteEntry, StatusChangeIndicatorEntry, MAX_LED_COLORS, MAX_STATUS_CHANGE_INDICATOR_ENTRIES,
};

pub const MAX_ROUTE_ENTRIES: usize = 16;

/// One decoded host command line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// `connect <NODE> <FIRST_HOP> <TIMEOUT>`
    Connect { node: NodeId, first_hop: NodeId, timeout_s: u32 },
    /// `retransmit <NODE>`
    Retransmit { node: NodeId },
    /// `reset_routes <NODE> <DST1>,<HOP1> ...`
    ResetRoutes {
        node: NodeId,
        entries: heapless::Vec<RouteEntry, MAX_ROUTE_ENTRIES>,
    },
    /// `set_routes <NODE> <DST1>,<HOP1> ...`
    SetRoutes {
        node: NodeId,
        entries: heapless::Vec<RouteEntry, MAX_ROUTE_ENTRIES>,
    },
    /// `configure_sensor <NODE> <CHANNEL> <PARAMS...>`
    ConfigureSensor { node: NodeId, channel: u8 },
    /// `enable_sensor <NODE> <MASK> <SPS>`
    EnableSensor { node: NodeId, mask: u16, sps: u16 },
    /// `raw_frames <NODE> <CHANNEL> <COUNT>`
    RawFrames { node: NodeId, channel: u8, count: u16 },
    /// `raw_status <NODE>`
    RawStatus { node: NodeId },
    /// `led <NODE> <COLOR0> <COLOR1> ...`
    Led {
        node: NodeId,
        colors: heapless::Vec<u8, MAX_LED_COLORS>,
    },
    /// `rebuild_status_channel <NODE>`
    RebuildStatusChannel { node: NodeId },
    /// `cfg_status_change_indicator <NODE> <CHANNEL>,<LED>,<COLOR> ...`
    CfgStatusChangeIndicator {
        node: NodeId,
        entries: heapless::Vec<StatusChangeIndicatorEntry, MAX_STATUS_CHANGE_INDICATOR_ENTRIES>,
    },
    /// `ping <NODE>`
    Ping { node: NodeId },
    /// `authping <NODE>`
    AuthPing { node: NodeId },
    /// `routes <DST1>:<HOP1>,<DST2>:<HOP2>,...`: the master's own routes.
    Routes { entries: heapless::Vec<RouteEntry, MAX_ROUTE_ENTRIES> },
}

/// A malformed or unrecognized host command line; the caller prints `###ERR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParseError;

fn parse_node(token: &str) -> Result<NodeId, ParseError> {
    token.parse::<u8>().map(NodeId::new).map_err(|_| ParseError)
}

/// Parses one `DST,HOP` or `DST:HOP` pair.
fn parse_pair(token: &str, sep: char) -> Result<RouteEntry, ParseError> {
    let mut parts = token.splitn(2, sep);
    let dst = parts.next().ok_or(ParseError)?;
    let hop = parts.next().ok_or(ParseError)?;
    Ok(RouteEntry {
        dst: parse_node(dst)?,
        next: parse_node(hop)?,
    })
}

fn parse_route_args<'a>(
    args: impl Iterator<Item = &'a str>,
    sep: char,
) -> Result<heapless::Vec<RouteEntry, MAX_ROUTE_ENTRIES>, ParseError> {
    let mut out = heapless::Vec::new();
    for token in args {
        let entry = parse_pair(token, sep)?;
        out.push(entry).map_err(|_| ParseError)?;
    }
    Ok(out)
}

/// Parses one comma-separated `routes` argument (`DST1:HOP1,DST2:HOP2,...`)
/// into entries.
fn parse_routes_csv(arg: &str) -> Result<heapless::Vec<RouteEntry, MAX_ROUTE_ENTRIES>, ParseError> {
    parse_route_args(arg.split(','), ':')
}

/// Parses one `CHANNEL,LED,COLOR` triple.
fn parse_status_change_indicator(token: &str) -> Result<StatusChangeIndicatorEntry, ParseError> {
    let mut parts = token.splitn(3, ',');
    let channel: u8 = parts.next().ok_or(ParseError)?.parse().map_err(|_| ParseError)?;
    let led: u8 = parts.next().ok_or(ParseError)?.parse().map_err(|_| ParseError)?;
    let color: u8 = parts.next().ok_or(ParseError)?.parse().map_err(|_| ParseError)?;
    Ok(StatusChangeIndicatorEntry { channel, led, color })
}

impl Command {
    /// Parses one trimmed, non-empty host command line.
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().ok_or(ParseError)?;

        match verb {
            "connect" => {
                let node = parse_node(tokens.next().ok_or(ParseError)?)?;
                let first_hop = parse_node(tokens.next().ok_or(ParseError)?)?;
                let timeout_s: u32 = tokens
                    .next()
                    .ok_or(ParseError)?
                    .parse()
                    .map_err(|_| ParseError)?;
                Ok(Command::Connect {
                    node,
                    first_hop,
                    timeout_s,
                })
            }
            "retransmit" => Ok(Command::Retransmit {
                node: parse_node(tokens.next().ok_or(ParseError)?)?,
            }),
            "reset_routes" | "set_routes" => {
                let node = parse_node(tokens.next().ok_or(ParseError)?)?;
                let entries = parse_route_args(tokens, ',')?;
                if verb == "reset_routes" {
                    Ok(Command::ResetRoutes { node, entries })
                } else {
                    Ok(Command::SetRoutes { node, entries })
                }
            }
            "configure_sensor" => {
                let node = parse_node(tokens.next().ok_or(ParseError)?)?;
                let channel: u8 = tokens
                    .next()
                    .ok_or(ParseError)?
                    .parse()
                    .map_err(|_| ParseError)?;
                Ok(Command::ConfigureSensor { node, channel })
            }
            "enable_sensor" => {
                let node = parse_node(tokens.next().ok_or(ParseError)?)?;
                let mask: u16 = tokens
                    .next()
                    .ok_or(ParseError)?
                    .parse()
                    .map_err(|_| ParseError)?;
                let sps: u16 = tokens
                    .next()
                    .ok_or(ParseError)?
                    .parse()
                    .map_err(|_| ParseError)?;
                Ok(Command::EnableSensor { node, mask, sps })
            }
            "raw_frames" => {
                let node = parse_node(tokens.next().ok_or(ParseError)?)?;
                let channel: u8 = tokens
                    .next()
                    .ok_or(ParseError)?
                    .parse()
                    .map_err(|_| ParseError)?;
                let count: u16 = tokens
                    .next()
                    .ok_or(ParseError)?
                    .parse()
                    .map_err(|_| ParseError)?;
                Ok(Command::RawFrames { node, channel, count })
            }
            "raw_status" => Ok(Command::RawStatus {
                node: parse_node(tokens.next().ok_or(ParseError)?)?,
            }),
            "led" => {
                let node = parse_node(tokens.next().ok_or(ParseError)?)?;
                let mut colors = heapless::Vec::new();
                for token in tokens {
                    let color: u8 = token.parse().map_err(|_| ParseError)?;
                    colors.push(color).map_err(|_| ParseError)?;
                }
                Ok(Command::Led { node, colors })
            }
            "rebuild_status_channel" => Ok(Command::RebuildStatusChannel {
                node: parse_node(tokens.next().ok_or(ParseError)?)?,
            }),
            "cfg_status_change_indicator" => {
                let node = parse_node(tokens.next().ok_or(ParseError)?)?;
                let mut entries = heapless::Vec::new();
                for token in tokens {
                    let entry = parse_status_change_indicator(token)?;
                    entries.push(entry).map_err(|_| ParseError)?;
                }
                Ok(Command::CfgStatusChangeIndicator { node, entries })
            }
            "ping" => Ok(Command::Ping {
                node: parse_node(tokens.next().ok_or(ParseError)?)?,
            }),
            "authping" => Ok(Command::AuthPing {
                node: parse_node(tokens.next().ok_or(ParseError)?)?,
            }),
            "routes" => {
                let arg = tokens.next().ok_or(ParseError)?;
                Ok(Command::Routes {
                    entries: parse_routes_csv(arg)?,
                })
            }
            _ => Err(ParseError),
        }
    }
}

/// One `###`-prefixed event line the master emits towards the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    Ack { node: NodeId, code: u8 },
    Status { node: NodeId, status: u16 },
    Raw { node: NodeId, count: u16 },
    Timeout { node: NodeId },
    Err,
}

impl Event {
    /// Formats this event as a `###`-prefixed line (no trailing newline).
    pub fn format(&self, out: &mut String<64>) -> core::fmt::Result {
        match self {
            Event::Ack { node, code } => write!(out, "###ACK{}-{}", node.as_u8(), code),
            Event::Status { node, status } => write!(out, "###STATUS{}-{}", node.as_u8(), status),
            Event::Raw { node, count } => write!(out, "###RAW{}-{}", node.as_u8(), count),
            Event::Timeout { node } => write!(out, "###TIMEOUT{}", node.as_u8()),
            Event::Err => write!(out, "###ERR"),
        }
    }

    /// Parses a `###`-prefixed event line (a gateway reads these back off
    /// the master's serial link).
    pub fn parse(line: &str) -> Result<Event, ParseError> {
        let rest = line.strip_prefix("###").ok_or(ParseError)?;
        let tag_end = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let (tag, rest) = rest.split_at(tag_end);

        if tag == "ERR" {
            return Ok(Event::Err);
        }
        if tag == "TIMEOUT" {
            return Ok(Event::Timeout { node: parse_node(rest)? });
        }

        let mut parts = rest.splitn(2, '-');
        let node = parse_node(parts.next().ok_or(ParseError)?)?;
        let value = parts.next().ok_or(ParseError)?;
        match tag {
            "ACK" => Ok(Event::Ack {
                node,
                code: value.parse().map_err(|_| ParseError)?,
            }),
            "STATUS" => Ok(Event::Status {
                node,
                status: value.parse().map_err(|_| ParseError)?,
            }),
            "RAW" => Ok(Event::Raw {
                node,
                count: value.parse().map_err(|_| ParseError)?,
            }),
            _ => Err(ParseError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect() {
        assert_eq!(
            Command::parse("connect 5 1 600").unwrap(),
            Command::Connect {
                node: NodeId::new(5),
                first_hop: NodeId::new(1),
                timeout_s: 600,
            }
        );
    }

    #[test]
    fn parses_reset_routes_with_multiple_pairs() {
        let cmd = Command::parse("reset_routes 3 4,1 5,1").unwrap();
        match cmd {
            Command::ResetRoutes { node, entries } => {
                assert_eq!(node, NodeId::new(3));
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0], RouteEntry { dst: NodeId::new(4), next: NodeId::new(1) });
                assert_eq!(entries[1], RouteEntry { dst: NodeId::new(5), next: NodeId::new(1) });
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_routes_csv_with_colon_separator() {
        let cmd = Command::parse("routes 4:1,5:2").unwrap();
        match cmd {
            Command::Routes { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0], RouteEntry { dst: NodeId::new(4), next: NodeId::new(1) });
                assert_eq!(entries[1], RouteEntry { dst: NodeId::new(5), next: NodeId::new(2) });
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_verb_and_missing_args() {
        assert_eq!(Command::parse("frobnicate 1 2"), Err(ParseError));
        assert_eq!(Command::parse("ping"), Err(ParseError));
    }

    #[test]
    fn parses_raw_status() {
        assert_eq!(
            Command::parse("raw_status 6").unwrap(),
            Command::RawStatus { node: NodeId::new(6) }
        );
    }

    #[test]
    fn parses_led_with_trailing_colors() {
        let cmd = Command::parse("led 2 1 2 3").unwrap();
        match cmd {
            Command::Led { node, colors } => {
                assert_eq!(node, NodeId::new(2));
                assert_eq!(colors.as_slice(), &[1, 2, 3]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_rebuild_status_channel() {
        assert_eq!(
            Command::parse("rebuild_status_channel 4").unwrap(),
            Command::RebuildStatusChannel { node: NodeId::new(4) }
        );
    }

    #[test]
    fn parses_cfg_status_change_indicator_with_multiple_entries() {
        let cmd = Command::parse("cfg_status_change_indicator 3 0,1,2 3,4,5").unwrap();
        match cmd {
            Command::CfgStatusChangeIndicator { node, entries } => {
                assert_eq!(node, NodeId::new(3));
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0], StatusChangeIndicatorEntry { channel: 0, led: 1, color: 2 });
                assert_eq!(entries[1], StatusChangeIndicatorEntry { channel: 3, led: 4, color: 5 });
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn formats_ack_and_timeout_events() {
        let mut s: String<64> = String::new();
        Event::Ack { node: NodeId::new(7), code: 0 }.format(&mut s).unwrap();
        assert_eq!(s.as_str(), "###ACK7-0");

        let mut s: String<64> = String::new();
        Event::Timeout { node: NodeId::new(9) }.format(&mut s).unwrap();
        assert_eq!(s.as_str(), "###TIMEOUT9");
    }

    #[test]
    fn parses_every_event_kind() {
        assert_eq!(Event::parse("###ACK7-0"), Ok(Event::Ack { node: NodeId::new(7), code: 0 }));
        assert_eq!(
            Event::parse("###STATUS3-12"),
            Ok(Event::Status { node: NodeId::new(3), status: 12 })
        );
        assert_eq!(Event::parse("###RAW2-100"), Ok(Event::Raw { node: NodeId::new(2), count: 100 }));
        assert_eq!(Event::parse("###TIMEOUT9"), Ok(Event::Timeout { node: NodeId::new(9) }));
        assert_eq!(Event::parse("###ERR"), Ok(Event::Err));
        assert_eq!(Event::parse("not an event"), Err(ParseError));
    }

    #[test]
    fn format_and_parse_round_trip() {
        let events = [
            Event::Ack { node: NodeId::new(1), code: 5 },
            Event::Status { node: NodeId::new(200), status: 0xBEEF },
            Event::Raw { node: NodeId::new(4), count: 30 },
            Event::Timeout { node: NodeId::new(254) },
            Event::Err,
        ];
        for event in events {
            let mut s: String<64> = String::new();
            event.format(&mut s).unwrap();
            assert_eq!(Event::parse(s.as_str()), Ok(event));
        }
    }
}
