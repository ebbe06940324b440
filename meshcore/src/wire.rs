//! Wire message types and byte-level (de)serialization.
//!
//! Ported from `messagetypes.h`. The original used packed C structs;
//! `meshcore` instead encodes/decodes explicitly byte-by-byte in network
//! (little-endian) order, which is portable and doesn't depend on the
//! target's struct layout rules.

use crate::node::NodeId;

/// Standard ACK result codes (command-specific codes above 5 are allowed).
pub const ACK_OK: u8 = 0;
pub const ACK_WRONGSIZE: u8 = 1;
pub const ACK_BADINDEX: u8 = 2;
pub const ACK_BADPARAM: u8 = 3;
pub const ACK_NOTSUP: u8 = 4;
pub const ACK_BADSTATE: u8 = 5;
/// Set on the result code when this ACK is a retransmission of a previous one.
pub const ACK_RETRANSMIT: u8 = 0x80;

/// `MSG_HS_2_STATUS_*` bits carried in [`AuthHs2`] to fold a reconnect's
/// worth of status into the handshake reply.
pub const HS2_STATUS_ROUTES: u8 = 1;
pub const HS2_STATUS_SENSOR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageType {
    AuthHs1,
    AuthHs2,
    AuthAck,
    RouteReset,
    RouteAppend,
    ConfigureSensorChannel,
    StartSensor,
    BeginSendRawFrames,
    GetRawStatus,
    Nop,
    Led,
    RebuildStatusChannel,
    ConfigureStatusChangeIndicator,
    ConfigureFreqChannel,
    StatusUpdate,
    EchoRequest,
    EchoReply,
    RawFrameValues,
    RawStatus,
    Unknown(u8),
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::AuthHs1 => 1,
            MessageType::AuthHs2 => 2,
            MessageType::AuthAck => 3,
            MessageType::RouteReset => 4,
            MessageType::RouteAppend => 5,
            MessageType::ConfigureSensorChannel => 6,
            MessageType::StartSensor => 7,
            MessageType::BeginSendRawFrames => 8,
            MessageType::GetRawStatus => 9,
            MessageType::Nop => 10,
            MessageType::Led => 11,
            MessageType::RebuildStatusChannel => 12,
            MessageType::ConfigureStatusChangeIndicator => 13,
            MessageType::ConfigureFreqChannel => 14,
            MessageType::StatusUpdate => 64,
            MessageType::EchoRequest => 128,
            MessageType::EchoReply => 129,
            MessageType::RawFrameValues => 130,
            MessageType::RawStatus => 131,
            MessageType::Unknown(c) => c,
        }
    }

    /// Message types at or above this code travel unauthenticated.
    pub const UNSIGNED_THRESHOLD: u8 = 128;

    pub fn is_signed(self) -> bool {
        self.code() < Self::UNSIGNED_THRESHOLD
    }
}

impl From<u8> for MessageType {
    fn from(code: u8) -> Self {
        match code {
            1 => MessageType::AuthHs1,
            2 => MessageType::AuthHs2,
            3 => MessageType::AuthAck,
            4 => MessageType::RouteReset,
            5 => MessageType::RouteAppend,
            6 => MessageType::ConfigureSensorChannel,
            7 => MessageType::StartSensor,
            8 => MessageType::BeginSendRawFrames,
            9 => MessageType::GetRawStatus,
            10 => MessageType::Nop,
            11 => MessageType::Led,
            12 => MessageType::RebuildStatusChannel,
            13 => MessageType::ConfigureStatusChangeIndicator,
            14 => MessageType::ConfigureFreqChannel,
            64 => MessageType::StatusUpdate,
            128 => MessageType::EchoRequest,
            129 => MessageType::EchoReply,
            130 => MessageType::RawFrameValues,
            131 => MessageType::RawStatus,
            other => MessageType::Unknown(other),
        }
    }
}

/// Failure decoding a fixed-layout message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    TooShort,
    WrongType,
}

/// `MSG_TYPE_AUTH_HS_1`: carries a temporary route back to the master for
/// the handshake reply. Unsigned — anyone can send a valid HS1, so it must
/// never itself change configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHs1 {
    pub reply_route: NodeId,
}

impl AuthHs1 {
    pub const LEN: usize = 2;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::AuthHs1.code();
        out[1] = self.reply_route.as_u8();
        Ok(Self::LEN)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::AuthHs1.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(AuthHs1 {
            reply_route: NodeId::new(data[1]),
        })
    }
}

/// `MSG_TYPE_AUTH_HS_2`: signed handshake reply, carrying a status summary
/// so a reconnect doesn't need a separate status round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHs2 {
    pub status: u8,
    pub channels: u16,
}

impl AuthHs2 {
    pub const LEN: usize = 4;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::AuthHs2.code();
        out[1] = self.status;
        out[2..4].copy_from_slice(&self.channels.to_le_bytes());
        Ok(Self::LEN)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::AuthHs2.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(AuthHs2 {
            status: data[1],
            channels: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

/// `MSG_TYPE_AUTH_ACK`: only ever sent by the auth slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthAck {
    pub result_code: u8,
}

impl AuthAck {
    pub const LEN: usize = 2;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::AuthAck.code();
        out[1] = self.result_code;
        Ok(Self::LEN)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::AuthAck.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(AuthAck {
            result_code: data[1],
        })
    }
}

/// One `(dst, next_hop)` pair of a `MSG_TYPE_ROUTE_RESET`/`MSG_TYPE_ROUTE_APPEND` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteEntry {
    pub dst: NodeId,
    pub next: NodeId,
}

/// Decodes the `(dst, next)` pairs following the type byte of a route message.
pub fn decode_route_entries(
    data: &[u8],
    out: &mut [RouteEntry],
) -> Result<usize, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::TooShort);
    }
    let body = &data[1..];
    if body.len() % 2 != 0 || body.is_empty() {
        return Err(DecodeError::TooShort);
    }
    let count = body.len() / 2;
    if count > out.len() {
        return Err(DecodeError::TooShort);
    }
    for (i, slot) in out.iter_mut().take(count).enumerate() {
        *slot = RouteEntry {
            dst: NodeId::new(body[i * 2]),
            next: NodeId::new(body[i * 2 + 1]),
        };
    }
    Ok(count)
}

/// `MSG_TYPE_CONFIGURE_SENSOR_CHANNEL` header (the trailing
/// `state_estimation_params_t` is decoded separately by
/// [`crate::estimator`] since its shape is config-driven).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureSensorHeader {
    pub channel_id: u8,
}

impl ConfigureSensorHeader {
    pub const LEN: usize = 2;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::ConfigureSensorChannel.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(ConfigureSensorHeader {
            channel_id: data[1],
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::ConfigureSensorChannel.code();
        out[1] = self.channel_id;
        Ok(Self::LEN)
    }
}

/// Encodes the state-estimation tuning parameters that follow a
/// [`ConfigureSensorHeader`] in a `MSG_TYPE_CONFIGURE_SENSOR` command.
/// Mirrors `sensor_controller.rs`'s decoder byte-for-byte.
pub fn encode_state_estimation_params(
    params: &crate::estimator::StateEstimationParams,
    out: &mut [u8],
) -> Result<usize, DecodeError> {
    use crate::estimator::STATECOUNT;

    const INPUT_LEN: usize = 6;
    const MATRIX_LEN: usize = (STATECOUNT - 1) * STATECOUNT * 2;
    const WINDOW_LEN: usize = STATECOUNT * 2;
    const TAIL_LEN: usize = 4;
    const TOTAL_LEN: usize = INPUT_LEN + MATRIX_LEN + WINDOW_LEN + TAIL_LEN;

    if out.len() < TOTAL_LEN {
        return Err(DecodeError::TooShort);
    }

    out[0..2].copy_from_slice(&params.input_filter.mid_value_adjustment_speed.to_le_bytes());
    out[2..4].copy_from_slice(&params.input_filter.lowpass_weight.to_le_bytes());
    out[4..6].copy_from_slice(&params.input_filter.num_samples.to_le_bytes());

    for (i, &entry) in params.state_filter.transition_matrix.iter().enumerate() {
        let off = INPUT_LEN + i * 2;
        out[off..off + 2].copy_from_slice(&entry.to_le_bytes());
    }

    for (i, &size) in params.state_filter.window_sizes.iter().enumerate() {
        let off = INPUT_LEN + MATRIX_LEN + i * 2;
        out[off..off + 2].copy_from_slice(&size.to_le_bytes());
    }

    let tail_off = INPUT_LEN + MATRIX_LEN + WINDOW_LEN;
    out[tail_off..tail_off + 2].copy_from_slice(&params.state_filter.reject_threshold.to_le_bytes());
    out[tail_off + 2..tail_off + 4].copy_from_slice(&params.state_filter.reject_consec_count.to_le_bytes());

    Ok(TOTAL_LEN)
}

/// `MSG_TYPE_START_SENSOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSensor {
    pub status_retransmission_delay: u8,
    pub active_sensors: u16,
    pub adc_samples_per_sec: u16,
}

impl StartSensor {
    pub const LEN: usize = 6;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::StartSensor.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(StartSensor {
            status_retransmission_delay: data[1],
            active_sensors: u16::from_le_bytes([data[2], data[3]]),
            adc_samples_per_sec: u16::from_le_bytes([data[4], data[5]]),
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::StartSensor.code();
        out[1] = self.status_retransmission_delay;
        out[2..4].copy_from_slice(&self.active_sensors.to_le_bytes());
        out[4..6].copy_from_slice(&self.adc_samples_per_sec.to_le_bytes());
        Ok(Self::LEN)
    }
}

/// `MSG_TYPE_STATUS_UPDATE`, sent by a node through the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: u16,
}

impl StatusUpdate {
    pub const LEN: usize = 3;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::StatusUpdate.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(StatusUpdate {
            status: u16::from_le_bytes([data[1], data[2]]),
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::StatusUpdate.code();
        out[1..3].copy_from_slice(&self.status.to_le_bytes());
        Ok(Self::LEN)
    }
}

/// Writes a bare message-type byte with no body (`NOP`, `GET_RAW_STATUS`,
/// `ECHO_REQUEST`/`REPLY`, `REBUILD_STATUS_CHANNEL`).
pub fn encode_empty(ty: MessageType, out: &mut [u8]) -> Result<usize, DecodeError> {
    if out.is_empty() {
        return Err(DecodeError::TooShort);
    }
    out[0] = ty.code();
    Ok(1)
}

/// Max LED colors one `MSG_TYPE_LED` message can carry (two per byte,
/// nibble-packed, matching `apply_led_message`'s decode).
pub const MAX_LED_COLORS: usize = 32;

/// `MSG_TYPE_LED`: one nibble-packed color index per LED, two per byte.
pub fn encode_led(colors: &[u8], out: &mut [u8]) -> Result<usize, DecodeError> {
    if colors.len() > MAX_LED_COLORS {
        return Err(DecodeError::TooShort);
    }
    let body_len = (colors.len() + 1) / 2;
    let len = 1 + body_len;
    if out.len() < len {
        return Err(DecodeError::TooShort);
    }
    out[0] = MessageType::Led.code();
    for (i, pair) in colors.chunks(2).enumerate() {
        let lo = pair[0] & 0x0f;
        let hi = pair.get(1).copied().unwrap_or(0) & 0x0f;
        out[1 + i] = lo | (hi << 4);
    }
    Ok(len)
}

/// One `(channel, led, color)` entry of a `MSG_TYPE_CONFIGURE_STATUS_CHANGE_INDICATOR` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusChangeIndicatorEntry {
    pub channel: u8,
    pub led: u8,
    pub color: u8,
}

/// Max entries one message can carry within [`crate::transport::MAX_PAYLOAD`]
/// once the auth footer is accounted for.
pub const MAX_STATUS_CHANGE_INDICATOR_ENTRIES: usize = 16;

pub fn encode_status_change_indicators(
    entries: &[StatusChangeIndicatorEntry],
    out: &mut [u8],
) -> Result<usize, DecodeError> {
    if entries.len() > MAX_STATUS_CHANGE_INDICATOR_ENTRIES {
        return Err(DecodeError::TooShort);
    }
    let len = 1 + entries.len() * 2;
    if out.len() < len {
        return Err(DecodeError::TooShort);
    }
    out[0] = MessageType::ConfigureStatusChangeIndicator.code();
    for (i, e) in entries.iter().enumerate() {
        let off = 1 + i * 2;
        out[off] = e.channel;
        out[off + 1] = (e.led & 0x0f) | ((e.color & 0x0f) << 4);
    }
    Ok(len)
}

pub fn decode_status_change_indicators(
    data: &[u8],
    out: &mut [StatusChangeIndicatorEntry],
) -> Result<usize, DecodeError> {
    if data.is_empty() || data[0] != MessageType::ConfigureStatusChangeIndicator.code() {
        return Err(DecodeError::WrongType);
    }
    let body = &data[1..];
    if body.len() % 2 != 0 {
        return Err(DecodeError::TooShort);
    }
    let count = body.len() / 2;
    if count > out.len() {
        return Err(DecodeError::TooShort);
    }
    for (i, slot) in out.iter_mut().take(count).enumerate() {
        let off = i * 2;
        *slot = StatusChangeIndicatorEntry {
            channel: body[off],
            led: body[off + 1] & 0x0f,
            color: (body[off + 1] >> 4) & 0x0f,
        };
    }
    Ok(count)
}

/// `MSG_TYPE_BEGIN_SEND_RAW_FRAMES`: arms a node's debug raw-frame dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginSendRawFrames {
    pub channel: u8,
    pub num_of_frames: u16,
}

impl BeginSendRawFrames {
    pub const LEN: usize = 4;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::BeginSendRawFrames.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(BeginSendRawFrames {
            channel: data[1],
            num_of_frames: u16::from_le_bytes([data[2], data[3]]),
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::BeginSendRawFrames.code();
        out[1] = self.channel;
        out[2..4].copy_from_slice(&self.num_of_frames.to_le_bytes());
        Ok(Self::LEN)
    }
}

/// Max raw ADC values one `MSG_TYPE_RAW_FRAME_VALUES` message can carry
/// (unsigned, so the whole payload budget is available).
pub const MAX_RAW_FRAME_VALUES: usize = 31;

/// `MSG_TYPE_RAW_FRAME_VALUES`: unsigned, a batch of raw ADC samples for the
/// channel a preceding [`BeginSendRawFrames`] armed.
pub fn encode_raw_frame_values(values: &[u16], out: &mut [u8]) -> Result<usize, DecodeError> {
    if values.len() > MAX_RAW_FRAME_VALUES {
        return Err(DecodeError::TooShort);
    }
    let len = 1 + values.len() * 2;
    if out.len() < len {
        return Err(DecodeError::TooShort);
    }
    out[0] = MessageType::RawFrameValues.code();
    for (i, &v) in values.iter().enumerate() {
        let off = 1 + i * 2;
        out[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    Ok(len)
}

pub fn decode_raw_frame_values(data: &[u8], out: &mut [u16]) -> Result<usize, DecodeError> {
    if data.is_empty() || data[0] != MessageType::RawFrameValues.code() {
        return Err(DecodeError::WrongType);
    }
    let body = &data[1..];
    if body.len() % 2 != 0 {
        return Err(DecodeError::TooShort);
    }
    let count = body.len() / 2;
    if count > out.len() {
        return Err(DecodeError::TooShort);
    }
    for (i, slot) in out.iter_mut().take(count).enumerate() {
        let off = i * 2;
        *slot = u16::from_le_bytes([body[off], body[off + 1]]);
    }
    Ok(count)
}

/// Fixed header fields of `MSG_TYPE_RAW_STATUS`, ahead of the per-channel array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawStatusHeader {
    pub node_status: u32,
    pub sensor_loop_delay_ms: u32,
    pub retransmission_counter: u32,
    pub channel_enabled: u16,
}

impl RawStatusHeader {
    pub const LEN: usize = 15;

    fn encode(&self, out: &mut [u8]) -> Result<(), DecodeError> {
        if out.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        out[0] = MessageType::RawStatus.code();
        out[1..5].copy_from_slice(&self.node_status.to_le_bytes());
        out[5..9].copy_from_slice(&self.sensor_loop_delay_ms.to_le_bytes());
        out[9..13].copy_from_slice(&self.retransmission_counter.to_le_bytes());
        out[13..15].copy_from_slice(&self.channel_enabled.to_le_bytes());
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort);
        }
        if data[0] != MessageType::RawStatus.code() {
            return Err(DecodeError::WrongType);
        }
        Ok(RawStatusHeader {
            node_status: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
            sensor_loop_delay_ms: u32::from_le_bytes([data[5], data[6], data[7], data[8]]),
            retransmission_counter: u32::from_le_bytes([data[9], data[10], data[11], data[12]]),
            channel_enabled: u16::from_le_bytes([data[13], data[14]]),
        })
    }
}

/// One channel's worth of `MSG_TYPE_RAW_STATUS` payload: the low-passed
/// input value, the reject-filtered window average and the current state
/// index, matching what the estimator actually tracks per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawStatusChannel {
    pub low_passed: u16,
    pub window_avg: u16,
    pub state: u8,
}

impl RawStatusChannel {
    pub const LEN: usize = 5;
}

/// Max channels one `MSG_TYPE_RAW_STATUS` message can carry.
pub const MAX_RAW_STATUS_CHANNELS: usize = 9;

pub fn encode_raw_status(
    header: &RawStatusHeader,
    channels: &[RawStatusChannel],
    out: &mut [u8],
) -> Result<usize, DecodeError> {
    if channels.len() > MAX_RAW_STATUS_CHANNELS {
        return Err(DecodeError::TooShort);
    }
    let len = RawStatusHeader::LEN + channels.len() * RawStatusChannel::LEN;
    if out.len() < len {
        return Err(DecodeError::TooShort);
    }
    header.encode(out)?;
    for (i, c) in channels.iter().enumerate() {
        let off = RawStatusHeader::LEN + i * RawStatusChannel::LEN;
        out[off..off + 2].copy_from_slice(&c.low_passed.to_le_bytes());
        out[off + 2..off + 4].copy_from_slice(&c.window_avg.to_le_bytes());
        out[off + 4] = c.state;
    }
    Ok(len)
}

pub fn decode_raw_status(
    data: &[u8],
    out: &mut [RawStatusChannel],
) -> Result<(RawStatusHeader, usize), DecodeError> {
    let header = RawStatusHeader::decode(data)?;
    let body = &data[RawStatusHeader::LEN..];
    if body.len() % RawStatusChannel::LEN != 0 {
        return Err(DecodeError::TooShort);
    }
    let count = body.len() / RawStatusChannel::LEN;
    if count > out.len() {
        return Err(DecodeError::TooShort);
    }
    for (i, slot) in out.iter_mut().take(count).enumerate() {
        let off = i * RawStatusChannel::LEN;
        *slot = RawStatusChannel {
            low_passed: u16::from_le_bytes([body[off], body[off + 1]]),
            window_avg: u16::from_le_bytes([body[off + 2], body[off + 3]]),
            state: body[off + 4],
        };
    }
    Ok((header, count))
}

pub fn peek_type(data: &[u8]) -> Result<MessageType, DecodeError> {
    data.first().copied().map(MessageType::from).ok_or(DecodeError::TooShort)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrips_through_code() {
        for code in [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 64, 128, 129, 130, 131] {
            let ty = MessageType::from(code);
            assert_eq!(ty.code(), code);
        }
    }

    #[test]
    fn status_update_is_signed_but_echo_is_not() {
        assert!(MessageType::StatusUpdate.is_signed());
        assert!(!MessageType::EchoRequest.is_signed());
    }

    #[test]
    fn hs1_encode_decode_roundtrip() {
        let hs1 = AuthHs1 {
            reply_route: NodeId::new(7),
        };
        let mut buf = [0u8; 8];
        let len = hs1.encode(&mut buf).unwrap();
        assert_eq!(AuthHs1::decode(&buf[..len]).unwrap(), hs1);
    }

    #[test]
    fn route_entries_decode_multiple_pairs() {
        let data = [MessageType::RouteReset.code(), 1, 2, 3, 4];
        let mut out = [RouteEntry {
            dst: NodeId::new(0),
            next: NodeId::new(0),
        }; 4];
        let n = decode_route_entries(&data, &mut out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(out[0], RouteEntry { dst: NodeId::new(1), next: NodeId::new(2) });
        assert_eq!(out[1], RouteEntry { dst: NodeId::new(3), next: NodeId::new(4) });
    }

    #[test]
    fn rejects_wrong_type_byte() {
        let data = [99u8, 0, 0];
        assert_eq!(StatusUpdate::decode(&data), Err(DecodeError::WrongType));
    }

    #[test]
    fn configure_sensor_header_encode_decode_roundtrip() {
        let header = ConfigureSensorHeader { channel_id: 2 };
        let mut buf = [0u8; ConfigureSensorHeader::LEN];
        let len = header.encode(&mut buf).unwrap();
        assert_eq!(ConfigureSensorHeader::decode(&buf[..len]).unwrap(), header);
    }

    #[test]
    fn led_message_packs_two_colors_per_byte() {
        let mut buf = [0u8; 8];
        let len = encode_led(&[1, 2, 3], &mut buf).unwrap();
        assert_eq!(len, 3);
        assert_eq!(buf[0], MessageType::Led.code());
        assert_eq!(buf[1], 0x21);
        assert_eq!(buf[2], 0x03);
    }

    #[test]
    fn status_change_indicators_roundtrip() {
        let entries = [
            StatusChangeIndicatorEntry { channel: 0, led: 1, color: 2 },
            StatusChangeIndicatorEntry { channel: 3, led: 4, color: 5 },
        ];
        let mut buf = [0u8; 16];
        let len = encode_status_change_indicators(&entries, &mut buf).unwrap();
        let mut out = [StatusChangeIndicatorEntry::default(); 4];
        let count = decode_status_change_indicators(&buf[..len], &mut out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(out[0], entries[0]);
        assert_eq!(out[1], entries[1]);
    }

    #[test]
    fn begin_send_raw_frames_encode_decode_roundtrip() {
        let msg = BeginSendRawFrames { channel: 2, num_of_frames: 500 };
        let mut buf = [0u8; BeginSendRawFrames::LEN];
        let len = msg.encode(&mut buf).unwrap();
        assert_eq!(BeginSendRawFrames::decode(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn raw_frame_values_roundtrip() {
        let values = [100u16, 2000, 4095];
        let mut buf = [0u8; 16];
        let len = encode_raw_frame_values(&values, &mut buf).unwrap();
        let mut out = [0u16; 8];
        let count = decode_raw_frame_values(&buf[..len], &mut out).unwrap();
        assert_eq!(&out[..count], &values);
    }

    #[test]
    fn raw_status_roundtrip() {
        let header = RawStatusHeader {
            node_status: 0x0000_0021,
            sensor_loop_delay_ms: 1000,
            retransmission_counter: 3,
            channel_enabled: 0b0101,
        };
        let channels = [
            RawStatusChannel { low_passed: 1234, window_avg: 500, state: 2 },
            RawStatusChannel { low_passed: 10, window_avg: 5, state: 0 },
        ];
        let mut buf = [0u8; 64];
        let len = encode_raw_status(&header, &channels, &mut buf).unwrap();
        let mut out = [RawStatusChannel::default(); 4];
        let (decoded_header, count) = decode_raw_status(&buf[..len], &mut out).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(count, 2);
        assert_eq!(out[0], channels[0]);
        assert_eq!(out[1], channels[1]);
    }

    #[test]
    fn state_estimation_params_encode_fills_expected_length() {
        use crate::estimator::{InputFilterParams, StateEstimationParams, StateFilterParams, STATECOUNT};

        let params = StateEstimationParams {
            input_filter: InputFilterParams {
                mid_value_adjustment_speed: 10,
                lowpass_weight: 200,
                num_samples: 16,
            },
            state_filter: StateFilterParams {
                transition_matrix: [1; (STATECOUNT - 1) * STATECOUNT],
                window_sizes: [64; STATECOUNT],
                reject_threshold: 5,
                reject_consec_count: 3,
            },
        };
        let mut buf = [0u8; 64];
        let len = encode_state_estimation_params(&params, &mut buf).unwrap();
        assert_eq!(len, 6 + (STATECOUNT - 1) * STATECOUNT * 2 + STATECOUNT * 2 + 4);
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 10);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 200);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 16);
    }
}
