//! Master-node controller: manages one [`SensorConnection`] per sensor
//! node and dispatches incoming mesh packets to the right one.
//!
//! Ported from `master_sensorconnection.h`/`master_node.c`. The master
//! signs every configuration command it sends ("auth master" role,
//! `auth_config`) and verifies the signed status updates a node sends back
//! ("auth slave" role, `auth_status`).

use core::array;

use crate::auth::{AuthChannel, AuthKey};
use crate::error::{AuthError, ControllerFault, TransportError};
use crate::node::NodeId;
use crate::radio::Radio;
use crate::transport::{MeshTransport, MAX_PAYLOAD};
use crate::wire::{self, MessageType};

pub const MAX_RETRANSMISSIONS: u32 = 100;
pub const RETRANSMIT_LIN_BACKOFF_DIV: u32 = 3;
pub const RETRANSMIT_BASE_DELAY_S: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionEvent {
    /// `###ACK<node>-<code>`.
    Ack { code: u8 },
    /// `###STATUS<node>-<status>`.
    Status { status: u16 },
    /// `###TIMEOUT<node>`: the retransmission limit was reached.
    Timeout,
    /// `###RAW<node>-<count>`, followed by one `*<value>` line per entry.
    /// Unsigned and unsolicited: arrives any time after a `BeginSendRawFrames`
    /// command armed the node's dump.
    Raw {
        values: [u16; wire::MAX_RAW_FRAME_VALUES],
        count: u8,
    },
    /// Decoded `GET_RAW_STATUS` reply.
    RawStatus {
        header: wire::RawStatusHeader,
        channels: [wire::RawStatusChannel; wire::MAX_RAW_STATUS_CHANNELS],
        count: u8,
    },
}

/// One master <-> node connection: a pending or established pair of
/// authenticated channels plus the one outstanding command, matching
/// `sensor_connection_t`.
pub struct SensorConnection {
    node_id: NodeId,
    reply_hop: NodeId,
    auth_status: AuthChannel,
    auth_config: AuthChannel,
    /// Additional-data binding for the config channel (master signs, node
    /// verifies): `[master_id, node_id]`.
    add_data_cfg: [u8; 2],
    /// Additional-data binding for the status channel (node signs, master
    /// verifies): `[node_id, master_id]`.
    add_data_sta: [u8; 2],
    current_status: u16,
    last_sent: [u8; MAX_PAYLOAD],
    last_sent_len: usize,
    ack_outstanding: bool,
    retransmission_counter: u32,
    retransmit_delay_remaining_s: u32,
    random_current: u32,
}

impl SensorConnection {
    /// Starts a connection attempt: builds and will send an HS1 towards
    /// `node` via `reply_hop`. `challenge` should come from
    /// [`MeshTransport::random_u64`]. `master_id` is the master's own node
    /// id, used to bind both channels' signatures to this particular
    /// `(master, node)` pair.
    pub fn init(
        master_id: NodeId,
        node: NodeId,
        reply_hop: NodeId,
        config_key: AuthKey,
        status_key: AuthKey,
        challenge: u64,
    ) -> Self {
        SensorConnection {
            node_id: node,
            reply_hop,
            auth_status: AuthChannel::slave_init(status_key, 0),
            auth_config: AuthChannel::master_init(config_key, challenge),
            add_data_cfg: [master_id.as_u8(), node.as_u8()],
            add_data_sta: [node.as_u8(), master_id.as_u8()],
            current_status: 0,
            last_sent: [0u8; MAX_PAYLOAD],
            last_sent_len: 0,
            ack_outstanding: false,
            retransmission_counter: 0,
            retransmit_delay_remaining_s: 0,
            random_current: challenge as u32 ^ 0x1234_5678,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node_id
    }

    pub fn status(&self) -> u16 {
        self.current_status
    }

    pub fn handshake_complete(&self) -> bool {
        self.auth_config.handshake_complete()
    }

    /// Builds the HS1 message to kick off (or retry) the config handshake.
    pub fn make_hs1(&mut self, buf: &mut [u8]) -> Result<usize, ControllerFault> {
        let hs1 = wire::AuthHs1 {
            reply_route: self.reply_hop,
        };
        let hdr_len = hs1.encode(buf).map_err(|_| ControllerFault::RadioInitFailure)?;
        let total = self
            .auth_config
            .master_make_handshake(buf, hdr_len)
            .map_err(|_| ControllerFault::RadioInitFailure)?;
        Ok(total)
    }

    /// Processes a signed HS2 reply to complete the config handshake.
    pub fn process_hs2(&mut self, raw: &[u8]) -> Result<(u8, u16), AuthError> {
        let hdr_len = wire::AuthHs2::LEN;
        self.auth_config.master_process_handshake(raw, hdr_len, raw.len())?;
        let hs2 = wire::AuthHs2::decode(raw).map_err(|_| AuthError::WrongSize)?;
        Ok((hs2.status, hs2.channels))
    }

    /// Signs `payload[..len]` with the config channel and stores it as the
    /// last-sent command (for `retransmit`/automatic backoff).
    fn sign_and_remember(&mut self, buf: &mut [u8], len: usize) -> Result<usize, AuthError> {
        let total = self.auth_config.master_sign(buf, len, &self.add_data_cfg)?;
        self.last_sent[..total].copy_from_slice(&buf[..total]);
        self.last_sent_len = total;
        self.ack_outstanding = true;
        self.retransmission_counter = 0;
        self.retransmit_delay_remaining_s = RETRANSMIT_BASE_DELAY_S;
        Ok(total)
    }

    pub fn make_route_message(
        &mut self,
        reset: bool,
        entries: &[wire::RouteEntry],
        buf: &mut [u8],
    ) -> Result<usize, AuthError> {
        let ty = if reset {
            MessageType::RouteReset
        } else {
            MessageType::RouteAppend
        };
        buf[0] = ty.code();
        let mut len = 1;
        for e in entries {
            buf[len] = e.dst.as_u8();
            buf[len + 1] = e.next.as_u8();
            len += 2;
        }
        self.sign_and_remember(buf, len)
    }

    pub fn make_start_sensor(
        &mut self,
        start: wire::StartSensor,
        buf: &mut [u8],
    ) -> Result<usize, AuthError> {
        let len = start.encode(buf).map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, len)
    }

    pub fn make_nop(&mut self, buf: &mut [u8]) -> Result<usize, AuthError> {
        let len = wire::encode_empty(MessageType::Nop, buf).map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, len)
    }

    /// Builds a signed `configure_sensor` command: header followed by the
    /// full estimation parameter block, mirroring `make_start_sensor`.
    pub fn make_configure_sensor(
        &mut self,
        header: wire::ConfigureSensorHeader,
        params: &crate::estimator::StateEstimationParams,
        buf: &mut [u8],
    ) -> Result<usize, AuthError> {
        let hdr_len = header.encode(buf).map_err(|_| AuthError::BufferTooSmall)?;
        let params_len = wire::encode_state_estimation_params(params, &mut buf[hdr_len..])
            .map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, hdr_len + params_len)
    }

    /// Builds a signed `led` command: one nibble-packed color index per LED.
    pub fn make_led(&mut self, colors: &[u8], buf: &mut [u8]) -> Result<usize, AuthError> {
        let len = wire::encode_led(colors, buf).map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, len)
    }

    /// Builds a signed `rebuild_status_channel` command: tells the node to
    /// drop and reopen its status-channel handshake.
    pub fn make_rebuild_status_channel(&mut self, buf: &mut [u8]) -> Result<usize, AuthError> {
        let len = wire::encode_empty(MessageType::RebuildStatusChannel, buf)
            .map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, len)
    }

    /// Builds a signed `cfg_status_change_indicator` command.
    pub fn make_cfg_status_change_indicator(
        &mut self,
        entries: &[wire::StatusChangeIndicatorEntry],
        buf: &mut [u8],
    ) -> Result<usize, AuthError> {
        let len = wire::encode_status_change_indicators(entries, buf)
            .map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, len)
    }

    /// Arms the node's debug raw-frame dump (`raw_frames` host command).
    pub fn make_begin_send_raw_frames(
        &mut self,
        msg: wire::BeginSendRawFrames,
        buf: &mut [u8],
    ) -> Result<usize, AuthError> {
        let len = msg.encode(buf).map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, len)
    }

    /// Requests a one-off `RawStatus` snapshot (`raw_status` host command).
    pub fn make_get_raw_status(&mut self, buf: &mut [u8]) -> Result<usize, AuthError> {
        let len = wire::encode_empty(MessageType::GetRawStatus, buf)
            .map_err(|_| AuthError::BufferTooSmall)?;
        self.sign_and_remember(buf, len)
    }

    /// Re-sends the last signed command verbatim (the `retransmit` host command).
    pub fn last_sent(&self) -> Option<&[u8]> {
        if self.ack_outstanding {
            Some(&self.last_sent[..self.last_sent_len])
        } else {
            None
        }
    }

    fn next_random(&mut self, max: u32) -> u32 {
        self.random_current = self.random_current.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        if max == 0 {
            0
        } else {
            self.random_current % max
        }
    }

    fn retransmission_delay_s(&mut self) -> u32 {
        let window = RETRANSMIT_BASE_DELAY_S
            * (1 + self.retransmission_counter / RETRANSMIT_LIN_BACKOFF_DIV);
        self.next_random(window.max(1)) + RETRANSMIT_BASE_DELAY_S
    }

    /// Call once per second; returns `Some(bytes)` to resend when a
    /// retransmission is due, or an error once the retry budget is spent.
    pub fn tick_one_second(&mut self) -> Result<Option<&[u8]>, ControllerFault> {
        if !self.ack_outstanding {
            return Ok(None);
        }
        if self.retransmit_delay_remaining_s > 0 {
            self.retransmit_delay_remaining_s -= 1;
            return Ok(None);
        }
        self.retransmission_counter += 1;
        if self.retransmission_counter > MAX_RETRANSMISSIONS {
            self.ack_outstanding = false;
            return Err(ControllerFault::StatusRetransmitExhausted);
        }
        self.retransmit_delay_remaining_s = self.retransmission_delay_s();
        Ok(Some(&self.last_sent[..self.last_sent_len]))
    }

    /// Handles one incoming mesh packet for this connection. `reply` is
    /// scratch space for a handshake reply or status ack this call may need
    /// to send back; the returned `usize` is the reply length, 0 if none.
    pub fn handle_packet(&mut self, raw: &[u8], reply: &mut [u8]) -> (Option<ConnectionEvent>, usize) {
        let Ok(ty) = wire::peek_type(raw) else {
            return (None, 0);
        };
        match ty {
            MessageType::AuthHs1 => {
                // Only the node ever sends an unsolicited HS1: it is opening
                // the status channel (the master always initiates the
                // config channel itself).
                if wire::AuthHs1::decode(raw).is_err() {
                    return (None, 0);
                }
                reply[0] = MessageType::AuthHs2.code();
                reply[1] = 0;
                reply[2..4].copy_from_slice(&0u16.to_le_bytes());
                let inofs = wire::AuthHs1::LEN;
                match self
                    .auth_status
                    .slave_handshake(raw, inofs, raw.len(), reply, wire::AuthHs2::LEN)
                {
                    Ok(len) => (None, len),
                    Err(_) => (None, 0),
                }
            }
            MessageType::AuthHs2 => {
                let (status, channels) = match self.process_hs2(raw) {
                    Ok(v) => v,
                    Err(_) => return (None, 0),
                };
                self.current_status = channels;
                (Some(ConnectionEvent::Status { status: status as u16 }), 0)
            }
            MessageType::AuthAck => {
                let Ok(ack) = wire::AuthAck::decode(raw) else {
                    return (None, 0);
                };
                if self.auth_config.master_check_ack(raw, 2, raw.len()).is_ok() {
                    self.ack_outstanding = false;
                    (
                        Some(ConnectionEvent::Ack {
                            code: ack.result_code & !wire::ACK_RETRANSMIT,
                        }),
                        0,
                    )
                } else {
                    (None, 0)
                }
            }
            MessageType::StatusUpdate => {
                let mut buf = [0u8; MAX_PAYLOAD];
                let n = raw.len().min(buf.len());
                buf[..n].copy_from_slice(&raw[..n]);
                match self.auth_status.slave_verify(&buf, n, &self.add_data_sta) {
                    Ok(payload_len) => {
                        let Ok(update) = wire::StatusUpdate::decode(&buf[..payload_len]) else {
                            return (None, 0);
                        };
                        self.current_status = update.status;
                        let ack_len = self.build_status_ack(reply);
                        (
                            Some(ConnectionEvent::Status {
                                status: update.status,
                            }),
                            ack_len,
                        )
                    }
                    Err(AuthError::OldNonce) => (None, self.build_status_ack(reply)),
                    Err(_) => (None, 0),
                }
            }
            MessageType::RawFrameValues => {
                let mut values = [0u16; wire::MAX_RAW_FRAME_VALUES];
                match wire::decode_raw_frame_values(raw, &mut values) {
                    Ok(count) => (
                        Some(ConnectionEvent::Raw {
                            values,
                            count: count as u8,
                        }),
                        0,
                    ),
                    Err(_) => (None, 0),
                }
            }
            MessageType::RawStatus => {
                let mut channels = [wire::RawStatusChannel::default(); wire::MAX_RAW_STATUS_CHANNELS];
                match wire::decode_raw_status(raw, &mut channels) {
                    Ok((header, count)) => (
                        Some(ConnectionEvent::RawStatus {
                            header,
                            channels,
                            count: count as u8,
                        }),
                        0,
                    ),
                    Err(_) => (None, 0),
                }
            }
            _ => (None, 0),
        }
    }

    /// Signs an `ACK_OK` reply on the status channel, matching the last
    /// verified (or re-verified) nonce.
    fn build_status_ack(&self, buf: &mut [u8]) -> usize {
        if buf.len() < 2 {
            return 0;
        }
        buf[0] = MessageType::AuthAck.code();
        buf[1] = wire::ACK_OK;
        self.auth_status.slave_make_ack(buf, 2).unwrap_or(0)
    }
}

/// Manages up to `N` concurrent sensor connections and routes incoming
/// mesh traffic to the right one, mirroring `master_node.c`'s
/// `find_node`/`dispatch_packet`.
pub struct MasterController<R: Radio, const N: usize> {
    transport: MeshTransport<R>,
    connections: [Option<SensorConnection>; N],
}

impl<R: Radio, const N: usize> MasterController<R, N> {
    pub fn new(transport: MeshTransport<R>) -> Self {
        MasterController {
            transport,
            connections: array::from_fn(|_| None),
        }
    }

    pub fn find(&self, node: NodeId) -> Option<&SensorConnection> {
        self.connections.iter().flatten().find(|c| c.node() == node)
    }

    pub fn find_mut(&mut self, node: NodeId) -> Option<&mut SensorConnection> {
        self.connections.iter_mut().flatten().find(|c| c.node() == node)
    }

    /// Starts tracking a new node, reusing a free slot. Fails if all `N`
    /// slots are in use (`connect`'s "Connection limit reached!"). `reply_hop`
    /// is both the next hop the master itself uses to reach `node` and the
    /// route the node is told to reply through, since a tree-routed mesh has
    /// only one neighbor towards any given node.
    pub fn connect(
        &mut self,
        node: NodeId,
        reply_hop: NodeId,
        config_key: AuthKey,
        status_key: AuthKey,
    ) -> Result<&mut SensorConnection, ControllerFault> {
        let challenge = self.transport.random_u64();
        let my_id = self.transport.my_id();
        let slot = self
            .connections
            .iter_mut()
            .find(|c| c.is_none())
            .ok_or(ControllerFault::NotConfigured)?;
        *slot = Some(SensorConnection::init(
            my_id, node, reply_hop, config_key, status_key, challenge,
        ));
        self.transport
            .set_route(node, reply_hop)
            .map_err(|_| ControllerFault::NotConfigured)?;
        Ok(slot.as_mut().unwrap())
    }

    /// Drives the radio receive path once and dispatches any delivered
    /// frame to its connection; call from the radio's RX interrupt handler.
    /// The returned node id is whichever connection produced the event.
    pub fn poll(&mut self) -> Option<(NodeId, ConnectionEvent)> {
        let mut incoming: Option<(NodeId, [u8; MAX_PAYLOAD], usize)> = None;
        self.transport.poll_recv(|src, payload| {
            let mut buf = [0u8; MAX_PAYLOAD];
            buf[..payload.len()].copy_from_slice(payload);
            incoming = Some((src, buf, payload.len()));
        });
        let (src, buf, len) = incoming?;
        let event = self.dispatch(src, &buf[..len])?;
        Some((src, event))
    }

    /// Dispatches one received mesh frame to its owning connection, sending
    /// back any handshake reply or status ack it produces.
    pub fn dispatch(&mut self, src: NodeId, raw: &[u8]) -> Option<ConnectionEvent> {
        let conn = self.find_mut(src)?;
        let mut reply = [0u8; MAX_PAYLOAD];
        let (event, reply_len) = conn.handle_packet(raw, &mut reply);
        if reply_len > 0 {
            let _ = self.transport.send(src, &reply[..reply_len]);
        }
        event
    }

    pub fn send_to(&mut self, node: NodeId, frame: &[u8]) -> Result<(), TransportError> {
        self.transport.send(node, frame)
    }

    /// Installs one of the master's own next-hop routes (the `routes` host
    /// command), separate from a node's own route table.
    pub fn set_route(&mut self, dst: NodeId, next_hop: NodeId) -> Result<(), TransportError> {
        self.transport.set_route(dst, next_hop)
    }

    pub fn clear_routes(&mut self) {
        self.transport.clear_routes();
    }

    /// Drives every connection's retransmission timer; call once per second.
    pub fn tick_one_second(&mut self) -> heapless::Vec<(NodeId, ControllerFault), N> {
        let mut faults = heapless::Vec::new();
        for slot in self.connections.iter_mut() {
            let Some(conn) = slot else { continue };
            let node = conn.node();
            match conn.tick_one_second() {
                Ok(Some(bytes)) => {
                    let mut frame = heapless::Vec::<u8, MAX_PAYLOAD>::new();
                    let _ = frame.extend_from_slice(bytes);
                    let _ = self.transport.send(node, &frame);
                }
                Ok(None) => {}
                Err(fault) => {
                    let _ = faults.push((node, fault));
                }
            }
        }
        faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RfConfig;
    use crate::test_support::FakeRadio;

    const CFG_KEY: AuthKey = [7; 16];
    const STA_KEY: AuthKey = [8; 16];

    fn rf_cfg() -> RfConfig {
        RfConfig {
            frequency_hz: 433_800_000,
            tx_power_db: 10,
            spread_factor: 7,
            coderate: 1,
            bandwidth_index: 7,
        }
    }

    #[test]
    fn connect_fails_once_all_slots_are_used() {
        let transport = MeshTransport::init(NodeId::new(0), &rf_cfg(), FakeRadio::new()).unwrap();
        let mut m: MasterController<FakeRadio, 2> = MasterController::new(transport);
        m.connect(NodeId::new(1), NodeId::new(1), CFG_KEY, STA_KEY).unwrap();
        m.connect(NodeId::new(2), NodeId::new(2), CFG_KEY, STA_KEY).unwrap();
        assert!(m.connect(NodeId::new(3), NodeId::new(3), CFG_KEY, STA_KEY).is_err());
    }

    #[test]
    fn full_config_handshake_between_master_and_sensor_side() {
        use crate::node::NodeId as N;

        let transport = MeshTransport::init(N::new(0), &rf_cfg(), FakeRadio::new()).unwrap();
        let mut m: MasterController<FakeRadio, 2> = MasterController::new(transport);
        let conn = m.connect(N::new(5), N::new(5), CFG_KEY, STA_KEY).unwrap();

        let mut hs1 = [0u8; 32];
        let hs1_len = conn.make_hs1(&mut hs1).unwrap();

        // Node side: verify + reply using the same key, independent of SensorController.
        let mut node_auth = AuthChannel::slave_init(CFG_KEY, 0);
        let mut hs2 = [0u8; 32];
        hs2[0] = MessageType::AuthHs2.code();
        hs2[1] = 0;
        hs2[2..4].copy_from_slice(&0u16.to_le_bytes());
        let hs2_len = node_auth
            .slave_handshake(&hs1, wire::AuthHs1::LEN, hs1_len, &mut hs2, 4)
            .unwrap();

        let conn = m.find_mut(N::new(5)).unwrap();
        let (status, _channels) = conn.process_hs2(&hs2[..hs2_len]).unwrap();
        assert_eq!(status, 0);
        assert!(conn.handshake_complete());
    }

    #[test]
    fn status_channel_handshake_then_status_update_is_acked() {
        use crate::node::NodeId as N;

        let transport = MeshTransport::init(N::new(0), &rf_cfg(), FakeRadio::new()).unwrap();
        let mut m: MasterController<FakeRadio, 2> = MasterController::new(transport);
        m.connect(N::new(5), N::new(5), CFG_KEY, STA_KEY).unwrap();

        // Node opens its status channel (it is the auth-master there).
        let mut node_status_auth = AuthChannel::master_init(STA_KEY, 42);
        let mut hs1 = [0u8; 32];
        hs1[0] = MessageType::AuthHs1.code();
        hs1[1] = N::new(5).as_u8();
        let hs1_len = node_status_auth.master_make_handshake(&mut hs1, wire::AuthHs1::LEN).unwrap();

        let conn = m.find_mut(N::new(5)).unwrap();
        let mut reply = [0u8; 64];
        let (event, reply_len) = conn.handle_packet(&hs1[..hs1_len], &mut reply);
        assert!(event.is_none());
        assert!(reply_len > 0);

        node_status_auth
            .master_process_handshake(&reply[..reply_len], wire::AuthHs2::LEN, reply_len)
            .unwrap();
        assert!(node_status_auth.handshake_complete());

        // Node signs a status update; master verifies and acks it.
        let mut msg = [0u8; 32];
        let update = wire::StatusUpdate { status: 0b11 };
        let len = update.encode(&mut msg).unwrap();
        // add_data_sta = [node_id, master_id]
        let signed_len = node_status_auth
            .master_sign(&mut msg, len, &[N::new(5).as_u8(), 0])
            .unwrap();

        let conn = m.find_mut(N::new(5)).unwrap();
        let (event, ack_len) = conn.handle_packet(&msg[..signed_len], &mut reply);
        assert_eq!(event, Some(ConnectionEvent::Status { status: 0b11 }));
        assert!(ack_len > 0);

        node_status_auth.master_check_ack(&reply[..ack_len], 2, ack_len).unwrap();
    }

    #[test]
    fn make_led_and_rebuild_status_channel_produce_signed_config_commands() {
        let transport = MeshTransport::init(NodeId::new(0), &rf_cfg(), FakeRadio::new()).unwrap();
        let mut m: MasterController<FakeRadio, 2> = MasterController::new(transport);
        let conn = m.connect(NodeId::new(5), NodeId::new(5), CFG_KEY, STA_KEY).unwrap();

        let mut buf = [0u8; 32];
        let len = conn.make_led(&[1, 2, 3], &mut buf).unwrap();
        assert_eq!(buf[0], MessageType::Led.code());
        assert!(len > 3);

        let len = conn.make_rebuild_status_channel(&mut buf).unwrap();
        assert_eq!(buf[0], MessageType::RebuildStatusChannel.code());
        assert!(len > 1);
    }

    #[test]
    fn handle_packet_decodes_unsigned_raw_frame_values_and_raw_status() {
        let transport = MeshTransport::init(NodeId::new(0), &rf_cfg(), FakeRadio::new()).unwrap();
        let mut m: MasterController<FakeRadio, 2> = MasterController::new(transport);
        let conn = m.connect(NodeId::new(5), NodeId::new(5), CFG_KEY, STA_KEY).unwrap();

        let mut buf = [0u8; MAX_PAYLOAD];
        let len = wire::encode_raw_frame_values(&[10, 20, 30], &mut buf).unwrap();
        let mut reply = [0u8; MAX_PAYLOAD];
        let (event, reply_len) = conn.handle_packet(&buf[..len], &mut reply);
        assert_eq!(reply_len, 0);
        match event {
            Some(ConnectionEvent::Raw { values, count }) => {
                assert_eq!(count, 3);
                assert_eq!(&values[..3], &[10, 20, 30]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let header = wire::RawStatusHeader {
            node_status: 1,
            sensor_loop_delay_ms: 100,
            retransmission_counter: 0,
            channel_enabled: 0b1,
        };
        let channels = [wire::RawStatusChannel { low_passed: 5, window_avg: 6, state: 1 }];
        let len = wire::encode_raw_status(&header, &channels, &mut buf).unwrap();
        let (event, reply_len) = conn.handle_packet(&buf[..len], &mut reply);
        assert_eq!(reply_len, 0);
        match event {
            Some(ConnectionEvent::RawStatus { header: got, channels: got_channels, count }) => {
                assert_eq!(got, header);
                assert_eq!(count, 1);
                assert_eq!(got_channels[0], channels[0]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn retransmission_gives_up_after_max_retries() {
        let mut conn =
            SensorConnection::init(NodeId::new(0), NodeId::new(1), NodeId::new(1), CFG_KEY, STA_KEY, 10);
        conn.ack_outstanding = true;
        conn.retransmit_delay_remaining_s = 0;
        let mut last_err = None;
        for _ in 0..(MAX_RETRANSMISSIONS + 2) {
            if let Err(e) = conn.tick_one_second() {
                last_err = Some(e);
                break;
            }
            conn.retransmit_delay_remaining_s = 0;
        }
        assert_eq!(last_err, Some(ControllerFault::StatusRetransmitExhausted));
    }
}
