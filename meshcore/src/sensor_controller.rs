//! Sensor-node controller: the state machine a leaf (or relay) node runs
//! against a single upstream master.
//!
//! Ported from `sensor_node.c`. Two authenticated channels are kept: the
//! node signs outgoing status updates ("auth master" role, `auth_status`)
//! and verifies incoming configuration commands ("auth slave" role,
//! `auth_config`). The handshake sequence, status bits and retransmission
//! backoff formula are carried over unchanged; ADC sampling, LED output and
//! flash persistence are expressed through the [`crate::radio::Radio`],
//! [`crate::led::LedStrip`] and [`crate::config::ConfigStore`] traits
//! instead of direct peripheral access.

use core::array;

use crate::auth::{AuthChannel, AuthKey, AUTH_KEY_LEN};
use crate::config::{ConfigStore, MiscConfig, SensorNodeConfig};
use crate::error::{AuthError, ConfigureError, ControllerFault};
use crate::estimator::{StateEstimationParams, StateEstimator, StateUpdateResult};
use crate::led::{LedStrip, SystemStatus};
use crate::node::NodeId;
use crate::radio::Radio;
use crate::transport::{MeshTransport, MAX_PAYLOAD};
use crate::wire::{self, MessageType};

/// Bits of [`SensorController::status`], matching `sensor_node.c`'s `STATUS_*` defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeStatus(u32);

impl NodeStatus {
    pub const INIT_CPLT: NodeStatus = NodeStatus(0x0000_0001);
    pub const INIT_ROUTES: NodeStatus = NodeStatus(0x0000_0002);
    pub const INIT_AUTH_STA: NodeStatus = NodeStatus(0x0000_0004);
    pub const INIT_AUTH_CFG: NodeStatus = NodeStatus(0x0000_0008);
    pub const INIT_AUTH_STA_PEND: NodeStatus = NodeStatus(0x0000_0010);
    pub const SENSORS_ACTIVE: NodeStatus = NodeStatus(0x0000_0020);
    pub const SERIALDEBUG: NodeStatus = NodeStatus(0x0000_0040);
    pub const PRINTFRAMES: NodeStatus = NodeStatus(0x0000_0080);
    pub const LED_SET: NodeStatus = NodeStatus(0x0000_0100);
    pub const FORCE_UPDATE: NodeStatus = NodeStatus(0x0000_0200);
    pub const NO_LED_UPDATE: NodeStatus = NodeStatus(0x0000_0400);
    pub const SENSOR_TEST: NodeStatus = NodeStatus(0x0000_0800);

    pub const fn empty() -> Self {
        NodeStatus(0)
    }
    pub fn contains(self, bit: NodeStatus) -> bool {
        self.0 & bit.0 == bit.0
    }
    pub fn insert(&mut self, bit: NodeStatus) {
        self.0 |= bit.0;
    }
    pub fn remove(&mut self, bit: NodeStatus) {
        self.0 &= !bit.0;
    }
}

impl core::ops::BitOr for NodeStatus {
    type Output = NodeStatus;
    fn bitor(self, rhs: NodeStatus) -> NodeStatus {
        NodeStatus(self.0 | rhs.0)
    }
}

/// Seconds the message task tolerates the ADC task going quiet before
/// raising [`ControllerFault::AdcTaskHang`].
const ADC_WATCHDOG_TIMEOUT_S: u32 = 10;

/// Tracks an in-progress debug raw-frame dump armed by `BEGIN_SEND_RAW_FRAMES`.
struct RawFrameDump {
    channel: u8,
    remaining: u16,
}

struct StatusBuffer {
    bytes: [u8; MAX_PAYLOAD],
    len: usize,
    ack_outstanding: bool,
    retransmission_counter: u32,
    retransmit_delay_remaining_s: u32,
}

impl StatusBuffer {
    const fn new() -> Self {
        StatusBuffer {
            bytes: [0u8; MAX_PAYLOAD],
            len: 0,
            ack_outstanding: false,
            retransmission_counter: 0,
            retransmit_delay_remaining_s: 0,
        }
    }
}

/// Runs one node's side of the mesh protocol against `N` sensor channels.
pub struct SensorController<R: Radio, const N: usize> {
    transport: MeshTransport<R>,
    status_key: AuthKey,
    auth_status: Option<AuthChannel>,
    auth_config: Option<AuthChannel>,
    sensors: [Option<StateEstimator>; N],
    status: NodeStatus,
    active_sensor_channels: u16,
    current_sensor_status: u16,
    misc_config: MiscConfig,
    master_node: NodeId,
    config_channel_timeout_timer: u32,
    sensor_loop_delay_ms: u32,
    status_retransmission_base_delay: u8,
    status_buf: StatusBuffer,
    random_current: u32,
    last_ack_result: u8,
    raw_frame_dump: Option<RawFrameDump>,
    adc_watchdog_s: u32,
}

impl<R: Radio, const N: usize> SensorController<R, N> {
    pub fn new(transport: MeshTransport<R>, store: &dyn ConfigStore) -> Self {
        let misc_config = store.misc_config();
        SensorController {
            transport,
            status_key: [0u8; AUTH_KEY_LEN],
            auth_status: None,
            auth_config: None,
            sensors: array::from_fn(|_| None),
            status: NodeStatus::empty(),
            active_sensor_channels: 0,
            current_sensor_status: 0,
            misc_config,
            master_node: NodeId::default(),
            config_channel_timeout_timer: 0,
            sensor_loop_delay_ms: 1000,
            status_retransmission_base_delay: 5,
            status_buf: StatusBuffer::new(),
            random_current: 0xACE1_5EED,
            last_ack_result: 0,
            raw_frame_dump: None,
            adc_watchdog_s: 0,
        }
    }

    /// Loads identity/keys from the store and opens the config channel for
    /// handshakes; returns [`ControllerFault::NotConfigured`] if the node
    /// has never been provisioned.
    pub fn boot(&mut self, store: &dyn ConfigStore) -> Result<(), ControllerFault> {
        let cfg: SensorNodeConfig = store.node_config().ok_or(ControllerFault::NotConfigured)?;
        let (_status_nonce, config_nonce) = store.load_nonces();
        self.auth_config = Some(AuthChannel::slave_init(cfg.key_config, config_nonce));
        // auth_status is (re)initialized fresh each time the status channel is rebuilt,
        // but the key itself is stable across reboots.
        self.status_key = cfg.key_status;
        self.status.insert(NodeStatus::INIT_CPLT);
        Ok(())
    }

    /// Matches `sensor_node.c`'s `reset()`: clears everything except
    /// `INIT_CPLT`/`INIT_AUTH_CFG`, drops routes, restarts at a 1s loop.
    pub fn reset(&mut self) {
        let keep = self.status.0 & (NodeStatus::INIT_CPLT.0 | NodeStatus::INIT_AUTH_CFG.0);
        self.status = NodeStatus(keep);
        self.transport.clear_routes();
        self.status_buf.ack_outstanding = false;
        self.active_sensor_channels = 0;
        self.sensor_loop_delay_ms = 1000;
        self.adc_watchdog_s = 0;
        self.raw_frame_dump = None;
        self.status.insert(NodeStatus::FORCE_UPDATE);
    }

    fn next_random(&mut self, max: u32) -> u32 {
        self.random_current = self
            .random_current
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12_345);
        if max == 0 {
            0
        } else {
            self.random_current % max
        }
    }

    /// `calculate_retransmission_delay`: base delay plus a backoff window
    /// that widens every 3 retries.
    fn retransmission_delay_s(&mut self, rt_counter: u32) -> u32 {
        let div = self.misc_config.rt_delay_lin_div.max(1);
        let window = self.misc_config.rt_delay_random * (1 + rt_counter / div);
        self.next_random(window.max(1)) + self.status_retransmission_base_delay as u32
    }

    fn calculate_adc_sps(&self) -> u16 {
        if self.sensor_loop_delay_ms == 0 {
            return 1;
        }
        let sps = 1000 / self.sensor_loop_delay_ms;
        if sps == 0 {
            1
        } else {
            sps.min(u16::MAX as u32) as u16
        }
    }

    /// Drives the radio receive path once and dispatches any delivered
    /// frame; call from the radio's RX interrupt handler.
    pub fn poll(&mut self, led: &mut impl LedStrip) {
        let mut incoming: Option<(NodeId, [u8; MAX_PAYLOAD], usize)> = None;
        self.transport.poll_recv(|src, payload| {
            let mut buf = [0u8; MAX_PAYLOAD];
            buf[..payload.len()].copy_from_slice(payload);
            incoming = Some((src, buf, payload.len()));
        });
        if let Some((src, buf, len)) = incoming {
            self.handle_incoming(src, &buf[..len], led);
        }
    }

    /// Entry point for every mesh frame delivered to this node.
    pub fn handle_incoming(&mut self, src: NodeId, raw: &[u8], led: &mut impl LedStrip) {
        let ty = match wire::peek_type(raw) {
            Ok(t) => t,
            Err(_) => return,
        };

        match ty {
            MessageType::AuthHs1 => self.handle_hs1(src, raw, led),
            MessageType::AuthHs2 => self.handle_status_hs2(raw),
            MessageType::EchoRequest => self.handle_echo_request(src),
            _ if ty.is_signed() => self.handle_authenticated(src, raw, led),
            _ => {}
        }
    }

    fn handle_hs1(&mut self, src: NodeId, raw: &[u8], led: &mut impl LedStrip) {
        let hs1 = match wire::AuthHs1::decode(raw) {
            Ok(h) => h,
            Err(_) => return,
        };
        let Some(auth_config) = self.auth_config.as_mut() else {
            return;
        };

        let mut out = [0u8; MAX_PAYLOAD];
        out[0] = MessageType::AuthHs2.code();
        let mut hs2_status = 0u8;
        if self.status.contains(NodeStatus::INIT_ROUTES) {
            hs2_status |= wire::HS2_STATUS_ROUTES;
        }
        if self.status.contains(NodeStatus::SENSORS_ACTIVE)
            && !self.status.contains(NodeStatus::SENSOR_TEST)
        {
            hs2_status |= wire::HS2_STATUS_SENSOR;
        }
        out[1] = hs2_status;
        out[2..4].copy_from_slice(&self.current_sensor_status.to_le_bytes());

        let inofs = wire::AuthHs1::LEN;
        let outofs = 4;
        let len = match auth_config.slave_handshake(raw, inofs, raw.len(), &mut out, outofs) {
            Ok(l) => l,
            Err(_) => return,
        };

        if !self.status.contains(NodeStatus::INIT_ROUTES) {
            // Trust the reply route only until real routes are installed.
            self.transport.clear_routes();
            let _ = self.transport.set_route(src, hs1.reply_route);
            self.master_node = src;
        }

        if self.transport.send(src, &out[..len]).is_ok() {
            self.status.insert(NodeStatus::INIT_AUTH_CFG);
            led.show_system_status(SystemStatus::Connected);
        }
    }

    fn handle_echo_request(&mut self, src: NodeId) {
        let mut out = [0u8; 1];
        if wire::encode_empty(MessageType::EchoReply, &mut out).is_ok() {
            let _ = self.transport.send(src, &out);
        }
    }

    fn handle_authenticated(&mut self, src: NodeId, raw: &[u8], led: &mut impl LedStrip) {
        let Some(auth_config) = self.auth_config.as_mut() else {
            return;
        };
        if !self.status.contains(NodeStatus::INIT_AUTH_CFG) {
            return;
        }

        let mut buf = [0u8; MAX_PAYLOAD];
        let n = raw.len().min(buf.len());
        buf[..n].copy_from_slice(&raw[..n]);

        // add_data_cfg = [src, my_id], matching the master's own binding.
        let add_data = [src.as_u8(), self.transport.my_id().as_u8()];
        match auth_config.slave_verify(&buf, n, &add_data) {
            Ok(payload_len) => {
                self.config_channel_timeout_timer = 0;
                let result = self.dispatch_command(src, &buf[..payload_len], led);
                self.last_ack_result = result;
                self.send_ack(src, result, false);
            }
            Err(AuthError::OldNonce) => {
                self.send_ack(src, self.last_ack_result, true);
            }
            Err(_) => {}
        }
    }

    fn send_ack(&mut self, src: NodeId, result_code: u8, retransmit: bool) {
        let Some(auth_config) = self.auth_config.as_mut() else {
            return;
        };
        let code = if retransmit {
            result_code | wire::ACK_RETRANSMIT
        } else {
            result_code
        };
        let mut out = [0u8; MAX_PAYLOAD];
        out[0] = MessageType::AuthAck.code();
        out[1] = code;
        if let Ok(len) = auth_config.slave_make_ack(&mut out, 2) {
            let _ = self.transport.send(src, &out[..len]);
        }
    }

    /// Returns the ACK result code for the command.
    fn dispatch_command(&mut self, src: NodeId, payload: &[u8], led: &mut impl LedStrip) -> u8 {
        let ty = match wire::peek_type(payload) {
            Ok(t) => t,
            Err(_) => return wire::ACK_WRONGSIZE,
        };

        match ty {
            MessageType::RouteReset | MessageType::RouteAppend => {
                self.handle_route_message(ty, payload)
            }
            MessageType::ConfigureSensorChannel => self.handle_configure_sensor(payload),
            MessageType::StartSensor => self.handle_start_sensor(src, payload),
            MessageType::Nop => wire::ACK_OK,
            MessageType::Led => {
                self.apply_led_message(payload, led);
                wire::ACK_OK
            }
            MessageType::RebuildStatusChannel => {
                self.status.remove(NodeStatus::INIT_AUTH_STA);
                self.status.remove(NodeStatus::INIT_AUTH_STA_PEND);
                wire::ACK_OK
            }
            MessageType::ConfigureStatusChangeIndicator => {
                self.handle_configure_status_change_indicator(payload, led)
            }
            MessageType::BeginSendRawFrames => self.handle_begin_send_raw_frames(payload),
            MessageType::GetRawStatus => self.handle_get_raw_status(src),
            _ => wire::ACK_NOTSUP,
        }
    }

    fn handle_route_message(&mut self, ty: MessageType, payload: &[u8]) -> u8 {
        let mut entries = [wire::RouteEntry::default(); 16];
        let count = match wire::decode_route_entries(payload, &mut entries) {
            Ok(c) => c,
            Err(_) => return wire::ACK_WRONGSIZE,
        };
        if ty == MessageType::RouteReset {
            self.transport.clear_routes();
        }
        for entry in &entries[..count] {
            if self.transport.set_route(entry.dst, entry.next).is_err() {
                return wire::ACK_BADPARAM;
            }
        }
        self.transport.enable_forwarding();
        self.status.insert(NodeStatus::INIT_ROUTES);
        wire::ACK_OK
    }

    fn handle_configure_sensor(&mut self, payload: &[u8]) -> u8 {
        let header = match wire::ConfigureSensorHeader::decode(payload) {
            Ok(h) => h,
            Err(_) => return wire::ACK_WRONGSIZE,
        };
        if header.channel_id as usize >= N {
            return ConfigureError::BadIndex.ack_code();
        }
        let params = match decode_state_estimation_params(&payload[wire::ConfigureSensorHeader::LEN..]) {
            Ok(p) => p,
            Err(e) => return e.ack_code(),
        };
        match StateEstimator::init(params, self.calculate_adc_sps()) {
            Ok(estimator) => {
                self.sensors[header.channel_id as usize] = Some(estimator);
                wire::ACK_OK
            }
            Err(_) => ConfigureError::BadParam.ack_code(),
        }
    }

    fn handle_start_sensor(&mut self, src: NodeId, payload: &[u8]) -> u8 {
        let start = match wire::StartSensor::decode(payload) {
            Ok(s) => s,
            Err(_) => return wire::ACK_WRONGSIZE,
        };
        self.active_sensor_channels = start.active_sensors;
        self.status_retransmission_base_delay = start.status_retransmission_delay;
        self.sensor_loop_delay_ms = if start.adc_samples_per_sec == 0 {
            1000
        } else {
            1000 / start.adc_samples_per_sec as u32
        };
        for (i, sensor) in self.sensors.iter_mut().enumerate() {
            if start.active_sensors & (1 << i) != 0 {
                if let Some(estimator) = sensor {
                    estimator.set_adc_sps(self.calculate_adc_sps());
                }
            }
        }
        self.status.insert(NodeStatus::SENSORS_ACTIVE);
        self.status.insert(NodeStatus::FORCE_UPDATE);
        self.begin_status_handshake(src);
        wire::ACK_OK
    }

    fn apply_led_message(&mut self, payload: &[u8], led: &mut impl LedStrip) {
        self.status.insert(NodeStatus::LED_SET);
        self.status.remove(NodeStatus::NO_LED_UPDATE);
        for (i, &color) in payload[1..].iter().enumerate() {
            led.set_color_index(i, color & 0x0f);
            led.set_color_index(i + 1, (color >> 4) & 0x0f);
        }
        led.flush();
    }

    fn handle_configure_status_change_indicator(
        &mut self,
        payload: &[u8],
        led: &mut impl LedStrip,
    ) -> u8 {
        let mut entries =
            [wire::StatusChangeIndicatorEntry::default(); wire::MAX_STATUS_CHANGE_INDICATOR_ENTRIES];
        let count = match wire::decode_status_change_indicators(payload, &mut entries) {
            Ok(c) => c,
            Err(_) => return wire::ACK_WRONGSIZE,
        };
        for e in &entries[..count] {
            led.set_color_index(e.led as usize, e.color);
        }
        led.flush();
        self.status.insert(NodeStatus::LED_SET);
        wire::ACK_OK
    }

    /// Arms a debug raw-frame dump for one ADC channel; `sample()` streams
    /// the raw values out as it gets them.
    fn handle_begin_send_raw_frames(&mut self, payload: &[u8]) -> u8 {
        let msg = match wire::BeginSendRawFrames::decode(payload) {
            Ok(m) => m,
            Err(_) => return wire::ACK_WRONGSIZE,
        };
        if msg.channel as usize >= N {
            return wire::ACK_BADINDEX;
        }
        self.raw_frame_dump = Some(RawFrameDump {
            channel: msg.channel,
            remaining: msg.num_of_frames,
        });
        wire::ACK_OK
    }

    /// Assembles and sends a one-shot `MSG_TYPE_RAW_STATUS` snapshot of
    /// every configured channel's estimator state, unsigned like the rest
    /// of the debug diagnostics.
    fn handle_get_raw_status(&mut self, src: NodeId) -> u8 {
        let header = wire::RawStatusHeader {
            node_status: self.status.0,
            sensor_loop_delay_ms: self.sensor_loop_delay_ms,
            retransmission_counter: self.status_buf.retransmission_counter,
            channel_enabled: self.active_sensor_channels,
        };
        let mut channels = [wire::RawStatusChannel::default(); wire::MAX_RAW_STATUS_CHANNELS];
        let count = self.sensors.len().min(wire::MAX_RAW_STATUS_CHANNELS);
        for (i, slot) in channels.iter_mut().take(count).enumerate() {
            if let Some(estimator) = self.sensors[i].as_ref() {
                *slot = wire::RawStatusChannel {
                    low_passed: estimator.low_passed_value(),
                    window_avg: estimator.current_rf_value() as u16,
                    state: estimator.current_state(),
                };
            }
        }
        let mut out = [0u8; MAX_PAYLOAD];
        match wire::encode_raw_status(&header, &channels[..count], &mut out) {
            Ok(len) => {
                let _ = self.transport.send(src, &out[..len]);
                wire::ACK_OK
            }
            Err(_) => wire::ACK_WRONGSIZE,
        }
    }

    /// Kicks off building the status channel towards `master`: the node is
    /// the signing side here, so it opens with its own HS1 carrying a fresh
    /// challenge and waits for the master's signed HS2.
    fn begin_status_handshake(&mut self, master: NodeId) {
        self.master_node = master;
        let challenge = self.transport.random_u64();
        self.auth_status = Some(AuthChannel::master_init(self.status_key, challenge));
        self.status.insert(NodeStatus::INIT_AUTH_STA_PEND);

        let Some(auth_status) = self.auth_status.as_mut() else {
            return;
        };
        let mut out = [0u8; MAX_PAYLOAD];
        let hs1 = wire::AuthHs1 {
            reply_route: self.transport.my_id(),
        };
        let Ok(hdr_len) = hs1.encode(&mut out) else {
            return;
        };
        let Ok(len) = auth_status.master_make_handshake(&mut out, hdr_len) else {
            return;
        };
        let _ = self.transport.send(master, &out[..len]);
    }

    /// Processes the master's signed HS2 reply to the status-channel HS1,
    /// completing the handshake.
    fn handle_status_hs2(&mut self, raw: &[u8]) {
        if !self.status.contains(NodeStatus::INIT_AUTH_STA_PEND) {
            return;
        }
        let Some(auth_status) = self.auth_status.as_mut() else {
            return;
        };
        let hdr_len = wire::AuthHs2::LEN;
        if auth_status.master_process_handshake(raw, hdr_len, raw.len()).is_ok() {
            self.status.insert(NodeStatus::INIT_AUTH_STA);
            self.status.remove(NodeStatus::INIT_AUTH_STA_PEND);
            self.status.insert(NodeStatus::FORCE_UPDATE);
        }
    }

    /// Feeds one completed ADC sample into channel `channel`'s estimator;
    /// call once per sample from the ADC sampling task.
    pub fn sample(&mut self, channel: usize, raw_value: u16) {
        self.adc_watchdog_s = 0;
        if channel >= N {
            return;
        }

        let finished_dump = self.raw_frame_dump.as_mut().and_then(|dump| {
            if dump.channel as usize == channel && dump.remaining > 0 {
                dump.remaining -= 1;
                Some(dump.remaining == 0)
            } else {
                None
            }
        });
        if let Some(done) = finished_dump {
            let mut out = [0u8; MAX_PAYLOAD];
            if let Ok(len) = wire::encode_raw_frame_values(&[raw_value], &mut out) {
                let _ = self.transport.send(self.master_node, &out[..len]);
            }
            if done {
                self.raw_frame_dump = None;
            }
        }

        if self.active_sensor_channels & (1 << channel) == 0 {
            return;
        }
        let Some(estimator) = self.sensors[channel].as_mut() else {
            return;
        };
        match estimator.update(raw_value) {
            StateUpdateResult::ChangedToOn => {
                self.current_sensor_status |= 1 << channel;
                self.status.insert(NodeStatus::FORCE_UPDATE);
            }
            StateUpdateResult::ChangedToOff => {
                self.current_sensor_status &= !(1 << channel);
                self.status.insert(NodeStatus::FORCE_UPDATE);
            }
            StateUpdateResult::Unchanged => {}
        }
    }

    /// Drives retransmission backoff and the network timeout watchdog.
    /// Call once per second.
    pub fn tick_one_second(&mut self) -> Result<(), ControllerFault> {
        self.config_channel_timeout_timer += 1;
        if self.config_channel_timeout_timer > self.misc_config.network_timeout_s {
            return Err(ControllerFault::NetworkTimeout);
        }

        if self.status.contains(NodeStatus::SENSORS_ACTIVE) {
            self.adc_watchdog_s += 1;
            if self.adc_watchdog_s > ADC_WATCHDOG_TIMEOUT_S {
                return Err(ControllerFault::AdcTaskHang);
            }
        }

        if self.status_buf.ack_outstanding {
            if self.status_buf.retransmit_delay_remaining_s > 0 {
                self.status_buf.retransmit_delay_remaining_s -= 1;
            } else {
                self.retransmit_status()?;
            }
        } else {
            self.maybe_send_status();
        }
        Ok(())
    }

    fn retransmit_status(&mut self) -> Result<(), ControllerFault> {
        self.status_buf.retransmission_counter += 1;
        if self.status_buf.retransmission_counter > self.misc_config.max_status_retransmissions {
            return Err(ControllerFault::StatusRetransmitExhausted);
        }
        let len = self.status_buf.len;
        let _ = self.transport.send(self.master_node, &self.status_buf.bytes[..len]);
        self.status_buf.retransmit_delay_remaining_s =
            self.retransmission_delay_s(self.status_buf.retransmission_counter);
        Ok(())
    }

    fn maybe_send_status(&mut self) {
        if !self.status.contains(NodeStatus::INIT_AUTH_STA) {
            return;
        }
        if !self.status.contains(NodeStatus::FORCE_UPDATE) {
            return;
        }
        let Some(auth_status) = self.auth_status.as_ref() else {
            return;
        };

        let mut out = [0u8; MAX_PAYLOAD];
        let status_update = wire::StatusUpdate {
            status: self.current_sensor_status,
        };
        let Ok(len) = status_update.encode(&mut out) else {
            return;
        };
        // add_data_sta = [my_id, master_id], matching the master's own binding.
        let add_data = [self.transport.my_id().as_u8(), self.master_node.as_u8()];
        let Ok(signed_len) = auth_status.master_sign(&mut out, len, &add_data) else {
            return;
        };

        self.status_buf.bytes[..signed_len].copy_from_slice(&out[..signed_len]);
        self.status_buf.len = signed_len;
        self.status_buf.ack_outstanding = true;
        self.status_buf.retransmission_counter = 0;
        self.status_buf.retransmit_delay_remaining_s = self.retransmission_delay_s(0);
        self.status.remove(NodeStatus::FORCE_UPDATE);

        let _ = self.transport.send(self.master_node, &out[..signed_len]);
    }

    /// Processes an ACK arriving on the status channel.
    pub fn handle_status_ack(&mut self, raw: &[u8]) {
        let Some(auth_status) = self.auth_status.as_mut() else {
            return;
        };
        if auth_status.master_check_ack(raw, 0, raw.len()).is_ok() {
            self.status_buf.ack_outstanding = false;
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn current_sensor_status(&self) -> u16 {
        self.current_sensor_status
    }
}

fn decode_state_estimation_params(data: &[u8]) -> Result<StateEstimationParams, ConfigureError> {
    use crate::estimator::{InputFilterParams, StateFilterParams, STATECOUNT};

    const INPUT_LEN: usize = 6;
    const MATRIX_LEN: usize = (STATECOUNT - 1) * STATECOUNT * 2;
    const WINDOW_LEN: usize = STATECOUNT * 2;
    const TAIL_LEN: usize = 4;
    const TOTAL_LEN: usize = INPUT_LEN + MATRIX_LEN + WINDOW_LEN + TAIL_LEN;

    if data.len() < TOTAL_LEN {
        return Err(ConfigureError::WrongSize);
    }

    let input_filter = InputFilterParams {
        mid_value_adjustment_speed: u16::from_le_bytes([data[0], data[1]]),
        lowpass_weight: u16::from_le_bytes([data[2], data[3]]),
        num_samples: u16::from_le_bytes([data[4], data[5]]),
    };

    let mut transition_matrix = [0i16; (STATECOUNT - 1) * STATECOUNT];
    for (i, slot) in transition_matrix.iter_mut().enumerate() {
        let off = INPUT_LEN + i * 2;
        *slot = i16::from_le_bytes([data[off], data[off + 1]]);
    }

    let mut window_sizes = [0u16; STATECOUNT];
    for (i, slot) in window_sizes.iter_mut().enumerate() {
        let off = INPUT_LEN + MATRIX_LEN + i * 2;
        *slot = u16::from_le_bytes([data[off], data[off + 1]]);
    }

    let tail_off = INPUT_LEN + MATRIX_LEN + WINDOW_LEN;
    let reject_threshold = u16::from_le_bytes([data[tail_off], data[tail_off + 1]]);
    let reject_consec_count = u16::from_le_bytes([data[tail_off + 2], data[tail_off + 3]]);

    Ok(StateEstimationParams {
        input_filter,
        state_filter: StateFilterParams {
            transition_matrix,
            window_sizes,
            reject_threshold,
            reject_consec_count,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColorTable, RgbColor, COLOR_TABLE_SIZE};
    use crate::radio::RfConfig;
    use crate::test_support::FakeRadio;

    struct FakeLed;
    impl LedStrip for FakeLed {
        fn len(&self) -> usize {
            5
        }
        fn set_color_index(&mut self, _index: usize, _color_index: u8) {}
        fn set_blinking(&mut self, _index: usize, _blinking: bool) {}
        fn show_system_status(&mut self, _status: SystemStatus) {}
        fn flush(&mut self) {}
    }

    struct FakeStore {
        node: SensorNodeConfig,
    }
    impl ConfigStore for FakeStore {
        fn node_config(&self) -> Option<SensorNodeConfig> {
            Some(self.node)
        }
        fn misc_config(&self) -> MiscConfig {
            MiscConfig::default()
        }
        fn color_table(&self) -> ColorTable {
            [RgbColor { r: 0, g: 0, b: 0 }; COLOR_TABLE_SIZE]
        }
        fn save_nonce(&mut self, _status_nonce: u64, _config_nonce: u64) {}
        fn load_nonces(&self) -> (u64, u64) {
            (0, 0)
        }
    }

    fn cfg() -> RfConfig {
        RfConfig {
            frequency_hz: 433_800_000,
            tx_power_db: 10,
            spread_factor: 7,
            coderate: 1,
            bandwidth_index: 7,
        }
    }

    fn controller() -> SensorController<FakeRadio, 4> {
        let transport = MeshTransport::init(NodeId::new(3), &cfg(), FakeRadio::new()).unwrap();
        let store = FakeStore {
            node: SensorNodeConfig {
                key_status: [1; AUTH_KEY_LEN],
                key_config: [2; AUTH_KEY_LEN],
                my_id: NodeId::new(3),
            },
        };
        let mut c: SensorController<FakeRadio, 4> = SensorController::new(transport, &store);
        c.boot(&store).unwrap();
        c
    }

    #[test]
    fn reset_clears_routes_and_forces_an_update() {
        let mut c = controller();
        c.status.insert(NodeStatus::SENSORS_ACTIVE);
        c.reset();
        assert!(!c.status.contains(NodeStatus::SENSORS_ACTIVE));
        assert!(c.status.contains(NodeStatus::FORCE_UPDATE));
        assert!(c.status.contains(NodeStatus::INIT_CPLT));
    }

    #[test]
    fn route_reset_then_append_installs_routes_and_enables_forwarding() {
        let mut c = controller();
        let mut led = FakeLed;
        let msg = [MessageType::RouteReset.code(), 9, 9, 5, 5];
        let ack = c.dispatch_command(NodeId::new(9), &msg, &mut led);
        assert_eq!(ack, wire::ACK_OK);
        assert!(c.status.contains(NodeStatus::INIT_ROUTES));
        assert!(c.transport.forwarding_enabled());
        assert_eq!(c.transport.route(NodeId::new(9)), NodeId::new(9));
    }

    #[test]
    fn configure_sensor_rejects_out_of_range_channel() {
        let mut c = controller();
        let mut payload = [0u8; 48];
        payload[0] = MessageType::ConfigureSensorChannel.code();
        payload[1] = 200; // way over N=4
        let mut led = FakeLed;
        let ack = c.dispatch_command(NodeId::new(9), &payload, &mut led);
        assert_eq!(ack, ConfigureError::BadIndex.ack_code());
    }

    #[test]
    fn adc_sps_falls_back_to_one_when_loop_delay_is_zero() {
        let mut c = controller();
        c.sensor_loop_delay_ms = 0;
        assert_eq!(c.calculate_adc_sps(), 1);
    }

    #[test]
    fn status_change_indicator_command_is_acked() {
        let mut c = controller();
        let mut led = FakeLed;
        let entries = [wire::StatusChangeIndicatorEntry { channel: 0, led: 1, color: 3 }];
        let mut payload = [0u8; 8];
        let len = wire::encode_status_change_indicators(&entries, &mut payload).unwrap();
        let ack = c.dispatch_command(NodeId::new(9), &payload[..len], &mut led);
        assert_eq!(ack, wire::ACK_OK);
        assert!(c.status.contains(NodeStatus::LED_SET));
    }

    #[test]
    fn begin_send_raw_frames_rejects_out_of_range_channel() {
        let mut c = controller();
        let mut led = FakeLed;
        let msg = wire::BeginSendRawFrames { channel: 200, num_of_frames: 5 };
        let mut payload = [0u8; wire::BeginSendRawFrames::LEN];
        let len = msg.encode(&mut payload).unwrap();
        let ack = c.dispatch_command(NodeId::new(9), &payload[..len], &mut led);
        assert_eq!(ack, wire::ACK_BADINDEX);
    }

    #[test]
    fn raw_frame_dump_streams_exactly_the_requested_count_then_stops() {
        let mut c = controller();
        let mut led = FakeLed;
        let msg = wire::BeginSendRawFrames { channel: 0, num_of_frames: 3 };
        let mut payload = [0u8; wire::BeginSendRawFrames::LEN];
        let len = msg.encode(&mut payload).unwrap();
        c.dispatch_command(NodeId::new(9), &payload[..len], &mut led);
        assert!(c.raw_frame_dump.is_some());

        c.sample(0, 100);
        c.sample(0, 200);
        c.sample(0, 300);
        assert!(c.raw_frame_dump.is_none());

        // further samples on the channel are a no-op for the (now cleared) dump.
        c.sample(0, 400);
        assert!(c.raw_frame_dump.is_none());
    }

    #[test]
    fn adc_watchdog_faults_once_sensors_are_active_and_samples_stop() {
        let mut c = controller();
        c.status.insert(NodeStatus::SENSORS_ACTIVE);
        for _ in 0..ADC_WATCHDOG_TIMEOUT_S {
            assert!(c.tick_one_second().is_ok());
        }
        assert_eq!(c.tick_one_second(), Err(ControllerFault::AdcTaskHang));
    }

    #[test]
    fn adc_sample_resets_the_watchdog() {
        let mut c = controller();
        c.status.insert(NodeStatus::SENSORS_ACTIVE);
        for _ in 0..(ADC_WATCHDOG_TIMEOUT_S - 1) {
            assert!(c.tick_one_second().is_ok());
        }
        c.sample(0, 100);
        for _ in 0..(ADC_WATCHDOG_TIMEOUT_S - 1) {
            assert!(c.tick_one_second().is_ok());
        }
    }
}
