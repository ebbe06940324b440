#![no_std]
#![no_main]

use panic_probe as _;
use defmt_rtt as _;

/// Build-time defaults for the board this binary targets, mirroring
/// `sensor-node-firmware`'s board-constant block.
mod config {
    pub const MASTER_ID: u8 = 0;
    pub const NETWORK_ID: u8 = 18;
    pub const LORA_FREQ_HZ: u32 = 433_800_000;
    pub const HOST_BAUD: u32 = 115_200;
    /// Concurrent sensor-node connections this master can track.
    pub const N_SLOTS: usize = 8;
    /// Drives `MasterController::tick_one_second` and the host-link idle poll.
    pub const TICK_HZ: u32 = 10;
}

#[rtic::app(device = stm32f4xx_hal::pac, peripherals = true)]
mod app {
    use core::fmt::Write as _;

    use stm32f4xx_hal::{
        pac,
        prelude::*,
        rcc::Config,
        serial::{Config as SerialConfig, Event as SerialEvent, Serial},
        timer::{CounterHz, Event},
    };

    use heapless::{String, Vec};

    use meshcore::estimator::{InputFilterParams, StateEstimationParams, StateFilterParams};
    use meshcore::host_protocol::{Command, Event as HostEvent, ParseError};
    use meshcore::radio::{Radio, RadioError};
    use meshcore::transport::{MeshTransport, MAX_OTA, MAX_PAYLOAD};
    use meshcore::wire::{self, ConfigureSensorHeader, StartSensor};
    use meshcore::{ConnectionEvent, MasterController, NodeId, RfConfig};

    use crate::config as board;

    /// Default tuning handed to `configure_sensor` until a real per-channel
    /// provisioning flow exists; values are a plausible monotone ladder, not
    /// board-calibrated.
    const DEFAULT_ESTIMATION_PARAMS: StateEstimationParams = StateEstimationParams {
        input_filter: InputFilterParams {
            mid_value_adjustment_speed: 4,
            lowpass_weight: 8,
            num_samples: 4,
        },
        state_filter: StateFilterParams {
            transition_matrix: [
                100, 0, 0, //
                -50, 200, 0, //
                0, -150, 500, //
                0, 0, -400,
            ],
            window_sizes: [4, 4, 4, 4],
            reject_threshold: 10,
            reject_consec_count: 2,
        },
    };

    /// Per-node auth keys the master signs/verifies with. Flash persistence
    /// is out of scope here; every node uses the same all-zero pair until a
    /// real provisioning flow exists.
    fn keys_for(_node: NodeId) -> (meshcore::auth::AuthKey, meshcore::auth::AuthKey) {
        ([0u8; 16], [0u8; 16])
    }

    /// `Radio` over a RYLR-style AT-command LoRa-UART module, identical in
    /// shape to `sensor-node-firmware`'s (same module, same wire framing).
    struct UartRadio {
        uart: Serial<pac::UART4>,
        line_buf: Vec<u8, 256>,
        pending: Option<([u8; MAX_OTA], usize)>,
        last_rssi: i16,
        last_snr: i16,
        rng_state: u32,
    }

    impl UartRadio {
        fn new(uart: Serial<pac::UART4>, seed: u32) -> Self {
            UartRadio {
                uart,
                line_buf: Vec::new(),
                pending: None,
                last_rssi: 0,
                last_snr: 0,
                rng_state: seed | 1,
            }
        }

        fn send_at_command(&mut self, cmd: &str) {
            defmt::debug!("master radio AT: {}", cmd);
            for byte in cmd.as_bytes() {
                let _ = nb::block!(self.uart.write(*byte));
            }
            let _ = nb::block!(self.uart.write(b'\r'));
            let _ = nb::block!(self.uart.write(b'\n'));
            cortex_m::asm::delay(8_400_000);
        }

        fn push_byte(&mut self, byte: u8) {
            if self.line_buf.push(byte).is_err() {
                self.line_buf.clear();
                return;
            }
            let len = self.line_buf.len();
            if byte == b'\n' && len >= 2 && self.line_buf[len - 2] == b'\r' {
                self.parse_line();
                self.line_buf.clear();
            }
        }

        fn parse_line(&mut self) {
            let line = self.line_buf.as_slice();
            if line.len() < 6 || &line[0..5] != b"+RCV=" {
                return;
            }

            let mut commas = [0usize; 4];
            let mut found = 0;
            for (i, &b) in line[5..].iter().enumerate() {
                if b == b',' {
                    if found < commas.len() {
                        commas[found] = 5 + i;
                    }
                    found += 1;
                    if found == 4 {
                        break;
                    }
                }
            }
            if found < 3 {
                return;
            }

            let len_bytes = &line[commas[0] + 1..commas[1]];
            let Ok(len_str) = core::str::from_utf8(len_bytes) else { return };
            let Ok(payload_len) = len_str.parse::<usize>() else { return };

            let payload_start = commas[1] + 1;
            let payload_end = payload_start + payload_len;
            if payload_end > line.len() || payload_len > MAX_OTA {
                return;
            }

            let mut buf = [0u8; MAX_OTA];
            buf[..payload_len].copy_from_slice(&line[payload_start..payload_end]);
            self.pending = Some((buf, payload_len));

            if found >= 4 {
                if let Ok(s) = core::str::from_utf8(&line[commas[2] + 1..commas[3]]) {
                    if let Ok(v) = s.parse::<i16>() {
                        self.last_rssi = v;
                    }
                }
            }
        }
    }

    impl Radio for UartRadio {
        fn init(&mut self, cfg: &RfConfig) -> Result<(), RadioError> {
            self.send_at_command("AT");
            let mut cmd: String<32> = String::new();
            let _ = write!(cmd, "AT+ADDRESS={}", board::MASTER_ID);
            self.send_at_command(cmd.as_str());

            cmd.clear();
            let _ = write!(cmd, "AT+NETWORKID={}", board::NETWORK_ID);
            self.send_at_command(cmd.as_str());

            cmd.clear();
            let _ = write!(cmd, "AT+BAND={}", cfg.frequency_hz);
            self.send_at_command(cmd.as_str());

            cmd.clear();
            let _ = write!(
                cmd,
                "AT+PARAMETER={},{},1,{}",
                cfg.spread_factor, cfg.bandwidth_index, cfg.coderate
            );
            self.send_at_command(cmd.as_str());

            while self.uart.read().is_ok() {}
            self.uart.listen(SerialEvent::RxNotEmpty);
            Ok(())
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), RadioError> {
            if frame.len() > MAX_OTA {
                return Err(RadioError::InvalidParams);
            }
            let mut cmd: String<16> = String::new();
            let _ = write!(cmd, "AT+SEND=0,{},", frame.len());
            for b in cmd.as_bytes() {
                let _ = nb::block!(self.uart.write(*b));
            }
            for &b in frame {
                let _ = nb::block!(self.uart.write(b));
            }
            let _ = nb::block!(self.uart.write(b'\r'));
            let _ = nb::block!(self.uart.write(b'\n'));
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, RadioError> {
            while let Ok(byte) = self.uart.read() {
                self.push_byte(byte);
            }

            let uart_ptr = unsafe { &*pac::UART4::ptr() };
            let sr = uart_ptr.sr().read();
            if sr.ore().bit_is_set() || sr.nf().bit_is_set() || sr.fe().bit_is_set() {
                let _ = uart_ptr.dr().read();
                defmt::warn!("master UART4 errors cleared");
            }

            match self.pending.take() {
                Some((data, len)) => {
                    if len > buf.len() {
                        return Err(RadioError::InvalidParams);
                    }
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(Some(len))
                }
                None => Ok(None),
            }
        }

        fn is_busy(&self) -> bool {
            false
        }

        fn last_pkt_rssi_snr(&self) -> (i16, i16) {
            (self.last_rssi, self.last_snr)
        }

        fn get_random_u32(&mut self) -> u32 {
            self.rng_state ^= self.rng_state << 13;
            self.rng_state ^= self.rng_state >> 17;
            self.rng_state ^= self.rng_state << 5;
            self.rng_state
        }
    }

    /// Line-buffered link to the host (`gateway-service`): decodes command
    /// lines in from USART2, and formats `###`-prefixed events back out.
    struct HostLink {
        uart: Serial<pac::USART2>,
        line_buf: Vec<u8, 128>,
        pending: Option<String<128>>,
    }

    impl HostLink {
        fn new(uart: Serial<pac::USART2>) -> Self {
            HostLink {
                uart,
                line_buf: Vec::new(),
                pending: None,
            }
        }

        /// Called from the USART2 RX interrupt; buffers until `\n`.
        fn push_byte(&mut self, byte: u8) {
            if byte == b'\n' {
                if let Ok(line) = core::str::from_utf8(&self.line_buf) {
                    let mut s: String<128> = String::new();
                    let _ = s.push_str(line.trim_end_matches('\r'));
                    self.pending = Some(s);
                }
                self.line_buf.clear();
                return;
            }
            if self.line_buf.push(byte).is_err() {
                self.line_buf.clear();
            }
        }

        fn take_line(&mut self) -> Option<String<128>> {
            self.pending.take()
        }

        fn write_line(&mut self, line: &str) {
            for b in line.as_bytes() {
                let _ = nb::block!(self.uart.write(*b));
            }
            let _ = nb::block!(self.uart.write(b'\n'));
        }

        fn emit(&mut self, event: HostEvent) {
            let mut s: String<64> = String::new();
            if event.format(&mut s).is_ok() {
                self.write_line(s.as_str());
            }
        }

        /// Writes one `*<value>` line, part of the value stream that follows
        /// a `###RAW<node>-<count>` header.
        fn emit_raw_value(&mut self, value: u16) {
            let mut s: String<16> = String::new();
            if write!(s, "*{}", value).is_ok() {
                self.write_line(s.as_str());
            }
        }

        /// Writes the `*<node_status>,<loop_delay_ms>,<retransmits>,<channel_mask>`
        /// header line of a decoded raw-status snapshot.
        fn emit_raw_status_header(&mut self, header: &wire::RawStatusHeader) {
            let mut s: String<48> = String::new();
            if write!(
                s,
                "*{},{},{},{}",
                header.node_status,
                header.sensor_loop_delay_ms,
                header.retransmission_counter,
                header.channel_enabled
            )
            .is_ok()
            {
                self.write_line(s.as_str());
            }
        }

        /// Writes one `*<low_passed>,<window_avg>,<state>` channel line of a
        /// decoded raw-status snapshot.
        fn emit_raw_status_channel(&mut self, channel: &wire::RawStatusChannel) {
            let mut s: String<32> = String::new();
            if write!(s, "*{},{},{}", channel.low_passed, channel.window_avg, channel.state).is_ok() {
                self.write_line(s.as_str());
            }
        }
    }

    #[shared]
    struct Shared {
        controller: MasterController<UartRadio, { board::N_SLOTS }>,
        host: HostLink,
    }

    #[local]
    struct Local {
        led: stm32f4xx_hal::gpio::Pin<'A', 5, stm32f4xx_hal::gpio::Output>,
        timer: CounterHz<pac::TIM2>,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let dp = cx.device;
        let mut rcc = dp.RCC.freeze(Config::hsi().sysclk(84.MHz()));

        let gpioa = dp.GPIOA.split(&mut rcc);
        let gpioc = dp.GPIOC.split(&mut rcc);
        let led = gpioa.pa5.into_push_pull_output();

        let lora_tx = gpioc.pc10.into_alternate();
        let lora_rx = gpioc.pc11.into_alternate();
        let lora_uart = Serial::new(
            dp.UART4,
            (lora_tx, lora_rx),
            SerialConfig::default().baudrate(115_200.bps()),
            &mut rcc,
        )
        .unwrap();

        let host_tx = gpioa.pa2.into_alternate();
        let host_rx = gpioa.pa3.into_alternate();
        let mut host_uart = Serial::new(
            dp.USART2,
            (host_tx, host_rx),
            SerialConfig::default().baudrate(board::HOST_BAUD.bps()),
            &mut rcc,
        )
        .unwrap();
        host_uart.listen(SerialEvent::RxNotEmpty);

        let seed = cortex_m::peripheral::DWT::cycle_count();
        let radio = UartRadio::new(lora_uart, seed);

        let rf_config = RfConfig {
            frequency_hz: board::LORA_FREQ_HZ,
            tx_power_db: 10,
            spread_factor: 7,
            coderate: 1,
            bandwidth_index: 7,
        };

        let transport = MeshTransport::init(NodeId::new(board::MASTER_ID), &rf_config, radio)
            .expect("radio init failed");
        let controller: MasterController<UartRadio, { board::N_SLOTS }> = MasterController::new(transport);

        let mut timer = dp.TIM2.counter_hz(&mut rcc);
        timer.start(board::TICK_HZ.Hz()).unwrap();
        timer.listen(Event::Update);

        (
            Shared {
                controller,
                host: HostLink::new(host_uart),
            },
            Local { led, timer },
            init::Monotonics(),
        )
    }

    #[task(binds = UART4, shared = [controller, host])]
    fn uart4_handler(cx: uart4_handler::Context) {
        (cx.shared.controller, cx.shared.host).lock(|controller, host| {
            if let Some((node, event)) = controller.poll() {
                emit_connection_event(host, node, event);
            }
        });
    }

    /// Runs at `TICK_HZ`; every `TICK_HZ` ticks drives per-connection
    /// retransmission backoff and reports retransmission-cap timeouts.
    #[task(binds = TIM2, shared = [controller, host], local = [led, timer])]
    fn tim2_handler(cx: tim2_handler::Context) {
        cx.local.timer.clear_flags(stm32f4xx_hal::timer::Flag::Update);
        cx.local.led.toggle();

        (cx.shared.controller, cx.shared.host).lock(|controller, host| {
            for (node, _fault) in controller.tick_one_second() {
                host.emit(HostEvent::Timeout { node });
            }
        });
    }

    #[task(binds = USART2, shared = [controller, host])]
    fn usart2_handler(cx: usart2_handler::Context) {
        (cx.shared.controller, cx.shared.host).lock(|controller, host| {
            let byte = match host.uart.read() {
                Ok(b) => b,
                Err(_) => return,
            };
            host.push_byte(byte);
            let Some(line) = host.take_line() else { return };
            if line.is_empty() {
                return;
            }
            match Command::parse(line.as_str()) {
                Ok(command) => dispatch_command(controller, host, command),
                Err(ParseError) => host.emit(HostEvent::Err),
            }
        });
    }

    /// Translates one parsed host command into mesh traffic, mirroring
    /// `master_node.c`'s command table.
    fn dispatch_command(
        controller: &mut MasterController<UartRadio, { board::N_SLOTS }>,
        host: &mut HostLink,
        command: Command,
    ) {
        let mut buf = [0u8; MAX_PAYLOAD];
        match command {
            Command::Connect { node, first_hop, timeout_s: _ } => {
                // Per-connection timeouts aren't tracked by `SensorConnection`
                // (only the node's own network timeout is); the argument is
                // accepted for protocol compatibility and otherwise ignored.
                let (config_key, status_key) = keys_for(node);
                match controller.connect(node, first_hop, config_key, status_key) {
                    Ok(conn) => match conn.make_hs1(&mut buf) {
                        Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                        Err(_) => host.emit(HostEvent::Err),
                    },
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::Retransmit { node } => {
                let Some(conn) = controller.find(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.last_sent() {
                    Some(bytes) => {
                        let n = bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                        send_or_err(controller, host, node, &buf[..n]);
                    }
                    None => host.emit(HostEvent::Err),
                }
            }
            Command::ResetRoutes { node, entries } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.make_route_message(true, &entries, &mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::SetRoutes { node, entries } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.make_route_message(false, &entries, &mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::ConfigureSensor { node, channel } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                let header = ConfigureSensorHeader { channel_id: channel };
                match conn.make_configure_sensor(header, &DEFAULT_ESTIMATION_PARAMS, &mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::EnableSensor { node, mask, sps } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                let start = StartSensor {
                    status_retransmission_delay: 1,
                    active_sensors: mask,
                    adc_samples_per_sec: sps,
                };
                match conn.make_start_sensor(start, &mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::AuthPing { node } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.make_nop(&mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::Ping { node } => {
                // Unsigned echo: no connection/keys required.
                let len = match wire::encode_empty(wire::MessageType::EchoRequest, &mut buf) {
                    Ok(len) => len,
                    Err(_) => {
                        host.emit(HostEvent::Err);
                        return;
                    }
                };
                send_or_err(controller, host, node, &buf[..len]);
            }
            Command::Routes { entries } => {
                for entry in entries.iter() {
                    if controller.set_route(entry.dst, entry.next).is_err() {
                        host.emit(HostEvent::Err);
                        return;
                    }
                }
                host.emit(HostEvent::Ack {
                    node: NodeId::new(board::MASTER_ID),
                    code: 0,
                });
            }
            Command::RawFrames { node, channel, count } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                let msg = wire::BeginSendRawFrames { channel, num_of_frames: count };
                match conn.make_begin_send_raw_frames(msg, &mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::RawStatus { node } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.make_get_raw_status(&mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::Led { node, colors } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.make_led(&colors, &mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::RebuildStatusChannel { node } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.make_rebuild_status_channel(&mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
            Command::CfgStatusChangeIndicator { node, entries } => {
                let Some(conn) = controller.find_mut(node) else {
                    host.emit(HostEvent::Err);
                    return;
                };
                match conn.make_cfg_status_change_indicator(&entries, &mut buf) {
                    Ok(len) => send_or_err(controller, host, node, &buf[..len]),
                    Err(_) => host.emit(HostEvent::Err),
                }
            }
        }
    }

    fn send_or_err(
        controller: &mut MasterController<UartRadio, { board::N_SLOTS }>,
        host: &mut HostLink,
        node: NodeId,
        frame: &[u8],
    ) {
        match controller.send_to(node, frame) {
            Ok(()) => host.emit(HostEvent::Ack { node, code: 0 }),
            Err(_) => host.emit(HostEvent::Err),
        }
    }

    /// Converts a `ConnectionEvent` produced by `MasterController::poll` into
    /// a host-visible line.
    fn emit_connection_event(host: &mut HostLink, node: NodeId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Ack { code } => host.emit(HostEvent::Ack { node, code }),
            ConnectionEvent::Status { status } => host.emit(HostEvent::Status { node, status }),
            ConnectionEvent::Timeout => host.emit(HostEvent::Timeout { node }),
            ConnectionEvent::Raw { values, count } => {
                host.emit(HostEvent::Raw { node, count: count as u16 });
                for &value in &values[..count as usize] {
                    host.emit_raw_value(value);
                }
            }
            ConnectionEvent::RawStatus { header, channels, count } => {
                host.emit(HostEvent::Raw { node, count: count as u16 });
                host.emit_raw_status_header(&header);
                for channel in &channels[..count as usize] {
                    host.emit_raw_status_channel(channel);
                }
            }
        }
    }
}
