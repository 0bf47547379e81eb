use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::protocol::frame::{
    self, FramingError, RESPONSE_FRAME_SIZE, RESPONSE_HEAD,
};
use crate::protocol::values::{Action, FanSpeed, OpMode, Sweep};
use crate::registry::{DeviceRegistry, Status};
use crate::transport::{TransportError, TransportLink};

/// Notifications the engine raises towards the message-bus side.
#[async_trait]
pub trait StatusNotify: Send + Sync {
    async fn state_changed(&self, room: &str, status: &Status);
    async fn availability_changed(&self, room: &str, online: bool);
}

/// A queued set-mode request from an external caller.
#[derive(Debug)]
pub struct Command {
    pub device_no: u8,
    pub room: String,
    pub request: Status,
}

/// Timing knobs for the transaction loop. Defaults match the bus
/// timings observed on real hardware; tests shrink them.
#[derive(Clone, Copy, Debug)]
pub struct EngineTuning {
    /// Single-flight lock acquisition bound.
    pub lock_timeout: Duration,
    /// Guard interval between write and the first read.
    pub settle_delay: Duration,
    /// Overall bound for hunting one response frame.
    pub response_timeout: Duration,
    /// Pause between consecutive device scans.
    pub inter_device_delay: Duration,
    /// Pause between discovery probes.
    pub discovery_delay: Duration,
    /// Consecutive counted failures tolerated before a forced reconnect.
    pub error_threshold: u32,
}

impl Default for EngineTuning {
    fn default() -> Self {
        EngineTuning {
            lock_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(100),
            response_timeout: Duration::from_millis(1500),
            inter_device_delay: Duration::from_millis(800),
            discovery_delay: Duration::from_millis(1500),
            error_threshold: 3,
        }
    }
}

#[derive(Debug, Error)]
enum TransactError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("write to unit 0x{id:02x} failed")]
    WriteFailed { id: u8 },
    #[error("no valid response from unit 0x{id:02x}")]
    NoResponse { id: u8 },
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Errors surfaced to the message-bus glue for inbound commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown room {0:?}")]
    UnknownRoom(String),
    #[error("unrecognized command field {0:?}")]
    UnknownField(String),
    #[error("bad payload {payload:?} for {field}")]
    BadPayload { field: String, payload: String },
}

/// Drives the half-duplex bus: one request/response transaction at a
/// time, periodic scans, discovery probes and the inbound command queue.
pub struct ProtocolEngine {
    link: TransportLink,
    registry: Mutex<DeviceRegistry>,
    notify: Arc<dyn StatusNotify>,
    bus: Mutex<()>,
    tuning: EngineTuning,
    scan_interval: Duration,
    calibration: f64,
    error_count: AtomicU32,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: StdMutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl ProtocolEngine {
    pub fn new(
        link: TransportLink,
        registry: DeviceRegistry,
        notify: Arc<dyn StatusNotify>,
        scan_interval: Duration,
        calibration: f64,
        tuning: EngineTuning,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        ProtocolEngine {
            link,
            registry: Mutex::new(registry),
            notify,
            bus: Mutex::new(()),
            tuning,
            scan_interval,
            calibration,
            error_count: AtomicU32::new(0),
            commands_tx,
            commands_rx: StdMutex::new(Some(commands_rx)),
        }
    }

    /// Query a unit. A reported `auto` opmode is presented as logically
    /// `on`; downstream climate modeling has no native auto action.
    pub async fn get_current_status(&self, id: u8) -> Option<Status> {
        debug!("get status of unit 0x{:02x}", id);
        let mut status = self.transact(id, &Status::query(), false).await?;
        if status.opmode == Some(OpMode::Auto) {
            status.action = Some(Action::On);
        }
        Some(status)
    }

    /// Apply a requested state to a unit and return what it reports back.
    pub async fn set_current_mode(&self, id: u8, request: &Status) -> Option<Status> {
        debug!("set mode of unit 0x{:02x}: {:?}", id, request);
        self.transact(id, request, false).await
    }

    /// Queue a set-mode request from a foreign execution context. The
    /// dedicated consumer loop picks it up in FIFO order.
    pub fn enqueue_command(&self, device_no: u8, room: impl Into<String>, request: Status) {
        let cmd = Command {
            device_no,
            room: room.into(),
            request,
        };
        if self.commands_tx.send(cmd).is_err() {
            warn!("command consumer is gone, dropping request");
        }
    }

    /// Consume queued commands until all senders are dropped. Call at
    /// most once; subsequent calls return immediately.
    pub async fn run_command_loop(&self) {
        let rx = self
            .commands_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(mut rx) = rx else {
            warn!("command loop already running");
            return;
        };

        while let Some(cmd) = rx.recv().await {
            info!(
                "command for {} (unit 0x{:02x}): {:?}",
                cmd.room, cmd.device_no, cmd.request
            );
            if let Some(status) = self.set_current_mode(cmd.device_no, &cmd.request).await {
                self.record_status(cmd.device_no, &cmd.room, &status).await;
            }
        }
    }

    /// Poll every device whose scan interval has elapsed, publishing
    /// state and availability transitions.
    pub async fn scan_devices(&self) {
        let now = Instant::now();
        let due: Vec<(u8, String)> = {
            let mut registry = self.registry.lock().await;
            registry
                .iter_mut()
                .filter(|d| d.is_scan_due(self.scan_interval, now))
                .map(|d| {
                    d.mark_scanned(now);
                    (d.id, d.room.clone())
                })
                .collect()
        };

        for (id, room) in due {
            debug!("rescanning {} (unit 0x{:02x})", room, id);
            match self.get_current_status(id).await {
                Some(status) => self.record_status(id, &room, &status).await,
                None => {
                    let transition = {
                        let mut registry = self.registry.lock().await;
                        registry
                            .get_mut(id)
                            .and_then(|d| d.availability_transition(false))
                    };
                    if transition.is_some() {
                        self.notify.availability_changed(&room, false).await;
                    }
                }
            }
            sleep(self.tuning.inter_device_delay).await;
        }
    }

    /// Probe configured ids (and, when `full` is set, the rest of the
    /// 0x00-0x0f range) with non-counted transactions. Implausible
    /// replies are rejected rather than treated as errors.
    pub async fn discovery_scan(&self, full: bool) {
        let known = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .map(|d| (d.id, Some(d.room.clone())))
                .collect::<Vec<_>>()
        };
        info!(
            "discovery: probing {} configured unit(s){}",
            known.len(),
            if full { " plus full 0x00-0x0f sweep" } else { "" }
        );

        let mut probes = known.clone();
        if full {
            for id in 0x00..=0x0f {
                if !known.iter().any(|(k, _)| *k == id) {
                    probes.push((id, None));
                }
            }
        }

        let mut found = Vec::new();
        for (id, room) in probes {
            if let Some(status) = self.transact(id, &Status::query(), true).await {
                if !is_plausible(&status) {
                    info!("ignoring unit 0x{:02x}: implausible reply {:?}", id, status);
                } else {
                    found.push(id);
                    match room {
                        Some(room) => {
                            info!("found {} at unit 0x{:02x}", room, id);
                            self.record_status(id, &room, &status).await;
                        }
                        None => {
                            warn!("unit 0x{:02x} responded but is not configured", id);
                        }
                    }
                }
            }
            sleep(self.tuning.discovery_delay).await;
        }

        if found.is_empty() {
            warn!("discovery found no units");
        } else {
            let ids: Vec<String> = found.iter().map(|id| format!("0x{:02x}", id)).collect();
            info!("discovery complete, responding units: {}", ids.join(", "));
        }
    }

    /// Map an inbound `{room}/{field} = payload` command onto the queue.
    /// Unspecified fields keep the device's last known values.
    pub async fn handle_external_command(
        &self,
        room: &str,
        field: &str,
        payload: &str,
    ) -> Result<(), CommandError> {
        let (id, room_name, mut request) = {
            let registry = self.registry.lock().await;
            let device = registry
                .by_room(room)
                .ok_or_else(|| CommandError::UnknownRoom(room.to_string()))?;
            (device.id, device.room.clone(), device.status)
        };

        match field {
            "mode" => {
                if payload == "off" {
                    request.action = Some(Action::Off);
                } else {
                    request.action = Some(Action::On);
                    request.opmode =
                        Some(payload.parse::<OpMode>().map_err(|_| {
                            CommandError::BadPayload {
                                field: field.to_string(),
                                payload: payload.to_string(),
                            }
                        })?);
                }
            }
            "swing_mode" => {
                request.sweep = if payload == "on" || payload == "swing" {
                    Sweep::Swing
                } else {
                    Sweep::Fixed
                };
            }
            "fan_mode" => {
                request.fan_speed =
                    Some(payload.parse::<FanSpeed>().map_err(|_| {
                        CommandError::BadPayload {
                            field: field.to_string(),
                            payload: payload.to_string(),
                        }
                    })?);
            }
            "target_temp" => {
                let temp: f64 = payload.parse().map_err(|_| CommandError::BadPayload {
                    field: field.to_string(),
                    payload: payload.to_string(),
                })?;
                request.target_temp = temp as u8;
            }
            other => return Err(CommandError::UnknownField(other.to_string())),
        }

        {
            let mut registry = self.registry.lock().await;
            if let Some(device) = registry.get_mut(id) {
                device.status = request;
            }
        }

        self.enqueue_command(id, room_name, request);
        Ok(())
    }

    /// Run one bus transaction under the single-flight lock. `probe`
    /// marks transactions against possibly-absent units; their failures
    /// do not move the consecutive-error counter.
    async fn transact(&self, id: u8, request: &Status, probe: bool) -> Option<Status> {
        let guard = timeout(self.tuning.lock_timeout, self.bus.lock()).await;
        let _guard = match guard {
            Ok(guard) => guard,
            Err(_) => {
                debug!("bus busy, skipping transaction for unit 0x{:02x}", id);
                return None;
            }
        };

        match self.exchange(id, request).await {
            Ok(status) => {
                self.error_count.store(0, Ordering::Relaxed);
                Some(status)
            }
            Err(err) => {
                debug!("transaction with unit 0x{:02x} failed: {}", id, err);
                if !probe {
                    self.count_error().await;
                }
                None
            }
        }
    }

    async fn count_error(&self) {
        let errors = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        if errors > self.tuning.error_threshold {
            warn!("{} consecutive bus errors, forcing a reconnect", errors);
            self.link.close().await;
            self.error_count.store(0, Ordering::Relaxed);
        }
    }

    /// The write-then-hunt exchange itself, without admission control.
    async fn exchange(&self, id: u8, request: &Status) -> Result<Status, TransactError> {
        self.link.connect().await?;

        let packet = frame::encode(
            0,
            id,
            request.action,
            request.opmode,
            request.sweep,
            request.fan_speed,
            request.target_temp,
        )?;
        if !self.link.write_chunk(&packet).await {
            return Err(TransactError::WriteFailed { id });
        }

        sleep(self.tuning.settle_delay).await;

        let deadline = Instant::now() + self.tuning.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransactError::NoResponse { id });
            }
            if !self.link.hunt_for_header(&[RESPONSE_HEAD], remaining).await {
                return Err(TransactError::NoResponse { id });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let raw = self.link.read_exact(RESPONSE_FRAME_SIZE, remaining).await;
            if raw.len() < RESPONSE_FRAME_SIZE {
                return Err(TransactError::NoResponse { id });
            }

            if !frame::verify_checksum(&raw) {
                // False header byte inside payload data: drop just that
                // byte and rescan, a real frame may start right behind it.
                warn!("checksum mismatch, resynchronizing: {:02x?}", &raw[..]);
                self.link.unread(&raw[1..]).await;
                continue;
            }

            let decoded = frame::decode(&raw, self.calibration)?;
            debug!("unit 0x{:02x} replied: {:?}", id, decoded);
            return Ok(Status::from(&decoded));
        }
    }

    /// Store a fresh status and publish it, plus the availability edge
    /// if the unit just came (back) online.
    async fn record_status(&self, id: u8, room: &str, status: &Status) {
        let transition = {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(id) {
                Some(device) => {
                    device.status = *status;
                    device.availability_transition(true)
                }
                None => None,
            }
        };
        self.notify.state_changed(room, status).await;
        if let Some(online) = transition {
            self.notify.availability_changed(room, online).await;
        }
    }
}

/// Discovery acceptance check: the unit must report a known operating
/// mode and a room temperature inside the physically sane range.
fn is_plausible(status: &Status) -> bool {
    status.opmode.is_some() && (0.0..=40.0).contains(&status.current_temp)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::protocol::frame::{response_bytes, WRITE_FRAME_SIZE, WRITE_HEADER_MAGIC};
    use crate::registry::Device;

    use super::*;

    fn fast_tuning() -> EngineTuning {
        EngineTuning {
            lock_timeout: Duration::from_millis(100),
            settle_delay: Duration::from_millis(1),
            response_timeout: Duration::from_millis(300),
            inter_device_delay: Duration::from_millis(1),
            discovery_delay: Duration::from_millis(1),
            error_threshold: 3,
        }
    }

    #[derive(Default)]
    struct RecordingNotify {
        states: StdMutex<Vec<(String, Status)>>,
        availability: StdMutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl StatusNotify for RecordingNotify {
        async fn state_changed(&self, room: &str, status: &Status) {
            self.states
                .lock()
                .unwrap()
                .push((room.to_string(), *status));
        }

        async fn availability_changed(&self, room: &str, online: bool) {
            self.availability
                .lock()
                .unwrap()
                .push((room.to_string(), online));
        }
    }

    fn registry_with(id: u8, room: &str) -> DeviceRegistry {
        let mut rooms = HashMap::new();
        rooms.insert(format!("0x{:02x}", id), room.to_string());
        DeviceRegistry::from_rooms(&rooms)
    }

    fn engine_for(
        listener: &TcpListener,
        registry: DeviceRegistry,
        notify: Arc<dyn StatusNotify>,
    ) -> ProtocolEngine {
        let addr = listener.local_addr().unwrap();
        ProtocolEngine::new(
            TransportLink::new(addr.ip().to_string(), addr.port()),
            registry,
            notify,
            Duration::from_secs(20),
            0.0,
            fast_tuning(),
        )
    }

    /// Mock unit: answer each 8-byte request on one connection with the
    /// prepared reply bytes.
    async fn serve_replies(listener: TcpListener, replies: Vec<Vec<u8>>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        for reply in replies {
            let mut request = [0u8; WRITE_FRAME_SIZE];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..3], &WRITE_HEADER_MAGIC[..]);
            socket.write_all(&reply).await.unwrap();
        }
        // Hold the connection open until the client side is done.
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    }

    #[tokio::test]
    async fn status_query_decodes_a_valid_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let engine = engine_for(&listener, registry_with(0x05, "study"), notify);

        // Line noise ahead of the frame exercises the header hunt.
        let mut reply = vec![0xde, 0xad];
        reply.extend_from_slice(&response_bytes(0x01, 0x05, 0x10, 0x19, 0x76));
        let server = tokio::spawn(serve_replies(listener, vec![reply]));

        let status = engine.get_current_status(0x05).await.unwrap();
        assert_eq!(status.action, Some(Action::Status));
        assert_eq!(status.opmode, Some(OpMode::Cool));
        assert_eq!(status.sweep, Sweep::Fixed);
        assert_eq!(status.fan_speed, Some(FanSpeed::Low));
        assert_eq!(status.current_temp, 24.5);
        assert_eq!(status.target_temp, 0x09 + 0x0f);

        engine.link.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn auto_opmode_is_presented_as_on() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let engine = engine_for(&listener, registry_with(0x01, "study"), notify);

        // mode 0x43: auto opmode, fan speed auto.
        let reply = response_bytes(0x01, 0x01, 0x43, 0x19, 0x76).to_vec();
        let server = tokio::spawn(serve_replies(listener, vec![reply]));

        let status = engine.get_current_status(0x01).await.unwrap();
        assert_eq!(status.opmode, Some(OpMode::Auto));
        assert_eq!(status.action, Some(Action::On));

        engine.link.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn false_header_byte_is_discarded_one_byte_at_a_time() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let engine = engine_for(&listener, registry_with(0x05, "study"), notify);

        // A stray 0x10 directly in front of the real frame makes the
        // first 16-byte window fail its checksum; the engine must drop
        // exactly that byte and still recover the frame behind it.
        let valid = response_bytes(0x01, 0x05, 0x10, 0x19, 0x76);
        let mut window = [0u8; RESPONSE_FRAME_SIZE];
        window[0] = RESPONSE_HEAD;
        window[1..].copy_from_slice(&valid[..15]);
        assert!(!frame::verify_checksum(&window));

        let mut reply = vec![RESPONSE_HEAD];
        reply.extend_from_slice(&valid);
        let server = tokio::spawn(serve_replies(listener, vec![reply]));

        let status = engine.get_current_status(0x05).await.unwrap();
        assert_eq!(status.opmode, Some(OpMode::Cool));

        engine.link.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn probe_failures_do_not_move_the_error_counter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicU32::new(0));
        let server_accepts = accepts.clone();
        tokio::spawn(async move {
            // Accept connections but never reply.
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                server_accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut sink = [0u8; 64];
                    while socket.read(&mut sink).await.unwrap_or(0) > 0 {}
                });
            }
        });

        let notify = Arc::new(RecordingNotify::default());
        let engine = ProtocolEngine::new(
            TransportLink::new(addr.ip().to_string(), addr.port()),
            registry_with(0x01, "study"),
            notify,
            Duration::from_secs(20),
            0.0,
            fast_tuning(),
        );

        // Probes never trip the reconnect threshold.
        for _ in 0..6 {
            assert!(engine.transact(0x01, &Status::query(), true).await.is_none());
        }
        assert_eq!(engine.error_count.load(Ordering::Relaxed), 0);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        // Counted failures do: the 4th one closes the link, the 5th
        // attempt dials a fresh connection.
        for _ in 0..4 {
            assert!(engine
                .transact(0x01, &Status::query(), false)
                .await
                .is_none());
        }
        assert_eq!(engine.error_count.load(Ordering::Relaxed), 0);
        assert!(!engine.link.is_connected().await);

        assert!(engine
            .transact(0x01, &Status::query(), false)
            .await
            .is_none());
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_transactions_serialize_or_time_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let mut tuning = fast_tuning();
        tuning.lock_timeout = Duration::from_millis(20);
        tuning.response_timeout = Duration::from_millis(400);
        let addr = listener.local_addr().unwrap();
        let engine = Arc::new(ProtocolEngine::new(
            TransportLink::new(addr.ip().to_string(), addr.port()),
            registry_with(0x01, "study"),
            notify,
            Duration::from_secs(20),
            0.0,
            tuning,
        ));

        tokio::spawn(async move {
            // Swallow the requests, never answer.
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 64];
            while socket.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let first_engine = engine.clone();
        let first =
            tokio::spawn(async move { first_engine.get_current_status(0x01).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The bus is held by the first transaction; the second gives up
        // after the short lock timeout instead of interleaving.
        let started = Instant::now();
        assert!(engine.get_current_status(0x01).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(first.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn command_loop_executes_and_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let engine = Arc::new(engine_for(
            &listener,
            registry_with(0x03, "bedroom"),
            notify.clone(),
        ));

        // Unit acknowledges the set-mode with a heat/swing status.
        let reply = response_bytes(0x03, 0x03, 0x4c, 0x19, 0x76).to_vec();
        let server = tokio::spawn(serve_replies(listener, vec![reply]));

        let loop_engine = engine.clone();
        let consumer = tokio::spawn(async move { loop_engine.run_command_loop().await });

        let mut request = Status::query();
        request.action = Some(Action::On);
        request.opmode = Some(OpMode::Heat);
        engine.enqueue_command(0x03, "bedroom", request);

        // Wait for the consumer to run the transaction and publish.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if !notify.states.lock().unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "command never published");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let states = notify.states.lock().unwrap();
            assert_eq!(states[0].0, "bedroom");
            assert_eq!(states[0].1.opmode, Some(OpMode::Heat));
            assert_eq!(states[0].1.sweep, Sweep::Swing);
        }

        consumer.abort();
        engine.link.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn scan_publishes_state_and_availability_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let engine = engine_for(&listener, registry_with(0x05, "study"), notify.clone());

        let reply = response_bytes(0x01, 0x05, 0x10, 0x19, 0x76).to_vec();
        let server = tokio::spawn(serve_replies(listener, vec![reply]));

        engine.scan_devices().await;
        {
            let states = notify.states.lock().unwrap();
            assert_eq!(states.len(), 1);
            assert_eq!(states[0].0, "study");
            assert_eq!(states[0].1.opmode, Some(OpMode::Cool));
        }
        assert_eq!(
            *notify.availability.lock().unwrap(),
            vec![("study".to_string(), true)]
        );

        // Nothing is due yet, so a second pass publishes nothing.
        engine.scan_devices().await;
        assert_eq!(notify.states.lock().unwrap().len(), 1);
        assert_eq!(notify.availability.lock().unwrap().len(), 1);

        engine.link.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn offline_transition_is_published_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let mut registry = registry_with(0x05, "study");
        // Pretend the unit was online before.
        registry.get_mut(0x05).unwrap().last_availability = Some(true);
        let engine = engine_for(&listener, registry, notify.clone());
        drop(listener); // nothing listens, every transaction fails

        engine.scan_devices().await;
        assert_eq!(
            *notify.availability.lock().unwrap(),
            vec![("study".to_string(), false)]
        );
        assert!(notify.states.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_command_updates_request_and_queues_it() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notify = Arc::new(RecordingNotify::default());
        let mut registry = DeviceRegistry::default();
        registry.insert(Device::new(0x03, "living room"));
        let engine = engine_for(&listener, registry, notify);

        engine
            .handle_external_command("living_room", "mode", "heat")
            .await
            .unwrap();
        engine
            .handle_external_command("living room", "target_temp", "24.0")
            .await
            .unwrap();

        let mut rx = engine.commands_rx.lock().unwrap().take().unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.device_no, 0x03);
        assert_eq!(first.room, "living room");
        assert_eq!(first.request.action, Some(Action::On));
        assert_eq!(first.request.opmode, Some(OpMode::Heat));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.request.target_temp, 24);
        // The second command carries the mode change made just before.
        assert_eq!(second.request.opmode, Some(OpMode::Heat));

        assert!(matches!(
            engine
                .handle_external_command("attic", "mode", "cool")
                .await,
            Err(CommandError::UnknownRoom(_))
        ));
        assert!(matches!(
            engine
                .handle_external_command("living room", "mode", "warp")
                .await,
            Err(CommandError::BadPayload { .. })
        ));
    }

    #[test]
    fn plausibility_checks_opmode_and_temperature() {
        let mut status = Status::query();
        status.opmode = Some(OpMode::Cool);
        status.current_temp = 24.5;
        assert!(is_plausible(&status));

        status.current_temp = 55.0;
        assert!(!is_plausible(&status));

        status.current_temp = 24.5;
        status.opmode = None;
        assert!(!is_plausible(&status));
    }
}
