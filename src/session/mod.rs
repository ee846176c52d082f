// src/session/mod.rs
//! Connection session: device ownership, reconnection and the read loop

pub mod autobaud;
pub mod callbacks;
pub mod state;

pub use autobaud::{AutobaudConfig, AutobaudOutcome};
pub use callbacks::{
    DeviceEvent, DeviceStatus, LocationSink, NoPermissionRequester, NoopCallbacks,
    PermissionRequester, SessionCallbacks,
};
pub use state::ConnectionState;

use crate::error::{ControllerError, GpsError, Result};
use crate::gps::{Fix, MessageFramer, MessageParser};
use crate::serial::{
    controller::{BoxedReader, BoxedWriter},
    BaudRate, DeviceId, DeviceProbe, SerialController, SerialLineConfiguration,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1100);

const READ_BUFFER_SIZE: usize = 4096;
const AUTOBAUD_QUEUE: usize = 16;

/// Timing and line settings of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub serial: SerialLineConfiguration,
    /// Wait between failed attach attempts
    pub reconnect_timeout: Duration,
    /// Silence after which the open NMEA epoch is closed
    pub read_timeout: Duration,
    pub autobaud: AutobaudConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serial: SerialLineConfiguration::default(),
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            autobaud: AutobaudConfig::default(),
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;

/// Everything guarded by the session lock
struct SessionInner {
    state: ConnectionState,
    /// The single owned device slot
    controller: Option<Box<dyn SerialController>>,
    /// Fires when the live link must be torn down
    link_close: Option<CancellationToken>,
    writer: Option<SharedWriter>,
    serial: SerialLineConfiguration,
    effective_baud_rate: Option<u32>,
}

struct Shared {
    inner: Mutex<SessionInner>,
    controller_present: watch::Sender<bool>,
    cancel: CancellationToken,
    probe: Arc<dyn DeviceProbe>,
    permissions: Arc<dyn PermissionRequester>,
    sink: Arc<dyn LocationSink>,
    callbacks: Arc<dyn SessionCallbacks>,
    reconnect_timeout: Duration,
    read_timeout: Duration,
    autobaud: AutobaudConfig,
}

/// A live attachment handed from the connect loop to the transfer loop
struct Attachment {
    reader: BoxedReader,
    close: CancellationToken,
    auto_baud: bool,
    baud_rate: u32,
}

impl Shared {
    /// Apply a transition; false when it is not allowed from the current state
    fn set_state(&self, next: ConnectionState) -> bool {
        let old = {
            let mut inner = self.inner.lock();
            let old = inner.state;
            if old == next {
                return true;
            }
            if !old.can_transition_to(next) {
                debug!("Rejected state transition {} -> {}", old, next);
                return false;
            }
            inner.state = next;
            old
        };

        debug!("Connection state {} -> {}", old, next);
        self.sink.set_device_status(next.device_status());
        self.callbacks.on_state_changed(old, next);
        true
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn wait_for_controller(&self) -> bool {
        let mut present = self.controller_present.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = present.wait_for(|present| *present) => res.is_ok(),
        }
    }

    fn try_attach(&self) -> std::result::Result<Attachment, ControllerError> {
        let mut inner = self.inner.lock();
        let serial = inner.serial;
        let (auto_baud, baud_rate) = match serial.baud_rate {
            BaudRate::Fixed(rate) => (false, rate),
            BaudRate::Auto => (true, self.autobaud.initial_rate()),
        };

        let controller = inner.controller.as_mut().ok_or(ControllerError::NotAttached)?;
        controller.set_configuration(serial.with_baud_rate(BaudRate::Fixed(baud_rate)))?;
        let link = controller.attach()?;
        info!("Attached {} at {}", controller.device_id(), serial);

        let close = self.cancel.child_token();
        inner.link_close = Some(close.clone());
        inner.writer = Some(Arc::new(tokio::sync::Mutex::new(link.writer)));
        inner.effective_baud_rate = (!auto_baud).then_some(baud_rate);

        Ok(Attachment {
            reader: link.reader,
            close,
            auto_baud,
            baud_rate,
        })
    }

    /// Attach the owned device, retrying with a fixed backoff until it
    /// succeeds or the session is cancelled
    async fn connect_loop(&self) -> Option<Attachment> {
        loop {
            if !self.wait_for_controller().await {
                return None;
            }
            if !self.set_state(ConnectionState::Connecting) {
                return None;
            }

            match self.try_attach() {
                Ok(attachment) => return Some(attachment),
                Err(e) => warn!("Attach failed: {}", e),
            }

            if self.is_cancelled() || !self.set_state(ConnectionState::Reconnecting) {
                return None;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.reconnect_timeout) => {}
            }
        }
    }

    /// Switch the live port to another rate, keeping the other line settings
    fn apply_baud_rate(&self, rate: u32) -> std::result::Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        let config = inner.serial.with_baud_rate(BaudRate::Fixed(rate));
        let controller = inner.controller.as_mut().ok_or(ControllerError::NotAttached)?;
        controller.set_configuration(config)
    }

    async fn run_autobaud(self: Arc<Self>, mut messages: mpsc::Receiver<()>) {
        let outcome =
            autobaud::detect_baud_rate(&self.autobaud, |rate| self.apply_baud_rate(rate), &mut messages)
                .await;

        match outcome {
            AutobaudOutcome::Detected(rate) => {
                self.inner.lock().effective_baud_rate = Some(rate);
                self.callbacks.on_autobaud_completed(true, rate);
            }
            AutobaudOutcome::Failed => {
                warn!("Autobaud failed, no receiver detected");
                self.callbacks.on_autobaud_completed(false, 0);
                self.cancel_session();
            }
            AutobaudOutcome::Interrupted => debug!("Autobaud interrupted"),
        }
    }

    /// Feed the link into the parser until it closes or fails
    async fn read_loop(
        &self,
        reader: &mut BoxedReader,
        close: &CancellationToken,
        messages: &mpsc::Sender<()>,
    ) {
        let sink = Arc::clone(&self.sink);
        let mut parser = MessageParser::new(move |fix: Option<Fix>| sink.publish(fix.as_ref()));
        let mut framer = MessageFramer::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = close.cancelled() => {
                    debug!("Link closed");
                    break;
                }
                res = tokio::time::timeout(self.read_timeout, reader.read(&mut buf)) => {
                    match res {
                        Err(_) => parser.put_timeout(),
                        Ok(Ok(0)) => {
                            info!("Serial stream ended");
                            break;
                        }
                        Ok(Ok(n)) => {
                            for frame in framer.push(&buf[..n]) {
                                if parser.put_frame(&frame) {
                                    let _ = messages.try_send(());
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("Serial read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Data transfer for one attachment; returns when the link is gone
    async fn transfer(self: &Arc<Self>, mut attachment: Attachment) {
        let (tx, rx) = mpsc::channel(AUTOBAUD_QUEUE);
        let autobaud = if attachment.auto_baud {
            Some(tokio::spawn(Arc::clone(self).run_autobaud(rx)))
        } else {
            drop(rx);
            self.callbacks.on_autobaud_completed(true, attachment.baud_rate);
            None
        };

        self.read_loop(&mut attachment.reader, &attachment.close, &tx).await;
        drop(tx);

        if let Some(task) = autobaud {
            task.abort();
            let _ = task.await;
        }
        self.release_link(&attachment.close);
    }

    /// Tear down the live link, keeping the controller for the next attach
    fn release_link(&self, close: &CancellationToken) {
        close.cancel();
        let mut inner = self.inner.lock();
        inner.link_close = None;
        inner.writer = None;
        if let Some(controller) = inner.controller.as_mut() {
            controller.detach();
        }
    }

    /// Release the owned controller. With `device`, only when it matches.
    fn release_controller(&self, device: Option<&DeviceId>) -> bool {
        let mut inner = self.inner.lock();
        let matches = match (&inner.controller, device) {
            (Some(controller), Some(device)) => controller.device_id() == device,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }

        if let Some(close) = inner.link_close.take() {
            close.cancel();
        }
        inner.writer = None;
        if let Some(mut controller) = inner.controller.take() {
            controller.detach();
            info!("Released {}", controller.device_id());
        }
        self.controller_present.send_replace(false);
        true
    }

    fn install_controller(&self, device: &DeviceId) {
        if self.is_cancelled() || self.inner.lock().controller.is_some() {
            debug!("Permission for {} superseded, ignoring", device);
            return;
        }
        let Some(controller) = self.probe.probe(device) else {
            warn!("Permission granted for unsupported device {}", device);
            return;
        };

        let mut inner = self.inner.lock();
        if self.is_cancelled() || inner.controller.is_some() {
            debug!("Permission for {} superseded, ignoring", device);
            return;
        }
        inner.controller = Some(controller);
        drop(inner);

        info!("Using device {}", device);
        self.controller_present.send_replace(true);
    }

    fn cancel_session(&self) {
        if !self.set_state(ConnectionState::Cancelled) {
            return;
        }
        self.cancel.cancel();
        self.callbacks.on_stopped();
        self.release_controller(None);
    }

    async fn run(self: Arc<Self>) {
        if !self.set_state(ConnectionState::Connecting) {
            return;
        }
        loop {
            let Some(attachment) = self.connect_loop().await else {
                break;
            };
            if self.is_cancelled() || !self.set_state(ConnectionState::Connected) {
                self.release_link(&attachment.close);
                break;
            }
            self.callbacks.on_connected();

            self.transfer(attachment).await;

            if self.is_cancelled() || !self.set_state(ConnectionState::Reconnecting) {
                break;
            }
            info!("Connection lost, reconnecting");
            self.callbacks.on_connection_lost();
        }
        debug!("Connection worker finished");
    }
}

/// Lifecycle of the connection to one GPS receiver at a time
pub struct ConnectionSession {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`ConnectionSession`]
pub struct SessionBuilder {
    config: SessionConfig,
    probe: Arc<dyn DeviceProbe>,
    sink: Arc<dyn LocationSink>,
    permissions: Arc<dyn PermissionRequester>,
    callbacks: Arc<dyn SessionCallbacks>,
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn permission_requester(mut self, permissions: Arc<dyn PermissionRequester>) -> Self {
        self.permissions = permissions;
        self
    }

    #[must_use]
    pub fn callbacks(mut self, callbacks: Arc<dyn SessionCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn build(self) -> ConnectionSession {
        let (controller_present, _) = watch::channel(false);
        let shared = Shared {
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Idle,
                controller: None,
                link_close: None,
                writer: None,
                serial: self.config.serial,
                effective_baud_rate: None,
            }),
            controller_present,
            cancel: CancellationToken::new(),
            probe: self.probe,
            permissions: self.permissions,
            sink: self.sink,
            callbacks: self.callbacks,
            reconnect_timeout: self.config.reconnect_timeout,
            read_timeout: self.config.read_timeout,
            autobaud: self.config.autobaud,
        };
        ConnectionSession {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        }
    }
}

impl ConnectionSession {
    pub fn builder(probe: Arc<dyn DeviceProbe>, sink: Arc<dyn LocationSink>) -> SessionBuilder {
        SessionBuilder {
            config: SessionConfig::default(),
            probe,
            sink,
            permissions: Arc::new(NoPermissionRequester),
            callbacks: Arc::new(NoopCallbacks),
        }
    }

    /// Spawn the connection worker and request permission for the first
    /// supported device already present. Must be called within a tokio
    /// runtime.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(GpsError::Connection("session already started".to_string()));
        }
        if self.shared.is_cancelled() {
            return Err(GpsError::Connection("session was stopped".to_string()));
        }
        *worker = Some(tokio::spawn(Arc::clone(&self.shared).run()));
        drop(worker);

        if let Some(device) = self.shared.probe.supported_devices().into_iter().next() {
            info!("Found {}, requesting permission", device);
            self.shared.permissions.request_permission(&device);
        }
        Ok(())
    }

    /// Cancel the session: stops the worker and releases the device.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.cancel_session();
    }

    /// Completes once the session is cancelled, by `stop` or by a failed
    /// autobaud
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Wait for the worker to finish
    pub async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Connection worker failed: {}", e);
            }
        }
    }

    pub fn handle_device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Attached(device) => {
                if self.shared.is_cancelled() {
                    return;
                }
                if self.shared.probe.probe(&device).is_some() {
                    info!("Supported device {} attached, requesting permission", device);
                    self.shared.permissions.request_permission(&device);
                } else {
                    debug!("Ignoring unsupported device {}", device);
                }
            }
            DeviceEvent::PermissionResult {
                device,
                granted: true,
            } => self.shared.install_controller(&device),
            DeviceEvent::PermissionResult {
                device,
                granted: false,
            } => info!("Permission denied for {}", device),
            DeviceEvent::Detached(device) => {
                if self.shared.release_controller(Some(&device)) {
                    info!("Device {} detached", device);
                } else {
                    debug!("Detach of {} does not concern this session", device);
                }
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Rate in use on the current link; `None` while autobaud is running or
    /// when not attached
    pub fn effective_baud_rate(&self) -> Option<u32> {
        let inner = self.shared.inner.lock();
        inner.link_close.as_ref().and(inner.effective_baud_rate)
    }

    pub fn serial_line_configuration(&self) -> SerialLineConfiguration {
        self.shared.inner.lock().serial
    }

    /// Takes effect on the next (re)connect
    pub fn set_serial_line_configuration(&self, config: SerialLineConfiguration) {
        self.shared.inner.lock().serial = config;
    }

    /// Device currently owned by the session
    pub fn device(&self) -> Option<DeviceId> {
        self.shared
            .inner
            .lock()
            .controller
            .as_ref()
            .map(|c| c.device_id().clone())
    }

    /// Send bytes to the receiver; a no-op when not connected
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let writer = self.shared.inner.lock().writer.clone();
        let Some(writer) = writer else {
            warn!("Not connected, dropping {} bytes", data.len());
            return Ok(());
        };
        let mut writer = writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::framing::tests::ubx_frame;
    use crate::serial::SerialLink;
    use std::collections::HashMap;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

    /// Test-visible side of one mock device
    #[derive(Default)]
    struct MockDevice {
        failures_left: usize,
        attaches: usize,
        detaches: usize,
        configs: Vec<SerialLineConfiguration>,
        host: Option<DuplexStream>,
    }

    struct MockController {
        id: DeviceId,
        config: SerialLineConfiguration,
        device: Arc<Mutex<MockDevice>>,
        attached: bool,
    }

    impl SerialController for MockController {
        fn device_id(&self) -> &DeviceId {
            &self.id
        }

        fn configuration(&self) -> &SerialLineConfiguration {
            &self.config
        }

        fn set_configuration(
            &mut self,
            config: SerialLineConfiguration,
        ) -> std::result::Result<(), ControllerError> {
            self.device.lock().configs.push(config);
            self.config = config;
            Ok(())
        }

        fn attach(&mut self) -> std::result::Result<SerialLink, ControllerError> {
            self.detach();
            let mut device = self.device.lock();
            if device.failures_left > 0 {
                device.failures_left -= 1;
                return Err(ControllerError::PermissionDenied(self.id.to_string()));
            }
            device.attaches += 1;
            let (port, host) = tokio::io::duplex(1024);
            device.host = Some(host);
            self.attached = true;
            let (reader, writer) = tokio::io::split(port);
            Ok(SerialLink::new(reader, writer))
        }

        fn detach(&mut self) {
            if self.attached {
                self.attached = false;
                let mut device = self.device.lock();
                device.detaches += 1;
                device.host = None;
            }
        }

        fn is_attached(&self) -> bool {
            self.attached
        }
    }

    #[derive(Default)]
    struct MockProbe {
        devices: Mutex<HashMap<DeviceId, Arc<Mutex<MockDevice>>>>,
        probes: Mutex<Vec<DeviceId>>,
    }

    impl MockProbe {
        fn add(&self, id: &str, failures: usize) -> Arc<Mutex<MockDevice>> {
            let device = Arc::new(Mutex::new(MockDevice {
                failures_left: failures,
                ..Default::default()
            }));
            self.devices.lock().insert(DeviceId::from(id), Arc::clone(&device));
            device
        }
    }

    impl DeviceProbe for MockProbe {
        fn supported_devices(&self) -> Vec<DeviceId> {
            let mut ids: Vec<_> = self.devices.lock().keys().cloned().collect();
            ids.sort();
            ids
        }

        fn probe(&self, device: &DeviceId) -> Option<Box<dyn SerialController>> {
            self.probes.lock().push(device.clone());
            let state = self.devices.lock().get(device).cloned()?;
            Some(Box::new(MockController {
                id: device.clone(),
                config: SerialLineConfiguration::default(),
                device: state,
                attached: false,
            }))
        }
    }

    #[derive(Default)]
    struct Recorder {
        fixes: Mutex<Vec<Option<Fix>>>,
        statuses: Mutex<Vec<DeviceStatus>>,
        transitions: Mutex<Vec<(ConnectionState, ConnectionState, Instant)>>,
        autobaud: Mutex<Vec<(bool, u32)>>,
        permission_requests: Mutex<Vec<DeviceId>>,
        connected: Mutex<usize>,
        lost: Mutex<usize>,
        stopped: Mutex<usize>,
    }

    impl LocationSink for Recorder {
        fn publish(&self, fix: Option<&Fix>) {
            self.fixes.lock().push(fix.cloned());
        }

        fn set_device_status(&self, status: DeviceStatus) {
            self.statuses.lock().push(status);
        }
    }

    impl SessionCallbacks for Recorder {
        fn on_connected(&self) {
            *self.connected.lock() += 1;
        }

        fn on_connection_lost(&self) {
            *self.lost.lock() += 1;
        }

        fn on_stopped(&self) {
            *self.stopped.lock() += 1;
        }

        fn on_state_changed(&self, old: ConnectionState, new: ConnectionState) {
            self.transitions.lock().push((old, new, Instant::now()));
        }

        fn on_autobaud_completed(&self, success: bool, baud_rate: u32) {
            self.autobaud.lock().push((success, baud_rate));
        }
    }

    impl PermissionRequester for Recorder {
        fn request_permission(&self, device: &DeviceId) {
            self.permission_requests.lock().push(device.clone());
        }
    }

    impl Recorder {
        fn entered(&self, state: ConnectionState) -> Vec<Instant> {
            self.transitions
                .lock()
                .iter()
                .filter(|(_, new, _)| *new == state)
                .map(|(_, _, at)| *at)
                .collect()
        }
    }

    fn session(
        probe: &Arc<MockProbe>,
        recorder: &Arc<Recorder>,
        config: SessionConfig,
    ) -> ConnectionSession {
        ConnectionSession::builder(probe.clone(), recorder.clone())
            .config(config)
            .permission_requester(recorder.clone())
            .callbacks(recorder.clone())
            .build()
    }

    fn grant(session: &ConnectionSession, id: &str) {
        session.handle_device_event(DeviceEvent::PermissionResult {
            device: DeviceId::from(id),
            granted: true,
        });
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn assert_backoff(elapsed: Duration) {
        assert!(
            elapsed >= DEFAULT_RECONNECT_TIMEOUT
                && elapsed < DEFAULT_RECONNECT_TIMEOUT + Duration::from_millis(10),
            "unexpected backoff {:?}",
            elapsed
        );
    }

    async fn send_to_port(device: &Arc<Mutex<MockDevice>>, data: &str) {
        let mut host = device.lock().host.take().expect("attached");
        host.write_all(data.as_bytes()).await.unwrap();
        device.lock().host = Some(host);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_until_attached() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 3);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        assert_eq!(*recorder.permission_requests.lock(), vec![DeviceId::from("/dev/ttyUSB0")]);
        grant(&session, "/dev/ttyUSB0");

        wait_until(|| session.state() == ConnectionState::Connected).await;

        let reconnecting = recorder.entered(ConnectionState::Reconnecting);
        assert_eq!(reconnecting.len(), 3);
        for pair in reconnecting.windows(2) {
            assert_backoff(pair[1] - pair[0]);
        }
        let connected = recorder.entered(ConnectionState::Connected);
        assert_eq!(connected.len(), 1);
        assert_backoff(connected[0] - reconnecting[2]);

        assert_eq!(device.lock().attaches, 1);
        assert_eq!(*recorder.connected.lock(), 1);
        assert_eq!(*recorder.autobaud.lock(), vec![(true, 9600)]);
        assert_eq!(session.effective_baud_rate(), Some(9600));
        assert_eq!(
            recorder.statuses.lock().last(),
            Some(&DeviceStatus::TemporarilyUnavailable)
        );

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let probe = Arc::new(MockProbe::default());
        probe.add("/dev/ttyUSB0", usize::MAX);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Reconnecting).await;

        let stopped_at = Instant::now();
        session.stop();
        session.join().await;

        assert!(stopped_at.elapsed() < DEFAULT_RECONNECT_TIMEOUT);
        assert_eq!(session.state(), ConnectionState::Cancelled);
        assert_eq!(*recorder.stopped.lock(), 1);
        assert_eq!(session.device(), None);
        assert_eq!(recorder.statuses.lock().last(), Some(&DeviceStatus::OutOfService));

        // stopping twice is harmless, restarting is refused
        session.stop();
        assert_eq!(*recorder.stopped.lock(), 1);
        assert!(session.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_connected_detaches_device() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;
        assert_eq!(device.lock().detaches, 0);

        session.stop();
        session.join().await;

        assert_eq!(session.state(), ConnectionState::Cancelled);
        assert_eq!(device.lock().detaches, 1);
        assert!(device.lock().host.is_none());
        assert_eq!(session.device(), None);
        assert_eq!(*recorder.stopped.lock(), 1);
        assert_eq!(*recorder.lost.lock(), 0);

        // nothing reattaches once stopped
        tokio::time::sleep(DEFAULT_RECONNECT_TIMEOUT * 3).await;
        assert_eq!(device.lock().attaches, 1);
        assert!(recorder.entered(ConnectionState::Reconnecting).is_empty());
        assert_eq!(recorder.entered(ConnectionState::Connected).len(), 1);
        session.write(b"$PSRF100*00\r\n").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fix_reaches_sink() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;

        send_to_port(&device, &format!("{}{}", GGA, RMC)).await;
        wait_until(|| !recorder.fixes.lock().is_empty()).await;

        let fixes = recorder.fixes.lock().clone();
        assert_eq!(fixes.len(), 1);
        let fix = fixes[0].as_ref().expect("fix");
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert!((fix.longitude - 11.516667).abs() < 1e-4);
        assert_eq!(fix.extras.satellites, Some(8));

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_closes_epoch() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;

        send_to_port(&device, GGA).await;
        let sent_at = Instant::now();
        wait_until(|| !recorder.fixes.lock().is_empty()).await;

        assert!(sent_at.elapsed() >= DEFAULT_READ_TIMEOUT);
        assert!(recorder.fixes.lock()[0].is_some());

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_reaches_receiver() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        // not connected yet: dropped
        session.write(b"$PSRF100*00\r\n").await.unwrap();

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;

        session.write(b"$PSRF100*00\r\n").await.unwrap();
        let mut host = device.lock().host.take().expect("attached");
        let mut buf = [0u8; 13];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"$PSRF100*00\r\n");

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_of_other_device_is_ignored() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        probe.add("/dev/ttyUSB1", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;

        session.handle_device_event(DeviceEvent::Detached(DeviceId::from("/dev/ttyUSB1")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(device.lock().detaches, 0);

        session.handle_device_event(DeviceEvent::Detached(DeviceId::from("/dev/ttyUSB0")));
        wait_until(|| session.state() == ConnectionState::Reconnecting).await;
        assert_eq!(device.lock().detaches, 1);
        assert_eq!(session.device(), None);
        assert_eq!(*recorder.lost.lock(), 1);

        // a new device brings the session back
        grant(&session, "/dev/ttyUSB1");
        wait_until(|| session.state() == ConnectionState::Connected).await;
        assert_eq!(session.device(), Some(DeviceId::from("/dev/ttyUSB1")));

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_permission_is_ignored() {
        let probe = Arc::new(MockProbe::default());
        probe.add("/dev/ttyUSB0", 0);
        let second = probe.add("/dev/ttyUSB1", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        grant(&session, "/dev/ttyUSB1");
        wait_until(|| session.state() == ConnectionState::Connected).await;

        assert_eq!(session.device(), Some(DeviceId::from("/dev/ttyUSB0")));
        assert_eq!(second.lock().attaches, 0);
        assert!(!probe.probes.lock().contains(&DeviceId::from("/dev/ttyUSB1")));

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_event_requests_permission() {
        let probe = Arc::new(MockProbe::default());
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        assert!(recorder.permission_requests.lock().is_empty());

        session.handle_device_event(DeviceEvent::Attached(DeviceId::from("/dev/ttyACM0")));
        assert!(recorder.permission_requests.lock().is_empty());

        probe.add("/dev/ttyACM0", 0);
        session.handle_device_event(DeviceEvent::Attached(DeviceId::from("/dev/ttyACM0")));
        assert_eq!(*recorder.permission_requests.lock(), vec![DeviceId::from("/dev/ttyACM0")]);

        session.handle_device_event(DeviceEvent::PermissionResult {
            device: DeviceId::from("/dev/ttyACM0"),
            granted: false,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.device(), None);

        session.stop();
        session.join().await;
    }

    fn autobaud_config(candidates: &[u32]) -> SessionConfig {
        SessionConfig {
            serial: SerialLineConfiguration::new(BaudRate::Auto),
            autobaud: AutobaudConfig {
                candidates: candidates.to_vec(),
                window_ms: 500,
            },
            ..SessionConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_autobaud_detects_rate() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, autobaud_config(&[4800, 38400]));

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;
        assert_eq!(session.effective_baud_rate(), None);

        let current_rate = || device.lock().configs.last().map(|c| c.baud_rate);
        wait_until(|| current_rate() == Some(BaudRate::Fixed(38400))).await;
        send_to_port(&device, "$GPGSV,1,1,00\r\n").await;
        wait_until(|| !recorder.autobaud.lock().is_empty()).await;

        assert_eq!(*recorder.autobaud.lock(), vec![(true, 38400)]);
        assert_eq!(session.effective_baud_rate(), Some(38400));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.serial_line_configuration().is_auto_baud());

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_autobaud_accepts_ubx_frames() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, autobaud_config(&[9600, 115200]));

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;

        let current_rate = || device.lock().configs.last().map(|c| c.baud_rate);
        wait_until(|| current_rate() == Some(BaudRate::Fixed(115200))).await;
        let mut host = device.lock().host.take().expect("attached");
        host.write_all(&ubx_frame(0x01, 0x07, &[0; 92])).await.unwrap();
        device.lock().host = Some(host);
        wait_until(|| !recorder.autobaud.lock().is_empty()).await;

        assert_eq!(*recorder.autobaud.lock(), vec![(true, 115200)]);
        assert!(recorder.fixes.lock().is_empty());
        assert_eq!(session.state(), ConnectionState::Connected);

        session.stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_autobaud_failure_cancels_session() {
        let probe = Arc::new(MockProbe::default());
        probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, autobaud_config(&[4800, 9600]));

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        session.join().await;

        assert_eq!(*recorder.autobaud.lock(), vec![(false, 0)]);
        assert_eq!(session.state(), ConnectionState::Cancelled);
        assert_eq!(*recorder.stopped.lock(), 1);
        assert_eq!(session.device(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_applies_on_reconnect() {
        let probe = Arc::new(MockProbe::default());
        let device = probe.add("/dev/ttyUSB0", 0);
        let recorder = Arc::new(Recorder::default());
        let session = session(&probe, &recorder, SessionConfig::default());

        session.start().unwrap();
        grant(&session, "/dev/ttyUSB0");
        wait_until(|| session.state() == ConnectionState::Connected).await;

        let faster = SerialLineConfiguration::new(BaudRate::Fixed(115200));
        session.set_serial_line_configuration(faster);
        assert_eq!(session.effective_baud_rate(), Some(9600));

        // end of stream drops the connection; the kept controller reattaches
        drop(device.lock().host.take());
        wait_until(|| device.lock().attaches == 2).await;
        wait_until(|| session.state() == ConnectionState::Connected).await;

        assert_eq!(session.effective_baud_rate(), Some(115200));
        assert_eq!(*recorder.lost.lock(), 1);
        assert_eq!(device.lock().configs.last(), Some(&faster));

        session.stop();
        session.join().await;
    }
}
