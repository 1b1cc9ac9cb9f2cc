// src/engine.rs
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, select, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::ConsoleConfig;
use crate::drivers::{
    Accumulator, CancelToken, ConsoleError, DisplayPipeline, DisplayUpdate, HandoffQueue,
    Instrument, QueueMetrics, Subscription, TdrPreset,
};
use crate::recorder;
use crate::types::{
    ConnectionState, ConsoleEvent, DisplayMode, Frame, InstrumentState, LedId, LedSelectors,
    LedState, Listener,
};

pub const SUPPORTED_MAJOR_VERSION: &str = "0";
pub const PRE_RELEASE_MARKER: &str = "dev";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Accepts `<major>.x.y[.reserved]` when the major matches, or when the
/// reserved part marks a pre-release build.
pub fn check_version(version: &str) -> Result<(), ConsoleError> {
    let mut parts = version.trim().split('.');
    let major = parts.next().unwrap_or_default();
    let reserved = parts.nth(2);
    if major == SUPPORTED_MAJOR_VERSION || reserved == Some(PRE_RELEASE_MARKER) {
        return Ok(());
    }
    let err = ConsoleError::VersionMismatch {
        version: version.to_owned(),
        supported: SUPPORTED_MAJOR_VERSION,
    };
    error!("{err}");
    Err(err)
}

// 每次连接一份，采集线程与控制端共享
struct StreamContext {
    accumulator: Mutex<Accumulator>,
    queue: HandoffQueue,
    paused: AtomicBool,
    /// Set while the link is intentionally up. Checked after a listener error.
    running: AtomicBool,
    link_lost: AtomicBool,
    /// A FrameReady is in flight; further pushes do not notify until dispatch.
    frame_pending: AtomicBool,
    frames_received: AtomicU64,
    // Last published values, kept here because the event channel may drop them.
    latest_state: Mutex<Option<InstrumentState>>,
    latest_led: Mutex<Option<LedState>>,
    events: Sender<ConsoleEvent>,
    rate_log_interval: Duration,
}

impl StreamContext {
    fn new(
        config: &ConsoleConfig,
        averaging: usize,
        events: Sender<ConsoleEvent>,
    ) -> Result<Self, ConsoleError> {
        Ok(Self {
            accumulator: Mutex::new(Accumulator::new(averaging)?),
            queue: HandoffQueue::new(config.queue_capacity),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            link_lost: AtomicBool::new(false),
            frame_pending: AtomicBool::new(false),
            frames_received: AtomicU64::new(0),
            latest_state: Mutex::new(None),
            latest_led: Mutex::new(None),
            events,
            rate_log_interval: config.rate_log_interval(),
        })
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn notify(&self, event: ConsoleEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("event channel full, dropping {event:?}"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Averaging step. A paused display still consumes the frame.
    fn ingest(&self, frame: Frame) {
        if !self.is_paused() {
            let pushed = {
                let mut accumulator = self.accumulator.lock();
                accumulator
                    .push(frame)
                    .map(|averaged| self.queue.push(averaged))
            };
            if pushed == Some(true) && !self.frame_pending.swap(true, Ordering::SeqCst) {
                self.notify(ConsoleEvent::FrameReady);
            }
        }
        self.frames_received.fetch_add(1, Ordering::SeqCst);
    }

    fn publish_state(&self, state: InstrumentState) {
        if state.acquisition_stalled {
            error!("Acquisition stalled");
        }
        if !self.is_paused() {
            *self.latest_state.lock() = Some(state.clone());
            self.notify(ConsoleEvent::StateChanged(state));
        }
    }

    fn publish_led(&self, led: LedState) {
        *self.latest_led.lock() = Some(led);
        self.notify(ConsoleEvent::LedChanged(led));
    }

    fn forget_latest(&self) {
        self.latest_state.lock().take();
        self.latest_led.lock().take();
    }

    fn listener_failed(&self, listener: Listener, err: ConsoleError) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("{listener} listener stopped: {err}");
            return;
        }
        let detail = err.to_string();
        error!(
            "{}",
            ConsoleError::Stream {
                listener,
                detail: detail.clone()
            }
        );
        // Event first, so a consumer that sees the flag also finds the event.
        self.notify(ConsoleEvent::StreamFailed { listener, detail });
        self.link_lost.store(true, Ordering::SeqCst);
    }
}

/// Logs the received frame rate once per interval.
struct RateMeter {
    started: Instant,
    frames: u64,
    interval: Duration,
}

impl RateMeter {
    fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            interval,
        }
    }

    fn record(&mut self) {
        self.frames += 1;
        let elapsed = self.started.elapsed();
        if elapsed > self.interval {
            info!(
                "RX sample stream rate is:{:.2}Hz",
                self.frames as f64 / elapsed.as_secs_f64()
            );
            self.frames = 0;
            self.started = Instant::now();
        }
    }
}

fn run_sample_stream(ctx: Arc<StreamContext>, mut stream: Box<dyn Subscription<Frame>>) {
    let mut meter = RateMeter::new(ctx.rate_log_interval);
    loop {
        match stream.next_item() {
            Ok(frame) => {
                meter.record();
                ctx.ingest(frame);
            }
            Err(err) => return ctx.listener_failed(Listener::SampleStream, err),
        }
    }
}

fn run_state_events(
    ctx: Arc<StreamContext>,
    instrument: Arc<dyn Instrument>,
    mut events: Box<dyn Subscription<()>>,
) {
    loop {
        // Tokens carry no payload; the state itself is fetched after each.
        let next = events.next_item().and_then(|()| instrument.state());
        match next {
            Ok(state) => ctx.publish_state(state),
            Err(err) => return ctx.listener_failed(Listener::StateEvents, err),
        }
    }
}

fn run_led_state(ctx: Arc<StreamContext>, mut leds: Box<dyn Subscription<LedState>>) {
    loop {
        match leds.next_item() {
            Ok(led) => ctx.publish_led(led),
            Err(err) => return ctx.listener_failed(Listener::LedState, err),
        }
    }
}

struct Link {
    instrument: Arc<dyn Instrument>,
    cancel: CancelToken,
    workers: Vec<JoinHandle<()>>,
    host: String,
}

struct Subscriptions {
    state_events: Box<dyn Subscription<()>>,
    samples: Box<dyn Subscription<Frame>>,
    leds: Box<dyn Subscription<LedState>>,
}

fn subscribe(
    instrument: &Arc<dyn Instrument>,
    cancel: &CancelToken,
) -> Result<Subscriptions, ConsoleError> {
    Ok(Subscriptions {
        state_events: instrument.listen_state_events(cancel)?,
        samples: instrument.listen_sample_stream(cancel)?,
        leds: instrument.listen_led_state(LedSelectors::red_only(), cancel)?,
    })
}

fn spawn_worker(
    listener: Listener,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, ConsoleError> {
    Ok(thread::Builder::new()
        .name(listener.thread_name().to_owned())
        .spawn(body)?)
}

fn join_workers(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        let name = handle.thread().name().unwrap_or("worker").to_owned();
        if handle.join().is_err() {
            warn!("{name} panicked");
        }
    }
}

/// What one call to [`Console::dispatch`] did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchReport {
    /// Frames drained from the handoff queue; only the last stays on display.
    pub frames_displayed: usize,
    pub refresh_rate_hz: Option<f64>,
    pub state_changed: bool,
    pub title: Option<String>,
    /// The link failed and was torn down during this call.
    pub disconnected: bool,
    pub stream_error: Option<String>,
}

enum Wake {
    Event(ConsoleEvent),
    Tick,
    Idle,
}

/// Connection lifecycle plus the consumer side of the stream.
///
/// Three named worker threads run per live connection, one per listen
/// operation. They only touch the connection-scoped [`StreamContext`]; every
/// presentation change happens in [`Console::dispatch`] on the caller's thread.
pub struct Console {
    config: ConsoleConfig,
    state: ConnectionState,
    averaging: usize,
    ctx: Arc<StreamContext>,
    events_tx: Sender<ConsoleEvent>,
    events: Receiver<ConsoleEvent>,
    ticker: Receiver<Instant>,
    link: Option<Link>,
    display: DisplayPipeline,
    instrument_state: Option<InstrumentState>,
    led_state: Option<LedState>,
    refresh_rate_hz: Option<f64>,
    #[cfg(test)]
    transitions: Vec<ConnectionState>,
}

impl Console {
    pub fn new(config: ConsoleConfig) -> Result<Self, ConsoleError> {
        config.validate()?;
        let (events_tx, events) = channel::bounded(EVENT_CHANNEL_CAPACITY);
        let ctx = StreamContext::new(&config, config.averaging, events_tx.clone())?;
        Ok(Self {
            state: ConnectionState::Disconnected,
            averaging: config.averaging,
            ctx: Arc::new(ctx),
            events_tx,
            events,
            ticker: channel::tick(config.refresh_tick()),
            link: None,
            display: DisplayPipeline::new(config.display_mode),
            instrument_state: None,
            led_state: None,
            refresh_rate_hz: None,
            config,
            #[cfg(test)]
            transitions: Vec::new(),
        })
    }

    pub fn connect(&mut self, instrument: Arc<dyn Instrument>) -> Result<(), ConsoleError> {
        if self.link.is_some() {
            self.disconnect();
        }
        let host = instrument.host();
        self.ctx = Arc::new(StreamContext::new(
            &self.config,
            self.averaging,
            self.events_tx.clone(),
        )?);
        self.display.reset();
        self.instrument_state = None;
        self.led_state = None;
        self.refresh_rate_hz = None;
        self.transition(ConnectionState::Connecting);

        match self.open_link(instrument, &host) {
            Ok((link, version)) => {
                self.link = Some(link);
                self.transition(ConnectionState::Connected);
                info!("Connected to {host}, device software version is {version}");
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                error!("Failed connecting to device at {host}: {err}");
                Err(err)
            }
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("connection {:?} -> {state:?}", self.state);
        }
        self.state = state;
        #[cfg(test)]
        self.transitions.push(state);
    }

    fn open_link(
        &mut self,
        instrument: Arc<dyn Instrument>,
        host: &str,
    ) -> Result<(Link, String), ConsoleError> {
        instrument
            .is_ready(self.config.ready_timeout())
            .map_err(ConsoleError::into_connectivity)?;
        let version = instrument
            .version_id()
            .map_err(ConsoleError::into_connectivity)?;
        check_version(&version)?;
        let state = instrument
            .state()
            .map_err(ConsoleError::into_connectivity)?;

        let cancel = CancelToken::new();
        let subscriptions = match subscribe(&instrument, &cancel) {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                cancel.cancel();
                return Err(err.into_connectivity());
            }
        };

        self.ctx.running.store(true, Ordering::SeqCst);
        let mut workers = Vec::with_capacity(3);
        if let Err(err) = self.spawn_workers(&instrument, subscriptions, &mut workers) {
            self.ctx.running.store(false, Ordering::SeqCst);
            cancel.cancel();
            join_workers(workers);
            return Err(err);
        }

        self.instrument_state = Some(state);
        let link = Link {
            instrument,
            cancel,
            workers,
            host: host.to_owned(),
        };
        Ok((link, version))
    }

    fn spawn_workers(
        &self,
        instrument: &Arc<dyn Instrument>,
        subscriptions: Subscriptions,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), ConsoleError> {
        let Subscriptions {
            state_events,
            samples,
            leds,
        } = subscriptions;

        let ctx = self.ctx.clone();
        let source = instrument.clone();
        workers.push(spawn_worker(Listener::StateEvents, move || {
            run_state_events(ctx, source, state_events)
        })?);

        let ctx = self.ctx.clone();
        workers.push(spawn_worker(Listener::SampleStream, move || {
            run_sample_stream(ctx, samples)
        })?);

        let ctx = self.ctx.clone();
        workers.push(spawn_worker(Listener::LedState, move || {
            run_led_state(ctx, leds)
        })?);
        Ok(())
    }

    /// Cancels all listeners, joins their threads and leaves the console
    /// ready for a fresh connection. The displayed frame is kept.
    pub fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            self.transition(ConnectionState::Disconnected);
            return;
        };
        self.ctx.running.store(false, Ordering::SeqCst);
        link.cancel.cancel();
        join_workers(link.workers);

        self.ctx.queue.clear();
        self.ctx.accumulator.lock().reset();
        self.ctx.paused.store(false, Ordering::SeqCst);
        self.ctx.link_lost.store(false, Ordering::SeqCst);
        self.ctx.frame_pending.store(false, Ordering::SeqCst);
        self.ctx.forget_latest();
        self.display.reset_change_detection();
        self.instrument_state = None;
        self.led_state = None;
        self.refresh_rate_hz = None;
        while self.events.try_recv().is_ok() {}

        self.transition(ConnectionState::Disconnected);
        info!("Disconnected from {}", link.host);
    }

    fn require_link(&self) -> Result<&Link, ConsoleError> {
        self.link.as_ref().ok_or(ConsoleError::NotConnected)
    }

    fn require_unpaused(&self) -> Result<&Link, ConsoleError> {
        let link = self.require_link()?;
        if self.ctx.is_paused() {
            return Err(ConsoleError::Config(
                "display is paused, resume before changing the instrument".into(),
            ));
        }
        Ok(link)
    }

    /// Stops aggregation; the listeners keep draining the instrument.
    pub fn pause(&mut self) -> Result<(), ConsoleError> {
        self.require_link()?;
        self.ctx.paused.store(true, Ordering::SeqCst);
        self.ctx.queue.clear();
        info!("Display paused");
        Ok(())
    }

    /// Drops stale frames and partial sums, then re-reads the instrument state
    /// that was not published while paused.
    pub fn resume(&mut self) -> Result<(), ConsoleError> {
        let instrument = self.require_link()?.instrument.clone();
        {
            let mut accumulator = self.ctx.accumulator.lock();
            self.ctx.queue.clear();
            accumulator.reset();
            self.ctx.paused.store(false, Ordering::SeqCst);
        }
        let state = instrument.state()?;
        // Through the slot, so pre-pause events still queued cannot override it.
        *self.ctx.latest_state.lock() = Some(state.clone());
        self.instrument_state = Some(state);
        info!("Display resumed");
        Ok(())
    }

    /// Changing the factor discards the partial sum.
    pub fn set_averaging(&mut self, factor: usize) -> Result<(), ConsoleError> {
        self.ctx.accumulator.lock().set_factor(factor)?;
        self.averaging = factor;
        info!("Averaging factor set to {factor}");
        Ok(())
    }

    pub fn clear_display(&mut self) {
        {
            let mut accumulator = self.ctx.accumulator.lock();
            self.ctx.queue.clear();
            accumulator.reset();
        }
        self.display.clear();
    }

    pub fn configure_preset(&mut self, alias: &str) -> Result<TdrPreset, ConsoleError> {
        let preset = TdrPreset::resolve(alias)?;
        let link = self.require_unpaused()?;
        info!("Configuring TDR preset: {preset}");
        link.instrument.configure_tdr_preset(preset)?;
        Ok(preset)
    }

    /// Enables acquisition if the last known state allows it. Returns whether
    /// an enable request was sent.
    pub fn start_acquisition(&mut self) -> Result<bool, ConsoleError> {
        let link = self.require_unpaused()?;
        match &self.instrument_state {
            Some(state) if state.has_configuration() && !state.acquiring => {
                info!("Enabling TDR");
                link.instrument.enable_tdr(true)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stops a running acquisition or starts a configured one. `None` when
    /// the last known state allows neither.
    pub fn toggle_acquisition(&mut self) -> Result<Option<bool>, ConsoleError> {
        let link = self.require_unpaused()?;
        let Some(state) = &self.instrument_state else {
            return Ok(None);
        };
        let enable = if state.acquiring {
            false
        } else if state.has_configuration() {
            true
        } else {
            return Ok(None);
        };
        info!("{} TDR", if enable { "Enabling" } else { "Disabling" });
        link.instrument.enable_tdr(enable)?;
        Ok(Some(enable))
    }

    /// Flips the red identify LED based on the last reported LED state.
    pub fn toggle_identify_led(&mut self) -> Result<bool, ConsoleError> {
        let link = self.require_link()?;
        let on = !matches!(self.led_state, Some(led) if led.is_lit());
        link.instrument.set_led(LedId::Red, on)?;
        Ok(on)
    }

    pub fn set_display_mode(&mut self, mode: DisplayMode) -> DisplayUpdate {
        let update = self.display.set_mode(mode);
        if let Some(title) = &update.title {
            info!("{title}");
        }
        update
    }

    pub fn import_csv(&mut self, path: impl AsRef<Path>) -> Result<DisplayUpdate, ConsoleError> {
        if self.link.is_some() {
            return Err(ConsoleError::Config(
                "disconnect before importing a waveform".into(),
            ));
        }
        let path = path.as_ref();
        let frame = recorder::load_csv(path)?;
        info!("Imported {} samples from {}", frame.len(), path.display());
        Ok(self.display.load(frame))
    }

    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<(), ConsoleError> {
        let path = path.as_ref();
        let frame = self
            .display
            .frame()
            .ok_or_else(|| ConsoleError::Config("no waveform on display to save".into()))?;
        recorder::save_csv(path, frame)?;
        info!("Saved waveform to {}", path.display());
        Ok(())
    }

    /// One consumer wake: waits up to `wait` for an event or the refresh tick,
    /// handles pending events, tears the link down if a listener failed, and
    /// drains the handoff queue.
    pub fn dispatch(&mut self, wait: Duration) -> DispatchReport {
        let wake = select! {
            recv(self.events) -> event => match event {
                Ok(event) => Wake::Event(event),
                Err(_) => Wake::Idle,
            },
            recv(self.ticker) -> _ => Wake::Tick,
            default(wait) => Wake::Idle,
        };

        let mut report = DispatchReport::default();
        match wake {
            Wake::Event(event) => self.handle_event(event, &mut report),
            Wake::Tick => self.tick(&mut report),
            Wake::Idle => {}
        }
        self.drain_events(&mut report);

        if self.link.is_some() && self.ctx.link_lost.swap(false, Ordering::SeqCst) {
            self.drain_events(&mut report);
            self.transition(ConnectionState::Errored);
            self.disconnect();
            report.disconnected = true;
            return report;
        }

        self.ctx.frame_pending.store(false, Ordering::SeqCst);
        if !self.ctx.is_paused() {
            let display = &mut self.display;
            let mut title = None;
            report.frames_displayed = self.ctx.queue.drain_with(|frame| {
                if let Some(new_title) = display.apply(frame).title {
                    title = Some(new_title);
                }
            });
            if let Some(title) = &title {
                info!("{title}");
            }
            report.title = title;
        }
        report
    }

    fn drain_events(&mut self, report: &mut DispatchReport) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event, report);
        }
        // The slots win over whatever the channel delivered or dropped.
        if let Some(state) = self.ctx.latest_state.lock().take() {
            self.instrument_state = Some(state);
            report.state_changed = true;
        }
        if let Some(led) = self.ctx.latest_led.lock().take() {
            self.led_state = Some(led);
        }
    }

    fn handle_event(&mut self, event: ConsoleEvent, report: &mut DispatchReport) {
        match event {
            ConsoleEvent::FrameReady => {}
            ConsoleEvent::StateChanged(state) => {
                if let Some(label) = state.preset_label() {
                    debug!("instrument preset: {label}");
                }
                self.instrument_state = Some(state);
                report.state_changed = true;
            }
            ConsoleEvent::LedChanged(led) => self.led_state = Some(led),
            ConsoleEvent::StreamFailed { listener, detail } => {
                if report.stream_error.is_none() {
                    report.stream_error =
                        Some(ConsoleError::Stream { listener, detail }.to_string());
                }
            }
        }
    }

    fn tick(&mut self, report: &mut DispatchReport) {
        let active = self.link.is_some()
            && self
                .instrument_state
                .as_ref()
                .map_or(false, |state| state.acquiring);
        if let Some(rate) = self.display.tick_refresh_rate(active) {
            self.refresh_rate_hz = Some(rate);
            report.refresh_rate_hz = Some(rate);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    pub fn averaging(&self) -> usize {
        self.averaging
    }

    pub fn display(&self) -> &DisplayPipeline {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut DisplayPipeline {
        &mut self.display
    }

    pub fn instrument_state(&self) -> Option<&InstrumentState> {
        self.instrument_state.as_ref()
    }

    pub fn led_state(&self) -> Option<LedState> {
        self.led_state
    }

    pub fn refresh_rate_hz(&self) -> Option<f64> {
        self.refresh_rate_hz
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        self.ctx.queue.metrics()
    }

    /// Frames taken off the sample stream this connection, paused or not.
    pub fn frames_received(&self) -> u64 {
        self.ctx.frames_received.load(Ordering::SeqCst)
    }

    pub fn preset_label(&self) -> Option<String> {
        self.instrument_state
            .as_ref()
            .and_then(InstrumentState::preset_label)
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{CursorAxis, SimulatedInstrument};

    const WAIT: Duration = Duration::from_secs(3);

    fn frame(samples: Vec<f64>) -> Frame {
        Frame {
            samples,
            sample_spacing_ps: 1.0,
            pulse_period_ns: 16.0,
            ref_50ohm: 0.5,
            ref_unit_amp: 0.25,
        }
    }

    fn ramp(offset: f64) -> Frame {
        frame((0..8).map(|i| offset + i as f64).collect())
    }

    fn connected(sim: &SimulatedInstrument, averaging: usize) -> Console {
        let config = ConsoleConfig {
            averaging,
            ..ConsoleConfig::default()
        };
        let mut console = Console::new(config).unwrap();
        console.connect(Arc::new(sim.clone())).unwrap();
        console
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn dispatch_until(console: &mut Console, cond: impl Fn(&Console) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            console.dispatch(Duration::from_millis(10));
            if cond(console) {
                return true;
            }
        }
        false
    }

    #[test]
    fn version_rule() {
        assert!(check_version("0.4.1").is_ok());
        assert!(check_version("1.0.0.dev").is_ok());
        assert!(check_version("2.1.0").is_err());
        assert!(check_version("1.0.0.rc1").is_err());
        assert!(check_version("").is_err());
    }

    #[test]
    fn four_frames_average_into_one() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 4);
        for offset in [0.0, 1.0, 2.0, 5.0] {
            sim.push_frame(ramp(offset));
        }
        assert!(wait_for(|| console.frames_received() == 4));
        assert_eq!(console.queue_metrics().total_pushed, 1);

        let report = console.dispatch(Duration::ZERO);
        assert_eq!(report.frames_displayed, 1);
        assert!(report.title.is_some());
        let shown = console.display().frame().unwrap();
        for (i, value) in shown.samples.iter().enumerate() {
            assert!((value - (2.0 + i as f64)).abs() < 1e-12);
        }
    }

    #[test]
    fn averaging_change_discards_partial_sum() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 4);
        sim.push_frame(ramp(100.0));
        assert!(wait_for(|| console.frames_received() == 1));

        console.set_averaging(2).unwrap();
        sim.push_frame(ramp(0.0));
        sim.push_frame(ramp(2.0));
        assert!(wait_for(|| console.frames_received() == 3));
        assert_eq!(console.queue_metrics().total_pushed, 1);

        console.dispatch(Duration::ZERO);
        let shown = console.display().frame().unwrap();
        assert!((shown.samples[0] - 1.0).abs() < 1e-12);
        assert!(console.set_averaging(3).is_err());
        assert_eq!(console.averaging(), 2);
    }

    #[test]
    fn version_mismatch_stops_after_version_check() {
        let sim = SimulatedInstrument::scripted("1.2.3");
        let mut console = Console::new(ConsoleConfig::default()).unwrap();
        let result = console.connect(Arc::new(sim.clone()));
        assert!(matches!(result, Err(ConsoleError::VersionMismatch { .. })));
        assert_eq!(sim.rpc_log(), vec!["is_ready", "version_id"]);
        assert_eq!(console.connection_state(), ConnectionState::Disconnected);

        sim.set_version("1.0.0.dev");
        console.connect(Arc::new(sim.clone())).unwrap();
        assert_eq!(console.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn unreachable_instrument_is_connectivity_error() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        sim.set_reachable(false);
        let mut console = Console::new(ConsoleConfig::default()).unwrap();
        let result = console.connect(Arc::new(sim.clone()));
        assert!(matches!(result, Err(ConsoleError::Connectivity(_))));
        assert!(!console.is_connected());
    }

    #[test]
    fn stream_failure_disconnects() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        sim.inject_fault();

        let deadline = Instant::now() + WAIT;
        let mut report = DispatchReport::default();
        while Instant::now() < deadline && !report.disconnected {
            report = console.dispatch(Duration::from_millis(10));
        }
        assert!(report.disconnected);
        assert!(report.stream_error.is_some());
        assert_eq!(console.connection_state(), ConnectionState::Disconnected);

        sim.heal();
        console.connect(Arc::new(sim.clone())).unwrap();
        assert!(console.is_connected());
    }

    #[test]
    fn planned_disconnect_clears_queue_and_keeps_frame() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        sim.push_frame(ramp(0.0));
        assert!(wait_for(|| console.frames_received() == 1));
        console.dispatch(Duration::ZERO);
        sim.push_frame(ramp(1.0));
        assert!(wait_for(|| console.frames_received() == 2));

        console.disconnect();
        assert_eq!(console.connection_state(), ConnectionState::Disconnected);
        assert_eq!(console.queue_metrics().current_size, 0);
        assert!(console.instrument_state().is_none());
        assert_eq!(console.display().frame().unwrap().samples[0], 0.0);
        assert!(matches!(console.pause(), Err(ConsoleError::NotConnected)));
    }

    #[test]
    fn planned_disconnect_is_not_a_stream_failure() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        let ctx = console.ctx.clone();
        console.disconnect();
        assert!(!ctx.link_lost.load(Ordering::SeqCst));
        assert!(console.events.is_empty());

        let report = console.dispatch(Duration::from_millis(20));
        assert!(report.stream_error.is_none());
        assert!(!report.disconnected);
        assert!(!console.transitions.contains(&ConnectionState::Errored));
    }

    #[test]
    fn listener_errors_after_cancel_are_not_reported() {
        let (tx, rx) = channel::bounded(4);
        let ctx = StreamContext::new(&ConsoleConfig::default(), 1, tx).unwrap();
        ctx.listener_failed(Listener::SampleStream, ConsoleError::Cancelled);
        assert!(rx.is_empty());
        assert!(!ctx.link_lost.load(Ordering::SeqCst));

        ctx.running.store(true, Ordering::SeqCst);
        ctx.listener_failed(Listener::LedState, ConsoleError::Closed);
        assert!(matches!(
            rx.try_recv(),
            Ok(ConsoleEvent::StreamFailed {
                listener: Listener::LedState,
                ..
            })
        ));
        assert!(ctx.link_lost.load(Ordering::SeqCst));
    }

    #[test]
    fn link_failure_passes_through_errored() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        assert_eq!(
            console.transitions,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        sim.inject_fault();
        assert!(dispatch_until(&mut console, |c| !c.is_connected()));
        assert!(console
            .transitions
            .ends_with(&[ConnectionState::Errored, ConnectionState::Disconnected]));
    }

    #[test]
    fn pause_discards_already_queued_frames() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        for offset in [0.0, 1.0, 2.0] {
            sim.push_frame(ramp(offset));
        }
        assert!(wait_for(|| console.frames_received() == 3));
        assert_eq!(console.queue_metrics().current_size, 3);

        console.pause().unwrap();
        assert_eq!(console.queue_metrics().current_size, 0);
        assert_eq!(console.dispatch(Duration::ZERO).frames_displayed, 0);
        assert!(console.display().frame().is_none());
    }

    #[test]
    fn clear_display_discards_partial_sum() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 2);
        sim.push_frame(frame(vec![50.0; 8]));
        sim.push_frame(frame(vec![50.0; 8]));
        assert!(wait_for(|| console.frames_received() == 2));
        console.dispatch(Duration::ZERO);
        assert!(console.display().frame().is_some());

        sim.push_frame(frame(vec![100.0; 8]));
        assert!(wait_for(|| console.frames_received() == 3));
        console.clear_display();
        assert!(console.display().frame().is_none());

        sim.push_frame(frame(vec![1.0; 8]));
        sim.push_frame(frame(vec![3.0; 8]));
        assert!(wait_for(|| console.frames_received() == 5));
        assert_eq!(console.dispatch(Duration::ZERO).frames_displayed, 1);
        assert_eq!(console.display().frame().unwrap().samples[0], 2.0);
    }

    #[test]
    fn stalled_acquisition_reaches_the_console() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        sim.set_state(InstrumentState {
            acquiring: true,
            acquisition_stalled: true,
            ..InstrumentState::default()
        });
        assert!(dispatch_until(&mut console, |c| c
            .instrument_state()
            .map_or(false, |s| s.acquisition_stalled)));
    }

    #[test]
    fn frame_notifications_are_coalesced() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        for i in 0..100 {
            sim.push_frame(ramp(i as f64));
        }
        assert!(wait_for(|| console.frames_received() == 100));
        assert_eq!(console.events.len(), 1);
        assert_eq!(console.dispatch(Duration::ZERO).frames_displayed, 10);

        sim.push_frame(ramp(0.0));
        assert!(wait_for(|| console.frames_received() == 101));
        assert_eq!(console.events.len(), 1);
    }

    #[test]
    fn latest_state_survives_a_full_event_channel() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        for period in 1..=100 {
            sim.set_state(InstrumentState {
                pulse_period_ns: Some(period as f64),
                ..InstrumentState::default()
            });
        }
        // One read during connect, then one per state token.
        let reads = || sim.rpc_log().iter().filter(|rpc| **rpc == "state").count();
        assert!(wait_for(|| reads() == 101));
        assert_eq!(console.events.len(), EVENT_CHANNEL_CAPACITY);

        let report = console.dispatch(Duration::ZERO);
        assert!(report.state_changed);
        let state = console.instrument_state().unwrap();
        assert_eq!(state.pulse_period_ns, Some(100.0));
    }

    #[test]
    fn refresh_rate_follows_acquisition() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let config = ConsoleConfig {
            refresh_tick_ms: 20,
            ..ConsoleConfig::default()
        };
        let mut console = Console::new(config).unwrap();
        console.connect(Arc::new(sim.clone())).unwrap();
        sim.set_state(InstrumentState {
            acquiring: true,
            pulse_period_ns: Some(16.0),
            sample_spacing_ps: Some(1.0),
            ..InstrumentState::default()
        });

        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline
            && !console.refresh_rate_hz().map_or(false, |rate| rate > 0.0)
        {
            sim.push_frame(ramp(0.0));
            console.dispatch(Duration::from_millis(5));
        }
        assert!(console.refresh_rate_hz().unwrap() > 0.0);

        console.disconnect();
        assert!(dispatch_until(&mut console, |c| c.refresh_rate_hz() == Some(0.0)));
    }

    #[test]
    fn mode_change_after_disconnect_keeps_cursor_level() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        sim.push_frame(frame(vec![0.55; 8]));
        assert!(wait_for(|| console.frames_received() == 1));
        console.dispatch(Duration::ZERO);
        console
            .display_mut()
            .set_cursor_visible(CursorAxis::Horizontal, 0, true);
        assert_eq!(console.display().cursors().horizontal[0].position, 0.55);

        console.disconnect();
        let update = console.set_display_mode(DisplayMode::Impedance);
        assert!(update.cursors_rescaled);
        let level = console.display().cursors().horizontal[0].position;
        assert!((level - 75.0).abs() < 1e-9);
        assert!((console.display().y()[0] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn paused_frames_are_consumed_not_aggregated() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        console.pause().unwrap();
        sim.push_frame(ramp(0.0));
        assert!(wait_for(|| console.frames_received() == 1));
        assert_eq!(console.queue_metrics().total_pushed, 0);
        assert_eq!(console.dispatch(Duration::ZERO).frames_displayed, 0);
        assert!(console.configure_preset("16/1").is_err());

        console.resume().unwrap();
        assert!(!console.is_paused());
        sim.push_frame(ramp(3.0));
        assert!(wait_for(|| console.frames_received() == 2));
        assert_eq!(console.dispatch(Duration::ZERO).frames_displayed, 1);
        assert_eq!(console.display().frame().unwrap().samples[0], 3.0);
    }

    #[test]
    fn configure_then_toggle_acquisition() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        assert_eq!(console.toggle_acquisition().unwrap(), None);
        assert!(matches!(
            console.configure_preset("xyz"),
            Err(ConsoleError::Config(_))
        ));

        console.configure_preset("16ns/1ps").unwrap();
        assert!(dispatch_until(&mut console, |c| c
            .instrument_state()
            .map_or(false, InstrumentState::has_configuration)));
        assert_eq!(console.preset_label().as_deref(), Some("16.0ns/1.0ps"));

        assert!(console.start_acquisition().unwrap());
        assert!(dispatch_until(&mut console, |c| c
            .instrument_state()
            .map_or(false, |s| s.acquiring)));
        assert_eq!(console.toggle_acquisition().unwrap(), Some(false));
        let configures = sim
            .rpc_log()
            .iter()
            .filter(|rpc| **rpc == "configure_tdr_preset")
            .count();
        assert_eq!(configures, 1);
    }

    #[test]
    fn identify_led_follows_reported_state() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let mut console = connected(&sim, 1);
        assert!(console.toggle_identify_led().unwrap());
        assert!(dispatch_until(&mut console, |c| c
            .led_state()
            .map_or(false, |led| led.is_lit())));
        assert!(!console.toggle_identify_led().unwrap());
    }

    #[test]
    fn csv_import_only_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        recorder::save_csv(&path, &ramp(0.0)).unwrap();

        let mut console = Console::new(ConsoleConfig::default()).unwrap();
        assert!(console.export_csv(dir.path().join("empty.csv")).is_err());
        let update = console.import_csv(&path).unwrap();
        assert!(update.title.is_some());
        assert_eq!(console.display().frame().unwrap().len(), 8);
        console.export_csv(dir.path().join("copy.csv")).unwrap();

        let sim = SimulatedInstrument::scripted("0.1.0");
        console.connect(Arc::new(sim)).unwrap();
        assert!(matches!(
            console.import_csv(&path),
            Err(ConsoleError::Config(_))
        ));
    }
}
