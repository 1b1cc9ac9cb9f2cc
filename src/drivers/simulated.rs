use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;

use crate::drivers::preset::TdrPreset;
use crate::drivers::source::{CancelToken, Instrument, Subscription};
use crate::drivers::ConsoleError;
use crate::types::{
    Frame, InstrumentState, LedId, LedSelectors, LedState, TdrConfiguration, TdrWorkingState,
};

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
const MAX_SYNTHETIC_SAMPLES: usize = 16_000;
const SYNTHETIC_REF_50OHM: f64 = 0.5;
const SYNTHETIC_REF_UNIT_AMP: f64 = 0.25;

struct Shared {
    host: String,
    version: Mutex<String>,
    reachable: AtomicBool,
    synthesize: bool,
    state: Mutex<InstrumentState>,
    frames: (Sender<Frame>, Receiver<Frame>),
    tokens: (Sender<()>, Receiver<()>),
    leds: (Sender<LedState>, Receiver<LedState>),
    fault: Mutex<CancelToken>,
    rpc_log: Mutex<Vec<&'static str>>,
}

/// In-process instrument.
///
/// The scripted variant only emits what the caller pushes and backs the
/// tests; `demo` starts configured and acquiring, and synthesizes a TDR step
/// response whenever acquisition is enabled.
#[derive(Clone)]
pub struct SimulatedInstrument {
    shared: Arc<Shared>,
}

impl SimulatedInstrument {
    pub fn demo() -> Self {
        let preset = TdrPreset::all().last();
        let state = InstrumentState {
            pulse_period_ns: preset.map(|p| p.pulse_period_ns()),
            sample_spacing_ps: preset.map(|p| p.sample_spacing_ps()),
            configuration_preset: preset,
            acquiring: true,
            acquisition_stalled: false,
        };
        Self::build("0.4.0", true, state)
    }

    fn build(version: &str, synthesize: bool, state: InstrumentState) -> Self {
        Self {
            shared: Arc::new(Shared {
                host: "simulator".to_owned(),
                version: Mutex::new(version.to_owned()),
                reachable: AtomicBool::new(true),
                synthesize,
                state: Mutex::new(state),
                frames: channel::unbounded(),
                tokens: channel::unbounded(),
                leds: channel::unbounded(),
                fault: Mutex::new(CancelToken::new()),
                rpc_log: Mutex::new(Vec::new()),
            }),
        }
    }

    fn record(&self, rpc: &'static str) {
        self.shared.rpc_log.lock().push(rpc);
    }

    fn fault_signal(&self) -> Receiver<()> {
        self.shared.fault.lock().signal()
    }
}

// 测试用的脚本化接口
#[cfg(test)]
impl SimulatedInstrument {
    pub fn scripted(version: &str) -> Self {
        Self::build(version, false, InstrumentState::default())
    }

    pub fn push_frame(&self, frame: Frame) {
        self.shared.frames.0.send(frame).ok();
    }

    /// Replaces the reported state and emits a change token.
    pub fn set_state(&self, state: InstrumentState) {
        *self.shared.state.lock() = state;
        self.shared.tokens.0.send(()).ok();
    }

    pub fn set_version(&self, version: &str) {
        *self.shared.version.lock() = version.to_owned();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes every open listener fail as if the link dropped.
    pub fn inject_fault(&self) {
        self.shared.fault.lock().cancel();
    }

    pub fn heal(&self) {
        *self.shared.fault.lock() = CancelToken::new();
    }

    /// Names of the unary RPCs served so far, in call order.
    pub fn rpc_log(&self) -> Vec<&'static str> {
        self.shared.rpc_log.lock().clone()
    }

    pub fn pending_frames(&self) -> usize {
        self.shared.frames.1.len()
    }
}

impl Shared {
    /// One noisy step response for the current configuration, or nothing when idle.
    fn synthesize_frame(&self) -> Option<Frame> {
        let state = self.state.lock().clone();
        if !state.acquiring {
            return None;
        }
        let (period_ns, spacing_ps) = (state.pulse_period_ns?, state.sample_spacing_ps?);
        let count = ((period_ns * 1000.0 / spacing_ps) as usize).min(MAX_SYNTHETIC_SAMPLES);
        let mut rng = rand::thread_rng();
        let samples = (0..count)
            .map(|i| {
                let position = i as f64 / count as f64;
                // 50 ohm launch, 75 ohm section, then an open end.
                let rho = if position < 0.2 {
                    0.0
                } else if position < 0.5 {
                    0.2
                } else {
                    0.98
                };
                SYNTHETIC_REF_50OHM + rho * SYNTHETIC_REF_UNIT_AMP + rng.gen_range(-0.002..0.002)
            })
            .collect();
        Some(Frame {
            samples,
            sample_spacing_ps: spacing_ps,
            pulse_period_ns: period_ns,
            ref_50ohm: SYNTHETIC_REF_50OHM,
            ref_unit_amp: SYNTHETIC_REF_UNIT_AMP,
        })
    }
}

impl Instrument for SimulatedInstrument {
    fn host(&self) -> String {
        self.shared.host.clone()
    }

    fn is_ready(&self, _timeout: Duration) -> Result<(), ConsoleError> {
        self.record("is_ready");
        if self.shared.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConsoleError::Transport("deadline exceeded".into()))
        }
    }

    fn version_id(&self) -> Result<String, ConsoleError> {
        self.record("version_id");
        Ok(self.shared.version.lock().clone())
    }

    fn state(&self) -> Result<InstrumentState, ConsoleError> {
        self.record("state");
        Ok(self.shared.state.lock().clone())
    }

    fn tdr_configuration(&self) -> Result<TdrConfiguration, ConsoleError> {
        self.record("tdr_configuration");
        let state = self.shared.state.lock();
        match (state.pulse_period_ns, state.sample_spacing_ps) {
            (Some(pulse_period_ns), Some(sample_spacing_ps)) => Ok(TdrConfiguration {
                pulse_period_ns,
                sample_spacing_ps,
            }),
            _ => Err(ConsoleError::Transport("TDR is not configured".into())),
        }
    }

    fn tdr_working_state(&self) -> Result<TdrWorkingState, ConsoleError> {
        self.record("tdr_working_state");
        let state = self.shared.state.lock();
        Ok(TdrWorkingState {
            acquisition_enabled: state.acquiring,
            acquiring: state.acquiring,
            acquisition_stalled: Some(state.acquisition_stalled),
        })
    }

    fn configure_tdr_preset(&self, preset: TdrPreset) -> Result<(), ConsoleError> {
        self.record("configure_tdr_preset");
        {
            let mut state = self.shared.state.lock();
            state.pulse_period_ns = Some(preset.pulse_period_ns());
            state.sample_spacing_ps = Some(preset.sample_spacing_ps());
            state.configuration_preset = Some(preset);
        }
        debug!("simulator configured to {preset}");
        self.shared.tokens.0.send(()).ok();
        Ok(())
    }

    fn enable_tdr(&self, enable: bool) -> Result<(), ConsoleError> {
        self.record("enable_tdr");
        {
            let mut state = self.shared.state.lock();
            if enable && !state.has_configuration() {
                return Err(ConsoleError::Transport("TDR is not configured".into()));
            }
            state.acquiring = enable;
        }
        if self.shared.synthesize {
            info!("simulator acquisition {}", if enable { "started" } else { "stopped" });
        }
        self.shared.tokens.0.send(()).ok();
        Ok(())
    }

    fn set_led(&self, led: LedId, on: bool) -> Result<(), ConsoleError> {
        self.record("set_led");
        let update = LedState {
            led_id: led,
            brightness: if on { LedState::FULL_BRIGHTNESS } else { 0 },
        };
        self.shared.leds.0.send(update).ok();
        Ok(())
    }

    fn listen_state_events(
        &self,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<()>>, ConsoleError> {
        Ok(Box::new(ChannelSubscription {
            items: self.shared.tokens.1.clone(),
            cancel: cancel.signal(),
            fault: self.fault_signal(),
            accept: |_: &()| true,
        }))
    }

    fn listen_sample_stream(
        &self,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<Frame>>, ConsoleError> {
        if self.shared.synthesize {
            return Ok(Box::new(SyntheticSamples {
                shared: self.shared.clone(),
                items: self.shared.frames.1.clone(),
                cancel: cancel.signal(),
                fault: self.fault_signal(),
            }));
        }
        Ok(Box::new(ChannelSubscription {
            items: self.shared.frames.1.clone(),
            cancel: cancel.signal(),
            fault: self.fault_signal(),
            accept: |_: &Frame| true,
        }))
    }

    fn listen_led_state(
        &self,
        selectors: LedSelectors,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<LedState>>, ConsoleError> {
        Ok(Box::new(ChannelSubscription {
            items: self.shared.leds.1.clone(),
            cancel: cancel.signal(),
            fault: self.fault_signal(),
            accept: move |led: &LedState| selectors.selects(led.led_id),
        }))
    }
}

struct ChannelSubscription<T, F> {
    items: Receiver<T>,
    cancel: Receiver<()>,
    fault: Receiver<()>,
    accept: F,
}

impl<T, F> Subscription<T> for ChannelSubscription<T, F>
where
    T: Send,
    F: Fn(&T) -> bool + Send,
{
    fn next_item(&mut self) -> Result<T, ConsoleError> {
        loop {
            select! {
                recv(self.cancel) -> _ => return Err(ConsoleError::Cancelled),
                recv(self.fault) -> _ => return Err(link_failure()),
                recv(self.items) -> item => match item {
                    Ok(item) if (self.accept)(&item) => return Ok(item),
                    Ok(_) => continue,
                    Err(_) => return Err(ConsoleError::Closed),
                },
            }
        }
    }
}

struct SyntheticSamples {
    shared: Arc<Shared>,
    items: Receiver<Frame>,
    cancel: Receiver<()>,
    fault: Receiver<()>,
}

impl Subscription<Frame> for SyntheticSamples {
    fn next_item(&mut self) -> Result<Frame, ConsoleError> {
        loop {
            select! {
                recv(self.cancel) -> _ => return Err(ConsoleError::Cancelled),
                recv(self.fault) -> _ => return Err(link_failure()),
                recv(self.items) -> item => match item {
                    Ok(frame) => return Ok(frame),
                    Err(_) => return Err(ConsoleError::Closed),
                },
                default(FRAME_INTERVAL) => {
                    if let Some(frame) = self.shared.synthesize_frame() {
                        return Ok(frame);
                    }
                }
            }
        }
    }
}

fn link_failure() -> ConsoleError {
    ConsoleError::Transport("simulated link failure".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_stream_yields_pushed_frames_then_cancels() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let token = CancelToken::new();
        let mut stream = sim.listen_sample_stream(&token).unwrap();
        let frame = Frame {
            samples: vec![1.0, 2.0],
            sample_spacing_ps: 1.0,
            pulse_period_ns: 16.0,
            ref_50ohm: 0.5,
            ref_unit_amp: 0.25,
        };
        sim.push_frame(frame.clone());
        assert_eq!(stream.next_item().unwrap(), frame);

        token.cancel();
        assert!(matches!(stream.next_item(), Err(ConsoleError::Cancelled)));
    }

    #[test]
    fn fault_fails_open_listeners_until_healed() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let token = CancelToken::new();
        let mut events = sim.listen_state_events(&token).unwrap();
        sim.inject_fault();
        assert!(matches!(events.next_item(), Err(ConsoleError::Transport(_))));

        sim.heal();
        let mut events = sim.listen_state_events(&token).unwrap();
        sim.set_state(InstrumentState::default());
        assert!(events.next_item().is_ok());
    }

    #[test]
    fn led_listener_filters_by_selector() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        let token = CancelToken::new();
        let mut leds = sim
            .listen_led_state(LedSelectors::red_only(), &token)
            .unwrap();
        sim.set_led(LedId::Green, true).unwrap();
        sim.set_led(LedId::Red, true).unwrap();
        let state = leds.next_item().unwrap();
        assert_eq!(state.led_id, LedId::Red);
        assert!(state.is_lit());
    }

    #[test]
    fn enabling_without_configuration_fails() {
        let sim = SimulatedInstrument::scripted("0.1.0");
        assert!(sim.enable_tdr(true).is_err());
        sim.configure_tdr_preset(TdrPreset::resolve("16/1").unwrap())
            .unwrap();
        sim.enable_tdr(true).unwrap();
        assert!(sim.tdr_working_state().unwrap().acquiring);
        let config = sim.tdr_configuration().unwrap();
        assert_eq!(config.sample_spacing_ps, 1.0);
    }

    #[test]
    fn demo_synthesizes_frames_while_acquiring() {
        let sim = SimulatedInstrument::demo();
        let token = CancelToken::new();
        let mut stream = sim.listen_sample_stream(&token).unwrap();
        let frame = stream.next_item().unwrap();
        assert_eq!(frame.len(), 160);
        assert_eq!(frame.sample_spacing_ps, 100.0);
        token.cancel();
    }
}
