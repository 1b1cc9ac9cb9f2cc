use std::time::Instant;

use crate::drivers::cursor::{CursorAxis, CursorReadouts, CursorSet};
use crate::drivers::transform::convert;
use crate::types::{DisplayMode, Frame};

/// What changed when a frame was put on display.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DisplayUpdate {
    /// New plot title, present only when the configuration changed.
    pub title: Option<String>,
    /// The horizontal cursors were re-expressed in a new display mode.
    pub cursors_rescaled: bool,
}

pub fn plot_title(frame: &Frame) -> String {
    format!(
        "TDR: Pulse Period:{:.2}ns, Sample Spacing:{}ps",
        frame.pulse_period_ns, frame.sample_spacing_ps
    )
}

/// Consumer side of the stream: holds the displayed frame in the selected
/// mode, the cursors over it and the refresh-rate counters.
pub struct DisplayPipeline {
    mode: DisplayMode,
    frame: Option<Frame>,
    x_ps: Vec<f64>,
    y: Vec<f64>,
    cursors: CursorSet,
    prev_sample_spacing_ps: Option<f64>,
    prev_pulse_period_ns: Option<f64>,
    frames_since_tick: u64,
    last_tick: Instant,
}

impl DisplayPipeline {
    pub fn new(mode: DisplayMode) -> Self {
        Self {
            mode,
            frame: None,
            x_ps: Vec::new(),
            y: Vec::new(),
            cursors: CursorSet::new(),
            prev_sample_spacing_ps: None,
            prev_pulse_period_ns: None,
            frames_since_tick: 0,
            last_tick: Instant::now(),
        }
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn x_ps(&self) -> &[f64] {
        &self.x_ps
    }

    /// Displayed values, in log space when the mode is log-displayed.
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn cursors(&self) -> &CursorSet {
        &self.cursors
    }

    /// Puts a drained frame on display.
    pub fn apply(&mut self, frame: Frame) -> DisplayUpdate {
        self.frames_since_tick += 1;
        self.frame = Some(frame);
        self.render()
    }

    /// Shows an imported frame. The configuration cache is dropped so the
    /// title is always regenerated.
    pub fn load(&mut self, frame: Frame) -> DisplayUpdate {
        self.prev_sample_spacing_ps = None;
        self.prev_pulse_period_ns = None;
        self.frame = Some(frame);
        self.render()
    }

    /// Switches the value axis. The displayed frame, if any, is re-rendered
    /// right away; otherwise the cursors follow on the next frame.
    pub fn set_mode(&mut self, mode: DisplayMode) -> DisplayUpdate {
        self.mode = mode;
        if self.frame.is_some() {
            self.render()
        } else {
            DisplayUpdate::default()
        }
    }

    /// Drops the displayed frame. Cursors and change-detection state survive.
    pub fn clear(&mut self) {
        self.frame = None;
        self.x_ps.clear();
        self.y.clear();
    }

    /// Full reset between connections.
    pub fn reset(&mut self) {
        self.clear();
        self.reset_change_detection();
    }

    /// Forgets the last configuration and the refresh counters but keeps the
    /// displayed frame, so a trace stays visible after a disconnect. Cursors
    /// keep the mode their positions are expressed in.
    pub fn reset_change_detection(&mut self) {
        self.prev_sample_spacing_ps = None;
        self.prev_pulse_period_ns = None;
        self.frames_since_tick = 0;
        self.last_tick = Instant::now();
    }

    pub fn toggle_cursor(&mut self, axis: CursorAxis, index: usize) -> bool {
        self.cursors.toggle(axis, index, &self.x_ps, &self.y)
    }

    pub fn set_cursor_visible(&mut self, axis: CursorAxis, index: usize, visible: bool) -> bool {
        self.cursors
            .set_visible(axis, index, visible, &self.x_ps, &self.y)
    }

    pub fn move_cursors(&mut self, x_ps: f64, value: f64) {
        self.cursors.move_visible_to(x_ps, value);
    }

    pub fn readouts(&self) -> CursorReadouts {
        self.cursors.readouts(&self.x_ps, &self.y, self.mode)
    }

    /// Frames displayed per second since the last tick that saw a frame.
    ///
    /// Returns `Some(0.0)` while idle and `None` when no frame was displayed
    /// since the previous report, so slow streams keep their last rate.
    pub fn tick_refresh_rate(&mut self, active: bool) -> Option<f64> {
        self.tick_refresh_rate_at(active, Instant::now())
    }

    pub fn tick_refresh_rate_at(&mut self, active: bool, now: Instant) -> Option<f64> {
        if !active {
            return Some(0.0);
        }
        if self.frames_since_tick == 0 {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_tick).as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.frames_since_tick as f64 / elapsed
        } else {
            0.0
        };
        self.last_tick = now;
        self.frames_since_tick = 0;
        Some(rate)
    }

    fn render(&mut self) -> DisplayUpdate {
        let Some(frame) = self.frame.as_ref() else {
            return DisplayUpdate::default();
        };
        let mut update = DisplayUpdate::default();
        if self.prev_sample_spacing_ps != Some(frame.sample_spacing_ps)
            || self.prev_pulse_period_ns != Some(frame.pulse_period_ns)
        {
            update.title = Some(plot_title(frame));
        }
        self.x_ps = frame.time_axis_ps();
        self.y = convert(
            &frame.samples,
            DisplayMode::Normalized,
            self.mode,
            frame.ref_50ohm,
            frame.ref_unit_amp,
        );
        self.cursors.clamp_vertical(&self.x_ps);
        update.cursors_rescaled =
            self.cursors
                .rescale_horizontal(self.mode, frame.ref_50ohm, frame.ref_unit_amp);
        self.prev_sample_spacing_ps = Some(frame.sample_spacing_ps);
        self.prev_pulse_period_ns = Some(frame.pulse_period_ns);
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(spacing: f64, period: f64) -> Frame {
        Frame {
            samples: vec![0.5, 0.55, 0.6, 0.7],
            sample_spacing_ps: spacing,
            pulse_period_ns: period,
            ref_50ohm: 0.5,
            ref_unit_amp: 0.25,
        }
    }

    #[test]
    fn title_only_changes_with_configuration() {
        let mut pipeline = DisplayPipeline::new(DisplayMode::Normalized);
        let first = pipeline.apply(frame(1.0, 16.0));
        assert_eq!(
            first.title.as_deref(),
            Some("TDR: Pulse Period:16.00ns, Sample Spacing:1ps")
        );
        assert!(pipeline.apply(frame(1.0, 16.0)).title.is_none());
        assert!(pipeline.apply(frame(2.0, 32.0)).title.is_some());
        assert_eq!(pipeline.x_ps(), &[0.0, 2.0, 4.0, 6.0]);

        pipeline.reset();
        assert!(pipeline.frame().is_none());
        assert!(pipeline.apply(frame(2.0, 32.0)).title.is_some());
    }

    #[test]
    fn mode_change_converts_values_and_rescales_cursors() {
        let mut pipeline = DisplayPipeline::new(DisplayMode::Normalized);
        pipeline.apply(frame(1.0, 16.0));
        pipeline.set_cursor_visible(CursorAxis::Horizontal, 0, true);
        let before = pipeline.cursors().horizontal[0].position;

        let update = pipeline.set_mode(DisplayMode::Impedance);
        assert!(update.cursors_rescaled);
        assert!((pipeline.y()[1] - 75.0).abs() < 1e-9);
        let level = pipeline.cursors().horizontal[0].position;
        let expected = crate::drivers::transform::convert_value(
            before,
            DisplayMode::Normalized,
            DisplayMode::Impedance,
            0.5,
            0.25,
        );
        assert_eq!(level, expected);

        pipeline.set_mode(DisplayMode::ImpedanceLog);
        let readout = pipeline.readouts().horizontal[0].unwrap();
        assert!((readout - expected).abs() < 1e-9);
    }

    #[test]
    fn mode_change_without_frame_waits_for_next_frame() {
        let mut pipeline = DisplayPipeline::new(DisplayMode::Normalized);
        pipeline.apply(frame(1.0, 16.0));
        pipeline.clear();
        assert!(!pipeline.set_mode(DisplayMode::ReflectionCoefficient).cursors_rescaled);
        assert!(pipeline.apply(frame(1.0, 16.0)).cursors_rescaled);
        // rho of the default level 0.71 at ref 0.5 / 0.25.
        assert!((pipeline.cursors().horizontal[0].position - 0.84).abs() < 1e-9);
    }

    #[test]
    fn cursors_follow_mode_from_first_frame_and_across_resets() {
        let mut pipeline = DisplayPipeline::new(DisplayMode::Impedance);
        assert!(pipeline.apply(frame(1.0, 16.0)).cursors_rescaled);
        // Default level 0.71 is rho 0.84, i.e. 50 * 1.84 / 0.16 ohm.
        let level = pipeline.cursors().horizontal[0].position;
        assert!((level - 575.0).abs() < 1e-9);

        pipeline.reset_change_detection();
        assert!(pipeline.frame().is_some());
        assert!(pipeline.set_mode(DisplayMode::Normalized).cursors_rescaled);
        assert!((pipeline.cursors().horizontal[0].position - 0.71).abs() < 1e-12);
        assert!(!pipeline.set_mode(DisplayMode::Normalized).cursors_rescaled);
    }

    #[test]
    fn toggled_cursor_lands_inside_the_trace() {
        let mut pipeline = DisplayPipeline::new(DisplayMode::Normalized);
        pipeline.apply(frame(1.0, 16.0));
        assert!(pipeline.toggle_cursor(CursorAxis::Vertical, 1));
        // 2000 ps is past a 3 ps record; cursor 2 clamps to the end.
        assert_eq!(pipeline.cursors().vertical[1].position, 3.0);
        assert!(pipeline.readouts().vertical[1].is_some());
        assert!(!pipeline.toggle_cursor(CursorAxis::Vertical, 1));
        assert!(!pipeline.toggle_cursor(CursorAxis::Vertical, 7));
    }

    #[test]
    fn refresh_rate_counts_displayed_frames() {
        let mut pipeline = DisplayPipeline::new(DisplayMode::Normalized);
        let start = Instant::now();
        pipeline.last_tick = start;
        assert_eq!(pipeline.tick_refresh_rate_at(false, start), Some(0.0));
        assert_eq!(pipeline.tick_refresh_rate_at(true, start), None);
        for _ in 0..4 {
            pipeline.apply(frame(1.0, 16.0));
        }
        let rate = pipeline
            .tick_refresh_rate_at(true, start + Duration::from_secs(2))
            .unwrap();
        assert!((rate - 2.0).abs() < 1e-9);
        assert_eq!(
            pipeline.tick_refresh_rate_at(true, start + Duration::from_secs(3)),
            None
        );
    }
}
