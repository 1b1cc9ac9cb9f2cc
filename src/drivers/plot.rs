use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use log::warn;
use plotters::prelude::LineSeries;
use plotters::prelude::*;

use crate::drivers::cursor::finite_range;
use crate::drivers::pipeline::{plot_title, DisplayPipeline};
use crate::drivers::ConsoleError;

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub trace: RGBColor,
    /// Vertical C1, vertical C2, horizontal C1, horizontal C2.
    pub cursor_palette: [RGBColor; 4],
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: RGBColor(10, 10, 10),
            trace: RGBColor(0, 200, 255),
            cursor_palette: [
                RGBColor(255, 80, 255),
                RGBColor(80, 220, 120),
                RGBColor(225, 190, 25),
                RGBColor(86, 60, 13),
            ],
        }
    }
}

/// Renders the displayed waveform and its visible cursors to PNG bytes.
/// Non-finite samples are left out of the trace.
pub fn render_waveform_png(
    display: &DisplayPipeline,
    style: &PlotStyle,
) -> Result<Vec<u8>, ConsoleError> {
    let points: Vec<(f64, f64)> = display
        .x_ps()
        .iter()
        .copied()
        .zip(display.y().iter().copied())
        .filter(|(_, y)| y.is_finite())
        .collect();
    let (Some(&(x_min, _)), Some(&(x_max, _))) = (points.first(), points.last()) else {
        return Err(ConsoleError::Plot("no finite samples to plot".into()));
    };
    let (y_min, y_max) = finite_range(display.y()).unwrap_or((-1.0, 1.0));
    let y_bounds = if (y_max - y_min).abs() < f64::EPSILON {
        (y_min - 1.0, y_max + 1.0)
    } else {
        let pad = (y_max - y_min) * 0.05;
        (y_min - pad, y_max + pad)
    };
    let x_bounds = if x_max > x_min {
        (x_min, x_max)
    } else {
        (x_min, x_min + 1.0)
    };
    let bounds = ChartBounds { x: x_bounds, y: y_bounds };

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    if let Err(err) = draw_chart(&mut buffer, display, style, &points, bounds, true) {
        // No usable font: keep the trace and cursors, drop caption and labels.
        warn!("plot text unavailable ({err}), rendering without labels");
        buffer.fill(0);
        draw_chart(&mut buffer, display, style, &points, bounds, false)?;
    }
    encode_png(&buffer, style.width, style.height)
}

#[derive(Clone, Copy)]
struct ChartBounds {
    x: (f64, f64),
    y: (f64, f64),
}

fn draw_chart(
    buffer: &mut [u8],
    display: &DisplayPipeline,
    style: &PlotStyle,
    points: &[(f64, f64)],
    bounds: ChartBounds,
    labelled: bool,
) -> Result<(), ConsoleError> {
    let root =
        BitMapBackend::with_buffer(buffer, (style.width, style.height)).into_drawing_area();
    root.fill(&style.background)?;
    let mut builder = ChartBuilder::on(&root);
    builder.margin(10);
    if labelled {
        let title = display.frame().map(plot_title).unwrap_or_default();
        builder
            .caption(title, ("sans-serif", 20).into_font().color(&WHITE))
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 40);
    }
    let mut chart =
        builder.build_cartesian_2d(bounds.x.0..bounds.x.1, bounds.y.0..bounds.y.1)?;
    if labelled {
        chart
            .configure_mesh()
            .x_desc("ps")
            .y_desc(display.mode().label())
            .axis_desc_style(("sans-serif", 14).into_font().color(&WHITE))
            .label_style(("sans-serif", 12).into_font().color(&WHITE))
            .light_line_style(&WHITE.mix(0.1))
            .draw()?;
    }
    chart.draw_series(LineSeries::new(points.iter().copied(), &style.trace))?;

    let cursors = display.cursors();
    for (cursor, color) in cursors.vertical.iter().zip(&style.cursor_palette[..2]) {
        if cursor.visible {
            let x = cursor.position;
            chart.draw_series(LineSeries::new(
                [(x, bounds.y.0), (x, bounds.y.1)],
                color,
            ))?;
        }
    }
    for (cursor, color) in cursors.horizontal.iter().zip(&style.cursor_palette[2..]) {
        if cursor.visible && cursor.position.is_finite() {
            let y = cursor.position;
            chart.draw_series(LineSeries::new(
                [(bounds.x.0, y), (bounds.x.1, y)],
                color,
            ))?;
        }
    }
    root.present()?;
    Ok(())
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConsoleError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| ConsoleError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}
