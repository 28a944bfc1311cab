//! Theme compositor
//!
//! Blends the theme mask over each accepted frame and draws the widget text
//! on top. Text is laid out and rasterized with resvg against the system font
//! database.

use crate::media::VideoFrame;
use crate::sensors::SensorFormatter;
use crate::theme::Theme;
use anyhow::{Context, Result};
use common::{WidgetConfig, WidgetContent};
use image::{ImageBuffer, Rgba, RgbaImage};
use resvg::{tiny_skia, usvg};
use std::sync::Arc;

/// Font family used when the daemon config does not name one
pub const DEFAULT_FONT_FAMILY: &str = "DejaVu Sans";

/// Mask resized to the last frame size seen
struct MaskCache {
    source: Arc<RgbaImage>,
    resized: RgbaImage,
}

/// Widget text rasterized from one SVG document
struct WidgetLayer {
    svg: String,
    layer: RgbaImage,
}

pub struct ThemeCompositor {
    formatter: Arc<dyn SensorFormatter>,
    options: usvg::Options<'static>,
    font_family: String,
    mask_cache: Option<MaskCache>,
    widget_cache: Option<WidgetLayer>,
}

impl ThemeCompositor {
    /// Create a compositor. Loads the system fonts once.
    pub fn new(formatter: Arc<dyn SensorFormatter>, font_family: impl Into<String>) -> Self {
        let mut options = usvg::Options::default();
        options.fontdb_mut().load_system_fonts();
        log::debug!("Loaded {} font faces", options.fontdb.len());

        let font_family = font_family.into();
        options.font_family = font_family.clone();

        Self {
            formatter,
            options,
            font_family,
            mask_cache: None,
            widget_cache: None,
        }
    }

    /// Composite one frame with the theme's mask and widgets.
    pub fn compose(&mut self, frame: &VideoFrame, theme: &Theme) -> Result<RgbaImage> {
        let mut image = frame
            .to_image()
            .with_context(|| format!("Frame buffer does not match {}x{}", frame.width, frame.height))?;

        let mask = self.mask_for(&theme.mask, image.width(), image.height())?;
        image::imageops::overlay(&mut image, mask, 0, 0);

        if !theme.config.widgets.is_empty() {
            self.draw_widgets(&mut image, &theme.config.widgets)?;
        }

        Ok(image)
    }

    /// Mask at the frame size, resized once per new size.
    fn mask_for<'a>(
        &'a mut self,
        mask: &'a Arc<RgbaImage>,
        width: u32,
        height: u32,
    ) -> Result<&'a RgbaImage> {
        if mask.dimensions() == (width, height) {
            return Ok(mask.as_ref());
        }

        let stale = match &self.mask_cache {
            Some(cache) => {
                !Arc::ptr_eq(&cache.source, mask) || cache.resized.dimensions() != (width, height)
            }
            None => true,
        };

        if stale {
            log::debug!(
                "Resizing mask from {}x{} to {}x{}",
                mask.width(),
                mask.height(),
                width,
                height
            );
            self.mask_cache = Some(MaskCache {
                source: Arc::clone(mask),
                resized: resize_mask(mask, width, height)?,
            });
        }

        self.mask_cache
            .as_ref()
            .map(|cache| &cache.resized)
            .context("Mask cache is empty")
    }

    fn draw_widgets(&mut self, image: &mut RgbaImage, widgets: &[WidgetConfig]) -> Result<()> {
        let svg = self.widgets_svg(image.width(), image.height(), widgets);

        let cached = self
            .widget_cache
            .as_ref()
            .is_some_and(|cache| cache.svg == svg);
        if !cached {
            let layer = self.render_svg(&svg, image.width(), image.height())?;
            self.widget_cache = Some(WidgetLayer { svg, layer });
        }

        if let Some(cache) = &self.widget_cache {
            image::imageops::overlay(image, &cache.layer, 0, 0);
        }
        Ok(())
    }

    fn render_svg(&self, svg: &str, width: u32, height: u32) -> Result<RgbaImage> {
        let tree = usvg::Tree::from_str(svg, &self.options).context("Failed to lay out widgets")?;

        let mut pixmap =
            tiny_skia::Pixmap::new(width, height).context("Failed to allocate text layer")?;
        resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

        // Pixmap data is premultiplied
        let mut layer: RgbaImage = ImageBuffer::new(width, height);
        for (dst, src) in layer.pixels_mut().zip(pixmap.pixels()) {
            let c = src.demultiply();
            *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
        }
        Ok(layer)
    }

    /// Text for a widget: the literal, or the sensor reading for its key.
    fn widget_text(&self, widget: &WidgetConfig) -> String {
        match &widget.content {
            WidgetContent::Literal { text } => text.clone(),
            WidgetContent::Sensor { widget: key } => {
                self.formatter.format(key, widget.unit, widget.cels).0
            }
        }
    }

    fn widgets_svg(&self, width: u32, height: u32, widgets: &[WidgetConfig]) -> String {
        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
        );

        for widget in widgets {
            let text = self.widget_text(widget);
            if text.is_empty() {
                continue;
            }
            let [r, g, b, a] = widget.color;
            svg.push_str(&format!(
                r#"<text x="{}" y="{}" font-family="{}" font-size="{}" dominant-baseline="hanging" fill="rgb({},{},{})" fill-opacity="{:.3}" xml:space="preserve">{}</text>"#,
                widget.xy[0],
                widget.xy[1],
                escape_xml(&self.font_family),
                widget.size.max(1),
                r,
                g,
                b,
                a as f32 / 255.0,
                escape_xml(&text)
            ));
        }

        svg.push_str("</svg>");
        svg
    }
}

fn resize_mask(mask: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
    use fast_image_resize as fr;

    let src = fr::images::Image::from_vec_u8(
        mask.width(),
        mask.height(),
        mask.as_raw().clone(),
        fr::PixelType::U8x4,
    )
    .context("Failed to create source image")?;

    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .context("Failed to resize mask")?;

    ImageBuffer::from_raw(width, height, dst.into_vec()).context("Failed to create mask buffer")
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
