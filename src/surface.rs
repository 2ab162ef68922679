// SPDX-License-Identifier: MPL-2.0

//! Background layer surfaces, one per monitor with a session.
//!
//! Decoded frames are copied from the session's frame queue into a `wl_shm`
//! buffer when the compositor asks for a new frame. Frame callbacks are only
//! requested while the monitor plays, so a paused monitor keeps its last
//! frame on screen and stays idle.

use std::{collections::HashMap, time::Instant};

use eyre::WrapErr;
use sctk::{
    compositor::{CompositorState, Region},
    reexports::client::{
        Proxy, QueueHandle,
        globals::GlobalList,
        protocol::{wl_output::WlOutput, wl_shm, wl_surface::WlSurface},
    },
    shell::{
        WaylandSurface,
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerSurface, LayerSurfaceConfigure,
        },
    },
    shm::{
        Shm,
        slot::{Buffer, SlotPool},
    },
};
use tracing::{debug, error, warn};
use wayland_protocols::wp::{
    fractional_scale::v1::client::{wp_fractional_scale_manager_v1, wp_fractional_scale_v1},
    viewporter::client::{wp_viewport, wp_viewporter},
};

use crate::{
    engine::LiveBg,
    error::SessionError,
    frame_queue::{DEFAULT_QUEUE_CAPACITY, new_shared_queue},
    governor::FrameRateGovernor,
    orchestrator::SurfaceHost,
    session::SurfaceBinding,
    topology::{Monitor, MonitorId},
};

/// Buffer size in pixels for a monitor's logical size and scale.
#[must_use]
pub fn pixel_size(monitor: &Monitor) -> Option<(u32, u32)> {
    let scale = if monitor.scale.is_finite() && monitor.scale > 0.0 {
        monitor.scale
    } else {
        1.0
    };
    let width = (f64::from(monitor.geometry.width) * scale).round() as u32;
    let height = (f64::from(monitor.geometry.height) * scale).round() as u32;
    (width > 0 && height > 0).then_some((width, height))
}

struct BackgroundLayer {
    layer: LayerSurface,
    viewport: wp_viewport::WpViewport,
    fractional_scale: Option<wp_fractional_scale_v1::WpFractionalScaleV1>,
    /// Preferred scale in 120ths, from `wp_fractional_scale_v1`.
    preferred_scale: Option<u32>,
    /// Logical size from the last configure. `None` until the first one.
    size: Option<(u32, u32)>,
    binding: SurfaceBinding,
    pool: Option<SlotPool>,
    buffer: Option<Buffer>,
    governor: FrameRateGovernor,
    rendering: bool,
    frame_pending: bool,
}

impl Drop for BackgroundLayer {
    fn drop(&mut self) {
        self.viewport.destroy();
        if let Some(fractional_scale) = self.fractional_scale.take() {
            fractional_scale.destroy();
        }
    }
}

impl BackgroundLayer {
    fn pool_len(&self) -> usize {
        self.binding.width as usize * self.binding.height as usize * 4
    }

    fn ensure_pool(&mut self, shm: &Shm) -> bool {
        let len = self.pool_len();
        let result = match self.pool.as_mut() {
            Some(pool) => pool.resize(len).map_err(|why| why.to_string()),
            None => SlotPool::new(len, shm)
                .map(|pool| {
                    self.pool = Some(pool);
                })
                .map_err(|why| why.to_string()),
        };
        if let Err(why) = result {
            error!(output = %self.binding.monitor, %why, "failed to allocate frame buffer pool");
            return false;
        }
        true
    }

    /// Present the newest decoded frame, if pacing allows, and ask for the
    /// next frame callback while playing.
    fn draw(&mut self, qh: &QueueHandle<LiveBg>, now: Instant) {
        let Some((logical_width, logical_height)) = self.size else {
            return;
        };

        let frame = if self.rendering && self.governor.should_render(now) {
            self.binding.frames.take_latest()
        } else {
            None
        };

        let surface = self.layer.wl_surface().clone();
        let (width, height) = (self.binding.width, self.binding.height);

        // The surface is mapped with a black buffer until the first frame arrives.
        if frame.is_some() || self.buffer.is_none() {
            let Some(pool) = self.pool.as_mut() else {
                return;
            };
            let stride = width as i32 * 4;
            match pool.create_buffer(
                width as i32,
                height as i32,
                stride,
                wl_shm::Format::Xrgb8888,
            ) {
                Ok((buffer, canvas)) => {
                    match frame {
                        Some(frame) => {
                            if frame.width < width || frame.height < height {
                                canvas.fill(0);
                            }
                            frame.copy_into(canvas, width, height);
                        }
                        None => canvas.fill(0),
                    }

                    surface.damage_buffer(0, 0, width as i32, height as i32);
                    if let Err(why) = buffer.attach_to(&surface) {
                        error!(?why, output = %self.binding.monitor, "buffer attachment failed");
                    }
                    self.buffer = Some(buffer);
                }
                Err(why) => {
                    error!(?why, output = %self.binding.monitor, "failed to create frame buffer");
                }
            }
        }

        self.viewport
            .set_destination(logical_width as i32, logical_height as i32);

        if self.rendering {
            surface.frame(qh, surface.clone());
            self.frame_pending = true;
        }

        surface.commit();
    }
}

/// The wallpaper surfaces of every monitor, created on demand by the orchestrator.
pub struct BackgroundSurfaces {
    compositor: CompositorState,
    layer_shell: LayerShell,
    shm: Shm,
    viewporter: wp_viewporter::WpViewporter,
    fractional_scale_manager: Option<wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1>,
    qh: QueueHandle<LiveBg>,
    outputs: HashMap<MonitorId, WlOutput>,
    layers: HashMap<MonitorId, BackgroundLayer>,
    frame_cap: Option<u32>,
}

impl std::fmt::Debug for BackgroundSurfaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSurfaces")
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("layers", &self.layers.keys().collect::<Vec<_>>())
            .field("frame_cap", &self.frame_cap)
            .finish_non_exhaustive()
    }
}

impl BackgroundSurfaces {
    /// Bind the globals needed to put a surface on the background layer.
    ///
    /// # Errors
    ///
    /// Fails when the compositor lacks `wl_compositor`, `wl_shm`,
    /// `zwlr_layer_shell_v1` or `wp_viewporter`.
    pub fn new(
        globals: &GlobalList,
        qh: &QueueHandle<LiveBg>,
        frame_cap: Option<u32>,
    ) -> eyre::Result<Self> {
        Ok(Self {
            compositor: CompositorState::bind(globals, qh)
                .wrap_err("compositor does not offer wl_compositor")?,
            layer_shell: LayerShell::bind(globals, qh)
                .wrap_err("compositor does not support wlr layer shell")?,
            shm: Shm::bind(globals, qh).wrap_err("compositor does not offer wl_shm")?,
            viewporter: globals
                .bind(qh, 1..=1, ())
                .wrap_err("compositor does not support wp_viewporter")?,
            fractional_scale_manager: globals.bind(qh, 1..=1, ()).ok(),
            qh: qh.clone(),
            outputs: HashMap::new(),
            layers: HashMap::new(),
            frame_cap,
        })
    }

    pub fn shm_mut(&mut self) -> &mut Shm {
        &mut self.shm
    }

    /// Remember which output object shows `id`, for later surface creation.
    pub fn track_output(&mut self, id: MonitorId, output: WlOutput) {
        self.outputs.insert(id, output);
    }

    pub fn forget_output(&mut self, id: &MonitorId) {
        self.outputs.remove(id);
    }

    /// Apply a new frame rate cap to every surface.
    pub fn set_frame_cap(&mut self, cap: Option<u32>) {
        if self.frame_cap == cap {
            return;
        }
        self.frame_cap = cap;
        for layer in self.layers.values_mut() {
            layer.governor = FrameRateGovernor::new(cap);
        }
    }

    /// Scale preferred by the compositor for the surface on `id`.
    #[must_use]
    pub fn preferred_scale(&self, id: &MonitorId) -> Option<f64> {
        self.layers
            .get(id)
            .and_then(|layer| layer.preferred_scale)
            .map(|scale| f64::from(scale) / 120.0)
    }

    fn find_surface(&mut self, surface: &WlSurface) -> Option<(&MonitorId, &mut BackgroundLayer)> {
        self.layers
            .iter_mut()
            .find(|(_, layer)| layer.layer.wl_surface() == surface)
    }

    /// Record a fractional scale. Returns the monitor when the scale changed.
    pub fn set_preferred_scale(&mut self, surface: &WlSurface, scale: u32) -> Option<MonitorId> {
        let (id, layer) = self.find_surface(surface)?;
        if layer.preferred_scale.replace(scale) == Some(scale) {
            return None;
        }
        debug!(output = %id, scale = f64::from(scale) / 120.0, "preferred scale changed");
        Some(id.clone())
    }

    pub fn configure(&mut self, layer: &LayerSurface, configure: LayerSurfaceConfigure) {
        let qh = self.qh.clone();
        let shm = &self.shm;
        let Some(record) = self.layers.values_mut().find(|record| &record.layer == layer) else {
            return;
        };

        let (mut width, mut height) = configure.new_size;
        if width == 0 || height == 0 {
            // Anchored to every edge, so zero only happens on broken compositors.
            let scale = record.preferred_scale.map_or(1.0, |s| f64::from(s) / 120.0);
            width = (f64::from(record.binding.width) / scale).round() as u32;
            height = (f64::from(record.binding.height) / scale).round() as u32;
        }
        debug!(output = %record.binding.monitor, width, height, "background surface configured");
        record.size = Some((width, height));

        if record.ensure_pool(shm) {
            record.buffer = None;
            record.draw(&qh, Instant::now());
        }
    }

    /// The compositor is ready for the next frame of `surface`.
    pub fn frame_done(&mut self, surface: &WlSurface) {
        let qh = self.qh.clone();
        let Some((_, layer)) = self.find_surface(surface) else {
            return;
        };
        layer.frame_pending = false;
        if layer.rendering {
            layer.draw(&qh, Instant::now());
        }
    }

    /// The compositor destroyed a layer surface on its own.
    pub fn closed(&mut self, layer: &LayerSurface) -> Option<MonitorId> {
        let id = self
            .layers
            .iter()
            .find(|(_, record)| &record.layer == layer)
            .map(|(id, _)| id.clone())?;
        warn!(output = %id, "background surface closed by the compositor");
        if let Some(layer) = self.layers.remove(&id) {
            layer.binding.frames.close();
        }
        Some(id)
    }

    fn create_layer(&self, output: &WlOutput, binding: SurfaceBinding) -> Result<BackgroundLayer, SessionError> {
        let surface = self.compositor.create_surface(&self.qh);

        let layer = self.layer_shell.create_layer_surface(
            &self.qh,
            surface.clone(),
            Layer::Background,
            Some("wallpaper"),
            Some(output),
        );

        layer.set_anchor(Anchor::all());
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(KeyboardInteractivity::None);

        let region = Region::new(&self.compositor)
            .map_err(|why| SessionError::SurfaceBind(format!("cannot create input region: {why}")))?;
        surface.set_input_region(Some(region.wl_region()));

        let viewport = self.viewporter.get_viewport(&surface, &self.qh, ());

        let fractional_scale = self
            .fractional_scale_manager
            .as_ref()
            .map(|manager| manager.get_fractional_scale(&surface, &self.qh, surface.downgrade()));

        surface.commit();

        Ok(BackgroundLayer {
            layer,
            viewport,
            fractional_scale,
            preferred_scale: None,
            size: None,
            binding,
            pool: None,
            buffer: None,
            governor: FrameRateGovernor::new(self.frame_cap),
            rendering: false,
            frame_pending: false,
        })
    }
}

impl SurfaceHost for BackgroundSurfaces {
    fn bind(&mut self, monitor: &Monitor) -> Result<SurfaceBinding, SessionError> {
        if let Some(layer) = self.layers.get(&monitor.id) {
            return Ok(layer.binding.clone());
        }

        let output = self
            .outputs
            .get(&monitor.id)
            .ok_or_else(|| SessionError::SurfaceBind(format!("no output object for {}", monitor.id)))?;
        let (width, height) = pixel_size(monitor)
            .ok_or_else(|| SessionError::SurfaceBind(format!("{} has no size", monitor.id)))?;

        let binding = SurfaceBinding {
            monitor: monitor.id.clone(),
            width,
            height,
            frames: new_shared_queue(DEFAULT_QUEUE_CAPACITY),
        };
        let layer = self.create_layer(output, binding.clone())?;
        debug!(output = %monitor.id, width, height, "background surface created");
        self.layers.insert(monitor.id.clone(), layer);
        Ok(binding)
    }

    fn resize(&mut self, monitor: &Monitor) -> Option<SurfaceBinding> {
        let (width, height) = pixel_size(monitor)?;
        let layer = self.layers.get_mut(&monitor.id)?;
        if (layer.binding.width, layer.binding.height) == (width, height) {
            return None;
        }

        layer.binding.width = width;
        layer.binding.height = height;
        if layer.size.is_some() && layer.ensure_pool(&self.shm) {
            layer.buffer = None;
            layer.draw(&self.qh, Instant::now());
        }
        Some(layer.binding.clone())
    }

    fn set_rendering(&mut self, id: &MonitorId, active: bool) {
        let Some(layer) = self.layers.get_mut(id) else {
            return;
        };
        if layer.rendering == active {
            return;
        }
        layer.rendering = active;
        if active {
            layer.governor.reset();
            if !layer.frame_pending {
                layer.draw(&self.qh, Instant::now());
            }
        }
    }

    fn release(&mut self, id: &MonitorId) {
        if let Some(layer) = self.layers.remove(id) {
            layer.binding.frames.close();
            let stats = layer.binding.frames.stats();
            debug!(output = %id, ?stats, "background surface released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Geometry;

    fn monitor(width: u32, height: u32, scale: f64) -> Monitor {
        Monitor {
            id: MonitorId::new("DP-1"),
            geometry: Geometry {
                x: 0,
                y: 0,
                width,
                height,
            },
            scale,
        }
    }

    #[test]
    fn test_pixel_size() {
        assert_eq!(pixel_size(&monitor(1920, 1080, 1.0)), Some((1920, 1080)));
        assert_eq!(pixel_size(&monitor(1280, 720, 1.5)), Some((1920, 1080)));
        assert_eq!(pixel_size(&monitor(1920, 1080, 2.0)), Some((3840, 2160)));
    }

    #[test]
    fn test_pixel_size_rejects_empty_monitors() {
        assert_eq!(pixel_size(&monitor(0, 1080, 1.0)), None);
        assert_eq!(pixel_size(&monitor(1920, 1080, 0.0)), Some((1920, 1080)));
        assert_eq!(pixel_size(&monitor(1920, 1080, f64::NAN)), Some((1920, 1080)));
    }
}
