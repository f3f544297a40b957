//! Core compositor implementation
//!
//! Owns the calloop event loop and wires the subsystems into it: the GPU
//! device drives frame compositing through page-flip events, the keyboard
//! feeds the client sink, and signals or a key press stop the loop.

use std::os::fd::{AsFd, BorrowedFd};
use std::process::{Child, Command};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction};
use log::{debug, error, info, trace, warn};

use crate::config::{ClientConfig, CompositorConfig};
use crate::input::{InputEvent, KeyboardInput};
use crate::kms::{DisplayPipeline, KmsDevice, ScanoutAllocator};
use crate::renderer::FrameCompositor;
use crate::surface::SurfaceStore;

/// Receiver of everything a connected client would be sent
pub trait ClientSink {
    /// The keymap, once, before any key event
    fn keymap(&mut self, fd: BorrowedFd<'_>, size: usize);

    fn key(&mut self, event: &InputEvent);

    /// Some key events were lost before reaching [`ClientSink::key`]
    fn input_lost(&mut self) {}
}

/// Sink that only logs
#[derive(Debug, Default)]
pub struct LogSink {
    keys: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys_seen(&self) -> u64 {
        self.keys
    }
}

impl ClientSink for LogSink {
    fn keymap(&mut self, fd: BorrowedFd<'_>, size: usize) {
        debug!("keymap available: fd {:?}, {} bytes", fd, size);
    }

    fn key(&mut self, event: &InputEvent) {
        self.keys += 1;
        debug!(
            "key {} {} (mods {:#x}/{:#x}/{:#x}, group {})",
            event.keycode,
            if event.pressed { "pressed" } else { "released" },
            event.depressed,
            event.latched,
            event.locked,
            event.group
        );
    }

    fn input_lost(&mut self) {
        warn!("client missed keyboard events");
    }
}

/// Loop behaviour knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    pub quit_on_key_press: bool,
    pub commit_retry: Duration,
}

impl LoopOptions {
    pub fn from_config(config: &CompositorConfig) -> Self {
        Self {
            quit_on_key_press: config.input.quit_on_key_press,
            commit_retry: Duration::from_millis(config.drm.commit_retry_ms),
        }
    }
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self::from_config(&CompositorConfig::default())
    }
}

/// Everything the loop callbacks operate on
pub struct LoopState<D, A, S>
where
    D: KmsDevice,
    A: ScanoutAllocator<D>,
{
    pipeline: DisplayPipeline<D, A>,
    surfaces: SurfaceStore,
    keyboard: Option<KeyboardInput>,
    sink: S,
    options: LoopOptions,
    signal: LoopSignal,
    handle: LoopHandle<'static, LoopState<D, A, S>>,
    retry_scheduled: bool,
}

impl<D, A, S> LoopState<D, A, S>
where
    D: KmsDevice + 'static,
    A: ScanoutAllocator<D> + 'static,
    S: ClientSink + 'static,
{
    pub fn pipeline(&self) -> &DisplayPipeline<D, A> {
        &self.pipeline
    }

    pub fn surfaces(&self) -> &SurfaceStore {
        &self.surfaces
    }

    pub fn surfaces_mut(&mut self) -> &mut SurfaceStore {
        &mut self.surfaces
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Retry the stalled commit on a timer until it goes through
    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        let timer = Timer::from_duration(self.options.commit_retry);
        let inserted = self
            .handle
            .insert_source(timer, |_deadline, _meta, state: &mut Self| state.retry_tick());
        match inserted {
            Ok(_) => self.retry_scheduled = true,
            Err(e) => error!("cannot schedule commit retry: {}", e.error),
        }
    }

    fn retry_tick(&mut self) -> TimeoutAction {
        match self.pipeline.retry_stalled_commit() {
            Some(Err(e)) => {
                debug!("{}; retrying", e);
                TimeoutAction::ToDuration(self.options.commit_retry)
            }
            Some(Ok(())) => {
                info!("commit recovered");
                self.retry_scheduled = false;
                TimeoutAction::Drop
            }
            None if self.pipeline.is_stalled() => {
                TimeoutAction::ToDuration(self.options.commit_retry)
            }
            None => {
                self.retry_scheduled = false;
                TimeoutAction::Drop
            }
        }
    }

    fn on_keyboard_ready(&mut self) {
        let Some(keyboard) = self.keyboard.as_mut() else {
            return;
        };
        let batch = match keyboard.drain() {
            Ok(batch) => batch,
            Err(e) => {
                error!("{}; stopping", e);
                self.signal.stop();
                return;
            }
        };

        if batch.overflowed {
            self.sink.input_lost();
        }
        for event in &batch.events {
            self.sink.key(event);
        }
        if self.options.quit_on_key_press && batch.has_press() {
            info!("key pressed, stopping");
            self.signal.stop();
        }
    }
}

/// Per-flip work: composite every surface into the scanout buffer, then
/// let the pipeline queue the next flip
#[derive(Debug, Default)]
pub struct FlipHandler {
    compositor: FrameCompositor,
}

impl FlipHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.compositor.frames()
    }

    pub fn on_ready<D, A, S>(&mut self, state: &mut LoopState<D, A, S>)
    where
        D: KmsDevice + 'static,
        A: ScanoutAllocator<D> + 'static,
        S: ClientSink + 'static,
    {
        let compositor = &mut self.compositor;
        let surfaces = &state.surfaces;
        match state.pipeline.process_flip_events(|target| {
            compositor.composite(surfaces, target);
        }) {
            Ok(0) => {}
            Ok(n) => trace!("{} flip(s) completed", n),
            Err(e) => warn!("{}; keeping the current frame", e),
        }
        if state.pipeline.is_stalled() {
            state.schedule_retry();
        }
    }
}

/// Launch the configured client. Failure is logged and otherwise ignored.
pub fn spawn_client(config: &ClientConfig) -> Option<Child> {
    let command = config.command.as_deref()?;
    match Command::new(command).args(&config.args).spawn() {
        Ok(child) => {
            info!("launched {} (pid {})", command, child.id());
            Some(child)
        }
        Err(e) => {
            warn!("failed to launch {}: {}", command, e);
            None
        }
    }
}

fn reap(mut child: Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!("client {} exited: {}", child.id(), status),
        Ok(None) => {
            debug!("terminating client {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
        Err(e) => warn!("cannot query client {}: {}", child.id(), e),
    }
}

/// The running compositor
pub struct Compositor<D, A, S>
where
    D: KmsDevice,
    A: ScanoutAllocator<D>,
{
    event_loop: EventLoop<'static, LoopState<D, A, S>>,
    state: LoopState<D, A, S>,
    client: Option<Child>,
    started: bool,
}

impl<D, A, S> Compositor<D, A, S>
where
    D: KmsDevice + AsFd + 'static,
    A: ScanoutAllocator<D> + 'static,
    S: ClientSink + 'static,
{
    /// Register the GPU device and, if present, the keyboard with a new
    /// event loop. The sink receives the keymap here.
    pub fn new(
        pipeline: DisplayPipeline<D, A>,
        keyboard: Option<KeyboardInput>,
        mut sink: S,
        options: LoopOptions,
    ) -> Result<Self> {
        let event_loop: EventLoop<'static, LoopState<D, A, S>> =
            EventLoop::try_new().context("Failed to create event loop")?;
        let handle = event_loop.handle();

        let gpu_fd = pipeline
            .device()
            .as_fd()
            .try_clone_to_owned()
            .context("Failed to duplicate GPU device fd")?;
        let mut flip = FlipHandler::new();
        handle
            .insert_source(
                Generic::new(gpu_fd, Interest::READ, Mode::Level),
                move |_, _, state| {
                    flip.on_ready(state);
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|_| anyhow!("Failed to register GPU device with the event loop"))?;

        if let Some(keyboard) = &keyboard {
            let keyboard_fd = keyboard
                .as_fd()
                .try_clone_to_owned()
                .context("Failed to duplicate keyboard fd")?;
            handle
                .insert_source(
                    Generic::new(keyboard_fd, Interest::READ, Mode::Level),
                    |_, _, state: &mut LoopState<D, A, S>| {
                        state.on_keyboard_ready();
                        Ok(PostAction::Continue)
                    },
                )
                .map_err(|_| anyhow!("Failed to register keyboard with the event loop"))?;
            sink.keymap(keyboard.state().keymap_fd(), keyboard.state().keymap_size());
        }

        let state = LoopState {
            pipeline,
            surfaces: SurfaceStore::new(),
            keyboard,
            sink,
            options,
            signal: event_loop.get_signal(),
            handle,
            retry_scheduled: false,
        };

        Ok(Self {
            event_loop,
            state,
            client: None,
            started: false,
        })
    }

    pub fn state(&self) -> &LoopState<D, A, S> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut LoopState<D, A, S> {
        &mut self.state
    }

    /// Handle that stops [`Compositor::run`] from any thread
    pub fn signal(&self) -> LoopSignal {
        self.event_loop.get_signal()
    }

    pub fn spawn_client(&mut self, config: &ClientConfig) {
        if let Some(previous) = self.client.take() {
            reap(previous);
        }
        self.client = spawn_client(config);
    }

    /// Queue the first frame. Called by [`Compositor::run`].
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        if let Err(e) = self.state.pipeline.commit_scanout() {
            warn!("{}; keeping the current frame", e);
            self.state.schedule_retry();
        }
    }

    /// Run one loop iteration
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.event_loop
            .dispatch(timeout, &mut self.state)
            .context("Event loop dispatch failed")
    }

    /// Run until a key press or signal, then shut down
    pub fn run(mut self) -> Result<()> {
        self.start();

        let signal = self.event_loop.get_signal();
        if let Err(e) = ctrlc::set_handler(move || {
            signal.stop();
            signal.wakeup();
        }) {
            warn!("cannot install signal handler: {}", e);
        }

        info!("compositor running");
        let outcome = self
            .event_loop
            .run(None, &mut self.state, |_| {})
            .context("Event loop failed");
        if let Err(e) = &outcome {
            error!("{:#}", e);
        }

        self.shutdown()?;
        outcome
    }

    /// Restore the display, release the keyboard and reap the client
    pub fn shutdown(self) -> Result<()> {
        let Compositor {
            event_loop,
            state,
            client,
            ..
        } = self;
        drop(event_loop);

        let LoopState {
            pipeline, keyboard, ..
        } = state;
        let restored = pipeline.shutdown();
        if let Some(keyboard) = keyboard {
            keyboard.release();
        }
        if let Some(child) = client {
            reap(child);
        }

        restored.context("Failed to restore the display")
    }
}
