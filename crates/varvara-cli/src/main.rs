#![forbid(unsafe_code)]

//! Native runner: loads a ROM, opens a window, and drives the machine's
//! frame cycle against a GPU presenter.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, warn};
use varvara_machine::{ControllerButton, Machine, MachineConfig, DEFAULT_STEP_BUDGET};
use varvara_presenter::{AspectMode, Presenter};
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::WindowBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum AspectArg {
    Stretch,
    Fit,
    Integer,
}

impl From<AspectArg> for AspectMode {
    fn from(arg: AspectArg) -> Self {
        match arg {
            AspectArg::Stretch => AspectMode::Stretch,
            AspectArg::Fit => AspectMode::FitKeepAspect,
            AspectArg::Integer => AspectMode::IntegerScale,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Varvara virtual machine with a wgpu display")]
struct Args {
    /// ROM image to boot.
    rom: PathBuf,

    /// Initial window scale factor applied to the boot resolution.
    #[arg(long, default_value_t = 2)]
    zoom: u32,

    /// How the frame is placed inside the window.
    #[arg(long, value_enum, default_value_t = AspectArg::Fit)]
    aspect: AspectArg,

    /// Instruction budget per vector evaluation (0 disables the bound).
    #[arg(long, default_value_t = DEFAULT_STEP_BUDGET)]
    step_budget: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let rom = std::fs::read(&args.rom)
        .with_context(|| format!("failed to read rom: {}", args.rom.display()))?;

    let mut machine = Machine::new(MachineConfig {
        step_budget: args.step_budget,
        ..MachineConfig::default()
    });
    machine
        .boot(&rom)
        .with_context(|| format!("failed to boot rom: {}", args.rom.display()))?;

    let (frame_w, frame_h) = {
        let screen = machine.screen();
        let screen = screen.borrow();
        (screen.width(), screen.height())
    };
    let zoom = args.zoom.max(1);

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("varvara")
            .with_inner_size(PhysicalSize::new(
                u32::from(frame_w) * zoom,
                u32::from(frame_h) * zoom,
            ))
            .build(&event_loop)
            .context("failed to create window")?,
    );

    let instance = wgpu::Instance::default();
    let surface = instance
        .create_surface(window.clone())
        .context("failed to create surface")?;
    let size = window.inner_size();
    let mut presenter =
        pollster::block_on(Presenter::new(&instance, surface, size.width, size.height))
            .context("failed to initialize presenter")?;
    presenter.set_aspect_mode(args.aspect.into());

    let resize_flag = machine.resize_flag();
    let fatal: Rc<RefCell<Option<anyhow::Error>>> = Rc::new(RefCell::new(None));
    let fatal_in_loop = Rc::clone(&fatal);

    event_loop.run(move |event, elwt| match event {
        Event::AboutToWait => {
            window.request_redraw();
        }
        Event::WindowEvent { event, .. } => match event {
            WindowEvent::CloseRequested => elwt.exit(),
            WindowEvent::Resized(size) => {
                presenter.resize_surface(size.width, size.height);
            }
            WindowEvent::CursorMoved { position, .. } => {
                let (x, y) = presenter.surface_to_frame(position.x, position.y);
                machine.pointer_moved(x, y);
            }
            WindowEvent::MouseInput { state, button, .. } => {
                let id = match button {
                    MouseButton::Left => 0,
                    MouseButton::Right => 1,
                    MouseButton::Middle => 2,
                    _ => return,
                };
                machine.pointer_button(id, state == ElementState::Pressed);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let (dx, dy) = match delta {
                    MouseScrollDelta::LineDelta(x, y) => (x as i16, y as i16),
                    MouseScrollDelta::PixelDelta(pos) => {
                        ((pos.x / 16.0) as i16, (pos.y / 16.0) as i16)
                    }
                };
                machine.pointer_scroll(dx, dy);
            }
            WindowEvent::KeyboardInput { event, .. } => {
                let pressed = event.state == ElementState::Pressed;
                match &event.logical_key {
                    Key::Named(named) => {
                        if let Some(button) = button_for_key(*named) {
                            machine.controller_button(button, pressed);
                        } else if pressed {
                            if let Some(byte) = byte_for_key(*named) {
                                machine.controller_key(byte);
                            }
                        }
                    }
                    Key::Character(text) if pressed => {
                        for byte in text.bytes().filter(u8::is_ascii) {
                            machine.controller_key(byte);
                        }
                    }
                    _ => {}
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(err) = machine.frame() {
                    // Recoverable: skip this frame's render and keep going.
                    warn!(%err, "frame aborted");
                    return;
                }
                if machine.halted() {
                    elwt.exit();
                    return;
                }
                let screen = machine.screen();
                let screen = screen.borrow();
                if resize_flag.load(Ordering::Acquire) {
                    if let Err(err) = presenter
                        .set_frame_size(u32::from(screen.width()), u32::from(screen.height()))
                    {
                        error!(%err, "frame size rejected");
                        *fatal_in_loop.borrow_mut() = Some(err.into());
                        elwt.exit();
                        return;
                    }
                    resize_flag.store(false, Ordering::Release);
                }
                if let Err(err) = presenter.present_bgra(screen.pixels()) {
                    error!(%err, "present failed");
                    *fatal_in_loop.borrow_mut() = Some(err.into());
                    elwt.exit();
                }
            }
            _ => {}
        },
        _ => {}
    })?;

    let taken = fatal.borrow_mut().take();
    match taken {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn button_for_key(key: NamedKey) -> Option<ControllerButton> {
    match key {
        NamedKey::Control => Some(ControllerButton::A),
        NamedKey::Alt => Some(ControllerButton::B),
        NamedKey::Shift => Some(ControllerButton::Select),
        NamedKey::Home => Some(ControllerButton::Home),
        NamedKey::ArrowUp => Some(ControllerButton::Up),
        NamedKey::ArrowDown => Some(ControllerButton::Down),
        NamedKey::ArrowLeft => Some(ControllerButton::Left),
        NamedKey::ArrowRight => Some(ControllerButton::Right),
        _ => None,
    }
}

fn byte_for_key(key: NamedKey) -> Option<u8> {
    match key {
        NamedKey::Enter => Some(0x0d),
        NamedKey::Tab => Some(0x09),
        NamedKey::Backspace => Some(0x08),
        NamedKey::Escape => Some(0x1b),
        NamedKey::Delete => Some(0x7f),
        NamedKey::Space => Some(b' '),
        _ => None,
    }
}
