//! Flash-and-beep demo.
//!
//! Opens a window, shows a white square with a tone five times and reports
//! presentation errors. An optional first argument names a TOML presenter
//! configuration. Set `RUST_LOG` to change the log level.

use std::error::Error as StdError;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use avstim::audio::{AudioStream, CpalOutput, SoundBuffer};
use avstim::core::clock::{Clock, SystemClock};
use avstim::render::backend::{BLACK, WHITE};
use avstim::render::{SlideContent, WgpuBackend};
use avstim::{AvPresenter, Display, PresenterConfig, Slide, SlideDuration, Time};

const FLASHES: usize = 5;
const FLASH_DURATION: Time = Time::from_millis(100);
const GAP_DURATION: Time = Time::from_millis(500);
const TONE_FREQUENCY: f64 = 1000.0;

struct Session {
    presenter: AvPresenter,
    _window: Arc<Window>,
    _output: Option<CpalOutput>,
}

struct DemoApp {
    config: PresenterConfig,
    session: Option<Session>,
}

impl DemoApp {
    fn open(&self, event_loop: &ActiveEventLoop) -> Result<Session, Box<dyn StdError>> {
        let window = Arc::new(
            event_loop.create_window(
                Window::default_attributes()
                    .with_title("avstim")
                    .with_inner_size(winit::dpi::LogicalSize::new(800.0, 600.0)),
            )?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let backend = Arc::new(WgpuBackend::new(window.clone(), clock.clone())?);
        let display = Arc::new(Display::new(backend, clock.clone())?);

        let (audio, output) = match open_audio(clock) {
            Ok((audio, output)) => (Some(audio), Some(output)),
            Err(e) => {
                warn!("Presenting without sound: {}", e);
                (None, None)
            }
        };

        let presenter = AvPresenter::new(display, audio.clone(), self.config)?;
        if let Some(audio) = &audio {
            let channels = audio.config().output_channels;
            let rate = audio.config().sample_rate;
            let tone = SoundBuffer::sine(TONE_FREQUENCY, FLASH_DURATION, 0.5, channels, rate)?;
            presenter.set_sound_buffer(&tone)?;
        }

        let buffer = presenter.slide_buffer();
        for i in 0..FLASHES {
            buffer.add(Slide::new(
                format!("flash {}", i),
                SlideContent::draw(|target| {
                    target.clear(BLACK);
                    let (w, h) = target.size();
                    target.fill_rect(w / 2 - w / 8, h / 2 - w / 8, w / 4, w / 4, WHITE);
                }),
                SlideDuration::Time(FLASH_DURATION),
            ))?;
            buffer.add(Slide::new(
                format!("gap {}", i),
                SlideContent::draw(|target| target.clear(BLACK)),
                SlideDuration::Time(GAP_DURATION),
            ))?;
        }

        Ok(Session {
            presenter,
            _window: window,
            _output: output,
        })
    }
}

fn open_audio(clock: Arc<dyn Clock>) -> Result<(Arc<AudioStream>, CpalOutput), Box<dyn StdError>> {
    let config = CpalOutput::default_stream_config(256, 4)?;
    let audio = Arc::new(AudioStream::new(config, clock)?);
    let mut output = CpalOutput::new(audio.clone())?;
    output.play()?;
    Ok((audio, output))
}

impl ApplicationHandler for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.is_some() {
            return;
        }
        let mut session = match self.open(event_loop) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to set up the presentation: {}", e);
                event_loop.exit();
                return;
            }
        };
        if let Err(e) = session.presenter.start_playing() {
            error!("Failed to start the presentation: {}", e);
            event_loop.exit();
            return;
        }
        self.session = Some(session);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        if let WindowEvent::CloseRequested = event {
            if let Some(session) = self.session.as_mut() {
                session.presenter.stop_playing();
            }
            event_loop.exit();
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.presenter.update_playback() {
            Ok(true) => {}
            Ok(false) => {
                let errors = session.presenter.check_for_presentation_errors();
                if errors.total_errors() == 0 {
                    info!("Presentation finished without errors");
                } else {
                    warn!("Presentation finished with errors: {:?}", errors);
                }
                event_loop.exit();
            }
            Err(e) => {
                error!("Playback failed: {}", e);
                session.presenter.stop_playing();
                event_loop.exit();
            }
        }
    }
}

fn main() -> Result<(), Box<dyn StdError>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("avstim=info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PresenterConfig::load(path)?,
        None => PresenterConfig::default(),
    };
    info!("Presenter mode {}", config.mode);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = DemoApp { config, session: None };
    event_loop.run_app(&mut app)?;
    Ok(())
}
