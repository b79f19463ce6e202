//! Singularity Idle entry point
//!
//! Handles platform-specific initialization and runs the game loop.

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg(target_arch = "wasm32")]
mod wasm_game {
    use std::cell::RefCell;
    use std::rc::Rc;
    use wasm_bindgen::prelude::*;

    use singularity_idle::platform::{LocalStorage, SystemClock};
    use singularity_idle::{Game, Settings};

    /// HUD element ids and the store paths they mirror
    const HUD_FIELDS: [(&str, &str); 6] = [
        ("hud-energy", "resources.energy"),
        ("hud-data", "resources.data"),
        ("hud-heat", "heat.current"),
        ("hud-progress", "expansion.progress"),
        ("hud-risk", "timeline.paradoxRisk"),
        ("hud-temporal", "timeline.energy"),
    ];

    pub fn run() -> Result<(), JsValue> {
        console_error_panic_hook::set_once();
        console_log::init_with_level(log::Level::Info)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;

        log::info!("Singularity Idle starting...");

        let settings = match LocalStorage::open() {
            Ok(storage) => Settings::load(&storage),
            Err(e) => {
                log::warn!("Settings unavailable: {e}");
                Settings::default()
            }
        };
        let storage = LocalStorage::open().map_err(|e| JsValue::from_str(&e.to_string()))?;
        let mut game = Game::new(settings, Box::new(storage), Rc::new(SystemClock));

        if game.has_save() {
            match game.load() {
                Ok(report) => log::info!("Continuing save from version {}", report.from_version),
                Err(e) => log::warn!("Starting fresh, save unusable: {e}"),
            }
        }

        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| JsValue::from_str("no document"))?;
        if let Some(loading) = document.get_element_by_id("loading") {
            let _ = loading.set_attribute("class", "hidden");
        }

        game.start();
        let game = Rc::new(RefCell::new(game));
        setup_auto_pause(game.clone())?;
        request_animation_frame(game);

        log::info!("Singularity Idle running!");
        Ok(())
    }

    fn request_animation_frame(game: Rc<RefCell<Game>>) {
        let Some(window) = web_sys::window() else {
            return;
        };
        let closure = Closure::once(move |time: f64| {
            game_loop(game, time);
        });
        let _ = window.request_animation_frame(closure.as_ref().unchecked_ref());
        closure.forget();
    }

    fn game_loop(game: Rc<RefCell<Game>>, time: f64) {
        {
            let mut g = game.borrow_mut();
            g.frame(time);
            update_hud(&g);
        }

        request_animation_frame(game);
    }

    fn update_hud(game: &Game) {
        let Some(document) = web_sys::window().and_then(|w| w.document()) else {
            return;
        };
        for (id, path) in HUD_FIELDS {
            if let (Some(el), Some(value)) = (document.get_element_by_id(id), game.store().get_f64(path)) {
                el.set_text_content(Some(&format!("{value:.1}")));
            }
        }
        if let Some(el) = document.get_element_by_id("hud-scale") {
            el.set_text_content(game.store().get_str("expansion.scale"));
        }
    }

    fn setup_auto_pause(game: Rc<RefCell<Game>>) -> Result<(), JsValue> {
        let window = web_sys::window().ok_or_else(|| JsValue::from_str("no window"))?;
        let document = window
            .document()
            .ok_or_else(|| JsValue::from_str("no document"))?;

        // Visibility change (tab switch, minimize): pause and save on hide
        {
            let document_clone = document.clone();
            let closure = Closure::<dyn FnMut(_)>::new(move |_event: web_sys::Event| {
                let mut g = game.borrow_mut();
                if document_clone.visibility_state() == web_sys::VisibilityState::Hidden {
                    g.pause();
                    if let Err(e) = g.save() {
                        log::warn!("Save on hide failed: {e}");
                    }
                    log::info!("Auto-paused (tab hidden)");
                } else {
                    g.resume();
                }
            });
            document.add_event_listener_with_callback(
                "visibilitychange",
                closure.as_ref().unchecked_ref(),
            )?;
            closure.forget();
        }
        Ok(())
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn wasm_main() -> Result<(), JsValue> {
    wasm_game::run()
}

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::init();
    if let Err(e) = headless::run() {
        log::error!("Session failed: {e}");
        std::process::exit(1);
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {
    // WASM entry point is wasm_main, this is just to satisfy the compiler
}

/// Native mode: a headless session against save files on disk
#[cfg(not(target_arch = "wasm32"))]
mod headless {
    use std::error::Error;
    use std::rc::Rc;

    use singularity_idle::platform::{FileStorage, SystemClock};
    use singularity_idle::sim::Ability;
    use singularity_idle::{Game, Settings};

    /// Save directory override
    const SAVE_DIR_ENV: &str = "SINGULARITY_SAVE_DIR";
    const DEFAULT_SAVE_DIR: &str = "saves";
    /// Real time fed to the loop per iteration
    const CHUNK_MS: f64 = 100.0;

    pub fn run() -> Result<(), Box<dyn Error>> {
        let dir = std::env::var(SAVE_DIR_ENV).unwrap_or_else(|_| DEFAULT_SAVE_DIR.to_string());
        let seconds: f64 = match std::env::args().nth(1) {
            Some(arg) => arg.parse()?,
            None => 120.0,
        };

        let storage = FileStorage::new(&dir)?;
        let settings = Settings::load(&storage);
        settings.save(&storage);
        log::info!("Singularity Idle (native) starting, saves in {dir}");

        let mut game = Game::new(settings, Box::new(storage), Rc::new(SystemClock));
        if game.has_save() {
            let report = game.load()?;
            log::info!(
                "Loaded save (version {}, migrated: {})",
                report.from_version,
                report.migrated
            );
        }

        game.start();
        let chunks = (seconds * 1000.0 / CHUNK_MS).ceil() as u64;
        for chunk in 1..=chunks {
            game.advance(CHUNK_MS);

            // A scripted player: absorb every 10s, choose every 15s, stabilize when risky
            let elapsed_ms = chunk * CHUNK_MS as u64;
            if elapsed_ms % 10_000 == 0 {
                let target = format!("node-{}", elapsed_ms / 10_000);
                game.absorb(&target, 1.5)?;
            }
            if elapsed_ms % 15_000 == 0 {
                let delta = if (elapsed_ms / 15_000) % 2 == 0 { 5.0 } else { -5.0 };
                if let Err(e) = game.make_choice("crossroads", delta) {
                    log::warn!("Choice rejected: {e}");
                }
            }
            if game.timeline().paradox_risk() > 60.0 {
                if let Err(e) = game.use_ability(Ability::Stabilize) {
                    log::debug!("Could not stabilize: {e}");
                }
            }
        }
        game.stop();
        let bytes = game.save()?;

        let store = game.store();
        println!("\nSession summary ({seconds}s simulated, {} ticks)", game.game_loop().ticks());
        for path in [
            "resources.energy",
            "resources.data",
            "consciousness.level",
            "heat.current",
            "expansion.progress",
            "timeline.paradoxRisk",
            "timeline.collapses",
        ] {
            println!("  {path:<24} {:>10.2}", store.get_f64(path).unwrap_or(0.0));
        }
        println!("  {:<24} {:>10}", "expansion.scale", store.get_str("expansion.scale").unwrap_or("?"));
        println!("  {:<24} {:>10}", "timeline", game.timeline().timeline_id());
        println!("  saved {bytes} bytes");
        Ok(())
    }
}
