mod app;
mod audio_engine;
mod audio_io;
mod client;
mod control;
mod event;
mod midi;
mod midi_file;
mod pedal;
mod project_io;
mod rpc;
mod sequencer;
mod settings;
mod terminal;

use env_logger::Env;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Client mode: build an RPC batch and send it to a running daemon.
    if args.first().map(String::as_str) == Some("client") {
        env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
        let settings = settings::load_settings();
        return client::run(&args[1..], settings.rpc_port, settings.ppb);
    }

    let mut enable_pedal = false;
    let mut quiet = false;
    for arg in &args {
        match arg.as_str() {
            "-p" | "--pedal" => enable_pedal = true,
            "-q" | "--quiet" => quiet = true,
            other => eprintln!("Unknown argument: {}", other),
        }
    }

    let default_filter = if quiet { "off" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    let settings = settings::load_settings();
    settings::save_settings(&settings);

    app::run(settings, enable_pedal)
}
