pub mod app_error;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod output;
pub mod params;
pub mod registry;
pub mod signals;
pub mod version;

pub use error::HubError;

pub fn run() -> i32 {
    logging::init();

    match cli::run_cli() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            err.code()
        }
    }
}
