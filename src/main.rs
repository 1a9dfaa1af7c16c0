mod agent;
mod args;
mod broker;
mod config;
mod entry;
mod error;
mod logger;
mod transport;
mod util;

use error::AppResult;

fn main() -> AppResult<()> {
    entry::run()
}
