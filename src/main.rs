mod app;
mod archive;
mod catalog;
mod cli;
mod config;
mod courses;
mod duplicate;
mod error;
mod folder;
mod icons;
mod importer;
mod integrity;
mod logging;
mod materializer;
mod metadata;
mod progress;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
