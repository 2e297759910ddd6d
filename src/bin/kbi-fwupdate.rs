//! Flash a DFU firmware image onto a KBI module, grounded on
//! `examples/fwupdate.c`.

use std::fs;

use clap::Parser;
use kbi::{Command, CommandFunction, Session};
use tracing::{error, info};

/// Flash a firmware image onto a KiNOS module over its KBI serial link.
#[derive(Debug, Parser)]
struct Args {
    /// Serial device the module is attached to.
    #[arg(long)]
    port: String,

    /// Path to the DFU image file.
    #[arg(long)]
    file: String,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut session = match Session::init(&args.port) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open KBI device");
            std::process::exit(1);
        }
    };

    match session.cmd(CommandFunction::Read, Command::SoftwareVersion, &[]) {
        Ok(frame) => info!(version = ?frame.payload, "current firmware version"),
        Err(e) => error!(error = %e, "could not read current firmware version"),
    }

    let data = match fs::read(&args.file) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, path = %args.file, "failed to read DFU file");
            std::process::exit(1);
        }
    };

    info!(bytes = data.len(), "starting firmware update");
    if let Err(e) = session.firmware_update(&data) {
        error!(error = %e, "firmware update failed");
        std::process::exit(1);
    }

    info!("firmware update complete, module back online");
}
